use thiserror::Error;
use tokio::sync::AcquireError;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum CollectorError {
    #[error("Page fetch failed: {0}")]
    FetchFailed(String),

    #[error("Page fetch task terminated before reporting a result")]
    FetchAborted,

    #[error("Item handler failed: {0}")]
    HandlerFailed(String),

    #[error("Resource factory failed: {0}")]
    FactoryFailed(String),

    #[error("Resource pool is closed")]
    PoolClosed,

    #[error("Lease belongs to a different resource pool")]
    ForeignLease,

    #[error("Slot {0} is not on loan")]
    InvalidReturn(usize),

    #[error("Worker pool shut down: {0}")]
    WorkerPoolShutdown(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("IO error: {0}")]
    Io(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl CollectorError {
    /// Whether a streaming queue that hit this error can still make progress.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            CollectorError::FetchFailed(_)
                | CollectorError::FetchAborted
                | CollectorError::PoolClosed
                | CollectorError::WorkerPoolShutdown(_)
        )
    }

    pub fn severity(&self) -> ErrorSeverity {
        match self {
            CollectorError::HandlerFailed(_) => ErrorSeverity::Low,
            CollectorError::FetchFailed(_) | CollectorError::FactoryFailed(_) => {
                ErrorSeverity::Medium
            }
            CollectorError::Configuration(_) | CollectorError::PoolClosed => ErrorSeverity::High,
            CollectorError::ForeignLease | CollectorError::InvalidReturn(_) => {
                ErrorSeverity::Critical
            }
            _ => ErrorSeverity::Medium,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorSeverity {
    Low,
    Medium,
    High,
    Critical,
}

impl From<AcquireError> for CollectorError {
    fn from(_: AcquireError) -> Self {
        CollectorError::PoolClosed
    }
}

impl From<std::io::Error> for CollectorError {
    fn from(err: std::io::Error) -> Self {
        CollectorError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for CollectorError {
    fn from(err: serde_json::Error) -> Self {
        CollectorError::Serialization(err.to_string())
    }
}
