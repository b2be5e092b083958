//! Single-flight background prefetching from a [`PageSource`]
//!
//! The prefetcher owns at most one outstanding fetch at a time. Fetches run
//! as jobs on a [`WorkerPool`]; a finished fetch appends its page to the
//! shared buffer and moves the state machine:
//!
//! ```text
//! Idle -> Fetching -> Idle        (non-empty page)
//!         Fetching -> Exhausted   (empty page, sticky)
//!         Fetching -> Failed      (source error or aborted job, sticky)
//! ```

use crate::{CollectorError, CollectorMetrics, PageSource, WorkerPool};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tracing::{debug, error, info};

/// Item buffer shared by the prefetcher (producer) and the queue (consumer).
pub type SharedBuffer<T> = Arc<Mutex<VecDeque<T>>>;

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Clone, PartialEq)]
pub enum FetchState {
    Idle,
    Fetching,
    Exhausted,
    Failed(CollectorError),
}

impl FetchState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, FetchState::Exhausted | FetchState::Failed(_))
    }
}

struct FetchProgress {
    state: FetchState,
    pages_fetched: usize,
    items_fetched: usize,
    fetch_started: Option<Instant>,
}

impl FetchProgress {
    fn new() -> Self {
        Self {
            state: FetchState::Idle,
            pages_fetched: 0,
            items_fetched: 0,
            fetch_started: None,
        }
    }
}

type SharedSource<T> = Arc<tokio::sync::Mutex<Box<dyn PageSource<T>>>>;

pub struct Prefetcher<T> {
    source: SharedSource<T>,
    buffer: SharedBuffer<T>,
    progress: Arc<Mutex<FetchProgress>>,
    in_flight: tokio::sync::Mutex<Option<oneshot::Receiver<()>>>,
    fetch_pool: Arc<WorkerPool>,
    low_water_mark: usize,
    metrics: Arc<CollectorMetrics>,
}

impl<T: Send + 'static> Prefetcher<T> {
    pub fn new(
        source: Box<dyn PageSource<T>>,
        buffer: SharedBuffer<T>,
        fetch_pool: Arc<WorkerPool>,
        low_water_mark: usize,
        metrics: Arc<CollectorMetrics>,
    ) -> Self {
        Self {
            source: Arc::new(tokio::sync::Mutex::new(source)),
            buffer,
            progress: Arc::new(Mutex::new(FetchProgress::new())),
            in_flight: tokio::sync::Mutex::new(None),
            fetch_pool,
            low_water_mark: low_water_mark.max(1),
            metrics,
        }
    }

    /// Requests the next page when `current_size` is below the low-water-mark,
    /// and waits for the outstanding fetch when `current_size` is zero.
    ///
    /// Concurrent calls are serialized; at most one fetch is ever in flight.
    /// Returns the sticky failure once the source has failed.
    pub async fn poll(&self, current_size: usize) -> Result<(), CollectorError> {
        let mut in_flight = self.in_flight.lock().await;

        match self.state() {
            FetchState::Exhausted => return Ok(()),
            FetchState::Failed(e) => return Err(e),
            _ => {}
        }

        if let Some(ticket) = in_flight.as_mut() {
            match ticket.try_recv() {
                Ok(()) => *in_flight = None,
                Err(oneshot::error::TryRecvError::Closed) => {
                    *in_flight = None;
                    self.mark_aborted();
                }
                Err(oneshot::error::TryRecvError::Empty) => {}
            }
        }

        if current_size < self.low_water_mark
            && in_flight.is_none()
            && self.state() == FetchState::Idle
        {
            *in_flight = Some(self.start_fetch().await?);
        }

        if current_size == 0 {
            // The ticket stays in place until it resolves so a cancelled wait
            // leaves it for the next caller.
            let finished = match in_flight.as_mut() {
                Some(ticket) => {
                    debug!("Buffer empty, waiting for in-flight fetch");
                    Some(ticket.await)
                }
                None => None,
            };
            if let Some(finished) = finished {
                *in_flight = None;
                if finished.is_err() {
                    self.mark_aborted();
                }
            }
        }

        match self.state() {
            FetchState::Failed(e) => Err(e),
            _ => Ok(()),
        }
    }

    async fn start_fetch(&self) -> Result<oneshot::Receiver<()>, CollectorError> {
        {
            let mut progress = lock(&self.progress);
            progress.state = FetchState::Fetching;
            progress.fetch_started = Some(Instant::now());
        }

        let (done_tx, done_rx) = oneshot::channel();
        let source = self.source.clone();
        let buffer = self.buffer.clone();
        let progress = self.progress.clone();
        let metrics = self.metrics.clone();

        let job = Box::pin(async move {
            let started = Instant::now();
            let outcome = {
                let mut source = source.lock().await;
                source.poll().await
            };
            let elapsed = started.elapsed();

            let mut progress = lock(&progress);
            progress.fetch_started = None;
            match outcome {
                Ok(page) if page.is_empty() => {
                    info!(
                        "Page source exhausted after {} pages ({} items)",
                        progress.pages_fetched, progress.items_fetched
                    );
                    progress.state = FetchState::Exhausted;
                }
                Ok(page) => {
                    let count = page.len();
                    let buffered = {
                        let mut buffer = lock(&buffer);
                        buffer.extend(page.into_items());
                        buffer.len()
                    };
                    progress.pages_fetched += 1;
                    progress.items_fetched += count;
                    progress.state = FetchState::Idle;
                    metrics.record_page(count, elapsed);
                    metrics.set_buffered(buffered);
                    debug!(
                        "Fetched page {} with {} items in {:?} ({} buffered)",
                        progress.pages_fetched, count, elapsed, buffered
                    );
                }
                Err(e) => {
                    error!("Page fetch failed after {:?}: {:#}", elapsed, e);
                    metrics.record_fetch_failure(elapsed);
                    progress.state = FetchState::Failed(CollectorError::FetchFailed(format!("{:#}", e)));
                }
            }
            drop(progress);

            let _ = done_tx.send(());
        });

        if let Err(e) = self.fetch_pool.submit(job).await {
            let mut progress = lock(&self.progress);
            progress.fetch_started = None;
            progress.state = FetchState::Failed(e.clone());
            return Err(e);
        }

        Ok(done_rx)
    }

    fn mark_aborted(&self) {
        let mut progress = lock(&self.progress);
        if progress.state == FetchState::Fetching {
            error!("Page fetch task terminated without reporting a result");
            progress.fetch_started = None;
            progress.state = FetchState::Failed(CollectorError::FetchAborted);
        }
    }

    pub fn state(&self) -> FetchState {
        lock(&self.progress).state.clone()
    }

    pub fn is_exhausted(&self) -> bool {
        self.state() == FetchState::Exhausted
    }

    pub fn low_water_mark(&self) -> usize {
        self.low_water_mark
    }

    pub fn fetch_pool(&self) -> &Arc<WorkerPool> {
        &self.fetch_pool
    }

    /// A cloneable view for health monitoring that outlives the queue.
    pub fn probe(&self) -> PrefetchProbe {
        let progress = self.progress.clone();
        let buffer = self.buffer.clone();
        PrefetchProbe {
            snapshot: Arc::new(move || {
                let buffered = lock(&buffer).len();
                let progress = lock(&progress);
                PrefetchSnapshot {
                    state: progress.state.clone(),
                    pages_fetched: progress.pages_fetched,
                    items_fetched: progress.items_fetched,
                    buffered,
                    fetching_for: progress.fetch_started.map(|started| started.elapsed()),
                }
            }),
        }
    }
}

/// Point-in-time view of a prefetcher.
#[derive(Debug, Clone, PartialEq)]
pub struct PrefetchSnapshot {
    pub state: FetchState,
    pub pages_fetched: usize,
    pub items_fetched: usize,
    pub buffered: usize,
    pub fetching_for: Option<Duration>,
}

#[derive(Clone)]
pub struct PrefetchProbe {
    snapshot: Arc<dyn Fn() -> PrefetchSnapshot + Send + Sync>,
}

impl PrefetchProbe {
    pub fn snapshot(&self) -> PrefetchSnapshot {
        (self.snapshot)()
    }
}
