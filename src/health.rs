use crate::{FetchState, PoolStats, PrefetchProbe, PrefetchSnapshot};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum HealthLevel {
    Healthy,
    Warning,
    Critical,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthStatus {
    pub overall: HealthLevel,
    pub source: HealthLevel,
    pub resources: HealthLevel,
    pub notes: Vec<String>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct HealthThresholds {
    /// A fetch running longer than this marks the source as stalled (default: 60 seconds)
    pub max_fetch_duration: Duration,

    /// A lease held longer than this is reported (default: 5 minutes)
    pub max_loan_duration: Duration,

    /// How often the monitor evaluates health (default: 30 seconds)
    pub check_interval: Duration,
}

impl Default for HealthThresholds {
    fn default() -> Self {
        Self {
            max_fetch_duration: Duration::from_secs(60),
            max_loan_duration: Duration::from_secs(300),
            check_interval: Duration::from_secs(30),
        }
    }
}

pub struct HealthChecker {
    thresholds: HealthThresholds,
}

impl HealthChecker {
    pub fn new(thresholds: HealthThresholds) -> Self {
        Self { thresholds }
    }

    pub fn check(
        &self,
        source: Option<&PrefetchSnapshot>,
        resources: Option<&PoolStats>,
    ) -> HealthStatus {
        let mut notes = Vec::new();

        let source_health = source
            .map(|snapshot| self.check_source(snapshot, &mut notes))
            .unwrap_or(HealthLevel::Healthy);
        let resource_health = resources
            .map(|stats| self.check_resources(stats, &mut notes))
            .unwrap_or(HealthLevel::Healthy);

        HealthStatus {
            overall: source_health.max(resource_health),
            source: source_health,
            resources: resource_health,
            notes,
            timestamp: Utc::now(),
        }
    }

    fn check_source(&self, snapshot: &PrefetchSnapshot, notes: &mut Vec<String>) -> HealthLevel {
        if let FetchState::Failed(e) = &snapshot.state {
            notes.push(format!("Source failed: {}", e));
            return HealthLevel::Critical;
        }

        if let Some(running) = snapshot.fetching_for {
            if running > self.thresholds.max_fetch_duration {
                notes.push(format!(
                    "Page fetch running for {:?} with {} items buffered",
                    running, snapshot.buffered
                ));
                return HealthLevel::Warning;
            }
        }

        HealthLevel::Healthy
    }

    fn check_resources(&self, stats: &PoolStats, notes: &mut Vec<String>) -> HealthLevel {
        let mut level = HealthLevel::Healthy;

        if !stats.is_closed && stats.on_loan >= stats.capacity {
            notes.push(format!("Resource pool saturated: {}/{} on loan", stats.on_loan, stats.capacity));
            level = HealthLevel::Warning;
        }

        if let Some(longest) = stats.longest_loan {
            if longest > self.thresholds.max_loan_duration {
                notes.push(format!("Lease held for {:?}", longest));
                level = HealthLevel::Warning;
            }
        }

        level
    }
}

/// Supplies pool statistics to the monitor without tying it to a resource type.
pub type PoolStatsProbe = Arc<dyn Fn() -> PoolStats + Send + Sync>;

/// Periodically evaluates health on a background task until stopped.
pub struct HealthMonitor {
    latest: watch::Receiver<Option<HealthStatus>>,
    stop: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl HealthMonitor {
    pub fn spawn(
        checker: HealthChecker,
        source: Option<PrefetchProbe>,
        resources: Option<PoolStatsProbe>,
        every: Duration,
    ) -> Self {
        let (status_tx, latest) = watch::channel(None);
        let (stop, mut stopped) = oneshot::channel::<()>();

        let task = tokio::spawn(async move {
            let mut timer = interval(every);
            info!("Health monitor started, checking every {:?}", every);

            loop {
                tokio::select! {
                    _ = &mut stopped => break,
                    _ = timer.tick() => {}
                }

                let snapshot = source.as_ref().map(|probe| probe.snapshot());
                let stats = resources.as_ref().map(|probe| probe());
                let status = checker.check(snapshot.as_ref(), stats.as_ref());

                match status.overall {
                    HealthLevel::Healthy => debug!("Collector health: OK"),
                    HealthLevel::Warning => {
                        warn!("Collector health: WARNING - {}", status.notes.join("; "))
                    }
                    HealthLevel::Critical => {
                        error!("Collector health: CRITICAL - {}", status.notes.join("; "))
                    }
                }

                let _ = status_tx.send(Some(status));
            }

            debug!("Health monitor stopped");
        });

        Self {
            latest,
            stop: Some(stop),
            task,
        }
    }

    /// Most recent evaluation, if one has run yet.
    pub fn latest(&self) -> Option<HealthStatus> {
        self.latest.borrow().clone()
    }

    pub async fn stop(mut self) -> Option<HealthStatus> {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Err(e) = (&mut self.task).await {
            warn!("Health monitor ended abnormally: {}", e);
        }
        self.latest()
    }
}

impl Drop for HealthMonitor {
    fn drop(&mut self) {
        if self.stop.is_some() {
            self.task.abort();
        }
    }
}
