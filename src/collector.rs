//! Composition of the engine for one collection run
//!
//! A [`Collector`] owns the run's pool of browser sessions. Each
//! [`Collector::collect`] pass streams a page source through a fresh
//! [`StreamingQueue`] and hands every item to the handler together with a
//! leased session, which goes back to the pool when the handler finishes.

use crate::health::PoolStatsProbe;
use crate::{
    CollectorError, CollectorMetrics, Config, ForEachReport, HealthChecker, HealthMonitor, Lease,
    PageSource, PoolCloseReport, ResourcePool, StreamingQueue,
};
use futures::future::BoxFuture;
use std::future::Future;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

pub struct Collector<R: Send + 'static> {
    run_id: Uuid,
    config: Config,
    resources: ResourcePool<R>,
    metrics: Arc<CollectorMetrics>,
}

impl<R: Send + 'static> Collector<R> {
    pub fn new<F, D>(config: Config, factory: F, destroyer: D) -> Result<Self, CollectorError>
    where
        F: Fn() -> BoxFuture<'static, anyhow::Result<R>> + Send + Sync + 'static,
        D: Fn(R) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync + 'static,
    {
        Self::with_metrics(config, factory, destroyer, Arc::new(CollectorMetrics::new()))
    }

    pub fn with_metrics<F, D>(
        config: Config,
        factory: F,
        destroyer: D,
        metrics: Arc<CollectorMetrics>,
    ) -> Result<Self, CollectorError>
    where
        F: Fn() -> BoxFuture<'static, anyhow::Result<R>> + Send + Sync + 'static,
        D: Fn(R) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync + 'static,
    {
        config.validate()?;

        let run_id = Uuid::new_v4();
        let resources = ResourcePool::with_metrics(
            "sessions",
            config.resource_pool.capacity,
            factory,
            destroyer,
            metrics.clone(),
        )?;

        info!(
            "Collection run {} ready: {} sessions, {} handler workers",
            run_id, config.resource_pool.capacity, config.queue.worker_pool_size
        );

        Ok(Self {
            run_id,
            config,
            resources,
            metrics,
        })
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn resources(&self) -> &ResourcePool<R> {
        &self.resources
    }

    /// Streams `source` through a new queue, calling `handler` with each item
    /// and a leased resource.
    ///
    /// Items whose lease cannot be obtained count as failed handlers. A
    /// health monitor watches the pass until it finishes.
    pub async fn collect<T, S, F, Fut>(
        &self,
        label: &str,
        source: S,
        handler: F,
    ) -> Result<ForEachReport, CollectorError>
    where
        T: Send + 'static,
        S: PageSource<T> + 'static,
        F: Fn(T, Lease<R>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        info!("Run {}: starting '{}'", self.run_id, label);

        let queue = StreamingQueue::from_config(&self.config.queue, source, self.metrics.clone())?;

        let stats_pool = self.resources.clone();
        let pool_stats: PoolStatsProbe = Arc::new(move || stats_pool.stats());
        let monitor = HealthMonitor::spawn(
            HealthChecker::new(self.config.health.clone()),
            Some(queue.probe()),
            Some(pool_stats),
            self.config.health.check_interval,
        );

        let pool = self.resources.clone();
        let handler = Arc::new(handler);
        let outcome = queue
            .for_each(move |item| {
                let pool = pool.clone();
                let handler = handler.clone();
                async move {
                    let lease = pool.borrow().await?;
                    handler(item, lease).await
                }
            })
            .await;

        monitor.stop().await;

        match &outcome {
            Ok(report) => info!(
                "Run {}: '{}' finished, {} items ({} failed)",
                self.run_id, label, report.dispatched, report.failed
            ),
            Err(e) => warn!("Run {}: '{}' aborted: {}", self.run_id, label, e),
        }
        outcome
    }

    /// Closes the resource pool, waiting the configured grace period for outstanding leases.
    pub async fn shutdown(&self) -> PoolCloseReport {
        let report = self
            .resources
            .close(self.config.resource_pool.close_grace_period)
            .await;
        if report.leaked > 0 {
            warn!("Run {}: {} sessions were still leased at shutdown", self.run_id, report.leaked);
        }
        info!("Run {} shut down", self.run_id);
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ActionPageSource;
    use futures::FutureExt;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    fn small_config() -> Config {
        let mut config = Config::default();
        config.queue.page_size_hint = 2;
        config.queue.worker_pool_size = 3;
        config.resource_pool.capacity = 2;
        config.resource_pool.close_grace_period = Duration::from_secs(1);
        config
    }

    fn counting_collector(config: Config, destroyed: Arc<AtomicUsize>) -> Collector<usize> {
        let created = Arc::new(AtomicUsize::new(0));
        Collector::new(
            config,
            move || {
                let id = created.fetch_add(1, Ordering::SeqCst);
                async move { Ok(id) }.boxed()
            },
            move |_| {
                let destroyed = destroyed.clone();
                async move {
                    destroyed.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
                .boxed()
            },
        )
        .unwrap()
    }

    #[tokio::test]
    async fn collect_leases_a_session_per_item() {
        let destroyed = Arc::new(AtomicUsize::new(0));
        let collector = counting_collector(small_config(), destroyed.clone());

        let mut pages: VecDeque<Vec<u32>> = VecDeque::from(vec![vec![1, 2], vec![3, 4], vec![5]]);
        let source = ActionPageSource::new(move || {
            let page = pages.pop_front().unwrap_or_default();
            async move { Ok(page) }
        });

        let in_use = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let (in_use_h, peak_h, seen_h) = (in_use.clone(), peak.clone(), seen.clone());

        let report = collector
            .collect("bills", source, move |item, session| {
                let (in_use, peak, seen) = (in_use_h.clone(), peak_h.clone(), seen_h.clone());
                async move {
                    let now = in_use.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    seen.lock().unwrap().push((item, *session));
                    in_use.fetch_sub(1, Ordering::SeqCst);
                    Ok(())
                }
            })
            .await
            .unwrap();

        assert_eq!(report.dispatched, 5);
        assert_eq!(report.failed, 0);
        assert!(peak.load(Ordering::SeqCst) <= 2);
        assert!(seen.lock().unwrap().iter().all(|(_, session)| *session < 2));

        let close = collector.shutdown().await;
        assert_eq!(close.created, close.destroyed);
        assert_eq!(destroyed.load(Ordering::SeqCst), close.created);
    }

    #[tokio::test]
    async fn items_fail_once_the_pool_is_closed() {
        let collector = counting_collector(small_config(), Arc::new(AtomicUsize::new(0)));
        collector.shutdown().await;

        let mut pages = VecDeque::from(vec![vec!["a", "b"]]);
        let source = ActionPageSource::new(move || {
            let page = pages.pop_front().unwrap_or_default();
            async move { Ok(page) }
        });

        let report = collector
            .collect("laws", source, |_, _| async { Ok(()) })
            .await
            .unwrap();
        assert_eq!(report.dispatched, 2);
        assert_eq!(report.failed, 2);
    }

    #[test]
    fn invalid_config_is_rejected() {
        let mut config = Config::default();
        config.resource_pool.capacity = 0;

        let result: Result<Collector<u8>, _> = Collector::new(
            config,
            || async { Ok(0) }.boxed(),
            |_| async { Ok(()) }.boxed(),
        );
        assert!(matches!(result, Err(CollectorError::Configuration(_))));
    }
}
