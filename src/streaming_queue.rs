//! Pull-based, lazily filled queue over a [`PageSource`]
//!
//! The queue is single-consumer: every consuming operation takes `&mut self`
//! or `self`, so concurrent iteration over one instance cannot be expressed.
//! Pages are requested in the background by a [`Prefetcher`] as the buffer
//! drains, and [`StreamingQueue::for_each`] fans the items out to a
//! [`WorkerPool`].

use crate::prefetcher::lock;
use crate::{
    CollectorError, CollectorMetrics, FetchState, PageSource, PrefetchProbe, Prefetcher,
    QueueConfig, SharedBuffer, WorkerPool,
};
use chrono::{DateTime, Utc};
use futures::Stream;
use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{error, info, warn};

/// Capacity of the dedicated fetch pool's channel; only one fetch is ever queued.
const FETCH_QUEUE_CAPACITY: usize = 1;

pub struct StreamingQueue<T> {
    buffer: SharedBuffer<T>,
    prefetcher: Prefetcher<T>,
    worker_pool: Arc<WorkerPool>,
    metrics: Arc<CollectorMetrics>,
}

impl<T: Send + 'static> StreamingQueue<T> {
    /// Builds a queue whose page fetches run on a dedicated single-worker pool,
    /// leaving all of `worker_pool` to item handlers.
    pub fn new<S>(
        worker_pool: Arc<WorkerPool>,
        page_size_hint: usize,
        source: S,
    ) -> Result<Self, CollectorError>
    where
        S: PageSource<T> + 'static,
    {
        let fetch_pool = Arc::new(WorkerPool::new("fetch", 1, FETCH_QUEUE_CAPACITY)?);
        Ok(Self::assemble(
            worker_pool,
            fetch_pool,
            page_size_hint,
            Box::new(source),
            Arc::new(CollectorMetrics::new()),
        ))
    }

    /// Builds a queue whose page fetches share `worker_pool` with the item
    /// handlers. The pool's budget then covers the single in-flight fetch plus
    /// up to `size - 1` concurrent handlers.
    pub fn shared<S>(worker_pool: Arc<WorkerPool>, page_size_hint: usize, source: S) -> Self
    where
        S: PageSource<T> + 'static,
    {
        Self::assemble(
            worker_pool.clone(),
            worker_pool,
            page_size_hint,
            Box::new(source),
            Arc::new(CollectorMetrics::new()),
        )
    }

    /// Builds the worker pools described by `config` and a queue over `source`.
    pub fn from_config<S>(
        config: &QueueConfig,
        source: S,
        metrics: Arc<CollectorMetrics>,
    ) -> Result<Self, CollectorError>
    where
        S: PageSource<T> + 'static,
    {
        let worker_pool = Arc::new(WorkerPool::new(
            "handlers",
            config.worker_pool_size,
            config.dispatch_queue_capacity,
        )?);
        let fetch_pool = if config.share_worker_pool {
            worker_pool.clone()
        } else {
            Arc::new(WorkerPool::new("fetch", 1, FETCH_QUEUE_CAPACITY)?)
        };

        Ok(Self::assemble(
            worker_pool,
            fetch_pool,
            config.effective_low_water_mark(),
            Box::new(source),
            metrics,
        ))
    }

    fn assemble(
        worker_pool: Arc<WorkerPool>,
        fetch_pool: Arc<WorkerPool>,
        low_water_mark: usize,
        source: Box<dyn PageSource<T>>,
        metrics: Arc<CollectorMetrics>,
    ) -> Self {
        let buffer: SharedBuffer<T> = Arc::new(Mutex::new(VecDeque::new()));
        let prefetcher = Prefetcher::new(
            source,
            buffer.clone(),
            fetch_pool,
            low_water_mark,
            metrics.clone(),
        );

        Self {
            buffer,
            prefetcher,
            worker_pool,
            metrics,
        }
    }

    /// Drives prefetching for the current buffer length, then reports it.
    pub async fn size(&mut self) -> Result<usize, CollectorError> {
        let current = self.buffered();
        self.prefetcher.poll(current).await?;
        Ok(self.buffered())
    }

    /// Buffered item count without triggering any fetch.
    pub fn buffered(&self) -> usize {
        lock(&self.buffer).len()
    }

    /// Removes the next item, waiting for a fetch when the buffer is empty.
    ///
    /// Returns `Ok(None)` once the buffer is empty and the source is exhausted.
    /// Items fetched before a source failure are delivered before the failure.
    pub async fn poll(&mut self) -> Result<Option<T>, CollectorError> {
        loop {
            let progress = self.size().await;

            if let Some(item) = lock(&self.buffer).pop_front() {
                return Ok(Some(item));
            }

            progress?;
            match self.prefetcher.state() {
                FetchState::Exhausted => return Ok(None),
                FetchState::Failed(e) => return Err(e),
                _ => {}
            }
        }
    }

    pub fn is_exhausted(&self) -> bool {
        self.prefetcher.is_exhausted() && self.buffered() == 0
    }

    pub fn probe(&self) -> PrefetchProbe {
        self.prefetcher.probe()
    }

    /// Consumes the queue into a lazy stream of items.
    ///
    /// The stream ends once the source is exhausted; a source failure is
    /// yielded once as an `Err` and ends the stream.
    pub fn into_stream(self) -> impl Stream<Item = Result<T, CollectorError>> {
        futures::stream::unfold(Some(self), |state| async move {
            let mut queue = state?;
            match queue.poll().await {
                Ok(Some(item)) => Some((Ok(item), Some(queue))),
                Ok(None) => None,
                Err(e) => Some((Err(e), None)),
            }
        })
    }

    /// Dispatches every item to `handler` on the worker pool and waits for all
    /// of them.
    ///
    /// Items are submitted in page order; handlers run concurrently and may
    /// finish in any order. A handler error or panic is logged and counted
    /// but never stops the drain. A source failure stops the drain; handlers
    /// already submitted still run to completion before the error is returned.
    pub async fn for_each<F, Fut>(mut self, handler: F) -> Result<ForEachReport, CollectorError>
    where
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let started_at = Utc::now();
        let handler = Arc::new(handler);
        let succeeded = Arc::new(AtomicUsize::new(0));
        let mut dispatched = 0usize;

        let drained = loop {
            let item = match self.poll().await {
                Ok(Some(item)) => item,
                Ok(None) => break Ok(()),
                Err(e) => break Err(e),
            };

            let sequence = dispatched;
            dispatched += 1;
            self.metrics.record_dispatch();

            let handler = handler.clone();
            let succeeded = succeeded.clone();
            let metrics = self.metrics.clone();
            let job = Box::pin(async move {
                match handler(item).await {
                    Ok(()) => {
                        succeeded.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(e) => {
                        metrics.record_handler_failure();
                        let failure = CollectorError::HandlerFailed(format!("{:#}", e));
                        error!("Item #{}: {}", sequence, failure);
                    }
                }
            });

            if let Err(e) = self.worker_pool.submit(job).await {
                break Err(e);
            }
        };

        self.worker_pool.shutdown_and_wait().await;
        let fetch_pool = self.prefetcher.fetch_pool().clone();
        if !Arc::ptr_eq(&fetch_pool, &self.worker_pool) {
            fetch_pool.shutdown_and_wait().await;
        }

        let succeeded = succeeded.load(Ordering::Relaxed);
        let report = ForEachReport {
            dispatched,
            succeeded,
            failed: dispatched - succeeded,
            started_at,
            finished_at: Utc::now(),
        };

        match drained {
            Ok(()) => {
                info!(
                    "Drained {} items ({} failed) in {:?}",
                    report.dispatched,
                    report.failed,
                    report.elapsed()
                );
                Ok(report)
            }
            Err(e) => {
                warn!(
                    "Drain stopped after {} items ({} failed): {}",
                    report.dispatched, report.failed, e
                );
                Err(e)
            }
        }
    }
}

/// Outcome of a [`StreamingQueue::for_each`] run.
#[derive(Debug, Clone)]
pub struct ForEachReport {
    pub dispatched: usize,
    pub succeeded: usize,
    /// Handlers that returned an error or panicked.
    pub failed: usize,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl ForEachReport {
    pub fn elapsed(&self) -> Duration {
        (self.finished_at - self.started_at)
            .to_std()
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ActionPageSource, Page};
    use async_trait::async_trait;
    use futures::StreamExt;

    struct ScriptedSource {
        pages: VecDeque<anyhow::Result<Vec<u32>>>,
    }

    impl ScriptedSource {
        fn pages(pages: Vec<Vec<u32>>) -> Self {
            let mut pages: VecDeque<_> = pages.into_iter().map(Ok).collect();
            pages.push_back(Ok(Vec::new()));
            Self { pages }
        }

        fn failing_after(pages: Vec<Vec<u32>>, message: &'static str) -> Self {
            let mut pages: VecDeque<_> = pages.into_iter().map(Ok).collect();
            pages.push_back(Err(anyhow::anyhow!(message)));
            Self { pages }
        }
    }

    #[async_trait]
    impl PageSource<u32> for ScriptedSource {
        async fn poll(&mut self) -> anyhow::Result<Page<u32>> {
            tokio::task::yield_now().await;
            match self.pages.pop_front() {
                Some(page) => page.map(Page::new),
                None => panic!("polled after exhaustion"),
            }
        }
    }

    fn handlers(size: usize) -> Arc<WorkerPool> {
        Arc::new(WorkerPool::new("handlers", size, 16).unwrap())
    }

    #[tokio::test]
    async fn for_each_handles_every_item_exactly_once() {
        let queue = StreamingQueue::new(
            handlers(4),
            3,
            ScriptedSource::pages(vec![vec![1, 2, 3], vec![4, 5, 6], vec![7]]),
        )
        .unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();

        let report = queue
            .for_each(move |item| {
                let sink = sink.clone();
                async move {
                    tokio::time::sleep(Duration::from_millis(u64::from(8 - item))).await;
                    sink.lock().unwrap().push(item);
                    Ok(())
                }
            })
            .await
            .unwrap();

        let mut seen = seen.lock().unwrap().clone();
        seen.sort();
        assert_eq!(seen, vec![1, 2, 3, 4, 5, 6, 7]);
        assert_eq!(report.dispatched, 7);
        assert_eq!(report.succeeded, 7);
        assert_eq!(report.failed, 0);
    }

    #[tokio::test]
    async fn empty_first_page_finishes_without_calls() {
        let queue = StreamingQueue::new(handlers(2), 5, ScriptedSource::pages(vec![])).unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();

        let report = queue
            .for_each(move |_item| {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Ok(()) }
            })
            .await
            .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(report.dispatched, 0);
    }

    #[tokio::test]
    async fn items_are_dispatched_in_page_order() {
        // One handler worker pulls jobs in submission order.
        let queue = StreamingQueue::new(
            handlers(1),
            2,
            ScriptedSource::pages(vec![vec![1, 2], vec![3, 4], vec![5]]),
        )
        .unwrap();
        let order = Arc::new(Mutex::new(Vec::new()));
        let sink = order.clone();

        queue
            .for_each(move |item| {
                sink.lock().unwrap().push(item);
                async { Ok(()) }
            })
            .await
            .unwrap();

        assert_eq!(*order.lock().unwrap(), vec![1, 2, 3, 4, 5]);
    }

    #[tokio::test]
    async fn handler_failures_do_not_stop_the_drain() {
        let queue = StreamingQueue::new(
            handlers(2),
            2,
            ScriptedSource::pages(vec![vec![1, 2], vec![3, 4]]),
        )
        .unwrap();

        let report = queue
            .for_each(|item| async move {
                match item {
                    2 => anyhow::bail!("unparseable bill {}", item),
                    3 => panic!("parser bug"),
                    _ => Ok(()),
                }
            })
            .await
            .unwrap();

        assert_eq!(report.dispatched, 4);
        assert_eq!(report.succeeded, 2);
        assert_eq!(report.failed, 2);
    }

    #[tokio::test]
    async fn fetch_failure_surfaces_after_buffered_items_are_handled() {
        let queue = StreamingQueue::new(
            handlers(2),
            2,
            ScriptedSource::failing_after(vec![vec![1, 2]], "session expired"),
        )
        .unwrap();
        let handled = Arc::new(AtomicUsize::new(0));
        let counter = handled.clone();

        let err = queue
            .for_each(move |_item| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            })
            .await
            .unwrap_err();

        assert!(matches!(err, CollectorError::FetchFailed(ref msg) if msg.contains("session expired")));
        assert_eq!(handled.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn poll_and_size_drive_prefetching() {
        let mut queue = StreamingQueue::new(
            handlers(1),
            2,
            ScriptedSource::pages(vec![vec![10, 11], vec![12]]),
        )
        .unwrap();

        assert_eq!(queue.buffered(), 0);
        assert_eq!(queue.size().await.unwrap(), 2);
        assert_eq!(queue.poll().await.unwrap(), Some(10));
        assert_eq!(queue.poll().await.unwrap(), Some(11));
        assert_eq!(queue.poll().await.unwrap(), Some(12));
        assert_eq!(queue.poll().await.unwrap(), None);
        assert_eq!(queue.poll().await.unwrap(), None);
        assert!(queue.is_exhausted());
    }

    #[tokio::test]
    async fn stream_yields_items_then_ends() {
        let mut batches = VecDeque::from(vec![vec!["a", "b"], vec!["c"], vec![]]);
        let source = ActionPageSource::new(move || {
            let batch = batches.pop_front().unwrap_or_default();
            async move { Ok(batch) }
        });
        let queue = StreamingQueue::new(handlers(1), 2, source).unwrap();

        let items: Vec<_> = queue.into_stream().collect().await;
        let items: Vec<&str> = items.into_iter().map(Result::unwrap).collect();
        assert_eq!(items, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn stream_ends_after_yielding_the_failure() {
        let queue = StreamingQueue::new(
            handlers(1),
            1,
            ScriptedSource::failing_after(vec![vec![1]], "timeout"),
        )
        .unwrap();

        let items: Vec<_> = queue.into_stream().collect().await;
        assert_eq!(items.len(), 2);
        assert_eq!(items[0], Ok(1));
        assert!(matches!(items[1], Err(CollectorError::FetchFailed(_))));
    }

    #[tokio::test]
    async fn shared_pool_runs_fetches_and_handlers() {
        let pool = handlers(3);
        let queue = StreamingQueue::shared(
            pool.clone(),
            2,
            ScriptedSource::pages(vec![vec![1, 2], vec![3, 4], vec![5, 6]]),
        );
        let total = Arc::new(AtomicUsize::new(0));
        let sum = total.clone();

        let report = queue
            .for_each(move |item| {
                sum.fetch_add(item as usize, Ordering::SeqCst);
                async { Ok(()) }
            })
            .await
            .unwrap();

        assert_eq!(report.dispatched, 6);
        assert_eq!(total.load(Ordering::SeqCst), 21);
        // Four fetches (three pages and the empty one) plus six handlers.
        assert_eq!(pool.stats().completed, 10);
        assert!(pool.is_shutdown());
    }

    #[tokio::test]
    async fn from_config_honours_low_water_mark() {
        let config = QueueConfig {
            page_size_hint: 4,
            low_water_mark: Some(1),
            worker_pool_size: 2,
            ..Default::default()
        };
        let queue = StreamingQueue::from_config(
            &config,
            ScriptedSource::pages(vec![vec![1, 2, 3]]),
            Arc::new(CollectorMetrics::new()),
        )
        .unwrap();

        assert_eq!(queue.prefetcher.low_water_mark(), 1);
        let report = queue.for_each(|_| async { Ok(()) }).await.unwrap();
        assert_eq!(report.dispatched, 3);
    }
}
