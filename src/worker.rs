use crate::CollectorError;
use futures::future::BoxFuture;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// A unit of work accepted by a [`WorkerPool`].
pub type Job = BoxFuture<'static, ()>;

struct Worker {
    id: usize,
    pool_name: Arc<str>,
    counters: Arc<WorkerCounters>,
}

#[derive(Default)]
struct WorkerCounters {
    submitted: AtomicUsize,
    completed: AtomicUsize,
    panicked: AtomicUsize,
    active: AtomicUsize,
}

impl Worker {
    async fn run_with_shared_receiver(self, jobs: Arc<Mutex<mpsc::Receiver<Job>>>) {
        debug!("Starting {} worker {}", self.pool_name, self.id);

        loop {
            let job = {
                let mut receiver = jobs.lock().await;
                receiver.recv().await
            };

            match job {
                Some(job) => {
                    self.counters.active.fetch_add(1, Ordering::Relaxed);
                    let outcome = AssertUnwindSafe(job).catch_unwind().await;
                    self.counters.active.fetch_sub(1, Ordering::Relaxed);

                    if outcome.is_err() {
                        self.counters.panicked.fetch_add(1, Ordering::Relaxed);
                        error!("{} worker {} caught a panicking job", self.pool_name, self.id);
                    }
                    self.counters.completed.fetch_add(1, Ordering::Relaxed);
                }
                None => break,
            }
        }

        debug!("{} worker {} stopped", self.pool_name, self.id);
    }
}

/// Fixed-size pool of worker tasks pulling jobs from one shared channel.
///
/// Behaves like a fixed thread pool executor: `submit` enqueues, `shutdown`
/// stops accepting work while letting queued jobs finish, and
/// `await_termination` waits for every worker to drain. Panicking jobs are
/// caught so a worker never dies with them.
pub struct WorkerPool {
    name: Arc<str>,
    size: usize,
    sender: std::sync::Mutex<Option<mpsc::Sender<Job>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    counters: Arc<WorkerCounters>,
    is_shutdown: AtomicBool,
}

impl WorkerPool {
    /// Spawns `size` workers on the current tokio runtime.
    pub fn new(name: &str, size: usize, queue_capacity: usize) -> Result<Self, CollectorError> {
        if size == 0 {
            return Err(CollectorError::Configuration(format!(
                "Worker pool '{}' needs at least one worker",
                name
            )));
        }
        if queue_capacity == 0 {
            return Err(CollectorError::Configuration(format!(
                "Worker pool '{}' needs a queue capacity of at least one",
                name
            )));
        }

        let name: Arc<str> = Arc::from(name);
        let (sender, receiver) = mpsc::channel(queue_capacity);
        let shared_receiver = Arc::new(Mutex::new(receiver));
        let counters = Arc::new(WorkerCounters::default());

        let workers = (0..size)
            .map(|id| {
                let worker = Worker {
                    id,
                    pool_name: name.clone(),
                    counters: counters.clone(),
                };
                let rx = shared_receiver.clone();
                tokio::spawn(worker.run_with_shared_receiver(rx))
            })
            .collect();

        info!("Worker pool '{}' started with {} workers", name, size);

        Ok(Self {
            name,
            size,
            sender: std::sync::Mutex::new(Some(sender)),
            workers: Mutex::new(workers),
            counters,
            is_shutdown: AtomicBool::new(false),
        })
    }

    /// Enqueues a job, waiting while the channel is full.
    pub async fn submit(&self, job: Job) -> Result<(), CollectorError> {
        let sender = {
            let guard = self
                .sender
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            guard.clone()
        };

        let sender = sender.ok_or_else(|| CollectorError::WorkerPoolShutdown(self.name.to_string()))?;
        sender
            .send(job)
            .await
            .map_err(|_| CollectorError::WorkerPoolShutdown(self.name.to_string()))?;

        self.counters.submitted.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Stops accepting jobs; already queued jobs still run.
    pub fn shutdown(&self) {
        if self.is_shutdown.swap(true, Ordering::SeqCst) {
            return;
        }
        self.sender
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take();
        debug!("Worker pool '{}' stopped accepting jobs", self.name);
    }

    /// Waits, without bound, until every worker has drained the channel and exited.
    pub async fn await_termination(&self) {
        let handles: Vec<JoinHandle<()>> = self.workers.lock().await.drain(..).collect();
        for handle in handles {
            if let Err(e) = handle.await {
                warn!("Worker of pool '{}' ended abnormally: {}", self.name, e);
            }
        }
        info!(
            "Worker pool '{}' terminated after {} jobs",
            self.name,
            self.counters.completed.load(Ordering::Relaxed)
        );
    }

    pub async fn shutdown_and_wait(&self) {
        self.shutdown();
        self.await_termination().await;
    }

    pub fn is_shutdown(&self) -> bool {
        self.is_shutdown.load(Ordering::SeqCst)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn stats(&self) -> WorkerPoolStats {
        WorkerPoolStats {
            size: self.size,
            submitted: self.counters.submitted.load(Ordering::Relaxed),
            completed: self.counters.completed.load(Ordering::Relaxed),
            panicked: self.counters.panicked.load(Ordering::Relaxed),
            active: self.counters.active.load(Ordering::Relaxed),
        }
    }

    /// Runs `action` for every item on a temporary pool of `worker_count`
    /// workers and waits for all of them.
    pub async fn for_each_parallel<I, F, Fut>(
        items: I,
        worker_count: usize,
        action: F,
    ) -> Result<WorkerPoolStats, CollectorError>
    where
        I: IntoIterator,
        I::Item: Send + 'static,
        F: Fn(I::Item) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let mut items = items.into_iter().peekable();
        if items.peek().is_none() {
            return Ok(WorkerPoolStats {
                size: worker_count,
                ..Default::default()
            });
        }

        let pool = WorkerPool::new("parallel", worker_count, worker_count.max(1) * 2)?;
        let action = Arc::new(action);

        for item in items {
            let action = action.clone();
            pool.submit(Box::pin(async move { action(item).await })).await?;
        }

        pool.shutdown_and_wait().await;
        Ok(pool.stats())
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkerPoolStats {
    pub size: usize,
    pub submitted: usize,
    pub completed: usize,
    pub panicked: usize,
    pub active: usize,
}
