//! Bounded pool of expensive, non-thread-safe resources
//!
//! The pool lends out browser sessions (or any other costly handle) to worker
//! tasks. At most `capacity` resources are alive at once; borrowers beyond
//! that wait in FIFO order. Each borrow yields a [`Lease`], an ownership token
//! naming the arena slot the resource belongs to. Returning a lease consumes
//! it, so a resource can never be returned twice.

use crate::prefetcher::lock;
use crate::{CollectorError, CollectorMetrics};
use dashmap::DashMap;
use futures::future::BoxFuture;
use std::collections::VecDeque;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{Notify, Semaphore};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

pub type ResourceFactory<R> = Box<dyn Fn() -> BoxFuture<'static, anyhow::Result<R>> + Send + Sync>;
pub type ResourceDestroyer<R> = Box<dyn Fn(R) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotState {
    Idle,
    OnLoan,
    Destroyed,
}

struct SlotTable<R> {
    states: Vec<SlotState>,
    idle: VecDeque<(usize, R)>,
    /// Returned after close started; waiting to be destroyed.
    retired: Vec<(usize, R)>,
}

impl<R> SlotTable<R> {
    fn count(&self, state: SlotState) -> usize {
        self.states.iter().filter(|s| **s == state).count()
    }
}

struct PoolInner<R> {
    id: Uuid,
    name: String,
    capacity: usize,
    factory: ResourceFactory<R>,
    destroyer: ResourceDestroyer<R>,
    permits: Semaphore,
    slots: Mutex<SlotTable<R>>,
    loans: DashMap<usize, Instant>,
    returned: Notify,
    is_closed: AtomicBool,
    close_finished: AtomicBool,
    /// Factory calls still running; `close` waits for them like leases.
    creating: AtomicUsize,
    created: AtomicUsize,
    destroyed: AtomicUsize,
    metrics: Arc<CollectorMetrics>,
}

impl<R: Send + 'static> PoolInner<R> {
    fn take_back(self: &Arc<Self>, slot: usize, resource: R) -> Result<(), CollectorError> {
        let held_for = self
            .loans
            .remove(&slot)
            .map(|(_, since)| since.elapsed())
            .unwrap_or_default();

        let mut table = lock(&self.slots);
        if table.states.get(slot) != Some(&SlotState::OnLoan) {
            drop(table);
            error!("Pool '{}': slot {} returned while not on loan", self.name, slot);
            self.spawn_destroy(resource);
            return Err(CollectorError::InvalidReturn(slot));
        }
        self.metrics.record_lease_returned(held_for);

        if self.is_closed.load(Ordering::SeqCst) {
            table.states[slot] = SlotState::Destroyed;
            if self.close_finished.load(Ordering::SeqCst) {
                drop(table);
                debug!("Pool '{}': slot {} returned after close, destroying", self.name, slot);
                self.spawn_destroy(resource);
            } else {
                table.retired.push((slot, resource));
                drop(table);
                self.returned.notify_one();
            }
            return Ok(());
        }

        table.states[slot] = SlotState::Idle;
        table.idle.push_back((slot, resource));
        drop(table);
        self.permits.add_permits(1);
        debug!("Pool '{}': slot {} returned after {:?}", self.name, slot, held_for);
        Ok(())
    }

    async fn destroy(&self, resource: R) {
        if let Err(e) = (self.destroyer)(resource).await {
            warn!("Pool '{}': destroying a resource failed: {:#}", self.name, e);
        }
        self.destroyed.fetch_add(1, Ordering::SeqCst);
        self.metrics.record_resource_destroyed();
    }

    fn spawn_destroy(self: &Arc<Self>, resource: R) {
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let inner = self.clone();
                handle.spawn(async move { inner.destroy(resource).await });
            }
            Err(_) => {
                error!(
                    "Pool '{}': no runtime available to destroy a returned resource, leaking it",
                    self.name
                );
            }
        }
    }
}

/// Marks a factory call in progress for the lifetime of the guard.
struct Creating<'a, R> {
    inner: &'a PoolInner<R>,
}

impl<'a, R> Creating<'a, R> {
    fn start(inner: &'a PoolInner<R>) -> Self {
        inner.creating.fetch_add(1, Ordering::SeqCst);
        Self { inner }
    }
}

impl<R> Drop for Creating<'_, R> {
    fn drop(&mut self) {
        self.inner.creating.fetch_sub(1, Ordering::SeqCst);
        self.inner.returned.notify_one();
    }
}

/// Retires an invalidated slot when dropped, then gives its capacity back
/// to an open pool or wakes a pending `close`.
struct ReleaseSlot<'a, R> {
    inner: &'a PoolInner<R>,
    slot: usize,
}

impl<R> Drop for ReleaseSlot<'_, R> {
    fn drop(&mut self) {
        lock(&self.inner.slots).states[self.slot] = SlotState::Destroyed;
        if self.inner.is_closed.load(Ordering::SeqCst) {
            self.inner.returned.notify_one();
        } else {
            self.inner.permits.add_permits(1);
        }
    }
}

/// Bounded pool handing out [`Lease`]s; cloning yields another handle to the same pool.
pub struct ResourcePool<R: Send + 'static> {
    inner: Arc<PoolInner<R>>,
}

impl<R: Send + 'static> Clone for ResourcePool<R> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<R: Send + 'static> ResourcePool<R> {
    /// Creates an empty pool; resources are created lazily on borrow.
    pub fn new<F, D>(
        name: &str,
        capacity: usize,
        factory: F,
        destroyer: D,
    ) -> Result<Self, CollectorError>
    where
        F: Fn() -> BoxFuture<'static, anyhow::Result<R>> + Send + Sync + 'static,
        D: Fn(R) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync + 'static,
    {
        Self::with_metrics(name, capacity, factory, destroyer, Arc::new(CollectorMetrics::new()))
    }

    pub fn with_metrics<F, D>(
        name: &str,
        capacity: usize,
        factory: F,
        destroyer: D,
        metrics: Arc<CollectorMetrics>,
    ) -> Result<Self, CollectorError>
    where
        F: Fn() -> BoxFuture<'static, anyhow::Result<R>> + Send + Sync + 'static,
        D: Fn(R) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync + 'static,
    {
        if capacity == 0 {
            return Err(CollectorError::Configuration(format!(
                "Resource pool '{}' needs a capacity of at least one",
                name
            )));
        }

        info!("Resource pool '{}' created with capacity {}", name, capacity);

        Ok(Self {
            inner: Arc::new(PoolInner {
                id: Uuid::new_v4(),
                name: name.to_string(),
                capacity,
                factory: Box::new(factory),
                destroyer: Box::new(destroyer),
                permits: Semaphore::new(capacity),
                slots: Mutex::new(SlotTable {
                    states: Vec::new(),
                    idle: VecDeque::new(),
                    retired: Vec::new(),
                }),
                loans: DashMap::new(),
                returned: Notify::new(),
                is_closed: AtomicBool::new(false),
                close_finished: AtomicBool::new(false),
                creating: AtomicUsize::new(0),
                created: AtomicUsize::new(0),
                destroyed: AtomicUsize::new(0),
                metrics,
            }),
        })
    }

    /// Lends an idle resource, creates one if below capacity, or waits for a return.
    ///
    /// Factory errors are returned to the caller without retry.
    pub async fn borrow(&self) -> Result<Lease<R>, CollectorError> {
        let inner = &self.inner;
        if inner.is_closed.load(Ordering::SeqCst) {
            return Err(CollectorError::PoolClosed);
        }

        // Held until the lease exists; dropping it (error or cancellation)
        // gives the capacity back.
        let permit = inner.permits.acquire().await?;

        if inner.is_closed.load(Ordering::SeqCst) {
            return Err(CollectorError::PoolClosed);
        }

        let reused = {
            let mut table = lock(&inner.slots);
            let reused = table.idle.pop_front();
            if let Some((slot, _)) = &reused {
                table.states[*slot] = SlotState::OnLoan;
            }
            reused
        };

        let (slot, resource) = match reused {
            Some(entry) => entry,
            None => self.create().await?,
        };

        permit.forget();
        inner.loans.insert(slot, Instant::now());
        inner.metrics.record_lease_taken();
        debug!("Pool '{}': lent slot {}", inner.name, slot);

        Ok(Lease {
            resource: Some(resource),
            slot,
            pool: inner.clone(),
        })
    }

    async fn create(&self) -> Result<(usize, R), CollectorError> {
        let inner = &self.inner;
        let _creating = Creating::start(inner);

        let resource = match (inner.factory)().await {
            Ok(resource) => resource,
            Err(e) => {
                error!("Pool '{}': resource factory failed: {:#}", inner.name, e);
                return Err(CollectorError::FactoryFailed(format!("{:#}", e)));
            }
        };
        inner.created.fetch_add(1, Ordering::SeqCst);
        inner.metrics.record_resource_created();

        if inner.is_closed.load(Ordering::SeqCst) {
            inner.destroy(resource).await;
            return Err(CollectorError::PoolClosed);
        }

        let slot = {
            let mut table = lock(&inner.slots);
            table.states.push(SlotState::OnLoan);
            table.states.len() - 1
        };
        info!("Pool '{}': created resource in slot {}", inner.name, slot);
        Ok((slot, resource))
    }

    /// Returns a lease explicitly. Dropping the lease has the same effect.
    pub fn return_object(&self, mut lease: Lease<R>) -> Result<(), CollectorError> {
        if lease.pool.id != self.inner.id {
            return Err(CollectorError::ForeignLease);
        }
        match lease.resource.take() {
            Some(resource) => self.inner.take_back(lease.slot, resource),
            None => Err(CollectorError::InvalidReturn(lease.slot)),
        }
    }

    /// Destroys a broken resource instead of returning it, freeing its
    /// capacity so the next borrow creates a fresh one.
    pub async fn invalidate(&self, mut lease: Lease<R>) -> Result<(), CollectorError> {
        if lease.pool.id != self.inner.id {
            return Err(CollectorError::ForeignLease);
        }
        let slot = lease.slot;
        let resource = lease
            .resource
            .take()
            .ok_or(CollectorError::InvalidReturn(slot))?;

        let inner = &self.inner;
        let on_loan = lock(&inner.slots).states.get(slot) == Some(&SlotState::OnLoan);
        if !on_loan {
            inner.spawn_destroy(resource);
            return Err(CollectorError::InvalidReturn(slot));
        }
        let held_for = inner
            .loans
            .remove(&slot)
            .map(|(_, since)| since.elapsed())
            .unwrap_or_default();
        inner.metrics.record_lease_returned(held_for);
        warn!("Pool '{}': invalidating resource in slot {}", inner.name, slot);

        // Capacity comes back only once the old resource is gone.
        let _release = ReleaseSlot { inner, slot };
        inner.destroy(resource).await;
        Ok(())
    }

    /// Rejects further borrows and destroys every resource.
    ///
    /// Idle resources are destroyed immediately; leases still out are
    /// destroyed as they come back, waiting at most `grace_period`. Leases
    /// returned after that are destroyed on a background task.
    pub async fn close(&self, grace_period: Duration) -> PoolCloseReport {
        let inner = &self.inner;
        if inner.is_closed.swap(true, Ordering::SeqCst) {
            warn!("Pool '{}' is already closed", inner.name);
            return self.close_report(0);
        }

        info!("Closing resource pool '{}'...", inner.name);
        inner.permits.close();

        let deadline = tokio::time::Instant::now() + grace_period;
        let mut leaked = 0;

        loop {
            let notified = inner.returned.notified();

            let (doomed, on_loan) = {
                let mut table = lock(&inner.slots);
                let mut doomed: Vec<(usize, R)> = table.idle.drain(..).collect();
                doomed.append(&mut table.retired);
                for (slot, _) in &doomed {
                    table.states[*slot] = SlotState::Destroyed;
                }
                let pending =
                    table.count(SlotState::OnLoan) + inner.creating.load(Ordering::SeqCst);
                (doomed, pending)
            };

            for (slot, resource) in doomed {
                debug!("Pool '{}': destroying slot {}", inner.name, slot);
                inner.destroy(resource).await;
            }

            if on_loan == 0 {
                break;
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                leaked = on_loan;
                warn!(
                    "Pool '{}': {} leases still out after {:?}, they will be destroyed on return",
                    inner.name, leaked, grace_period
                );
                break;
            }
        }

        inner.close_finished.store(true, Ordering::SeqCst);

        // Returns that raced with the final check above.
        let stragglers: Vec<(usize, R)> = lock(&inner.slots).retired.drain(..).collect();
        for (_, resource) in stragglers {
            inner.destroy(resource).await;
        }

        let report = self.close_report(leaked);
        info!(
            "Resource pool '{}' closed: {} created, {} destroyed",
            inner.name, report.created, report.destroyed
        );
        report
    }

    fn close_report(&self, leaked: usize) -> PoolCloseReport {
        PoolCloseReport {
            created: self.inner.created.load(Ordering::SeqCst),
            destroyed: self.inner.destroyed.load(Ordering::SeqCst),
            leaked,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.is_closed.load(Ordering::SeqCst)
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    /// Age of every current loan, keyed by slot.
    pub fn loans(&self) -> Vec<LeaseHealth> {
        let mut loans: Vec<LeaseHealth> = self
            .inner
            .loans
            .iter()
            .map(|entry| LeaseHealth {
                slot: *entry.key(),
                held_for: entry.value().elapsed(),
            })
            .collect();
        loans.sort_by_key(|loan| loan.slot);
        loans
    }

    pub fn stats(&self) -> PoolStats {
        let (idle, on_loan) = {
            let table = lock(&self.inner.slots);
            (table.count(SlotState::Idle), table.count(SlotState::OnLoan))
        };
        let created = self.inner.created.load(Ordering::SeqCst);
        let destroyed = self.inner.destroyed.load(Ordering::SeqCst);

        PoolStats {
            capacity: self.inner.capacity,
            live: created.saturating_sub(destroyed),
            idle,
            on_loan,
            created,
            destroyed,
            longest_loan: self.inner.loans.iter().map(|e| e.value().elapsed()).max(),
            is_closed: self.is_closed(),
        }
    }
}

/// Ownership token for a borrowed resource.
///
/// Derefs to the resource. Dropping the lease returns the resource to its
/// pool; [`ResourcePool::return_object`] does the same explicitly.
pub struct Lease<R: Send + 'static> {
    resource: Option<R>,
    slot: usize,
    pool: Arc<PoolInner<R>>,
}

impl<R: Send + 'static> Lease<R> {
    pub fn slot(&self) -> usize {
        self.slot
    }

    pub fn pool_name(&self) -> &str {
        &self.pool.name
    }
}

impl<R: Send + 'static> Deref for Lease<R> {
    type Target = R;

    fn deref(&self) -> &R {
        self.resource
            .as_ref()
            .unwrap_or_else(|| unreachable!("lease accessed after its resource was returned"))
    }
}

impl<R: Send + 'static> DerefMut for Lease<R> {
    fn deref_mut(&mut self) -> &mut R {
        self.resource
            .as_mut()
            .unwrap_or_else(|| unreachable!("lease accessed after its resource was returned"))
    }
}

impl<R: Send + 'static> Drop for Lease<R> {
    fn drop(&mut self) {
        if let Some(resource) = self.resource.take() {
            if let Err(e) = self.pool.take_back(self.slot, resource) {
                error!("Pool '{}': returning slot {} failed: {}", self.pool.name, self.slot, e);
            }
        }
    }
}

impl<R: Send + std::fmt::Debug + 'static> std::fmt::Debug for Lease<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lease")
            .field("pool", &self.pool.name)
            .field("slot", &self.slot)
            .field("resource", &self.resource)
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct LeaseHealth {
    pub slot: usize,
    pub held_for: Duration,
}

#[derive(Debug, Clone)]
pub struct PoolStats {
    pub capacity: usize,
    pub live: usize,
    pub idle: usize,
    pub on_loan: usize,
    pub created: usize,
    pub destroyed: usize,
    pub longest_loan: Option<Duration>,
    pub is_closed: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolCloseReport {
    pub created: usize,
    pub destroyed: usize,
    /// Leases still out when the grace period ran out.
    pub leaked: usize,
}
