//! Processing units and the execution modes that hand them to workers.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info};

use crate::config::{InitialisationPolicy, WorkerPoolConfig};
use crate::error::{Error, Result};
use crate::types::WorkItem;

/// Executes one work item, optionally producing an output item.
#[async_trait]
pub trait ProcessingUnit: Send + Sync {
    async fn process(&self, item: &WorkItem) -> Result<Option<WorkItem>>;

    /// Release resources held by the unit.
    async fn dispose(&self) {}
}

/// Builds processing units for pooled and per-request modes.
#[async_trait]
pub trait UnitFactory: Send + Sync {
    async fn create(&self) -> Result<Box<dyn ProcessingUnit>>;
}

type IdleUnits = Arc<Mutex<Vec<Box<dyn ProcessingUnit>>>>;

/// Bounded object pool of processing units.
///
/// Units are created lazily up to `max_active`; a borrow waits up to the
/// borrow timeout for a unit to come back.
pub struct UnitPool {
    factory: Arc<dyn UnitFactory>,
    permits: Arc<Semaphore>,
    idle: IdleUnits,
    max_active: usize,
    borrow_timeout: Duration,
}

impl UnitPool {
    #[must_use]
    pub fn new(factory: Arc<dyn UnitFactory>, max_active: usize, borrow_timeout: Duration) -> Self {
        let max_active = max_active.max(1);
        Self {
            factory,
            permits: Arc::new(Semaphore::new(max_active)),
            idle: Arc::new(Mutex::new(Vec::new())),
            max_active,
            borrow_timeout,
        }
    }

    #[must_use]
    pub const fn max_active(&self) -> usize {
        self.max_active
    }

    /// Units currently checked out.
    #[must_use]
    pub fn active(&self) -> usize {
        self.max_active
            .saturating_sub(self.permits.available_permits())
    }

    /// Units created and waiting to be borrowed.
    #[must_use]
    pub fn idle(&self) -> usize {
        self.idle.lock().len()
    }

    /// Check out a unit, creating one if none is idle.
    ///
    /// # Errors
    ///
    /// - `PoolExhausted` if no unit frees up within the borrow timeout
    /// - `InvalidState` if the pool has been disposed
    /// - any error from the factory
    pub async fn borrow(&self) -> Result<PooledUnit> {
        let permit = match tokio::time::timeout(
            self.borrow_timeout,
            Arc::clone(&self.permits).acquire_owned(),
        )
        .await
        {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err(Error::invalid_state("unit pool is disposed")),
            Err(_) => {
                return Err(Error::PoolExhausted {
                    timeout_ms: u64::try_from(self.borrow_timeout.as_millis())
                        .unwrap_or(u64::MAX),
                });
            }
        };

        let idle = self.idle.lock().pop();
        let unit = match idle {
            Some(unit) => unit,
            None => {
                debug!(active = self.active(), "Creating pooled processing unit");
                self.factory.create().await?
            }
        };

        Ok(PooledUnit {
            unit: Some(unit),
            idle: Arc::clone(&self.idle),
            _permit: permit,
        })
    }

    /// Borrow and return units up front so construction failures surface on start.
    ///
    /// # Errors
    ///
    /// Returns the first borrow or construction failure.
    pub async fn initialise(&self, policy: InitialisationPolicy) -> Result<()> {
        let count = match policy {
            InitialisationPolicy::None => 0,
            InitialisationPolicy::One => 1,
            InitialisationPolicy::All => self.max_active,
        };
        let mut warmed = Vec::with_capacity(count);
        for _ in 0..count {
            warmed.push(self.borrow().await?);
        }
        if count > 0 {
            info!(units = count, "Unit pool initialised");
        }
        Ok(())
    }

    /// Stop lending and dispose every idle unit.
    pub async fn dispose(&self) {
        self.permits.close();
        let idle = std::mem::take(&mut *self.idle.lock());
        let count = idle.len();
        for unit in idle {
            unit.dispose().await;
        }
        debug!(disposed = count, "Unit pool disposed");
    }
}

/// A borrowed unit; returns to the pool on drop.
pub struct PooledUnit {
    unit: Option<Box<dyn ProcessingUnit>>,
    idle: IdleUnits,
    _permit: OwnedSemaphorePermit,
}

impl PooledUnit {
    #[must_use]
    pub fn unit(&self) -> Option<&dyn ProcessingUnit> {
        self.unit.as_deref()
    }

    /// Take the unit out of the pool for good; its slot frees up.
    pub fn discard(mut self) -> Option<Box<dyn ProcessingUnit>> {
        self.unit.take()
    }
}

impl Drop for PooledUnit {
    fn drop(&mut self) {
        if let Some(unit) = self.unit.take() {
            self.idle.lock().push(unit);
        }
    }
}

/// How workers obtain a processing unit. Fixed for the pool's lifetime.
pub enum ExecutionMode {
    /// Borrow from a bounded pool and return after use.
    Pooled(UnitPool),
    /// One unit shared by every item.
    Singleton(Arc<dyn ProcessingUnit>),
    /// A fresh unit per item, disposed right after.
    PerRequest(Arc<dyn UnitFactory>),
}

impl ExecutionMode {
    /// Pooled mode sized from the pool configuration.
    #[must_use]
    pub fn pooled(factory: Arc<dyn UnitFactory>, config: &WorkerPoolConfig) -> Self {
        Self::Pooled(UnitPool::new(
            factory,
            config.max_active_units,
            config.borrow_timeout(),
        ))
    }

    #[must_use]
    pub const fn singleton(unit: Arc<dyn ProcessingUnit>) -> Self {
        Self::Singleton(unit)
    }

    #[must_use]
    pub const fn per_request(factory: Arc<dyn UnitFactory>) -> Self {
        Self::PerRequest(factory)
    }

    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Pooled(_) => "pooled",
            Self::Singleton(_) => "singleton",
            Self::PerRequest(_) => "per_request",
        }
    }

    pub(crate) async fn prepare(&self, policy: InitialisationPolicy) -> Result<()> {
        match self {
            Self::Pooled(pool) => pool.initialise(policy).await,
            Self::Singleton(_) | Self::PerRequest(_) => Ok(()),
        }
    }

    pub(crate) async fn acquire(&self) -> Result<AcquiredUnit> {
        match self {
            Self::Pooled(pool) => pool.borrow().await.map(AcquiredUnit::Pooled),
            Self::Singleton(unit) => Ok(AcquiredUnit::Shared(Arc::clone(unit))),
            Self::PerRequest(factory) => factory.create().await.map(AcquiredUnit::Fresh),
        }
    }

    pub(crate) async fn dispose(&self) {
        match self {
            Self::Pooled(pool) => pool.dispose().await,
            Self::Singleton(unit) => unit.dispose().await,
            Self::PerRequest(_) => {}
        }
    }
}

/// A unit held by a worker for the duration of one item.
pub(crate) enum AcquiredUnit {
    Pooled(PooledUnit),
    Shared(Arc<dyn ProcessingUnit>),
    Fresh(Box<dyn ProcessingUnit>),
}

impl AcquiredUnit {
    pub(crate) async fn process(&self, item: &WorkItem) -> Result<Option<WorkItem>> {
        let unit = match self {
            Self::Pooled(pooled) => pooled
                .unit()
                .ok_or_else(|| Error::unit("pooled unit already discarded"))?,
            Self::Shared(unit) => unit.as_ref(),
            Self::Fresh(unit) => unit.as_ref(),
        };
        unit.process(item).await
    }

    /// Hand the unit back. Unhealthy pooled units are disposed instead of
    /// returned; per-request units are always disposed.
    pub(crate) async fn release(self, healthy: bool) {
        match self {
            Self::Pooled(pooled) if healthy => drop(pooled),
            Self::Pooled(pooled) => {
                if let Some(unit) = pooled.discard() {
                    unit.dispose().await;
                }
            }
            Self::Shared(_) => {}
            Self::Fresh(unit) => unit.dispose().await,
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[derive(Default)]
    struct Counting {
        created: AtomicUsize,
        disposed: Arc<AtomicUsize>,
    }

    struct Echo {
        disposed: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl ProcessingUnit for Echo {
        async fn process(&self, item: &WorkItem) -> Result<Option<WorkItem>> {
            Ok(Some(item.reply(item.payload().clone())))
        }

        async fn dispose(&self) {
            self.disposed.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl UnitFactory for Counting {
        async fn create(&self) -> Result<Box<dyn ProcessingUnit>> {
            self.created.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(Echo {
                disposed: Arc::clone(&self.disposed),
            }))
        }
    }

    struct Broken;

    #[async_trait]
    impl UnitFactory for Broken {
        async fn create(&self) -> Result<Box<dyn ProcessingUnit>> {
            Err(Error::unit("cannot build unit"))
        }
    }

    #[tokio::test]
    async fn test_borrowed_unit_is_reused() {
        let factory = Arc::new(Counting::default());
        let pool = UnitPool::new(factory.clone(), 2, Duration::from_millis(50));

        drop(pool.borrow().await.unwrap());
        drop(pool.borrow().await.unwrap());

        assert_eq!(factory.created.load(Ordering::SeqCst), 1);
        assert_eq!(pool.idle(), 1);
    }

    #[tokio::test]
    async fn test_exhausted_pool_times_out() {
        let pool = UnitPool::new(Arc::new(Counting::default()), 1, Duration::from_millis(20));
        let _held = pool.borrow().await.unwrap();

        let second = pool.borrow().await;
        assert!(matches!(second, Err(Error::PoolExhausted { timeout_ms: 20 })));
    }

    #[tokio::test]
    async fn test_initialise_all_creates_max_active() {
        let factory = Arc::new(Counting::default());
        let pool = UnitPool::new(factory.clone(), 3, Duration::from_millis(50));

        pool.initialise(InitialisationPolicy::All).await.unwrap();

        assert_eq!(factory.created.load(Ordering::SeqCst), 3);
        assert_eq!(pool.idle(), 3);
        assert_eq!(pool.active(), 0);
    }

    #[tokio::test]
    async fn test_initialise_surfaces_factory_errors() {
        let pool = UnitPool::new(Arc::new(Broken), 1, Duration::from_millis(50));
        let result = pool.initialise(InitialisationPolicy::One).await;
        assert!(matches!(result, Err(Error::Unit { .. })));
    }

    #[tokio::test]
    async fn test_dispose_closes_pool() {
        let factory = Arc::new(Counting::default());
        let pool = UnitPool::new(factory.clone(), 1, Duration::from_millis(50));
        pool.initialise(InitialisationPolicy::One).await.unwrap();

        pool.dispose().await;

        assert_eq!(factory.disposed.load(Ordering::SeqCst), 1);
        assert!(matches!(
            pool.borrow().await,
            Err(Error::InvalidState { .. })
        ));
    }

    #[tokio::test]
    async fn test_per_request_unit_is_disposed_after_use() {
        let factory = Arc::new(Counting::default());
        let mode = ExecutionMode::per_request(factory.clone());

        let unit = mode.acquire().await.unwrap();
        let output = unit
            .process(&WorkItem::new(serde_json::json!(1)))
            .await
            .unwrap();
        unit.release(true).await;

        assert!(output.is_some());
        assert_eq!(factory.disposed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unhealthy_pooled_unit_is_not_returned() {
        let factory = Arc::new(Counting::default());
        let mode = ExecutionMode::Pooled(UnitPool::new(
            factory.clone(),
            1,
            Duration::from_millis(50),
        ));

        mode.acquire().await.unwrap().release(false).await;

        assert_eq!(factory.disposed.load(Ordering::SeqCst), 1);
        if let ExecutionMode::Pooled(pool) = &mode {
            assert_eq!(pool.idle(), 0);
            assert_eq!(pool.active(), 0);
        }
    }
}
