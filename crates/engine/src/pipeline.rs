//! A worker pool and a reply correlator wired back to back.
//!
//! Requests dispatched through the correlator are enqueued on the pool;
//! whatever the processing units produce is fed back as replies.

use std::sync::Arc;

use serde::Serialize;
use tracing::info;

use crate::config::EngineConfig;
use crate::correlation::{AsyncReplyCorrelator, CorrelatorStats, InMemoryReplyStore};
use crate::error::Result;
use crate::notification::NotificationSink;
use crate::pool::{ExecutionMode, PoolStats, WorkerPool};
use crate::sink::DispatchSink;
use crate::types::{CorrelatedReply, WorkItem};

#[derive(Debug, Clone, Serialize)]
pub struct PipelineStats {
    pub pool: PoolStats,
    pub correlator: CorrelatorStats,
}

pub struct Pipeline {
    pool: Arc<WorkerPool>,
    correlator: AsyncReplyCorrelator,
}

impl Pipeline {
    #[must_use]
    pub fn new(
        config: &EngineConfig,
        mode: ExecutionMode,
        notifications: Arc<dyn NotificationSink>,
    ) -> Self {
        let pool = Arc::new(
            WorkerPool::builder(mode)
                .config(config.pool.clone())
                .notifications(Arc::clone(&notifications))
                .build(),
        );
        let sink: Arc<dyn DispatchSink> = pool.clone();
        let correlator = AsyncReplyCorrelator::builder(sink)
            .config(config.correlator.clone())
            .store(Arc::new(InMemoryReplyStore::with_config(&config.store)))
            .notifications(notifications)
            .build();
        pool.set_output(Arc::new(correlator.reply_intake()));
        Self { pool, correlator }
    }

    /// Start the correlator, then the pool.
    ///
    /// # Errors
    ///
    /// Returns the first start failure; nothing is left running.
    pub async fn start(&self) -> Result<()> {
        self.correlator.start()?;
        if let Err(e) = self.pool.start().await {
            self.correlator.stop().await;
            return Err(e);
        }
        info!("Pipeline started");
        Ok(())
    }

    /// Dispatch a request through the pool and wait for its reply.
    ///
    /// # Errors
    ///
    /// See [`AsyncReplyCorrelator::dispatch`].
    pub async fn dispatch(&self, request: WorkItem) -> Result<Option<CorrelatedReply>> {
        self.correlator.dispatch(request).await
    }

    /// Stop the pool (draining it when `graceful`), then the correlator, and
    /// release every processing unit.
    pub async fn shutdown(&self, graceful: bool) {
        self.pool.stop(graceful).await;
        self.correlator.stop().await;
        self.pool.dispose().await;
        info!(graceful, "Pipeline shut down");
    }

    #[must_use]
    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    #[must_use]
    pub const fn correlator(&self) -> &AsyncReplyCorrelator {
        &self.correlator
    }

    #[must_use]
    pub fn stats(&self) -> PipelineStats {
        PipelineStats {
            pool: self.pool.stats(),
            correlator: self.correlator.stats(),
        }
    }
}
