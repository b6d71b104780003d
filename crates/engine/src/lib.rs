//! Asynchronous request/reply correlation over a SEDA worker pool.
//!
//! - **Worker pool**: bounded queue, N worker tasks, pooled, singleton or
//!   per-request processing units
//! - **Correlator**: one-way dispatch that suspends until the matching reply
//!   arrives, with timeout and grace retry
//! - **Monitor**: scheduled reconciliation of buffered replies against live
//!   waiters, with late and duplicate reply detection
//! - **Processed markers**: bounded ring of correlation ids that already
//!   completed or timed out
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use courier_engine::{EngineConfig, ExecutionMode, Pipeline, TracingSink, WorkItem};
//!
//! #[tokio::main]
//! async fn main() -> courier_engine::Result<()> {
//!     let pipeline = Pipeline::new(
//!         &EngineConfig::default(),
//!         ExecutionMode::singleton(Arc::new(EchoUnit)),
//!         Arc::new(TracingSink),
//!     );
//!     pipeline.start().await?;
//!
//!     let request = WorkItem::new(serde_json::json!({"q": 1})).with_correlation_id("xyz");
//!     let reply = pipeline.dispatch(request).await?;
//!     println!("{:?}", reply.map(|r| r.into_reply()));
//!
//!     pipeline.shutdown(true).await;
//!     Ok(())
//! }
//! ```

#![forbid(unsafe_code)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]

pub mod config;
pub mod correlation;
pub mod error;
pub mod notification;
pub mod pipeline;
pub mod pool;
pub mod sink;
pub mod types;

// Re-export main types
pub use config::{
    CorrelatorConfig, EngineConfig, InitialisationPolicy, OverflowPolicy, ReplyStoreConfig,
    WorkerPoolConfig,
};
pub use correlation::{
    AsyncReplyCorrelator, CorrelationMapping, CorrelatorStats, DefaultSessionMerge,
    InMemoryReplyStore, ItemCorrelation, MarkerReason, PendingReplyGroup, ProcessedMarkers,
    ReplyIntake, ReplyMonitor, ReplyStore, SessionMerge, TickReport,
};
pub use error::{Error, Result};
pub use notification::{BroadcastSink, FnSink, MissReason, Notification, NotificationSink, TracingSink};
pub use pipeline::{Pipeline, PipelineStats};
pub use pool::{ExecutionMode, PoolState, PoolStats, ProcessingUnit, UnitFactory, UnitPool, WorkerPool};
pub use sink::{DispatchSink, OutputSink};
pub use types::{CorrelatedReply, CorrelationId, GroupCorrelation, ItemId, Session, WorkItem};
