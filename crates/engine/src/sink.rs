//! Seams to the collaborators on either side of the engine.

use async_trait::async_trait;

use crate::error::Result;
use crate::types::WorkItem;

/// One-way "send downstream" used by `dispatch`.
///
/// Fire-and-forget: an `Err` means the request never left, and surfaces to
/// the dispatch caller as a dispatch error.
#[async_trait]
pub trait DispatchSink: Send + Sync {
    async fn send(&self, item: WorkItem) -> Result<()>;
}

/// Receives whatever a processing unit produced for an item.
#[async_trait]
pub trait OutputSink: Send + Sync {
    async fn emit(&self, item: WorkItem) -> Result<()>;
}
