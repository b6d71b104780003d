//! Reply correlation: waiters, pending reply storage, processed markers and
//! the reconciliation monitor.

mod correlator;
mod hooks;
mod locks;
mod markers;
mod monitor;
mod state;
mod store;
mod waiter;

pub use correlator::{AsyncReplyCorrelator, CorrelatorBuilder, ReplyIntake};
pub use hooks::{CorrelationMapping, DefaultSessionMerge, ItemCorrelation, SessionMerge};
pub use locks::LockStripes;
pub use markers::{MarkOutcome, MarkerReason, ProcessedMarker, ProcessedMarkers};
pub use monitor::{ReplyMonitor, TickReport};
pub use state::CorrelatorStats;
pub use store::{InMemoryReplyStore, PendingReplyGroup, ReplyStore};
pub use waiter::ReplyWaiter;
