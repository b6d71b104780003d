//! Failure handler and notification sink.
//!
//! Worker failures and correlation events ("reply timeout", "missed async
//! reply") are fire-and-forget: sinks must not block the caller.

use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::correlation::MarkerReason;
use crate::error::Error;
use crate::types::{CorrelationId, WorkItem};

/// Why a reply was dropped instead of delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MissReason {
    /// The correlation id already reached a terminal marker.
    AlreadyFinished(MarkerReason),
    /// The group had no waiter for longer than the orphan TTL.
    Orphaned,
    /// Extra replies left in a group after it completed.
    Surplus,
    /// Replaced in the buffer by a newer reply before any waiter took it.
    Superseded,
    /// Buffered for a dispatch that was cancelled or shut down mid-sequence.
    Abandoned,
    /// Still buffered when the correlator stopped.
    Stopped,
}

impl std::fmt::Display for MissReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::AlreadyFinished(reason) => write!(f, "already {reason}"),
            Self::Orphaned => write!(f, "orphaned"),
            Self::Surplus => write!(f, "surplus"),
            Self::Superseded => write!(f, "superseded"),
            Self::Abandoned => write!(f, "abandoned"),
            Self::Stopped => write!(f, "stopped"),
        }
    }
}

/// Events emitted by the worker pool and the correlator.
#[derive(Debug, Clone)]
pub enum Notification {
    /// A dispatch gave up waiting for its reply.
    ReplyTimeout {
        correlation_id: CorrelationId,
        waited_ms: u64,
    },
    /// A reply arrived that could not be delivered.
    MissedReply {
        correlation_id: CorrelationId,
        reply: Box<WorkItem>,
        reason: MissReason,
    },
    /// A work item failed inside the worker pool.
    ProcessingFailed {
        item: Option<Box<WorkItem>>,
        error: Arc<Error>,
        retryable: bool,
    },
}

impl Notification {
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ReplyTimeout { .. } => "reply_timeout",
            Self::MissedReply { .. } => "missed_reply",
            Self::ProcessingFailed { .. } => "processing_failed",
        }
    }
}

/// Receives forwarded failures and correlation notifications.
pub trait NotificationSink: Send + Sync {
    fn notify(&self, notification: Notification);
}

/// Logs every notification through `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl NotificationSink for TracingSink {
    fn notify(&self, notification: Notification) {
        match notification {
            Notification::ReplyTimeout {
                correlation_id,
                waited_ms,
            } => warn!(correlation_id = %correlation_id, waited_ms, "Async reply timed out"),
            Notification::MissedReply {
                correlation_id,
                reply,
                reason,
            } => warn!(
                correlation_id = %correlation_id,
                reply_id = %reply.id(),
                reason = %reason,
                "Missed async reply"
            ),
            Notification::ProcessingFailed {
                item,
                error,
                retryable,
            } => warn!(
                item_id = item.as_ref().map(|i| i.id().to_string()).unwrap_or_default(),
                error = %error,
                retryable,
                "Work item processing failed"
            ),
        }
    }
}

/// Fans notifications out to any number of subscribers.
pub struct BroadcastSink {
    sender: broadcast::Sender<Notification>,
}

impl BroadcastSink {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.sender.subscribe()
    }
}

impl NotificationSink for BroadcastSink {
    fn notify(&self, notification: Notification) {
        if self.sender.send(notification).is_err() {
            debug!("No active subscribers for notification");
        }
    }
}

/// Adapts a closure into a [`NotificationSink`].
pub struct FnSink<F>(F);

impl<F> FnSink<F>
where
    F: Fn(Notification) + Send + Sync,
{
    pub const fn new(f: F) -> Self {
        Self(f)
    }
}

impl<F> NotificationSink for FnSink<F>
where
    F: Fn(Notification) + Send + Sync,
{
    fn notify(&self, notification: Notification) {
        (self.0)(notification);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[test]
    fn test_fn_sink_invokes_closure() {
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&seen);
        let sink = FnSink::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        sink.notify(Notification::ReplyTimeout {
            correlation_id: "abc".into(),
            waited_ms: 10,
        });

        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_broadcast_sink_delivers_to_subscriber() {
        let sink = BroadcastSink::new(8);
        let mut rx = sink.subscribe();

        sink.notify(Notification::ReplyTimeout {
            correlation_id: "abc".into(),
            waited_ms: 10,
        });

        let received = rx.recv().await;
        assert!(matches!(
            received,
            Ok(Notification::ReplyTimeout { ref correlation_id, .. }) if correlation_id.as_str() == "abc"
        ));
    }

    #[test]
    fn test_broadcast_sink_without_subscribers_does_not_fail() {
        let sink = BroadcastSink::new(1);
        sink.notify(Notification::ReplyTimeout {
            correlation_id: "nobody".into(),
            waited_ms: 0,
        });
    }

    #[test]
    fn test_miss_reason_display() {
        assert_eq!(
            MissReason::AlreadyFinished(MarkerReason::TimedOut).to_string(),
            "already timed out"
        );
        assert_eq!(MissReason::Orphaned.to_string(), "orphaned");
        assert_eq!(MissReason::Stopped.to_string(), "stopped");
    }
}
