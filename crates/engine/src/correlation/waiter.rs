//! Per-request reply waiter.

use std::time::Instant;

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::types::{CorrelatedReply, CorrelationId, WorkItem};

/// State for one in-flight dispatch.
///
/// The latch is a `Notify` permit: a signal sent before the caller starts
/// waiting is not lost.
#[derive(Debug)]
pub struct ReplyWaiter {
    correlation_id: CorrelationId,
    expected_group_size: Option<u32>,
    latch: Notify,
    created_at: Instant,
    deadline: Option<Instant>,
    parts: Mutex<Vec<WorkItem>>,
}

impl ReplyWaiter {
    /// `expected_group_size` of `None` means a single reply is expected.
    #[must_use]
    pub fn new(
        correlation_id: CorrelationId,
        expected_group_size: Option<u32>,
        deadline: Option<Instant>,
    ) -> Self {
        Self {
            correlation_id,
            expected_group_size,
            latch: Notify::new(),
            created_at: Instant::now(),
            deadline,
            parts: Mutex::new(Vec::new()),
        }
    }

    #[must_use]
    pub const fn correlation_id(&self) -> &CorrelationId {
        &self.correlation_id
    }

    #[must_use]
    pub const fn expected_group_size(&self) -> Option<u32> {
        self.expected_group_size
    }

    #[must_use]
    pub const fn is_sequence(&self) -> bool {
        self.expected_group_size.is_some()
    }

    #[must_use]
    pub const fn created_at(&self) -> Instant {
        self.created_at
    }

    /// When the owning dispatch gives up, if it has a timeout at all.
    #[must_use]
    pub const fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Replies buffered for a sequence that has not closed yet.
    #[must_use]
    pub fn collected(&self) -> usize {
        self.parts.lock().len()
    }

    /// Drain the parts of a sequence that will never close.
    pub fn take_parts(&self) -> Vec<WorkItem> {
        std::mem::take(&mut *self.parts.lock())
    }

    pub fn signal(&self) {
        self.latch.notify_one();
    }

    pub async fn signaled(&self) {
        self.latch.notified().await;
    }

    /// Feed one reply; returns the complete result once the sequence closes.
    ///
    /// Single-reply waiters close on the first reply. Sequence waiters close
    /// on the reply whose sequence number equals its group size, carrying
    /// every part collected before it.
    pub fn accept(&self, reply: WorkItem) -> Option<CorrelatedReply> {
        if !self.is_sequence() {
            return Some(CorrelatedReply::single(self.correlation_id.clone(), reply));
        }

        let closes = reply.group().is_none_or(|group| group.is_last());
        let mut parts = self.parts.lock();
        if closes {
            let earlier = std::mem::take(&mut *parts);
            Some(CorrelatedReply::group(
                self.correlation_id.clone(),
                earlier,
                reply,
            ))
        } else {
            parts.push(reply);
            None
        }
    }
}
