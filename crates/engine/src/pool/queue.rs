//! Bounded work queue shared by the pool's workers.

use std::time::Duration;

use tokio::sync::mpsc::error::{SendTimeoutError, TrySendError};
use tokio::sync::{Mutex, mpsc};

use crate::config::OverflowPolicy;
use crate::error::{Error, Result};
use crate::types::WorkItem;

pub(crate) struct WorkQueue {
    sender: mpsc::Sender<WorkItem>,
    receiver: Mutex<mpsc::Receiver<WorkItem>>,
    capacity: usize,
}

impl WorkQueue {
    pub(crate) fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (sender, receiver) = mpsc::channel(capacity);
        Self {
            sender,
            receiver: Mutex::new(receiver),
            capacity,
        }
    }

    pub(crate) const fn capacity(&self) -> usize {
        self.capacity
    }

    pub(crate) fn depth(&self) -> usize {
        self.capacity.saturating_sub(self.sender.capacity())
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.depth() == 0
    }

    pub(crate) async fn push(
        &self,
        item: WorkItem,
        policy: OverflowPolicy,
        wait: Duration,
    ) -> Result<()> {
        match policy {
            OverflowPolicy::Block => {
                self.sender
                    .send_timeout(item, wait)
                    .await
                    .map_err(|e| match e {
                        SendTimeoutError::Timeout(_) => Error::QueueTimeout {
                            timeout_ms: u64::try_from(wait.as_millis()).unwrap_or(u64::MAX),
                            capacity: self.capacity,
                        },
                        SendTimeoutError::Closed(_) => Error::QueueClosed {
                            state: "closed".to_string(),
                        },
                    })
            }
            OverflowPolicy::Reject => self.sender.try_send(item).map_err(|e| match e {
                TrySendError::Full(_) => Error::QueueFull {
                    capacity: self.capacity,
                },
                TrySendError::Closed(_) => Error::QueueClosed {
                    state: "closed".to_string(),
                },
            }),
        }
    }

    /// Wait up to `window` for the next item. Cancel-safe.
    pub(crate) async fn poll(&self, window: Duration) -> Option<WorkItem> {
        tokio::time::timeout(window, async {
            let mut receiver = self.receiver.lock().await;
            receiver.recv().await
        })
        .await
        .ok()
        .flatten()
    }

    /// Drop everything still queued; returns how many items were dropped.
    pub(crate) async fn drain_abandoned(&self) -> usize {
        let mut receiver = self.receiver.lock().await;
        let mut abandoned = 0usize;
        while receiver.try_recv().is_ok() {
            abandoned = abandoned.saturating_add(1);
        }
        abandoned
    }
}
