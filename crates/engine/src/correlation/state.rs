//! State shared between the dispatch path, reply intake and the monitor.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{Notify, watch};
use tracing::{debug, warn};

use super::hooks::CorrelationMapping;
use super::locks::LockStripes;
use super::markers::ProcessedMarkers;
use super::store::{PendingReplyGroup, ReplyStore};
use super::waiter::ReplyWaiter;
use crate::config::CorrelatorConfig;
use crate::error::{Error, Result};
use crate::notification::{MissReason, Notification, NotificationSink};
use crate::types::{CorrelatedReply, CorrelationId, WorkItem};

/// Point-in-time correlator counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CorrelatorStats {
    pub delivered: u64,
    pub timed_out: u64,
    pub missed: u64,
    pub duplicates: u64,
    pub live_waiters: usize,
    pub processed_markers: usize,
}

#[derive(Debug, Default)]
pub(crate) struct Counters {
    pub(crate) delivered: AtomicU64,
    pub(crate) timed_out: AtomicU64,
    pub(crate) missed: AtomicU64,
    pub(crate) duplicates: AtomicU64,
}

impl Counters {
    pub(crate) fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

pub(crate) struct CorrelationState {
    pub(crate) config: CorrelatorConfig,
    pub(crate) store: Arc<dyn ReplyStore>,
    pub(crate) markers: ProcessedMarkers,
    pub(crate) stripes: LockStripes,
    pub(crate) mapping: Arc<dyn CorrelationMapping>,
    pub(crate) notifications: Arc<dyn NotificationSink>,
    pub(crate) counters: Counters,
    /// Wakes the monitor for an immediate run.
    pub(crate) trigger: Notify,
    /// `true` while the correlator is stopped.
    pub(crate) stopped: watch::Sender<bool>,
    waiters: Mutex<HashMap<CorrelationId, Arc<ReplyWaiter>>>,
    results: Mutex<HashMap<CorrelationId, CorrelatedReply>>,
}

impl CorrelationState {
    pub(crate) fn new(
        config: CorrelatorConfig,
        store: Arc<dyn ReplyStore>,
        mapping: Arc<dyn CorrelationMapping>,
        notifications: Arc<dyn NotificationSink>,
    ) -> Self {
        let markers = ProcessedMarkers::new(config.marker_capacity).with_ttl(config.marker_ttl());
        let stripes = LockStripes::new(config.lock_stripes);
        let (stopped, _) = watch::channel(true);
        Self {
            config,
            store,
            markers,
            stripes,
            mapping,
            notifications,
            counters: Counters::default(),
            trigger: Notify::new(),
            stopped,
            waiters: Mutex::new(HashMap::new()),
            results: Mutex::new(HashMap::new()),
        }
    }

    pub(crate) fn is_stopped(&self) -> bool {
        *self.stopped.borrow()
    }

    pub(crate) fn register_waiter(&self, request: &WorkItem) -> Result<Arc<ReplyWaiter>> {
        let correlation_id = self.mapping.correlation_id(request);
        let expected = request
            .group()
            .map(|group| group.group_size)
            .filter(|size| *size > 1);
        let deadline = self
            .config
            .reply_timeout()
            .and_then(|timeout| Instant::now().checked_add(timeout))
            .and_then(|deadline| deadline.checked_add(self.config.grace_period()));

        let mut waiters = self.waiters.lock();
        if waiters.contains_key(&correlation_id) {
            return Err(Error::WaiterExists { correlation_id });
        }
        let waiter = Arc::new(ReplyWaiter::new(correlation_id.clone(), expected, deadline));
        waiters.insert(correlation_id, Arc::clone(&waiter));
        Ok(waiter)
    }

    /// Remove `waiter` if it is still the one registered under its id.
    pub(crate) fn remove_waiter(&self, waiter: &Arc<ReplyWaiter>) {
        let mut waiters = self.waiters.lock();
        if waiters
            .get(waiter.correlation_id())
            .is_some_and(|current| Arc::ptr_eq(current, waiter))
        {
            waiters.remove(waiter.correlation_id());
        }
    }

    pub(crate) fn is_registered(&self, waiter: &Arc<ReplyWaiter>) -> bool {
        self.waiters
            .lock()
            .get(waiter.correlation_id())
            .is_some_and(|current| Arc::ptr_eq(current, waiter))
    }

    pub(crate) fn waiter(&self, id: &CorrelationId) -> Option<Arc<ReplyWaiter>> {
        self.waiters.lock().get(id).cloned()
    }

    pub(crate) fn waiters(&self) -> Vec<Arc<ReplyWaiter>> {
        self.waiters.lock().values().cloned().collect()
    }

    /// Store the result for `id`; a second result is an upstream bug.
    pub(crate) fn store_result(&self, id: &CorrelationId, result: CorrelatedReply) -> Result<()> {
        let mut results = self.results.lock();
        if results.contains_key(id) {
            return Err(Error::DuplicateResult {
                correlation_id: id.clone(),
            });
        }
        results.insert(id.clone(), result);
        Ok(())
    }

    pub(crate) fn take_result(&self, id: &CorrelationId) -> Option<CorrelatedReply> {
        self.results.lock().remove(id)
    }

    pub(crate) fn has_result(&self, id: &CorrelationId) -> bool {
        self.results.lock().contains_key(id)
    }

    /// Drop results nobody will collect; returns how many were dropped.
    pub(crate) fn clear_results(&self) -> usize {
        let mut results = self.results.lock();
        let dropped = results.len();
        results.clear();
        dropped
    }

    /// Append a reply to its pending group, creating the group if needed.
    pub(crate) async fn accept_reply(&self, reply: WorkItem) -> Result<()> {
        let correlation_id = self.mapping.correlation_id(&reply);
        {
            let _stripe = self.stripes.lock(&correlation_id).await;
            let appends = self
                .waiter(&correlation_id)
                .is_some_and(|waiter| waiter.is_sequence());
            let group = match self.store.retrieve(&correlation_id).await? {
                Some(group) if appends => group.with_reply(reply),
                Some(mut replaced) => {
                    for stale in replaced.drain() {
                        self.report_missed(&correlation_id, stale, MissReason::Superseded);
                    }
                    PendingReplyGroup::new(correlation_id.clone()).with_reply(reply)
                }
                None => PendingReplyGroup::new(correlation_id.clone()).with_reply(reply),
            };
            let buffered = group.len();
            self.store.store(group).await?;
            debug!(correlation_id = %correlation_id, buffered, "Reply received");
        }
        self.trigger.notify_one();
        Ok(())
    }

    pub(crate) fn report_missed(&self, id: &CorrelationId, reply: WorkItem, reason: MissReason) {
        Counters::bump(&self.counters.missed);
        self.notifications.notify(Notification::MissedReply {
            correlation_id: id.clone(),
            reply: Box::new(reply),
            reason,
        });
    }

    /// Empty the reply store, reporting each buffered reply as missed.
    pub(crate) async fn release_pending(&self, reason: MissReason) -> Result<usize> {
        let mut released = 0_usize;
        for id in self.store.all_keys().await? {
            let _stripe = self.stripes.lock(&id).await;
            let Some(mut group) = self.store.remove(&id).await? else {
                continue;
            };
            for reply in group.drain() {
                released = released.saturating_add(1);
                self.report_missed(&id, reply, reason);
            }
        }
        Ok(released)
    }

    /// Report every part `waiter` buffered as missed. Returns the count.
    pub(crate) fn release_parts(&self, waiter: &ReplyWaiter, reason: MissReason) -> usize {
        let parts = waiter.take_parts();
        let released = parts.len();
        for part in parts {
            self.report_missed(waiter.correlation_id(), part, reason);
        }
        if released > 0 {
            warn!(
                correlation_id = %waiter.correlation_id(),
                released,
                %reason,
                "Released parts of an unfinished sequence"
            );
        }
        released
    }

    pub(crate) fn stats(&self) -> CorrelatorStats {
        CorrelatorStats {
            delivered: self.counters.delivered.load(Ordering::Relaxed),
            timed_out: self.counters.timed_out.load(Ordering::Relaxed),
            missed: self.counters.missed.load(Ordering::Relaxed),
            duplicates: self.counters.duplicates.load(Ordering::Relaxed),
            live_waiters: self.waiters.lock().len(),
            processed_markers: self.markers.len(),
        }
    }
}
