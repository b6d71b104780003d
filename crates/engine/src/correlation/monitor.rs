//! Scheduled reconciliation of pending replies against live waiters.
//!
//! One run never overlaps another: the background task and manual
//! [`ReplyMonitor::run_once`] calls share a tick lock.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, trace, warn};

use courier_core::ResultExt;

use super::markers::{MarkOutcome, MarkerReason};
use super::state::{CorrelationState, Counters};
use super::waiter::ReplyWaiter;
use crate::error::Result;
use crate::notification::MissReason;
use crate::types::{CorrelatedReply, CorrelationId, WorkItem};

/// What one reconciliation run did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Ids holding a pending group at the start of the run.
    pub scanned: usize,
    /// Waiters signaled with a result.
    pub completed: Vec<CorrelationId>,
    /// Groups deleted from the store.
    pub deleted: Vec<CorrelationId>,
    /// Replies reported as missed.
    pub missed: usize,
    /// Waiters timed out by the monitor.
    pub expired: Vec<CorrelationId>,
    /// Ids whose reconciliation failed.
    pub failed: usize,
}

/// Matches buffered replies to waiters and collects stale groups.
#[derive(Clone)]
pub struct ReplyMonitor {
    state: Arc<CorrelationState>,
    tick: Arc<Mutex<()>>,
}

impl ReplyMonitor {
    pub(crate) fn new(state: Arc<CorrelationState>) -> Self {
        Self {
            state,
            tick: Arc::new(Mutex::new(())),
        }
    }

    /// Request an immediate run instead of waiting for the next tick.
    pub fn trigger(&self) {
        self.state.trigger.notify_one();
    }

    /// Spawn the scheduled loop. Exits once the correlator is stopped.
    pub(crate) fn spawn(&self, interval: Duration) -> JoinHandle<()> {
        let monitor = self.clone();
        let mut stopped = self.state.stopped.subscribe();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            debug!(interval_ms = interval.as_millis(), "Reply monitor started");
            loop {
                tokio::select! {
                    biased;
                    _ = stopped.wait_for(|stopped| *stopped) => break,
                    () = monitor.state.trigger.notified() => {}
                    _ = ticker.tick() => {}
                }
                monitor.run_once().await;
            }
            debug!("Reply monitor stopped");
        })
    }

    /// Run one reconciliation pass.
    pub async fn run_once(&self) -> TickReport {
        let _tick = self.tick.lock().await;
        let mut report = TickReport::default();

        let ids = self
            .state
            .store
            .all_keys()
            .await
            .or_default_logged(Vec::new());
        report.scanned = ids.len();

        for id in &ids {
            if let Err(e) = self.reconcile(id, &mut report).await {
                report.failed = report.failed.saturating_add(1);
                warn!(correlation_id = %id, error = %e, "Failed to reconcile reply group");
            }
        }

        self.expire_waiters(&mut report);

        if report.scanned > 0 || !report.expired.is_empty() {
            trace!(
                scanned = report.scanned,
                completed = report.completed.len(),
                deleted = report.deleted.len(),
                missed = report.missed,
                expired = report.expired.len(),
                "Reply monitor tick"
            );
        }
        report
    }

    async fn reconcile(&self, id: &CorrelationId, report: &mut TickReport) -> Result<()> {
        let _stripe = self.state.stripes.lock(id).await;
        let Some(mut group) = self.state.store.retrieve(id).await? else {
            return Ok(());
        };

        if let Some(reason) = self.state.markers.get(id) {
            let stale = group.drain();
            self.state.store.remove(id).await?;
            report.deleted.push(id.clone());
            for reply in stale {
                self.miss(id, reply, MissReason::AlreadyFinished(reason), report);
            }
            return Ok(());
        }

        let Some(waiter) = self.state.waiter(id) else {
            if group.age() >= self.state.config.orphan_ttl() {
                let orphans = group.drain();
                self.state.store.remove(id).await?;
                report.deleted.push(id.clone());
                for reply in orphans {
                    self.miss(id, reply, MissReason::Orphaned, report);
                }
            }
            return Ok(());
        };

        let mut result = None;
        while let Some(reply) = group.pop_front() {
            if let Some(done) = waiter.accept(reply) {
                result = Some(done);
                break;
            }
        }

        let leftovers = group.drain();
        self.state.store.remove(id).await?;
        report.deleted.push(id.clone());

        if let Some(result) = result {
            self.complete(&waiter, result, report);
            for reply in leftovers {
                self.miss(id, reply, MissReason::Surplus, report);
            }
        } else if self.state.is_registered(&waiter) {
            debug!(
                correlation_id = %id,
                collected = waiter.collected(),
                expected = waiter.expected_group_size(),
                "Partial reply group buffered"
            );
        } else {
            // The dispatch left while the group was being applied.
            for reply in waiter.take_parts() {
                self.miss(id, reply, MissReason::Abandoned, report);
            }
        }
        Ok(())
    }

    fn complete(&self, waiter: &ReplyWaiter, result: CorrelatedReply, report: &mut TickReport) {
        let id = waiter.correlation_id();
        if let Err(e) = self.state.store_result(id, result.clone()) {
            Counters::bump(&self.state.counters.duplicates);
            error!(correlation_id = %id, error = %e, "Discarding duplicate result");
            return;
        }

        match self.state.markers.record(id, MarkerReason::Completed) {
            MarkOutcome::Recorded => {
                debug!(correlation_id = %id, replies = result.len(), "Reply matched");
                report.completed.push(id.clone());
                waiter.signal();
            }
            MarkOutcome::AlreadyMarked(reason) => {
                // The dispatch already gave up; the result must not be delivered.
                self.state.take_result(id);
                for reply in result.into_items() {
                    self.miss(id, reply, MissReason::AlreadyFinished(reason), report);
                }
            }
        }
    }

    /// Time out waiters whose dispatch should have given up by now.
    fn expire_waiters(&self, report: &mut TickReport) {
        let overdue_after = self.state.config.grace_period();
        let now = Instant::now();

        for waiter in self.state.waiters() {
            let overdue = waiter
                .deadline()
                .and_then(|deadline| deadline.checked_add(overdue_after))
                .is_some_and(|overdue_at| now >= overdue_at);
            let id = waiter.correlation_id();
            if !overdue || self.state.has_result(id) {
                continue;
            }
            if self.state.markers.record(id, MarkerReason::TimedOut) == MarkOutcome::Recorded {
                warn!(correlation_id = %id, "Expired stalled reply waiter");
                report.expired.push(id.clone());
                for reply in waiter.take_parts() {
                    self.miss(
                        id,
                        reply,
                        MissReason::AlreadyFinished(MarkerReason::TimedOut),
                        report,
                    );
                }
            }
            waiter.signal();
        }
    }

    fn miss(
        &self,
        id: &CorrelationId,
        reply: WorkItem,
        reason: MissReason,
        report: &mut TickReport,
    ) {
        warn!(correlation_id = %id, reply_id = %reply.id(), reason = %reason, "Missed async reply");
        report.missed = report.missed.saturating_add(1);
        self.state.report_missed(id, reply, reason);
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use std::sync::atomic::Ordering;

    use super::*;
    use crate::config::CorrelatorConfig;
    use crate::correlation::hooks::ItemCorrelation;
    use crate::correlation::store::{InMemoryReplyStore, PendingReplyGroup};
    use crate::notification::TracingSink;
    use crate::types::GroupCorrelation;

    fn state(config: CorrelatorConfig) -> Arc<CorrelationState> {
        Arc::new(CorrelationState::new(
            config,
            Arc::new(InMemoryReplyStore::new()),
            Arc::new(ItemCorrelation),
            Arc::new(TracingSink),
        ))
    }

    fn reply(id: &str) -> WorkItem {
        WorkItem::new(serde_json::json!({"for": id})).with_correlation_id(id)
    }

    #[tokio::test]
    async fn test_reply_without_waiter_stays_buffered() {
        let state = state(CorrelatorConfig::default());
        let monitor = ReplyMonitor::new(Arc::clone(&state));
        state.accept_reply(reply("early")).await.unwrap();

        let report = monitor.run_once().await;

        assert_eq!(report.scanned, 1);
        assert!(report.deleted.is_empty());
        assert!(state.store.contains(&"early".into()).await.unwrap());
    }

    #[tokio::test]
    async fn test_reply_completes_live_waiter() {
        let state = state(CorrelatorConfig::default());
        let monitor = ReplyMonitor::new(Arc::clone(&state));
        let request = WorkItem::new(serde_json::json!(null)).with_correlation_id("xyz");
        let _waiter = state.register_waiter(&request).unwrap();
        state.accept_reply(reply("xyz")).await.unwrap();

        let report = monitor.run_once().await;

        assert_eq!(report.completed, vec![CorrelationId::new("xyz")]);
        assert_eq!(
            state.markers.get(&"xyz".into()),
            Some(MarkerReason::Completed)
        );
        assert!(state.take_result(&"xyz".into()).is_some());
        assert!(!state.store.contains(&"xyz".into()).await.unwrap());
    }

    #[tokio::test]
    async fn test_reply_for_finished_id_is_missed() {
        let state = state(CorrelatorConfig::default());
        let monitor = ReplyMonitor::new(Arc::clone(&state));
        state.markers.record(&"late".into(), MarkerReason::TimedOut);
        state.accept_reply(reply("late")).await.unwrap();

        let report = monitor.run_once().await;

        assert_eq!(report.missed, 1);
        assert_eq!(report.deleted, vec![CorrelationId::new("late")]);
        assert_eq!(state.counters.missed.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_surplus_sequence_parts_are_missed() {
        let state = state(CorrelatorConfig::default());
        let monitor = ReplyMonitor::new(Arc::clone(&state));
        let request = WorkItem::new(serde_json::json!(null))
            .with_correlation_id("dup")
            .with_group(GroupCorrelation::new(2, 0));
        let _waiter = state.register_waiter(&request).unwrap();
        for sequence in [2, 1] {
            state
                .accept_reply(reply("dup").with_group(GroupCorrelation::new(2, sequence)))
                .await
                .unwrap();
        }

        let report = monitor.run_once().await;

        assert_eq!(report.completed.len(), 1);
        assert_eq!(report.missed, 1);
    }

    #[tokio::test]
    async fn test_single_reply_supersedes_buffered_reply() {
        let state = state(CorrelatorConfig::default());
        let monitor = ReplyMonitor::new(Arc::clone(&state));
        state
            .accept_reply(reply("twice").with_metadata("n", "1"))
            .await
            .unwrap();
        state
            .accept_reply(reply("twice").with_metadata("n", "2"))
            .await
            .unwrap();
        assert_eq!(state.counters.missed.load(Ordering::Relaxed), 1);

        let request = WorkItem::new(serde_json::json!(null)).with_correlation_id("twice");
        let _waiter = state.register_waiter(&request).unwrap();
        monitor.run_once().await;

        let result = state.take_result(&"twice".into()).unwrap();
        assert_eq!(
            result.reply().metadata().get("n").map(String::as_str),
            Some("2")
        );
    }

    #[tokio::test]
    async fn test_orphaned_group_is_collected() {
        let config = CorrelatorConfig {
            orphan_ttl_ms: 0,
            ..CorrelatorConfig::default()
        };
        let state = state(config);
        let monitor = ReplyMonitor::new(Arc::clone(&state));
        state
            .store
            .store(PendingReplyGroup::new("orphan".into()).with_reply(reply("orphan")))
            .await
            .unwrap();

        let report = monitor.run_once().await;

        assert_eq!(report.missed, 1);
        assert!(!state.store.contains(&"orphan".into()).await.unwrap());
    }

    #[tokio::test]
    async fn test_partial_sequence_keeps_waiter_pending() {
        let state = state(CorrelatorConfig::default());
        let monitor = ReplyMonitor::new(Arc::clone(&state));
        let request = WorkItem::new(serde_json::json!(null))
            .with_correlation_id("seq")
            .with_group(GroupCorrelation::new(2, 0));
        let waiter = state.register_waiter(&request).unwrap();

        state
            .accept_reply(reply("seq").with_group(GroupCorrelation::new(2, 1)))
            .await
            .unwrap();
        let report = monitor.run_once().await;
        assert!(report.completed.is_empty());
        assert_eq!(waiter.collected(), 1);

        state
            .accept_reply(reply("seq").with_group(GroupCorrelation::new(2, 2)))
            .await
            .unwrap();
        let report = monitor.run_once().await;
        assert_eq!(report.completed, vec![CorrelationId::new("seq")]);
        assert_eq!(state.take_result(&"seq".into()).map(|r| r.len()), Some(2));
    }

    #[tokio::test]
    async fn test_result_losing_to_timeout_is_missed() {
        let state = state(CorrelatorConfig::default());
        let monitor = ReplyMonitor::new(Arc::clone(&state));
        let request = WorkItem::new(serde_json::json!(null)).with_correlation_id("race");
        let waiter = state.register_waiter(&request).unwrap();
        state.markers.record(&"race".into(), MarkerReason::TimedOut);

        let mut report = TickReport::default();
        monitor.complete(
            &waiter,
            CorrelatedReply::single("race".into(), reply("race")),
            &mut report,
        );

        assert!(report.completed.is_empty());
        assert_eq!(report.missed, 1);
        assert!(!state.has_result(&"race".into()));
    }

    #[tokio::test]
    async fn test_stalled_waiter_is_expired() {
        let config = CorrelatorConfig {
            reply_timeout_ms: 1,
            grace_period_ms: 1,
            ..CorrelatorConfig::default()
        };
        let state = state(config);
        let monitor = ReplyMonitor::new(Arc::clone(&state));
        let request = WorkItem::new(serde_json::json!(null)).with_correlation_id("stalled");
        let _waiter = state.register_waiter(&request).unwrap();

        tokio::time::sleep(Duration::from_millis(20)).await;
        let report = monitor.run_once().await;

        assert_eq!(report.expired, vec![CorrelationId::new("stalled")]);
        assert_eq!(
            state.markers.get(&"stalled".into()),
            Some(MarkerReason::TimedOut)
        );
    }

    #[tokio::test]
    async fn test_expired_sequence_releases_buffered_parts() {
        let config = CorrelatorConfig {
            reply_timeout_ms: 100,
            grace_period_ms: 1,
            ..CorrelatorConfig::default()
        };
        let state = state(config);
        let monitor = ReplyMonitor::new(Arc::clone(&state));
        let request = WorkItem::new(serde_json::json!(null))
            .with_correlation_id("stuck")
            .with_group(GroupCorrelation::new(3, 0));
        let waiter = state.register_waiter(&request).unwrap();
        for sequence in [1, 2] {
            state
                .accept_reply(reply("stuck").with_group(GroupCorrelation::new(3, sequence)))
                .await
                .unwrap();
        }
        monitor.run_once().await;
        assert_eq!(waiter.collected(), 2);

        tokio::time::sleep(Duration::from_millis(250)).await;
        let report = monitor.run_once().await;

        assert_eq!(report.expired, vec![CorrelationId::new("stuck")]);
        assert_eq!(report.missed, 2);
        assert_eq!(waiter.collected(), 0);
        assert_eq!(state.counters.missed.load(Ordering::Relaxed), 2);
    }
}
