//! Asynchronous request/reply correlation.
//!
//! `dispatch` registers a waiter, sends the request one way, and suspends
//! until the monitor matches a reply or the timeout (plus one grace window)
//! runs out. Timeout and completion race through the processed marker ring:
//! whichever records its marker first decides the outcome.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use courier_core::ResultExt;

use super::hooks::{CorrelationMapping, DefaultSessionMerge, ItemCorrelation, SessionMerge};
use super::markers::{MarkOutcome, MarkerReason, ProcessedMarker};
use super::monitor::{ReplyMonitor, TickReport};
use super::state::{CorrelationState, CorrelatorStats, Counters};
use super::store::{InMemoryReplyStore, ReplyStore};
use super::waiter::ReplyWaiter;
use crate::config::CorrelatorConfig;
use crate::error::{Error, Result};
use crate::notification::{MissReason, Notification, NotificationSink, TracingSink};
use crate::sink::{DispatchSink, OutputSink};
use crate::types::{CorrelatedReply, CorrelationId, WorkItem};

enum Wake {
    Signaled,
    Elapsed,
    Stopped,
}

enum Settled {
    Delivered(CorrelatedReply),
    TimedOut,
}

/// Removes the waiter and any unclaimed result when `dispatch` finishes or
/// its future is dropped.
struct WaiterGuard<'a> {
    state: &'a CorrelationState,
    waiter: Arc<ReplyWaiter>,
}

impl Drop for WaiterGuard<'_> {
    fn drop(&mut self) {
        self.state.remove_waiter(&self.waiter);
        let reason = self
            .state
            .markers
            .get(self.waiter.correlation_id())
            .map_or(MissReason::Abandoned, MissReason::AlreadyFinished);
        self.state.release_parts(&self.waiter, reason);
        if self
            .state
            .take_result(self.waiter.correlation_id())
            .is_some()
        {
            debug!(
                correlation_id = %self.waiter.correlation_id(),
                "Discarded result of abandoned dispatch"
            );
        }
    }
}

/// Builder for [`AsyncReplyCorrelator`].
pub struct CorrelatorBuilder {
    sink: Arc<dyn DispatchSink>,
    config: CorrelatorConfig,
    store: Option<Arc<dyn ReplyStore>>,
    notifications: Arc<dyn NotificationSink>,
    mapping: Arc<dyn CorrelationMapping>,
    session_merge: Arc<dyn SessionMerge>,
}

impl CorrelatorBuilder {
    #[must_use]
    pub fn config(mut self, config: CorrelatorConfig) -> Self {
        self.config = config;
        self
    }

    #[must_use]
    pub fn store(mut self, store: Arc<dyn ReplyStore>) -> Self {
        self.store = Some(store);
        self
    }

    #[must_use]
    pub fn notifications(mut self, notifications: Arc<dyn NotificationSink>) -> Self {
        self.notifications = notifications;
        self
    }

    #[must_use]
    pub fn mapping(mut self, mapping: Arc<dyn CorrelationMapping>) -> Self {
        self.mapping = mapping;
        self
    }

    #[must_use]
    pub fn session_merge(mut self, session_merge: Arc<dyn SessionMerge>) -> Self {
        self.session_merge = session_merge;
        self
    }

    #[must_use]
    pub fn build(self) -> AsyncReplyCorrelator {
        let store = self
            .store
            .unwrap_or_else(|| Arc::new(InMemoryReplyStore::new()));
        let state = Arc::new(CorrelationState::new(
            self.config,
            store,
            self.mapping,
            self.notifications,
        ));
        AsyncReplyCorrelator {
            monitor: ReplyMonitor::new(Arc::clone(&state)),
            state,
            sink: self.sink,
            session_merge: self.session_merge,
            monitor_task: Mutex::new(None),
        }
    }
}

/// Bridges a one-way dispatch to an out-of-band reply channel.
pub struct AsyncReplyCorrelator {
    state: Arc<CorrelationState>,
    sink: Arc<dyn DispatchSink>,
    session_merge: Arc<dyn SessionMerge>,
    monitor: ReplyMonitor,
    monitor_task: Mutex<Option<JoinHandle<()>>>,
}

impl AsyncReplyCorrelator {
    /// Start building a correlator that sends requests to `sink`.
    #[must_use]
    pub fn builder(sink: Arc<dyn DispatchSink>) -> CorrelatorBuilder {
        CorrelatorBuilder {
            sink,
            config: CorrelatorConfig::default(),
            store: None,
            notifications: Arc::new(TracingSink),
            mapping: Arc::new(ItemCorrelation),
            session_merge: Arc::new(DefaultSessionMerge),
        }
    }

    /// Start the reply monitor. Must be called from within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` if the correlator is already running.
    pub fn start(&self) -> Result<()> {
        let mut task = self.monitor_task.lock();
        if task.is_some() {
            return Err(Error::invalid_state("correlator is already running"));
        }
        self.state.stopped.send_replace(false);
        *task = Some(self.monitor.spawn(self.state.config.monitor_interval()));
        info!(
            reply_timeout_ms = self.state.config.reply_timeout_ms,
            monitor_interval_ms = self.state.config.monitor_interval_ms,
            "Correlator started"
        );
        Ok(())
    }

    /// Stop the monitor and release every waiting dispatch with no reply.
    ///
    /// Replies still buffered are reported missed and unclaimed results are
    /// dropped, so a restarted correlator begins empty.
    pub async fn stop(&self) {
        self.state.stopped.send_replace(true);
        let task = self.monitor_task.lock().take();
        let Some(task) = task else {
            return;
        };
        if let Err(e) = task.await {
            warn!(error = %e, "Reply monitor task ended abnormally");
        }
        let released = self
            .state
            .release_pending(MissReason::Stopped)
            .await
            .or_default_logged(0);
        let dropped_results = self.state.clear_results();
        info!(released, dropped_results, "Correlator stopped");
    }

    /// Number of correlation ids with replies buffered in the store.
    ///
    /// # Errors
    ///
    /// Returns an error if the reply store fails.
    pub async fn pending_groups(&self) -> Result<usize> {
        Ok(self.state.store.all_keys().await?.len())
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        !self.state.is_stopped()
    }

    /// Send `request` and wait for its correlated reply.
    ///
    /// Returns `Ok(None)` when the correlator stops while waiting, or on
    /// timeout when `fail_on_timeout` is off.
    ///
    /// # Errors
    ///
    /// - `InvalidState` if the correlator is not running
    /// - `CorrelationAlreadyProcessed` if the id already reached a terminal state
    /// - `WaiterExists` if another dispatch is waiting on the same id
    /// - `Dispatch` if the sink refuses the request
    /// - `ResponseTimeout` if no reply arrives in time and `fail_on_timeout` is set
    pub async fn dispatch(&self, request: WorkItem) -> Result<Option<CorrelatedReply>> {
        if self.state.is_stopped() {
            return Err(Error::invalid_state("correlator is not running"));
        }

        let correlation_id = self.state.mapping.correlation_id(&request);
        if let Some(reason) = self.state.markers.get(&correlation_id) {
            return Err(Error::CorrelationAlreadyProcessed {
                correlation_id,
                reason,
            });
        }

        let waiter = self.state.register_waiter(&request)?;
        let _guard = WaiterGuard {
            state: &self.state,
            waiter: Arc::clone(&waiter),
        };
        let request_propagates = request.propagate_session();
        let request_session = request.session().clone();

        debug!(correlation_id = %correlation_id, item_id = %request.id(), "Dispatching request");
        let started = Instant::now();
        self.sink
            .send(request)
            .await
            .map_err(|e| Error::dispatch(e.to_string()))?;

        if matches!(self.await_reply(&waiter).await, Wake::Stopped) {
            debug!(correlation_id = %correlation_id, "Dispatch released by stop");
            return Ok(None);
        }

        match self.settle(&waiter).await {
            Settled::Delivered(reply) => {
                Counters::bump(&self.state.counters.delivered);
                debug!(
                    correlation_id = %correlation_id,
                    elapsed_ms = elapsed_ms(started),
                    "Reply delivered"
                );
                let propagates = request_propagates || reply.reply().propagate_session();
                let reply = if propagates {
                    reply.map_last(|last| self.session_merge.merge(&request_session, last))
                } else {
                    reply
                };
                Ok(Some(reply))
            }
            Settled::TimedOut => {
                let waited_ms = elapsed_ms(started);
                Counters::bump(&self.state.counters.timed_out);
                self.state.notifications.notify(Notification::ReplyTimeout {
                    correlation_id: correlation_id.clone(),
                    waited_ms,
                });
                if self.state.config.fail_on_timeout {
                    Err(Error::ResponseTimeout {
                        correlation_id,
                        waited_ms,
                    })
                } else {
                    Ok(None)
                }
            }
        }
    }

    async fn await_reply(&self, waiter: &ReplyWaiter) -> Wake {
        let mut stopped = self.state.stopped.subscribe();
        let Some(timeout) = self.state.config.reply_timeout() else {
            return tokio::select! {
                () = waiter.signaled() => Wake::Signaled,
                _ = stopped.wait_for(|stopped| *stopped) => Wake::Stopped,
            };
        };

        match wait_window(waiter, &mut stopped, timeout).await {
            Wake::Elapsed => {}
            woke => return woke,
        }

        let grace = self.state.config.grace_period();
        debug!(
            correlation_id = %waiter.correlation_id(),
            grace_ms = self.state.config.grace_period_ms,
            "No reply yet, retrying within grace period"
        );
        self.monitor.trigger();
        wait_window(waiter, &mut stopped, grace).await
    }

    /// Decide the outcome once waiting is over; exactly one side wins.
    ///
    /// Runs under the id's stripe so the monitor cannot feed the waiter
    /// while a timed-out sequence releases its parts.
    async fn settle(&self, waiter: &ReplyWaiter) -> Settled {
        let id = waiter.correlation_id();
        let _stripe = self.state.stripes.lock(id).await;
        if let Some(reply) = self.state.take_result(id) {
            return Settled::Delivered(reply);
        }
        match self.state.markers.record(id, MarkerReason::TimedOut) {
            MarkOutcome::Recorded => {
                warn!(correlation_id = %id, "No reply within timeout and grace period");
                self.release_timed_out(waiter);
                Settled::TimedOut
            }
            MarkOutcome::AlreadyMarked(MarkerReason::Completed) => self
                .state
                .take_result(id)
                .map_or(Settled::TimedOut, Settled::Delivered),
            MarkOutcome::AlreadyMarked(MarkerReason::TimedOut) => {
                self.release_timed_out(waiter);
                Settled::TimedOut
            }
        }
    }

    fn release_timed_out(&self, waiter: &ReplyWaiter) {
        self.state.release_parts(
            waiter,
            MissReason::AlreadyFinished(MarkerReason::TimedOut),
        );
    }

    /// Feed a reply from the reply-side source.
    ///
    /// # Errors
    ///
    /// Returns an error if the reply store fails.
    pub async fn on_reply_received(&self, reply: WorkItem) -> Result<()> {
        self.state.accept_reply(reply).await
    }

    /// An [`OutputSink`] that feeds this correlator's reply intake.
    #[must_use]
    pub fn reply_intake(&self) -> ReplyIntake {
        ReplyIntake {
            state: Arc::clone(&self.state),
        }
    }

    /// Run one reconciliation pass now.
    pub async fn reconcile(&self) -> TickReport {
        self.monitor.run_once().await
    }

    #[must_use]
    pub const fn monitor(&self) -> &ReplyMonitor {
        &self.monitor
    }

    #[must_use]
    pub fn marker(&self, id: &CorrelationId) -> Option<MarkerReason> {
        self.state.markers.get(id)
    }

    #[must_use]
    pub fn markers(&self) -> Vec<ProcessedMarker> {
        self.state.markers.snapshot()
    }

    #[must_use]
    pub fn stats(&self) -> CorrelatorStats {
        self.state.stats()
    }

    #[must_use]
    pub fn config(&self) -> &CorrelatorConfig {
        &self.state.config
    }
}

/// Reply-side entry point handed to whatever produces replies.
#[derive(Clone)]
pub struct ReplyIntake {
    state: Arc<CorrelationState>,
}

#[async_trait]
impl OutputSink for ReplyIntake {
    async fn emit(&self, item: WorkItem) -> Result<()> {
        self.state.accept_reply(item).await
    }
}

async fn wait_window(
    waiter: &ReplyWaiter,
    stopped: &mut watch::Receiver<bool>,
    window: Duration,
) -> Wake {
    tokio::select! {
        () = waiter.signaled() => Wake::Signaled,
        _ = stopped.wait_for(|stopped| *stopped) => Wake::Stopped,
        () = tokio::time::sleep(window) => Wake::Elapsed,
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}
