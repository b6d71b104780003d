//! SEDA worker pool: a bounded queue drained by N worker tasks.
//!
//! Lifecycle state lives in a `watch` channel. Paused workers park in
//! `wait_for` until the state moves on, and a state change interrupts an
//! idle queue poll.

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use super::queue::WorkQueue;
use super::unit::ExecutionMode;
use crate::config::WorkerPoolConfig;
use crate::error::{Error, Result};
use crate::notification::{Notification, NotificationSink, TracingSink};
use crate::sink::{DispatchSink, OutputSink};
use crate::types::WorkItem;

/// Lifecycle state of a [`WorkerPool`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolState {
    Stopped,
    Running,
    Paused,
    /// Finishing queued work before stopping.
    Draining,
    Disposed,
}

impl PoolState {
    /// Whether `enqueue` accepts new items.
    #[must_use]
    pub const fn accepts_work(self) -> bool {
        matches!(self, Self::Running | Self::Paused)
    }
}

impl std::fmt::Display for PoolState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Stopped => write!(f, "stopped"),
            Self::Running => write!(f, "running"),
            Self::Paused => write!(f, "paused"),
            Self::Draining => write!(f, "draining"),
            Self::Disposed => write!(f, "disposed"),
        }
    }
}

/// Point-in-time pool counters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub state: PoolState,
    pub mode: &'static str,
    pub processed: u64,
    pub failed: u64,
    pub exhausted: u64,
    pub abandoned: u64,
    pub queue_depth: usize,
    pub queue_capacity: usize,
}

#[derive(Debug, Default)]
struct PoolCounters {
    processed: AtomicU64,
    failed: AtomicU64,
    exhausted: AtomicU64,
    abandoned: AtomicU64,
}

struct PoolInner {
    config: WorkerPoolConfig,
    mode: ExecutionMode,
    queue: WorkQueue,
    state: watch::Sender<PoolState>,
    notifications: Arc<dyn NotificationSink>,
    output: RwLock<Option<Arc<dyn OutputSink>>>,
    counters: PoolCounters,
}

/// Builder for [`WorkerPool`].
pub struct WorkerPoolBuilder {
    mode: ExecutionMode,
    config: WorkerPoolConfig,
    notifications: Arc<dyn NotificationSink>,
    output: Option<Arc<dyn OutputSink>>,
}

impl WorkerPoolBuilder {
    #[must_use]
    pub fn config(mut self, config: WorkerPoolConfig) -> Self {
        self.config = config;
        self
    }

    #[must_use]
    pub fn notifications(mut self, notifications: Arc<dyn NotificationSink>) -> Self {
        self.notifications = notifications;
        self
    }

    #[must_use]
    pub fn output(mut self, output: Arc<dyn OutputSink>) -> Self {
        self.output = Some(output);
        self
    }

    #[must_use]
    pub fn build(self) -> WorkerPool {
        let (state, _) = watch::channel(PoolState::Stopped);
        WorkerPool {
            inner: Arc::new(PoolInner {
                queue: WorkQueue::new(self.config.queue_capacity),
                config: self.config,
                mode: self.mode,
                state,
                notifications: self.notifications,
                output: RwLock::new(self.output),
                counters: PoolCounters::default(),
            }),
            workers: Mutex::new(Vec::new()),
        }
    }
}

/// Bounded queue plus worker tasks executing items on processing units.
pub struct WorkerPool {
    inner: Arc<PoolInner>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    #[must_use]
    pub fn builder(mode: ExecutionMode) -> WorkerPoolBuilder {
        WorkerPoolBuilder {
            mode,
            config: WorkerPoolConfig::default(),
            notifications: Arc::new(TracingSink),
            output: None,
        }
    }

    /// Route unit output to `output` from now on.
    pub fn set_output(&self, output: Arc<dyn OutputSink>) {
        *self.inner.output.write() = Some(output);
    }

    #[must_use]
    pub fn state(&self) -> PoolState {
        *self.inner.state.borrow()
    }

    /// Subscribe to lifecycle changes.
    #[must_use]
    pub fn watch_state(&self) -> watch::Receiver<PoolState> {
        self.inner.state.subscribe()
    }

    /// Prepare the execution mode and spawn the workers.
    ///
    /// On a preparation failure the pool is disposed.
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` unless the pool is stopped, or the error that
    /// made preparation fail.
    pub async fn start(&self) -> Result<()> {
        match self.state() {
            PoolState::Stopped => {}
            other => {
                return Err(Error::invalid_state(format!(
                    "cannot start worker pool while {other}"
                )));
            }
        }

        if let Err(e) = self.inner.mode.prepare(self.inner.config.initialisation).await {
            error!(error = %e, mode = self.inner.mode.name(), "Worker pool failed to start");
            self.dispose().await;
            return Err(e);
        }

        self.inner.state.send_replace(PoolState::Running);
        let mut workers = self.workers.lock();
        workers.extend((0..self.inner.config.concurrency).map(|worker| {
            let inner = Arc::clone(&self.inner);
            tokio::spawn(async move { inner.run_worker(worker).await })
        }));
        info!(
            concurrency = self.inner.config.concurrency,
            queue_capacity = self.inner.queue.capacity(),
            mode = self.inner.mode.name(),
            "Worker pool started"
        );
        Ok(())
    }

    /// Stop the workers and wait for every one of them to exit.
    ///
    /// A graceful stop drains the queue first; otherwise queued items are
    /// abandoned. In-flight items always finish.
    pub async fn stop(&self, graceful: bool) {
        let target = if graceful {
            PoolState::Draining
        } else {
            PoolState::Stopped
        };
        let stopping = self.inner.state.send_if_modified(|state| {
            if state.accepts_work() {
                *state = target;
                true
            } else {
                false
            }
        });
        if !stopping {
            return;
        }
        info!(graceful, depth = self.inner.queue.depth(), "Stopping worker pool");

        let workers = std::mem::take(&mut *self.workers.lock());
        for worker in workers {
            if let Err(e) = worker.await {
                warn!(error = %e, "Worker task ended abnormally");
            }
        }

        let abandoned = self.inner.queue.drain_abandoned().await;
        if abandoned > 0 {
            self.inner
                .counters
                .abandoned
                .fetch_add(u64::try_from(abandoned).unwrap_or(u64::MAX), Ordering::Relaxed);
            warn!(abandoned, "Abandoned queued work items");
        }

        self.inner.state.send_replace(PoolState::Stopped);
        info!("Worker pool stopped");
    }

    /// Park workers before their next dequeue.
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` unless the pool is running or paused.
    pub fn pause(&self) -> Result<()> {
        self.transition(PoolState::Running, PoolState::Paused)
    }

    /// Release paused workers.
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` unless the pool is paused or running.
    pub fn resume(&self) -> Result<()> {
        self.transition(PoolState::Paused, PoolState::Running)
    }

    fn transition(&self, from: PoolState, to: PoolState) -> Result<()> {
        let mut current = to;
        self.inner.state.send_if_modified(|state| {
            current = *state;
            if *state == from {
                *state = to;
                true
            } else {
                false
            }
        });
        if current == from {
            debug!(from = %from, to = %to, "Worker pool state changed");
            Ok(())
        } else if current == to {
            Ok(())
        } else {
            Err(Error::invalid_state(format!(
                "cannot move worker pool from {current} to {to}"
            )))
        }
    }

    /// Stop immediately if needed and release every processing unit.
    /// Safe to call more than once.
    pub async fn dispose(&self) {
        if self.state().accepts_work() {
            self.stop(false).await;
        }
        let first = self.inner.state.send_if_modified(|state| {
            if *state == PoolState::Disposed {
                false
            } else {
                *state = PoolState::Disposed;
                true
            }
        });
        if first {
            self.inner.mode.dispose().await;
            info!("Worker pool disposed");
        }
    }

    /// Queue an item for processing.
    ///
    /// # Errors
    ///
    /// - `QueueClosed` if the pool is not accepting work
    /// - `QueueTimeout` if a blocking enqueue found no space in time
    /// - `QueueFull` if the queue is full and the overflow policy rejects
    pub async fn enqueue(&self, item: WorkItem) -> Result<()> {
        let state = self.state();
        if !state.accepts_work() {
            return Err(Error::QueueClosed {
                state: state.to_string(),
            });
        }
        trace!(item_id = %item.id(), "Enqueueing work item");
        self.inner
            .queue
            .push(
                item,
                self.inner.config.overflow,
                self.inner.config.enqueue_timeout(),
            )
            .await
    }

    #[must_use]
    pub fn stats(&self) -> PoolStats {
        let counters = &self.inner.counters;
        PoolStats {
            state: self.state(),
            mode: self.inner.mode.name(),
            processed: counters.processed.load(Ordering::Relaxed),
            failed: counters.failed.load(Ordering::Relaxed),
            exhausted: counters.exhausted.load(Ordering::Relaxed),
            abandoned: counters.abandoned.load(Ordering::Relaxed),
            queue_depth: self.inner.queue.depth(),
            queue_capacity: self.inner.queue.capacity(),
        }
    }

    #[must_use]
    pub fn config(&self) -> &WorkerPoolConfig {
        &self.inner.config
    }
}

#[async_trait]
impl DispatchSink for WorkerPool {
    async fn send(&self, item: WorkItem) -> Result<()> {
        self.enqueue(item).await
    }
}

impl PoolInner {
    async fn run_worker(&self, worker: usize) {
        let mut state = self.state.subscribe();
        debug!(worker, "Worker started");

        loop {
            let current = match state.wait_for(|s| *s != PoolState::Paused).await {
                Ok(current) => *current,
                Err(_) => break,
            };
            match current {
                PoolState::Running | PoolState::Paused => {}
                PoolState::Draining if self.queue.is_empty() => break,
                PoolState::Draining => {}
                PoolState::Stopped | PoolState::Disposed => break,
            }

            let next = tokio::select! {
                biased;
                _ = state.changed() => continue,
                item = self.queue.poll(self.config.poll_timeout()) => item,
            };
            if let Some(item) = next {
                self.execute(worker, item).await;
            }
        }

        debug!(worker, "Worker exited");
    }

    async fn execute(&self, worker: usize, item: WorkItem) {
        trace!(worker, item_id = %item.id(), "Processing work item");
        let unit = match self.mode.acquire().await {
            Ok(unit) => unit,
            Err(e) => {
                if matches!(e, Error::PoolExhausted { .. }) {
                    self.counters.exhausted.fetch_add(1, Ordering::Relaxed);
                }
                self.report_failure(Some(&item), e);
                return;
            }
        };

        let outcome = AssertUnwindSafe(unit.process(&item)).catch_unwind().await;
        let healthy = match outcome {
            Ok(Ok(output)) => {
                self.counters.processed.fetch_add(1, Ordering::Relaxed);
                if let Some(output) = output {
                    self.forward(&item, output).await;
                }
                true
            }
            Ok(Err(e)) => {
                self.report_failure(Some(&item), e);
                true
            }
            Err(panic) => {
                let reason = format!("processing unit panicked: {}", panic_message(&*panic));
                self.report_failure(Some(&item), Error::unit(reason));
                false
            }
        };
        unit.release(healthy).await;
    }

    async fn forward(&self, item: &WorkItem, output: WorkItem) {
        let sink = self.output.read().clone();
        match sink {
            Some(sink) => {
                if let Err(e) = sink.emit(output).await {
                    self.report_failure(Some(item), e);
                }
            }
            None => trace!(item_id = %item.id(), "No output sink, dropping unit output"),
        }
    }

    fn report_failure(&self, item: Option<&WorkItem>, error: Error) {
        if matches!(*self.state.borrow(), PoolState::Stopped | PoolState::Disposed) {
            debug!(error = %error, "Ignoring failure raised while stopping");
            return;
        }
        self.counters.failed.fetch_add(1, Ordering::Relaxed);
        let retryable = error.is_retryable();
        warn!(
            item_id = item.map(|i| i.id().to_string()).unwrap_or_default(),
            error = %error,
            retryable,
            "Work item failed"
        );
        self.notifications.notify(Notification::ProcessingFailed {
            item: item.map(|i| Box::new(i.clone())),
            error: Arc::new(error),
            retryable,
        });
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    panic
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}
