// Common test infrastructure for courier-engine integration tests

#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use courier_engine::{
    AsyncReplyCorrelator, CorrelatorConfig, DispatchSink, GroupCorrelation, ProcessingUnit,
    Result, WorkItem,
};
use tokio::sync::mpsc;

/// Dispatch sink that hands every request to the test through a channel.
pub struct ChannelSink {
    requests: mpsc::UnboundedSender<WorkItem>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<WorkItem>) {
        let (requests, rx) = mpsc::unbounded_channel();
        (Self { requests }, rx)
    }
}

#[async_trait]
impl DispatchSink for ChannelSink {
    async fn send(&self, item: WorkItem) -> Result<()> {
        self.requests
            .send(item)
            .map_err(|e| courier_engine::Error::dispatch(e.to_string()))
    }
}

/// Correlator wired to a [`ChannelSink`]; callers start it.
pub fn correlator(
    config: CorrelatorConfig,
) -> (Arc<AsyncReplyCorrelator>, mpsc::UnboundedReceiver<WorkItem>) {
    let (sink, requests) = ChannelSink::new();
    let correlator = Arc::new(
        AsyncReplyCorrelator::builder(Arc::new(sink))
            .config(config)
            .build(),
    );
    (correlator, requests)
}

/// Route engine logs through the test harness; safe to call from every test.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("courier_engine=debug")
        .with_test_writer()
        .try_init();
}

/// Quick timings so tests finish fast.
pub fn fast_config() -> CorrelatorConfig {
    CorrelatorConfig {
        monitor_interval_ms: 10,
        ..CorrelatorConfig::default()
    }
    .with_reply_timeout(Some(Duration::from_millis(200)))
    .with_grace_period(Duration::from_millis(100))
}

pub fn request(id: &str) -> WorkItem {
    WorkItem::new(serde_json::json!({ "request": id })).with_correlation_id(id)
}

pub fn sequence_request(id: &str, group_size: u32) -> WorkItem {
    request(id).with_group(GroupCorrelation::new(group_size, 0))
}

pub fn part(request: &WorkItem, group_size: u32, sequence: u32) -> WorkItem {
    request
        .reply(serde_json::json!(sequence))
        .with_group(GroupCorrelation::new(group_size, sequence))
}

/// Replies with the request payload, optionally after a delay.
pub struct EchoUnit {
    pub delay: Duration,
    pub processed: AtomicUsize,
    in_flight: AtomicUsize,
    pub max_in_flight: AtomicUsize,
}

impl EchoUnit {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            processed: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    pub fn processed(&self) -> usize {
        self.processed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ProcessingUnit for EchoUnit {
    async fn process(&self, item: &WorkItem) -> Result<Option<WorkItem>> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst).saturating_add(1);
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.processed.fetch_add(1, Ordering::SeqCst);
        Ok(Some(item.reply(item.payload().clone())))
    }
}

/// Factory handing out [`EchoUnit`]s that share one set of counters.
pub struct SharedEchoFactory {
    pub unit: Arc<EchoUnit>,
}

struct SharedEcho(Arc<EchoUnit>);

#[async_trait]
impl ProcessingUnit for SharedEcho {
    async fn process(&self, item: &WorkItem) -> Result<Option<WorkItem>> {
        self.0.process(item).await
    }
}

#[async_trait]
impl courier_engine::UnitFactory for SharedEchoFactory {
    async fn create(&self) -> Result<Box<dyn ProcessingUnit>> {
        Ok(Box::new(SharedEcho(Arc::clone(&self.unit))))
    }
}
