//! CLI command handlers.

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use async_trait::async_trait;
use courier_engine::{
    EngineConfig, Error, ExecutionMode, Pipeline, ProcessingUnit, TracingSink, UnitFactory,
    WorkItem,
};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use tracing::{debug, info};

use crate::cli::{Commands, Mode};

/// Execute a CLI command.
pub async fn execute_command(command: Commands) -> Result<()> {
    match command {
        Commands::Run {
            config,
            requests,
            concurrency,
            timeout_ms,
            drop_every,
            delay_ms,
            mode,
        } => {
            let mut config = load_config(config.as_deref())?;
            if let Some(timeout_ms) = timeout_ms {
                config.correlator.reply_timeout_ms = timeout_ms;
            }
            config.validate().context("Invalid configuration")?;
            let echo = EchoFactory::new(drop_every, Duration::from_millis(delay_ms));
            let summary = cmd_run(&config, echo, mode, requests, concurrency).await?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
            Ok(())
        }
        Commands::Config { config, json } => {
            let config = load_config(config.as_deref())?;
            let rendered = if json {
                serde_json::to_string_pretty(&config)?
            } else {
                toml::to_string_pretty(&config).context("Failed to render configuration")?
            };
            println!("{rendered}");
            Ok(())
        }
    }
}

fn load_config(path: Option<&Path>) -> Result<EngineConfig> {
    match path {
        Some(path) => EngineConfig::load(path)
            .with_context(|| format!("Failed to load configuration from {}", path.display())),
        None => Ok(EngineConfig::default()),
    }
}

/// Outcome tally of a `run`.
#[derive(Debug, Default, Serialize)]
pub struct RunSummary {
    pub requests: usize,
    pub delivered: usize,
    pub no_reply: usize,
    pub timed_out: usize,
    pub failed: usize,
    pub elapsed_ms: u64,
    pub stats: Option<courier_engine::PipelineStats>,
}

async fn cmd_run(
    config: &EngineConfig,
    echo: EchoFactory,
    mode: Mode,
    requests: usize,
    concurrency: usize,
) -> Result<RunSummary> {
    let echo = Arc::new(echo);
    let mode = match mode {
        Mode::Pooled => ExecutionMode::pooled(echo, &config.pool),
        Mode::Singleton => ExecutionMode::singleton(Arc::new(echo.unit())),
        Mode::PerRequest => ExecutionMode::per_request(echo),
    };
    let pipeline = Pipeline::new(config, mode, Arc::new(TracingSink));
    pipeline.start().await.context("Failed to start pipeline")?;
    info!(requests, concurrency, "Dispatching requests");

    let started = Instant::now();
    let outcomes: Vec<_> = stream::iter(0..requests)
        .map(|n| {
            let request = WorkItem::new(serde_json::json!({ "n": n }))
                .with_correlation_id(format!("run-{n}"));
            pipeline.dispatch(request)
        })
        .buffer_unordered(concurrency.max(1))
        .collect()
        .await;

    let mut summary = RunSummary {
        requests,
        elapsed_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
        ..RunSummary::default()
    };
    for outcome in outcomes {
        let tally = match outcome {
            Ok(Some(_)) => &mut summary.delivered,
            Ok(None) => &mut summary.no_reply,
            Err(Error::ResponseTimeout { .. }) => &mut summary.timed_out,
            Err(e) => {
                debug!(error = %e, "Dispatch failed");
                &mut summary.failed
            }
        };
        *tally = tally.saturating_add(1);
    }

    pipeline.shutdown(true).await;
    summary.stats = Some(pipeline.stats());
    Ok(summary)
}

/// Hands out [`EchoUnit`]s sharing one drop counter.
struct EchoFactory {
    seen: Arc<AtomicU64>,
    drop_every: Option<u64>,
    delay: Duration,
}

impl EchoFactory {
    fn new(drop_every: Option<u64>, delay: Duration) -> Self {
        Self {
            seen: Arc::new(AtomicU64::new(0)),
            drop_every: drop_every.filter(|n| *n > 0),
            delay,
        }
    }

    fn unit(&self) -> EchoUnit {
        EchoUnit {
            seen: Arc::clone(&self.seen),
            drop_every: self.drop_every,
            delay: self.delay,
        }
    }
}

#[async_trait]
impl UnitFactory for EchoFactory {
    async fn create(&self) -> courier_engine::Result<Box<dyn ProcessingUnit>> {
        Ok(Box::new(self.unit()))
    }
}

/// Replies with the request payload, swallowing every Nth reply.
struct EchoUnit {
    seen: Arc<AtomicU64>,
    drop_every: Option<u64>,
    delay: Duration,
}

#[async_trait]
impl ProcessingUnit for EchoUnit {
    async fn process(&self, item: &WorkItem) -> courier_engine::Result<Option<WorkItem>> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let count = self.seen.fetch_add(1, Ordering::Relaxed).saturating_add(1);
        if self
            .drop_every
            .and_then(|n| count.checked_rem(n))
            .is_some_and(|rest| rest == 0)
        {
            debug!(item_id = %item.id(), "Dropping reply");
            return Ok(None);
        }
        Ok(Some(item.reply(item.payload().clone())))
    }
}
