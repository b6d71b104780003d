//! CLI command definitions using clap.

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

/// Courier - asynchronous request/reply correlation
#[derive(Parser, Debug)]
#[command(name = "courier")]
#[command(version)]
#[command(about = "Request/reply correlation over a SEDA worker pool")]
#[command(
    long_about = "Courier dispatches requests through a bounded worker pool and correlates the asynchronous replies back to their callers, with timeouts, late-reply detection and processed markers."
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run an echo pipeline and print a JSON summary
    Run {
        /// Engine configuration file (TOML)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Number of requests to dispatch
        #[arg(short = 'n', long, default_value_t = 100)]
        requests: usize,

        /// Requests in flight at once
        #[arg(short = 'j', long, default_value_t = 16)]
        concurrency: usize,

        /// Override the reply timeout (0 waits forever)
        #[arg(long)]
        timeout_ms: Option<u64>,

        /// Swallow every Nth reply to exercise timeouts
        #[arg(long)]
        drop_every: Option<u64>,

        /// Simulated processing time per request
        #[arg(long, default_value_t = 0)]
        delay_ms: u64,

        /// How processing units are provided to workers
        #[arg(short, long, value_enum, default_value_t = Mode::Pooled)]
        mode: Mode,
    },

    /// Print the effective configuration
    Config {
        /// Engine configuration file (TOML)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Output as JSON instead of TOML
        #[arg(long, default_value_t = false)]
        json: bool,
    },
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Pooled,
    Singleton,
    PerRequest,
}
