//! # Courier core
//!
//! Errors, result combinators, and TOML config loading shared by every
//! Courier crate.

#![forbid(unsafe_code)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]

pub mod config;
pub mod error;
pub mod result;

pub use config::{load_toml, parse_toml};
pub use error::Error;
pub use result::{Result, ResultExt};
