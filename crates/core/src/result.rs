//! Result type definition and a logging fallback for Railway-Oriented Programming.
//!
//! Lets callers degrade on error without unwrap/expect/panic.

use std::fmt::Display;

use crate::error::Error;

/// The standard Result type for core operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Extension trait providing a safe, logging fallback for any `Result`
/// whose error can be displayed.
///
/// Used at the edges where an error must not abort the caller, e.g. a
/// failed store listing inside a reconciliation pass or during shutdown.
pub trait ResultExt<T> {
    /// Get the value or a default, logging the error if present.
    fn or_default_logged(self, default: T) -> T;
}

impl<T, E: Display> ResultExt<T> for std::result::Result<T, E> {
    fn or_default_logged(self, default: T) -> T {
        match self {
            Ok(value) => value,
            Err(e) => {
                tracing::error!("Operation failed, using default: {}", e);
                default
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_result_or_default_logged_ok() {
        let result: Result<i32> = Ok(42);
        assert_eq!(result.or_default_logged(0), 42);
    }

    #[test]
    fn test_result_or_default_logged_err() {
        let result: std::result::Result<i32, String> = Err("store offline".to_string());
        assert_eq!(result.or_default_logged(99), 99);
    }

    #[test]
    fn test_result_or_default_logged_core_error() {
        let result: Result<Vec<i32>> = Err(Error::invalid_config("test"));
        assert!(result.or_default_logged(Vec::new()).is_empty());
    }
}
