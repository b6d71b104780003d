//! TOML configuration loading.

use std::path::Path;

use serde::de::DeserializeOwned;

use crate::error::Error;
use crate::result::Result;

/// Parse a TOML document into `T`.
///
/// # Errors
///
/// Returns [`Error::TomlParseFailed`] when the document is malformed or does
/// not match `T`.
pub fn parse_toml<T: DeserializeOwned>(raw: &str) -> Result<T> {
    toml::from_str(raw).map_err(|e| Error::toml_parse_failed(e.to_string()))
}

/// Read and parse a TOML file into `T`.
///
/// # Errors
///
/// Returns [`Error::FileReadFailed`] when the file cannot be read, or
/// [`Error::TomlParseFailed`] when its content is not valid for `T`.
pub fn load_toml<T: DeserializeOwned>(path: impl AsRef<Path>) -> Result<T> {
    let path = path.as_ref();
    let raw = std::fs::read_to_string(path)
        .map_err(|e| Error::file_read_failed(path, e.to_string()))?;
    tracing::debug!(path = %path.display(), "Loaded configuration file");
    parse_toml(&raw)
}
