//! Store configuration.
//!
//! Resolves where the parameter database lives and how the SQLite
//! connection is tuned. Resolution order: explicit path, then the
//! `PARAMSTORE_DB` environment variable, then the platform data directory.

use std::path::PathBuf;

use crate::error::{Error, Result};

/// Environment variable overriding the database location.
pub const DB_PATH_ENV: &str = "PARAMSTORE_DB";

/// Default SQLite busy timeout in milliseconds.
pub const DEFAULT_BUSY_TIMEOUT_MS: u64 = 5_000;

/// Configuration for opening a [`crate::ParameterStore`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreConfig {
    /// Path of the SQLite database file.
    pub path: PathBuf,
    /// Busy timeout applied to the connection.
    pub busy_timeout_ms: u64,
}

impl StoreConfig {
    /// Configuration for an explicit database path.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            busy_timeout_ms: DEFAULT_BUSY_TIMEOUT_MS,
        }
    }

    /// Override the busy timeout.
    #[must_use]
    pub fn with_busy_timeout(mut self, busy_timeout_ms: u64) -> Self {
        self.busy_timeout_ms = busy_timeout_ms;
        self
    }

    /// Resolve the configuration from the environment.
    ///
    /// Uses `PARAMSTORE_DB` when set and non-empty, otherwise the platform
    /// data directory (`<data_dir>/paramstore/parameters.db`).
    pub fn resolve() -> Result<Self> {
        if let Ok(path) = std::env::var(DB_PATH_ENV) {
            if !path.is_empty() {
                return Ok(Self::new(path));
            }
        }
        let path = Self::default_path().ok_or_else(|| {
            Error::Config("no platform data directory; set PARAMSTORE_DB".to_string())
        })?;
        Ok(Self::new(path))
    }

    /// The platform-default database path, if a data directory exists.
    #[must_use]
    pub fn default_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("", "", "paramstore")
            .map(|dirs| dirs.data_dir().join("parameters.db"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_explicit_path() {
        let config = StoreConfig::new("/tmp/params.db");
        assert_eq!(config.path, PathBuf::from("/tmp/params.db"));
        assert_eq!(config.busy_timeout_ms, DEFAULT_BUSY_TIMEOUT_MS);
    }

    #[test]
    fn test_busy_timeout_override() {
        let config = StoreConfig::new("/tmp/params.db").with_busy_timeout(250);
        assert_eq!(config.busy_timeout_ms, 250);
    }
}
