use serde::{Deserialize, Serialize};

use crate::error::PgPollError;
use crate::types::ConnectMode;

fn default_io_threads() -> usize {
    1
}

/// Init parameters for a [`Driver`](crate::driver::Driver).
///
/// `conninfo` is handed to the connection library untouched, so both
/// `key=value` strings and `postgresql://` URLs work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriverConfig {
    /// Connection string shared by every pooled connection.
    pub conninfo: String,
    /// Number of pooled connections (the pool never grows past it).
    pub pool_size: u16,
    /// How the pool is warmed at init.
    #[serde(default)]
    pub warmup: ConnectMode,
    /// Worker threads backing the Postgres adapter's socket I/O.
    #[serde(default = "default_io_threads")]
    pub io_threads: usize,
}

impl DriverConfig {
    #[must_use]
    pub fn new(conninfo: impl Into<String>, pool_size: u16) -> Self {
        Self {
            conninfo: conninfo.into(),
            pool_size,
            warmup: ConnectMode::default(),
            io_threads: default_io_threads(),
        }
    }

    #[must_use]
    pub fn with_warmup(mut self, warmup: ConnectMode) -> Self {
        self.warmup = warmup;
        self
    }

    #[must_use]
    pub fn with_io_threads(mut self, io_threads: usize) -> Self {
        self.io_threads = io_threads;
        self
    }

    /// Parse and validate a JSON config document.
    ///
    /// # Errors
    /// Returns `PgPollError::JsonError` for malformed JSON and
    /// `PgPollError::ConfigError` if a field fails validation.
    pub fn from_json(json: &str) -> Result<Self, PgPollError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Check that every required field holds a usable value.
    ///
    /// # Errors
    /// Returns `PgPollError::ConfigError` naming the first offending field.
    pub fn validate(&self) -> Result<(), PgPollError> {
        if self.conninfo.trim().is_empty() {
            return Err(PgPollError::ConfigError(
                "conninfo is required".to_string(),
            ));
        }
        if self.pool_size == 0 {
            return Err(PgPollError::ConfigError(
                "pool_size must be greater than zero".to_string(),
            ));
        }
        if self.io_threads == 0 {
            return Err(PgPollError::ConfigError(
                "io_threads must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}
