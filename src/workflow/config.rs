//! Run Configuration
//!
//! Settings that shape a single run: timeout policy, the retry ceiling used by
//! reflection loops, an optional iteration ceiling, the start parameters and
//! seed values for the shared state.
//!
//! # Example YAML Format
//!
//! ```yaml
//! flow: reflection
//! timeout_secs: 30
//! timeout_mode: since_start
//! max_retries: 3
//! params:
//!   passage: "two cars collided at the junction..."
//! initial_state: {}
//! responses:
//!   - "{\"cars\": [{\"color\": \"red\"}, {\"color\": \"blue\"}]}"
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use super::event::Payload;

/// Default run timeout.
pub const DEFAULT_TIMEOUT_SECS: f64 = 60.0;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file '{path}': {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write config file '{path}': {source}")]
    Write {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse run config: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("invalid run config: {0}")]
    Invalid(String),
}

/// What the run timeout is measured from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeoutMode {
    /// Wall-clock time since the run started
    #[default]
    SinceStart,
    /// Time since the last write to shared state
    SinceLastWrite,
}

/// Configuration of one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunConfig {
    /// Built-in flow to run (CLI only)
    #[serde(default)]
    pub flow: Option<String>,

    /// Run timeout in seconds
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: f64,

    /// What the timeout is measured from
    #[serde(default)]
    pub timeout_mode: TimeoutMode,

    /// Retry ceiling for steps that loop on validation errors
    pub max_retries: u32,

    /// Optional ceiling on step invocations per run
    #[serde(default)]
    pub max_iterations: Option<u64>,

    /// Parameters carried by the start event
    #[serde(default)]
    pub params: Payload,

    /// Values seeded into shared state before the first step
    #[serde(default)]
    pub initial_state: Payload,

    /// Canned completion responses for scripted runs
    #[serde(default)]
    pub responses: Vec<Value>,

    /// Canned human replies; stdin is used when empty
    #[serde(default)]
    pub human_replies: Vec<String>,
}

fn default_timeout_secs() -> f64 {
    DEFAULT_TIMEOUT_SECS
}

impl RunConfig {
    /// Creates a configuration with the given retry ceiling and defaults for
    /// everything else.
    pub fn new(max_retries: u32) -> Self {
        Self {
            flow: None,
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            timeout_mode: TimeoutMode::default(),
            max_retries,
            max_iterations: None,
            params: Payload::new(),
            initial_state: Payload::new(),
            responses: Vec::new(),
            human_replies: Vec::new(),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_secs = timeout.as_secs_f64();
        self
    }

    pub fn with_timeout_mode(mut self, mode: TimeoutMode) -> Self {
        self.timeout_mode = mode;
        self
    }

    pub fn with_max_iterations(mut self, max: u64) -> Self {
        self.max_iterations = Some(max);
        self
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    pub fn with_initial_state(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.initial_state.insert(key.into(), value.into());
        self
    }

    /// The run timeout as a duration. Values too large to represent
    /// saturate at [`Duration::MAX`]; [`RunConfig::validate`] rejects them.
    pub fn timeout(&self) -> Duration {
        Duration::try_from_secs_f64(self.timeout_secs.max(0.0)).unwrap_or(Duration::MAX)
    }

    /// Checks value ranges.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.timeout_secs.is_finite() || self.timeout_secs <= 0.0 {
            return Err(ConfigError::Invalid(format!(
                "timeout_secs must be a positive number, got {}",
                self.timeout_secs
            )));
        }

        if Duration::try_from_secs_f64(self.timeout_secs).is_err() {
            return Err(ConfigError::Invalid(format!(
                "timeout_secs is out of range, got {}",
                self.timeout_secs
            )));
        }

        if self.max_retries == 0 {
            return Err(ConfigError::Invalid(
                "max_retries must be at least 1".to_string(),
            ));
        }

        if self.max_iterations == Some(0) {
            return Err(ConfigError::Invalid(
                "max_iterations must be at least 1 when set".to_string(),
            ));
        }

        Ok(())
    }
}
