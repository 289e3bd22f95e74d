//! Reflection Retry Policy
//!
//! The scheduler places no bound on cycles. A step that loops on its own
//! rejected output bounds itself with a [`RetryCounter`] kept in shared
//! state and stops the run with [`MAX_RETRIES_SENTINEL`] once the ceiling is
//! reached.
//!
//! ```rust,ignore
//! match self.retry.attempt(ctx.state()).await? {
//!     Attempt::Exhausted(_) => return Ok(vec![RetryCounter::sentinel()]),
//!     Attempt::Proceed(n) => info!("attempt {}", n),
//! }
//! ```

use log::{debug, warn};
use serde_json::Value;
use thiserror::Error;

use crate::workflow::{Event, SharedState, StateError};

/// Result of a run whose retries ran out.
pub const MAX_RETRIES_SENTINEL: &str = "max retries";

/// Default state key of the retry counter.
pub const DEFAULT_RETRY_KEY: &str = "retries";

/// A payload failed validation. Recovered locally by looping back with a
/// `validation_error` event rather than ending the run.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("validation failed: {reason}")]
pub struct ValidationError {
    pub reason: String,
}

impl ValidationError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }

    /// Builds the event that routes the rejected output back to its producer.
    pub fn into_event(self, prior_output: impl Into<Value>) -> Event {
        Event::validation_error(prior_output, &self)
    }
}

/// Outcome of requesting one more attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Attempt {
    /// Go ahead; this is attempt `n` (1-based).
    Proceed(u32),
    /// The ceiling was already reached; `n` is the attempt that was refused.
    Exhausted(u32),
}

/// Attempt counter stored in shared state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryCounter {
    key: String,
    max_retries: u32,
}

impl RetryCounter {
    pub fn new(max_retries: u32) -> Self {
        Self {
            key: DEFAULT_RETRY_KEY.to_string(),
            max_retries,
        }
    }

    /// Stores the counter under a different key.
    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = key.into();
        self
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Counts one attempt and decides whether it may proceed. At most
    /// `max_retries` attempts proceed.
    pub async fn attempt(&self, state: &SharedState) -> Result<Attempt, StateError> {
        let n = state
            .edit(&self.key, |value| {
                let count = match &*value {
                    Value::Null => 0,
                    seeded => serde_json::from_value::<u32>(seeded.clone()).map_err(|source| {
                        StateError::Decode {
                            key: self.key.clone(),
                            source,
                        }
                    })?,
                };
                let next = count.saturating_add(1);
                *value = Value::from(next);
                Ok::<u32, StateError>(next)
            })
            .await?;

        if n > self.max_retries {
            warn!(
                "Retry ceiling reached for '{}' ({} attempts allowed)",
                self.key, self.max_retries
            );
            Ok(Attempt::Exhausted(n))
        } else {
            debug!("Attempt {}/{} for '{}'", n, self.max_retries, self.key);
            Ok(Attempt::Proceed(n))
        }
    }

    /// Attempts counted so far.
    pub async fn count(&self, state: &SharedState) -> Result<u32, StateError> {
        state.get_or(&self.key, 0u32).await
    }

    pub async fn reset(&self, state: &SharedState) -> Result<(), StateError> {
        state.set(&self.key, 0u32).await
    }

    /// The stop event a step emits when retries run out.
    pub fn sentinel() -> Event {
        Event::stop(MAX_RETRIES_SENTINEL)
    }
}
