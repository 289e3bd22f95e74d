//! Model Completion Collaborator
//!
//! Steps that need a language model call through the [`Completion`] trait.
//! The scheduler never talks to a model itself: an implementation is
//! injected into the run through [`Services`](super::Services).
//!
//! [`ScriptedCompletion`] replays canned responses and is used by the CLI
//! demos and by tests.

use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use log::debug;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::Mutex;

/// Errors surfaced by a completion collaborator.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ModelError {
    #[error("model request failed: {0}")]
    Request(String),

    #[error("model returned an empty completion")]
    Empty,

    #[error("completion script exhausted after {0} responses")]
    Exhausted(usize),

    #[error("no completion service configured")]
    Unavailable,
}

/// A completion: free text or an already-structured value.
#[derive(Debug, Clone, PartialEq)]
pub enum Completed {
    Text(String),
    Structured(Value),
}

impl Completed {
    /// Returns the completion as text. Structured values are rendered as
    /// compact JSON.
    pub fn as_text(&self) -> String {
        match self {
            Self::Text(text) => text.clone(),
            Self::Structured(value) => value.to_string(),
        }
    }

    /// Interprets the completion as JSON, parsing text completions.
    pub fn to_json(&self) -> Result<Value, serde_json::Error> {
        match self {
            Self::Text(text) => serde_json::from_str(text.trim()),
            Self::Structured(value) => Ok(value.clone()),
        }
    }
}

impl From<Value> for Completed {
    /// Strings become text completions; anything else is structured.
    fn from(value: Value) -> Self {
        match value {
            Value::String(text) => Self::Text(text),
            other => Self::Structured(other),
        }
    }
}

impl From<&str> for Completed {
    fn from(text: &str) -> Self {
        Self::Text(text.to_string())
    }
}

/// A language model completion function.
#[async_trait]
pub trait Completion: Send + Sync {
    async fn complete(&self, prompt: &str) -> Result<Completed, ModelError>;
}

/// Placeholder used when a run has no completion service.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoCompletion;

#[async_trait]
impl Completion for NoCompletion {
    async fn complete(&self, _prompt: &str) -> Result<Completed, ModelError> {
        Err(ModelError::Unavailable)
    }
}

/// Replays a fixed sequence of responses, one per call.
#[derive(Debug, Default)]
pub struct ScriptedCompletion {
    responses: Mutex<VecDeque<Result<Completed, ModelError>>>,
    prompts: Mutex<Vec<String>>,
    delay: Option<Duration>,
}

impl ScriptedCompletion {
    /// Creates a script from successful responses.
    pub fn new<I, C>(responses: I) -> Self
    where
        I: IntoIterator<Item = C>,
        C: Into<Completed>,
    {
        Self {
            responses: Mutex::new(responses.into_iter().map(|r| Ok(r.into())).collect()),
            prompts: Mutex::new(Vec::new()),
            delay: None,
        }
    }

    /// Appends a failing response to the script.
    pub fn with_error(mut self, error: ModelError) -> Self {
        self.responses.get_mut().push_back(Err(error));
        self
    }

    /// Appends a successful response to the script.
    pub fn with_response(mut self, response: impl Into<Completed>) -> Self {
        self.responses.get_mut().push_back(Ok(response.into()));
        self
    }

    /// Sleeps before every response, simulating model latency.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Prompts received so far, in call order.
    pub async fn prompts(&self) -> Vec<String> {
        self.prompts.lock().await.clone()
    }

    /// Number of responses left in the script.
    pub async fn remaining(&self) -> usize {
        self.responses.lock().await.len()
    }
}

#[async_trait]
impl Completion for ScriptedCompletion {
    async fn complete(&self, prompt: &str) -> Result<Completed, ModelError> {
        let served = {
            let mut prompts = self.prompts.lock().await;
            prompts.push(prompt.to_string());
            prompts.len()
        };

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        debug!("Scripted completion #{} ({} prompt bytes)", served, prompt.len());

        self.responses
            .lock()
            .await
            .pop_front()
            .unwrap_or(Err(ModelError::Exhausted(served - 1)))
    }
}
