//! Reflection Flow
//!
//! Extracts structured JSON from a passage with the completion service and
//! validates it. A rejected extraction is routed back to the extractor with
//! the validation error, until it passes or the retry ceiling is reached.
//!
//! ```text
//! start ──> extract ──extraction_done──> validate ──stop──> (end)
//!              ^                            │
//!              └──────validation_error──────┘
//! ```

use async_trait::async_trait;
use log::{debug, info};
use serde_json::Value;

use crate::execution::{Attempt, RetryCounter, ValidationError};
use crate::workflow::{
    Event, EventKind, RunConfig, Step, StepContext, StepResult, Workflow, WorkflowError,
    VALIDATION_ERROR,
};

pub const EXTRACTION_DONE: &str = "extraction_done";

/// State key holding the passage being extracted from.
pub const PASSAGE_KEY: &str = "passage";

/// State key holding the most recent raw extraction.
pub const LAST_OUTPUT_KEY: &str = "last_output";

/// State key holding the accepted extraction.
pub const VALIDATED_KEY: &str = "validated";

const DEFAULT_REQUIRED_FIELDS: &[&str] = &["cars"];

pub fn build(config: &RunConfig) -> Result<Workflow, WorkflowError> {
    let required: Vec<String> = config
        .params
        .get("required_fields")
        .and_then(Value::as_array)
        .map(|fields| {
            fields
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_else(|| DEFAULT_REQUIRED_FIELDS.iter().map(|f| f.to_string()).collect());

    Workflow::builder("reflection")
        .register(ExtractStep::new(config.max_retries))
        .register(ValidateStep::new(required))
        .build()
}

/// Asks the completion service for a JSON extraction of the passage.
pub struct ExtractStep {
    retry: RetryCounter,
}

impl ExtractStep {
    pub fn new(max_retries: u32) -> Self {
        Self {
            retry: RetryCounter::new(max_retries),
        }
    }
}

#[async_trait]
impl Step for ExtractStep {
    fn name(&self) -> &str {
        "extract"
    }

    fn accepts(&self) -> Vec<EventKind> {
        vec![EventKind::Start, EventKind::from(VALIDATION_ERROR)]
    }

    fn emits(&self) -> Vec<EventKind> {
        vec![EventKind::from(EXTRACTION_DONE), EventKind::Stop]
    }

    async fn run(&mut self, ctx: &StepContext, event: Event) -> StepResult {
        let state = ctx.state();

        if let Some(passage) = event.get_str(PASSAGE_KEY) {
            state.set(PASSAGE_KEY, passage).await?;
        }

        let attempt = match self.retry.attempt(state).await? {
            Attempt::Exhausted(_) => return Ok(vec![RetryCounter::sentinel()]),
            Attempt::Proceed(n) => n,
        };

        let passage: String = state.get_or(PASSAGE_KEY, String::new()).await?;
        let mut prompt = format!(
            "Extract the facts in the passage below as a single JSON object.\n\n\
             Passage:\n{}\n",
            passage
        );

        if event.is(VALIDATION_ERROR) {
            let previous = event.get("output").map(value_text).unwrap_or_default();
            let error = event.get_str("error").unwrap_or_default();
            debug!("Retrying extraction after: {}", error);
            prompt.push_str(&format!(
                "\nYour previous answer was rejected.\nAnswer: {}\nError: {}\n\
                 Return only the corrected JSON.\n",
                previous, error
            ));
        }

        info!("Extraction attempt {}", attempt);
        let output = ctx.completion().complete(&prompt).await?.as_text();
        state.set(LAST_OUTPUT_KEY, &output).await?;

        Ok(vec![Event::custom(EXTRACTION_DONE).with("output", output)])
    }
}

/// Accepts an extraction that parses as a JSON object carrying every
/// required field.
pub struct ValidateStep {
    required: Vec<String>,
}

impl ValidateStep {
    pub fn new(required: Vec<String>) -> Self {
        Self { required }
    }

    fn check(&self, raw: &str) -> Result<Value, ValidationError> {
        let parsed: Value = serde_json::from_str(&strip_code_fences(raw))
            .map_err(|e| ValidationError::new(format!("invalid JSON: {}", e)))?;

        let object = parsed
            .as_object()
            .ok_or_else(|| ValidationError::new("expected a JSON object"))?;

        let missing: Vec<&str> = self
            .required
            .iter()
            .filter(|field| !object.contains_key(field.as_str()))
            .map(String::as_str)
            .collect();

        if !missing.is_empty() {
            return Err(ValidationError::new(format!(
                "missing required fields: {}",
                missing.join(", ")
            )));
        }

        Ok(parsed)
    }
}

#[async_trait]
impl Step for ValidateStep {
    fn name(&self) -> &str {
        "validate"
    }

    fn accepts(&self) -> Vec<EventKind> {
        vec![EventKind::from(EXTRACTION_DONE)]
    }

    fn emits(&self) -> Vec<EventKind> {
        vec![EventKind::from(VALIDATION_ERROR), EventKind::Stop]
    }

    async fn run(&mut self, ctx: &StepContext, event: Event) -> StepResult {
        let raw = event.get_str("output").unwrap_or_default().to_string();

        match self.check(&raw) {
            Ok(value) => {
                ctx.state().set(VALIDATED_KEY, &value).await?;
                Ok(vec![Event::stop(value)])
            }
            Err(rejection) => {
                info!("Extraction rejected: {}", rejection.reason);
                Ok(vec![rejection.into_event(raw)])
            }
        }
    }
}

/// Removes a surrounding Markdown code fence, if any.
pub fn strip_code_fences(response: &str) -> String {
    let trimmed = response.trim();
    if !trimmed.starts_with("```") {
        return trimmed.to_string();
    }

    let mut lines: Vec<&str> = trimmed.lines().skip(1).collect();
    if lines.last().map(|l| l.trim_start().starts_with("```")).unwrap_or(false) {
        lines.pop();
    }
    lines.join("\n")
}

fn value_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
