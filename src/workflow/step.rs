//! Step Definition
//!
//! A step is a named unit of work bound to one or more event kinds. It
//! declares what it accepts, what it may emit and, for multi-agent flows,
//! which steps it may hand control to. The scheduler checks these
//! declarations when the workflow is built and again when the step emits.
//!
//! # Example
//!
//! ```rust
//! use async_trait::async_trait;
//! use steprunner::workflow::{Event, EventKind, Step, StepContext, StepResult};
//!
//! struct Greeter;
//!
//! #[async_trait]
//! impl Step for Greeter {
//!     fn name(&self) -> &str { "greeter" }
//!     fn accepts(&self) -> Vec<EventKind> { vec![EventKind::Start] }
//!     fn emits(&self) -> Vec<EventKind> { vec![EventKind::Stop] }
//!
//!     async fn run(&mut self, _ctx: &StepContext, event: Event) -> StepResult {
//!         let who = event.get_str("name").unwrap_or("world");
//!         Ok(vec![Event::stop(format!("hello, {who}"))])
//!     }
//! }
//! ```

use async_trait::async_trait;
use thiserror::Error;

use crate::environment::{Completion, HumanInput, HumanInputError, ModelError, Services};

use super::event::{Event, EventKind};
use super::state::{SharedState, StateError};

/// The events produced by one step invocation.
pub type StepResult = Result<Vec<Event>, StepError>;

/// Failure of a step body.
#[derive(Debug, Error)]
pub enum StepError {
    /// The completion collaborator failed.
    #[error(transparent)]
    Model(#[from] ModelError),

    /// Waiting for human input failed.
    #[error(transparent)]
    Human(#[from] HumanInputError),

    #[error(transparent)]
    State(#[from] StateError),

    /// The incoming event was not usable by this step.
    #[error("invalid: {0}")]
    Invalid(String),

    /// The step decided to fail the run.
    #[error("failed: {0}")]
    Failed(String),
}

impl StepError {
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::Invalid(msg.into())
    }

    pub fn failed(msg: impl Into<String>) -> Self {
        Self::Failed(msg.into())
    }
}

/// Everything a step body can reach during one invocation.
pub struct StepContext {
    step: String,
    run_id: String,
    iteration: u64,
    state: SharedState,
    services: Services,
}

impl StepContext {
    pub(crate) fn new(
        step: impl Into<String>,
        run_id: impl Into<String>,
        iteration: u64,
        state: SharedState,
        services: Services,
    ) -> Self {
        Self {
            step: step.into(),
            run_id: run_id.into(),
            iteration,
            state,
            services,
        }
    }

    /// Name of the step being invoked.
    pub fn step_name(&self) -> &str {
        &self.step
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// 1-based count of step invocations in this run, including this one.
    pub fn iteration(&self) -> u64 {
        self.iteration
    }

    /// The run's shared state store.
    pub fn state(&self) -> &SharedState {
        &self.state
    }

    pub fn completion(&self) -> &dyn Completion {
        self.services.completion()
    }

    pub fn human(&self) -> &dyn HumanInput {
        self.services.human()
    }
}

/// A unit of work in a workflow.
#[async_trait]
pub trait Step: Send + 'static {
    /// Unique name, used for handoff targets and diagnostics.
    fn name(&self) -> &str;

    /// Event kinds routed to this step.
    fn accepts(&self) -> Vec<EventKind>;

    /// Event kinds this step may return. Returning anything else fails the run.
    fn emits(&self) -> Vec<EventKind>;

    /// Steps this step may hand control to with [`Event::handoff`].
    fn handoff_targets(&self) -> Vec<String> {
        Vec::new()
    }

    /// Handles one event, returning zero or more successor events.
    async fn run(&mut self, ctx: &StepContext, event: Event) -> StepResult;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::environment::ScriptedCompletion;
    use serde_json::json;

    struct Echo;

    #[async_trait]
    impl Step for Echo {
        fn name(&self) -> &str {
            "echo"
        }
        fn accepts(&self) -> Vec<EventKind> {
            vec![EventKind::Start]
        }
        fn emits(&self) -> Vec<EventKind> {
            vec![EventKind::Stop]
        }
        async fn run(&mut self, ctx: &StepContext, event: Event) -> StepResult {
            let reply = ctx.completion().complete("say").await?;
            ctx.state().set("seen", event.get("x").cloned()).await?;
            Ok(vec![Event::stop(reply.as_text())])
        }
    }

    fn context(services: Services) -> StepContext {
        StepContext::new("echo", "run-test", 1, SharedState::new(), services)
    }

    #[test]
    fn test_step_error_constructors() {
        assert!(matches!(StepError::invalid("bad"), StepError::Invalid(m) if m == "bad"));
        assert!(matches!(StepError::failed("no"), StepError::Failed(m) if m == "no"));
    }

    #[test]
    fn test_step_error_display() {
        assert_eq!(StepError::invalid("bad").to_string(), "invalid: bad");
        assert_eq!(StepError::failed("no").to_string(), "failed: no");
        assert_eq!(
            StepError::from(ModelError::Empty).to_string(),
            "model returned an empty completion"
        );
    }

    #[test]
    fn test_default_handoff_targets_empty() {
        assert!(Echo.handoff_targets().is_empty());
    }

    #[tokio::test]
    async fn test_context_accessors() {
        let ctx = context(Services::new());
        assert_eq!(ctx.step_name(), "echo");
        assert_eq!(ctx.run_id(), "run-test");
        assert_eq!(ctx.iteration(), 1);
        assert!(ctx.state().is_empty().await);
    }

    #[tokio::test]
    async fn test_step_uses_injected_services() {
        let ctx = context(Services::new().with_completion(ScriptedCompletion::new(["hi"])));
        let events = Echo
            .run(&ctx, Event::start(Default::default()).with("x", 5))
            .await
            .unwrap();

        assert_eq!(events, vec![Event::stop("hi")]);
        assert_eq!(ctx.state().get("seen").await, Some(json!(5)));
    }

    #[tokio::test]
    async fn test_model_error_propagates() {
        let ctx = context(Services::new());
        let err = Echo.run(&ctx, Event::start(Default::default())).await.unwrap_err();
        assert!(matches!(err, StepError::Model(ModelError::Unavailable)));
    }
}
