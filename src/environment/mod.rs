//! Run Environment Module
//!
//! External collaborators that steps depend on. They are injected into a run
//! explicitly through [`Services`] rather than constructed inside step bodies.
//!
//! - [`completion`]: language model completions
//! - [`human`]: human-in-the-loop prompts

pub mod completion;
pub mod human;

use std::sync::Arc;

pub use completion::{Completed, Completion, ModelError, NoCompletion, ScriptedCompletion};
pub use human::{HumanInput, HumanInputError, NoHuman, ScriptedHuman, StdinHuman};

/// Collaborators available to every step of a run.
///
/// Defaults to services that fail with "unavailable" errors, so a step that
/// calls a collaborator the caller did not provide fails loudly.
#[derive(Clone)]
pub struct Services {
    completion: Arc<dyn Completion>,
    human: Arc<dyn HumanInput>,
}

impl Services {
    pub fn new() -> Self {
        Self {
            completion: Arc::new(NoCompletion),
            human: Arc::new(NoHuman),
        }
    }

    pub fn with_completion(self, completion: impl Completion + 'static) -> Self {
        self.with_shared_completion(Arc::new(completion))
    }

    /// Uses a completion service the caller keeps a handle to.
    pub fn with_shared_completion(mut self, completion: Arc<dyn Completion>) -> Self {
        self.completion = completion;
        self
    }

    pub fn with_human(self, human: impl HumanInput + 'static) -> Self {
        self.with_shared_human(Arc::new(human))
    }

    pub fn with_shared_human(mut self, human: Arc<dyn HumanInput>) -> Self {
        self.human = human;
        self
    }

    pub fn completion(&self) -> &dyn Completion {
        self.completion.as_ref()
    }

    pub fn human(&self) -> &dyn HumanInput {
        self.human.as_ref()
    }
}

impl Default for Services {
    fn default() -> Self {
        Self::new()
    }
}
