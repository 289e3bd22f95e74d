//! Run Errors
//!
//! Every way a run can end other than consuming a stop event. All of them are
//! surfaced to the caller; none is replaced by a default result.

use std::time::Duration;

use thiserror::Error;

use crate::environment::ModelError;
use crate::monitoring::RunStatus;
use crate::workflow::{ConfigError, EventKind, StepError};

/// Source name used for events injected from outside the run.
pub const EXTERNAL_SOURCE: &str = "<external>";

/// Terminal failure of a run.
#[derive(Debug, Error)]
pub enum RunError {
    #[error("run config rejected: {0}")]
    Config(#[from] ConfigError),

    #[error("illegal handoff from '{from}' to '{to}'")]
    IllegalHandoff { from: String, to: String },

    #[error("handoff event from '{from}' names no target")]
    MissingHandoffTarget { from: String },

    #[error("step '{step}' emitted undeclared event '{kind}'")]
    UndeclaredEvent { step: String, kind: EventKind },

    #[error("no step accepts event '{0}'")]
    Unrouted(EventKind),

    #[error("run exceeded {0} step invocations")]
    IterationLimit(u64),

    #[error("run timed out after {elapsed:?}")]
    Timeout { elapsed: Duration },

    #[error("run was cancelled")]
    Cancelled,

    #[error("model error in step '{step}': {source}")]
    Model {
        step: String,
        #[source]
        source: ModelError,
    },

    #[error("step '{step}' failed: {source}")]
    Step {
        step: String,
        #[source]
        source: StepError,
    },

    #[error("run task aborted: {0}")]
    Aborted(String),
}

impl RunError {
    /// Wraps a step failure, keeping model errors distinguishable.
    pub fn from_step(step: impl Into<String>, error: StepError) -> Self {
        let step = step.into();
        match error {
            StepError::Model(source) => Self::Model { step, source },
            source => Self::Step { step, source },
        }
    }

    /// The run status this error corresponds to.
    pub fn status(&self) -> RunStatus {
        match self {
            Self::Timeout { .. } => RunStatus::TimedOut,
            Self::Cancelled => RunStatus::Cancelled,
            _ => RunStatus::Failed,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}
