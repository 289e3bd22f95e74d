//! Built-in Flows
//!
//! Ready-made workflows for the command line and for trying the engine out:
//!
//! - `reflection`: extract JSON, validate, loop back on rejection
//! - `story`: human-in-the-loop story writing
//! - `handoff`: concierge handing off to allow-listed specialists

pub mod handoff;
pub mod reflection;
pub mod story;

use thiserror::Error;

use crate::workflow::{RunConfig, Workflow, WorkflowError};

/// Names accepted by [`build`].
pub const FLOW_NAMES: &[&str] = &["reflection", "story", "handoff"];

#[derive(Debug, Error)]
pub enum FlowError {
    #[error("unknown flow '{0}' (available: reflection, story, handoff)")]
    UnknownFlow(String),

    #[error(transparent)]
    Workflow(#[from] WorkflowError),
}

/// Builds the named flow, configured from `config`.
pub fn build(name: &str, config: &RunConfig) -> Result<Workflow, FlowError> {
    let workflow = match name {
        "reflection" => reflection::build(config)?,
        "story" => story::build(config)?,
        "handoff" => handoff::build(config)?,
        other => return Err(FlowError::UnknownFlow(other.to_string())),
    };
    Ok(workflow)
}
