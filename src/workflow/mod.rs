//! Workflow Definition Module
//!
//! Provides the building blocks of a workflow: events, steps, the shared
//! state store, registration validation and run configuration.
//!
//! # Structure
//!
//! - [`event`]: Typed events and reserved kinds
//! - [`step`]: The `Step` trait and its invocation context
//! - [`model`]: Workflow builder and validated workflow
//! - [`validator`]: Registration checks and routing table
//! - [`state`]: Run-scoped shared state store
//! - [`config`]: Run configuration
//! - [`parser`]: YAML loading and saving of run configuration

pub mod config;
pub mod event;
pub mod model;
pub mod parser;
pub mod state;
pub mod step;
pub mod validator;

pub use config::{ConfigError, RunConfig, TimeoutMode};
pub use event::{Event, EventKind, Payload, VALIDATION_ERROR};
pub use model::{Edge, StepSpec, Workflow, WorkflowBuilder};
pub use parser::{load_run_config, parse_run_config, save_run_config};
pub use state::{ScopedEdit, SharedState, StateError, StateSnapshot};
pub use step::{Step, StepContext, StepError, StepResult};
pub use validator::{RoutingTable, WorkflowError};
