//! StepRunner - Event-Driven Step Scheduler
//!
//! Runs workflows made of steps that react to typed events. Each step
//! declares which event kinds it accepts and which it may emit; the engine
//! checks those declarations when the workflow is built, then routes events
//! through a FIFO queue one step at a time until a step emits `stop`.
//!
//! # Architecture
//!
//! The library is organized into five modules:
//!
//! - [`workflow`]: Events, steps, shared state, registration and run config
//! - [`execution`]: The engine, run handles, timeouts and the retry policy
//! - [`environment`]: Completion and human-input collaborators
//! - [`monitoring`]: Lifecycle event stream and execution timeline
//! - [`flows`]: Built-in reflection, story and handoff workflows
//!
//! # Example
//!
//! ```rust,no_run
//! use steprunner::execution::Engine;
//! use steprunner::flows;
//! use steprunner::load_run_config;
//! use steprunner::workflow::Payload;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // Load run settings from YAML
//!     let config = load_run_config("run.yaml")?;
//!
//!     // Build and validate the workflow
//!     let workflow = flows::build("reflection", &config)?;
//!
//!     // Start the run and wait for its result
//!     let mut engine = Engine::new(workflow);
//!     engine.set_config(config);
//!     let result = engine.start(Payload::new()).result().await?;
//!     println!("{}", result);
//!     Ok(())
//! }
//! ```

pub mod environment;
pub mod execution;
pub mod flows;
pub mod monitoring;
pub mod workflow;

// Re-export commonly used types
pub use execution::{Engine, RunError, RunHandle, RunOutcome};
pub use workflow::parser::load_run_config;
pub use workflow::{Event, EventKind, SharedState, Step, StepContext, Workflow};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name
pub const APP_NAME: &str = "StepRunner";
