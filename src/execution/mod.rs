//! Workflow Execution Module
//!
//! Provides the event-driven execution engine, including routing,
//! handoffs, timeouts, cancellation and the retry policy steps use to bound
//! their own loops.
//!
//! # Architecture
//!
//! - [`engine`]: Main execution engine driving a run
//! - [`step`]: Single step invocation and the timeout/cancel guard
//! - [`handle`]: Caller's handle to a started run
//! - [`retry`]: Retry counter and validation error helpers
//! - [`error`]: Terminal run errors

pub mod engine;
pub mod error;
pub mod handle;
pub mod retry;
pub mod step;

pub use engine::Engine;
pub use error::{RunError, EXTERNAL_SOURCE};
pub use handle::{CancelHandle, RunHandle, RunOutcome, SendEventError};
pub use retry::{
    Attempt, RetryCounter, ValidationError, DEFAULT_RETRY_KEY, MAX_RETRIES_SENTINEL,
};
pub use step::{Interrupt, RunGuard};
