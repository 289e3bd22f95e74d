//! Run Monitoring Module
//!
//! Provides observability for runs.
//!
//! # Components
//!
//! - [`LifecycleBus`] / [`LifecycleStream`]: broadcast lifecycle events
//! - [`ExecutionTimeline`]: step invocation timing for summaries and Gantt charts

pub mod lifecycle;
pub mod timeline;

pub use lifecycle::{LifecycleBus, LifecycleEvent, LifecycleKind, LifecycleStream, RunStatus};
pub use timeline::{EventType, ExecutionTimeline, Span, TimelineEvent};
