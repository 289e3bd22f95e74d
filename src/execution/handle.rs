//! Run Handle
//!
//! The caller's side of a started run: await its result, watch its lifecycle
//! events, inject events or cancel it.

use std::sync::Arc;

use log::{error, info};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::monitoring::{ExecutionTimeline, LifecycleBus, LifecycleStream, RunStatus};
use crate::workflow::{Event, EventKind, SharedState, StateSnapshot};

use super::error::RunError;

/// Why [`RunHandle::send_event`] refused an event.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SendEventError {
    #[error("a run has exactly one start event")]
    StartNotAllowed,

    #[error("run has already finished")]
    Closed,
}

/// Everything known about a finished run.
#[derive(Debug)]
pub struct RunOutcome {
    pub run_id: String,
    /// Result of the consumed stop event, or why the run ended without one
    pub result: Result<Value, RunError>,
    /// Step invocations performed
    pub iterations: u64,
    pub timeline: ExecutionTimeline,
    /// Shared state as last written
    pub state: StateSnapshot,
}

impl RunOutcome {
    pub fn status(&self) -> RunStatus {
        match &self.result {
            Ok(_) => RunStatus::Stopped,
            Err(e) => e.status(),
        }
    }
}

/// Cancels a run without owning its [`RunHandle`].
#[derive(Debug, Clone)]
pub struct CancelHandle {
    run_id: String,
    sender: Arc<watch::Sender<bool>>,
}

impl CancelHandle {
    /// Requests cancellation. Observed at the current step's next await
    /// point, or immediately if the run is waiting for events.
    pub fn cancel(&self) {
        info!("Cancellation requested for run {}", self.run_id);
        self.sender.send_replace(true);
    }
}

/// Handle to a run spawned by [`Engine::start`](super::Engine::start).
///
/// Dropping the handle does not cancel the run.
pub struct RunHandle {
    run_id: String,
    state: SharedState,
    bus: LifecycleBus,
    cancel: CancelHandle,
    inbox: mpsc::UnboundedSender<Event>,
    task: JoinHandle<RunOutcome>,
}

impl RunHandle {
    pub(crate) fn new(
        run_id: String,
        state: SharedState,
        bus: LifecycleBus,
        cancel: watch::Sender<bool>,
        inbox: mpsc::UnboundedSender<Event>,
        task: JoinHandle<RunOutcome>,
    ) -> Self {
        let cancel = CancelHandle {
            run_id: run_id.clone(),
            sender: Arc::new(cancel),
        };

        Self {
            run_id,
            state,
            bus,
            cancel,
            inbox,
            task,
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// The run's shared state. Stays readable after the run ends, whatever
    /// the outcome.
    pub fn state(&self) -> &SharedState {
        &self.state
    }

    /// Lifecycle events from this point on. Subscribe through
    /// [`Engine::stream_events`](super::Engine::stream_events) to also see
    /// `RunStarted`.
    pub fn stream_events(&self) -> LifecycleStream {
        self.bus.subscribe()
    }

    /// Requests cancellation; see [`CancelHandle::cancel`].
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// A cancel switch that outlives [`RunHandle::outcome`].
    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Appends an event to the tail of the run's queue.
    pub fn send_event(&self, event: Event) -> Result<(), SendEventError> {
        if event.kind() == &EventKind::Start {
            return Err(SendEventError::StartNotAllowed);
        }
        self.inbox.send(event).map_err(|_| SendEventError::Closed)
    }

    /// Waits for the run to end.
    pub async fn outcome(self) -> RunOutcome {
        match self.task.await {
            Ok(outcome) => outcome,
            Err(join_error) => {
                error!("Run {} task aborted: {}", self.run_id, join_error);
                RunOutcome {
                    run_id: self.run_id,
                    result: Err(RunError::Aborted(join_error.to_string())),
                    iterations: 0,
                    timeline: ExecutionTimeline::new(),
                    state: self.state.snapshot().await,
                }
            }
        }
    }

    /// Waits for the run to end and returns its result.
    pub async fn result(self) -> Result<Value, RunError> {
        self.outcome().await.result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::Engine;
    use crate::workflow::{Payload, Step, StepContext, StepResult, Workflow};
    use async_trait::async_trait;
    use serde_json::json;
    use std::time::Duration;

    /// Waits for an external `answer` event and stops with its result.
    struct Listener;

    #[async_trait]
    impl Step for Listener {
        fn name(&self) -> &str {
            "listener"
        }

        fn accepts(&self) -> Vec<EventKind> {
            vec![EventKind::Start, EventKind::from("answer")]
        }

        fn emits(&self) -> Vec<EventKind> {
            vec![EventKind::Stop]
        }

        async fn run(&mut self, ctx: &StepContext, event: Event) -> StepResult {
            ctx.state().set("seen", event.kind().as_str()).await?;
            if event.is("answer") {
                return Ok(vec![Event::stop(event.get("value").cloned().unwrap_or(Value::Null))]);
            }
            Ok(vec![])
        }
    }

    fn engine() -> Engine {
        let workflow = Workflow::builder("listen").register(Listener).build().unwrap();
        let mut engine = Engine::new(workflow);
        engine.set_timeout(Duration::from_secs(5));
        engine
    }

    #[tokio::test]
    async fn test_send_event_feeds_idle_run() {
        let handle = engine().start(Payload::new());

        handle
            .send_event(Event::custom("answer").with("value", 42))
            .unwrap();

        let state = handle.state().clone();
        assert_eq!(handle.result().await.unwrap(), json!(42));
        assert_eq!(state.get("seen").await, Some(json!("answer")));
    }

    #[tokio::test]
    async fn test_send_start_rejected() {
        let handle = engine().start(Payload::new());
        assert_eq!(
            handle.send_event(Event::start(Payload::new())),
            Err(SendEventError::StartNotAllowed)
        );
        handle.cancel();
        let outcome = handle.outcome().await;
        assert_eq!(outcome.status(), RunStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_send_after_finish_is_closed() {
        let handle = engine().start(Payload::new());
        handle.send_event(Event::custom("answer")).unwrap();

        while !handle.is_finished() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        assert_eq!(
            handle.send_event(Event::custom("answer")),
            Err(SendEventError::Closed)
        );
    }

    #[tokio::test]
    async fn test_cancel_handle_outlives_handle() {
        let handle = engine().start(Payload::new());
        let canceller = handle.cancel_handle();

        let waiter = tokio::spawn(handle.outcome());
        tokio::time::sleep(Duration::from_millis(20)).await;
        canceller.cancel();

        let outcome = waiter.await.unwrap();
        assert_eq!(outcome.status(), RunStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_cancel_idle_run() {
        let handle = engine().start(Payload::new());
        tokio::time::sleep(Duration::from_millis(20)).await;
        handle.cancel();

        let outcome = handle.outcome().await;
        assert!(matches!(outcome.result, Err(RunError::Cancelled)));
        assert_eq!(outcome.state.get("seen"), Some(&json!("start")));
    }
}
