//! Individual Step Invocation
//!
//! Handles one invocation of a workflow step:
//! - Building the step context
//! - Racing the step body against the run timeout and cancellation
//! - Checking the returned events against the step's declaration
//! - Recording the invocation in the timeline and lifecycle stream

use std::future::Future;
use std::time::{Duration, Instant};

use log::{debug, error, warn};
use tokio::sync::watch;

use crate::environment::Services;
use crate::monitoring::{EventType, ExecutionTimeline, LifecycleBus, LifecycleKind};
use crate::workflow::{
    Event, EventKind, SharedState, StepContext, StepSpec, TimeoutMode, Workflow,
};

use super::error::RunError;

/// Why a guarded wait ended early.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interrupt {
    Timeout(Duration),
    Cancelled,
}

impl From<Interrupt> for RunError {
    fn from(interrupt: Interrupt) -> Self {
        match interrupt {
            Interrupt::Timeout(elapsed) => RunError::Timeout { elapsed },
            Interrupt::Cancelled => RunError::Cancelled,
        }
    }
}

/// Enforces a run's timeout and observes its cancellation flag.
///
/// In [`TimeoutMode::SinceLastWrite`] the deadline moves forward with every
/// write to shared state, so waits re-read it each time the timer fires.
pub struct RunGuard {
    started: Instant,
    timeout: Duration,
    mode: TimeoutMode,
    state: SharedState,
    cancel: watch::Receiver<bool>,
    cancel_open: bool,
}

impl RunGuard {
    pub fn new(
        timeout: Duration,
        mode: TimeoutMode,
        state: SharedState,
        cancel: watch::Receiver<bool>,
    ) -> Self {
        Self {
            started: Instant::now(),
            timeout,
            mode,
            state,
            cancel,
            cancel_open: true,
        }
    }

    /// Time since the run started.
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// The instant at which the run times out, as of now. `None` when the
    /// timeout reaches past what an [`Instant`] can represent.
    pub fn deadline(&self) -> Option<Instant> {
        let from = match self.mode {
            TimeoutMode::SinceStart => self.started,
            TimeoutMode::SinceLastWrite => self.state.last_write().max(self.started),
        };
        from.checked_add(self.timeout)
    }

    pub fn is_cancelled(&self) -> bool {
        *self.cancel.borrow()
    }

    /// Fails if the run has been cancelled or its deadline has passed.
    pub fn check(&self) -> Result<(), Interrupt> {
        if self.is_cancelled() {
            return Err(Interrupt::Cancelled);
        }
        match self.deadline() {
            Some(deadline) if Instant::now() >= deadline => {
                Err(Interrupt::Timeout(self.elapsed()))
            }
            _ => Ok(()),
        }
    }

    /// Drives `fut` until it completes, the run is cancelled or the deadline
    /// passes. An interrupted future is dropped at its current await point.
    pub async fn run_until<F: Future>(&mut self, fut: F) -> Result<F::Output, Interrupt> {
        tokio::pin!(fut);

        loop {
            self.check()?;
            let deadline = self.deadline();
            let wake_at = deadline
                .map(tokio::time::Instant::from_std)
                .unwrap_or_else(tokio::time::Instant::now);

            tokio::select! {
                biased;

                changed = self.cancel.changed(), if self.cancel_open => {
                    // Handle dropped without cancelling: only the timeout applies now
                    if changed.is_err() {
                        self.cancel_open = false;
                    }
                }
                output = &mut fut => return Ok(output),
                _ = tokio::time::sleep_until(wake_at), if deadline.is_some() => {}
            }
        }
    }
}

/// What one invocation produced.
pub(crate) enum Invocation {
    /// Declared events, in the order the step returned them
    Emitted(Vec<Event>),
    Failed(RunError),
}

/// Per-run collaborators an invocation needs besides the step itself.
pub(crate) struct InvocationScope<'a> {
    pub run_id: &'a str,
    pub state: &'a SharedState,
    pub services: &'a Services,
    pub bus: &'a LifecycleBus,
    pub timeline: &'a mut ExecutionTimeline,
    pub guard: &'a mut RunGuard,
}

/// Invokes the step at `index` with `event`.
///
/// Returned events whose kind the step did not declare, and handoffs outside
/// the step's allow-list, fail the run before any of them is enqueued.
pub(crate) async fn invoke_step(
    workflow: &mut Workflow,
    index: usize,
    event: Event,
    iteration: u64,
    scope: InvocationScope<'_>,
) -> Invocation {
    let spec = workflow.specs()[index].clone();
    let step_name = spec.name.clone();

    debug!(
        "Invocation {}: step '{}' <- {}",
        iteration,
        step_name,
        event.kind()
    );
    scope.bus.emit(LifecycleKind::StepStarted {
        step: step_name.clone(),
        event_kind: event.kind().clone(),
    });
    scope
        .timeline
        .add_event(step_name.clone(), iteration, EventType::Started);

    let ctx = StepContext::new(
        step_name.clone(),
        scope.run_id,
        iteration,
        scope.state.clone(),
        scope.services.clone(),
    );

    let step = workflow.step_mut(index);
    let outcome = scope.guard.run_until(step.run(&ctx, event)).await;

    let failure = match outcome {
        Ok(Ok(events)) => match check_declared(&spec, &events)
            .and_then(|()| check_handoffs(&spec, &*workflow, &events))
        {
            Ok(()) => {
                scope
                    .timeline
                    .add_event(step_name.clone(), iteration, EventType::Completed);
                for emitted in &events {
                    scope.bus.emit(LifecycleKind::StepProduced {
                        step: step_name.clone(),
                        event_kind: emitted.kind().clone(),
                    });
                }
                return Invocation::Emitted(events);
            }
            Err(e) => e,
        },
        Ok(Err(step_error)) => RunError::from_step(step_name.clone(), step_error),
        Err(interrupt) => {
            warn!("Step '{}' interrupted: {:?}", step_name, interrupt);
            RunError::from(interrupt)
        }
    };

    error!("Step '{}' failed: {}", step_name, failure);
    scope
        .timeline
        .add_event(step_name.clone(), iteration, EventType::Failed);
    scope.bus.emit(LifecycleKind::StepFailed {
        step: step_name,
        error: failure.to_string(),
    });
    Invocation::Failed(failure)
}

/// Fails on the first event kind the step emitted without declaring it.
fn check_declared(spec: &StepSpec, events: &[Event]) -> Result<(), RunError> {
    match events.iter().find(|e| !spec.may_emit(e.kind())) {
        Some(event) => Err(RunError::UndeclaredEvent {
            step: spec.name.clone(),
            kind: event.kind().clone(),
        }),
        None => Ok(()),
    }
}

/// Every handoff must name a registered step on the emitter's allow-list,
/// including handoffs a later stop in the same output would never dispatch.
fn check_handoffs(
    spec: &StepSpec,
    workflow: &Workflow,
    events: &[Event],
) -> Result<(), RunError> {
    for event in events.iter().filter(|e| e.kind() == &EventKind::Handoff) {
        let target = event
            .handoff_target()
            .ok_or_else(|| RunError::MissingHandoffTarget {
                from: spec.name.clone(),
            })?;

        if !spec.may_hand_off_to(target) || workflow.index_of(target).is_none() {
            return Err(RunError::IllegalHandoff {
                from: spec.name.clone(),
                to: target.to_string(),
            });
        }
    }
    Ok(())
}
