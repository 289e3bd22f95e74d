//! Workflow Execution Engine
//!
//! The core engine that drives one run of a workflow:
//! - FIFO event queue seeded with the start event
//! - Routing of each event to its accepting step(s)
//! - Handoff allow-list enforcement
//! - Timeout, cancellation and iteration ceilings
//! - Lifecycle events and an execution timeline for observers
//!
//! Exactly one step body executes at a time. A step suspended on a slow
//! collaborator holds up the whole run until it resumes.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::Utc;
use log::{debug, error, info};
use serde_json::Value;
use tokio::sync::{mpsc, watch};

use crate::environment::Services;
use crate::monitoring::{ExecutionTimeline, LifecycleBus, LifecycleKind, LifecycleStream, RunStatus};
use crate::workflow::{Event, EventKind, Payload, RunConfig, SharedState, TimeoutMode, Workflow};

use super::error::{RunError, EXTERNAL_SOURCE};
use super::handle::{RunHandle, RunOutcome};
use super::step::{invoke_step, Invocation, InvocationScope, RunGuard};

/// Retry ceiling used until a config is supplied.
const DEFAULT_MAX_RETRIES: u32 = 3;

static RUN_COUNTER: AtomicU64 = AtomicU64::new(1);

fn next_run_id() -> String {
    format!(
        "run-{}-{}",
        Utc::now().format("%Y%m%d%H%M%S"),
        RUN_COUNTER.fetch_add(1, Ordering::Relaxed)
    )
}

/// Workflow execution engine.
///
/// Configured with `set_*` calls, then consumed by [`Engine::start`], which
/// spawns the run on the current tokio runtime and returns its handle.
///
/// # Example
///
/// ```rust,no_run
/// use std::time::Duration;
/// use steprunner::execution::Engine;
/// use steprunner::flows;
/// use steprunner::workflow::{Payload, RunConfig};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let config = RunConfig::new(3);
///     let workflow = flows::build("reflection", &config)?;
///
///     let mut engine = Engine::new(workflow);
///     engine.set_config(config);
///     engine.set_timeout(Duration::from_secs(30));
///
///     let handle = engine.start(Payload::new());
///     let result = handle.result().await?;
///     println!("{}", result);
///     Ok(())
/// }
/// ```
pub struct Engine {
    workflow: Workflow,
    config: RunConfig,
    services: Services,
    bus: LifecycleBus,
}

impl Engine {
    /// Creates a new execution engine for a workflow.
    pub fn new(workflow: Workflow) -> Self {
        Self {
            workflow,
            config: RunConfig::new(DEFAULT_MAX_RETRIES),
            services: Services::new(),
            bus: LifecycleBus::new(next_run_id()),
        }
    }

    /// Replaces the whole run configuration.
    pub fn set_config(&mut self, config: RunConfig) {
        self.config = config;
    }

    /// Sets the external collaborators steps may call.
    pub fn set_services(&mut self, services: Services) {
        self.services = services;
    }

    pub fn set_timeout(&mut self, timeout: Duration) {
        self.config.timeout_secs = timeout.as_secs_f64();
    }

    pub fn set_timeout_mode(&mut self, mode: TimeoutMode) {
        self.config.timeout_mode = mode;
    }

    /// Caps the number of step invocations in the run.
    pub fn set_max_iterations(&mut self, max: u64) {
        self.config.max_iterations = Some(max);
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    pub fn workflow(&self) -> &Workflow {
        &self.workflow
    }

    /// Identifier the run will carry once started.
    pub fn run_id(&self) -> &str {
        self.bus.run_id()
    }

    /// Subscribes to the run's lifecycle events, including `RunStarted`.
    pub fn stream_events(&self) -> LifecycleStream {
        self.bus.subscribe()
    }

    /// Starts the run. `params` are merged over the configured start
    /// parameters and carried by the start event.
    ///
    /// Must be called within a tokio runtime.
    pub fn start(self, params: Payload) -> RunHandle {
        let Engine {
            workflow,
            config,
            services,
            bus,
        } = self;

        let run_id = bus.run_id().to_string();
        let state = SharedState::from_map(config.initial_state.clone());
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();

        let mut start_params = config.params.clone();
        start_params.extend(params);

        let run = Run {
            run_id: run_id.clone(),
            workflow,
            config,
            services,
            state: state.clone(),
            bus: bus.clone(),
            inbox: inbox_rx,
            inbox_open: true,
            queue: VecDeque::new(),
            iterations: 0,
            timeline: ExecutionTimeline::new(),
        };

        let task = tokio::spawn(run.execute(Event::start(start_params), cancel_rx));
        RunHandle::new(run_id, state, bus, cancel_tx, inbox_tx, task)
    }

    /// Starts the run and waits for it to end.
    pub async fn run(self, params: Payload) -> RunOutcome {
        self.start(params).outcome().await
    }
}

/// An event waiting in the queue, with the index of the step that emitted
/// it (`None` for the start event and events sent through the handle).
struct Queued {
    event: Event,
    source: Option<usize>,
}

impl Queued {
    fn external(event: Event) -> Self {
        Self {
            event,
            source: None,
        }
    }
}

/// State owned by a spawned run task.
struct Run {
    run_id: String,
    workflow: Workflow,
    config: RunConfig,
    services: Services,
    state: SharedState,
    bus: LifecycleBus,
    inbox: mpsc::UnboundedReceiver<Event>,
    inbox_open: bool,
    queue: VecDeque<Queued>,
    iterations: u64,
    timeline: ExecutionTimeline,
}

impl Run {
    async fn execute(mut self, start: Event, cancel: watch::Receiver<bool>) -> RunOutcome {
        info!(
            "Starting run {} of workflow '{}' ({} steps, timeout {:.1}s {:?})",
            self.run_id,
            self.workflow.name(),
            self.workflow.len(),
            self.config.timeout_secs,
            self.config.timeout_mode
        );
        self.bus.emit(LifecycleKind::RunStarted {
            workflow: self.workflow.name().to_string(),
        });

        let result = match self.config.validate() {
            Ok(()) => {
                let mut guard = RunGuard::new(
                    self.config.timeout(),
                    self.config.timeout_mode,
                    self.state.clone(),
                    cancel,
                );
                self.drive(start, &mut guard).await
            }
            Err(e) => Err(RunError::Config(e)),
        };

        let status = match &result {
            Ok(value) => {
                info!(
                    "Run {} stopped after {} invocations: {}",
                    self.run_id, self.iterations, value
                );
                RunStatus::Stopped
            }
            Err(e) => {
                error!(
                    "Run {} ended after {} invocations: {}",
                    self.run_id, self.iterations, e
                );
                e.status()
            }
        };

        let state = self.state.snapshot().await;
        self.bus.emit(LifecycleKind::RunFinished { status });

        RunOutcome {
            run_id: self.run_id,
            result,
            iterations: self.iterations,
            timeline: self.timeline,
            state,
        }
    }

    /// Main loop: dequeue, route, invoke, enqueue, until a stop event or an
    /// error ends the run.
    async fn drive(&mut self, start: Event, guard: &mut RunGuard) -> Result<Value, RunError> {
        self.queue.push_back(Queued::external(start));

        loop {
            guard.check()?;

            while let Ok(event) = self.inbox.try_recv() {
                debug!("Run {}: external event '{}' queued", self.run_id, event.kind());
                self.queue.push_back(Queued::external(event));
            }

            let queued = match self.queue.pop_front() {
                Some(queued) => queued,
                None => self.wait_for_event(guard).await?,
            };

            if let Some(result) = self.dispatch(queued, guard).await? {
                return Ok(result);
            }
        }
    }

    /// Blocks on the handle's inbox while the queue is empty. With no way
    /// left for an event to arrive, waits out the timeout.
    async fn wait_for_event(&mut self, guard: &mut RunGuard) -> Result<Queued, RunError> {
        if self.inbox_open {
            debug!("Run {}: queue empty, waiting for external events", self.run_id);
            match guard.run_until(self.inbox.recv()).await? {
                Some(event) => return Ok(Queued::external(event)),
                None => self.inbox_open = false,
            }
        }

        debug!("Run {}: no event source left, waiting for timeout", self.run_id);
        let never = guard.run_until(std::future::pending::<Queued>()).await?;
        Ok(never)
    }

    /// Routes one dequeued event. Returns the run result if a stop event was
    /// consumed.
    async fn dispatch(
        &mut self,
        queued: Queued,
        guard: &mut RunGuard,
    ) -> Result<Option<Value>, RunError> {
        let Queued { event, source } = queued;
        let kind = event.kind().clone();

        match kind {
            EventKind::Stop => Ok(Some(stop_result(&event))),
            EventKind::Handoff => {
                let target = self.resolve_handoff(&event, source)?;
                self.invoke(target, event, guard).await
            }
            kind => {
                let targets = self.workflow.routes().resolve(&kind).to_vec();
                if targets.is_empty() {
                    return Err(RunError::Unrouted(kind));
                }

                // Fan-out delivers in registration order until one stops the run
                for index in targets {
                    if let Some(result) = self.invoke(index, event.clone(), guard).await? {
                        return Ok(Some(result));
                    }
                }
                Ok(None)
            }
        }
    }

    /// Checks a handoff against its emitter's allow-list and returns the
    /// target's index.
    fn resolve_handoff(&self, event: &Event, source: Option<usize>) -> Result<usize, RunError> {
        let from = match source {
            Some(index) => self.workflow.specs()[index].name.clone(),
            None => EXTERNAL_SOURCE.to_string(),
        };

        let target = event
            .handoff_target()
            .ok_or_else(|| RunError::MissingHandoffTarget { from: from.clone() })?;

        let allowed = source
            .map(|index| self.workflow.specs()[index].may_hand_off_to(target))
            .unwrap_or(false);

        let index = match (allowed, self.workflow.index_of(target)) {
            (true, Some(index)) => index,
            _ => {
                return Err(RunError::IllegalHandoff {
                    from,
                    to: target.to_string(),
                })
            }
        };

        let reason = event.handoff_reason().unwrap_or_default().to_string();
        info!("Handoff {} -> {} ({})", from, target, reason);
        self.bus.emit(LifecycleKind::HandoffRouted {
            from,
            to: target.to_string(),
            reason,
        });

        Ok(index)
    }

    /// Invokes one step and enqueues what it returned. A stop event among the
    /// returned events ends the run; anything after it is dropped.
    async fn invoke(
        &mut self,
        index: usize,
        event: Event,
        guard: &mut RunGuard,
    ) -> Result<Option<Value>, RunError> {
        self.iterations += 1;
        if let Some(max) = self.config.max_iterations {
            if self.iterations > max {
                return Err(RunError::IterationLimit(max));
            }
        }

        let scope = InvocationScope {
            run_id: &self.run_id,
            state: &self.state,
            services: &self.services,
            bus: &self.bus,
            timeline: &mut self.timeline,
            guard,
        };

        match invoke_step(&mut self.workflow, index, event, self.iterations, scope).await {
            Invocation::Failed(e) => Err(e),
            Invocation::Emitted(events) => {
                for emitted in events {
                    if emitted.kind() == &EventKind::Stop {
                        return Ok(Some(stop_result(&emitted)));
                    }
                    self.queue.push_back(Queued {
                        event: emitted,
                        source: Some(index),
                    });
                }
                Ok(None)
            }
        }
    }
}

fn stop_result(event: &Event) -> Value {
    event.result().cloned().unwrap_or(Value::Null)
}
