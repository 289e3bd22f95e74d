//! Run Lifecycle Events
//!
//! Observability stream of what a run is doing: steps starting, the events
//! they produce, handoffs and the final status. Events are broadcast; a
//! subscriber sees everything published after it subscribed and nothing
//! before. A slow subscriber skips events rather than slowing the run.

use chrono::{DateTime, Utc};
use log::warn;
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;

use crate::workflow::EventKind;

/// Buffered lifecycle events per subscriber before it starts skipping.
pub const LIFECYCLE_CAPACITY: usize = 256;

/// How a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// A stop event was consumed
    Stopped,
    /// A step, handoff or configuration error ended the run
    Failed,
    /// The run exceeded its timeout
    TimedOut,
    /// The caller cancelled the run
    Cancelled,
}

/// What happened.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LifecycleKind {
    RunStarted { workflow: String },
    StepStarted { step: String, event_kind: EventKind },
    StepProduced { step: String, event_kind: EventKind },
    StepFailed { step: String, error: String },
    HandoffRouted { from: String, to: String, reason: String },
    RunFinished { status: RunStatus },
}

/// A timestamped lifecycle event of one run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LifecycleEvent {
    pub run_id: String,
    pub at: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: LifecycleKind,
}

/// Publisher side of a run's lifecycle stream.
#[derive(Debug, Clone)]
pub struct LifecycleBus {
    run_id: String,
    sender: broadcast::Sender<LifecycleEvent>,
}

impl LifecycleBus {
    pub fn new(run_id: impl Into<String>) -> Self {
        let (sender, _) = broadcast::channel(LIFECYCLE_CAPACITY);
        Self {
            run_id: run_id.into(),
            sender,
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Publishes an event. Having no subscribers is not an error.
    pub fn emit(&self, kind: LifecycleKind) {
        let _ = self.sender.send(LifecycleEvent {
            run_id: self.run_id.clone(),
            at: Utc::now(),
            kind,
        });
    }

    /// Starts a new stream from this point on.
    pub fn subscribe(&self) -> LifecycleStream {
        LifecycleStream {
            receiver: self.sender.subscribe(),
            finished: false,
        }
    }
}

/// Subscriber side of a run's lifecycle stream. Ends after `RunFinished`.
pub struct LifecycleStream {
    receiver: broadcast::Receiver<LifecycleEvent>,
    finished: bool,
}

impl LifecycleStream {
    /// Waits for the next event; `None` once the run has finished.
    pub async fn next(&mut self) -> Option<LifecycleEvent> {
        if self.finished {
            return None;
        }

        loop {
            match self.receiver.recv().await {
                Ok(event) => {
                    if matches!(event.kind, LifecycleKind::RunFinished { .. }) {
                        self.finished = true;
                    }
                    return Some(event);
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!("Lifecycle subscriber lagged; skipped {} events", skipped);
                }
                Err(RecvError::Closed) => {
                    self.finished = true;
                    return None;
                }
            }
        }
    }

    /// Drains events until the run finishes.
    pub async fn collect(mut self) -> Vec<LifecycleEvent> {
        let mut events = Vec::new();
        while let Some(event) = self.next().await {
            events.push(event);
        }
        events
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_emit_without_subscribers() {
        let bus = LifecycleBus::new("run-1");
        bus.emit(LifecycleKind::RunStarted {
            workflow: "wf".into(),
        });
        assert_eq!(bus.run_id(), "run-1");
    }

    #[tokio::test]
    async fn test_subscriber_sees_later_events_only() {
        let bus = LifecycleBus::new("run-1");
        bus.emit(LifecycleKind::RunStarted {
            workflow: "wf".into(),
        });

        let stream = bus.subscribe();
        bus.emit(LifecycleKind::StepStarted {
            step: "a".into(),
            event_kind: EventKind::Start,
        });
        bus.emit(LifecycleKind::RunFinished {
            status: RunStatus::Stopped,
        });

        let events = stream.collect().await;
        assert_eq!(events.len(), 2);
        assert!(matches!(events[0].kind, LifecycleKind::StepStarted { .. }));
        assert_eq!(events[0].run_id, "run-1");
    }

    #[tokio::test]
    async fn test_stream_ends_after_finish() {
        let bus = LifecycleBus::new("run-1");
        let mut stream = bus.subscribe();
        bus.emit(LifecycleKind::RunFinished {
            status: RunStatus::Cancelled,
        });

        assert!(stream.next().await.is_some());
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn test_stream_ends_when_bus_dropped() {
        let bus = LifecycleBus::new("run-1");
        let mut stream = bus.subscribe();
        drop(bus);
        assert!(stream.next().await.is_none());
    }

    #[test]
    fn test_event_json_shape() {
        let event = LifecycleEvent {
            run_id: "r".into(),
            at: Utc::now(),
            kind: LifecycleKind::HandoffRouted {
                from: "a".into(),
                to: "b".into(),
                reason: "billing".into(),
            },
        };

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "handoff_routed");
        assert_eq!(json["to"], "b");
        assert_eq!(json["run_id"], "r");
    }
}
