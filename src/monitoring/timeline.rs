//! Execution Timeline
//!
//! Tracks when each step invocation started and ended, for run summaries and
//! Gantt-style reports. A step that loops appears once per invocation.

use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Type of timeline event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    /// Step invocation started
    Started,
    /// Step invocation returned events
    Completed,
    /// Step invocation failed, timed out or was cancelled
    Failed,
}

/// A single event in the execution timeline.
#[derive(Debug, Clone)]
pub struct TimelineEvent {
    /// Name of the step
    pub step: String,
    /// Run-wide invocation number
    pub invocation: u64,
    /// Type of event
    pub event_type: EventType,
    /// When the event occurred
    pub timestamp: Instant,
}

/// One finished invocation, derived from its start and end events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Span {
    pub step: String,
    pub invocation: u64,
    pub start: Duration,
    pub end: Duration,
    pub failed: bool,
}

impl Span {
    pub fn duration(&self) -> Duration {
        self.end.saturating_sub(self.start)
    }
}

/// Records the step invocations of a run.
#[derive(Debug, Clone)]
pub struct ExecutionTimeline {
    events: Vec<TimelineEvent>,
    start_time: Instant,
}

impl ExecutionTimeline {
    /// Creates a new timeline starting now.
    pub fn new() -> Self {
        Self {
            events: Vec::new(),
            start_time: Instant::now(),
        }
    }

    /// Records an event for a step invocation.
    pub fn add_event(&mut self, step: impl Into<String>, invocation: u64, event_type: EventType) {
        self.events.push(TimelineEvent {
            step: step.into(),
            invocation,
            event_type,
            timestamp: Instant::now(),
        });
    }

    /// Returns all recorded events.
    pub fn get_events(&self) -> &[TimelineEvent] {
        &self.events
    }

    /// Returns the total elapsed time since timeline creation.
    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// Number of times `step` was invoked.
    pub fn invocations(&self, step: &str) -> usize {
        self.events
            .iter()
            .filter(|e| e.step == step && e.event_type == EventType::Started)
            .count()
    }

    /// Finished invocations in start order.
    pub fn spans(&self) -> Vec<Span> {
        let mut starts: HashMap<u64, &TimelineEvent> = HashMap::new();
        let mut spans = Vec::new();

        for event in &self.events {
            match event.event_type {
                EventType::Started => {
                    starts.insert(event.invocation, event);
                }
                EventType::Completed | EventType::Failed => {
                    if let Some(start) = starts.remove(&event.invocation) {
                        spans.push(Span {
                            step: event.step.clone(),
                            invocation: event.invocation,
                            start: start.timestamp.duration_since(self.start_time),
                            end: event.timestamp.duration_since(self.start_time),
                            failed: event.event_type == EventType::Failed,
                        });
                    }
                }
            }
        }

        spans.sort_by_key(|s| s.invocation);
        spans
    }

    /// Returns total time spent per step in milliseconds, summed across
    /// invocations.
    pub fn get_durations(&self) -> HashMap<String, u128> {
        let mut durations: HashMap<String, u128> = HashMap::new();
        for span in self.spans() {
            *durations.entry(span.step.clone()).or_insert(0) += span.duration().as_millis();
        }
        durations
    }

    /// Generates an ASCII Gantt chart, one bar per invocation.
    pub fn gantt_chart(&self) -> String {
        let mut output = String::from("\nExecution Timeline:\n\n");

        let total_time = self.elapsed().as_millis();
        if total_time == 0 {
            return output;
        }

        // Scale to 50 characters width
        let scale = 50.0 / total_time as f64;

        for span in self.spans() {
            let start = span.start.as_millis();
            let start_pos = (start as f64 * scale) as usize;
            let width = (span.duration().as_millis() as f64 * scale).max(1.0) as usize;

            let mut bar = " ".repeat(start_pos);
            bar.push_str(&(if span.failed { "x" } else { "#" }).repeat(width));

            let label = format!("{}#{}", span.step, span.invocation);
            output.push_str(&format!(
                "{:16} |{}| ({} ms)\n",
                truncate(&label, 16),
                bar,
                span.duration().as_millis()
            ));
        }

        output.push_str(&format!("\nTotal: {} ms\n", total_time));
        output
    }
}

impl Default for ExecutionTimeline {
    fn default() -> Self {
        Self::new()
    }
}

/// Pads or truncates a label to a fixed width.
fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        format!("{:width$}", s, width = max_len)
    } else {
        let head: String = s.chars().take(max_len - 3).collect();
        format!("{}...", head)
    }
}
