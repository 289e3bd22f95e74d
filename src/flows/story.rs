//! Human-in-the-Loop Story Flow
//!
//! The writer drafts a story segment with the completion service, then the
//! reader is asked how the story should continue. The run stays suspended on
//! the reader's answer; "done" (or the segment limit) ends the story.

use async_trait::async_trait;
use log::info;
use serde_json::Value;

use crate::workflow::{
    Event, EventKind, RunConfig, Step, StepContext, StepResult, Workflow, WorkflowError,
};

pub const SEGMENT_WRITTEN: &str = "segment_written";
pub const READER_CHOICE: &str = "reader_choice";

/// State key holding the segments written so far.
pub const STORY_KEY: &str = "story";

/// Reader reply that ends the story.
pub const DONE_REPLY: &str = "done";

const DEFAULT_MAX_SEGMENTS: u64 = 5;
const DEFAULT_PREMISE: &str = "a traveller arrives in a town where nobody sleeps";

pub fn build(config: &RunConfig) -> Result<Workflow, WorkflowError> {
    let max_segments = config
        .params
        .get("max_segments")
        .and_then(Value::as_u64)
        .unwrap_or(DEFAULT_MAX_SEGMENTS);

    Workflow::builder("story")
        .register(WriteSegment::new(max_segments))
        .register(AskReader)
        .build()
}

/// Appends one segment to the story.
pub struct WriteSegment {
    max_segments: u64,
}

impl WriteSegment {
    pub fn new(max_segments: u64) -> Self {
        Self { max_segments }
    }
}

#[async_trait]
impl Step for WriteSegment {
    fn name(&self) -> &str {
        "write"
    }

    fn accepts(&self) -> Vec<EventKind> {
        vec![EventKind::Start, EventKind::from(READER_CHOICE)]
    }

    fn emits(&self) -> Vec<EventKind> {
        vec![EventKind::from(SEGMENT_WRITTEN), EventKind::Stop]
    }

    async fn run(&mut self, ctx: &StepContext, event: Event) -> StepResult {
        let state = ctx.state();

        let prompt = if event.is(READER_CHOICE) {
            let story: Vec<String> = state.get_or(STORY_KEY, Vec::new()).await?;
            format!(
                "Story so far:\n{}\n\nThe reader chose: {}\nWrite the next short segment.",
                story.join("\n\n"),
                event.get_str("choice").unwrap_or_default()
            )
        } else {
            let premise = event.get_str("premise").unwrap_or(DEFAULT_PREMISE);
            format!(
                "Write the opening segment of a short story about {}.\n\
                 End with two options for what happens next.",
                premise
            )
        };

        let segment = ctx.completion().complete(&prompt).await?.as_text();

        let mut story = state.scoped_edit(STORY_KEY).await;
        if !story.is_array() {
            *story = Value::Array(Vec::new());
        }
        let count = match story.as_array_mut() {
            Some(segments) => {
                segments.push(Value::from(segment.clone()));
                segments.len() as u64
            }
            None => 0,
        };
        let full = story.clone();
        story.commit();

        info!("Segment {}/{} written", count, self.max_segments);
        if count >= self.max_segments {
            return Ok(vec![Event::stop(full)]);
        }

        Ok(vec![Event::custom(SEGMENT_WRITTEN).with("segment", segment)])
    }
}

/// Shows the latest segment to the reader and asks for a choice.
pub struct AskReader;

#[async_trait]
impl Step for AskReader {
    fn name(&self) -> &str {
        "ask_reader"
    }

    fn accepts(&self) -> Vec<EventKind> {
        vec![EventKind::from(SEGMENT_WRITTEN)]
    }

    fn emits(&self) -> Vec<EventKind> {
        vec![EventKind::from(READER_CHOICE), EventKind::Stop]
    }

    async fn run(&mut self, ctx: &StepContext, event: Event) -> StepResult {
        let segment = event.get_str("segment").unwrap_or_default();
        let prompt = format!(
            "{}\n\nWhat happens next? (type '{}' to finish)",
            segment, DONE_REPLY
        );

        let reply = ctx.human().prompt_human(&prompt).await?;
        let reply = reply.trim();

        if reply.eq_ignore_ascii_case(DONE_REPLY) {
            let story = ctx.state().get(STORY_KEY).await.unwrap_or(Value::Null);
            return Ok(vec![Event::stop(story)]);
        }

        Ok(vec![Event::custom(READER_CHOICE).with("choice", reply)])
    }
}
