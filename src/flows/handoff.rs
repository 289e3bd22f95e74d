//! Concierge Handoff Flow
//!
//! A concierge reads the customer's request and hands control to one of the
//! specialists it is allowed to reach. Support may in turn escalate to a
//! manager. The engine rejects a handoff to any step outside the emitter's
//! allow-list, so the concierge can never reach escalation directly.

use async_trait::async_trait;
use log::info;
use serde_json::{json, Value};

use crate::environment::Completed;
use crate::workflow::{
    Event, EventKind, RunConfig, Step, StepContext, StepResult, Workflow, WorkflowError,
};

pub const BILLING: &str = "billing";
pub const SUPPORT: &str = "support";

/// Reachable from support only.
pub const ESCALATION: &str = "escalation";

/// Reply prefix a specialist's model uses to request escalation.
pub const ESCALATE_PREFIX: &str = "ESCALATE:";

const DEFAULT_REQUEST: &str = "I was charged twice this month.";

pub fn build(_config: &RunConfig) -> Result<Workflow, WorkflowError> {
    Workflow::builder("handoff")
        .register(Concierge::new(vec![BILLING.to_string(), SUPPORT.to_string()]))
        .register(Specialist::new(BILLING, "payments, invoices and refunds"))
        .register(Specialist::new(SUPPORT, "technical problems").escalates_to(ESCALATION))
        .register(Specialist::new(ESCALATION, "complaints a manager must see"))
        .build()
}

/// Picks a specialist for the request.
pub struct Concierge {
    targets: Vec<String>,
}

impl Concierge {
    pub fn new(targets: Vec<String>) -> Self {
        Self { targets }
    }
}

#[async_trait]
impl Step for Concierge {
    fn name(&self) -> &str {
        "concierge"
    }

    fn accepts(&self) -> Vec<EventKind> {
        vec![EventKind::Start]
    }

    fn emits(&self) -> Vec<EventKind> {
        vec![EventKind::Handoff]
    }

    fn handoff_targets(&self) -> Vec<String> {
        self.targets.clone()
    }

    async fn run(&mut self, ctx: &StepContext, event: Event) -> StepResult {
        let request = event.get_str("request").unwrap_or(DEFAULT_REQUEST);
        ctx.state().set("request", request).await?;

        let prompt = format!(
            "Route this customer request to one of: {}.\n\
             Reply with JSON {{\"target\": ..., \"reason\": ...}}.\n\nRequest: {}",
            self.targets.join(", "),
            request
        );

        let answer = ctx.completion().complete(&prompt).await?;
        let (target, reason) = parse_routing(&answer);
        info!("Concierge routes to '{}': {}", target, reason);

        Ok(vec![Event::handoff(target, reason)])
    }
}

/// Reads a routing decision: a `{target, reason}` object, or a bare step
/// name.
fn parse_routing(answer: &Completed) -> (String, String) {
    if let Ok(Value::Object(map)) = answer.to_json() {
        if let Some(target) = map.get("target").and_then(Value::as_str) {
            let reason = map
                .get("reason")
                .and_then(Value::as_str)
                .unwrap_or_default();
            return (target.trim().to_string(), reason.to_string());
        }
    }

    let text = answer.as_text();
    (text.trim().trim_matches('"').to_string(), String::new())
}

/// Answers the request within its topic and ends the run, or escalates
/// when its model asks to and an escalation target is configured.
pub struct Specialist {
    name: String,
    topic: String,
    escalation: Option<String>,
}

impl Specialist {
    pub fn new(name: impl Into<String>, topic: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            topic: topic.into(),
            escalation: None,
        }
    }

    pub fn escalates_to(mut self, target: impl Into<String>) -> Self {
        self.escalation = Some(target.into());
        self
    }
}

#[async_trait]
impl Step for Specialist {
    fn name(&self) -> &str {
        &self.name
    }

    fn accepts(&self) -> Vec<EventKind> {
        Vec::new()
    }

    fn emits(&self) -> Vec<EventKind> {
        match self.escalation {
            Some(_) => vec![EventKind::Stop, EventKind::Handoff],
            None => vec![EventKind::Stop],
        }
    }

    fn handoff_targets(&self) -> Vec<String> {
        self.escalation.iter().cloned().collect()
    }

    async fn run(&mut self, ctx: &StepContext, event: Event) -> StepResult {
        let request: String = ctx.state().get_or("request", String::new()).await?;
        let prompt = format!(
            "You handle {}. Handoff reason: {}\nAnswer the customer: {}",
            self.topic,
            event.handoff_reason().unwrap_or_default(),
            request
        );

        let reply = ctx.completion().complete(&prompt).await?.as_text();

        let escalation = reply.strip_prefix(ESCALATE_PREFIX);
        if let (Some(target), Some(reason)) = (&self.escalation, escalation) {
            info!("'{}' escalates to '{}'", self.name, target);
            return Ok(vec![Event::handoff(target.clone(), reason.trim())]);
        }

        Ok(vec![Event::stop(json!({
            "handled_by": self.name,
            "reply": reply,
        }))])
    }
}
