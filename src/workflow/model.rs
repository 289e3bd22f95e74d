//! Workflow Data Model
//!
//! A [`Workflow`] is a validated set of registered steps plus the routing
//! table derived from their declarations. It can only be obtained through
//! [`WorkflowBuilder::build`], so an engine never sees an unchecked graph.
//!
//! # Example
//!
//! ```rust,ignore
//! let workflow = Workflow::builder("extraction")
//!     .register(ExtractStep::new(3))
//!     .register(ValidateStep::new(["cars"]))
//!     .build()?;
//! ```

use std::collections::HashSet;
use std::fmt;

use serde::Serialize;

use super::event::EventKind;
use super::step::Step;
use super::validator::{validate_registration, RoutingTable, WorkflowError};

/// The declarations of one registered step, captured at registration time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StepSpec {
    /// Unique step name
    pub name: String,

    /// Event kinds routed to this step
    pub accepts: Vec<EventKind>,

    /// Event kinds this step may emit
    pub emits: Vec<EventKind>,

    /// Steps this step may hand control to
    pub handoff_targets: Vec<String>,
}

impl StepSpec {
    /// Captures the declarations of a step.
    pub fn of(step: &dyn Step) -> Self {
        Self {
            name: step.name().to_string(),
            accepts: step.accepts(),
            emits: step.emits(),
            handoff_targets: step.handoff_targets(),
        }
    }

    pub fn may_emit(&self, kind: &EventKind) -> bool {
        self.emits.contains(kind)
    }

    pub fn may_hand_off_to(&self, target: &str) -> bool {
        self.handoff_targets.iter().any(|t| t == target)
    }
}

/// A statically possible transition between two steps.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Edge {
    pub from: String,
    pub kind: EventKind,
    pub to: String,
}

/// Collects steps and produces a validated [`Workflow`].
pub struct WorkflowBuilder {
    name: String,
    steps: Vec<Box<dyn Step>>,
    fan_out: HashSet<EventKind>,
}

impl WorkflowBuilder {
    /// Registers a step. Steps are dispatched in registration order when a
    /// kind fans out.
    pub fn register<S: Step>(self, step: S) -> Self {
        self.register_boxed(Box::new(step))
    }

    pub fn register_boxed(mut self, step: Box<dyn Step>) -> Self {
        self.steps.push(step);
        self
    }

    /// Allows `kind` to be accepted by several steps; each acceptor is
    /// invoked in turn.
    pub fn fan_out(mut self, kind: impl Into<EventKind>) -> Self {
        self.fan_out.insert(kind.into());
        self
    }

    /// Validates the registered steps.
    pub fn build(self) -> Result<Workflow, WorkflowError> {
        let specs: Vec<StepSpec> = self.steps.iter().map(|s| StepSpec::of(s.as_ref())).collect();
        let routes = validate_registration(&specs, &self.fan_out)?;

        Ok(Workflow {
            name: self.name,
            specs,
            steps: self.steps,
            routes,
        })
    }
}

/// A validated workflow, ready to be run by an
/// [`Engine`](crate::execution::Engine).
pub struct Workflow {
    name: String,
    specs: Vec<StepSpec>,
    steps: Vec<Box<dyn Step>>,
    routes: RoutingTable,
}

impl fmt::Debug for Workflow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Workflow")
            .field("name", &self.name)
            .field("specs", &self.specs)
            .field("routes", &self.routes)
            .finish_non_exhaustive()
    }
}

impl Workflow {
    pub fn builder(name: impl Into<String>) -> WorkflowBuilder {
        WorkflowBuilder {
            name: name.into(),
            steps: Vec::new(),
            fan_out: HashSet::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.specs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }

    /// Declarations of every step, in registration order.
    pub fn specs(&self) -> &[StepSpec] {
        &self.specs
    }

    pub fn spec(&self, name: &str) -> Option<&StepSpec> {
        self.specs.iter().find(|s| s.name == name)
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.specs.iter().position(|s| s.name == name)
    }

    pub fn routes(&self) -> &RoutingTable {
        &self.routes
    }

    /// Every statically possible transition: routed emissions plus declared
    /// handoffs. Stop has no destination and is omitted.
    pub fn edges(&self) -> Vec<Edge> {
        let mut edges = Vec::new();

        for spec in &self.specs {
            for kind in &spec.emits {
                for &to in self.routes.resolve(kind) {
                    edges.push(Edge {
                        from: spec.name.clone(),
                        kind: kind.clone(),
                        to: self.specs[to].name.clone(),
                    });
                }
            }
            for target in &spec.handoff_targets {
                edges.push(Edge {
                    from: spec.name.clone(),
                    kind: EventKind::Handoff,
                    to: target.clone(),
                });
            }
        }

        edges
    }

    /// Renders the step graph as indented text, one step per block.
    pub fn describe(&self) -> String {
        let mut output = format!("Workflow '{}' ({} steps)\n", self.name, self.len());
        let edges = self.edges();

        for spec in &self.specs {
            let accepts: Vec<&str> = spec.accepts.iter().map(EventKind::as_str).collect();
            output.push_str(&format!("\n  {} <- [{}]\n", spec.name, accepts.join(", ")));

            for edge in edges.iter().filter(|e| e.from == spec.name) {
                output.push_str(&format!("    --{}--> {}\n", edge.kind, edge.to));
            }
            if spec.may_emit(&EventKind::Stop) {
                output.push_str("    --stop--> (end)\n");
            }
        }

        output
    }

    pub(crate) fn step_mut(&mut self, index: usize) -> &mut dyn Step {
        self.steps[index].as_mut()
    }
}
