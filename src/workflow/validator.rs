//! Registration Validation
//!
//! Checks a set of step declarations before any run starts and builds the
//! routing table the scheduler dispatches with:
//!
//! - Step names are non-empty and unique
//! - Exactly the reserved kinds are used where they belong (some step
//!   accepts `start`, nobody accepts `stop`, nobody emits `start`)
//! - Every emitted user kind is accepted by some other step
//! - Handoff allow-lists are present and name registered steps
//! - A step accepting nothing is reachable by handoff
//! - Each routed kind has exactly one acceptor, unless it fans out

use std::collections::{BTreeMap, HashMap, HashSet};

use log::{debug, info, warn};
use thiserror::Error;

use super::event::EventKind;
use super::model::StepSpec;

/// Errors detected while registering steps.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WorkflowError {
    #[error("workflow has no steps")]
    EmptyWorkflow,

    #[error("step has an empty or whitespace-only name")]
    EmptyStepName,

    #[error("duplicate step name: '{0}'")]
    DuplicateStep(String),

    #[error("no step accepts the start event")]
    MissingStart,

    #[error("step '{0}' accepts no events and is no step's handoff target")]
    Unreachable(String),

    #[error("step '{0}' accepts the stop event, which is never dispatched")]
    AcceptsStop(String),

    #[error("step '{0}' emits a start event; a run has exactly one")]
    EmitsStart(String),

    #[error("step '{step}' emits '{kind}' but no other step accepts it")]
    UnroutedOutput { step: String, kind: EventKind },

    #[error("step '{0}' emits handoff events but declares no handoff targets")]
    MissingHandoffTargets(String),

    #[error("step '{step}' lists unknown handoff target '{target}'")]
    UnknownHandoffTarget { step: String, target: String },

    #[error("step '{0}' lists itself as a handoff target")]
    SelfHandoff(String),

    #[error("event '{kind}' is accepted by several steps ({}) and is not declared fan-out", .steps.join(", "))]
    AmbiguousRoute { kind: EventKind, steps: Vec<String> },
}

impl WorkflowError {
    /// True for ambiguous-route errors; everything else is a configuration
    /// error in the step graph.
    pub fn is_ambiguous_route(&self) -> bool {
        matches!(self, Self::AmbiguousRoute { .. })
    }
}

/// Maps each routed event kind to the steps that receive it, in
/// registration order. Handoff events are routed dynamically and never
/// appear here.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoutingTable {
    routes: HashMap<EventKind, Vec<usize>>,
}

impl RoutingTable {
    /// Indices of the steps receiving `kind`. Empty if none.
    pub fn resolve(&self, kind: &EventKind) -> &[usize] {
        self.routes.get(kind).map(Vec::as_slice).unwrap_or(&[])
    }

    /// True if `kind` is delivered to more than one step.
    pub fn fans_out(&self, kind: &EventKind) -> bool {
        self.resolve(kind).len() > 1
    }

    /// Routed kinds in sorted order.
    pub fn kinds(&self) -> Vec<&EventKind> {
        let mut kinds: Vec<&EventKind> = self.routes.keys().collect();
        kinds.sort();
        kinds
    }
}

/// Validates step declarations and builds the routing table.
pub fn validate_registration(
    specs: &[StepSpec],
    fan_out: &HashSet<EventKind>,
) -> Result<RoutingTable, WorkflowError> {
    info!("Validating workflow with {} steps", specs.len());

    if specs.is_empty() {
        return Err(WorkflowError::EmptyWorkflow);
    }

    let mut names: HashSet<&str> = HashSet::new();
    for spec in specs {
        if spec.name.trim().is_empty() {
            return Err(WorkflowError::EmptyStepName);
        }
        if !names.insert(spec.name.as_str()) {
            return Err(WorkflowError::DuplicateStep(spec.name.clone()));
        }
    }

    let mut acceptors: BTreeMap<EventKind, Vec<usize>> = BTreeMap::new();
    for (index, spec) in specs.iter().enumerate() {
        for kind in &spec.accepts {
            match kind {
                EventKind::Stop => return Err(WorkflowError::AcceptsStop(spec.name.clone())),
                EventKind::Handoff => {
                    debug!("Step '{}' is a handoff destination", spec.name);
                }
                _ => {
                    let entry = acceptors.entry(kind.clone()).or_default();
                    if !entry.contains(&index) {
                        entry.push(index);
                    }
                }
            }
        }
    }

    if !acceptors.contains_key(&EventKind::Start) {
        return Err(WorkflowError::MissingStart);
    }

    for spec in specs {
        validate_outputs(spec, &acceptors, specs)?;
        validate_handoffs(spec, &names)?;
    }

    for (kind, indices) in &acceptors {
        if indices.len() > 1 && !fan_out.contains(kind) {
            return Err(WorkflowError::AmbiguousRoute {
                kind: kind.clone(),
                steps: indices.iter().map(|&i| specs[i].name.clone()).collect(),
            });
        }
    }

    for kind in fan_out {
        if !acceptors.contains_key(kind) {
            warn!("Fan-out declared for '{}' but no step accepts it", kind);
        }
    }

    let handoff_destinations: HashSet<&str> = specs
        .iter()
        .flat_map(|s| s.handoff_targets.iter().map(String::as_str))
        .collect();

    for spec in specs {
        if spec.accepts.is_empty() && !handoff_destinations.contains(spec.name.as_str()) {
            return Err(WorkflowError::Unreachable(spec.name.clone()));
        }
        if spec.emits.is_empty() {
            debug!("Step '{}' is a sink (emits nothing)", spec.name);
        }
    }

    info!("Workflow validated: {} routed event kinds", acceptors.len());

    Ok(RoutingTable {
        routes: acceptors.into_iter().collect(),
    })
}

/// Every emitted kind must have a destination other than the emitter.
fn validate_outputs(
    spec: &StepSpec,
    acceptors: &BTreeMap<EventKind, Vec<usize>>,
    specs: &[StepSpec],
) -> Result<(), WorkflowError> {
    for kind in &spec.emits {
        match kind {
            EventKind::Stop | EventKind::Handoff => {}
            EventKind::Start => return Err(WorkflowError::EmitsStart(spec.name.clone())),
            EventKind::Custom(_) => {
                let has_other = acceptors
                    .get(kind)
                    .map(|indices| indices.iter().any(|&i| specs[i].name != spec.name))
                    .unwrap_or(false);

                if !has_other {
                    return Err(WorkflowError::UnroutedOutput {
                        step: spec.name.clone(),
                        kind: kind.clone(),
                    });
                }
            }
        }
    }
    Ok(())
}

fn validate_handoffs(spec: &StepSpec, names: &HashSet<&str>) -> Result<(), WorkflowError> {
    if spec.emits.contains(&EventKind::Handoff) && spec.handoff_targets.is_empty() {
        return Err(WorkflowError::MissingHandoffTargets(spec.name.clone()));
    }

    for target in &spec.handoff_targets {
        if *target == spec.name {
            return Err(WorkflowError::SelfHandoff(spec.name.clone()));
        }
        if !names.contains(target.as_str()) {
            return Err(WorkflowError::UnknownHandoffTarget {
                step: spec.name.clone(),
                target: target.clone(),
            });
        }
    }

    if !spec.handoff_targets.is_empty() && !spec.emits.contains(&EventKind::Handoff) {
        warn!(
            "Step '{}' declares handoff targets but never emits handoff events",
            spec.name
        );
    }

    Ok(())
}
