//! Static step graphs, one per process type
//!
//! A graph says what happens after a step reaches DONE: a direct successor,
//! a fan-out into sibling steps sharing a join group, or completion of the
//! process. Join groups map to the single successor released once every
//! member is DONE.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;

/// Name of the step every process instance starts with
pub const INITIAL_STEP: &str = "prepare";

/// What follows a step once it is DONE
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    /// Create and dispatch a single successor step
    Next(String),

    /// Create sibling steps tagged with `join_group` and dispatch each
    FanOut {
        join_group: String,
        steps: Vec<String>,
    },

    /// Mark the process instance COMPLETED
    Complete,
}

/// Errors from graph validation
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GraphError {
    #[error("process type must not be empty")]
    EmptyProcessType,

    #[error("step '{0}' has more than one transition")]
    DuplicateTransition(String),

    #[error("step '{0}' fans out to no steps")]
    EmptyFanOut(String),

    #[error("join group '{0}' is used by more than one fan-out")]
    JoinGroupReused(String),

    #[error("join group '{0}' has no successor")]
    MissingJoin(String),

    #[error("join group '{0}' is joined more than once")]
    DuplicateJoin(String),

    #[error("join group '{0}' is never fanned out")]
    UnknownJoinGroup(String),

    #[error("initial step '{INITIAL_STEP}' has no transition")]
    NoInitialTransition,
}

/// Step graph for one process type
///
/// # Example
///
/// ```
/// use procflow_durable::engine::{ProcessGraph, Transition};
///
/// let graph = ProcessGraph::builder("order")
///     .then("prepare", "dispatch")
///     .fan_out("dispatch", "calls", ["call_a", "call_b", "call_c"])
///     .join("calls", "finalize")
///     .complete("finalize")
///     .build()
///     .unwrap();
///
/// assert_eq!(graph.join_successor("calls"), Some("finalize"));
/// assert_eq!(graph.transition("finalize"), Some(&Transition::Complete));
/// ```
#[derive(Clone)]
pub struct ProcessGraph {
    process_type: String,
    transitions: HashMap<String, Transition>,
    joins: HashMap<String, String>,
}

impl ProcessGraph {
    /// Start building a graph
    pub fn builder(process_type: impl Into<String>) -> ProcessGraphBuilder {
        ProcessGraphBuilder {
            process_type: process_type.into(),
            transitions: Vec::new(),
            joins: Vec::new(),
        }
    }

    pub fn process_type(&self) -> &str {
        &self.process_type
    }

    pub fn initial_step(&self) -> &'static str {
        INITIAL_STEP
    }

    /// Transition out of `step_name`, if the graph defines one
    pub fn transition(&self, step_name: &str) -> Option<&Transition> {
        self.transitions.get(step_name)
    }

    /// Successor released by `join_group`'s barrier
    pub fn join_successor(&self, join_group: &str) -> Option<&str> {
        self.joins.get(join_group).map(String::as_str)
    }

    /// Every step name the graph can create
    pub fn step_names(&self) -> BTreeSet<&str> {
        let mut names = BTreeSet::new();
        names.insert(INITIAL_STEP);
        for (from, transition) in &self.transitions {
            names.insert(from.as_str());
            match transition {
                Transition::Next(next) => {
                    names.insert(next.as_str());
                }
                Transition::FanOut { steps, .. } => {
                    names.extend(steps.iter().map(String::as_str));
                }
                Transition::Complete => {}
            }
        }
        names.extend(self.joins.values().map(String::as_str));
        names
    }
}

impl fmt::Debug for ProcessGraph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessGraph")
            .field("process_type", &self.process_type)
            .field("steps", &self.step_names())
            .finish()
    }
}

/// Builder for [`ProcessGraph`]
#[derive(Debug, Clone)]
pub struct ProcessGraphBuilder {
    process_type: String,
    transitions: Vec<(String, Transition)>,
    joins: Vec<(String, String)>,
}

impl ProcessGraphBuilder {
    /// `from` is followed directly by `to`
    pub fn then(mut self, from: impl Into<String>, to: impl Into<String>) -> Self {
        self.transitions
            .push((from.into(), Transition::Next(to.into())));
        self
    }

    /// `from` fans out into `steps`, all tagged with `join_group`
    pub fn fan_out<I, S>(mut self, from: impl Into<String>, join_group: impl Into<String>, steps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.transitions.push((
            from.into(),
            Transition::FanOut {
                join_group: join_group.into(),
                steps: steps.into_iter().map(Into::into).collect(),
            },
        ));
        self
    }

    /// Once every member of `join_group` is DONE, `next` is created
    pub fn join(mut self, join_group: impl Into<String>, next: impl Into<String>) -> Self {
        self.joins.push((join_group.into(), next.into()));
        self
    }

    /// `step` completes the process
    pub fn complete(mut self, step: impl Into<String>) -> Self {
        self.transitions.push((step.into(), Transition::Complete));
        self
    }

    /// Validate and build the graph
    pub fn build(self) -> Result<ProcessGraph, GraphError> {
        if self.process_type.trim().is_empty() {
            return Err(GraphError::EmptyProcessType);
        }

        let mut transitions = HashMap::new();
        let mut fanned_groups = BTreeSet::new();
        for (from, transition) in self.transitions {
            if let Transition::FanOut { join_group, steps } = &transition {
                if steps.is_empty() {
                    return Err(GraphError::EmptyFanOut(from));
                }
                if !fanned_groups.insert(join_group.clone()) {
                    return Err(GraphError::JoinGroupReused(join_group.clone()));
                }
            }
            if transitions.contains_key(&from) {
                return Err(GraphError::DuplicateTransition(from));
            }
            transitions.insert(from, transition);
        }

        let mut joins = HashMap::new();
        for (group, next) in self.joins {
            if !fanned_groups.contains(&group) {
                return Err(GraphError::UnknownJoinGroup(group));
            }
            if joins.insert(group.clone(), next).is_some() {
                return Err(GraphError::DuplicateJoin(group));
            }
        }

        if let Some(group) = fanned_groups.iter().find(|g| !joins.contains_key(*g)) {
            return Err(GraphError::MissingJoin(group.clone()));
        }

        if !transitions.contains_key(INITIAL_STEP) {
            return Err(GraphError::NoInitialTransition);
        }

        Ok(ProcessGraph {
            process_type: self.process_type,
            transitions,
            joins,
        })
    }
}

/// Graphs keyed by process type
#[derive(Debug, Default, Clone)]
pub struct GraphRegistry {
    graphs: HashMap<String, Arc<ProcessGraph>>,
}

impl GraphRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a graph, replacing any previous one for the same process type
    pub fn register(&mut self, graph: ProcessGraph) {
        self.graphs
            .insert(graph.process_type.clone(), Arc::new(graph));
    }

    pub fn get(&self, process_type: &str) -> Option<Arc<ProcessGraph>> {
        self.graphs.get(process_type).cloned()
    }

    pub fn contains(&self, process_type: &str) -> bool {
        self.graphs.contains_key(process_type)
    }

    pub fn process_types(&self) -> impl Iterator<Item = &str> {
        self.graphs.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.graphs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.graphs.is_empty()
    }
}
