//! Step handler registry
//!
//! Handlers are business callables invoked by the executor once a step has
//! been claimed. The registry maps step names to type-erased handlers so the
//! executor can resolve them from the step name carried by a task.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use super::graph::ProcessGraph;

/// Everything a handler learns about the step it runs
#[derive(Debug, Clone)]
pub struct StepContext {
    pub process_id: i64,
    pub process_type: String,
    pub step_name: String,

    /// Claim attempt (1 for the first execution)
    pub attempt: u32,

    /// Copy of the instance payload
    pub payload: Value,
}

/// Error returned by a step handler
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{message}")]
pub struct StepError {
    pub message: String,

    /// Hint for the transport; the step itself is FAILED either way
    pub retryable: bool,
}

impl StepError {
    /// A failure worth redelivering
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: true,
        }
    }

    /// A failure that will not improve on redelivery
    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: false,
        }
    }
}

impl From<anyhow::Error> for StepError {
    fn from(err: anyhow::Error) -> Self {
        Self::retryable(format!("{err:#}"))
    }
}

/// Business logic for one step
#[async_trait]
pub trait StepHandler: Send + Sync + 'static {
    async fn execute(&self, ctx: &StepContext) -> Result<(), StepError>;
}

struct FnHandler<F> {
    f: F,
}

#[async_trait]
impl<F, Fut> StepHandler for FnHandler<F>
where
    F: Fn(StepContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), StepError>> + Send + 'static,
{
    async fn execute(&self, ctx: &StepContext) -> Result<(), StepError> {
        (self.f)(ctx.clone()).await
    }
}

/// Registry of step handlers keyed by step name
#[derive(Default, Clone)]
pub struct StepRegistry {
    handlers: HashMap<String, Arc<dyn StepHandler>>,
}

impl StepRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler, replacing any previous one for `step_name`
    pub fn register(&mut self, step_name: impl Into<String>, handler: impl StepHandler) {
        self.handlers.insert(step_name.into(), Arc::new(handler));
    }

    /// Register an async closure as a handler
    ///
    /// # Example
    ///
    /// ```
    /// use procflow_durable::engine::StepRegistry;
    ///
    /// let mut registry = StepRegistry::new();
    /// registry.register_fn("prepare", |ctx| async move {
    ///     tracing::info!(process_id = ctx.process_id, "preparing");
    ///     Ok(())
    /// });
    /// assert!(registry.contains("prepare"));
    /// ```
    pub fn register_fn<F, Fut>(&mut self, step_name: impl Into<String>, f: F)
    where
        F: Fn(StepContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), StepError>> + Send + 'static,
    {
        self.register(step_name, FnHandler { f });
    }

    pub fn get(&self, step_name: &str) -> Option<Arc<dyn StepHandler>> {
        self.handlers.get(step_name).cloned()
    }

    pub fn contains(&self, step_name: &str) -> bool {
        self.handlers.contains_key(step_name)
    }

    /// Steps of `graph` that have no registered handler, sorted
    pub fn missing_for(&self, graph: &ProcessGraph) -> Vec<String> {
        graph
            .step_names()
            .into_iter()
            .filter(|name| !self.contains(name))
            .map(str::to_string)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    pub fn step_names(&self) -> impl Iterator<Item = &str> {
        self.handlers.keys().map(|s| s.as_str())
    }
}

impl fmt::Debug for StepRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<_> = self.handlers.keys().collect();
        names.sort();
        f.debug_struct("StepRegistry")
            .field("step_names", &names)
            .finish()
    }
}
