//! The task-spec contract: the seam between the engine and node behavior.
//!
//! Specs are immutable, shared templates; per-instance state lives on the
//! [`TaskNode`](crate::tree::TaskNode). The engine drives every node through
//! the same three hooks and never inspects spec internals; capability flags
//! (`is_manual`, `is_end`, `event_definition`, ...) are the only way a spec
//! influences generic engine behavior.

use crate::engine::Workflow;
use crate::error::{EngineError, EngineResult};
use crate::tree::TaskId;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// A catch-event declaration: the name the workflow model uses internally,
/// plus the external name the outside world delivers it under, when the two
/// differ.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EventDefinition {
    pub name: String,
    pub message: Option<String>,
}

impl EventDefinition {
    pub fn signal(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: None,
        }
    }

    pub fn message(name: impl Into<String>, external: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: Some(external.into()),
        }
    }
}

/// Behavior template shared by every task instantiated from it.
///
/// `predict` annotates descendants with lookahead states and must only
/// produce `Likely`/`Maybe`/`Future` effects; `update` re-derives a node's
/// state from current facts and must be idempotent; `on_complete` runs the
/// node's side effects immediately before it is marked `Completed`.
pub trait TaskSpec: Send + Sync {
    fn name(&self) -> &str;

    /// Manual tasks are skipped by `complete_next` unless it runs
    /// unrestricted.
    fn is_manual(&self) -> bool {
        false
    }

    /// Containers grouping a primary activity with boundary events. The
    /// correlation sweep re-arms completed boundary children of such nodes.
    fn is_boundary_event_container(&self) -> bool {
        false
    }

    /// End nodes merge their task data into workflow data on completion.
    fn is_end(&self) -> bool {
        false
    }

    /// The event this spec catches, if it is a catch-event.
    fn event_definition(&self) -> Option<&EventDefinition> {
        None
    }

    fn predict(&self, _workflow: &mut Workflow, _task: TaskId) -> anyhow::Result<()> {
        Ok(())
    }

    fn update(&self, workflow: &mut Workflow, task: TaskId) -> anyhow::Result<()>;

    fn on_complete(&self, _workflow: &mut Workflow, _task: TaskId) -> anyhow::Result<()> {
        Ok(())
    }
}

impl fmt::Debug for dyn TaskSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TaskSpec({})", self.name())
    }
}

/// Sentinel spec for the tree's root node. Never user-visible; the root is
/// created `Completed` and stays that way.
pub(crate) struct RootSpec;

impl TaskSpec for RootSpec {
    fn name(&self) -> &str {
        "Root"
    }

    fn update(&self, _workflow: &mut Workflow, _task: TaskId) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Name-keyed spec lookup, used to rebind snapshots to live behavior on
/// deserialization.
#[derive(Default)]
pub struct SpecRegistry {
    specs: HashMap<String, Arc<dyn TaskSpec>>,
}

impl SpecRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register under the spec's own name. Last registration wins.
    pub fn register(&mut self, spec: Arc<dyn TaskSpec>) {
        self.specs.insert(spec.name().to_string(), spec);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn TaskSpec>> {
        self.specs.get(name).cloned()
    }

    pub fn resolve(&self, name: &str) -> EngineResult<Arc<dyn TaskSpec>> {
        self.get(name)
            .ok_or_else(|| EngineError::UnknownSpec(name.to_string()))
    }

    pub fn len(&self) -> usize {
        self.specs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Noop(&'static str);

    impl TaskSpec for Noop {
        fn name(&self) -> &str {
            self.0
        }

        fn update(&self, _workflow: &mut Workflow, _task: TaskId) -> anyhow::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn registry_lookup_and_miss() {
        let mut registry = SpecRegistry::new();
        registry.register(Arc::new(Noop("a")));
        assert!(registry.get("a").is_some());
        assert!(registry.get("b").is_none());
        assert!(matches!(
            registry.resolve("b"),
            Err(EngineError::UnknownSpec(name)) if name == "b"
        ));
    }

    #[test]
    fn default_capability_flags() {
        let spec = Noop("a");
        assert!(!spec.is_manual());
        assert!(!spec.is_end());
        assert!(!spec.is_boundary_event_container());
        assert!(spec.event_definition().is_none());
    }
}
