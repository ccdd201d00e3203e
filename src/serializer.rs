//! Persistence boundary.
//!
//! The engine does not pick an encoding; implementations of
//! [`WorkflowSerializer`] turn a workflow into an opaque blob and back.
//! [`WorkflowSnapshot`] is the serde-friendly support structure they work
//! from: tree shape, states, data maps, and spec *names*. Behavior is
//! rebound on load through a [`SpecRegistry`].

use crate::engine::Workflow;
use crate::spec::{RootSpec, SpecRegistry};
use crate::states::TaskState;
use crate::tree::{TaskId, TaskTree};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

pub trait WorkflowSerializer {
    fn serialize_workflow(&self, workflow: &Workflow) -> anyhow::Result<Vec<u8>>;
    fn deserialize_workflow(
        &self,
        blob: &[u8],
        registry: &SpecRegistry,
    ) -> anyhow::Result<Workflow>;
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TaskSnapshot {
    pub id: TaskId,
    pub parent: Option<TaskId>,
    pub children: Vec<TaskId>,
    pub spec: String,
    pub state: TaskState,
    pub data: HashMap<String, serde_json::Value>,
    pub internal_data: HashMap<String, serde_json::Value>,
    pub thread_id: u32,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WorkflowSnapshot {
    pub instance_id: Uuid,
    pub success: bool,
    pub completed_fired: bool,
    pub data: HashMap<String, serde_json::Value>,
    pub last_task: Option<TaskId>,
    pub root: TaskId,
    pub next_id: TaskId,
    pub next_thread_id: u32,
    pub tasks: Vec<TaskSnapshot>,
}

impl Workflow {
    pub fn snapshot(&self) -> WorkflowSnapshot {
        let (next_id, next_thread_id) = self.tree.counters();
        let tasks = self
            .tree
            .tasks()
            .map(|node| TaskSnapshot {
                id: node.id(),
                parent: node.parent(),
                children: node.children().to_vec(),
                spec: node.spec_name().to_string(),
                state: node.state(),
                data: node.data.clone(),
                internal_data: node.internal_data.clone(),
                thread_id: node.thread_id(),
            })
            .collect();
        WorkflowSnapshot {
            instance_id: self.instance_id,
            success: self.success,
            completed_fired: self.completed_fired,
            data: self.data.clone(),
            last_task: self.last_task,
            root: self.tree.root(),
            next_id,
            next_thread_id,
            tasks,
        }
    }

    /// Rebuild a workflow from a snapshot, rebinding spec names through the
    /// registry. The root sentinel keeps its built-in spec; any other name
    /// missing from the registry is a structural error.
    pub fn from_snapshot(
        snapshot: WorkflowSnapshot,
        registry: &SpecRegistry,
    ) -> crate::error::EngineResult<Workflow> {
        let mut nodes = Vec::with_capacity(snapshot.tasks.len());
        for task in snapshot.tasks {
            let spec = if task.id == snapshot.root {
                Arc::new(RootSpec) as Arc<dyn crate::spec::TaskSpec>
            } else {
                registry.resolve(&task.spec)?
            };
            nodes.push((
                task.id,
                task.parent,
                task.children,
                spec,
                task.state,
                task.data,
                task.internal_data,
                task.thread_id,
            ));
        }
        let tree = TaskTree::from_parts(
            snapshot.root,
            snapshot.next_id,
            snapshot.next_thread_id,
            nodes,
        );
        Ok(Workflow::from_parts(
            snapshot.instance_id,
            tree,
            snapshot.data,
            snapshot.success,
            snapshot.last_task,
            snapshot.completed_fired,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::EngineError;
    use crate::spec::TaskSpec;
    use crate::specs::SimpleSpec;
    use serde_json::json;

    struct JsonSerializer;

    impl WorkflowSerializer for JsonSerializer {
        fn serialize_workflow(&self, workflow: &Workflow) -> anyhow::Result<Vec<u8>> {
            Ok(serde_json::to_vec(&workflow.snapshot())?)
        }

        fn deserialize_workflow(
            &self,
            blob: &[u8],
            registry: &SpecRegistry,
        ) -> anyhow::Result<Workflow> {
            let snapshot: WorkflowSnapshot = serde_json::from_slice(blob)?;
            Ok(Workflow::from_snapshot(snapshot, registry)?)
        }
    }

    fn chain_and_registry() -> (Arc<dyn TaskSpec>, SpecRegistry) {
        let done: Arc<dyn TaskSpec> = Arc::new(SimpleSpec::end("done"));
        let a: Arc<dyn TaskSpec> =
            Arc::new(SimpleSpec::new("a").with_outputs(vec![Arc::clone(&done)]));
        let start: Arc<dyn TaskSpec> =
            Arc::new(SimpleSpec::new("start").with_outputs(vec![Arc::clone(&a)]));
        let mut registry = SpecRegistry::new();
        registry.register(Arc::clone(&start));
        registry.register(Arc::clone(&a));
        registry.register(Arc::clone(&done));
        (start, registry)
    }

    #[test]
    fn round_trip_resumes_mid_execution() {
        let (start, registry) = chain_and_registry();
        let mut workflow = Workflow::new(start).unwrap();
        assert!(workflow.complete_next(true, true).unwrap());
        workflow.set_data("k", json!(1));
        let instance_id = workflow.instance_id();
        let last_task = workflow.last_task();

        let serializer = JsonSerializer;
        let blob = serializer.serialize_workflow(&workflow).unwrap();
        let mut restored = serializer.deserialize_workflow(&blob, &registry).unwrap();

        assert_eq!(restored.instance_id(), instance_id);
        assert_eq!(restored.last_task(), last_task);
        assert_eq!(restored.get_data("k"), Some(&json!(1)));
        assert!(!restored.is_completed());

        restored.complete_all(true, true).unwrap();
        assert!(restored.is_completed());
        assert!(restored.success());
    }

    #[test]
    fn snapshot_preserves_tree_shape_and_states() {
        let (start, _registry) = chain_and_registry();
        let workflow = Workflow::new(start).unwrap();
        let snapshot = workflow.snapshot();
        assert_eq!(snapshot.tasks.len(), workflow.tree().len());
        let root = snapshot
            .tasks
            .iter()
            .find(|t| t.id == snapshot.root)
            .unwrap();
        assert_eq!(root.state, TaskState::Completed);
        assert!(root.parent.is_none());
    }

    #[test]
    fn missing_spec_name_is_a_structural_error() {
        let (start, _registry) = chain_and_registry();
        let workflow = Workflow::new(start).unwrap();
        let snapshot = workflow.snapshot();
        let empty = SpecRegistry::new();
        assert!(matches!(
            Workflow::from_snapshot(snapshot, &empty),
            Err(EngineError::UnknownSpec(_))
        ));
    }
}
