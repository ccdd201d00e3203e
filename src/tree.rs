//! Id-indexed task arena.
//!
//! Nodes are stored flat in a `BTreeMap` keyed by [`TaskId`]; parent and
//! child links are ids, never references, so engine hooks can mutate one
//! node while traversal state is held as plain ids. Specs are shared
//! `Arc<dyn TaskSpec>` templates; everything per-instance lives on the node.

use crate::error::{EngineError, EngineResult};
use crate::spec::TaskSpec;
use crate::states::{StateMask, TaskState};
use std::collections::{BTreeMap, HashMap};
use std::fmt::Write as _;
use std::sync::Arc;
use tracing::debug;

pub type TaskId = u32;

/// One task instance.
pub struct TaskNode {
    id: TaskId,
    parent: Option<TaskId>,
    children: Vec<TaskId>,
    spec: Arc<dyn TaskSpec>,
    state: TaskState,
    /// Workflow-visible variables, inherited from the parent on creation.
    pub data: HashMap<String, serde_json::Value>,
    /// Engine bookkeeping, never inherited.
    pub internal_data: HashMap<String, serde_json::Value>,
    thread_id: u32,
}

impl TaskNode {
    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn parent(&self) -> Option<TaskId> {
        self.parent
    }

    pub fn children(&self) -> &[TaskId] {
        &self.children
    }

    pub fn spec(&self) -> &Arc<dyn TaskSpec> {
        &self.spec
    }

    pub fn spec_name(&self) -> &str {
        self.spec.name()
    }

    pub fn state(&self) -> TaskState {
        self.state
    }

    pub fn thread_id(&self) -> u32 {
        self.thread_id
    }

    pub(crate) fn set_thread_id(&mut self, thread_id: u32) {
        self.thread_id = thread_id;
    }
}

/// The task tree for one workflow instance.
pub struct TaskTree {
    nodes: BTreeMap<TaskId, TaskNode>,
    root: TaskId,
    next_id: TaskId,
    next_thread_id: u32,
}

impl TaskTree {
    /// A fresh tree holding only the root sentinel, which is born
    /// `Completed` so that children of the root ready immediately.
    pub fn new(root_spec: Arc<dyn TaskSpec>) -> Self {
        let root = 1;
        let mut nodes = BTreeMap::new();
        nodes.insert(
            root,
            TaskNode {
                id: root,
                parent: None,
                children: Vec::new(),
                spec: root_spec,
                state: TaskState::Completed,
                data: HashMap::new(),
                internal_data: HashMap::new(),
                thread_id: 0,
            },
        );
        Self {
            nodes,
            root,
            next_id: 2,
            next_thread_id: 1,
        }
    }

    pub fn root(&self) -> TaskId {
        self.root
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn get(&self, id: TaskId) -> Option<&TaskNode> {
        self.nodes.get(&id)
    }

    pub fn get_mut(&mut self, id: TaskId) -> Option<&mut TaskNode> {
        self.nodes.get_mut(&id)
    }

    pub fn node(&self, id: TaskId) -> EngineResult<&TaskNode> {
        self.nodes.get(&id).ok_or(EngineError::UnknownTask(id))
    }

    pub fn node_mut(&mut self, id: TaskId) -> EngineResult<&mut TaskNode> {
        self.nodes.get_mut(&id).ok_or(EngineError::UnknownTask(id))
    }

    /// Append a child under `parent` in `Future` state. The child inherits a
    /// clone of the parent's data and the parent's thread id.
    pub fn add_child(
        &mut self,
        parent: TaskId,
        spec: Arc<dyn TaskSpec>,
    ) -> EngineResult<TaskId> {
        let (data, thread_id) = {
            let parent_node = self.node(parent)?;
            (parent_node.data.clone(), parent_node.thread_id)
        };
        let id = self.next_id;
        self.next_id += 1;
        self.nodes.insert(
            id,
            TaskNode {
                id,
                parent: Some(parent),
                children: Vec::new(),
                spec,
                state: TaskState::Future,
                data,
                internal_data: HashMap::new(),
                thread_id,
            },
        );
        // node() above proved the parent exists
        if let Some(parent_node) = self.nodes.get_mut(&parent) {
            parent_node.children.push(id);
        }
        Ok(id)
    }

    /// Transition a node, honoring the monotonicity guard: a finished node
    /// never changes state. Returns whether the state actually changed.
    pub fn set_state(&mut self, id: TaskId, state: TaskState) -> EngineResult<bool> {
        self.transition(id, state, false)
    }

    /// Transition bypassing the finished guard. Used by token reset and
    /// boundary-event re-arming only.
    pub fn set_state_forced(&mut self, id: TaskId, state: TaskState) -> EngineResult<bool> {
        self.transition(id, state, true)
    }

    fn transition(&mut self, id: TaskId, state: TaskState, force: bool) -> EngineResult<bool> {
        let node = self.node_mut(id)?;
        if node.state == state {
            return Ok(false);
        }
        if node.state.is_finished() && !force {
            return Ok(false);
        }
        debug!(
            task = id,
            spec = node.spec.name(),
            from = %node.state,
            to = %state,
            "state transition"
        );
        node.state = state;
        Ok(true)
    }

    /// Cancel every unfinished node in the subtree rooted at `id`,
    /// including `id` itself. Idempotent; a finished start node still has
    /// its unfinished descendants cancelled.
    pub fn cancel(&mut self, id: TaskId) -> EngineResult<()> {
        self.node(id)?;
        let doomed: Vec<TaskId> = self
            .iter(id, StateMask::NOT_FINISHED)
            .map(|node| node.id)
            .collect();
        for task in doomed {
            self.transition(task, TaskState::Cancelled, false)?;
        }
        Ok(())
    }

    /// Rewind `id` to `Future` for re-execution: drop all descendants from
    /// the arena, reset data to a fresh copy of the parent's, clear internal
    /// data. The caller re-runs predict/update afterwards.
    pub fn reset_token(&mut self, id: TaskId) -> EngineResult<()> {
        let stale = self.descendant_ids(id)?;
        for task in stale {
            self.nodes.remove(&task);
        }
        let parent_data = match self.node(id)?.parent {
            Some(parent) => self.node(parent)?.data.clone(),
            None => HashMap::new(),
        };
        let node = self.node_mut(id)?;
        node.children.clear();
        node.data = parent_data;
        node.internal_data.clear();
        self.set_state_forced(id, TaskState::Future)?;
        Ok(())
    }

    fn descendant_ids(&self, id: TaskId) -> EngineResult<Vec<TaskId>> {
        let node = self.node(id)?;
        let mut out = Vec::new();
        let mut stack: Vec<TaskId> = node.children.to_vec();
        while let Some(current) = stack.pop() {
            if let Some(node) = self.nodes.get(&current) {
                stack.extend(node.children.iter().copied());
            }
            out.push(current);
        }
        Ok(out)
    }

    /// Does `id` sit strictly below `ancestor`?
    pub fn is_descendant_of(&self, id: TaskId, ancestor: TaskId) -> bool {
        let mut current = self.get(id).and_then(|node| node.parent);
        while let Some(candidate) = current {
            if candidate == ancestor {
                return true;
            }
            current = self.get(candidate).and_then(|node| node.parent);
        }
        false
    }

    /// Pre-order traversal of the subtree rooted at `start`, yielding only
    /// nodes whose state is in `mask`. Children of filtered-out nodes are
    /// still visited. A missing `start` yields nothing.
    pub fn iter(&self, start: TaskId, mask: StateMask) -> TreeIterator<'_> {
        let stack = if self.nodes.contains_key(&start) {
            vec![start]
        } else {
            Vec::new()
        };
        TreeIterator {
            tree: self,
            mask,
            stack,
        }
    }

    pub fn iter_all(&self, mask: StateMask) -> TreeIterator<'_> {
        self.iter(self.root, mask)
    }

    /// Unordered iteration over every node, mask-free.
    pub fn tasks(&self) -> impl Iterator<Item = &TaskNode> {
        self.nodes.values()
    }

    pub fn new_thread_id(&mut self) -> u32 {
        let id = self.next_thread_id;
        self.next_thread_id += 1;
        id
    }

    /// Indented rendering of the tree for diagnostics.
    pub fn dump(&self) -> String {
        let mut out = String::new();
        self.dump_node(self.root, 0, &mut out);
        out
    }

    fn dump_node(&self, id: TaskId, depth: usize, out: &mut String) {
        if let Some(node) = self.nodes.get(&id) {
            let _ = writeln!(
                out,
                "{:indent$}{}/{} [{}] {}",
                "",
                node.thread_id,
                node.id,
                node.state,
                node.spec.name(),
                indent = depth * 2
            );
            for child in &node.children {
                self.dump_node(*child, depth + 1, out);
            }
        }
    }

    // ── snapshot support ──

    pub(crate) fn counters(&self) -> (TaskId, u32) {
        (self.next_id, self.next_thread_id)
    }

    pub(crate) fn from_parts(
        root: TaskId,
        next_id: TaskId,
        next_thread_id: u32,
        nodes: Vec<(
            TaskId,
            Option<TaskId>,
            Vec<TaskId>,
            Arc<dyn TaskSpec>,
            TaskState,
            HashMap<String, serde_json::Value>,
            HashMap<String, serde_json::Value>,
            u32,
        )>,
    ) -> Self {
        let nodes = nodes
            .into_iter()
            .map(
                |(id, parent, children, spec, state, data, internal_data, thread_id)| {
                    (
                        id,
                        TaskNode {
                            id,
                            parent,
                            children,
                            spec,
                            state,
                            data,
                            internal_data,
                            thread_id,
                        },
                    )
                },
            )
            .collect();
        Self {
            nodes,
            root,
            next_id,
            next_thread_id,
        }
    }
}

pub struct TreeIterator<'a> {
    tree: &'a TaskTree,
    mask: StateMask,
    stack: Vec<TaskId>,
}

impl<'a> Iterator for TreeIterator<'a> {
    type Item = &'a TaskNode;

    fn next(&mut self) -> Option<Self::Item> {
        while let Some(id) = self.stack.pop() {
            let Some(node) = self.tree.get(id) else {
                continue;
            };
            // reversed so the leftmost child is popped first
            self.stack.extend(node.children.iter().rev());
            if self.mask.contains(node.state) {
                return Some(node);
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::Workflow;

    struct Stub(&'static str);

    impl TaskSpec for Stub {
        fn name(&self) -> &str {
            self.0
        }

        fn update(&self, _workflow: &mut Workflow, _task: TaskId) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn spec(name: &'static str) -> Arc<dyn TaskSpec> {
        Arc::new(Stub(name))
    }

    /// root ── a ── b ── d
    ///              └── e
    ///         c
    fn sample() -> (TaskTree, TaskId, TaskId, TaskId, TaskId, TaskId) {
        let mut tree = TaskTree::new(spec("Root"));
        let a = tree.add_child(tree.root(), spec("a")).unwrap();
        let b = tree.add_child(a, spec("b")).unwrap();
        let c = tree.add_child(a, spec("c")).unwrap();
        let d = tree.add_child(b, spec("d")).unwrap();
        let e = tree.add_child(b, spec("e")).unwrap();
        (tree, a, b, c, d, e)
    }

    #[test]
    fn preorder_traversal_visits_left_subtree_first() {
        let (tree, a, b, c, d, e) = sample();
        let order: Vec<TaskId> = tree.iter_all(StateMask::ANY).map(|n| n.id()).collect();
        assert_eq!(order, vec![tree.root(), a, b, d, e, c]);
    }

    #[test]
    fn mask_filters_nodes_but_not_their_subtrees() {
        let (mut tree, a, _b, c, d, _e) = sample();
        tree.set_state(a, TaskState::Completed).unwrap();
        tree.set_state(d, TaskState::Completed).unwrap();
        // a is filtered out but d, deep inside a's subtree, is still found
        let hits: Vec<TaskId> = tree
            .iter_all(TaskState::Completed.mask())
            .filter(|n| n.id() != tree.root())
            .map(|n| n.id())
            .collect();
        assert_eq!(hits, vec![a, d]);
        let unfinished: Vec<TaskId> = tree
            .iter(a, StateMask::NOT_FINISHED)
            .map(|n| n.id())
            .collect();
        assert!(unfinished.contains(&c));
        assert!(!unfinished.contains(&d));
    }

    #[test]
    fn children_inherit_data_and_thread_id() {
        let mut tree = TaskTree::new(spec("Root"));
        let a = tree.add_child(tree.root(), spec("a")).unwrap();
        tree.get_mut(a)
            .unwrap()
            .data
            .insert("k".into(), serde_json::json!(1));
        tree.get_mut(a).unwrap().set_thread_id(7);
        let b = tree.add_child(a, spec("b")).unwrap();
        let child = tree.get(b).unwrap();
        assert_eq!(child.data.get("k"), Some(&serde_json::json!(1)));
        assert_eq!(child.thread_id(), 7);
        assert_eq!(child.parent(), Some(a));
    }

    #[test]
    fn finished_states_are_sticky() {
        let (mut tree, a, ..) = sample();
        assert!(tree.set_state(a, TaskState::Completed).unwrap());
        assert!(!tree.set_state(a, TaskState::Ready).unwrap());
        assert_eq!(tree.get(a).unwrap().state(), TaskState::Completed);
        // forced transitions do go through
        assert!(tree.set_state_forced(a, TaskState::Waiting).unwrap());
        assert_eq!(tree.get(a).unwrap().state(), TaskState::Waiting);
    }

    #[test]
    fn cancel_is_recursive_and_spares_finished_nodes() {
        let (mut tree, a, b, c, d, e) = sample();
        tree.set_state(d, TaskState::Completed).unwrap();
        tree.cancel(a).unwrap();
        for id in [a, b, c, e] {
            assert_eq!(tree.get(id).unwrap().state(), TaskState::Cancelled);
        }
        assert_eq!(tree.get(d).unwrap().state(), TaskState::Completed);
        // second cancel is a no-op
        tree.cancel(a).unwrap();
    }

    #[test]
    fn cancel_under_a_finished_start_node_still_reaches_descendants() {
        let (mut tree, a, b, _c, _d, _e) = sample();
        tree.set_state(a, TaskState::Completed).unwrap();
        tree.cancel(a).unwrap();
        assert_eq!(tree.get(a).unwrap().state(), TaskState::Completed);
        assert_eq!(tree.get(b).unwrap().state(), TaskState::Cancelled);
    }

    #[test]
    fn reset_token_drops_descendants_and_reverts_data() {
        let (mut tree, a, b, c, d, e) = sample();
        tree.get_mut(a)
            .unwrap()
            .data
            .insert("inherited".into(), serde_json::json!(true));
        tree.get_mut(b)
            .unwrap()
            .data
            .insert("local".into(), serde_json::json!(1));
        tree.set_state(b, TaskState::Completed).unwrap();

        tree.reset_token(b).unwrap();
        assert!(tree.get(d).is_none());
        assert!(tree.get(e).is_none());
        let node = tree.get(b).unwrap();
        assert_eq!(node.state(), TaskState::Future);
        assert!(node.children().is_empty());
        assert_eq!(node.data.get("inherited"), Some(&serde_json::json!(true)));
        assert!(node.data.get("local").is_none());
        // siblings untouched
        assert!(tree.get(c).is_some());
    }

    #[test]
    fn descendant_checks() {
        let (tree, a, b, c, d, _e) = sample();
        assert!(tree.is_descendant_of(d, a));
        assert!(tree.is_descendant_of(d, b));
        assert!(!tree.is_descendant_of(c, b));
        assert!(!tree.is_descendant_of(a, a));
    }

    #[test]
    fn unknown_ids_are_structural_errors() {
        let (mut tree, ..) = sample();
        assert!(matches!(
            tree.set_state(999, TaskState::Ready),
            Err(EngineError::UnknownTask(999))
        ));
        assert!(matches!(tree.cancel(999), Err(EngineError::UnknownTask(999))));
        assert!(tree.iter(999, StateMask::ANY).next().is_none());
    }

    #[test]
    fn dump_renders_every_node() {
        let (tree, ..) = sample();
        let dump = tree.dump();
        for name in ["Root", "a", "b", "c", "d", "e"] {
            assert!(dump.contains(name), "missing {name} in:\n{dump}");
        }
    }
}
