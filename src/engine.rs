//! The workflow engine: stepping protocol, event correlation, cancellation,
//! and the completion event.
//!
//! The engine owns one task tree and is the sole mutator of it. A step is:
//! find a READY node, run its `on_complete` hook, mark it COMPLETED, then
//! recompute `update` on every WAITING node. External messages and signals
//! enter through the same sweep: the payload is staged on the root node's
//! internal data, WAITING nodes are updated once, and the staged key is
//! cleared whether or not anything reacted.

use crate::error::{EngineError, EngineResult};
use crate::mutex::{MutexHandle, MutexRegistry};
use crate::spec::{RootSpec, TaskSpec};
use crate::states::{StateMask, TaskState};
use crate::tree::{TaskId, TaskNode, TaskTree, TreeIterator};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

/// Root internal-data key for staged message payloads.
pub const MESSAGES_KEY: &str = "messages";
/// Root internal-data key for staged signal flags.
pub const SIGNALS_KEY: &str = "signals";
/// Root internal-data key for staged cancellation flags.
pub const CANCELS_KEY: &str = "cancels";
/// The flag name staged under [`CANCELS_KEY`] by [`Workflow::cancel_notify`].
pub const TOKEN_RESET_KEY: &str = "TokenReset";

type CompletedCallback = Arc<dyn Fn(&Workflow) + Send + Sync>;

/// One live workflow execution.
pub struct Workflow {
    pub(crate) instance_id: Uuid,
    pub(crate) tree: TaskTree,
    /// Workflow-level variables, merged from end-node task data.
    pub(crate) data: HashMap<String, serde_json::Value>,
    pub(crate) success: bool,
    pub(crate) last_task: Option<TaskId>,
    pub(crate) completed_fired: bool,
    locks: MutexRegistry,
    task_mapping: HashMap<u32, HashMap<String, BTreeSet<TaskId>>>,
    completed_subscribers: Vec<CompletedCallback>,
}

impl Workflow {
    /// Create a workflow with `start_spec` as the only child of the root
    /// sentinel, predict its children, and compute its initial readiness.
    pub fn new(start_spec: Arc<dyn TaskSpec>) -> EngineResult<Self> {
        let tree = TaskTree::new(Arc::new(RootSpec));
        let root = tree.root();
        let mut workflow = Self {
            instance_id: Uuid::new_v4(),
            tree,
            data: HashMap::new(),
            success: true,
            last_task: None,
            completed_fired: false,
            locks: MutexRegistry::new(),
            task_mapping: HashMap::new(),
            completed_subscribers: Vec::new(),
        };
        let start = workflow.tree.add_child(root, start_spec)?;
        workflow.predict_task(start)?;
        workflow.update_task(start)?;
        workflow.update_task_mapping();
        debug!(instance = %workflow.instance_id, "workflow created");
        Ok(workflow)
    }

    pub(crate) fn from_parts(
        instance_id: Uuid,
        tree: TaskTree,
        data: HashMap<String, serde_json::Value>,
        success: bool,
        last_task: Option<TaskId>,
        completed_fired: bool,
    ) -> Self {
        let mut workflow = Self {
            instance_id,
            tree,
            data,
            success,
            last_task,
            completed_fired,
            locks: MutexRegistry::new(),
            task_mapping: HashMap::new(),
            completed_subscribers: Vec::new(),
        };
        workflow.update_task_mapping();
        workflow
    }

    // ── accessors ──

    pub fn instance_id(&self) -> Uuid {
        self.instance_id
    }

    pub fn tree(&self) -> &TaskTree {
        &self.tree
    }

    pub fn success(&self) -> bool {
        self.success
    }

    pub fn last_task(&self) -> Option<TaskId> {
        self.last_task
    }

    pub fn data(&self) -> &HashMap<String, serde_json::Value> {
        &self.data
    }

    pub fn get_data(&self, key: &str) -> Option<&serde_json::Value> {
        self.data.get(key)
    }

    pub fn set_data(&mut self, key: impl Into<String>, value: serde_json::Value) {
        self.data.insert(key.into(), value);
    }

    pub fn task(&self, id: TaskId) -> EngineResult<&TaskNode> {
        self.tree.node(id)
    }

    pub fn task_mut(&mut self, id: TaskId) -> EngineResult<&mut TaskNode> {
        self.tree.node_mut(id)
    }

    /// Append a child task. Specs call this from `predict` to materialize
    /// their expected successors.
    pub fn add_task(&mut self, parent: TaskId, spec: Arc<dyn TaskSpec>) -> EngineResult<TaskId> {
        self.tree.add_child(parent, spec)
    }

    pub fn get_tasks(&self, mask: StateMask) -> Vec<&TaskNode> {
        self.tree.iter_all(mask).collect()
    }

    pub fn iter_tasks(&self, mask: StateMask) -> TreeIterator<'_> {
        self.tree.iter_all(mask)
    }

    pub fn get_tasks_from_spec_name(&self, name: &str) -> Vec<&TaskNode> {
        self.tree
            .iter_all(StateMask::ANY)
            .filter(|node| node.spec_name() == name)
            .collect()
    }

    pub fn mutex(&mut self, name: &str) -> Arc<MutexHandle> {
        self.locks.get(name)
    }

    pub fn new_branch_id(&mut self) -> u32 {
        self.tree.new_thread_id()
    }

    pub fn dump(&self) -> String {
        self.tree.dump()
    }

    /// True iff no node is in a non-finished state.
    pub fn is_completed(&self) -> bool {
        self.tree.iter_all(StateMask::NOT_FINISHED).next().is_none()
    }

    /// Subscribe to the completion event, fired at most once when the tree
    /// first has no unfinished node.
    pub fn on_completed(&mut self, callback: impl Fn(&Workflow) + Send + Sync + 'static) {
        self.completed_subscribers.push(Arc::new(callback));
    }

    // ── spec hook dispatch ──

    pub fn predict_task(&mut self, id: TaskId) -> EngineResult<()> {
        let spec = Arc::clone(self.tree.node(id)?.spec());
        spec.predict(self, id)
            .map_err(|e| EngineError::execution(id, spec.name(), "predict", e))
    }

    pub fn update_task(&mut self, id: TaskId) -> EngineResult<()> {
        let spec = Arc::clone(self.tree.node(id)?.spec());
        spec.update(self, id)
            .map_err(|e| EngineError::execution(id, spec.name(), "update", e))
    }

    fn run_on_complete(&mut self, id: TaskId) -> EngineResult<()> {
        let spec = Arc::clone(self.tree.node(id)?.spec());
        spec.on_complete(self, id)
            .map_err(|e| EngineError::execution(id, spec.name(), "on_complete", e))
    }

    /// Transition a task. Completion routes through the engine's
    /// completed-notify path (end-node data merge, WAITING sweep,
    /// completion event).
    pub fn set_task_state(&mut self, id: TaskId, state: TaskState) -> EngineResult<bool> {
        let changed = self.tree.set_state(id, state)?;
        if changed && state == TaskState::Completed {
            self.task_completed_notify(id)?;
        }
        Ok(changed)
    }

    // ── stepping protocol ──

    /// Run the task's `on_complete` hook and mark it COMPLETED. If the hook
    /// fails, the completing node's state, data, and internal data, plus the
    /// workflow-level data, are restored before the error surfaces.
    pub fn complete_task(&mut self, id: TaskId) -> EngineResult<bool> {
        let (saved_data, saved_internal, saved_state) = {
            let node = self.tree.node(id)?;
            (node.data.clone(), node.internal_data.clone(), node.state())
        };
        let saved_workflow_data = self.data.clone();

        if let Err(err) = self.run_on_complete(id) {
            if let Ok(node) = self.tree.node_mut(id) {
                node.data = saved_data;
                node.internal_data = saved_internal;
            }
            let _ = self.tree.set_state_forced(id, saved_state);
            self.data = saved_workflow_data;
            return Err(err);
        }
        self.set_task_state(id, TaskState::Completed)
    }

    /// Rewind a finished task to FUTURE for re-execution, discarding its
    /// stale descendants, then re-run predict and update on it.
    pub fn reset_task(&mut self, id: TaskId) -> EngineResult<()> {
        self.tree.reset_token(id)?;
        if let Some(last) = self.last_task {
            if self.tree.get(last).is_none() {
                self.last_task = None;
            }
        }
        self.predict_task(id)?;
        self.update_task(id)?;
        Ok(())
    }

    /// Advance exactly one unit of work. Returns whether progress was made.
    ///
    /// With `pick_up`, the subtree of the last-handled task is searched for
    /// a READY node first. Manual tasks (when `halt_on_manual` is set) and
    /// tasks attempted without completing go into a per-call skip set whose
    /// descendants are not reconsidered in the same pass. When no READY node
    /// completes, every WAITING node is updated once; progress is any node
    /// leaving WAITING.
    pub fn complete_next(&mut self, pick_up: bool, halt_on_manual: bool) -> EngineResult<bool> {
        let mut skipped: Vec<TaskId> = Vec::new();

        if pick_up {
            if let Some(last) = self.last_task.take() {
                let candidate = self
                    .tree
                    .iter(last, TaskState::Ready.mask())
                    .next()
                    .map(|node| (node.id(), node.spec().is_manual()));
                if let Some((id, manual)) = candidate {
                    if manual && halt_on_manual {
                        skipped.push(id);
                    } else {
                        self.complete_task(id)?;
                        if self.tree.node(id)?.state() == TaskState::Completed {
                            self.last_task = Some(id);
                            return Ok(true);
                        }
                        skipped.push(id);
                    }
                }
            }
        }

        let candidates: Vec<TaskId> = self
            .tree
            .iter_all(TaskState::Ready.mask())
            .map(|node| node.id())
            .collect();
        'scan: for id in candidates {
            for blocked in &skipped {
                if id == *blocked || self.tree.is_descendant_of(id, *blocked) {
                    continue 'scan;
                }
            }
            let Some(node) = self.tree.get(id) else {
                continue;
            };
            if node.state() != TaskState::Ready {
                continue;
            }
            if node.spec().is_manual() && halt_on_manual {
                skipped.push(id);
                continue;
            }
            self.complete_task(id)?;
            if self.tree.node(id)?.state() == TaskState::Completed {
                self.last_task = Some(id);
                return Ok(true);
            }
            skipped.push(id);
        }

        let waiting: Vec<TaskId> = self
            .tree
            .iter_all(TaskState::Waiting.mask())
            .map(|node| node.id())
            .collect();
        for id in waiting {
            let Some(node) = self.tree.get(id) else {
                continue;
            };
            if node.state() != TaskState::Waiting {
                continue;
            }
            self.update_task(id)?;
            if let Some(node) = self.tree.get(id) {
                if node.state() != TaskState::Waiting {
                    self.last_task = Some(id);
                    return Ok(true);
                }
            }
        }
        Ok(false)
    }

    /// Step until `complete_next` reports no progress. Unbounded if some
    /// spec's `update` never stabilizes.
    pub fn complete_all(&mut self, pick_up: bool, halt_on_manual: bool) -> EngineResult<()> {
        while self.complete_next(pick_up, halt_on_manual)? {}
        Ok(())
    }

    /// Cancel every unfinished task and record the success flag. Returns
    /// the ids that were cancelled.
    pub fn cancel(&mut self, success: bool) -> EngineResult<Vec<TaskId>> {
        self.success = success;
        let doomed: Vec<TaskId> = self
            .tree
            .iter_all(StateMask::NOT_FINISHED)
            .map(|node| node.id())
            .collect();
        self.tree.cancel(self.tree.root())?;
        self.maybe_fire_completed();
        Ok(doomed)
    }

    fn task_completed_notify(&mut self, id: TaskId) -> EngineResult<()> {
        let is_end = self.tree.node(id)?.spec().is_end();
        if is_end {
            let merged = self.tree.node(id)?.data.clone();
            self.data.extend(merged);
        }
        self.refresh_waiting_tasks()?;
        self.maybe_fire_completed();
        Ok(())
    }

    /// Recompute `update` on every node currently WAITING.
    pub fn refresh_waiting_tasks(&mut self) -> EngineResult<()> {
        let waiting: Vec<TaskId> = self
            .tree
            .iter_all(TaskState::Waiting.mask())
            .map(|node| node.id())
            .collect();
        for id in waiting {
            match self.tree.get(id) {
                Some(node) if node.state() == TaskState::Waiting => self.update_task(id)?,
                _ => {}
            }
        }
        Ok(())
    }

    fn maybe_fire_completed(&mut self) {
        // the full-tree scan is only worth it when someone is listening
        if self.completed_fired || self.completed_subscribers.is_empty() {
            return;
        }
        if !self.is_completed() {
            return;
        }
        self.completed_fired = true;
        let subscribers = self.completed_subscribers.clone();
        for callback in subscribers {
            callback(self);
        }
    }

    // ── message / signal correlation ──

    /// Deliver an external message. The name is resolved through the alias
    /// map of currently active catch events, the `(payload, result_var)`
    /// pair is staged under the declared name, WAITING nodes are swept once,
    /// and the staged key is cleared.
    pub fn message(
        &mut self,
        name: &str,
        payload: serde_json::Value,
        result_var: Option<&str>,
    ) -> EngineResult<()> {
        let declared = self.correlate(name)?;
        debug!(message = name, declared = %declared, "delivering message");
        self.stage_and_sweep(MESSAGES_KEY, declared, serde_json::json!([payload, result_var]))
    }

    /// Deliver an external signal: a bare flag under the resolved name.
    pub fn signal(&mut self, name: &str) -> EngineResult<()> {
        let declared = self.correlate(name)?;
        debug!(signal = name, declared = %declared, "delivering signal");
        self.stage_and_sweep(SIGNALS_KEY, declared, serde_json::Value::Bool(true))
    }

    /// Broadcast a token-reset flag to catch events watching for it.
    pub fn cancel_notify(&mut self) -> EngineResult<()> {
        self.stage_and_sweep(
            CANCELS_KEY,
            TOKEN_RESET_KEY.to_string(),
            serde_json::Value::Bool(true),
        )
    }

    /// The staged payload map for `key`, if a delivery is in flight. Only
    /// ever non-empty while the delivery sweep runs.
    pub fn staged_internal(&self, key: &str) -> Option<&serde_json::Value> {
        self.tree.get(self.tree.root())?.internal_data.get(key)
    }

    /// Build the declared-name → external-name alias map from active catch
    /// events and resolve `name` to a declared name. Unaliased names pass
    /// through unchanged. Side effect: a COMPLETED boundary event whose
    /// sibling primary activity is READY is forced back to WAITING so the
    /// event stays re-triggerable.
    fn correlate(&mut self, name: &str) -> EngineResult<String> {
        let mut aliases: HashMap<String, String> = HashMap::new();
        let mut rearm: Vec<TaskId> = Vec::new();

        for node in self.tree.iter_all(TaskState::Waiting | TaskState::Ready) {
            if node.state() == TaskState::Waiting {
                if let Some(event) = node.spec().event_definition() {
                    aliases.insert(
                        event.name.clone(),
                        event.message.clone().unwrap_or_else(|| event.name.clone()),
                    );
                }
                continue;
            }
            let Some(parent) = node.parent() else { continue };
            let Some(parent_node) = self.tree.get(parent) else {
                continue;
            };
            if !parent_node.spec().is_boundary_event_container() {
                continue;
            }
            for sibling in parent_node.children() {
                if *sibling == node.id() {
                    continue;
                }
                let Some(sibling_node) = self.tree.get(*sibling) else {
                    continue;
                };
                if sibling_node.state() != TaskState::Completed {
                    continue;
                }
                if let Some(event) = sibling_node.spec().event_definition() {
                    aliases.insert(
                        event.name.clone(),
                        event.message.clone().unwrap_or_else(|| event.name.clone()),
                    );
                    rearm.push(*sibling);
                }
            }
        }

        for id in rearm {
            debug!(task = id, "re-arming completed boundary event");
            self.tree.set_state_forced(id, TaskState::Waiting)?;
        }

        if aliases.contains_key(name) {
            return Ok(name.to_string());
        }
        if let Some((declared, _)) = aliases
            .iter()
            .find(|(_, external)| external.as_str() == name)
        {
            return Ok(declared.clone());
        }
        Ok(name.to_string())
    }

    fn stage_and_sweep(
        &mut self,
        key: &str,
        name: String,
        value: serde_json::Value,
    ) -> EngineResult<()> {
        let root = self.tree.root();
        let mut staged = serde_json::Map::new();
        staged.insert(name, value);
        self.tree
            .node_mut(root)?
            .internal_data
            .insert(key.to_string(), serde_json::Value::Object(staged));

        let result = self.refresh_waiting_tasks();
        // cleared whether or not anything reacted
        if let Ok(node) = self.tree.node_mut(root) {
            node.internal_data.remove(key);
        }
        result
    }

    // ── task mapping ──

    /// Rebuild the branch → spec name → task ids index.
    pub fn update_task_mapping(&mut self) {
        let mut mapping: HashMap<u32, HashMap<String, BTreeSet<TaskId>>> = HashMap::new();
        for node in self.tree.tasks() {
            mapping
                .entry(node.thread_id())
                .or_default()
                .entry(node.spec_name().to_string())
                .or_default()
                .insert(node.id());
        }
        self.task_mapping = mapping;
    }

    pub fn task_mapping(&self) -> &HashMap<u32, HashMap<String, BTreeSet<TaskId>>> {
        &self.task_mapping
    }
}
