//! Basic task-spec building blocks.
//!
//! These cover the vocabulary the engine needs exercised: plain sequencing
//! with optional forks, catch events for message/signal correlation,
//! boundary-event containers, decision-table tasks, and mutex
//! acquire/release pairs. Richer process-element behaviors plug in through
//! the same [`TaskSpec`] contract.

use crate::decision::DecisionEngine;
use crate::engine::{Workflow, CANCELS_KEY, MESSAGES_KEY, SIGNALS_KEY};
use crate::spec::{EventDefinition, TaskSpec};
use crate::states::{StateMask, TaskState};
use crate::tree::TaskId;
use std::collections::HashSet;
use std::sync::Arc;

// ── shared helpers ──

/// Materialize `outputs` as children of `task` in the given predicted
/// state, skipping any already present by spec name. With `fork`, each
/// child gets a fresh branch id.
pub fn predict_outputs(
    workflow: &mut Workflow,
    task: TaskId,
    outputs: &[Arc<dyn TaskSpec>],
    state: TaskState,
    fork: bool,
) -> anyhow::Result<()> {
    let existing: HashSet<String> = workflow
        .task(task)?
        .children()
        .iter()
        .filter_map(|child| workflow.task(*child).ok())
        .map(|node| node.spec_name().to_string())
        .collect();
    for spec in outputs {
        if existing.contains(spec.name()) {
            continue;
        }
        let child = workflow.add_task(task, Arc::clone(spec))?;
        workflow.set_task_state(child, state)?;
        if fork {
            let branch = workflow.new_branch_id();
            workflow.task_mut(child)?.set_thread_id(branch);
        }
    }
    Ok(())
}

/// Default readiness: READY once the parent has completed, WAITING until
/// then. Idempotent; finished and already-ready nodes are left alone.
pub fn ready_when_parent_complete(workflow: &mut Workflow, task: TaskId) -> anyhow::Result<()> {
    let node = workflow.task(task)?;
    let state = node.state();
    if state.is_finished() || state == TaskState::Ready {
        return Ok(());
    }
    let parent_done = match node.parent() {
        Some(parent) => workflow.task(parent)?.state() == TaskState::Completed,
        None => true,
    };
    let next = if parent_done {
        TaskState::Ready
    } else {
        TaskState::Waiting
    };
    workflow.set_task_state(task, next)?;
    Ok(())
}

/// Move every predicted/future child of `task` into WAITING and run its
/// predict and update hooks. Called from `on_complete`, before the parent
/// itself is marked COMPLETED; the post-completion sweep then promotes
/// enabled children to READY.
pub fn activate_children(workflow: &mut Workflow, task: TaskId) -> anyhow::Result<()> {
    let children: Vec<TaskId> = workflow.task(task)?.children().to_vec();
    for child in children {
        let state = workflow.task(child)?.state();
        if StateMask::PREDICTED.contains(state) || state == TaskState::Future {
            workflow.set_task_state(child, TaskState::Waiting)?;
        }
        workflow.predict_task(child)?;
        workflow.update_task(child)?;
    }
    Ok(())
}

// ── SimpleSpec ──

/// Plain sequencing node: predicts its successors as LIKELY (forking when
/// there is more than one), readies when its parent completes, activates
/// its children on completion.
pub struct SimpleSpec {
    name: String,
    manual: bool,
    end: bool,
    outputs: Vec<Arc<dyn TaskSpec>>,
}

impl SimpleSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            manual: false,
            end: false,
            outputs: Vec::new(),
        }
    }

    /// An end node: merges its task data into workflow data on completion.
    pub fn end(name: impl Into<String>) -> Self {
        Self {
            end: true,
            ..Self::new(name)
        }
    }

    pub fn manual(mut self) -> Self {
        self.manual = true;
        self
    }

    pub fn with_outputs(mut self, outputs: Vec<Arc<dyn TaskSpec>>) -> Self {
        self.outputs = outputs;
        self
    }
}

impl TaskSpec for SimpleSpec {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_manual(&self) -> bool {
        self.manual
    }

    fn is_end(&self) -> bool {
        self.end
    }

    fn predict(&self, workflow: &mut Workflow, task: TaskId) -> anyhow::Result<()> {
        let fork = self.outputs.len() > 1;
        predict_outputs(workflow, task, &self.outputs, TaskState::Likely, fork)
    }

    fn update(&self, workflow: &mut Workflow, task: TaskId) -> anyhow::Result<()> {
        ready_when_parent_complete(workflow, task)
    }

    fn on_complete(&self, workflow: &mut Workflow, task: TaskId) -> anyhow::Result<()> {
        let fork = self.outputs.len() > 1;
        predict_outputs(workflow, task, &self.outputs, TaskState::Likely, fork)?;
        activate_children(workflow, task)
    }
}

// ── CatchEventSpec ──

/// Waits for a staged message, signal, or cancellation flag matching its
/// declared event name. Message payloads land in task data under the
/// delivery's result variable, or the event name when none was given.
pub struct CatchEventSpec {
    name: String,
    event: EventDefinition,
    outputs: Vec<Arc<dyn TaskSpec>>,
}

impl CatchEventSpec {
    pub fn signal(name: impl Into<String>, event_name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            event: EventDefinition::signal(event_name),
            outputs: Vec::new(),
        }
    }

    pub fn message(
        name: impl Into<String>,
        declared: impl Into<String>,
        external: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            event: EventDefinition::message(declared, external),
            outputs: Vec::new(),
        }
    }

    pub fn with_outputs(mut self, outputs: Vec<Arc<dyn TaskSpec>>) -> Self {
        self.outputs = outputs;
        self
    }

    fn staged_flag(&self, workflow: &Workflow, key: &str) -> bool {
        workflow
            .staged_internal(key)
            .and_then(|staged| staged.get(&self.event.name))
            .is_some()
    }
}

impl TaskSpec for CatchEventSpec {
    fn name(&self) -> &str {
        &self.name
    }

    fn event_definition(&self) -> Option<&EventDefinition> {
        Some(&self.event)
    }

    fn predict(&self, workflow: &mut Workflow, task: TaskId) -> anyhow::Result<()> {
        let fork = self.outputs.len() > 1;
        predict_outputs(workflow, task, &self.outputs, TaskState::Likely, fork)
    }

    fn update(&self, workflow: &mut Workflow, task: TaskId) -> anyhow::Result<()> {
        let state = workflow.task(task)?.state();
        if state.is_finished() || state == TaskState::Ready {
            return Ok(());
        }
        let staged_message = workflow
            .staged_internal(MESSAGES_KEY)
            .and_then(|staged| staged.get(&self.event.name))
            .cloned();
        if let Some(delivery) = staged_message {
            let payload = delivery.get(0).cloned().unwrap_or(serde_json::Value::Null);
            let result_var = delivery
                .get(1)
                .and_then(|v| v.as_str())
                .map(str::to_string)
                .unwrap_or_else(|| self.event.name.clone());
            workflow.task_mut(task)?.data.insert(result_var, payload);
            workflow.set_task_state(task, TaskState::Ready)?;
            return Ok(());
        }
        if self.staged_flag(workflow, SIGNALS_KEY) || self.staged_flag(workflow, CANCELS_KEY) {
            workflow.set_task_state(task, TaskState::Ready)?;
            return Ok(());
        }
        workflow.set_task_state(task, TaskState::Waiting)?;
        Ok(())
    }

    fn on_complete(&self, workflow: &mut Workflow, task: TaskId) -> anyhow::Result<()> {
        let fork = self.outputs.len() > 1;
        predict_outputs(workflow, task, &self.outputs, TaskState::Likely, fork)?;
        activate_children(workflow, task)
    }
}

// ── BoundaryEventContainerSpec ──

/// Groups a primary activity with its boundary events. The primary is
/// predicted LIKELY, the events MAYBE; completing the container activates
/// all of them. The container flag makes the correlation sweep re-arm
/// completed boundary events while the primary is still READY.
pub struct BoundaryEventContainerSpec {
    name: String,
    primary: Arc<dyn TaskSpec>,
    events: Vec<Arc<dyn TaskSpec>>,
}

impl BoundaryEventContainerSpec {
    pub fn new(
        name: impl Into<String>,
        primary: Arc<dyn TaskSpec>,
        events: Vec<Arc<dyn TaskSpec>>,
    ) -> Self {
        Self {
            name: name.into(),
            primary,
            events,
        }
    }
}

impl TaskSpec for BoundaryEventContainerSpec {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_boundary_event_container(&self) -> bool {
        true
    }

    fn predict(&self, workflow: &mut Workflow, task: TaskId) -> anyhow::Result<()> {
        predict_outputs(
            workflow,
            task,
            std::slice::from_ref(&self.primary),
            TaskState::Likely,
            false,
        )?;
        predict_outputs(workflow, task, &self.events, TaskState::Maybe, false)
    }

    fn update(&self, workflow: &mut Workflow, task: TaskId) -> anyhow::Result<()> {
        ready_when_parent_complete(workflow, task)
    }

    fn on_complete(&self, workflow: &mut Workflow, task: TaskId) -> anyhow::Result<()> {
        self.predict(workflow, task)?;
        activate_children(workflow, task)
    }
}

// ── BusinessRuleSpec ──

/// Consults a decision table on completion, merging the first matching
/// rule's outputs into task data. The task's data map doubles as the
/// named-input scope.
pub struct BusinessRuleSpec {
    name: String,
    engine: DecisionEngine,
    outputs: Vec<Arc<dyn TaskSpec>>,
}

impl BusinessRuleSpec {
    pub fn new(name: impl Into<String>, engine: DecisionEngine) -> Self {
        Self {
            name: name.into(),
            engine,
            outputs: Vec::new(),
        }
    }

    pub fn with_outputs(mut self, outputs: Vec<Arc<dyn TaskSpec>>) -> Self {
        self.outputs = outputs;
        self
    }
}

impl TaskSpec for BusinessRuleSpec {
    fn name(&self) -> &str {
        &self.name
    }

    fn predict(&self, workflow: &mut Workflow, task: TaskId) -> anyhow::Result<()> {
        let fork = self.outputs.len() > 1;
        predict_outputs(workflow, task, &self.outputs, TaskState::Likely, fork)
    }

    fn update(&self, workflow: &mut Workflow, task: TaskId) -> anyhow::Result<()> {
        ready_when_parent_complete(workflow, task)
    }

    fn on_complete(&self, workflow: &mut Workflow, task: TaskId) -> anyhow::Result<()> {
        let named = workflow.task(task)?.data.clone();
        if let Some(rule) = self.engine.decide(&[], &named)? {
            let outputs = rule.output_as_map();
            workflow.task_mut(task)?.data.extend(outputs);
        }
        let fork = self.outputs.len() > 1;
        predict_outputs(workflow, task, &self.outputs, TaskState::Likely, fork)?;
        activate_children(workflow, task)
    }
}

// ── mutex specs ──

/// Waits until it can take the named mutex handle, then readies. The
/// matching [`ReleaseMutexSpec`] frees the handle.
pub struct AcquireMutexSpec {
    name: String,
    mutex: String,
    outputs: Vec<Arc<dyn TaskSpec>>,
}

impl AcquireMutexSpec {
    pub fn new(name: impl Into<String>, mutex: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            mutex: mutex.into(),
            outputs: Vec::new(),
        }
    }

    pub fn with_outputs(mut self, outputs: Vec<Arc<dyn TaskSpec>>) -> Self {
        self.outputs = outputs;
        self
    }
}

impl TaskSpec for AcquireMutexSpec {
    fn name(&self) -> &str {
        &self.name
    }

    fn predict(&self, workflow: &mut Workflow, task: TaskId) -> anyhow::Result<()> {
        let fork = self.outputs.len() > 1;
        predict_outputs(workflow, task, &self.outputs, TaskState::Likely, fork)
    }

    fn update(&self, workflow: &mut Workflow, task: TaskId) -> anyhow::Result<()> {
        let state = workflow.task(task)?.state();
        if state.is_finished() || state == TaskState::Ready {
            return Ok(());
        }
        let parent_done = match workflow.task(task)?.parent() {
            Some(parent) => workflow.task(parent)?.state() == TaskState::Completed,
            None => true,
        };
        if parent_done && workflow.mutex(&self.mutex).test_and_set() {
            workflow.set_task_state(task, TaskState::Ready)?;
        } else {
            workflow.set_task_state(task, TaskState::Waiting)?;
        }
        Ok(())
    }

    fn on_complete(&self, workflow: &mut Workflow, task: TaskId) -> anyhow::Result<()> {
        let fork = self.outputs.len() > 1;
        predict_outputs(workflow, task, &self.outputs, TaskState::Likely, fork)?;
        activate_children(workflow, task)
    }
}

pub struct ReleaseMutexSpec {
    name: String,
    mutex: String,
    outputs: Vec<Arc<dyn TaskSpec>>,
}

impl ReleaseMutexSpec {
    pub fn new(name: impl Into<String>, mutex: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            mutex: mutex.into(),
            outputs: Vec::new(),
        }
    }

    pub fn with_outputs(mut self, outputs: Vec<Arc<dyn TaskSpec>>) -> Self {
        self.outputs = outputs;
        self
    }
}

impl TaskSpec for ReleaseMutexSpec {
    fn name(&self) -> &str {
        &self.name
    }

    fn predict(&self, workflow: &mut Workflow, task: TaskId) -> anyhow::Result<()> {
        let fork = self.outputs.len() > 1;
        predict_outputs(workflow, task, &self.outputs, TaskState::Likely, fork)
    }

    fn update(&self, workflow: &mut Workflow, task: TaskId) -> anyhow::Result<()> {
        ready_when_parent_complete(workflow, task)
    }

    fn on_complete(&self, workflow: &mut Workflow, task: TaskId) -> anyhow::Result<()> {
        workflow.mutex(&self.mutex).unlock();
        let fork = self.outputs.len() > 1;
        predict_outputs(workflow, task, &self.outputs, TaskState::Likely, fork)?;
        activate_children(workflow, task)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decision::{
        Condition, DecisionTable, Input, InputEntry, OutputEntry, Rule, RuleOperator,
    };
    use crate::error::EngineError;
    use crate::tree::TaskId;
    use serde_json::json;

    fn find(workflow: &Workflow, name: &str) -> TaskId {
        workflow.get_tasks_from_spec_name(name)[0].id()
    }

    #[test]
    fn fork_assigns_distinct_branch_ids() {
        let start = Arc::new(SimpleSpec::new("start").with_outputs(vec![
            Arc::new(SimpleSpec::new("a")),
            Arc::new(SimpleSpec::new("b")),
        ]));
        let workflow = Workflow::new(start).unwrap();
        let a = workflow.task(find(&workflow, "a")).unwrap().thread_id();
        let b = workflow.task(find(&workflow, "b")).unwrap().thread_id();
        assert_ne!(a, b);
        assert_ne!(a, 0);
        assert_ne!(b, 0);
    }

    #[test]
    fn predicted_children_are_not_duplicated_on_completion() {
        let start = Arc::new(
            SimpleSpec::new("start").with_outputs(vec![Arc::new(SimpleSpec::new("next"))]),
        );
        let mut workflow = Workflow::new(start).unwrap();
        assert_eq!(workflow.get_tasks_from_spec_name("next").len(), 1);
        workflow.complete_all(true, true).unwrap();
        assert_eq!(workflow.get_tasks_from_spec_name("next").len(), 1);
    }

    #[test]
    fn business_rule_merges_matching_outputs_into_task_data() {
        let table = DecisionTable::new(
            vec![Input::new("age")],
            vec![
                Rule::new(
                    "adult",
                    "",
                    vec![InputEntry::new(vec![Condition::new(RuleOperator::Ge, 18)])],
                    vec![OutputEntry::new("category", "adult")],
                ),
                Rule::new(
                    "minor",
                    "",
                    vec![InputEntry::new(vec![Condition::new(RuleOperator::Lt, 18)])],
                    vec![OutputEntry::new("category", "minor")],
                ),
            ],
        );
        let rule_task = Arc::new(BusinessRuleSpec::new("classify", DecisionEngine::new(table))
            .with_outputs(vec![Arc::new(SimpleSpec::end("done"))]));
        let start = Arc::new(SimpleSpec::new("start").with_outputs(vec![rule_task]));
        let mut workflow = Workflow::new(start).unwrap();

        assert!(workflow.complete_next(true, true).unwrap()); // start
        let classify = find(&workflow, "classify");
        workflow
            .task_mut(classify)
            .unwrap()
            .data
            .insert("age".into(), json!(20));
        workflow.complete_task(classify).unwrap();
        assert_eq!(
            workflow.task(classify).unwrap().data.get("category"),
            Some(&json!("adult"))
        );

        workflow.complete_all(true, true).unwrap();
        // the end node inherited the merged data and pushed it up
        assert_eq!(workflow.get_data("category"), Some(&json!("adult")));
    }

    #[test]
    fn business_rule_with_no_match_leaves_data_untouched() {
        let table = DecisionTable::new(
            vec![Input::new("age")],
            vec![Rule::new(
                "centenarian",
                "",
                vec![InputEntry::new(vec![Condition::new(RuleOperator::Ge, 100)])],
                vec![OutputEntry::new("category", "ancient")],
            )],
        );
        let rule_task = Arc::new(BusinessRuleSpec::new("classify", DecisionEngine::new(table)));
        let start = Arc::new(SimpleSpec::new("start").with_outputs(vec![rule_task]));
        let mut workflow = Workflow::new(start).unwrap();
        assert!(workflow.complete_next(true, true).unwrap());

        let classify = find(&workflow, "classify");
        workflow
            .task_mut(classify)
            .unwrap()
            .data
            .insert("age".into(), json!(20));
        workflow.complete_task(classify).unwrap();
        assert!(workflow.task(classify).unwrap().data.get("category").is_none());
        assert_eq!(
            workflow.task(classify).unwrap().state(),
            TaskState::Completed
        );
    }

    #[test]
    fn mutex_orders_contending_branches() {
        let branch = |acq: &str, rel: &str| -> Arc<dyn TaskSpec> {
            Arc::new(
                AcquireMutexSpec::new(acq, "shared")
                    .with_outputs(vec![Arc::new(ReleaseMutexSpec::new(rel, "shared"))]),
            )
        };
        let start = Arc::new(
            SimpleSpec::new("start").with_outputs(vec![branch("acq1", "rel1"), branch("acq2", "rel2")]),
        );
        let mut workflow = Workflow::new(start).unwrap();

        assert!(workflow.complete_next(true, true).unwrap()); // start
        let acq1 = find(&workflow, "acq1");
        let acq2 = find(&workflow, "acq2");
        // first branch holds the handle, second stays parked
        assert_eq!(workflow.task(acq1).unwrap().state(), TaskState::Ready);
        assert_eq!(workflow.task(acq2).unwrap().state(), TaskState::Waiting);
        assert!(workflow.mutex("shared").is_locked());

        workflow.complete_all(true, true).unwrap();
        assert!(workflow.is_completed());
        assert!(!workflow.mutex("shared").is_locked());
        for name in ["acq1", "rel1", "acq2", "rel2"] {
            let id = find(&workflow, name);
            assert_eq!(workflow.task(id).unwrap().state(), TaskState::Completed);
        }
    }

    #[test]
    fn readied_catch_event_survives_an_update_sweep() {
        let start = Arc::new(SimpleSpec::new("start").with_outputs(vec![Arc::new(
            CatchEventSpec::message("wait-approval", "approval", "approval_msg"),
        )]));
        let mut workflow = Workflow::new(start).unwrap();
        workflow.complete_all(true, true).unwrap();

        let waiting = find(&workflow, "wait-approval");
        workflow
            .message("approval", json!({"ok": true}), Some("resp"))
            .unwrap();
        assert_eq!(workflow.task(waiting).unwrap().state(), TaskState::Ready);

        // further readiness recomputation with nothing staged must not
        // demote the node or drop the consumed payload
        workflow.update_task(waiting).unwrap();
        workflow.refresh_waiting_tasks().unwrap();
        let node = workflow.task(waiting).unwrap();
        assert_eq!(node.state(), TaskState::Ready);
        assert_eq!(node.data.get("resp"), Some(&json!({"ok": true})));
    }

    #[test]
    fn unresolvable_rule_input_surfaces_as_an_evaluation_error() {
        let table = DecisionTable::new(
            vec![Input::new("age")],
            vec![Rule::new(
                "adult",
                "",
                vec![InputEntry::new(vec![Condition::new(RuleOperator::Ge, 18)])],
                vec![OutputEntry::new("category", "adult")],
            )],
        );
        let rule_task = Arc::new(BusinessRuleSpec::new("classify", DecisionEngine::new(table)));
        let start = Arc::new(SimpleSpec::new("start").with_outputs(vec![rule_task]));
        let mut workflow = Workflow::new(start).unwrap();
        assert!(workflow.complete_next(true, true).unwrap());

        // no "age" anywhere in scope: completing the rule task must fail
        // with the typed decision error, not an opaque hook failure
        let classify = find(&workflow, "classify");
        let err = workflow.complete_task(classify).unwrap_err();
        assert!(matches!(
            err,
            EngineError::Evaluation(ref evaluation)
                if evaluation.rule_id == "adult" && evaluation.column == 0
        ));
        // the failed step left the task untouched
        assert_eq!(workflow.task(classify).unwrap().state(), TaskState::Ready);
    }

    #[test]
    fn cancel_notify_releases_a_token_reset_watcher() {
        let start = Arc::new(SimpleSpec::new("start").with_outputs(vec![Arc::new(
            CatchEventSpec::signal("on-reset", crate::engine::TOKEN_RESET_KEY),
        )]));
        let mut workflow = Workflow::new(start).unwrap();
        workflow.complete_all(true, true).unwrap();
        let watcher = find(&workflow, "on-reset");
        assert_eq!(workflow.task(watcher).unwrap().state(), TaskState::Waiting);

        workflow.cancel_notify().unwrap();
        assert_eq!(workflow.task(watcher).unwrap().state(), TaskState::Ready);
        assert!(workflow.staged_internal(CANCELS_KEY).is_none());
    }
}
