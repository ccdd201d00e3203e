//! taskflow-core: a task-tree workflow engine with decision-table rules
//!
//! Given a process definition (a graph of task specs with branching, forks,
//! and event-based waits), the engine materializes a live tree of task
//! instances and drives it to completion:
//! - Task lifecycle states with bitmask-filtered pre-order traversal
//! - A two-phase predict/update spec contract for lookahead vs. readiness
//! - A stepping protocol (`complete_next` / `complete_all`) with resume and
//!   manual-task halting
//! - Message/signal correlation with declared-name aliasing and boundary
//!   event re-arming
//! - An in-process mutex registry for cross-branch exclusion
//! - A first-match-wins decision-table evaluator with exact decimal
//!   comparison and a restricted expression grammar
//!
//! Authoring formats, persistence encodings, and concrete process-element
//! breadth live outside this crate; the serializer and spec contracts are
//! the seams they plug into.

pub mod decision;
pub mod engine;
pub mod error;
pub mod mutex;
pub mod serializer;
pub mod spec;
pub mod specs;
pub mod states;
pub mod tree;

// Re-export the working surface
pub use decision::{
    Condition, DecisionEngine, DecisionTable, EvaluationError, EvaluationErrorKind, Input,
    InputEntry, OutputEntry, Rule, RuleOperator, RuleValue,
};
pub use engine::{Workflow, CANCELS_KEY, MESSAGES_KEY, SIGNALS_KEY, TOKEN_RESET_KEY};
pub use error::{EngineError, EngineResult};
pub use mutex::{MutexHandle, MutexRegistry};
pub use serializer::{TaskSnapshot, WorkflowSerializer, WorkflowSnapshot};
pub use spec::{EventDefinition, SpecRegistry, TaskSpec};
pub use states::{StateMask, TaskState};
pub use tree::{TaskId, TaskNode, TaskTree, TreeIterator};
