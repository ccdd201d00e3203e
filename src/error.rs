//! Engine-level error taxonomy.
//!
//! Structural problems (dangling ids, registry misses) and hook failures are
//! hard errors. Outcomes that are part of normal operation, such as "no rule
//! matched" or "nothing was ready", are expressed as `Ok` values by the
//! operations themselves.

use crate::decision::EvaluationError;
use crate::tree::TaskId;
use thiserror::Error;

pub type EngineResult<T> = Result<T, EngineError>;

#[derive(Debug, Error)]
pub enum EngineError {
    /// An operation referenced a task id not present in the tree.
    #[error("no task with id {0} in the tree")]
    UnknownTask(TaskId),

    /// Deserialization referenced a spec name missing from the registry.
    #[error("no spec named '{0}' in the registry")]
    UnknownSpec(String),

    /// A spec hook failed while running against a task.
    #[error("spec '{spec}' failed in {hook} for task {task_id}")]
    Execution {
        task_id: TaskId,
        spec: String,
        hook: &'static str,
        #[source]
        source: anyhow::Error,
    },

    /// A decision-table evaluation failed.
    #[error(transparent)]
    Evaluation(#[from] EvaluationError),
}

impl EngineError {
    /// Wrap a failed spec hook. A hook that failed because a decision table
    /// failed to evaluate surfaces as [`EngineError::Evaluation`] rather
    /// than being buried in the opaque execution error.
    pub(crate) fn execution(
        task_id: TaskId,
        spec: &str,
        hook: &'static str,
        source: anyhow::Error,
    ) -> Self {
        match source.downcast::<EvaluationError>() {
            Ok(evaluation) => EngineError::Evaluation(evaluation),
            Err(source) => EngineError::Execution {
                task_id,
                spec: spec.to_string(),
                hook,
                source,
            },
        }
    }
}
