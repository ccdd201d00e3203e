//! Task instance lifecycle states and the bitmask groupings used for
//! filtered tree traversal.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::BitOr;

/// Lifecycle state of a single task instance.
///
/// Transitions are monotonic: `Future` → {`Likely`, `Maybe`, `Waiting`} →
/// `Ready` → `Completed`. `Cancelled` is reachable from any unfinished
/// state. Once a task is finished (`Completed` or `Cancelled`) it never
/// leaves that state except through an explicit token reset.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u16)]
pub enum TaskState {
    /// Will definitely run, once its predecessors complete.
    Future = 0x01,
    /// Predicted: probably runs (lookahead annotation only).
    Likely = 0x02,
    /// Predicted: may or may not run (lookahead annotation only).
    Maybe = 0x04,
    /// Activated but its preconditions do not hold yet.
    Waiting = 0x08,
    /// Eligible for completion.
    Ready = 0x10,
    Completed = 0x20,
    Cancelled = 0x40,
}

impl TaskState {
    /// Terminal states never transition again without a token reset.
    pub fn is_finished(self) -> bool {
        StateMask::FINISHED.contains(self)
    }

    pub fn mask(self) -> StateMask {
        StateMask(self as u16)
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TaskState::Future => "FUTURE",
            TaskState::Likely => "LIKELY",
            TaskState::Maybe => "MAYBE",
            TaskState::Waiting => "WAITING",
            TaskState::Ready => "READY",
            TaskState::Completed => "COMPLETED",
            TaskState::Cancelled => "CANCELLED",
        };
        f.write_str(name)
    }
}

/// A set of [`TaskState`]s, used to filter tree iteration.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateMask(pub u16);

impl StateMask {
    pub const ANY: StateMask = StateMask(0x7F);
    pub const FINISHED: StateMask =
        StateMask(TaskState::Completed as u16 | TaskState::Cancelled as u16);
    pub const NOT_FINISHED: StateMask = StateMask(Self::ANY.0 & !Self::FINISHED.0);
    /// Lookahead-only states produced by `predict`.
    pub const PREDICTED: StateMask =
        StateMask(TaskState::Likely as u16 | TaskState::Maybe as u16);
    /// States that are certain to be (or have been) on the executed path.
    pub const DEFINITE: StateMask = StateMask(Self::ANY.0 & !Self::PREDICTED.0);

    pub fn contains(self, state: TaskState) -> bool {
        self.0 & state as u16 != 0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl From<TaskState> for StateMask {
    fn from(state: TaskState) -> Self {
        state.mask()
    }
}

impl BitOr for StateMask {
    type Output = StateMask;

    fn bitor(self, rhs: StateMask) -> StateMask {
        StateMask(self.0 | rhs.0)
    }
}

impl BitOr<TaskState> for StateMask {
    type Output = StateMask;

    fn bitor(self, rhs: TaskState) -> StateMask {
        StateMask(self.0 | rhs as u16)
    }
}

impl BitOr for TaskState {
    type Output = StateMask;

    fn bitor(self, rhs: TaskState) -> StateMask {
        StateMask(self as u16 | rhs as u16)
    }
}
