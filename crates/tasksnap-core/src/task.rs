//! Task identity and scheduling status.

use serde::{Deserialize, Serialize};

/// Process-unique identity of a live task.
///
/// Ids are never reused by a [`TaskTable`](crate::task_table::TaskTable), so
/// an id held after the task exits can only miss, never alias another task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(u64);

impl TaskId {
    /// Wrap a raw id.
    #[must_use]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// The raw id value.
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Scheduling state of a task at capture time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Ready to run, waiting for a worker.
    #[default]
    Runnable,
    /// Currently executing on a worker.
    Running,
    /// Parked on a channel send or receive.
    BlockedOnChannel,
    /// Inside a blocking system call.
    BlockedOnSyscall,
    /// Waiting to acquire a lock.
    BlockedOnLock,
    /// Parked until a timer fires.
    Sleeping,
    /// Pending on an event the scheduler cannot classify.
    Waiting,
    /// Exited; only observable in a record captured during teardown.
    Dead,
    /// Status text a source reported that maps to no known state.
    Unknown,
}

impl TaskStatus {
    /// Text used in rendered output.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Runnable => "runnable",
            Self::Running => "running",
            Self::BlockedOnChannel => "chan wait",
            Self::BlockedOnSyscall => "syscall",
            Self::BlockedOnLock => "lock wait",
            Self::Sleeping => "sleep",
            Self::Waiting => "wait",
            Self::Dead => "dead",
            Self::Unknown => "unknown",
        }
    }

    /// Map status text back to a variant. Unrecognised text yields
    /// [`TaskStatus::Unknown`].
    #[must_use]
    pub fn parse(text: &str) -> Self {
        match text.trim() {
            "runnable" => Self::Runnable,
            "running" => Self::Running,
            "chan wait" | "chan receive" | "chan send" => Self::BlockedOnChannel,
            "syscall" => Self::BlockedOnSyscall,
            "lock wait" | "semacquire" => Self::BlockedOnLock,
            "sleep" => Self::Sleeping,
            "wait" => Self::Waiting,
            "dead" => Self::Dead,
            _ => Self::Unknown,
        }
    }

    /// Whether the task is parked and accumulating wait time.
    #[must_use]
    pub const fn is_blocked(self) -> bool {
        matches!(
            self,
            Self::BlockedOnChannel
                | Self::BlockedOnSyscall
                | Self::BlockedOnLock
                | Self::Sleeping
                | Self::Waiting
        )
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
