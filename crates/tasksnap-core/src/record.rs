//! Immutable per-task snapshot records.

use std::collections::BTreeMap;
use std::io::Write;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::source::RawTask;
use crate::task::{TaskId, TaskStatus};

/// A point-in-time snapshot of one task.
///
/// Records own every byte they hold: labels are copied out of the live task
/// at capture time, so later label changes never reach an existing record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskRecord {
    id: Option<TaskId>,
    stack: Vec<u64>,
    status: TaskStatus,
    created_by: Option<u64>,
    waiting_since: Duration,
    labels: BTreeMap<String, String>,
}

impl TaskRecord {
    /// A record with an empty stack, no creator, no wait and no labels.
    #[must_use]
    pub fn new(id: Option<TaskId>, status: TaskStatus) -> Self {
        Self {
            id,
            stack: Vec::new(),
            status,
            created_by: None,
            waiting_since: Duration::ZERO,
            labels: BTreeMap::new(),
        }
    }

    /// Set the stack, innermost frame first.
    #[must_use]
    pub fn with_stack(mut self, stack: Vec<u64>) -> Self {
        self.stack = stack;
        self
    }

    /// Set the spawning call site.
    #[must_use]
    pub fn with_created_by(mut self, addr: u64) -> Self {
        self.created_by = Some(addr);
        self
    }

    /// Set how long the task has been blocked.
    #[must_use]
    pub fn with_waiting_since(mut self, waiting: Duration) -> Self {
        self.waiting_since = waiting;
        self
    }

    /// Set the labels.
    #[must_use]
    pub fn with_labels(mut self, labels: BTreeMap<String, String>) -> Self {
        self.labels = labels;
        self
    }

    /// Detach a raw capture into an owned record, truncating the stack to
    /// `max_depth` frames.
    pub(crate) fn from_raw(raw: RawTask, max_depth: usize) -> Self {
        let RawTask {
            id,
            mut stack,
            status,
            created_by,
            waiting,
            labels,
        } = raw;
        stack.truncate(max_depth);
        Self {
            id,
            stack,
            status,
            created_by,
            waiting_since: waiting,
            labels: labels.to_map(),
        }
    }

    /// Task identity, if the source exposes one.
    #[must_use]
    pub fn id(&self) -> Option<TaskId> {
        self.id
    }

    /// Instruction addresses, innermost first.
    #[must_use]
    pub fn stack(&self) -> &[u64] {
        &self.stack
    }

    /// Scheduling status at capture time.
    #[must_use]
    pub fn status(&self) -> TaskStatus {
        self.status
    }

    /// Address of the call site that spawned the task; `None` for root tasks.
    #[must_use]
    pub fn created_by(&self) -> Option<u64> {
        self.created_by
    }

    /// How long the task had been continuously blocked; zero if not blocked.
    #[must_use]
    pub fn waiting_since(&self) -> Duration {
        self.waiting_since
    }

    /// Labels held at capture time.
    #[must_use]
    pub fn labels(&self) -> &BTreeMap<String, String> {
        &self.labels
    }

    /// Value of one label.
    #[must_use]
    pub fn label(&self, key: &str) -> Option<&str> {
        self.labels.get(key).map(String::as_str)
    }
}

/// Write records as newline-delimited JSON, one record per line.
pub fn write_json_lines<W: Write>(records: &[TaskRecord], mut writer: W) -> Result<()> {
    for record in records {
        serde_json::to_writer(&mut writer, record)?;
        writer.write_all(b"\n")?;
    }
    writer.flush()?;
    Ok(())
}
