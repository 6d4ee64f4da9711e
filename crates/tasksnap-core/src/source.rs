//! The scheduler-side capture interface.
//!
//! A [`TaskSource`] is whatever owns the live task population: it estimates
//! the population, exposes its [`LabelRegistry`], and copies raw per-task
//! data into a caller-sized [`CaptureBuffer`]. The capturer drives the
//! estimate → fill → retry loop on top of it.

use std::sync::Arc;
use std::time::Duration;

use crate::error::Result;
use crate::labels::{LabelFilter, LabelSet};
use crate::registry::LabelRegistry;
use crate::task::{TaskId, TaskStatus};

/// Raw data copied out of one live task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawTask {
    /// Task identity, if exposed.
    pub id: Option<TaskId>,
    /// Instruction addresses, innermost first.
    pub stack: Vec<u64>,
    /// Scheduling status.
    pub status: TaskStatus,
    /// Spawning call site.
    pub created_by: Option<u64>,
    /// Time spent blocked so far.
    pub waiting: Duration,
    /// Label set installed at copy time.
    pub labels: LabelSet,
}

/// What a fill should cover.
#[derive(Debug, Clone, Copy)]
pub struct FillRequest<'a> {
    /// Pairs every copied task must carry.
    pub filter: &'a LabelFilter,
    /// Registry-selected tasks to walk instead of the whole population.
    /// `None` means walk everything.
    pub candidates: Option<&'a [TaskId]>,
    /// Rotating start position into the matching population.
    pub offset: u64,
    /// Maximum number of stack frames to copy per task.
    pub max_stack_depth: usize,
}

/// Outcome of one fill.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FillStatus {
    /// Tasks written into the buffer.
    pub written: usize,
    /// Tasks that matched the request at fill time.
    pub population: usize,
    /// Whether matching tasks were left out because the buffer was full.
    pub more: bool,
}

/// Slots reserved up front; a larger logical capacity grows on demand.
const INITIAL_RESERVE: usize = 1024;

/// Fixed-capacity buffer a source fills.
///
/// `capacity` is a logical limit: memory is reserved as tasks arrive, so a
/// huge cap over a small population costs only what is written.
#[derive(Debug)]
pub struct CaptureBuffer {
    tasks: Vec<RawTask>,
    capacity: usize,
}

impl CaptureBuffer {
    /// Buffer holding at most `capacity` tasks.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            tasks: Vec::with_capacity(capacity.min(INITIAL_RESERVE)),
            capacity,
        }
    }

    /// Maximum number of tasks.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Tasks written so far.
    #[must_use]
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    /// Whether nothing has been written.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Whether no more tasks fit.
    #[must_use]
    pub fn is_full(&self) -> bool {
        self.tasks.len() >= self.capacity
    }

    /// Append a task. Returns `false`, dropping it, when the buffer is full.
    pub fn push(&mut self, task: RawTask) -> bool {
        if self.is_full() {
            return false;
        }
        self.tasks.push(task);
        true
    }

    /// Written tasks.
    #[must_use]
    pub fn tasks(&self) -> &[RawTask] {
        &self.tasks
    }

    /// Take the written tasks.
    #[must_use]
    pub fn into_tasks(self) -> Vec<RawTask> {
        self.tasks
    }
}

/// A live task population that can be snapshotted.
///
/// # Fill contract
///
/// Let `matching` be the tasks selected by the request (every live task, or
/// the live subset of `candidates`) whose current labels satisfy `filter`,
/// in a stable order. The source writes the tasks at positions
/// `(offset + i) % matching.len()` for `i` in `0..min(capacity, matching.len())`
/// and reports `population = matching.len()`. `more` must be `true` whenever
/// `written < population`: the capturer's retry loop relies on it never
/// under-reporting.
pub trait TaskSource: Send + Sync {
    /// Approximate live population; may be stale.
    fn estimate_population(&self) -> usize;

    /// The label index maintained by this source.
    fn registry(&self) -> &LabelRegistry;

    /// Copy matching tasks into `buffer`.
    ///
    /// Errors only when the source detects its own state is corrupt.
    fn fill(&self, request: &FillRequest<'_>, buffer: &mut CaptureBuffer) -> Result<FillStatus>;
}

impl<T: TaskSource + ?Sized> TaskSource for Arc<T> {
    fn estimate_population(&self) -> usize {
        (**self).estimate_population()
    }

    fn registry(&self) -> &LabelRegistry {
        (**self).registry()
    }

    fn fill(&self, request: &FillRequest<'_>, buffer: &mut CaptureBuffer) -> Result<FillStatus> {
        (**self).fill(request, buffer)
    }
}

impl<T: TaskSource + ?Sized> TaskSource for &T {
    fn estimate_population(&self) -> usize {
        (**self).estimate_population()
    }

    fn registry(&self) -> &LabelRegistry {
        (**self).registry()
    }

    fn fill(&self, request: &FillRequest<'_>, buffer: &mut CaptureBuffer) -> Result<FillStatus> {
        (**self).fill(request, buffer)
    }
}
