//! In-process task table: the live population a [`Capturer`] snapshots.
//!
//! Every task owns a slot holding its status, stack, park instant and
//! current labels behind a per-slot lock. The table indexes slots by id and
//! keeps the [`LabelRegistry`] in step with slot labels.
//!
//! # Lock order
//!
//! table → slot → registry. The registry lock is never held while a slot or
//! the table is locked by the same thread in the opposite direction:
//! [`LabelRegistry::candidates`] releases it before the fill touches slots.
//!
//! Spawn installs labels before the slot becomes visible; exit removes the
//! slot before tearing labels down. A registry candidate without a slot is
//! therefore always a task mid-spawn or mid-exit, and is skipped.
//!
//! [`Capturer`]: crate::capture::Capturer

use std::collections::BTreeMap;
use std::future::Future;
use std::panic::Location;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::{Duration, Instant};

use crate::error::{Error, Result};
use crate::instrument::Instrumented;
use crate::labels::{LabelFilter, LabelSet};
use crate::registry::LabelRegistry;
use crate::sampler::rotating_positions;
use crate::source::{CaptureBuffer, FillRequest, FillStatus, RawTask, TaskSource};
use crate::symbols::SymbolTable;
use crate::task::{TaskId, TaskStatus};

/// Frames retained per task by default.
pub const DEFAULT_STACK_DEPTH: usize = 128;

// =============================================================================
// Slot
// =============================================================================

#[derive(Debug)]
struct SlotState {
    status: TaskStatus,
    stack: Vec<u64>,
    parked_at: Option<Instant>,
    labels: LabelSet,
}

impl SlotState {
    fn transition(&mut self, status: TaskStatus) {
        if status.is_blocked() {
            if !self.status.is_blocked() || self.parked_at.is_none() {
                self.parked_at = Some(Instant::now());
            }
        } else {
            self.parked_at = None;
        }
        self.status = status;
    }

    fn waiting(&self, now: Instant) -> Duration {
        match self.parked_at {
            Some(since) if self.status.is_blocked() => now.saturating_duration_since(since),
            _ => Duration::ZERO,
        }
    }
}

/// Per-task state shared between the table, the task's handle and wakers.
#[derive(Debug)]
pub(crate) struct TaskSlot {
    id: TaskId,
    created_by: Option<u64>,
    state: Mutex<SlotState>,
    woken: AtomicBool,
}

impl TaskSlot {
    fn lock(&self) -> MutexGuard<'_, SlotState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn set_status(&self, status: TaskStatus) {
        self.lock().transition(status);
    }

    pub(crate) fn status(&self) -> TaskStatus {
        self.lock().status
    }

    /// About to poll: running, with any earlier wake consumed.
    pub(crate) fn begin_poll(&self) {
        let mut state = self.lock();
        self.woken.store(false, Ordering::Release);
        state.transition(TaskStatus::Running);
    }

    /// Poll returned pending: runnable again if woken meanwhile, else waiting.
    pub(crate) fn end_poll_pending(&self) {
        let mut state = self.lock();
        if self.woken.swap(false, Ordering::AcqRel) {
            state.transition(TaskStatus::Runnable);
        } else {
            state.transition(TaskStatus::Waiting);
        }
    }

    /// A waker fired for this task.
    pub(crate) fn wake(&self) {
        self.woken.store(true, Ordering::Release);
        let mut state = self.lock();
        if state.status == TaskStatus::Waiting {
            state.transition(TaskStatus::Runnable);
        }
    }

    fn snapshot(&self, state: &SlotState, max_depth: usize, now: Instant) -> RawTask {
        let depth = state.stack.len().min(max_depth);
        RawTask {
            id: Some(self.id),
            stack: state.stack[..depth].to_vec(),
            status: state.status,
            created_by: self.created_by,
            waiting: state.waiting(now),
            labels: state.labels.clone(),
        }
    }
}

// =============================================================================
// TaskTable
// =============================================================================

/// Live task population with a label index.
#[derive(Debug)]
pub struct TaskTable {
    slots: RwLock<BTreeMap<TaskId, Arc<TaskSlot>>>,
    registry: Arc<LabelRegistry>,
    symbols: Arc<SymbolTable>,
    next_id: AtomicU64,
    live: AtomicUsize,
    max_stack_depth: usize,
}

impl Default for TaskTable {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskTable {
    /// Empty table with its own registry and symbol table.
    #[must_use]
    pub fn new() -> Self {
        Self::with_parts(Arc::new(LabelRegistry::new()), Arc::new(SymbolTable::new()))
    }

    /// Empty table sharing an existing registry and symbol table.
    #[must_use]
    pub fn with_parts(registry: Arc<LabelRegistry>, symbols: Arc<SymbolTable>) -> Self {
        Self {
            slots: RwLock::new(BTreeMap::new()),
            registry,
            symbols,
            next_id: AtomicU64::new(1),
            live: AtomicUsize::new(0),
            max_stack_depth: DEFAULT_STACK_DEPTH,
        }
    }

    /// Bound the frames each task retains.
    #[must_use]
    pub fn with_stack_depth(mut self, depth: usize) -> Self {
        self.max_stack_depth = depth;
        self
    }

    /// Register a new runnable task.
    pub fn spawn(self: &Arc<Self>, created_by: Option<u64>, labels: LabelSet) -> TaskHandle {
        let id = TaskId::new(self.next_id.fetch_add(1, Ordering::Relaxed));
        if !labels.is_empty() {
            self.registry.install(id, labels.clone());
        }
        let slot = Arc::new(TaskSlot {
            id,
            created_by,
            state: Mutex::new(SlotState {
                status: TaskStatus::Runnable,
                stack: Vec::new(),
                parked_at: None,
                labels,
            }),
            woken: AtomicBool::new(false),
        });
        {
            let mut slots = self.slots.write().unwrap_or_else(|e| e.into_inner());
            slots.insert(id, Arc::clone(&slot));
            self.live.fetch_add(1, Ordering::Relaxed);
        }
        tracing::trace!(task = %id, "spawned task");
        TaskHandle {
            table: Arc::clone(self),
            slot,
            exited: false,
        }
    }

    /// Wrap `future` as a task spawned at the caller's location.
    ///
    /// The task is registered immediately and exits when the future completes
    /// or is dropped.
    #[track_caller]
    pub fn instrument<F: Future>(self: &Arc<Self>, future: F, labels: LabelSet) -> Instrumented<F> {
        let caller = Location::caller();
        let created_by = self
            .symbols
            .intern_location(std::any::type_name::<F>(), caller);
        let handle = self.spawn(Some(created_by), labels);
        Instrumented::new(future, handle)
    }

    fn exit(&self, slot: &TaskSlot) {
        let removed = {
            let mut slots = self.slots.write().unwrap_or_else(|e| e.into_inner());
            let removed = slots.remove(&slot.id).is_some();
            if removed {
                self.live.fetch_sub(1, Ordering::Relaxed);
            }
            removed
        };
        if !removed {
            return;
        }
        let mut state = slot.lock();
        state.transition(TaskStatus::Dead);
        if !state.labels.is_empty() {
            self.registry.teardown(slot.id);
            state.labels = LabelSet::new();
        }
        drop(state);
        tracing::trace!(task = %slot.id, "task exited");
    }

    /// Number of live tasks.
    #[must_use]
    pub fn live_count(&self) -> usize {
        self.live.load(Ordering::Relaxed)
    }

    /// The label index.
    #[must_use]
    pub fn registry(&self) -> &Arc<LabelRegistry> {
        &self.registry
    }

    /// Symbols for spawn sites and any addresses callers register.
    #[must_use]
    pub fn symbols(&self) -> &Arc<SymbolTable> {
        &self.symbols
    }

    /// Every live task carrying all pairs in `filter`, in id order.
    ///
    /// Runs under the table read lock, so no slot can be mid-exit. Handles
    /// cannot set `Dead`, so a dead slot here means the table is corrupt.
    fn matching(
        slots: &BTreeMap<TaskId, Arc<TaskSlot>>,
        filter: &LabelFilter,
    ) -> Result<Vec<Arc<TaskSlot>>> {
        let mut out = Vec::with_capacity(slots.len());
        for slot in slots.values() {
            let state = slot.lock();
            if state.status == TaskStatus::Dead {
                return Err(Error::SourceCorrupted(format!(
                    "task {} is dead but still in the table",
                    slot.id
                )));
            }
            if filter.is_empty() || state.labels.matches(filter) {
                out.push(Arc::clone(slot));
            }
        }
        Ok(out)
    }

    fn copy_window(
        matching: &[Arc<TaskSlot>],
        request: &FillRequest<'_>,
        buffer: &mut CaptureBuffer,
    ) -> FillStatus {
        let population = matching.len();
        let now = Instant::now();
        for position in rotating_positions(request.offset, population, buffer.capacity()) {
            let slot = &matching[position];
            let state = slot.lock();
            if state.status == TaskStatus::Dead {
                continue;
            }
            if !request.filter.is_empty() && !state.labels.matches(request.filter) {
                continue;
            }
            buffer.push(slot.snapshot(&state, request.max_stack_depth, now));
        }
        let written = buffer.len();
        FillStatus {
            written,
            population,
            more: written < population,
        }
    }
}

impl TaskSource for TaskTable {
    fn estimate_population(&self) -> usize {
        self.live_count()
    }

    fn registry(&self) -> &LabelRegistry {
        &self.registry
    }

    fn fill(&self, request: &FillRequest<'_>, buffer: &mut CaptureBuffer) -> Result<FillStatus> {
        match request.candidates {
            // Full walk: spawn and exit wait until the copy completes.
            None => {
                let slots = self.slots.read().unwrap_or_else(|e| e.into_inner());
                let matching = Self::matching(&slots, request.filter)?;
                Ok(Self::copy_window(&matching, request, buffer))
            }
            Some(ids) => {
                let resolved: Vec<Arc<TaskSlot>> = {
                    let slots = self.slots.read().unwrap_or_else(|e| e.into_inner());
                    ids.iter().filter_map(|id| slots.get(id).cloned()).collect()
                };
                let matching: Vec<Arc<TaskSlot>> = resolved
                    .into_iter()
                    .filter(|slot| {
                        let state = slot.lock();
                        state.status != TaskStatus::Dead && state.labels.matches(request.filter)
                    })
                    .collect();
                Ok(Self::copy_window(&matching, request, buffer))
            }
        }
    }
}

// =============================================================================
// TaskHandle
// =============================================================================

/// Owner's view of one live task. Dropping it exits the task.
pub struct TaskHandle {
    table: Arc<TaskTable>,
    slot: Arc<TaskSlot>,
    exited: bool,
}

impl std::fmt::Debug for TaskHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskHandle")
            .field("id", &self.slot.id)
            .field("exited", &self.exited)
            .finish_non_exhaustive()
    }
}

impl TaskHandle {
    /// The task's id.
    #[must_use]
    pub fn id(&self) -> TaskId {
        self.slot.id
    }

    pub(crate) fn slot(&self) -> &Arc<TaskSlot> {
        &self.slot
    }

    /// Change scheduling status.
    ///
    /// Entering a blocked status starts the wait clock; moving between
    /// blocked statuses keeps it; leaving blocked clears it.
    ///
    /// [`TaskStatus::Dead`] is refused: a task dies only through [`exit`]
    /// or by dropping its handle. Returns whether the status was applied.
    ///
    /// [`exit`]: TaskHandle::exit
    pub fn set_status(&self, status: TaskStatus) -> bool {
        if status == TaskStatus::Dead {
            tracing::warn!(task = %self.slot.id, "ignoring Dead status on a live task; use exit");
            return false;
        }
        self.slot.set_status(status);
        true
    }

    /// Current scheduling status.
    #[must_use]
    pub fn status(&self) -> TaskStatus {
        self.slot.status()
    }

    /// Replace the recorded stack, innermost frame first.
    pub fn set_stack(&self, stack: &[u64]) {
        let depth = stack.len().min(self.table.max_stack_depth);
        let mut state = self.slot.lock();
        state.stack.clear();
        state.stack.extend_from_slice(&stack[..depth]);
    }

    /// Replace the task's labels, returning the previous set.
    pub fn set_labels(&self, labels: LabelSet) -> LabelSet {
        let mut state = self.slot.lock();
        if state.labels == labels {
            return labels;
        }
        self.table.registry.install(self.slot.id, labels.clone());
        std::mem::replace(&mut state.labels, labels)
    }

    /// Current labels.
    #[must_use]
    pub fn labels(&self) -> LabelSet {
        self.slot.lock().labels.clone()
    }

    /// Extend the current labels with `labels` until the guard drops.
    pub fn with_labels(&self, labels: &LabelSet) -> LabelGuard<'_> {
        let merged = self.labels().merged(labels);
        let previous = self.set_labels(merged);
        LabelGuard {
            handle: self,
            previous: Some(previous),
        }
    }

    /// Exit the task now.
    pub fn exit(mut self) {
        self.finish();
    }

    fn finish(&mut self) {
        if !self.exited {
            self.exited = true;
            self.table.exit(&self.slot);
        }
    }
}

impl Drop for TaskHandle {
    fn drop(&mut self) {
        self.finish();
    }
}

/// Restores a task's previous labels when dropped.
#[derive(Debug)]
pub struct LabelGuard<'a> {
    handle: &'a TaskHandle,
    previous: Option<LabelSet>,
}

impl Drop for LabelGuard<'_> {
    fn drop(&mut self) {
        if let Some(previous) = self.previous.take() {
            self.handle.set_labels(previous);
        }
    }
}
