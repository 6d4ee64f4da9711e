//! Process-wide label index: `key → value → tasks carrying that pair`.
//!
//! The scheduler calls [`LabelRegistry::install`] on a task's own execution
//! path every time its label set changes (spawn, label-context entry/exit,
//! exit). Filtered captures then ask [`LabelRegistry::candidates`] for the
//! tasks carrying every pair of a filter, in time proportional to the
//! smallest matching bucket rather than the live population.
//!
//! # Invariant
//!
//! For every task `T` with installed labels `L` and every `(k, v)` in `L`,
//! `T` is a member of bucket `(k, v)` and of no other bucket under `k`.
//! Every install runs as one critical section, so readers never observe a
//! task half-way between its old and new label sets.
//!
//! # Corruption
//!
//! Removing a task from a bucket it is not in, or adding it to one it is
//! already in, means the index and the bookkeeping disagree. That is a bug in
//! the scheduler, not a recoverable condition: the registry logs the
//! violation, panics while holding its lock, and the poisoned lock makes
//! every later call panic too, so nothing keeps serving from a registry known
//! to be inconsistent.
//!
//! # Ordering
//!
//! Each install ends with an `AcqRel` read-modify-write on a generation
//! counter and each capture begins with an `Acquire` load of it. Every RMW
//! reads the value written by the previous one, forming a release sequence,
//! so a capture synchronises with all installs that happened before it, from
//! every task, not only the most recent.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

use crate::labels::{LabelFilter, LabelSet};
use crate::task::TaskId;

// ---------------------------------------------------------------------------
// Bucket
// ---------------------------------------------------------------------------

/// Tasks holding one `(key, value)` pair.
///
/// Dense member list plus a position index: insert and remove by identity
/// are O(1), removal swaps the last member into the hole.
#[derive(Debug, Default)]
struct Bucket {
    members: Vec<TaskId>,
    positions: HashMap<TaskId, usize>,
}

impl Bucket {
    fn insert(&mut self, task: TaskId) -> bool {
        if self.positions.contains_key(&task) {
            return false;
        }
        self.positions.insert(task, self.members.len());
        self.members.push(task);
        true
    }

    fn remove(&mut self, task: TaskId) -> bool {
        let Some(pos) = self.positions.remove(&task) else {
            return false;
        };
        self.members.swap_remove(pos);
        if let Some(&moved) = self.members.get(pos) {
            self.positions.insert(moved, pos);
        }
        true
    }

    fn contains(&self, task: TaskId) -> bool {
        self.positions.contains_key(&task)
    }

    fn len(&self) -> usize {
        self.members.len()
    }

    fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Corruption
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct Corruption {
    task: TaskId,
    key: String,
    value: String,
    what: &'static str,
}

impl std::fmt::Display for Corruption {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "label registry corrupted: {} (task {}, {}={})",
            self.what, self.task, self.key, self.value
        )
    }
}

impl Corruption {
    fn new(task: TaskId, key: &str, value: &str, what: &'static str) -> Self {
        Self {
            task,
            key: key.to_owned(),
            value: value.to_owned(),
            what,
        }
    }
}

// ---------------------------------------------------------------------------
// Index
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct RegistryInner {
    index: HashMap<String, HashMap<String, Bucket>>,
    /// Labels each task currently has installed; the source of truth for
    /// what must be removed on the next install.
    installed: HashMap<TaskId, LabelSet>,
}

impl RegistryInner {
    fn deregister(&mut self, task: TaskId, labels: &LabelSet) -> Result<(), Corruption> {
        for (key, value) in labels.iter() {
            let Some(values) = self.index.get_mut(key) else {
                return Err(Corruption::new(task, key, value, "key missing from index"));
            };
            let Some(bucket) = values.get_mut(value) else {
                return Err(Corruption::new(task, key, value, "value missing from index"));
            };
            if !bucket.remove(task) {
                return Err(Corruption::new(task, key, value, "task missing from bucket"));
            }
            if bucket.is_empty() {
                values.remove(value);
            }
            if values.is_empty() {
                self.index.remove(key);
            }
        }
        Ok(())
    }

    fn register(&mut self, task: TaskId, labels: &LabelSet) -> Result<(), Corruption> {
        for (key, value) in labels.iter() {
            let bucket = self
                .index
                .entry(key.to_owned())
                .or_default()
                .entry(value.to_owned())
                .or_default();
            if !bucket.insert(task) {
                return Err(Corruption::new(task, key, value, "task already in bucket"));
            }
        }
        Ok(())
    }

    fn bucket(&self, key: &str, value: &str) -> Option<&Bucket> {
        self.index.get(key).and_then(|values| values.get(value))
    }
}

// ---------------------------------------------------------------------------
// LabelRegistry
// ---------------------------------------------------------------------------

/// Index of live tasks by label pair.
///
/// Holds task ids only: the registry never keeps a task alive, and a stale
/// id simply fails to resolve in the task table.
#[derive(Debug, Default)]
pub struct LabelRegistry {
    inner: Mutex<RegistryInner>,
    generation: AtomicU64,
}

impl LabelRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, RegistryInner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(_) => panic!("label registry poisoned by an earlier corruption; refusing to serve"),
        }
    }

    /// Replace `task`'s label set with `labels`, returning the previous set.
    ///
    /// Installing an empty set removes the task from the index entirely.
    ///
    /// # Panics
    ///
    /// Panics if the index disagrees with the task's recorded labels.
    pub fn install(&self, task: TaskId, labels: LabelSet) -> LabelSet {
        let mut inner = self.lock();
        let previous = (if labels.is_empty() {
            inner.installed.remove(&task)
        } else {
            inner.installed.insert(task, labels.clone())
        })
        .unwrap_or_default();

        let result = inner
            .deregister(task, &previous)
            .and_then(|()| inner.register(task, &labels));
        if let Err(corruption) = result {
            tracing::error!(
                task = %corruption.task,
                key = %corruption.key,
                value = %corruption.value,
                what = corruption.what,
                "label registry invariant violated"
            );
            panic!("{corruption}");
        }

        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        drop(inner);
        tracing::trace!(
            task = %task,
            previous = previous.len(),
            current = labels.len(),
            generation,
            "installed task labels"
        );
        previous
    }

    /// Remove every entry for an exiting task. Returns the labels it held.
    ///
    /// # Panics
    ///
    /// Panics if the index disagrees with the task's recorded labels.
    pub fn teardown(&self, task: TaskId) -> LabelSet {
        self.install(task, LabelSet::new())
    }

    /// Tasks currently carrying `key=value`.
    ///
    /// The result is a copy; membership may change as soon as it returns.
    #[must_use]
    pub fn lookup(&self, key: &str, value: &str) -> Vec<TaskId> {
        self.lock()
            .bucket(key, value)
            .map(|bucket| bucket.members.clone())
            .unwrap_or_default()
    }

    /// Tasks carrying every pair in `filter`, sorted by id.
    ///
    /// Intersects buckets smallest first. An empty filter yields no
    /// candidates: unlabelled tasks are not indexed, so unfiltered captures
    /// enumerate the task table directly.
    #[must_use]
    pub fn candidates(&self, filter: &LabelFilter) -> Vec<TaskId> {
        if filter.is_empty() {
            return Vec::new();
        }
        let inner = self.lock();
        let mut buckets = Vec::with_capacity(filter.len());
        for (key, value) in filter.iter() {
            match inner.bucket(key, value) {
                Some(bucket) => buckets.push(bucket),
                None => return Vec::new(),
            }
        }
        buckets.sort_by_key(|bucket| bucket.len());
        let Some((smallest, rest)) = buckets.split_first() else {
            return Vec::new();
        };
        let mut ids: Vec<TaskId> = smallest
            .members
            .iter()
            .copied()
            .filter(|&id| rest.iter().all(|bucket| bucket.contains(id)))
            .collect();
        drop(inner);
        ids.sort_unstable();
        ids
    }

    /// Labels currently installed for `task` (empty if none).
    #[must_use]
    pub fn labels_of(&self, task: TaskId) -> LabelSet {
        self.lock().installed.get(&task).cloned().unwrap_or_default()
    }

    /// Number of members in bucket `key=value`.
    #[must_use]
    pub fn bucket_len(&self, key: &str, value: &str) -> usize {
        self.lock().bucket(key, value).map_or(0, Bucket::len)
    }

    /// Number of tasks with a non-empty label set.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().installed.len()
    }

    /// Whether no task has labels installed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().installed.is_empty()
    }

    /// Every non-empty bucket as `(key, value, sorted members)`, sorted by
    /// key then value.
    #[must_use]
    pub fn entries(&self) -> Vec<(String, String, Vec<TaskId>)> {
        let inner = self.lock();
        let mut out: Vec<(String, String, Vec<TaskId>)> = inner
            .index
            .iter()
            .flat_map(|(key, values)| {
                values.iter().map(move |(value, bucket)| {
                    let mut members = bucket.members.clone();
                    members.sort_unstable();
                    (key.clone(), value.clone(), members)
                })
            })
            .collect();
        drop(inner);
        out.sort();
        out
    }

    /// Number of installs performed so far.
    ///
    /// The `Acquire` load pairs with the `AcqRel` update in
    /// [`install`](Self::install); captures read it before touching labels.
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Verify the index against the installed-label bookkeeping.
    ///
    /// Returns a description of the first mismatch found.
    pub fn check_consistency(&self) -> Result<(), String> {
        let inner = self.lock();
        let mut expected_memberships = 0usize;
        for (task, labels) in &inner.installed {
            if labels.is_empty() {
                return Err(format!("task {task} recorded with an empty label set"));
            }
            for (key, value) in labels.iter() {
                expected_memberships += 1;
                if !inner.bucket(key, value).is_some_and(|b| b.contains(*task)) {
                    return Err(format!("task {task} missing from bucket {key}={value}"));
                }
            }
        }
        let mut actual_memberships = 0usize;
        for (key, values) in &inner.index {
            if values.is_empty() {
                return Err(format!("key {key} has no values"));
            }
            for (value, bucket) in values {
                if bucket.is_empty() {
                    return Err(format!("bucket {key}={value} is empty"));
                }
                if bucket.positions.len() != bucket.members.len() {
                    return Err(format!("bucket {key}={value} position index out of sync"));
                }
                actual_memberships += bucket.len();
            }
        }
        if actual_memberships != expected_memberships {
            return Err(format!(
                "index holds {actual_memberships} memberships, bookkeeping expects {expected_memberships}"
            ));
        }
        Ok(())
    }
}
