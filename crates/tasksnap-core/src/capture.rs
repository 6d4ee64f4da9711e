//! Point-in-time snapshots of a task population.
//!
//! A [`Capturer`] owns a [`TaskSource`] plus the per-client state of a
//! profiling session: the label filter, the output cap, the sampling strategy
//! and the rotating cursor. Each capture runs an estimate → fill → retry loop:
//!
//! 1. Resolve candidates. An empty filter walks the whole population; a
//!    non-empty one asks the registry for the intersection of its buckets.
//! 2. Size a buffer: exactly the cap for a capped rotating capture, otherwise
//!    the estimate grown by `growth_headroom`.
//! 3. Fill. If the source reports more matching tasks than fit and the
//!    capture is not capped, grow the buffer past the reported population and
//!    retry, up to `max_retries` attempts.
//! 4. Detach records from the raw copies and apply the sampling strategy.

use rand::SeedableRng;
use rand::rngs::StdRng;

use crate::config::CaptureConfig;
use crate::error::{Error, Result};
use crate::labels::LabelFilter;
use crate::record::TaskRecord;
use crate::sampler::{Cursor, SamplingStrategy, random_subset};
use crate::source::{CaptureBuffer, FillRequest, FillStatus, RawTask, TaskSource};
use crate::task::TaskId;

/// One capture's records plus what the capturer learned producing them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapturePage {
    /// Detached task records.
    pub records: Vec<TaskRecord>,
    /// Whether matching tasks were left out of this page.
    pub has_more: bool,
    /// Matching population at fill time.
    pub population: usize,
    /// Rotating offset this page started at.
    pub offset: u64,
    /// Fill attempts made; 0 when the filter matched nothing up front.
    pub attempts: u32,
}

impl CapturePage {
    fn empty(offset: u64) -> Self {
        Self {
            records: Vec::new(),
            has_more: false,
            population: 0,
            offset,
            attempts: 0,
        }
    }
}

/// Buffer size for an uncapped fill given a population estimate.
///
/// Always strictly larger than `estimate`, so a retry after growth makes
/// progress even when the factor rounds to nothing.
fn with_headroom(estimate: usize, factor: f64) -> usize {
    let grown = (estimate as f64 * factor).ceil();
    let grown = if grown.is_finite() && grown < usize::MAX as f64 {
        grown as usize
    } else {
        usize::MAX
    };
    grown.max(estimate.saturating_add(1))
}

/// Snapshots tasks from a [`TaskSource`].
#[derive(Debug)]
pub struct Capturer<S> {
    source: S,
    config: CaptureConfig,
    filter: LabelFilter,
    cursor: Cursor,
    rng: StdRng,
}

impl<S: TaskSource> Capturer<S> {
    /// Capturer with the default configuration.
    pub fn new(source: S) -> Self {
        let config = CaptureConfig::default();
        let rng = StdRng::from_os_rng();
        Self {
            source,
            filter: config.filter(),
            config,
            cursor: Cursor::new(),
            rng,
        }
    }

    /// Capturer with a validated configuration.
    pub fn with_config(source: S, config: CaptureConfig) -> Result<Self> {
        config.validate()?;
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };
        Ok(Self {
            source,
            filter: config.filter(),
            config,
            cursor: Cursor::new(),
            rng,
        })
    }

    /// Bound the records per capture; 0 removes the bound.
    pub fn set_max_results(&mut self, max: usize) {
        self.config.max_results = max;
    }

    /// Only capture tasks carrying every pair in `filter`.
    pub fn set_label_filter(&mut self, filter: LabelFilter) {
        self.config.label_filter = filter
            .iter()
            .map(|(k, v)| (k.to_owned(), v.to_owned()))
            .collect();
        self.filter = filter;
    }

    /// Frames copied per task, clamped to at least one.
    pub fn set_stack_depth(&mut self, depth: usize) {
        self.config.max_stack_depth = depth.max(1);
    }

    /// How capped captures choose tasks.
    pub fn set_strategy(&mut self, strategy: SamplingStrategy) {
        self.config.strategy = strategy;
    }

    /// Offset the next rotating capture starts at.
    #[must_use]
    pub fn offset(&self) -> u64 {
        self.cursor.offset()
    }

    /// Current settings.
    #[must_use]
    pub fn config(&self) -> &CaptureConfig {
        &self.config
    }

    /// The underlying source.
    #[must_use]
    pub fn source(&self) -> &S {
        &self.source
    }

    /// Capture records only.
    pub fn capture(&mut self) -> Result<Vec<TaskRecord>> {
        self.capture_page().map(|page| page.records)
    }

    /// Capture one page.
    ///
    /// Fails only when the source reports corruption or the population
    /// outgrows `max_retries` successive buffers.
    pub fn capture_page(&mut self) -> Result<CapturePage> {
        // Synchronise with every label install that completed before now.
        let generation = self.source.registry().generation();

        let cap = self.config.max_results;
        let rotating = cap > 0 && self.config.strategy == SamplingStrategy::RotatingOffset;
        let offset = if rotating { self.cursor.offset() } else { 0 };

        let candidates: Option<Vec<TaskId>> = if self.filter.is_empty() {
            None
        } else {
            Some(self.source.registry().candidates(&self.filter))
        };
        if candidates.as_ref().is_some_and(Vec::is_empty) {
            if rotating {
                self.cursor.advance(0, 0);
            }
            tracing::debug!(generation, filtered = true, "capture matched no tasks");
            return Ok(CapturePage::empty(offset));
        }

        let (raw, status, attempts) = if rotating {
            let (raw, status) = self.fill_once(candidates.as_deref(), offset, cap)?;
            (raw, status, 1)
        } else {
            let estimate = candidates
                .as_ref()
                .map_or_else(|| self.source.estimate_population(), Vec::len);
            self.fill_growing(candidates.as_deref(), estimate)?
        };

        let depth = self.config.max_stack_depth;
        let mut records: Vec<TaskRecord> = raw
            .into_iter()
            .map(|task| TaskRecord::from_raw(task, depth))
            .collect();

        let has_more = if rotating {
            self.cursor.advance(records.len(), status.population);
            status.more
        } else if cap > 0 {
            records = random_subset(records, cap, &mut self.rng);
            records.len() < status.population
        } else {
            false
        };

        tracing::debug!(
            generation,
            population = status.population,
            returned = records.len(),
            attempts,
            offset,
            has_more,
            filtered = candidates.is_some(),
            strategy = ?self.config.strategy,
            "capture complete"
        );

        Ok(CapturePage {
            records,
            has_more,
            population: status.population,
            offset,
            attempts,
        })
    }

    fn fill_once(
        &self,
        candidates: Option<&[TaskId]>,
        offset: u64,
        capacity: usize,
    ) -> Result<(Vec<RawTask>, FillStatus)> {
        let request = FillRequest {
            filter: &self.filter,
            candidates,
            offset,
            max_stack_depth: self.config.max_stack_depth,
        };
        let mut buffer = CaptureBuffer::with_capacity(capacity);
        let status = self
            .source
            .fill(&request, &mut buffer)
            .inspect_err(|err| tracing::error!(error = %err, "task source fill failed"))?;
        Ok((buffer.into_tasks(), status))
    }

    /// Fill the whole matching population, growing the buffer on overflow.
    fn fill_growing(
        &self,
        candidates: Option<&[TaskId]>,
        estimate: usize,
    ) -> Result<(Vec<RawTask>, FillStatus, u32)> {
        let factor = self.config.growth_headroom;
        let mut capacity = with_headroom(estimate, factor);
        let mut attempts = 0u32;
        loop {
            attempts += 1;
            let (raw, status) = self.fill_once(candidates, 0, capacity)?;
            if !status.more {
                return Ok((raw, status, attempts));
            }
            if attempts >= self.config.max_retries {
                tracing::error!(
                    attempts,
                    population = status.population,
                    capacity,
                    "population outgrew every capture buffer"
                );
                return Err(Error::RetryBudgetExhausted {
                    attempts,
                    population: status.population,
                });
            }
            let next = with_headroom(status.population.max(capacity), factor);
            tracing::warn!(
                attempt = attempts,
                population = status.population,
                capacity,
                next_capacity = next,
                "population grew during capture; retrying with a larger buffer"
            );
            capacity = next;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::labels::LabelSet;
    use crate::registry::LabelRegistry;
    use crate::task::TaskStatus;
    use crate::task_table::TaskTable;
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn labels(pairs: &[(&str, &str)]) -> LabelSet {
        LabelSet::from_pairs(pairs.iter().copied())
    }

    fn ids(records: &[TaskRecord]) -> Vec<u64> {
        records.iter().filter_map(|r| r.id()).map(TaskId::get).collect()
    }

    #[test]
    fn headroom_is_strictly_larger() {
        assert_eq!(with_headroom(0, 1.1), 1);
        assert_eq!(with_headroom(5, 1.0), 6);
        assert_eq!(with_headroom(100, 1.1), 111);
        assert_eq!(with_headroom(usize::MAX, 2.0), usize::MAX);
    }

    #[test]
    fn uncapped_capture_returns_everything() {
        let table = Arc::new(TaskTable::new());
        let handles: Vec<_> = (0..10).map(|_| table.spawn(None, LabelSet::new())).collect();
        let mut capturer = Capturer::new(Arc::clone(&table));
        let page = capturer.capture_page().unwrap();
        assert_eq!(page.records.len(), 10);
        assert_eq!(page.population, 10);
        assert!(!page.has_more);
        assert_eq!(page.attempts, 1);
        assert_eq!(capturer.offset(), 0);
        let expected: Vec<u64> = handles.iter().map(|h| h.id().get()).collect();
        assert_eq!(ids(&page.records), expected);
    }

    #[test]
    fn empty_population_yields_empty_page() {
        let table = Arc::new(TaskTable::new());
        let mut capturer = Capturer::new(Arc::clone(&table));
        let page = capturer.capture_page().unwrap();
        assert!(page.records.is_empty());
        assert!(!page.has_more);
    }

    #[test]
    fn filter_with_no_bucket_skips_the_fill() {
        let table = Arc::new(TaskTable::new());
        let _task = table.spawn(None, labels(&[("role", "worker")]));
        let mut capturer = Capturer::new(Arc::clone(&table));
        capturer.set_label_filter(LabelFilter::from_pairs([("role", "control")]));
        let page = capturer.capture_page().unwrap();
        assert!(page.records.is_empty());
        assert_eq!(page.attempts, 0);
    }

    #[test]
    fn filter_selects_matching_group() {
        let table = Arc::new(TaskTable::new());
        let workers: Vec<_> = (0..3)
            .map(|_| table.spawn(None, labels(&[("role", "worker")])))
            .collect();
        let _others: Vec<_> = (0..4)
            .map(|_| table.spawn(None, labels(&[("role", "control")])))
            .collect();
        let _bare = table.spawn(None, LabelSet::new());

        let mut capturer = Capturer::new(Arc::clone(&table));
        capturer.set_label_filter(LabelFilter::from_pairs([("role", "worker")]));
        let records = capturer.capture().unwrap();
        let expected: Vec<u64> = workers.iter().map(|h| h.id().get()).collect();
        assert_eq!(ids(&records), expected);
        assert!(records.iter().all(|r| r.label("role") == Some("worker")));
    }

    #[test]
    fn rotating_cap_pages_through_population() {
        let table = Arc::new(TaskTable::new());
        let _handles: Vec<_> = (0..7).map(|_| table.spawn(None, LabelSet::new())).collect();
        let mut capturer = Capturer::new(Arc::clone(&table));
        capturer.set_max_results(3);

        let first = capturer.capture_page().unwrap();
        assert_eq!(first.records.len(), 3);
        assert!(first.has_more);
        assert_eq!(first.offset, 0);
        assert_eq!(capturer.offset(), 3);

        let second = capturer.capture_page().unwrap();
        assert_ne!(ids(&first.records), ids(&second.records));

        let third = capturer.capture_page().unwrap();
        let seen: HashSet<u64> = [first, second, third]
            .iter()
            .flat_map(|p| ids(&p.records))
            .collect();
        assert_eq!(seen.len(), 7);
        assert_eq!(capturer.offset(), 2);
    }

    #[test]
    fn uniform_random_respects_cap_and_seed() {
        let table = Arc::new(TaskTable::new());
        let _handles: Vec<_> = (0..50).map(|_| table.spawn(None, LabelSet::new())).collect();
        let config = CaptureConfig {
            max_results: 5,
            strategy: SamplingStrategy::UniformRandom,
            seed: Some(11),
            ..CaptureConfig::default()
        };
        let mut a = Capturer::with_config(Arc::clone(&table), config.clone()).unwrap();
        let mut b = Capturer::with_config(Arc::clone(&table), config).unwrap();
        let page = a.capture_page().unwrap();
        assert_eq!(page.records.len(), 5);
        assert_eq!(page.population, 50);
        assert!(page.has_more);
        assert_eq!(ids(&page.records), ids(&b.capture().unwrap()));
        assert_eq!(a.offset(), 0);
    }

    #[test]
    fn stack_depth_truncates_records() {
        let table = Arc::new(TaskTable::new());
        let task = table.spawn(None, LabelSet::new());
        task.set_stack(&[1, 2, 3, 4, 5]);
        let mut capturer = Capturer::new(Arc::clone(&table));
        capturer.set_stack_depth(2);
        let records = capturer.capture().unwrap();
        assert_eq!(records[0].stack(), &[1, 2]);
    }

    #[test]
    fn invalid_config_is_rejected() {
        let table = Arc::new(TaskTable::new());
        let config = CaptureConfig {
            max_retries: 0,
            ..CaptureConfig::default()
        };
        let err = Capturer::with_config(table, config).unwrap_err();
        assert!(matches!(err, Error::InvalidConfig(_)));
    }

    /// Reports a population that always exceeds whatever buffer it is given.
    struct RunawaySource {
        registry: LabelRegistry,
        fills: AtomicUsize,
    }

    impl TaskSource for RunawaySource {
        fn estimate_population(&self) -> usize {
            1
        }

        fn registry(&self) -> &LabelRegistry {
            &self.registry
        }

        fn fill(
            &self,
            _request: &FillRequest<'_>,
            buffer: &mut CaptureBuffer,
        ) -> Result<FillStatus> {
            self.fills.fetch_add(1, Ordering::SeqCst);
            let population = buffer.capacity() * 2 + 1;
            Ok(FillStatus {
                written: 0,
                population,
                more: true,
            })
        }
    }

    #[test]
    fn runaway_growth_exhausts_retry_budget() {
        let source = RunawaySource {
            registry: LabelRegistry::new(),
            fills: AtomicUsize::new(0),
        };
        let config = CaptureConfig {
            max_retries: 4,
            ..CaptureConfig::default()
        };
        let mut capturer = Capturer::with_config(&source, config).unwrap();
        let err = capturer.capture_page().unwrap_err();
        assert!(matches!(err, Error::RetryBudgetExhausted { attempts: 4, .. }));
        assert!(err.is_fatal());
        assert_eq!(source.fills.load(Ordering::SeqCst), 4);
    }

    /// Fails every fill as corrupted.
    struct BrokenSource(LabelRegistry);

    impl TaskSource for BrokenSource {
        fn estimate_population(&self) -> usize {
            3
        }

        fn registry(&self) -> &LabelRegistry {
            &self.0
        }

        fn fill(
            &self,
            _request: &FillRequest<'_>,
            _buffer: &mut CaptureBuffer,
        ) -> Result<FillStatus> {
            Err(Error::SourceCorrupted("slot index out of range".into()))
        }
    }

    #[test]
    fn source_corruption_is_propagated() {
        let source = BrokenSource(LabelRegistry::new());
        let mut capturer = Capturer::new(&source);
        assert!(matches!(
            capturer.capture_page(),
            Err(Error::SourceCorrupted(_))
        ));
    }

    #[test]
    fn records_carry_wait_and_status() {
        let table = Arc::new(TaskTable::new());
        let task = table.spawn(None, LabelSet::new());
        task.set_status(TaskStatus::Sleeping);
        std::thread::sleep(Duration::from_millis(2));
        let mut capturer = Capturer::new(Arc::clone(&table));
        let records = capturer.capture().unwrap();
        assert_eq!(records[0].status(), TaskStatus::Sleeping);
        assert!(records[0].waiting_since() >= Duration::from_millis(2));
    }

    #[test]
    fn huge_cap_over_small_population() {
        let table = Arc::new(TaskTable::new());
        let handles: Vec<_> = (0..3).map(|_| table.spawn(None, LabelSet::new())).collect();
        let mut capturer = Capturer::new(Arc::clone(&table));
        for cap in [usize::MAX, 1_000_000_000] {
            capturer.set_max_results(cap);
            let page = capturer.capture_page().unwrap();
            assert_eq!(page.records.len(), 3);
            assert_eq!(page.population, 3);
            assert!(!page.has_more);
            assert_eq!(capturer.offset(), 0);
        }

        capturer.set_strategy(SamplingStrategy::UniformRandom);
        capturer.set_max_results(usize::MAX);
        let records = capturer.capture().unwrap();
        let expected: Vec<u64> = handles.iter().map(|h| h.id().get()).collect();
        assert_eq!(ids(&records), expected);
    }

    #[test]
    fn full_and_filtered_captures_agree_on_odd_statuses() {
        let table = Arc::new(TaskTable::new());
        let a = table.spawn(None, labels(&[("role", "worker")]));
        let b = table.spawn(None, labels(&[("role", "worker")]));
        assert!(!a.set_status(TaskStatus::Dead));
        assert!(b.set_status(TaskStatus::Unknown));

        let mut full = Capturer::new(Arc::clone(&table));
        let mut filtered = Capturer::new(Arc::clone(&table));
        filtered.set_label_filter(LabelFilter::from_pairs([("role", "worker")]));

        let all = full.capture().unwrap();
        let workers = filtered.capture().unwrap();
        assert_eq!(ids(&all), vec![a.id().get(), b.id().get()]);
        assert_eq!(ids(&workers), ids(&all));
        assert_eq!(workers[0].status(), TaskStatus::Runnable);
        assert_eq!(workers[1].status(), TaskStatus::Unknown);
    }
}
