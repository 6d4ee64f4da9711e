//! End-to-end capture behaviour against a live task table.
//!
//! Tasks are driven from real OS threads so captures race with spawns,
//! status changes, label changes and exits.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread;

use crossbeam::channel;
use crossbeam::sync::WaitGroup;

use tasksnap_core::labels::{LabelFilter, LabelSet};
use tasksnap_core::registry::LabelRegistry;
use tasksnap_core::source::{CaptureBuffer, FillRequest, FillStatus, TaskSource};
use tasksnap_core::symbols::{Frame, Symbolizer};
use tasksnap_core::task_table::{TaskHandle, TaskTable};
use tasksnap_core::{CaptureConfig, Capturer, Result, SamplingStrategy, TaskStatus};

/// Spawn `n` tasks on their own threads, each labelled `test.id=<i>` plus
/// `extra`, and keep them alive until the returned sender is dropped.
fn run_labelled_tasks(
    table: &Arc<TaskTable>,
    n: usize,
    extra: impl Fn(usize) -> Vec<(&'static str, &'static str)>,
) -> (channel::Sender<()>, Vec<thread::JoinHandle<()>>) {
    let (stop_tx, stop_rx) = channel::bounded::<()>(0);
    let ready = WaitGroup::new();
    let threads = (0..n)
        .map(|i| {
            let table = Arc::clone(table);
            let stop_rx = stop_rx.clone();
            let ready = ready.clone();
            let mut pairs: Vec<(String, String)> = vec![("test.id".into(), i.to_string())];
            pairs.extend(extra(i).into_iter().map(|(k, v)| (k.into(), v.into())));
            thread::spawn(move || {
                let task = table.spawn(None, LabelSet::from_pairs(pairs));
                task.set_status(TaskStatus::BlockedOnChannel);
                drop(ready);
                let _ = stop_rx.recv();
                task.set_status(TaskStatus::Running);
            })
        })
        .collect();
    ready.wait();
    (stop_tx, threads)
}

fn stop(stop_tx: channel::Sender<()>, threads: Vec<thread::JoinHandle<()>>) {
    drop(stop_tx);
    for t in threads {
        t.join().unwrap();
    }
}

#[test]
fn full_capture_returns_every_task_exactly_once() {
    let table = Arc::new(TaskTable::new());
    let (stop_tx, threads) = run_labelled_tasks(&table, 100, |_| Vec::new());

    let mut capturer = Capturer::new(Arc::clone(&table));
    let records = capturer.capture().unwrap();
    let ids: Vec<usize> = records
        .iter()
        .filter_map(|r| r.label("test.id"))
        .map(|v| v.parse().unwrap())
        .collect();
    let unique: HashSet<usize> = ids.iter().copied().collect();
    assert_eq!(ids.len(), 100);
    assert_eq!(unique, (0..100).collect());
    assert!(records.iter().all(|r| r.status() == TaskStatus::BlockedOnChannel));

    stop(stop_tx, threads);
    assert_eq!(table.live_count(), 0);
}

#[test]
fn filtered_capture_returns_exactly_the_group() {
    let table = Arc::new(TaskTable::new());
    let (stop_tx, threads) = run_labelled_tasks(&table, 30, |i| {
        if i % 3 == 0 {
            vec![("role", "worker")]
        } else {
            vec![("role", "control")]
        }
    });

    let mut capturer = Capturer::new(Arc::clone(&table));
    capturer.set_label_filter(LabelFilter::from_pairs([("role", "worker")]));
    let records = capturer.capture().unwrap();
    let ids: HashSet<usize> = records
        .iter()
        .filter_map(|r| r.label("test.id"))
        .map(|v| v.parse().unwrap())
        .collect();
    assert_eq!(ids, (0..30).filter(|i| i % 3 == 0).collect());
    assert_eq!(records.len(), 10);

    stop(stop_tx, threads);
}

#[test]
fn capped_pages_cover_population_and_differ() {
    let table = Arc::new(TaskTable::new());
    let (stop_tx, threads) = run_labelled_tasks(&table, 23, |_| Vec::new());

    let mut capturer = Capturer::new(Arc::clone(&table));
    capturer.set_max_results(5);
    let mut seen = HashSet::new();
    let mut previous: Option<Vec<String>> = None;
    for _ in 0..23usize.div_ceil(5) {
        let page = capturer.capture_page().unwrap();
        assert!(page.records.len() <= 5);
        assert!(page.has_more);
        let ids: Vec<String> = page
            .records
            .iter()
            .filter_map(|r| r.label("test.id").map(str::to_owned))
            .collect();
        if let Some(prev) = &previous {
            assert_ne!(prev, &ids);
        }
        seen.extend(ids.iter().cloned());
        previous = Some(ids);
    }
    assert_eq!(seen.len(), 23);

    stop(stop_tx, threads);
}

/// Spawns extra tasks the first time it is asked to fill, so the estimate
/// taken before the fill is always too small.
struct GrowingSource {
    table: Arc<TaskTable>,
    burst: usize,
    fills: AtomicUsize,
    spawned: std::sync::Mutex<Vec<TaskHandle>>,
}

impl TaskSource for GrowingSource {
    fn estimate_population(&self) -> usize {
        self.table.estimate_population()
    }

    fn registry(&self) -> &LabelRegistry {
        TaskSource::registry(&*self.table)
    }

    fn fill(&self, request: &FillRequest<'_>, buffer: &mut CaptureBuffer) -> Result<FillStatus> {
        if self.fills.fetch_add(1, Ordering::SeqCst) == 0 {
            let mut spawned = self.spawned.lock().unwrap();
            for _ in 0..self.burst {
                spawned.push(self.table.spawn(None, LabelSet::new()));
            }
        }
        self.table.fill(request, buffer)
    }
}

#[test]
fn growth_between_estimate_and_fill_triggers_retry_not_truncation() {
    let table = Arc::new(TaskTable::new());
    let _initial: Vec<_> = (0..10).map(|_| table.spawn(None, LabelSet::new())).collect();
    let source = GrowingSource {
        table: Arc::clone(&table),
        burst: 40,
        fills: AtomicUsize::new(0),
        spawned: std::sync::Mutex::new(Vec::new()),
    };

    let mut capturer = Capturer::new(&source);
    let page = capturer.capture_page().unwrap();
    assert_eq!(page.records.len(), 50);
    assert_eq!(page.population, 50);
    assert_eq!(page.attempts, 2);
    assert!(!page.has_more);
}

#[test]
fn records_are_immutable_after_label_changes() {
    let table = Arc::new(TaskTable::new());
    let task = table.spawn(None, LabelSet::from_pairs([("phase", "load")]));
    let mut capturer = Capturer::new(Arc::clone(&table));
    let records = capturer.capture().unwrap();

    task.set_labels(LabelSet::from_pairs([("phase", "serve")]));
    drop(task);

    assert_eq!(records[0].label("phase"), Some("load"));
    assert_eq!(
        records[0].labels(),
        &BTreeMap::from([("phase".to_string(), "load".to_string())])
    );
}

#[test]
fn captures_race_cleanly_with_churn() {
    let table = Arc::new(TaskTable::new());
    let running = Arc::new(AtomicBool::new(true));

    let churners: Vec<_> = (0..4)
        .map(|worker| {
            let table = Arc::clone(&table);
            let running = Arc::clone(&running);
            thread::spawn(move || {
                let role = if worker % 2 == 0 { "worker" } else { "control" };
                while running.load(Ordering::Relaxed) {
                    let task = table.spawn(None, LabelSet::from_pairs([("role", role)]));
                    task.set_status(TaskStatus::BlockedOnLock);
                    let guard = task.with_labels(&LabelSet::from_pairs([("phase", "busy")]));
                    drop(guard);
                    task.set_labels(LabelSet::from_pairs([("role", "worker")]));
                }
            })
        })
        .collect();

    let mut capturer = Capturer::new(Arc::clone(&table));
    capturer.set_label_filter(LabelFilter::from_pairs([("role", "worker")]));
    for _ in 0..200 {
        let records = capturer.capture().unwrap();
        let ids: HashSet<_> = records.iter().filter_map(|r| r.id()).collect();
        assert_eq!(ids.len(), records.len(), "duplicate task in one capture");
        assert!(records.iter().all(|r| r.label("role") == Some("worker")));
    }

    running.store(false, Ordering::Relaxed);
    for c in churners {
        c.join().unwrap();
    }
    assert_eq!(table.live_count(), 0);
    assert!(table.registry().is_empty());
    table.registry().check_consistency().unwrap();
}

#[test]
fn uniform_random_pages_are_capped_subsets() {
    let table = Arc::new(TaskTable::new());
    let (stop_tx, threads) = run_labelled_tasks(&table, 40, |_| Vec::new());

    let config = CaptureConfig {
        max_results: 8,
        strategy: SamplingStrategy::UniformRandom,
        seed: Some(3),
        ..CaptureConfig::default()
    };
    let mut capturer = Capturer::with_config(Arc::clone(&table), config).unwrap();
    let mut seen = HashSet::new();
    for _ in 0..50 {
        let page = capturer.capture_page().unwrap();
        assert_eq!(page.records.len(), 8);
        assert_eq!(page.population, 40);
        seen.extend(page.records.iter().filter_map(|r| r.id()));
    }
    assert!(seen.len() > 30, "random sampling reached only {}", seen.len());

    stop(stop_tx, threads);
}

#[test]
fn rendered_capture_names_the_spawn_site() {
    let table = Arc::new(TaskTable::new());
    let creator = table
        .symbols()
        .intern(Frame::new("app::server::accept_loop", "src/server.rs", 88));
    let leaf = table
        .symbols()
        .intern(Frame::new("app::conn::read_frame", "src/conn.rs", 19));
    let task = table.spawn(Some(creator), LabelSet::new());
    task.set_stack(&[leaf]);
    task.set_status(TaskStatus::BlockedOnSyscall);

    let mut capturer = Capturer::new(Arc::clone(&table));
    let records = capturer.capture().unwrap();
    let text = records[0].render(&**table.symbols());
    let header = format!("task {} [syscall", task.id());
    assert!(text.starts_with(&header), "{text}");
    assert!(text.contains("app::conn::read_frame()\n\tsrc/conn.rs:19\n"));
    assert!(text.ends_with("created by app::server::accept_loop\n\tsrc/server.rs:88\n"));
    assert_eq!(
        table.symbols().resolve(creator).unwrap().function,
        "app::server::accept_loop"
    );
}
