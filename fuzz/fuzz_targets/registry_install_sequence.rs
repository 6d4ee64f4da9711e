#![no_main]

use std::collections::HashMap;
use std::sync::Arc;

use libfuzzer_sys::fuzz_target;
use tasksnap_core::labels::{LabelFilter, LabelSet};
use tasksnap_core::task_table::{TaskHandle, TaskTable};
use tasksnap_core::{Capturer, SamplingStrategy, TaskStatus};

const KEYS: [&str; 3] = ["role", "zone", "req"];
const VALUES: [&str; 3] = ["a", "b", "c"];

fn labels_for(bits: u8) -> LabelSet {
    LabelSet::from_pairs(
        KEYS.iter()
            .enumerate()
            .filter(|(i, _)| bits & (1 << i) != 0)
            .map(|(i, key)| (*key, VALUES[(usize::from(bits >> 4) + i) % VALUES.len()])),
    )
}

fn status_for(tag: u8) -> TaskStatus {
    match tag % 8 {
        0 => TaskStatus::Runnable,
        1 => TaskStatus::Running,
        2 => TaskStatus::BlockedOnChannel,
        3 => TaskStatus::BlockedOnLock,
        4 => TaskStatus::Sleeping,
        5 => TaskStatus::Waiting,
        6 => TaskStatus::Unknown,
        _ => TaskStatus::Dead,
    }
}

fuzz_target!(|data: &[u8]| {
    let table = Arc::new(TaskTable::new());
    let mut live: HashMap<u8, TaskHandle> = HashMap::new();
    let mut capturer = Capturer::new(Arc::clone(&table));

    for chunk in data.chunks_exact(3) {
        let (op, slot, arg) = (chunk[0], chunk[1] % 32, chunk[2]);
        match op % 7 {
            0 => {
                live.insert(slot, table.spawn(None, labels_for(arg)));
            }
            1 => {
                live.remove(&slot);
            }
            2 => {
                if let Some(task) = live.get(&slot) {
                    task.set_labels(labels_for(arg));
                }
            }
            3 => {
                if let Some(task) = live.get(&slot) {
                    let status = status_for(arg);
                    assert_eq!(task.set_status(status), status != TaskStatus::Dead);
                }
            }
            4 => {
                if let Some(task) = live.get(&slot) {
                    let _guard = task.with_labels(&labels_for(arg));
                    assert!(table.registry().check_consistency().is_ok());
                }
            }
            5 => {
                capturer.set_max_results(usize::from(arg % 8));
                capturer.set_strategy(if arg & 0x80 == 0 {
                    SamplingStrategy::RotatingOffset
                } else {
                    SamplingStrategy::UniformRandom
                });
            }
            _ => {
                let filter = if arg % 2 == 0 {
                    LabelFilter::new()
                } else {
                    LabelFilter::from_pairs(labels_for(arg).iter())
                };
                capturer.set_label_filter(filter.clone());
                let page = capturer.capture_page().expect("capture must not fail");
                assert!(page.records.len() <= page.population);
                for record in &page.records {
                    assert!(filter.iter().all(|(k, v)| record.label(k) == Some(v)));
                }
            }
        }
    }

    assert_eq!(table.live_count(), live.len());
    assert!(table.registry().check_consistency().is_ok());
    drop(live);
    assert!(table.registry().is_empty());
});
