//! Human-readable rendering of task records.
//!
//! ```text
//! task 17 [chan wait, 1m30s]:
//! app::worker::run()
//!     src/worker.rs:42
//! created by app::main
//!     src/main.rs:12
//! ```
//!
//! Frame lines are tab-indented. Frames the symbolizer cannot resolve render
//! as `?()` followed by `?:0 pc=0x…`, so a bad address never fails the whole
//! block.

use std::fmt::Write;
use std::time::Duration;

use crate::record::TaskRecord;
use crate::symbols::{NoSymbols, Symbolizer};

impl TaskRecord {
    /// Render this record as a stack trace block ending in a newline.
    #[must_use]
    pub fn render(&self, symbols: &dyn Symbolizer) -> String {
        let mut out = String::new();
        let id = self
            .id()
            .map_or_else(|| "?".to_string(), |id| id.to_string());
        let _ = write!(out, "task {id} [{}", self.status());
        if !self.waiting_since().is_zero() {
            let _ = write!(out, ", {}", format_wait(self.waiting_since()));
        }
        out.push_str("]:\n");

        for &pc in self.stack() {
            match symbols.resolve(pc) {
                Some(frame) => {
                    let _ = writeln!(out, "{}()", frame.function);
                    let _ = writeln!(out, "\t{}:{}", frame.file, frame.line);
                }
                None => {
                    let _ = writeln!(out, "?()");
                    let _ = writeln!(out, "\t?:0 pc={pc:#x}");
                }
            }
        }

        if let Some(pc) = self.created_by() {
            match symbols.resolve(pc) {
                Some(frame) => {
                    let _ = writeln!(out, "created by {}", frame.function);
                    let _ = writeln!(out, "\t{}:{}", frame.file, frame.line);
                }
                None => {
                    let _ = writeln!(out, "created by ?");
                    let _ = writeln!(out, "\t?:0 pc={pc:#x}");
                }
            }
        }
        out
    }
}

impl std::fmt::Display for TaskRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.render(&NoSymbols))
    }
}

/// Format a wait duration compactly: `350ns`, `1.5µs`, `250ms`, `2.5s`,
/// `1m30s`, `2h0m5s`.
#[must_use]
pub fn format_wait(wait: Duration) -> String {
    let nanos = wait.as_nanos();
    if nanos == 0 {
        return "0s".to_string();
    }
    if nanos < 1_000 {
        return format!("{nanos}ns");
    }
    if nanos < 1_000_000 {
        return format!("{}µs", decimal(nanos, 1_000));
    }
    if nanos < 1_000_000_000 {
        return format!("{}ms", decimal(nanos, 1_000_000));
    }

    let total_secs = wait.as_secs();
    let hours = total_secs / 3600;
    let minutes = (total_secs % 3600) / 60;
    let secs_nanos = u128::from(total_secs % 60) * 1_000_000_000 + u128::from(wait.subsec_nanos());
    let secs = decimal(secs_nanos, 1_000_000_000);

    let mut out = String::new();
    if hours > 0 {
        let _ = write!(out, "{hours}h{minutes}m");
    } else if minutes > 0 {
        let _ = write!(out, "{minutes}m");
    }
    let _ = write!(out, "{secs}s");
    out
}

/// `value / unit` as a decimal with trailing fractional zeros trimmed.
fn decimal(value: u128, unit: u128) -> String {
    let whole = value / unit;
    let frac = value % unit;
    if frac == 0 {
        return whole.to_string();
    }
    let width = unit.ilog10() as usize;
    let digits = format!("{frac:0width$}");
    format!("{whole}.{}", digits.trim_end_matches('0'))
}
