//! tasksnap-core: label-indexed snapshots of live tasks
//!
//! A diagnostic profiler that answers "what is every task doing right now,
//! and which ones belong to this request?" without stopping the process.
//!
//! # Architecture
//!
//! ```text
//! TaskHandle / Instrumented ──install──→ LabelRegistry
//!          │                                  │ candidates
//!          ↓                                  ↓
//!      TaskTable ──fill──→ Capturer ──→ Sampler ──→ TaskRecord ──→ render / JSON
//! ```
//!
//! # Modules
//!
//! - `task`: Task identity and scheduling status
//! - `labels`: Immutable label sets and filters
//! - `registry`: Process-wide `key → value → tasks` index
//! - `source`: The `TaskSource` trait a scheduler implements
//! - `task_table`: In-process `TaskSource` with per-task handles
//! - `instrument`: Futures that report their status to a task table
//! - `capture`: Estimate → fill → retry capture loop
//! - `sampler`: Rotating-offset and uniform-random selection
//! - `record`: Detached per-task records and JSON-lines export
//! - `render`: Stack-trace text rendering
//! - `symbols`: Address → frame resolution
//! - `config`: Capture and logging configuration
//! - `logging`: Subscriber setup
//! - `error`: Error types
//!
//! # Safety
//!
//! This crate forbids unsafe code.

#![forbid(unsafe_code)]

pub mod capture;
pub mod config;
pub mod error;
pub mod instrument;
pub mod labels;
pub mod logging;
pub mod record;
pub mod registry;
pub mod render;
pub mod sampler;
pub mod source;
pub mod symbols;
pub mod task;
pub mod task_table;

pub use capture::{CapturePage, Capturer};
pub use config::{CaptureConfig, Config};
pub use error::{Error, Result};
pub use instrument::Instrumented;
pub use labels::{LabelFilter, LabelSet};
pub use record::TaskRecord;
pub use registry::LabelRegistry;
pub use sampler::SamplingStrategy;
pub use source::TaskSource;
pub use symbols::{Frame, SymbolTable, Symbolizer};
pub use task::{TaskId, TaskStatus};
pub use task_table::{LabelGuard, TaskHandle, TaskTable};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
