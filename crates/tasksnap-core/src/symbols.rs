//! Address-to-frame resolution.
//!
//! Captured stacks are raw instruction addresses. A [`Symbolizer`] turns one
//! into a [`Frame`]; anything it cannot resolve is rendered with placeholder
//! text instead. [`SymbolTable`] is an in-memory symbolizer that can also
//! mint synthetic addresses for call sites known only by source location,
//! such as `#[track_caller]` spawn points.

use std::collections::{BTreeMap, HashMap};
use std::panic::Location;
use std::sync::RwLock;

use serde::{Deserialize, Serialize};

/// First synthetic address handed out by [`SymbolTable::intern`].
const SYNTHETIC_BASE: u64 = 0xf000_0000_0000_0000;

/// Spacing between synthetic addresses.
const SYNTHETIC_STRIDE: u64 = 0x10;

/// A resolved stack frame.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Frame {
    /// Fully qualified function name.
    pub function: String,
    /// Source file path.
    pub file: String,
    /// 1-based source line.
    pub line: u32,
}

impl Frame {
    /// Build a frame.
    #[must_use]
    pub fn new(function: impl Into<String>, file: impl Into<String>, line: u32) -> Self {
        Self {
            function: function.into(),
            file: file.into(),
            line,
        }
    }
}

/// Resolves instruction addresses to frames.
pub trait Symbolizer {
    /// The frame at `addr`, or `None` if unknown.
    fn resolve(&self, addr: u64) -> Option<Frame>;
}

/// A symbolizer that resolves nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoSymbols;

impl Symbolizer for NoSymbols {
    fn resolve(&self, _addr: u64) -> Option<Frame> {
        None
    }
}

impl<T: Symbolizer + ?Sized> Symbolizer for &T {
    fn resolve(&self, addr: u64) -> Option<Frame> {
        (**self).resolve(addr)
    }
}

impl<T: Symbolizer + ?Sized> Symbolizer for std::sync::Arc<T> {
    fn resolve(&self, addr: u64) -> Option<Frame> {
        (**self).resolve(addr)
    }
}

#[derive(Debug)]
struct SymbolInner {
    by_addr: BTreeMap<u64, Frame>,
    interned: HashMap<Frame, u64>,
    next_synthetic: u64,
}

/// Thread-safe exact-address symbol table.
#[derive(Debug)]
pub struct SymbolTable {
    inner: RwLock<SymbolInner>,
}

impl Default for SymbolTable {
    fn default() -> Self {
        Self::new()
    }
}

impl SymbolTable {
    /// Create an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(SymbolInner {
                by_addr: BTreeMap::new(),
                interned: HashMap::new(),
                next_synthetic: SYNTHETIC_BASE,
            }),
        }
    }

    /// Map `addr` to `frame`, replacing any previous mapping.
    pub fn insert(&self, addr: u64, frame: Frame) {
        let mut guard = self.inner.write().unwrap_or_else(|e| e.into_inner());
        guard.by_addr.insert(addr, frame);
    }

    /// Synthetic address for `frame`, allocating one on first use.
    ///
    /// Interning the same frame twice returns the same address.
    pub fn intern(&self, frame: Frame) -> u64 {
        let mut guard = self.inner.write().unwrap_or_else(|e| e.into_inner());
        if let Some(&addr) = guard.interned.get(&frame) {
            return addr;
        }
        let mut addr = guard.next_synthetic;
        while guard.by_addr.contains_key(&addr) {
            addr = addr.wrapping_add(SYNTHETIC_STRIDE);
        }
        guard.next_synthetic = addr.wrapping_add(SYNTHETIC_STRIDE);
        guard.by_addr.insert(addr, frame.clone());
        guard.interned.insert(frame, addr);
        addr
    }

    /// Synthetic address for a source location, named after `function`.
    pub fn intern_location(&self, function: &str, location: &Location<'_>) -> u64 {
        self.intern(Frame::new(function, location.file(), location.line()))
    }

    /// Number of mapped addresses.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .by_addr
            .len()
    }

    /// Whether no address is mapped.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Symbolizer for SymbolTable {
    fn resolve(&self, addr: u64) -> Option<Frame> {
        self.inner
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .by_addr
            .get(&addr)
            .cloned()
    }
}
