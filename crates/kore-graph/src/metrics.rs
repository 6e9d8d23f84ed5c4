//! Executable graph counters.
//!
//! Buffers take an `Arc<ExecMetrics>` so tests can count in isolation;
//! everything else shares the process-wide registry from [`ExecMetrics::global`].

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

static GLOBAL: OnceLock<Arc<ExecMetrics>> = OnceLock::new();

/// Allocated and alive executable graph counts. Diagnostic only.
#[derive(Debug, Default)]
pub struct ExecMetrics {
    allocated: AtomicU64,
    alive: AtomicI64,
}

impl ExecMetrics {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Process-wide registry.
    pub fn global() -> Arc<Self> {
        Arc::clone(GLOBAL.get_or_init(ExecMetrics::new))
    }

    /// Record a new executable. Returns its allocation index.
    pub(crate) fn notify_created(&self) -> u64 {
        self.alive.fetch_add(1, Ordering::Relaxed);
        self.allocated.fetch_add(1, Ordering::Relaxed)
    }

    /// Record a destroyed executable. Returns how many remain alive.
    pub(crate) fn notify_destroyed(&self) -> i64 {
        debug_assert!(self.alive.load(Ordering::Relaxed) >= 1);
        self.alive.fetch_sub(1, Ordering::Relaxed) - 1
    }

    /// Executables ever instantiated. Never decreases.
    pub fn allocated_execs(&self) -> u64 {
        self.allocated.load(Ordering::Relaxed)
    }

    /// Executables currently alive.
    pub fn alive_execs(&self) -> i64 {
        self.alive.load(Ordering::Relaxed)
    }
}
