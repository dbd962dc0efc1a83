//! Opt-in flush profiling counters.
//!
//! Disabled unless the `PAGEWAL_PROFILE` environment variable is set, so the
//! hot path pays a single branch when profiling is off.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;

static PROFILE_ENABLED: OnceLock<bool> = OnceLock::new();
static COUNTERS: OnceLock<FlushCounters> = OnceLock::new();

#[derive(Default)]
struct FlushCounters {
    flushes: AtomicU64,
    flush_ns: AtomicU64,
    records_flushed: AtomicU64,
    pages_written: AtomicU64,
}

fn profiling_enabled() -> bool {
    *PROFILE_ENABLED.get_or_init(|| std::env::var_os("PAGEWAL_PROFILE").is_some())
}

fn counters() -> Option<&'static FlushCounters> {
    profiling_enabled().then(|| COUNTERS.get_or_init(FlushCounters::default))
}

/// Records one flush cycle: wall time plus the number of records drained.
pub fn record_flush(duration_ns: u64, records: u64) {
    if let Some(counters) = counters() {
        counters.flushes.fetch_add(1, Ordering::Relaxed);
        counters.flush_ns.fetch_add(duration_ns, Ordering::Relaxed);
        counters
            .records_flushed
            .fetch_add(records, Ordering::Relaxed);
    }
}

/// Records one page image written to disk.
pub fn record_page_write() {
    if let Some(counters) = counters() {
        counters.pages_written.fetch_add(1, Ordering::Relaxed);
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct MetricsSnapshot {
    pub flushes: u64,
    pub flush_ns: u64,
    pub records_flushed: u64,
    pub pages_written: u64,
}

/// Returns the accumulated counters, or `None` when profiling is disabled.
pub fn snapshot() -> Option<MetricsSnapshot> {
    let counters = counters()?;
    Some(MetricsSnapshot {
        flushes: counters.flushes.load(Ordering::Relaxed),
        flush_ns: counters.flush_ns.load(Ordering::Relaxed),
        records_flushed: counters.records_flushed.load(Ordering::Relaxed),
        pages_written: counters.pages_written.load(Ordering::Relaxed),
    })
}
