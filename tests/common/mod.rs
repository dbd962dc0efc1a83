#![allow(dead_code)]

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use pagewal::{LogSegment, Lsn, SerialExecutor, WalConfig, WalContext};

/// Outer-WAL stand-in recording everything the segment publishes.
pub struct TestContext {
    commit_delay: Duration,
    written: Mutex<Option<Lsn>>,
    flushed: Mutex<Option<Lsn>>,
    flushed_sets: AtomicU64,
    overflows: AtomicU64,
    free_space_checks: AtomicU64,
}

impl TestContext {
    /// Context with background flushing disabled; tests drive `flush()`.
    pub fn manual() -> Arc<Self> {
        Self::with_commit_delay(Duration::ZERO)
    }

    pub fn with_commit_delay(commit_delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            commit_delay,
            written: Mutex::new(None),
            flushed: Mutex::new(None),
            flushed_sets: AtomicU64::new(0),
            overflows: AtomicU64::new(0),
            free_space_checks: AtomicU64::new(0),
        })
    }

    pub fn flushed_lsn(&self) -> Option<Lsn> {
        *self.flushed.lock()
    }

    pub fn flushed_set_count(&self) -> u64 {
        self.flushed_sets.load(Ordering::SeqCst)
    }

    pub fn overflow_count(&self) -> u64 {
        self.overflows.load(Ordering::SeqCst)
    }

    pub fn free_space_check_count(&self) -> u64 {
        self.free_space_checks.load(Ordering::SeqCst)
    }
}

impl WalContext for TestContext {
    fn commit_delay(&self) -> Duration {
        self.commit_delay
    }

    fn check_free_space(&self) {
        self.free_space_checks.fetch_add(1, Ordering::SeqCst);
    }

    fn written_lsn(&self) -> Option<Lsn> {
        *self.written.lock()
    }

    fn set_written_lsn(&self, lsn: Lsn) {
        *self.written.lock() = Some(lsn);
    }

    fn set_flushed_lsn(&self, lsn: Lsn) {
        self.flushed_sets.fetch_add(1, Ordering::SeqCst);
        *self.flushed.lock() = Some(lsn);
    }

    fn increment_cache_overflow_count(&self) {
        self.overflows.fetch_add(1, Ordering::SeqCst);
    }
}

pub fn open_segment(path: &Path, ctx: Arc<TestContext>, config: WalConfig) -> LogSegment {
    LogSegment::open(
        path,
        ctx,
        config,
        SerialExecutor::new("wal-flush"),
        SerialExecutor::new("wal-closer"),
    )
    .expect("open segment")
}

/// Config with a long TTL so handle auto-close never interferes.
pub fn quiet_config() -> WalConfig {
    WalConfig {
        file_ttl: Duration::from_secs(600),
        ..WalConfig::default()
    }
}
