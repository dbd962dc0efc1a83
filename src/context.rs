use std::time::Duration;

use crate::types::Lsn;

/// Capabilities a segment consumes from the write-ahead log that owns it.
///
/// The WAL publishes durability watermarks through this trait and receives
/// the housekeeping callbacks the segment fires after flushing.
pub trait WalContext: Send + Sync {
    /// Interval between background flush cycles. Zero disables the periodic
    /// flush task entirely.
    fn commit_delay(&self) -> Duration;

    /// Invoked after every flush cycle, successful or not.
    fn check_free_space(&self);

    /// Highest LSN whose containing page has been written to disk.
    fn written_lsn(&self) -> Option<Lsn>;

    fn set_written_lsn(&self, lsn: Lsn);

    /// Highest LSN whose bytes are all on disk after a full flush cycle.
    fn set_flushed_lsn(&self, lsn: Lsn);

    /// Telemetry: an append overflowed the page cache and forced a
    /// synchronous flush.
    fn increment_cache_overflow_count(&self);
}

/// Per-segment configuration.
#[derive(Debug, Clone)]
pub struct WalConfig {
    /// Issue an fsync after the pages of a flush batch are written.
    pub sync_on_page_flush: bool,
    /// Bounded wait for the flusher and closer executors to stop.
    pub shutdown_timeout: Duration,
    /// Idle interval after which the backing file handle is auto-closed.
    pub file_ttl: Duration,
    /// Appends that leave more than this many un-persisted pages buffered
    /// trigger a synchronous flush.
    pub max_pages_cached: u64,
}

impl Default for WalConfig {
    fn default() -> Self {
        Self {
            sync_on_page_flush: true,
            shutdown_timeout: Duration::from_secs(10),
            file_ttl: Duration::from_secs(10),
            max_pages_cached: 3000,
        }
    }
}
