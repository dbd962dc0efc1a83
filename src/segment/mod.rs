//! A single write-ahead log segment.
//!
//! A segment owns one `*.<ordinal>.wal` file: an in-memory append buffer,
//! the paged on-disk layout, a background flush pipeline, and a reader that
//! reassembles records spanning page boundaries. Everything above the
//! segment (segment rotation, checkpointing, space reclamation) lives in the
//! owning WAL, reached through [`WalContext`].

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;
use regex::Regex;
use tracing::{error, info};

use crate::context::{WalConfig, WalContext};
use crate::error::{Result, WalError};
use crate::exec::{SerialExecutor, Tick};
use crate::io::{FileIo, StdFileIo};
use crate::types::Lsn;

mod flusher;
mod handle;
pub(crate) mod layout;
pub mod page;
mod reader;

use handle::FileHandle;
use layout::{plan_record, BufferedRecord};

static SEGMENT_NAME: OnceLock<Regex> = OnceLock::new();

fn segment_name_pattern() -> &'static Regex {
    SEGMENT_NAME.get_or_init(|| Regex::new(r"^.*\.(\d+)\.wal$").expect("segment name pattern"))
}

fn extract_order(name: &str) -> Result<u64> {
    let captures = segment_name_pattern()
        .captures(name)
        .ok_or_else(|| WalError::InvalidName(name.to_string()))?;
    captures[1]
        .parse::<u64>()
        .map_err(|_| WalError::InvalidName(name.to_string()))
}

/// One segment of the write-ahead log.
pub struct LogSegment {
    inner: Arc<SegmentInner>,
}

struct SegmentInner {
    ctx: Arc<dyn WalContext>,
    config: WalConfig,
    path: PathBuf,
    order: u64,
    file: Arc<FileHandle>,
    flusher: SerialExecutor,
    closer: SerialExecutor,
    /// Records appended but not yet drained by the flusher.
    buffer: Mutex<Vec<BufferedRecord>>,
    /// Next free logical byte position; never decreases while open.
    filled_up_to: AtomicU64,
    /// Start LSN of the most recently appended record.
    last: Mutex<Option<Lsn>>,
    closed: AtomicBool,
    /// Set by appenders, cleared by the flusher before draining. A lost
    /// wakeup is harmless: the next append re-sets it.
    flush_dirty: AtomicBool,
    /// LSN of the last record that fully fits in a page not yet on disk;
    /// published as the written LSN once that page is.
    pending_lsn_to_flush: Mutex<Option<Lsn>>,
    /// Single-entry read cache, capped by [`reader::MAX_CACHED_RECORD`].
    last_read: Mutex<Option<(Lsn, Vec<u8>)>>,
}

impl LogSegment {
    /// Opens a segment over `path`, whose file name carries the ordinal
    /// (`<anything>.<N>.wal`). The backing file is not touched until first
    /// use. Both executors are injected and may be shared across segments;
    /// [`close`](Self::close) shuts them down.
    pub fn open(
        path: impl Into<PathBuf>,
        ctx: Arc<dyn WalContext>,
        config: WalConfig,
        flusher: SerialExecutor,
        closer: SerialExecutor,
    ) -> Result<Self> {
        let path = path.into();
        let name = path
            .file_name()
            .and_then(|name| name.to_str())
            .ok_or_else(|| WalError::InvalidName(path.display().to_string()))?;
        let order = extract_order(name)?;
        let file = FileHandle::new(path.clone(), config.file_ttl);
        Ok(Self {
            inner: Arc::new(SegmentInner {
                ctx,
                config,
                path,
                order,
                file,
                flusher,
                closer,
                buffer: Mutex::new(Vec::new()),
                filled_up_to: AtomicU64::new(0),
                last: Mutex::new(None),
                closed: AtomicBool::new(false),
                flush_dirty: AtomicBool::new(true),
                pending_lsn_to_flush: Mutex::new(None),
                last_read: Mutex::new(None),
            }),
        })
    }

    /// Reconciles in-memory state with the file: truncates a torn tail page
    /// left by a crash, then derives `filled_up_to` from the last whole page.
    /// Must run before any append.
    pub fn init(&self) -> Result<()> {
        self.inner.self_check()?;
        self.inner.load_tail_state()?;
        let filled = self.inner.filled_up_to.load(Ordering::Acquire);
        *self.inner.last.lock() = filled
            .checked_sub(1)
            .map(|position| Lsn::new(self.inner.order, position));
        Ok(())
    }

    /// Schedules the periodic background flush and marks the segment active
    /// so the file TTL closer leaves its handle alone. A zero commit delay
    /// disables background flushing.
    pub fn start_flush(&self) {
        let delay = self.inner.ctx.commit_delay();
        if delay.is_zero() {
            return;
        }
        let weak = Arc::downgrade(&self.inner);
        self.inner
            .flusher
            .schedule_repeating(delay, delay, move || match weak.upgrade() {
                Some(inner) => {
                    if let Err(err) = inner.run_flush_task() {
                        error!(
                            path = %inner.path.display(),
                            error = %err,
                            "error during background WAL flush"
                        );
                    }
                    Tick::Continue
                }
                None => Tick::Stop,
            });
        self.inner.file.set_active(true);
    }

    /// Optionally runs a final flush, then stops the flush executor with a
    /// bounded wait and re-enables file auto-close.
    pub fn stop_flush(&self, flush: bool) -> Result<()> {
        if flush {
            self.flush()?;
        }
        if !self.inner.flusher.is_shutdown() {
            self.inner
                .flusher
                .shutdown(self.inner.config.shutdown_timeout)?;
        }
        self.inner.file.set_active(false);
        Ok(())
    }

    /// Stops both executors and closes the backing file.
    pub fn close(&self, flush: bool) -> Result<()> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Ok(());
        }
        *self.inner.last_read.lock() = None;
        self.stop_flush(flush)?;
        if !self.inner.closer.is_shutdown() {
            self.inner
                .closer
                .shutdown(self.inner.config.shutdown_timeout)?;
        }
        self.inner.file.close();
        self.inner.closed.store(true, Ordering::Release);
        Ok(())
    }

    /// Closes the segment and unlinks its file, retrying transient failures.
    pub fn delete(&self, flush: bool) -> Result<()> {
        self.close(flush)?;
        let mut retries = 0;
        loop {
            match fs::remove_file(&self.inner.path) {
                Ok(()) => return Ok(()),
                Err(err) => {
                    retries += 1;
                    if retries > 10 {
                        error!(
                            path = %self.inner.path.display(),
                            retries,
                            "cannot delete WAL segment file, retry limit exceeded"
                        );
                        return Err(err.into());
                    }
                }
            }
        }
    }

    /// Appends a record and returns the LSN of its first byte. May flush
    /// synchronously when the un-persisted backlog exceeds the configured
    /// page budget.
    pub fn append(&self, payload: Vec<u8>) -> Result<Lsn> {
        if payload.is_empty() {
            return Err(WalError::InvalidState("cannot append an empty record"));
        }
        self.inner.append(payload)
    }

    /// Drains and persists the append buffer before returning. On return the
    /// appended bytes are on disk, fsynced when the sync policy says so.
    pub fn flush(&self) -> Result<()> {
        self.inner.flush()
    }

    /// Reads the record starting at `lsn`, reassembling fragments across
    /// pages. `None` when `lsn` is past the end of the segment.
    pub fn read_record(&self, lsn: Lsn) -> Result<Option<Vec<u8>>> {
        self.inner.read_record(lsn)
    }

    /// LSN of the first record after the one at `lsn`, or `None` when that
    /// record is the last one.
    pub fn next_lsn(&self, lsn: Lsn) -> Result<Option<Lsn>> {
        self.inner.next_lsn(lsn)
    }

    /// LSN of the first record, or `None` for a segment with no data at all.
    pub fn begin(&self) -> Result<Option<Lsn>> {
        self.inner.begin()
    }

    /// Start LSN of the most recently appended record.
    pub fn end(&self) -> Option<Lsn> {
        *self.inner.last.lock()
    }

    /// Highest LSN the file itself vouches for, or `None` for an empty file.
    pub fn read_flushed_lsn(&self) -> Result<Option<Lsn>> {
        self.inner.read_flushed_lsn()
    }

    pub fn filled_up_to(&self) -> u64 {
        self.inner.filled_up_to.load(Ordering::Acquire)
    }

    pub fn order(&self) -> u64 {
        self.inner.order
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    /// Observability: whether the backing file handle is currently open.
    pub fn file_handle_open(&self) -> bool {
        self.inner.file.is_open()
    }
}

impl PartialEq for LogSegment {
    fn eq(&self, other: &Self) -> bool {
        self.inner.order == other.inner.order
    }
}

impl Eq for LogSegment {}

impl PartialOrd for LogSegment {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for LogSegment {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.inner.order.cmp(&other.inner.order)
    }
}

impl SegmentInner {
    fn append(self: &Arc<Self>, payload: Vec<u8>) -> Result<Lsn> {
        self.flush_dirty.store(true, Ordering::Release);
        let (lsn, filled) = {
            let mut buffer = self.buffer.lock();
            let record = plan_record(self.filled_up_to.load(Ordering::Acquire), payload);
            let lsn = Lsn::new(self.order, record.write_from);
            let filled = record.write_to;
            self.filled_up_to.store(filled, Ordering::Release);
            *self.last.lock() = Some(lsn);
            buffer.push(record);
            (lsn, filled)
        };

        let written_position = self.ctx.written_lsn().map_or(0, |written| written.position);
        let pages_in_cache = (filled - written_position) / page::PAGE_SIZE as u64;
        if pages_in_cache > self.config.max_pages_cached {
            info!(
                path = %self.path.display(),
                limit = self.config.max_pages_cached,
                pages_in_cache,
                "page cache limit reached, performing synchronous flush"
            );
            self.ctx.increment_cache_overflow_count();
            self.flush()?;
        }
        Ok(lsn)
    }

    fn self_check(&self) -> Result<()> {
        if !self.buffer.lock().is_empty() {
            return Err(WalError::InvalidState(
                "append buffer is not empty, segment cannot be verified after use",
            ));
        }
        self.with_file(|io| {
            let len = io.len()?;
            let pages = len / page::PAGE_SIZE as u64;
            if len % page::PAGE_SIZE as u64 > 0 {
                error!(
                    path = %self.path.display(),
                    "last WAL page was written partially, truncating to the last whole page"
                );
                io.truncate(pages * page::PAGE_SIZE as u64)?;
            }
            Ok(())
        })
    }

    fn load_tail_state(&self) -> Result<()> {
        self.with_file(|io| {
            let pages = io.len()? / page::PAGE_SIZE as u64;
            if pages == 0 {
                return Ok(());
            }
            let mut tail = vec![0u8; page::PAGE_SIZE];
            io.read_at((pages - 1) * page::PAGE_SIZE as u64, &mut tail)?;
            let filled = if page::verify_page(&tail) {
                (pages - 1) * page::PAGE_SIZE as u64
                    + (page::PAGE_SIZE - page::free_space(&tail)) as u64
            } else {
                // Unreadable tail page: resume on a fresh page past it.
                pages * page::PAGE_SIZE as u64 + page::RECORDS_OFFSET as u64
            };
            self.filled_up_to.store(filled, Ordering::Release);
            Ok(())
        })
    }

    fn with_file<R>(&self, op: impl FnOnce(&StdFileIo) -> Result<R>) -> Result<R> {
        self.file.with_file(&self.closer, op)
    }
}
