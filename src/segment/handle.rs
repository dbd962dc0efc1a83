//! Lazily-opened backing file with TTL auto-close.
//!
//! A long-lived process may hold thousands of cold segments; keeping every
//! backing file open would exhaust descriptors. The handle opens on first
//! demand and a repeating closer task shuts it after an idle TTL, using a
//! two-tick heuristic: each tick arms `close_next_time`, each access while
//! the handle is open disarms it, and a tick that finds it still armed has
//! seen a full TTL with no access.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::debug;

use crate::error::Result;
use crate::exec::{SerialExecutor, Tick};
use crate::io::StdFileIo;

pub(crate) struct FileHandle {
    path: PathBuf,
    ttl: Duration,
    /// Guards the handle and every I/O issued through it.
    file: Mutex<Option<StdFileIo>>,
    /// One closer task at a time, armed by the first open after a close.
    auto_close_in_progress: AtomicBool,
    /// Armed by the closer tick, disarmed by accesses. Still armed on the
    /// next tick means the handle sat idle for a full TTL.
    close_next_time: AtomicBool,
    /// While the segment is active the closer ticks but never closes.
    prevent_auto_close: AtomicBool,
}

impl FileHandle {
    pub fn new(path: PathBuf, ttl: Duration) -> Arc<Self> {
        Arc::new(Self {
            path,
            ttl,
            file: Mutex::new(None),
            auto_close_in_progress: AtomicBool::new(false),
            close_next_time: AtomicBool::new(false),
            prevent_auto_close: AtomicBool::new(false),
        })
    }

    /// Runs `op` against the backing file under the file mutex, opening the
    /// file first if needed. A fresh open arms the closer on `scheduler`.
    pub fn with_file<R>(
        self: &Arc<Self>,
        scheduler: &SerialExecutor,
        op: impl FnOnce(&StdFileIo) -> Result<R>,
    ) -> Result<R> {
        let mut guard = self.file.lock();
        let io = if let Some(io) = guard.as_ref() {
            self.close_next_time.store(false, Ordering::Release);
            io.clone()
        } else {
            let io = StdFileIo::open(&self.path)?;
            *guard = Some(io.clone());
            self.schedule_auto_close(scheduler);
            io
        };
        op(&io)
    }

    fn schedule_auto_close(self: &Arc<Self>, scheduler: &SerialExecutor) {
        if self
            .auto_close_in_progress
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            self.close_next_time.store(true, Ordering::Release);
            let handle = Arc::downgrade(self);
            scheduler.schedule_repeating(self.ttl, self.ttl, move || closer_tick(&handle));
        }
    }

    fn auto_close_tick(&self) -> Tick {
        if self.prevent_auto_close.load(Ordering::Acquire) {
            return Tick::Continue;
        }
        let mut guard = self.file.lock();
        if self.close_next_time.load(Ordering::Acquire) {
            if guard.take().is_some() {
                debug!(path = %self.path.display(), "auto-closed idle WAL segment file");
            }
            self.auto_close_in_progress.store(false, Ordering::Release);
            Tick::Stop
        } else {
            self.close_next_time.store(true, Ordering::Release);
            Tick::Continue
        }
    }

    /// Marks the segment active: the closer keeps ticking but will not close
    /// the handle until activity ceases.
    pub fn set_active(&self, active: bool) {
        self.prevent_auto_close.store(active, Ordering::Release);
    }

    pub fn close(&self) {
        *self.file.lock() = None;
    }

    pub fn is_open(&self) -> bool {
        self.file.lock().is_some()
    }
}

fn closer_tick(handle: &Weak<FileHandle>) -> Tick {
    match handle.upgrade() {
        Some(handle) => handle.auto_close_tick(),
        None => Tick::Stop,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::FileIo;
    use std::thread;
    use std::time::Instant;
    use tempfile::tempdir;

    fn wait_until_closed(handle: &Arc<FileHandle>, within: Duration) -> bool {
        let deadline = Instant::now() + within;
        while Instant::now() < deadline {
            if !handle.is_open() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        false
    }

    #[test]
    fn idle_handle_closes_after_two_ticks() {
        let dir = tempdir().unwrap();
        let scheduler = SerialExecutor::new("closer");
        let handle = FileHandle::new(dir.path().join("seg.0.wal"), Duration::from_millis(20));

        handle.with_file(&scheduler, |io| io.write_at(0, b"x")).unwrap();
        assert!(handle.is_open());
        assert!(wait_until_closed(&handle, Duration::from_secs(5)));

        // Next access reopens and re-arms transparently.
        let mut buf = [0u8; 1];
        handle.with_file(&scheduler, |io| io.read_at(0, &mut buf)).unwrap();
        assert!(handle.is_open());
        assert_eq!(&buf, b"x");
        assert!(wait_until_closed(&handle, Duration::from_secs(5)));

        scheduler.shutdown(Duration::from_secs(1)).unwrap();
    }

    #[test]
    fn active_handle_survives_ticks() {
        let dir = tempdir().unwrap();
        let scheduler = SerialExecutor::new("closer");
        let handle = FileHandle::new(dir.path().join("seg.1.wal"), Duration::from_millis(10));

        handle.set_active(true);
        handle.with_file(&scheduler, |io| io.write_at(0, b"y")).unwrap();
        thread::sleep(Duration::from_millis(80));
        assert!(handle.is_open(), "active handle must not auto-close");

        // Once activity ceases the already-armed closer takes over.
        handle.set_active(false);
        assert!(wait_until_closed(&handle, Duration::from_secs(5)));

        scheduler.shutdown(Duration::from_secs(1)).unwrap();
    }
}
