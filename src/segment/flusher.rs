//! The flush pipeline: drains the append buffer, packs records into pages,
//! and writes them through the file handle.
//!
//! Only the flush executor's worker thread runs [`SegmentInner::commit_log`],
//! so pages are written in strictly increasing index order and
//! `pending_lsn_to_flush` has a single writer. The file mutex is taken per
//! I/O step, not across a whole cycle, so the reader can interleave.

use std::mem;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;

use crate::error::Result;
use crate::io::FileIo;
use crate::metrics;
use crate::types::Lsn;

use super::layout::BufferedRecord;
use super::{page, SegmentInner};

impl SegmentInner {
    /// Submits a flush task to the executor and waits for it, or runs it
    /// inline when the executor is already shut down.
    pub(super) fn flush(self: &Arc<Self>) -> Result<()> {
        if !self.flusher.is_shutdown() {
            let inner = Arc::clone(self);
            if let Ok(ticket) = self.flusher.submit(Box::new(move || inner.run_flush_task())) {
                return ticket.wait();
            }
        }
        self.run_flush_task()
    }

    /// One flush cycle plus the owning WAL's housekeeping hook, which runs
    /// whether or not the cycle succeeded.
    pub(super) fn run_flush_task(self: &Arc<Self>) -> Result<()> {
        let outcome = self.commit_log();
        self.ctx.check_free_space();
        outcome
    }

    fn commit_log(&self) -> Result<()> {
        if !self.flush_dirty.swap(false, Ordering::AcqRel) {
            return Ok(());
        }
        let started = Instant::now();
        let to_flush = {
            let mut buffer = self.buffer.lock();
            if buffer.is_empty() {
                return Ok(());
            }
            mem::take(&mut *buffer)
        };
        let outcome = self.flush_batch(&to_flush);
        metrics::record_flush(started.elapsed().as_nanos() as u64, to_flush.len() as u64);
        outcome
    }

    fn flush_batch(&self, to_flush: &[BufferedRecord]) -> Result<()> {
        let page_size = page::PAGE_SIZE as u64;
        let mut buf = vec![0u8; page::PAGE_SIZE];

        // A page partially filled by a previous flush must be read back, or
        // rewriting it would zero the bytes already there.
        let mut page_index = to_flush[0].write_from / page_size;
        self.with_file(|io| {
            let pages_on_disk = io.len()? / page_size;
            if pages_on_disk > page_index {
                io.read_at(page_index * page_size, &mut buf)?;
            }
            Ok(())
        })?;

        let mut last_lsn = None;
        let mut tail_pending = false;
        for record in to_flush {
            let lsn = Lsn::new(self.order, record.write_from);
            last_lsn = Some(lsn);
            let mut pos = (record.write_from % page_size) as usize;
            page_index = record.write_from / page_size;
            let mut written = 0;
            while written < record.payload.len() {
                tail_pending = true;
                let capacity = page::payload_capacity((page::PAGE_SIZE - pos) as i64) as usize;
                let chunk_len = capacity.min(record.payload.len() - written);
                let from = written;
                written += chunk_len;
                let is_last = written == record.payload.len();
                pos = page::write_chunk(&mut buf, pos, &record.payload[from..from + chunk_len], is_last);

                // The page is full once the planner's capacity arithmetic
                // says no further payload fits; the planner, the reader, and
                // this check must agree on that boundary.
                if page::payload_capacity((page::PAGE_SIZE - pos) as i64) <= 0 {
                    self.write_page(&mut buf, page_index)?;
                    {
                        let mut pending = self.pending_lsn_to_flush.lock();
                        if let Some(ready) = pending.take() {
                            self.ctx.set_written_lsn(ready);
                        }
                        *pending = Some(lsn);
                    }
                    tail_pending = false;
                    page_index += 1;
                    pos = page::RECORDS_OFFSET;
                    buf.fill(0);
                }
            }
        }
        if tail_pending {
            self.write_page(&mut buf, page_index)?;
        }

        if self.config.sync_on_page_flush {
            self.with_file(|io| io.sync_all())?;
        }

        if let Some(lsn) = last_lsn {
            self.ctx.set_flushed_lsn(lsn);
            self.ctx.set_written_lsn(lsn);
        }
        Ok(())
    }

    fn write_page(&self, buf: &mut [u8], page_index: u64) -> Result<()> {
        page::finalize_page(buf);
        self.with_file(|io| io.write_at(page_index * page::PAGE_SIZE as u64, buf))?;
        metrics::record_page_write();
        Ok(())
    }
}
