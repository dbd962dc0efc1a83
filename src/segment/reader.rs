//! Record reads by LSN.
//!
//! A record may span any number of pages; the reader walks the chunk chain,
//! verifying every page it touches. Reads never observe un-persisted
//! appends: a non-empty append buffer is flushed first.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use crate::error::{Result, WalError};
use crate::io::FileIo;
use crate::types::Lsn;

use super::{page, SegmentInner};

/// Upper bound for the single-entry read cache, so one huge record cannot
/// pin memory indefinitely.
pub(super) const MAX_CACHED_RECORD: usize = 1 << 20;

impl SegmentInner {
    pub(super) fn read_record(self: &Arc<Self>, lsn: Lsn) -> Result<Option<Vec<u8>>> {
        if let Some((cached_lsn, bytes)) = self.last_read.lock().as_ref() {
            if *cached_lsn == lsn {
                return Ok(Some(bytes.clone()));
            }
        }
        if lsn.segment != self.order {
            return Err(WalError::InvalidState(
                "record LSN belongs to a different segment",
            ));
        }
        if lsn.position >= self.filled_up_to.load(Ordering::Acquire) {
            return Ok(None);
        }
        if !self.buffer.lock().is_empty() {
            self.flush()?;
        }

        let page_size = page::PAGE_SIZE as u64;
        let filled_up_to = self.filled_up_to.load(Ordering::Acquire);
        let page_count = (filled_up_to + page_size - 1) / page_size;
        let mut page_index = lsn.position / page_size;
        let mut page_offset = (lsn.position % page_size) as usize;

        let mut record = Vec::new();
        let mut buf = vec![0u8; page::PAGE_SIZE];
        loop {
            self.with_file(|io| io.read_at(page_index * page_size, &mut buf))?;
            if !page::verify_page(&buf) {
                return Err(WalError::PageBroken(page_index));
            }
            let chunk =
                page::read_chunk(&buf, page_offset).ok_or(WalError::PageBroken(page_index))?;
            record.extend_from_slice(chunk.payload);

            if chunk.continues_next_page {
                page_index += 1;
                page_offset = page::RECORDS_OFFSET;
                if page_index >= page_count {
                    return Err(WalError::PageBroken(page_index));
                }
            } else {
                // A non-final page with usable free space means the writer
                // stopped packing records mid-page: the chain is broken.
                // Usable is the planner's notion: positive payload capacity.
                if page::payload_capacity(page::free_space(&buf) as i64) > 0
                    && page_index < page_count - 1
                {
                    return Err(WalError::PageBroken(page_index));
                }
                break;
            }
        }

        if record.len() <= MAX_CACHED_RECORD {
            *self.last_read.lock() = Some((lsn, record.clone()));
        }
        Ok(Some(record))
    }

    /// Walks past the record at `lsn` to the first position outside it,
    /// skipping page headers and unusable page tails on the way.
    pub(super) fn next_lsn(self: &Arc<Self>, lsn: Lsn) -> Result<Option<Lsn>> {
        let Some(record) = self.read_record(lsn)? else {
            return Ok(None);
        };

        let page_size = page::PAGE_SIZE as u64;
        let mut pos = lsn.position;
        let mut page_offset = (lsn.position % page_size) as usize;
        let mut rest = record.len();
        while rest > 0 {
            let entry_size = page::serialized_size(rest);
            if entry_size + page_offset < page::PAGE_SIZE {
                if page::payload_capacity((page::PAGE_SIZE - entry_size - page_offset) as i64) > 0 {
                    pos += entry_size as u64;
                } else {
                    // The record leaves an unusable tail; the next record
                    // starts behind the next page's header.
                    pos += (page::PAGE_SIZE - page_offset + page::RECORDS_OFFSET) as u64;
                }
                break;
            } else if entry_size + page_offset == page::PAGE_SIZE {
                pos += (entry_size + page::RECORDS_OFFSET) as u64;
                break;
            } else {
                let chunk = page::payload_capacity((page::PAGE_SIZE - page_offset) as i64) as usize;
                rest -= chunk;
                pos += (page::PAGE_SIZE - page_offset + page::RECORDS_OFFSET) as u64;
                page_offset = page::RECORDS_OFFSET;
            }
        }

        if pos >= self.filled_up_to.load(Ordering::Acquire) {
            return Ok(None);
        }
        Ok(Some(Lsn::new(self.order, pos)))
    }

    pub(super) fn begin(self: &Arc<Self>) -> Result<Option<Lsn>> {
        if !self.buffer.lock().is_empty() {
            return Ok(Some(Lsn::new(self.order, page::RECORDS_OFFSET as u64)));
        }
        let len = self.with_file(|io| io.len())?;
        if len > 0 {
            Ok(Some(Lsn::new(self.order, page::RECORDS_OFFSET as u64)))
        } else {
            Ok(None)
        }
    }

    pub(super) fn read_flushed_lsn(self: &Arc<Self>) -> Result<Option<Lsn>> {
        let pages = self.with_file(|io| io.len())? / page::PAGE_SIZE as u64;
        if pages == 0 {
            return Ok(None);
        }
        let filled = self.filled_up_to.load(Ordering::Acquire);
        Ok(filled
            .checked_sub(1)
            .map(|position| Lsn::new(self.order, position)))
    }
}
