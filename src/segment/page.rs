//! On-disk page format.
//!
//! A page is a fixed-size frame holding concatenated record chunks:
//!
//! ```text
//! 0         4              12            16
//! ├─ crc32 ─┼─── magic ────┼─ free_space ┼─ record chunks … ─┤
//! ```
//!
//! The CRC covers bytes `[4 .. PAGE_SIZE)`. Each chunk frames one fragment of
//! a record: a continues-next-page flag, a last-chunk flag, a little-endian
//! payload length, then the payload. Exactly one of the two flags is set.

use crate::types::checksum::crc32_of;

pub const PAGE_SIZE: usize = 64 * 1024;

pub const CRC_OFFSET: usize = 0;
pub const MAGIC_OFFSET: usize = 4;
pub const FREE_SPACE_OFFSET: usize = 12;
pub const RECORDS_OFFSET: usize = 16;

pub const PAGE_MAGIC: u64 = u64::from_le_bytes(*b"PGWALSG1");

pub const CHUNK_HEADER_SIZE: usize = 6;
/// Smallest framable chunk: header plus one payload byte. A page with less
/// than this much room left is full.
pub const MIN_RECORD_SIZE: usize = CHUNK_HEADER_SIZE + 1;
pub const MAX_ENTRY_SIZE: usize = PAGE_SIZE - RECORDS_OFFSET;

/// Payload capacity of `free_space` bytes of page, once one chunk header is
/// carved out. Non-positive means no payload fits.
pub fn payload_capacity(free_space: i64) -> i64 {
    free_space - MIN_RECORD_SIZE as i64
}

/// Bytes a payload of `payload_len` consumes inside a page, header included.
pub fn serialized_size(payload_len: usize) -> usize {
    payload_len + CHUNK_HEADER_SIZE
}

/// One decoded record fragment.
pub struct Chunk<'a> {
    pub payload: &'a [u8],
    pub continues_next_page: bool,
}

/// Writes a chunk at `pos`, refreshes the page's free-space field, and
/// returns the cursor past the chunk.
pub fn write_chunk(page: &mut [u8], pos: usize, payload: &[u8], is_last: bool) -> usize {
    page[pos] = u8::from(!is_last);
    page[pos + 1] = u8::from(is_last);
    page[pos + 2..pos + CHUNK_HEADER_SIZE].copy_from_slice(&(payload.len() as u32).to_le_bytes());
    page[pos + CHUNK_HEADER_SIZE..pos + CHUNK_HEADER_SIZE + payload.len()].copy_from_slice(payload);
    let new_pos = pos + serialized_size(payload.len());
    page[FREE_SPACE_OFFSET..RECORDS_OFFSET]
        .copy_from_slice(&((PAGE_SIZE - new_pos) as u32).to_le_bytes());
    new_pos
}

/// Decodes the chunk at `pos`. `None` means the bytes do not frame a valid
/// chunk (flag invariant violated or length out of bounds).
pub fn read_chunk(page: &[u8], pos: usize) -> Option<Chunk<'_>> {
    if pos + CHUNK_HEADER_SIZE > PAGE_SIZE {
        return None;
    }
    let continues = page[pos];
    let last = page[pos + 1];
    if continues > 1 || last > 1 || continues == last {
        return None;
    }
    let len = u32::from_le_bytes(page[pos + 2..pos + CHUNK_HEADER_SIZE].try_into().unwrap()) as usize;
    let start = pos + CHUNK_HEADER_SIZE;
    let end = start.checked_add(len)?;
    if end > PAGE_SIZE {
        return None;
    }
    Some(Chunk {
        payload: &page[start..end],
        continues_next_page: continues == 1,
    })
}

/// Stamps the magic and the CRC over `[4 .. PAGE_SIZE)`. Idempotent.
pub fn finalize_page(page: &mut [u8]) {
    page[MAGIC_OFFSET..FREE_SPACE_OFFSET].copy_from_slice(&PAGE_MAGIC.to_le_bytes());
    let crc = crc32_of(&[&page[MAGIC_OFFSET..PAGE_SIZE]]);
    page[CRC_OFFSET..MAGIC_OFFSET].copy_from_slice(&crc.to_le_bytes());
}

/// True when the magic matches and the stored CRC agrees with the content.
pub fn verify_page(page: &[u8]) -> bool {
    let magic = u64::from_le_bytes(page[MAGIC_OFFSET..FREE_SPACE_OFFSET].try_into().unwrap());
    if magic != PAGE_MAGIC {
        return false;
    }
    let stored = u32::from_le_bytes(page[CRC_OFFSET..MAGIC_OFFSET].try_into().unwrap());
    crc32_of(&[&page[MAGIC_OFFSET..PAGE_SIZE]]) == stored
}

/// Free bytes recorded after the last chunk of the page.
pub fn free_space(page: &[u8]) -> usize {
    u32::from_le_bytes(page[FREE_SPACE_OFFSET..RECORDS_OFFSET].try_into().unwrap()) as usize
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_roundtrip_updates_free_space() {
        let mut page = vec![0u8; PAGE_SIZE];
        let pos = write_chunk(&mut page, RECORDS_OFFSET, b"hello", true);
        assert_eq!(pos, RECORDS_OFFSET + serialized_size(5));
        assert_eq!(free_space(&page), PAGE_SIZE - pos);

        let chunk = read_chunk(&page, RECORDS_OFFSET).expect("valid chunk");
        assert_eq!(chunk.payload, b"hello");
        assert!(!chunk.continues_next_page);
    }

    #[test]
    fn continued_chunk_sets_flag() {
        let mut page = vec![0u8; PAGE_SIZE];
        write_chunk(&mut page, RECORDS_OFFSET, &[9u8; 32], false);
        let chunk = read_chunk(&page, RECORDS_OFFSET).expect("valid chunk");
        assert!(chunk.continues_next_page);
        assert_eq!(chunk.payload.len(), 32);
    }

    #[test]
    fn read_chunk_rejects_flag_invariant_violation() {
        let mut page = vec![0u8; PAGE_SIZE];
        write_chunk(&mut page, RECORDS_OFFSET, b"x", true);
        // Both flags set.
        page[RECORDS_OFFSET] = 1;
        page[RECORDS_OFFSET + 1] = 1;
        assert!(read_chunk(&page, RECORDS_OFFSET).is_none());
        // Neither flag set.
        page[RECORDS_OFFSET] = 0;
        page[RECORDS_OFFSET + 1] = 0;
        assert!(read_chunk(&page, RECORDS_OFFSET).is_none());
    }

    #[test]
    fn read_chunk_rejects_length_past_page_end() {
        let mut page = vec![0u8; PAGE_SIZE];
        write_chunk(&mut page, RECORDS_OFFSET, b"abc", true);
        page[RECORDS_OFFSET + 2..RECORDS_OFFSET + 6]
            .copy_from_slice(&(PAGE_SIZE as u32).to_le_bytes());
        assert!(read_chunk(&page, RECORDS_OFFSET).is_none());
    }

    #[test]
    fn finalize_then_verify() {
        let mut page = vec![0u8; PAGE_SIZE];
        write_chunk(&mut page, RECORDS_OFFSET, b"payload", true);
        finalize_page(&mut page);
        assert!(verify_page(&page));
        // Idempotent.
        finalize_page(&mut page);
        assert!(verify_page(&page));
    }

    #[test]
    fn verify_detects_any_covered_bit_flip() {
        let mut page = vec![0u8; PAGE_SIZE];
        write_chunk(&mut page, RECORDS_OFFSET, &[3u8; 100], true);
        finalize_page(&mut page);
        for offset in [MAGIC_OFFSET, FREE_SPACE_OFFSET, RECORDS_OFFSET + 50, PAGE_SIZE - 1] {
            let mut corrupt = page.clone();
            corrupt[offset] ^= 0x40;
            assert!(!verify_page(&corrupt), "flip at {offset} went undetected");
        }
    }

    #[test]
    fn capacity_arithmetic() {
        assert_eq!(payload_capacity(MIN_RECORD_SIZE as i64), 0);
        assert_eq!(payload_capacity(6), -1);
        assert_eq!(payload_capacity(100), 93);
        assert_eq!(serialized_size(0), CHUNK_HEADER_SIZE);
        assert_eq!(serialized_size(93), 99);
    }
}
