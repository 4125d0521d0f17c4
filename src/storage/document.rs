//! Slotted document pages and multi-page (overflow) documents.
//!
//! Layout: `[page header | slot directory | free zone | data blocks]`. The
//! directory holds fixed 10-byte entries, so it alone is enough to locate
//! any slot. Multi-page documents occupy a contiguous run whose first page
//! carries the slot; the continuation pages are the `page_count` pages
//! immediately after it, raw data with FSM level None, not slot-searchable.

use std::sync::Arc;

use log::debug;

use crate::errors::{DbError, DbResult};
use crate::pool::BufferPool;
use crate::storage::latch::PageLockManager;
use crate::storage::page_io::PageIo;
use crate::storage::page_manager::PageManager;
use crate::types::{CancelToken, DocumentLocation, FreeLevel, PageId};

pub const PAGE_KIND_SLOTTED: u8 = 1;

const PAGE_HEADER_LEN: usize = 8;
const SLOT_ENTRY_LEN: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct SlotEntry {
    total_size: u32,
    offset: u16,
    length: u16,
    page_count: u16,
}

impl SlotEntry {
    const fn is_tombstone(&self) -> bool {
        self.page_count == 0 && self.total_size == 0
    }

    const fn block_len(&self) -> usize {
        self.length as usize
    }

    /// Continuation pages of a multi-page document: the run is contiguous,
    /// so the list is implicit in the first page id and the count.
    fn overflow_pages(&self, first: PageId) -> Vec<PageId> {
        (1..=u32::from(self.page_count)).map(|i| first + i).collect()
    }
}

fn slot_count(buf: &[u8]) -> u16 {
    u16::from_le_bytes(buf[2..4].try_into().expect("2 bytes"))
}

fn data_tail(buf: &[u8]) -> u16 {
    u16::from_le_bytes(buf[4..6].try_into().expect("2 bytes"))
}

fn set_slot_count(buf: &mut [u8], count: u16) {
    buf[2..4].copy_from_slice(&count.to_le_bytes());
}

fn set_data_tail(buf: &mut [u8], tail: u16) {
    buf[4..6].copy_from_slice(&tail.to_le_bytes());
}

fn entry_at(buf: &[u8], slot: u16) -> SlotEntry {
    let at = PAGE_HEADER_LEN + slot as usize * SLOT_ENTRY_LEN;
    SlotEntry {
        total_size: u32::from_le_bytes(buf[at..at + 4].try_into().expect("4 bytes")),
        offset: u16::from_le_bytes(buf[at + 4..at + 6].try_into().expect("2 bytes")),
        length: u16::from_le_bytes(buf[at + 6..at + 8].try_into().expect("2 bytes")),
        page_count: u16::from_le_bytes(buf[at + 8..at + 10].try_into().expect("2 bytes")),
    }
}

fn write_entry(buf: &mut [u8], slot: u16, entry: &SlotEntry) {
    let at = PAGE_HEADER_LEN + slot as usize * SLOT_ENTRY_LEN;
    buf[at..at + 4].copy_from_slice(&entry.total_size.to_le_bytes());
    buf[at + 4..at + 6].copy_from_slice(&entry.offset.to_le_bytes());
    buf[at + 6..at + 8].copy_from_slice(&entry.length.to_le_bytes());
    buf[at + 8..at + 10].copy_from_slice(&entry.page_count.to_le_bytes());
}

fn init_slotted(buf: &mut [u8]) {
    buf.iter_mut().for_each(|b| *b = 0);
    buf[0] = PAGE_KIND_SLOTTED;
    set_slot_count(buf, 0);
    set_data_tail(buf, buf.len() as u16);
}

/// Contiguous free bytes between the directory and the data area.
fn contiguous_free(buf: &[u8]) -> usize {
    let dir_end = PAGE_HEADER_LEN + slot_count(buf) as usize * SLOT_ENTRY_LEN;
    (data_tail(buf) as usize).saturating_sub(dir_end)
}

/// Free bytes a compaction would recover, dead blocks and trailing
/// tombstones included.
fn logical_free(buf: &[u8]) -> usize {
    let count = slot_count(buf);
    let mut live_block_bytes = 0usize;
    let mut trailing_live = 0u16;
    for slot in 0..count {
        let entry = entry_at(buf, slot);
        if !entry.is_tombstone() {
            live_block_bytes += entry.block_len();
            trailing_live = slot + 1;
        }
    }
    let dir_bytes = PAGE_HEADER_LEN + trailing_live as usize * SLOT_ENTRY_LEN;
    buf.len() - dir_bytes - live_block_bytes
}

/// Tries to place a data block on the page, reusing a tombstoned directory
/// entry when one exists. Returns the slot index, or None when it does not
/// fit.
fn place_block(buf: &mut [u8], total_size: u32, page_count: u16, chunk: &[u8]) -> Option<u16> {
    let count = slot_count(buf);
    let reuse = (0..count).find(|&slot| entry_at(buf, slot).is_tombstone());
    let entry_cost = if reuse.is_some() { 0 } else { SLOT_ENTRY_LEN };
    if contiguous_free(buf) < entry_cost + chunk.len() {
        return None;
    }
    let new_tail = data_tail(buf) as usize - chunk.len();
    buf[new_tail..new_tail + chunk.len()].copy_from_slice(chunk);
    let slot = reuse.unwrap_or(count);
    if reuse.is_none() {
        set_slot_count(buf, count + 1);
    }
    set_data_tail(buf, new_tail as u16);
    write_entry(
        buf,
        slot,
        &SlotEntry {
            total_size,
            offset: new_tail as u16,
            length: chunk.len() as u16,
            page_count,
        },
    );
    Some(slot)
}

/// Rewrites the page with live blocks packed against the end, preserving
/// slot indexes; trailing tombstones are dropped from the directory.
fn compact_in_place(buf: &mut [u8]) {
    let count = slot_count(buf);
    let mut live: Vec<(u16, SlotEntry, Vec<u8>)> = Vec::new();
    for slot in 0..count {
        let entry = entry_at(buf, slot);
        if !entry.is_tombstone() {
            let at = entry.offset as usize;
            live.push((slot, entry, buf[at..at + entry.block_len()].to_vec()));
        }
    }
    let new_count = live.iter().map(|(slot, _, _)| slot + 1).max().unwrap_or(0);
    let mut tail = buf.len();
    let blocks: Vec<(u16, SlotEntry, Vec<u8>, usize)> = live
        .into_iter()
        .map(|(slot, entry, block)| {
            tail -= block.len();
            (slot, entry, block, tail)
        })
        .collect();
    for slot in 0..count {
        write_entry(buf, slot, &SlotEntry { total_size: 0, offset: 0, length: 0, page_count: 0 });
    }
    for (slot, mut entry, block, at) in blocks {
        buf[at..at + block.len()].copy_from_slice(&block);
        entry.offset = at as u16;
        write_entry(buf, slot, &entry);
    }
    set_slot_count(buf, new_count);
    set_data_tail(buf, tail as u16);
}

pub struct DocumentStorage {
    io: Arc<dyn PageIo>,
    pm: Arc<PageManager>,
    latches: Arc<PageLockManager>,
    pool: Arc<BufferPool>,
}

impl DocumentStorage {
    #[must_use]
    pub fn new(
        io: Arc<dyn PageIo>,
        pm: Arc<PageManager>,
        latches: Arc<PageLockManager>,
        pool: Arc<BufferPool>,
    ) -> Self {
        Self { io, pm, latches, pool }
    }

    fn usable(&self) -> usize {
        self.io.usable_page_size() as usize
    }

    /// Largest document that still fits on a single page.
    #[must_use]
    pub fn single_page_max(&self) -> usize {
        self.usable() - PAGE_HEADER_LEN - SLOT_ENTRY_LEN
    }

    /// Reads a document. The fast path parses only the slot directory and
    /// copies exactly the slot bytes; multi-page reads latch continuation
    /// pages in ascending page-id order.
    ///
    /// # Errors
    /// `SlotDeleted` when the slot is gone (benign GC race; callers map it
    /// to an absent document).
    pub fn read(&self, loc: DocumentLocation, cancel: &CancelToken) -> DbResult<Vec<u8>> {
        cancel.check()?;
        let _latch = self.latches.read(loc.page_id);
        let mut buf = self.pool.rent();
        self.io.read_page(loc.page_id, &mut buf)?;
        if buf[0] != PAGE_KIND_SLOTTED || loc.slot >= slot_count(&buf) {
            return Err(DbError::SlotDeleted { page_id: loc.page_id, slot: loc.slot });
        }
        let entry = entry_at(&buf, loc.slot);
        if entry.is_tombstone() {
            return Err(DbError::SlotDeleted { page_id: loc.page_id, slot: loc.slot });
        }
        let at = entry.offset as usize;
        let overflow = entry.overflow_pages(loc.page_id);
        let mut out = Vec::with_capacity(entry.total_size as usize);
        out.extend_from_slice(&buf[at..at + entry.length as usize]);
        if !overflow.is_empty() {
            let usable = self.usable();
            let _cont_latches = self.latches.read_many(&overflow);
            let mut cont = self.pool.rent();
            for &page in &overflow {
                cancel.check()?;
                self.io.read_page(page, &mut cont)?;
                let remaining = entry.total_size as usize - out.len();
                out.extend_from_slice(&cont[..remaining.min(usable)]);
            }
        }
        debug_assert_eq!(out.len(), entry.total_size as usize);
        Ok(out)
    }

    /// Writes a document and returns its location. Single-page documents are
    /// placed on an existing page whose FSM level covers the required share
    /// of the page, compacting the target in place when its contiguous free
    /// zone is fragmented; multi-page documents allocate a contiguous run.
    ///
    /// # Errors
    /// Allocation and I/O errors; empty payloads are rejected.
    pub fn write(&self, bytes: &[u8], cancel: &CancelToken) -> DbResult<DocumentLocation> {
        cancel.check()?;
        if bytes.is_empty() {
            return Err(DbError::Io(std::io::Error::other("empty document payload")));
        }
        if bytes.len() <= self.single_page_max() {
            return self.write_single(bytes);
        }
        self.write_overflow(bytes, cancel)
    }

    fn write_single(&self, bytes: &[u8]) -> DbResult<DocumentLocation> {
        let usable = self.usable();
        let required = FreeLevel::required_for(bytes.len(), usable);
        for candidate in self.pm.fsm_candidates(required) {
            let _latch = self.latches.write(candidate);
            let mut buf = self.pool.rent();
            self.io.read_page(candidate, &mut buf)?;
            if buf[0] != PAGE_KIND_SLOTTED {
                continue;
            }
            let slot = match place_block(&mut buf, bytes.len() as u32, 0, bytes) {
                Some(slot) => Some(slot),
                None => {
                    // FSM buckets are coarse; compact before giving up on
                    // the page.
                    compact_in_place(&mut buf);
                    place_block(&mut buf, bytes.len() as u32, 0, bytes)
                }
            };
            if let Some(slot) = slot {
                self.io.write_page(candidate, &buf)?;
                self.pm.set_fsm(candidate, FreeLevel::for_free_bytes(contiguous_free(&buf), usable))?;
                return Ok(DocumentLocation::new(candidate, slot));
            }
        }
        let page = self.pm.allocate()?;
        let _latch = self.latches.write(page);
        let mut buf = self.pool.rent();
        init_slotted(&mut buf);
        let slot = place_block(&mut buf, bytes.len() as u32, 0, bytes)
            .expect("fresh page must fit a single-page document");
        self.io.write_page(page, &buf)?;
        self.pm.set_fsm(page, FreeLevel::for_free_bytes(contiguous_free(&buf), usable))?;
        debug!("document of {} bytes placed on fresh page {page}", bytes.len());
        Ok(DocumentLocation::new(page, slot))
    }

    fn write_overflow(&self, bytes: &[u8], cancel: &CancelToken) -> DbResult<DocumentLocation> {
        let usable = self.usable();
        let chunk_len = self.single_page_max();
        let cont = (bytes.len() - chunk_len).div_ceil(usable);
        let run = self.pm.allocate_contiguous(cont as u32 + 1)?;
        let first = run[0];
        let overflow = &run[1..];

        let _latches = self.latches.write_many(&run);
        let mut buf = self.pool.rent();
        init_slotted(&mut buf);
        let slot = place_block(&mut buf, bytes.len() as u32, cont as u16, &bytes[..chunk_len])
            .expect("fresh first page must fit its chunk");
        self.io.write_page(first, &buf)?;
        self.pm.set_fsm(first, FreeLevel::for_free_bytes(contiguous_free(&buf), usable))?;

        let mut page_buf = self.pool.rent();
        let mut written = chunk_len;
        for &page in overflow {
            cancel.check()?;
            let take = (bytes.len() - written).min(usable);
            page_buf.iter_mut().for_each(|b| *b = 0);
            page_buf[..take].copy_from_slice(&bytes[written..written + take]);
            self.io.write_page(page, &page_buf)?;
            written += take;
        }
        debug_assert_eq!(written, bytes.len());
        debug!("document of {} bytes spans pages {first}..={}", bytes.len(), run[run.len() - 1]);
        Ok(DocumentLocation::new(first, slot))
    }

    /// Physically deletes a slot: tombstones the entry and frees any
    /// continuation pages. No-ops gracefully when the slot is already gone.
    ///
    /// # Errors
    /// Propagates I/O failures.
    pub fn try_delete(&self, loc: DocumentLocation) -> DbResult<bool> {
        let _latch = self.latches.write(loc.page_id);
        if !self.pm.is_allocated(loc.page_id) {
            return Ok(false);
        }
        let mut buf = self.pool.rent();
        self.io.read_page(loc.page_id, &mut buf)?;
        if buf[0] != PAGE_KIND_SLOTTED || loc.slot >= slot_count(&buf) {
            return Ok(false);
        }
        let entry = entry_at(&buf, loc.slot);
        if entry.is_tombstone() {
            return Ok(false);
        }
        let overflow = entry.overflow_pages(loc.page_id);
        write_entry(
            &mut buf,
            loc.slot,
            &SlotEntry { total_size: 0, offset: 0, length: 0, page_count: 0 },
        );
        self.io.write_page(loc.page_id, &buf)?;
        for page in overflow {
            self.pm.free_page(page)?;
        }
        // A page whose last live slot just went away is returned to the
        // allocator whole.
        let all_dead = (0..slot_count(&buf)).all(|slot| entry_at(&buf, slot).is_tombstone());
        if all_dead {
            self.pm.free_page(loc.page_id)?;
        }
        Ok(true)
    }

    /// Compacts one slotted page when compaction would recover more space
    /// than the FSM currently declares. Returns whether a rewrite happened.
    ///
    /// # Errors
    /// Propagates I/O failures.
    pub fn compact_page(&self, page_id: PageId) -> DbResult<bool> {
        let usable = self.usable();
        let _latch = self.latches.write(page_id);
        if !self.pm.is_allocated(page_id) {
            return Ok(false);
        }
        let mut buf = self.pool.rent();
        self.io.read_page(page_id, &mut buf)?;
        if buf[0] != PAGE_KIND_SLOTTED {
            return Ok(false);
        }
        let reclaimable = logical_free(&buf);
        if FreeLevel::for_free_bytes(reclaimable, usable) <= self.pm.fsm_level(page_id)
            && reclaimable <= contiguous_free(&buf)
        {
            return Ok(false);
        }
        compact_in_place(&mut buf);
        self.io.write_page(page_id, &buf)?;
        self.pm.set_fsm(page_id, FreeLevel::for_free_bytes(contiguous_free(&buf), usable))?;
        Ok(true)
    }

    /// `(contiguous free, reclaimable free)` of a slotted page, or `None`
    /// when the page is not a slotted page.
    ///
    /// # Errors
    /// Propagates read failures.
    pub fn page_free_info(&self, page_id: PageId) -> DbResult<Option<(usize, usize)>> {
        let _latch = self.latches.read(page_id);
        if !self.pm.is_allocated(page_id) {
            return Ok(None);
        }
        let mut buf = self.pool.rent();
        self.io.read_page(page_id, &mut buf)?;
        if buf[0] != PAGE_KIND_SLOTTED {
            return Ok(None);
        }
        Ok(Some((contiguous_free(&buf), logical_free(&buf))))
    }

    /// Slotted pages currently allocated, for vacuum sweeps and the
    /// verifier.
    ///
    /// # Errors
    /// Propagates read failures.
    pub fn slotted_pages(&self) -> DbResult<Vec<PageId>> {
        let mut out = Vec::new();
        let mut buf = self.pool.rent();
        for page_id in self.pm.allocated_pages() {
            let _latch = self.latches.read(page_id);
            if self.io.read_page(page_id, &mut buf).is_ok() && buf[0] == PAGE_KIND_SLOTTED {
                out.push(page_id);
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn place_and_tombstone_and_compact() {
        let mut buf = vec![0u8; 1024];
        init_slotted(&mut buf);
        let s0 = place_block(&mut buf, 100, 0, &[1u8; 100]).unwrap();
        let s1 = place_block(&mut buf, 200, 0, &[2u8; 200]).unwrap();
        assert_eq!((s0, s1), (0, 1));
        let free_before = contiguous_free(&buf);

        write_entry(&mut buf, 0, &SlotEntry { total_size: 0, offset: 0, length: 0, page_count: 0 });
        assert_eq!(contiguous_free(&buf), free_before);
        assert!(logical_free(&buf) > free_before);

        compact_in_place(&mut buf);
        assert_eq!(contiguous_free(&buf), logical_free(&buf));
        let entry = entry_at(&buf, 1);
        assert_eq!(entry.length, 200);
        let at = entry.offset as usize;
        assert!(buf[at..at + 200].iter().all(|&b| b == 2));
    }

    #[test]
    fn tombstoned_slots_are_reused() {
        let mut buf = vec![0u8; 1024];
        init_slotted(&mut buf);
        let _ = place_block(&mut buf, 50, 0, &[1u8; 50]).unwrap();
        let _ = place_block(&mut buf, 50, 0, &[2u8; 50]).unwrap();
        write_entry(&mut buf, 0, &SlotEntry { total_size: 0, offset: 0, length: 0, page_count: 0 });
        let slot = place_block(&mut buf, 30, 0, &[3u8; 30]).unwrap();
        assert_eq!(slot, 0);
        assert_eq!(slot_count(&buf), 2);
    }

    #[test]
    fn exact_fill_then_overflow_rejection() {
        let mut buf = vec![0u8; 1024];
        init_slotted(&mut buf);
        let cap = 1024 - PAGE_HEADER_LEN - SLOT_ENTRY_LEN;
        assert!(place_block(&mut buf, cap as u32, 0, &vec![7u8; cap]).is_some());
        assert_eq!(contiguous_free(&buf), 0);
        assert!(place_block(&mut buf, 1, 0, &[7u8]).is_none());
    }
}
