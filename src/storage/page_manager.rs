//! Page allocation: header, allocation bitmap (one bit per page), and
//! free-space map (two bits per page). Regions are contiguous and relocate
//! to the end of the file when their capacity is exhausted.

use std::sync::Arc;

use log::{debug, info};
use parking_lot::Mutex;

use crate::errors::{DbError, DbResult};
use crate::storage::header::{DB_FORMAT_VERSION, DbHeader};
use crate::storage::page_io::PageIo;
use crate::types::{FreeLevel, PageId};

pub const INITIAL_CATALOG_PAGES: u32 = 2;

struct AllocState {
    header: DbHeader,
    bitmap: Vec<u8>,
    fsm: Vec<u8>,
}

impl AllocState {
    fn bit(&self, id: PageId) -> bool {
        let idx = id as usize;
        self.bitmap[idx / 8] & (1 << (idx % 8)) != 0
    }

    fn set_bit(&mut self, id: PageId, value: bool) {
        let idx = id as usize;
        if value {
            self.bitmap[idx / 8] |= 1 << (idx % 8);
        } else {
            self.bitmap[idx / 8] &= !(1 << (idx % 8));
        }
    }

    fn fsm_level(&self, id: PageId) -> FreeLevel {
        let idx = id as usize;
        FreeLevel::from_bits(self.fsm[idx / 4] >> ((idx % 4) * 2))
    }

    fn set_fsm_level(&mut self, id: PageId, level: FreeLevel) {
        let idx = id as usize;
        let shift = (idx % 4) * 2;
        self.fsm[idx / 4] = (self.fsm[idx / 4] & !(0b11 << shift)) | ((level as u8) << shift);
    }
}

pub struct PageManager {
    io: Arc<dyn PageIo>,
    expansion: u32,
    state: Mutex<AllocState>,
}

impl PageManager {
    /// Formats a fresh file: header page, one bitmap page, one FSM page, and
    /// the initial catalog region, then marks them allocated.
    ///
    /// # Errors
    /// Propagates I/O failures from the initial writes.
    pub fn format(io: Arc<dyn PageIo>, expansion: u32, use_mmap: bool) -> DbResult<Self> {
        let usable = io.usable_page_size() as usize;
        let structural = 1 + 1 + 1 + INITIAL_CATALOG_PAGES;
        let page_count = (structural + expansion).max(8);
        let header = DbHeader {
            version: DB_FORMAT_VERSION,
            page_size: io.page_size(),
            page_count,
            bitmap_start: 1,
            bitmap_count: 1,
            fsm_start: 2,
            fsm_count: 1,
            catalog_start: 3,
            catalog_count: INITIAL_CATALOG_PAGES,
            next_free_hint: structural,
            use_mmap,
        };
        io.set_len_pages(u64::from(page_count))?;
        let mut state =
            AllocState { header, bitmap: vec![0u8; usable], fsm: vec![0u8; usable] };
        for id in 0..structural {
            state.set_bit(id, true);
        }
        let manager = Self { io, expansion, state: Mutex::new(state) };
        {
            let state = manager.state.lock();
            manager.write_header(&state)?;
            manager.write_bitmap(&state)?;
            manager.write_fsm(&state)?;
            let zero = vec![0u8; usable];
            for i in 0..INITIAL_CATALOG_PAGES {
                manager.io.write_page(state.header.catalog_start + i, &zero)?;
            }
        }
        manager.io.flush()?;
        info!("formatted database file: {page_count} pages of {} bytes", manager.io.page_size());
        Ok(manager)
    }

    /// Loads the bitmap and FSM regions described by an existing header.
    ///
    /// # Errors
    /// Propagates read failures.
    pub fn open(io: Arc<dyn PageIo>, header: DbHeader, expansion: u32) -> DbResult<Self> {
        let usable = io.usable_page_size() as usize;
        let mut bitmap = vec![0u8; header.bitmap_count as usize * usable];
        let mut fsm = vec![0u8; header.fsm_count as usize * usable];
        for i in 0..header.bitmap_count {
            let start = i as usize * usable;
            io.read_page(header.bitmap_start + i, &mut bitmap[start..start + usable])?;
        }
        for i in 0..header.fsm_count {
            let start = i as usize * usable;
            io.read_page(header.fsm_start + i, &mut fsm[start..start + usable])?;
        }
        Ok(Self {
            io,
            expansion: expansion.max(1),
            state: Mutex::new(AllocState { header, bitmap, fsm }),
        })
    }

    #[must_use]
    pub fn header(&self) -> DbHeader {
        self.state.lock().header.clone()
    }

    #[must_use]
    pub fn page_count(&self) -> u32 {
        self.state.lock().header.page_count
    }

    #[must_use]
    pub fn is_allocated(&self, id: PageId) -> bool {
        let state = self.state.lock();
        id < state.header.page_count && state.bit(id)
    }

    #[must_use]
    pub fn fsm_level(&self, id: PageId) -> FreeLevel {
        self.state.lock().fsm_level(id)
    }

    /// Allocated page ids, ascending. Used by warmup and the verifier.
    #[must_use]
    pub fn allocated_pages(&self) -> Vec<PageId> {
        let state = self.state.lock();
        (0..state.header.page_count).filter(|&id| state.bit(id)).collect()
    }

    /// Allocated pages whose FSM level is at least `min`, ascending. The
    /// structural regions never advertise free space, so they are naturally
    /// excluded.
    #[must_use]
    pub fn fsm_candidates(&self, min: FreeLevel) -> Vec<PageId> {
        let state = self.state.lock();
        (0..state.header.page_count)
            .filter(|&id| state.bit(id) && state.fsm_level(id) >= min)
            .collect()
    }

    /// Allocates one page, consulting the bitmap at or after the hint and
    /// growing the file when the bitmap is full.
    ///
    /// # Errors
    /// `OutOfSpace` if growth cannot produce a free page.
    pub fn allocate(&self) -> DbResult<PageId> {
        let mut state = self.state.lock();
        for _ in 0..2 {
            if let Some(id) = Self::find_free(&state) {
                state.set_bit(id, true);
                state.set_fsm_level(id, FreeLevel::None);
                state.header.next_free_hint = id + 1;
                self.write_bitmap_page_for(&state, id)?;
                self.write_fsm_page_for(&state, id)?;
                self.write_header(&state)?;
                return Ok(id);
            }
            self.expand_locked(&mut state, self.expansion)?;
        }
        Err(DbError::OutOfSpace)
    }

    /// Allocates `n` contiguous pages (overflow runs, catalog copies).
    ///
    /// # Errors
    /// `NoContiguousPages` when no run exists even after growth.
    pub fn allocate_contiguous(&self, n: u32) -> DbResult<Vec<PageId>> {
        let mut state = self.state.lock();
        for _ in 0..2 {
            if let Some(start) = Self::find_free_run(&state, n) {
                for id in start..start + n {
                    state.set_bit(id, true);
                    state.set_fsm_level(id, FreeLevel::None);
                }
                state.header.next_free_hint = start + n;
                self.write_bitmap_range(&state, start, n)?;
                self.write_fsm_range(&state, start, n)?;
                self.write_header(&state)?;
                return Ok((start..start + n).collect());
            }
            self.expand_locked(&mut state, n.max(self.expansion))?;
        }
        Err(DbError::NoContiguousPages(n))
    }

    /// Marks a page free: bit cleared, FSM level High, hint lowered when
    /// beneficial.
    ///
    /// # Errors
    /// Propagates write failures of the touched region pages.
    pub fn free_page(&self, id: PageId) -> DbResult<()> {
        let mut state = self.state.lock();
        state.set_bit(id, false);
        state.set_fsm_level(id, FreeLevel::High);
        if id < state.header.next_free_hint {
            state.header.next_free_hint = id;
        }
        self.write_bitmap_page_for(&state, id)?;
        self.write_fsm_page_for(&state, id)?;
        self.write_header(&state)?;
        Ok(())
    }

    /// # Errors
    /// Propagates write failures of the touched FSM page.
    pub fn set_fsm(&self, id: PageId, level: FreeLevel) -> DbResult<()> {
        let mut state = self.state.lock();
        if state.fsm_level(id) == level {
            return Ok(());
        }
        state.set_fsm_level(id, level);
        self.write_fsm_page_for(&state, id)
    }

    /// Grows the catalog region by `additional` pages: in place when the
    /// pages immediately following the region are free, otherwise into a
    /// fresh contiguous run with the old contents copied over.
    ///
    /// Returns the (possibly new) region start and its new length.
    ///
    /// # Errors
    /// `CatalogGrowth` when no contiguous region can be obtained; this is
    /// fatal for the requesting operation, state is left unchanged.
    pub fn grow_catalog(&self, additional: u32) -> DbResult<(PageId, u32)> {
        let mut state = self.state.lock();
        let start = state.header.catalog_start;
        let count = state.header.catalog_count;
        let tail = start + count;

        let in_place_ok = tail + additional <= state.header.page_count
            && (tail..tail + additional).all(|id| !state.bit(id));
        if in_place_ok {
            for id in tail..tail + additional {
                state.set_bit(id, true);
                state.set_fsm_level(id, FreeLevel::None);
            }
            state.header.catalog_count += additional;
            self.write_bitmap_range(&state, tail, additional)?;
            self.write_fsm_range(&state, tail, additional)?;
            self.write_header(&state)?;
            debug!("catalog grown in place to {} pages", state.header.catalog_count);
            return Ok((start, state.header.catalog_count));
        }

        let needed = count + additional;
        let run = match Self::find_free_run(&state, needed) {
            Some(run) => Some(run),
            None => {
                self.expand_locked(&mut state, needed.max(self.expansion))
                    .map_err(|e| DbError::CatalogGrowth(e.to_string()))?;
                Self::find_free_run(&state, needed)
            }
        };
        let Some(new_start) = run else {
            return Err(DbError::CatalogGrowth(format!(
                "no contiguous run of {needed} pages for the catalog"
            )));
        };
        for id in new_start..new_start + needed {
            state.set_bit(id, true);
            state.set_fsm_level(id, FreeLevel::None);
        }
        // Copy the old region into the new one before freeing it.
        let usable = self.io.usable_page_size() as usize;
        let mut buf = vec![0u8; usable];
        for i in 0..count {
            self.io.read_page(start + i, &mut buf)?;
            self.io.write_page(new_start + i, &buf)?;
        }
        buf.iter_mut().for_each(|b| *b = 0);
        for i in count..needed {
            self.io.write_page(new_start + i, &buf)?;
        }
        for id in start..start + count {
            state.set_bit(id, false);
            state.set_fsm_level(id, FreeLevel::High);
        }
        state.header.catalog_start = new_start;
        state.header.catalog_count = needed;
        self.write_bitmap(&state)?;
        self.write_fsm(&state)?;
        self.write_header(&state)?;
        info!("catalog relocated to pages {new_start}..{}", new_start + needed);
        Ok((new_start, needed))
    }

    fn find_free(state: &AllocState) -> Option<PageId> {
        let count = state.header.page_count;
        let hint = state.header.next_free_hint.min(count);
        (hint..count).chain(0..hint).find(|&id| !state.bit(id))
    }

    fn find_free_run(state: &AllocState, n: u32) -> Option<PageId> {
        let count = state.header.page_count;
        let mut run_start = None;
        let mut run_len = 0;
        for id in 1..count {
            if state.bit(id) {
                run_start = None;
                run_len = 0;
            } else {
                if run_start.is_none() {
                    run_start = Some(id);
                }
                run_len += 1;
                if run_len == n {
                    return run_start;
                }
            }
        }
        None
    }

    /// Grows the file by at least `additional` pages. Prefers a plain
    /// `set_len` over logged writes; when the bitmap or FSM region can no
    /// longer describe the new page count, both regions relocate to the end
    /// of the file.
    fn expand_locked(&self, state: &mut AllocState, additional: u32) -> DbResult<()> {
        let usable = self.io.usable_page_size() as usize;
        let new_count = state.header.page_count + additional;
        let bitmap_fits = (new_count as usize).div_ceil(8) <= state.bitmap.len();
        let fsm_fits = (new_count as usize).div_ceil(4) <= state.fsm.len();
        if bitmap_fits && fsm_fits {
            self.io.set_len_pages(u64::from(new_count))?;
            state.header.page_count = new_count;
            self.write_header(state)?;
            return Ok(());
        }

        // Relocate both regions beyond the requested growth.
        let mut nb = state.header.bitmap_count;
        let mut nf = state.header.fsm_count;
        let mut final_count = new_count;
        for _ in 0..4 {
            final_count = new_count + nb + nf;
            nb = ((final_count as usize).div_ceil(8).div_ceil(usable)) as u32;
            nf = ((final_count as usize).div_ceil(4).div_ceil(usable)) as u32;
        }
        final_count = new_count + nb + nf;
        let new_bitmap_start = new_count;
        let new_fsm_start = new_count + nb;
        self.io.set_len_pages(u64::from(final_count))?;

        let mut bitmap = vec![0u8; nb as usize * usable];
        bitmap[..state.bitmap.len()].copy_from_slice(&state.bitmap);
        let mut fsm = vec![0u8; nf as usize * usable];
        fsm[..state.fsm.len()].copy_from_slice(&state.fsm);
        let old_bitmap = (state.header.bitmap_start, state.header.bitmap_count);
        let old_fsm = (state.header.fsm_start, state.header.fsm_count);

        state.bitmap = bitmap;
        state.fsm = fsm;
        state.header.page_count = final_count;
        state.header.bitmap_start = new_bitmap_start;
        state.header.bitmap_count = nb;
        state.header.fsm_start = new_fsm_start;
        state.header.fsm_count = nf;
        for id in new_bitmap_start..final_count {
            state.set_bit(id, true);
            state.set_fsm_level(id, FreeLevel::None);
        }
        for id in old_bitmap.0..old_bitmap.0 + old_bitmap.1 {
            state.set_bit(id, false);
            state.set_fsm_level(id, FreeLevel::High);
        }
        for id in old_fsm.0..old_fsm.0 + old_fsm.1 {
            state.set_bit(id, false);
            state.set_fsm_level(id, FreeLevel::High);
        }
        self.write_bitmap(state)?;
        self.write_fsm(state)?;
        self.write_header(state)?;
        info!(
            "bitmap/FSM relocated: bitmap at {new_bitmap_start} x{nb}, fsm at {new_fsm_start} x{nf}, {final_count} pages"
        );
        Ok(())
    }

    fn write_header(&self, state: &AllocState) -> DbResult<()> {
        let usable = self.io.usable_page_size() as usize;
        let mut buf = vec![0u8; usable];
        state.header.encode_into(&mut buf);
        self.io.write_page(0, &buf)
    }

    fn write_bitmap(&self, state: &AllocState) -> DbResult<()> {
        let usable = self.io.usable_page_size() as usize;
        for i in 0..state.header.bitmap_count {
            let start = i as usize * usable;
            self.io.write_page(state.header.bitmap_start + i, &state.bitmap[start..start + usable])?;
        }
        Ok(())
    }

    fn write_fsm(&self, state: &AllocState) -> DbResult<()> {
        let usable = self.io.usable_page_size() as usize;
        for i in 0..state.header.fsm_count {
            let start = i as usize * usable;
            self.io.write_page(state.header.fsm_start + i, &state.fsm[start..start + usable])?;
        }
        Ok(())
    }

    fn write_bitmap_page_for(&self, state: &AllocState, id: PageId) -> DbResult<()> {
        let usable = self.io.usable_page_size() as usize;
        let region_index = (id as usize / 8) / usable;
        let start = region_index * usable;
        self.io.write_page(
            state.header.bitmap_start + region_index as u32,
            &state.bitmap[start..start + usable],
        )
    }

    fn write_fsm_page_for(&self, state: &AllocState, id: PageId) -> DbResult<()> {
        let usable = self.io.usable_page_size() as usize;
        let region_index = (id as usize / 4) / usable;
        let start = region_index * usable;
        self.io.write_page(
            state.header.fsm_start + region_index as u32,
            &state.fsm[start..start + usable],
        )
    }

    fn write_bitmap_range(&self, state: &AllocState, start: PageId, n: u32) -> DbResult<()> {
        let usable = self.io.usable_page_size() as usize;
        let first = (start as usize / 8) / usable;
        let last = ((start + n - 1) as usize / 8) / usable;
        for region_index in first..=last {
            let offset = region_index * usable;
            self.io.write_page(
                state.header.bitmap_start + region_index as u32,
                &state.bitmap[offset..offset + usable],
            )?;
        }
        Ok(())
    }

    fn write_fsm_range(&self, state: &AllocState, start: PageId, n: u32) -> DbResult<()> {
        let usable = self.io.usable_page_size() as usize;
        let first = (start as usize / 4) / usable;
        let last = ((start + n - 1) as usize / 4) / usable;
        for region_index in first..=last {
            let offset = region_index * usable;
            self.io.write_page(
                state.header.fsm_start + region_index as u32,
                &state.fsm[offset..offset + usable],
            )?;
        }
        Ok(())
    }
}
