//! Per-page reader/writer latches.
//!
//! Latches are handed out as owned guards so they can be collected and held
//! across helper calls. Multi-page acquisition always locks in ascending
//! page-id order, which (together with the latch hierarchy) prevents
//! deadlock.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::lock_api::{ArcRwLockReadGuard, ArcRwLockWriteGuard};
use parking_lot::{Mutex, RawRwLock, RwLock};

use crate::types::PageId;

const PRUNE_THRESHOLD: usize = 4096;

type Latch = Arc<RwLock<()>>;

pub struct PageReadGuard {
    pub page_id: PageId,
    _guard: ArcRwLockReadGuard<RawRwLock, ()>,
}

pub struct PageWriteGuard {
    pub page_id: PageId,
    _guard: ArcRwLockWriteGuard<RawRwLock, ()>,
}

#[derive(Default)]
pub struct PageLockManager {
    latches: Mutex<HashMap<PageId, Latch>>,
}

impl PageLockManager {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn latch_for(&self, id: PageId) -> Latch {
        let mut latches = self.latches.lock();
        if latches.len() > PRUNE_THRESHOLD {
            latches.retain(|_, l| Arc::strong_count(l) > 1);
        }
        Arc::clone(latches.entry(id).or_default())
    }

    #[must_use]
    pub fn read(&self, id: PageId) -> PageReadGuard {
        let latch = self.latch_for(id);
        PageReadGuard { page_id: id, _guard: latch.read_arc() }
    }

    #[must_use]
    pub fn write(&self, id: PageId) -> PageWriteGuard {
        let latch = self.latch_for(id);
        PageWriteGuard { page_id: id, _guard: latch.write_arc() }
    }

    /// Read-latches a set of pages in ascending id order.
    #[must_use]
    pub fn read_many(&self, ids: &[PageId]) -> Vec<PageReadGuard> {
        let mut sorted: Vec<PageId> = ids.to_vec();
        sorted.sort_unstable();
        sorted.dedup();
        sorted.into_iter().map(|id| self.read(id)).collect()
    }

    /// Write-latches a set of pages in ascending id order.
    #[must_use]
    pub fn write_many(&self, ids: &[PageId]) -> Vec<PageWriteGuard> {
        let mut sorted: Vec<PageId> = ids.to_vec();
        sorted.sort_unstable();
        sorted.dedup();
        sorted.into_iter().map(|id| self.write(id)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn readers_share_writers_exclude() {
        let mgr = PageLockManager::new();
        let r1 = mgr.read(5);
        let r2 = mgr.read(5);
        drop((r1, r2));
        let w = mgr.write(5);
        drop(w);
        let _r = mgr.read(5);
    }

    #[test]
    fn write_many_sorts_and_dedups() {
        let mgr = PageLockManager::new();
        let guards = mgr.write_many(&[9, 3, 3, 7]);
        let ids: Vec<PageId> = guards.iter().map(|g| g.page_id).collect();
        assert_eq!(ids, vec![3, 7, 9]);
    }
}
