//! Transaction identifiers, the active set, and snapshot capture.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::types::{Snapshot, TX_LIVE, TxId};

pub struct TransactionManager {
    next: AtomicU64,
    last_committed: AtomicU64,
    /// Active tx id -> the visibility floor of its snapshot: the smallest tx
    /// id whose effects the snapshot might still observe as live. Everything
    /// deleted strictly below the floor is invisible to it.
    active: Mutex<BTreeMap<TxId, TxId>>,
}

impl Default for TransactionManager {
    fn default() -> Self {
        Self::new()
    }
}

impl TransactionManager {
    #[must_use]
    pub fn new() -> Self {
        // Id 0 is the auto-commit id; user transactions start at 1.
        Self { next: AtomicU64::new(1), last_committed: AtomicU64::new(0), active: Mutex::new(BTreeMap::new()) }
    }

    /// Seeds the counters after WAL recovery: `last_committed` becomes the
    /// maximum committed tx id found in the log.
    pub fn seed_recovered(&self, max_committed: TxId) {
        self.last_committed.store(max_committed, Ordering::SeqCst);
        self.next.store(max_committed + 1, Ordering::SeqCst);
    }

    /// Allocates a tx id and captures its snapshot: everything committed so
    /// far, minus the transactions still active at this instant.
    #[must_use]
    pub fn begin(&self) -> (TxId, Snapshot) {
        let mut active = self.active.lock();
        let id = self.next.fetch_add(1, Ordering::SeqCst);
        let snapshot = Snapshot {
            high: self.last_committed.load(Ordering::SeqCst),
            active: active.keys().copied().collect(),
        };
        // The snapshot can see deletions by any excluded (still-active) tx
        // as undone, so its floor is capped by the smallest active id.
        let floor = active.keys().next().copied().unwrap_or(TxId::MAX).min(snapshot.high + 1);
        active.insert(id, floor);
        (id, snapshot)
    }

    /// Marks a transaction committed. Caller holds the commit serialization
    /// lock, so visibility publication and this update are one step.
    pub fn mark_committed(&self, id: TxId) {
        self.last_committed.fetch_max(id, Ordering::SeqCst);
    }

    /// Unregisters a transaction (commit or abort).
    pub fn end(&self, id: TxId) {
        self.active.lock().remove(&id);
    }

    #[must_use]
    pub fn last_committed(&self) -> TxId {
        self.last_committed.load(Ordering::SeqCst)
    }

    /// Infimum of the visibility floors of all active snapshots, or
    /// `TX_LIVE` when none are active. Versions deleted strictly below this
    /// are invisible to every current and future snapshot.
    #[must_use]
    pub fn oldest_active_snapshot(&self) -> TxId {
        self.active.lock().values().copied().min().unwrap_or(TX_LIVE)
    }

    #[must_use]
    pub fn active_count(&self) -> usize {
        self.active.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshots_capture_the_active_set() {
        let mgr = TransactionManager::new();
        let (t1, s1) = mgr.begin();
        assert!(s1.active.is_empty());
        let (_t2, s2) = mgr.begin();
        assert!(s2.active.contains(&t1));
        mgr.end(t1);
        let (_t3, s3) = mgr.begin();
        assert!(!s3.active.contains(&t1));
    }

    #[test]
    fn oldest_active_snapshot_is_the_infimum() {
        let mgr = TransactionManager::new();
        assert_eq!(mgr.oldest_active_snapshot(), TX_LIVE);
        let (t1, _) = mgr.begin();
        mgr.mark_committed(t1);
        mgr.end(t1);
        let (_t2, s2) = mgr.begin();
        assert_eq!(mgr.oldest_active_snapshot(), s2.high + 1);
    }

    #[test]
    fn recovery_seeds_the_counters() {
        let mgr = TransactionManager::new();
        mgr.seed_recovered(41);
        assert_eq!(mgr.last_committed(), 41);
        let (id, _) = mgr.begin();
        assert_eq!(id, 42);
    }
}
