//! Version garbage collection: unlink versions no snapshot can see, then
//! drive the physical delete of their slots.

use log::debug;

use crate::errors::DbResult;
use crate::mvcc::tx_manager::TransactionManager;
use crate::mvcc::version_index::VersionIndex;
use crate::storage::document::DocumentStorage;
use crate::types::{TX_LIVE, TxId};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GcOutcome {
    pub versions_collected: u64,
    pub docs_deleted: u64,
}

/// Collection cutoff: the oldest active snapshot floor while transactions
/// run; when the engine is idle everything up to and including the last
/// committed tx is out of reach of any future snapshot.
#[must_use]
pub fn cutoff(tx_mgr: &TransactionManager) -> TxId {
    let oldest = tx_mgr.oldest_active_snapshot();
    if oldest == TX_LIVE { tx_mgr.last_committed() + 1 } else { oldest }
}

/// One collection pass. The caller wraps this in a short auto-committed
/// write so the tombstones are durable.
///
/// # Errors
/// Propagates physical-delete I/O failures.
pub fn collect(
    versions: &VersionIndex,
    docs: &DocumentStorage,
    cutoff: TxId,
) -> DbResult<GcOutcome> {
    let collected = versions.collect(cutoff);
    let mut outcome =
        GcOutcome { versions_collected: collected.len() as u64, docs_deleted: 0 };
    for (collection, doc_id, version) in collected {
        // The slot may already be gone (shared pages, repeated runs); that
        // is a graceful no-op.
        if docs.try_delete(version.location)? {
            outcome.docs_deleted += 1;
        }
        debug!("collected version of {collection}/{doc_id} at {:?}", version.location);
    }
    Ok(outcome)
}
