//! Multi-version index: per `(collection, doc id)` newest-first version
//! chains, visibility, commit-time validation, and atomic publication.
//!
//! Documents that predate the engine's start have no chain; readers fall
//! back to the primary tree and treat them as created by tx 0. The first
//! write against such a document synthesizes its base version so deletion
//! and garbage collection compose.

use std::collections::HashMap;

use parking_lot::RwLock;

use crate::errors::{DbError, DbResult};
use crate::types::{DocId, DocumentLocation, Snapshot, TX_LIVE, TxId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DocumentVersion {
    pub created_by: TxId,
    pub deleted_by: TxId,
    pub location: DocumentLocation,
}

/// One write of a committing transaction, as the version index sees it.
#[derive(Debug, Clone)]
pub struct PublishOp {
    pub collection: String,
    pub doc_id: DocId,
    /// `created_by` of the head observed when the operation was staged;
    /// 0 for base-file documents without a chain.
    pub expected_head: TxId,
    /// Replace/delete expect a live head; inserts do not.
    pub expects_existing: bool,
    /// New head location; `None` marks a delete.
    pub new_location: Option<DocumentLocation>,
    /// Location observed at staging time, for synthesizing base versions.
    pub old_location: Option<DocumentLocation>,
}

pub enum ChainLookup {
    /// No chain exists; the primary tree is authoritative.
    Absent,
    /// A chain exists but no version is visible to the snapshot.
    Invisible,
    Visible(DocumentVersion),
}

#[derive(Default)]
pub struct VersionIndex {
    chains: RwLock<HashMap<(String, DocId), Vec<DocumentVersion>>>,
}

impl VersionIndex {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn head(&self, collection: &str, doc_id: DocId) -> Option<DocumentVersion> {
        self.chains
            .read()
            .get(&(collection.to_string(), doc_id))
            .and_then(|chain| chain.first().copied())
    }

    /// Newest-first traversal until a version visible to the snapshot is
    /// found.
    #[must_use]
    pub fn get_visible(&self, collection: &str, doc_id: DocId, snapshot: &Snapshot) -> ChainLookup {
        let chains = self.chains.read();
        let Some(chain) = chains.get(&(collection.to_string(), doc_id)) else {
            return ChainLookup::Absent;
        };
        for version in chain {
            if snapshot.version_visible(version.created_by, version.deleted_by) {
                return ChainLookup::Visible(*version);
            }
        }
        ChainLookup::Invisible
    }

    /// Doc ids of every chain in a collection (used to merge deleted-since
    /// documents into snapshot scans).
    #[must_use]
    pub fn chain_doc_ids(&self, collection: &str) -> Vec<DocId> {
        self.chains
            .read()
            .keys()
            .filter(|(coll, _)| coll == collection)
            .map(|(_, doc_id)| *doc_id)
            .collect()
    }

    /// Confirms that, for each op, the chain head at validation time still
    /// matches the head observed at staging time.
    ///
    /// # Errors
    /// `VersionConflict` (write-write/write-skew) for the first mismatching
    /// op.
    pub fn validate(&self, ops: &[PublishOp]) -> DbResult<()> {
        let chains = self.chains.read();
        for op in ops.iter().filter(|op| op.expects_existing) {
            let head = chains
                .get(&(op.collection.clone(), op.doc_id))
                .and_then(|chain| chain.first().copied());
            let ok = match head {
                Some(head) => head.created_by == op.expected_head && head.deleted_by == TX_LIVE,
                // No chain: only a base-file document qualifies, and it must
                // be the one we saw (created_by 0).
                None => op.expected_head == 0 && op.old_location.is_some(),
            };
            if !ok {
                return Err(DbError::VersionConflict {
                    collection: op.collection.clone(),
                    doc_id: op.doc_id,
                });
            }
        }
        Ok(())
    }

    /// Appends the validated ops as one atomic step (caller holds the commit
    /// serialization lock). New heads are linked and prior heads marked
    /// deleted by the committing transaction.
    pub fn add_versions(&self, tx_id: TxId, ops: &[PublishOp]) {
        let mut chains = self.chains.write();
        for op in ops {
            let key = (op.collection.clone(), op.doc_id);
            let chain = chains.entry(key).or_default();
            if chain.is_empty()
                && op.expects_existing
                && let Some(old) = op.old_location
            {
                chain.push(DocumentVersion { created_by: 0, deleted_by: TX_LIVE, location: old });
            }
            if let Some(head) = chain.first_mut()
                && head.deleted_by == TX_LIVE
            {
                head.deleted_by = tx_id;
            }
            match op.new_location {
                Some(location) => {
                    chain.insert(
                        0,
                        DocumentVersion { created_by: tx_id, deleted_by: TX_LIVE, location },
                    );
                }
                None => {
                    // Delete: the (possibly synthesized) head now carries the
                    // deleting tx; nothing new is linked.
                    if chain.is_empty() {
                        chains.remove(&(op.collection.clone(), op.doc_id));
                    }
                }
            }
        }
    }

    /// Unlinks every version no snapshot at or after `cutoff` can see and
    /// returns their locations for physical deletion. Chains left empty are
    /// removed.
    #[must_use]
    pub fn collect(&self, cutoff: TxId) -> Vec<(String, DocId, DocumentVersion)> {
        let mut chains = self.chains.write();
        let mut collected = Vec::new();
        chains.retain(|(coll, doc_id), chain| {
            chain.retain(|version| {
                let dead = version.deleted_by != TX_LIVE && version.deleted_by < cutoff;
                if dead {
                    collected.push((coll.clone(), *doc_id, *version));
                }
                !dead
            });
            !chain.is_empty()
        });
        collected
    }

    /// Every version chain of a collection, newest-first (vacuum and drop).
    #[must_use]
    pub fn chains_of(&self, collection: &str) -> Vec<(DocId, Vec<DocumentVersion>)> {
        self.chains
            .read()
            .iter()
            .filter(|((coll, _), _)| coll == collection)
            .map(|((_, doc_id), chain)| (*doc_id, chain.clone()))
            .collect()
    }

    pub fn forget_collection(&self, collection: &str) {
        self.chains.write().retain(|(coll, _), _| coll != collection);
    }

    #[must_use]
    pub fn chain_count(&self) -> usize {
        self.chains.read().len()
    }
}
