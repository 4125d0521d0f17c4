//! Transactions: snapshot capture, a buffered write set with
//! read-your-own-writes, staged secondary-index ops, and the commit/abort
//! entry points. The page-level write phase runs at commit inside the
//! database's commit pipeline.

use std::collections::HashMap;
use std::sync::Arc;

use crate::btree::secondary::{NULL_KEY, composite_key};
use crate::catalog::{CollectionHandle, IndexDefinition};
use crate::db::DbInner;
use crate::errors::{DbError, DbResult};
use crate::mvcc::ChainLookup;
use crate::types::{CancelToken, DocId, DocumentLocation, IndexValue, Snapshot, TxId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WriteKind {
    Insert,
    Replace,
    Delete,
}

pub(crate) struct WriteOp {
    pub collection: String,
    pub doc_id: DocId,
    pub kind: WriteKind,
    pub bytes: Option<Vec<u8>>,
    pub new_fields: Option<HashMap<String, IndexValue>>,
    /// `created_by` of the committed head observed when staging; 0 for
    /// base-file documents.
    pub expected_head: TxId,
    pub expects_existing: bool,
    pub old_location: Option<DocumentLocation>,
}

/// Field bytes of one index for a document, fields missing from the extract
/// encode as null.
pub(crate) fn index_field_bytes(
    def: &IndexDefinition,
    fields: &HashMap<String, IndexValue>,
) -> Vec<u8> {
    let mut out = Vec::new();
    for field in &def.fields {
        fields.get(&field.name).unwrap_or(&IndexValue::Null).encode_into(&mut out);
    }
    out
}

pub struct Transaction {
    pub(crate) db: Arc<DbInner>,
    pub(crate) id: TxId,
    pub(crate) snapshot: Snapshot,
    pub(crate) read_only: bool,
    pub(crate) open: bool,
    pub(crate) ops: Vec<WriteOp>,
    /// `(collection, index name)` pairs with staged pending ops, for abort
    /// cleanup and commit flushing.
    pub(crate) touched_indexes: Vec<(String, String)>,
    pub(crate) cancel: CancelToken,
}

impl Transaction {
    #[must_use]
    pub fn id(&self) -> TxId {
        self.id
    }

    #[must_use]
    pub fn snapshot(&self) -> &Snapshot {
        &self.snapshot
    }

    #[must_use]
    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    #[must_use]
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    fn check_writable(&self) -> DbResult<()> {
        if !self.open {
            return Err(DbError::TransactionClosed);
        }
        if self.read_only {
            return Err(DbError::ReadOnlyTransaction);
        }
        Ok(())
    }

    fn own_op_index(&self, collection: &str, doc_id: DocId) -> Option<usize> {
        self.ops.iter().position(|op| op.collection == collection && op.doc_id == doc_id)
    }

    fn touch_index(&mut self, collection: &str, index: &str) {
        let key = (collection.to_string(), index.to_string());
        if !self.touched_indexes.contains(&key) {
            self.touched_indexes.push(key);
        }
    }

    /// Resolves the committed version this snapshot sees, bypassing the
    /// write set: `(created_by, location)`.
    fn resolve_committed(
        &self,
        handle: &CollectionHandle,
        doc_id: DocId,
    ) -> DbResult<Option<(TxId, DocumentLocation)>> {
        match self.db.versions.get_visible(&handle.name, doc_id, &self.snapshot) {
            ChainLookup::Visible(version) => Ok(Some((version.created_by, version.location))),
            ChainLookup::Invisible => Ok(None),
            ChainLookup::Absent => {
                let root = *handle.primary_root.read();
                Ok(self.db.primary.search(root, doc_id)?.map(|loc| (0, loc)))
            }
        }
    }

    /// Stages secondary-index mutations for a fresh document value, with the
    /// unique pre-check (the definitive check re-runs at commit under the
    /// serialization lock).
    fn stage_index_inserts(
        &mut self,
        handle: &CollectionHandle,
        doc_id: DocId,
        fields: &HashMap<String, IndexValue>,
    ) -> DbResult<()> {
        let indexes: Vec<_> = handle.indexes.read().values().cloned().collect();
        for index in indexes {
            let def = index.def.read().clone();
            let field_bytes = index_field_bytes(&def, fields);
            if def.unique
                && field_bytes != NULL_KEY
                && index.tree.contains_field(
                    index.root(),
                    Some(self.id),
                    &field_bytes,
                    Some(doc_id),
                )?
            {
                return Err(DbError::UniqueViolation {
                    collection: handle.name.clone(),
                    index: def.name(),
                });
            }
            index.tree.stage_insert(index.root(), self.id, composite_key(&field_bytes, doc_id))?;
            self.touch_index(&handle.name, &def.name());
        }
        Ok(())
    }

    fn stage_index_deletes(
        &mut self,
        handle: &CollectionHandle,
        doc_id: DocId,
        fields: &HashMap<String, IndexValue>,
    ) -> DbResult<()> {
        let indexes: Vec<_> = handle.indexes.read().values().cloned().collect();
        for index in indexes {
            let def = index.def.read().clone();
            let field_bytes = index_field_bytes(&def, fields);
            index.tree.stage_delete(index.root(), self.id, composite_key(&field_bytes, doc_id))?;
            self.touch_index(&handle.name, &def.name());
        }
        Ok(())
    }

    /// Inserts an encoded document and returns its assigned id.
    ///
    /// # Errors
    /// `NoSuchCollection`, `UniqueViolation`, and storage failures.
    pub fn insert(
        &mut self,
        collection: &str,
        bytes: &[u8],
        fields: &HashMap<String, IndexValue>,
    ) -> DbResult<DocId> {
        self.check_writable()?;
        let handle = self.db.catalog.require(collection)?;
        let doc_id = handle.next_doc_id.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        self.stage_index_inserts(&handle, doc_id, fields)?;
        self.ops.push(WriteOp {
            collection: collection.to_string(),
            doc_id,
            kind: WriteKind::Insert,
            bytes: Some(bytes.to_vec()),
            new_fields: Some(fields.clone()),
            expected_head: 0,
            expects_existing: false,
            old_location: None,
        });
        Ok(doc_id)
    }

    /// Replaces a document. `old_fields` must be the indexed extract of the
    /// currently visible value (the caller decoded it to produce the new
    /// one).
    ///
    /// # Errors
    /// `UniqueViolation` and storage failures; a missing document returns
    /// `Ok(false)`.
    pub fn replace(
        &mut self,
        collection: &str,
        doc_id: DocId,
        bytes: &[u8],
        new_fields: &HashMap<String, IndexValue>,
        old_fields: &HashMap<String, IndexValue>,
    ) -> DbResult<bool> {
        self.check_writable()?;
        let handle = self.db.catalog.require(collection)?;

        if let Some(at) = self.own_op_index(collection, doc_id) {
            if self.ops[at].kind == WriteKind::Delete {
                return Ok(false);
            }
            let prior_fields = self.ops[at].new_fields.clone().unwrap_or_default();
            self.stage_index_deletes(&handle, doc_id, &prior_fields)?;
            self.stage_index_inserts(&handle, doc_id, new_fields)?;
            let op = &mut self.ops[at];
            op.bytes = Some(bytes.to_vec());
            op.new_fields = Some(new_fields.clone());
            return Ok(true);
        }

        let Some((created_by, location)) = self.resolve_committed(&handle, doc_id)? else {
            return Ok(false);
        };
        self.stage_index_deletes(&handle, doc_id, old_fields)?;
        self.stage_index_inserts(&handle, doc_id, new_fields)?;
        self.ops.push(WriteOp {
            collection: collection.to_string(),
            doc_id,
            kind: WriteKind::Replace,
            bytes: Some(bytes.to_vec()),
            new_fields: Some(new_fields.clone()),
            expected_head: created_by,
            expects_existing: true,
            old_location: Some(location),
        });
        Ok(true)
    }

    /// Deletes a document by id.
    ///
    /// # Errors
    /// Storage failures; a missing document returns `Ok(false)`.
    pub fn delete(
        &mut self,
        collection: &str,
        doc_id: DocId,
        old_fields: &HashMap<String, IndexValue>,
    ) -> DbResult<bool> {
        self.check_writable()?;
        let handle = self.db.catalog.require(collection)?;

        if let Some(at) = self.own_op_index(collection, doc_id) {
            if self.ops[at].kind == WriteKind::Delete {
                return Ok(false);
            }
            let prior_fields = self.ops[at].new_fields.clone().unwrap_or_default();
            self.stage_index_deletes(&handle, doc_id, &prior_fields)?;
            if self.ops[at].kind == WriteKind::Insert {
                // Insert and delete cancel out inside one transaction.
                self.ops.remove(at);
            } else {
                let op = &mut self.ops[at];
                op.kind = WriteKind::Delete;
                op.bytes = None;
                op.new_fields = None;
            }
            return Ok(true);
        }

        let Some((created_by, location)) = self.resolve_committed(&handle, doc_id)? else {
            return Ok(false);
        };
        self.stage_index_deletes(&handle, doc_id, old_fields)?;
        self.ops.push(WriteOp {
            collection: collection.to_string(),
            doc_id,
            kind: WriteKind::Delete,
            bytes: None,
            new_fields: None,
            expected_head: created_by,
            expects_existing: true,
            old_location: Some(location),
        });
        Ok(true)
    }

    /// Reads a document as of this transaction's snapshot, seeing its own
    /// uncommitted writes first.
    ///
    /// # Errors
    /// Storage failures. A slot lost to a concurrent GC reads as absent.
    pub fn get(&self, collection: &str, doc_id: DocId) -> DbResult<Option<Vec<u8>>> {
        if !self.open {
            return Err(DbError::TransactionClosed);
        }
        let handle = self.db.catalog.require(collection)?;
        if let Some(at) = self.own_op_index(collection, doc_id) {
            return Ok(self.ops[at].bytes.clone());
        }
        let Some((_, location)) = self.resolve_committed(&handle, doc_id)? else {
            return Ok(None);
        };
        match self.db.docs.read(location, &self.cancel) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.is_slot_deleted() => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Range scan over doc ids, merged across the primary tree, the version
    /// chains (documents deleted since older snapshots), and this
    /// transaction's write set.
    ///
    /// # Errors
    /// Storage failures.
    pub fn scan_primary(
        &self,
        collection: &str,
        start: Option<DocId>,
        end: Option<DocId>,
        incl_start: bool,
        incl_end: bool,
    ) -> DbResult<Vec<(DocId, Vec<u8>)>> {
        if !self.open {
            return Err(DbError::TransactionClosed);
        }
        let handle = self.db.catalog.require(collection)?;
        let root = *handle.primary_root.read();
        let mut candidates: Vec<DocId> = self
            .db
            .primary
            .search_range(root, start, end, incl_start, incl_end)?
            .into_iter()
            .map(|(doc_id, _)| doc_id)
            .collect();
        let in_range = |doc_id: DocId| {
            let after = match start {
                None => true,
                Some(s) if incl_start => doc_id >= s,
                Some(s) => doc_id > s,
            };
            let before = match end {
                None => true,
                Some(e) if incl_end => doc_id <= e,
                Some(e) => doc_id < e,
            };
            after && before
        };
        for doc_id in self.db.versions.chain_doc_ids(collection) {
            if in_range(doc_id) {
                candidates.push(doc_id);
            }
        }
        for op in &self.ops {
            if op.collection == collection && in_range(op.doc_id) {
                candidates.push(op.doc_id);
            }
        }
        candidates.sort_unstable();
        candidates.dedup();

        let mut out = Vec::new();
        for doc_id in candidates {
            if let Some(bytes) = self.get(collection, doc_id)? {
                out.push((doc_id, bytes));
            }
        }
        Ok(out)
    }

    /// Documents whose indexed value starts with the given prefix.
    ///
    /// # Errors
    /// `NoSuchIndex` and storage failures.
    pub fn find_prefix(
        &self,
        collection: &str,
        index: &str,
        prefix: &IndexValue,
    ) -> DbResult<Vec<(DocId, Vec<u8>)>> {
        let handle = self.db.catalog.require(collection)?;
        let ix = handle.index(index).ok_or_else(|| DbError::NoSuchIndex(index.to_string()))?;
        let entries = ix.tree.scan_prefix(ix.root(), Some(self.id), &prefix.encode_prefix())?;
        self.materialize(collection, entries.into_iter().map(|(_, doc_id)| doc_id))
    }

    /// Documents whose indexed value equals the given values (in index field
    /// order).
    ///
    /// # Errors
    /// `NoSuchIndex` and storage failures.
    pub fn find_eq(
        &self,
        collection: &str,
        index: &str,
        values: &[IndexValue],
    ) -> DbResult<Vec<(DocId, Vec<u8>)>> {
        let handle = self.db.catalog.require(collection)?;
        let ix = handle.index(index).ok_or_else(|| DbError::NoSuchIndex(index.to_string()))?;
        let mut key = Vec::new();
        for value in values {
            value.encode_into(&mut key);
        }
        let entries = ix.tree.scan_prefix(ix.root(), Some(self.id), &key)?;
        let matching = entries
            .into_iter()
            .filter(|(full, _)| crate::btree::secondary::field_of(full) == key.as_slice())
            .map(|(_, doc_id)| doc_id);
        self.materialize(collection, matching)
    }

    /// Range query over an index's encoded field bytes.
    ///
    /// # Errors
    /// `NoSuchIndex` and storage failures.
    pub fn find_range(
        &self,
        collection: &str,
        index: &str,
        start: &[IndexValue],
        end: Option<&[IndexValue]>,
        incl_start: bool,
        incl_end: bool,
    ) -> DbResult<Vec<(DocId, Vec<u8>)>> {
        let handle = self.db.catalog.require(collection)?;
        let ix = handle.index(index).ok_or_else(|| DbError::NoSuchIndex(index.to_string()))?;
        let mut start_key = Vec::new();
        for value in start {
            value.encode_into(&mut start_key);
        }
        let end_key = end.map(|values| {
            let mut key = Vec::new();
            for value in values {
                value.encode_into(&mut key);
            }
            key
        });
        let entries = ix.tree.scan_range(
            ix.root(),
            Some(self.id),
            &start_key,
            end_key.as_deref(),
            incl_start,
            incl_end,
        )?;
        self.materialize(collection, entries.into_iter().map(|(_, doc_id)| doc_id))
    }

    /// Resolves candidate doc ids through snapshot visibility, dropping the
    /// invisible ones.
    fn materialize(
        &self,
        collection: &str,
        doc_ids: impl Iterator<Item = DocId>,
    ) -> DbResult<Vec<(DocId, Vec<u8>)>> {
        let mut seen = std::collections::HashSet::new();
        let mut out = Vec::new();
        for doc_id in doc_ids {
            if !seen.insert(doc_id) {
                continue;
            }
            if let Some(bytes) = self.get(collection, doc_id)? {
                out.push((doc_id, bytes));
            }
        }
        Ok(out)
    }

    /// Commits the transaction: validates versions, writes through the WAL
    /// under the commit serialization latch, publishes roots and versions.
    ///
    /// # Errors
    /// `VersionConflict` (retryable), `UniqueViolation`, and I/O failures;
    /// in every error case the transaction is fully rolled back.
    pub fn commit(mut self) -> DbResult<()> {
        let db = Arc::clone(&self.db);
        db.commit_tx(&mut self)
    }

    /// Discards the transaction's writes and staged index ops.
    ///
    /// # Errors
    /// None in practice; kept fallible for symmetry with commit.
    pub fn abort(mut self) -> DbResult<()> {
        let db = Arc::clone(&self.db);
        db.abort_tx(&mut self);
        Ok(())
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if self.open {
            let db = Arc::clone(&self.db);
            db.abort_tx(self);
        }
    }
}
