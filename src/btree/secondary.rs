//! Variable-length-key B+Tree for secondary indexes.
//!
//! Keys are composite: `field_bytes ‖ doc_id (big-endian u32)`, which keeps
//! entries unique even when field values repeat. Inserts and deletes are
//! recorded into a per-leaf pending list keyed by the owning transaction
//! instead of mutating the leaf synchronously; searches overlay the calling
//! transaction's pending ops on the physical leaf, and commit flushes a
//! transaction's ops under (page write latch -> pending-ops lock). Leaf
//! splits partition pending ops by the chosen split key. Deletes do not
//! rebalance at runtime; `rebalance` is an offline pass run by vacuum.

use std::collections::HashMap;
use std::sync::Arc;

use log::debug;
use parking_lot::Mutex;

use crate::errors::{DbError, DbResult};
use crate::pool::BufferPool;
use crate::storage::latch::PageLockManager;
use crate::storage::page_io::PageIo;
use crate::storage::page_manager::PageManager;
use crate::types::{DocId, NO_PAGE, PageId, TxId};

pub const PAGE_KIND_SECONDARY_LEAF: u8 = 5;
pub const PAGE_KIND_SECONDARY_INTERNAL: u8 = 6;

const NODE_HEADER_LEN: usize = 8;
/// Sizing assumption for `max_keys`: 64-byte average key plus its length
/// prefix and child pointer.
const AVG_ENTRY_LEN: usize = 70;

pub const MAX_TREE_DEPTH: usize = 32;

/// The encoded null value is the single byte 0x00; unique indexes exempt it
/// (NULL is never equal to NULL).
pub const NULL_KEY: [u8; 1] = [0x00];

#[must_use]
pub fn composite_key(field: &[u8], doc_id: DocId) -> Vec<u8> {
    let mut key = Vec::with_capacity(field.len() + 4);
    key.extend_from_slice(field);
    key.extend_from_slice(&(doc_id as u32).to_be_bytes());
    key
}

#[must_use]
pub fn doc_id_of(key: &[u8]) -> DocId {
    let at = key.len() - 4;
    u32::from_be_bytes(key[at..].try_into().expect("4 bytes")) as DocId
}

#[must_use]
pub fn field_of(key: &[u8]) -> &[u8] {
    &key[..key.len() - 4]
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeafOpKind {
    Insert,
    Delete,
}

#[derive(Debug, Clone)]
pub struct PendingLeafOp {
    pub tx_id: TxId,
    pub kind: LeafOpKind,
    pub key: Vec<u8>,
}

#[derive(Debug, Clone)]
struct SecNode {
    page_id: PageId,
    is_leaf: bool,
    keys: Vec<Vec<u8>>,
    children: Vec<PageId>,
    next_leaf: PageId,
}

impl SecNode {
    fn new_leaf(page_id: PageId) -> Self {
        Self { page_id, is_leaf: true, keys: Vec::new(), children: Vec::new(), next_leaf: NO_PAGE }
    }

    fn decode(page_id: PageId, buf: &[u8]) -> DbResult<Self> {
        let is_leaf = match buf[0] {
            PAGE_KIND_SECONDARY_LEAF => true,
            PAGE_KIND_SECONDARY_INTERNAL => false,
            other => {
                return Err(DbError::ChecksumMismatch(format!(
                    "page {page_id} is not a secondary tree node (kind {other})"
                )));
            }
        };
        let count = u16::from_le_bytes(buf[2..4].try_into().expect("2 bytes")) as usize;
        let next_leaf = PageId::from_le_bytes(buf[4..8].try_into().expect("4 bytes"));
        let mut keys = Vec::with_capacity(count);
        let mut children = Vec::new();
        let mut at = NODE_HEADER_LEN;
        if !is_leaf {
            children.push(PageId::from_le_bytes(buf[at..at + 4].try_into().expect("4 bytes")));
            at += 4;
        }
        for _ in 0..count {
            let len = u16::from_le_bytes(buf[at..at + 2].try_into().expect("2 bytes")) as usize;
            at += 2;
            keys.push(buf[at..at + len].to_vec());
            at += len;
            if !is_leaf {
                children.push(PageId::from_le_bytes(buf[at..at + 4].try_into().expect("4 bytes")));
                at += 4;
            }
        }
        Ok(Self { page_id, is_leaf, keys, children, next_leaf })
    }

    fn encoded_len(&self) -> usize {
        let keys: usize = self.keys.iter().map(|k| 2 + k.len()).sum();
        let children = if self.is_leaf { 0 } else { self.children.len() * 4 };
        NODE_HEADER_LEN + keys + children
    }

    fn encode_into(&self, buf: &mut [u8]) {
        buf.iter_mut().for_each(|b| *b = 0);
        buf[0] =
            if self.is_leaf { PAGE_KIND_SECONDARY_LEAF } else { PAGE_KIND_SECONDARY_INTERNAL };
        buf[2..4].copy_from_slice(&(self.keys.len() as u16).to_le_bytes());
        buf[4..8].copy_from_slice(&self.next_leaf.to_le_bytes());
        let mut at = NODE_HEADER_LEN;
        if !self.is_leaf {
            buf[at..at + 4].copy_from_slice(&self.children[0].to_le_bytes());
            at += 4;
        }
        for (i, key) in self.keys.iter().enumerate() {
            buf[at..at + 2].copy_from_slice(&(key.len() as u16).to_le_bytes());
            at += 2;
            buf[at..at + key.len()].copy_from_slice(key);
            at += key.len();
            if !self.is_leaf {
                buf[at..at + 4].copy_from_slice(&self.children[i + 1].to_le_bytes());
                at += 4;
            }
        }
    }

    fn child_index(&self, key: &[u8]) -> usize {
        self.keys.partition_point(|k| k.as_slice() <= key)
    }
}

enum InsertEffect {
    Done,
    Split { separator: Vec<u8>, right: PageId },
}

pub struct SecondaryTree {
    io: Arc<dyn PageIo>,
    pm: Arc<PageManager>,
    latches: Arc<PageLockManager>,
    pool: Arc<BufferPool>,
    pending: Mutex<HashMap<PageId, Vec<PendingLeafOp>>>,
}

impl SecondaryTree {
    #[must_use]
    pub fn new(
        io: Arc<dyn PageIo>,
        pm: Arc<PageManager>,
        latches: Arc<PageLockManager>,
        pool: Arc<BufferPool>,
    ) -> Self {
        Self { io, pm, latches, pool, pending: Mutex::new(HashMap::new()) }
    }

    fn usable(&self) -> usize {
        self.io.usable_page_size() as usize
    }

    /// Maximum keys per node, from the page size under the average-key
    /// assumption. Never below 4.
    #[must_use]
    pub fn max_keys(&self) -> usize {
        ((self.usable() - NODE_HEADER_LEN) / AVG_ENTRY_LEN).max(4)
    }

    fn max_key_len(&self) -> usize {
        self.usable() / 4
    }

    fn read_node(&self, page_id: PageId) -> DbResult<SecNode> {
        let _latch = self.latches.read(page_id);
        let mut buf = self.pool.rent();
        self.io.read_page(page_id, &mut buf)?;
        SecNode::decode(page_id, &buf)
    }

    fn write_node(&self, node: &SecNode) -> DbResult<()> {
        let _latch = self.latches.write(node.page_id);
        let mut buf = self.pool.rent();
        node.encode_into(&mut buf);
        self.io.write_page(node.page_id, &buf)
    }

    /// # Errors
    /// Allocation and write failures.
    pub fn create_root(&self) -> DbResult<PageId> {
        let page_id = self.pm.allocate()?;
        self.write_node(&SecNode::new_leaf(page_id))?;
        Ok(page_id)
    }

    fn find_leaf(&self, root: PageId, key: &[u8]) -> DbResult<PageId> {
        let mut node = self.read_node(root)?;
        for _ in 0..MAX_TREE_DEPTH {
            if node.is_leaf {
                return Ok(node.page_id);
            }
            node = self.read_node(node.children[node.child_index(key)])?;
        }
        Err(DbError::ChecksumMismatch("secondary tree deeper than the depth bound".into()))
    }

    /// Net pending delta for a leaf across all transactions; leaf fullness
    /// is evaluated on physical + pending.
    fn pending_net(&self, leaf: PageId) -> isize {
        self.pending.lock().get(&leaf).map_or(0, |ops| {
            ops.iter()
                .map(|op| match op.kind {
                    LeafOpKind::Insert => 1isize,
                    LeafOpKind::Delete => -1isize,
                })
                .sum()
        })
    }

    #[must_use]
    pub fn has_pending(&self) -> bool {
        !self.pending.lock().is_empty()
    }

    fn stage(&self, root: PageId, tx_id: TxId, kind: LeafOpKind, key: Vec<u8>) -> DbResult<()> {
        if key.len() > self.max_key_len() {
            return Err(DbError::Io(std::io::Error::other(format!(
                "index key of {} bytes exceeds the limit for this page size",
                key.len()
            ))));
        }
        let leaf = self.find_leaf(root, &key)?;
        let _latch = self.latches.read(leaf);
        self.pending.lock().entry(leaf).or_default().push(PendingLeafOp { tx_id, kind, key });
        Ok(())
    }

    /// Records an insert for `tx_id` without touching the leaf.
    ///
    /// # Errors
    /// Key-size and read failures.
    pub fn stage_insert(&self, root: PageId, tx_id: TxId, key: Vec<u8>) -> DbResult<()> {
        self.stage(root, tx_id, LeafOpKind::Insert, key)
    }

    /// Records a delete for `tx_id` without touching the leaf.
    ///
    /// # Errors
    /// Key-size and read failures.
    pub fn stage_delete(&self, root: PageId, tx_id: TxId, key: Vec<u8>) -> DbResult<()> {
        self.stage(root, tx_id, LeafOpKind::Delete, key)
    }

    /// Drops every pending op of an aborting transaction.
    pub fn discard_tx(&self, tx_id: TxId) {
        let mut pending = self.pending.lock();
        pending.retain(|_, ops| {
            ops.retain(|op| op.tx_id != tx_id);
            !ops.is_empty()
        });
    }

    /// Physical keys of a leaf with the given transaction's pending ops
    /// applied on top. Lock order: page latch, then pending-ops lock.
    fn leaf_view(&self, leaf: PageId, tx: Option<TxId>) -> DbResult<(Vec<Vec<u8>>, PageId)> {
        let _latch = self.latches.read(leaf);
        let node = {
            let mut buf = self.pool.rent();
            self.io.read_page(leaf, &mut buf)?;
            SecNode::decode(leaf, &buf)?
        };
        let mut keys = node.keys;
        if let Some(tx) = tx {
            let pending = self.pending.lock();
            if let Some(ops) = pending.get(&leaf) {
                for op in ops.iter().filter(|op| op.tx_id == tx) {
                    match op.kind {
                        LeafOpKind::Insert => {
                            if let Err(pos) = keys.binary_search(&op.key) {
                                keys.insert(pos, op.key.clone());
                            }
                        }
                        LeafOpKind::Delete => {
                            if let Ok(pos) = keys.binary_search(&op.key) {
                                keys.remove(pos);
                            }
                        }
                    }
                }
            }
        }
        Ok((keys, node.next_leaf))
    }

    /// Scans entries whose key starts with `prefix`, breaking as soon as the
    /// scan crosses past it.
    ///
    /// # Errors
    /// Read failures.
    pub fn scan_prefix(
        &self,
        root: PageId,
        tx: Option<TxId>,
        prefix: &[u8],
    ) -> DbResult<Vec<(Vec<u8>, DocId)>> {
        let mut out = Vec::new();
        let mut leaf = self.find_leaf(root, prefix)?;
        loop {
            let (keys, next) = self.leaf_view(leaf, tx)?;
            for key in keys {
                if key.as_slice() < prefix {
                    continue;
                }
                if !key.starts_with(prefix) {
                    return Ok(out);
                }
                let doc_id = doc_id_of(&key);
                out.push((key, doc_id));
            }
            if next == NO_PAGE {
                return Ok(out);
            }
            leaf = next;
        }
    }

    /// Range scan over composite keys.
    ///
    /// # Errors
    /// Read failures.
    pub fn scan_range(
        &self,
        root: PageId,
        tx: Option<TxId>,
        start: &[u8],
        end: Option<&[u8]>,
        incl_start: bool,
        incl_end: bool,
    ) -> DbResult<Vec<(Vec<u8>, DocId)>> {
        let mut out = Vec::new();
        let mut leaf = self.find_leaf(root, start)?;
        loop {
            let (keys, next) = self.leaf_view(leaf, tx)?;
            for key in keys {
                let field = field_of(&key);
                let after_start = if incl_start { field >= start } else { field > start };
                if !after_start {
                    continue;
                }
                if let Some(end) = end {
                    let before_end = if incl_end { field <= end } else { field < end };
                    if !before_end {
                        return Ok(out);
                    }
                }
                let doc_id = doc_id_of(&key);
                out.push((key, doc_id));
            }
            if next == NO_PAGE {
                return Ok(out);
            }
            leaf = next;
        }
    }

    /// Whether any entry carries exactly `field` as its field bytes,
    /// excluding a document. Null-encoded keys are exempt from uniqueness.
    ///
    /// # Errors
    /// Read failures.
    pub fn contains_field(
        &self,
        root: PageId,
        tx: Option<TxId>,
        field: &[u8],
        exclude_doc: Option<DocId>,
    ) -> DbResult<bool> {
        if field == NULL_KEY {
            return Ok(false);
        }
        for (key, doc_id) in self.scan_prefix(root, tx, field)? {
            if field_of(&key) == field && Some(doc_id) != exclude_doc {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Applies the committing transaction's pending ops leaf by leaf. Ops
    /// are removed from a leaf's list under its page write latch and the
    /// pending-ops lock, in staging order, then applied through the shared
    /// descent (splits re-home other transactions' pending ops by the split
    /// key).
    ///
    /// # Errors
    /// I/O failures; the ops already removed are not restored (the caller
    /// discards the whole write phase on failure).
    pub fn flush_tx(&self, root: &mut PageId, tx_id: TxId) -> DbResult<()> {
        loop {
            let target = {
                let pending = self.pending.lock();
                pending
                    .iter()
                    .find(|(_, ops)| ops.iter().any(|op| op.tx_id == tx_id))
                    .map(|(leaf, _)| *leaf)
            };
            let Some(leaf) = target else { return Ok(()) };
            let ops: Vec<PendingLeafOp> = {
                let _latch = self.latches.write(leaf);
                let mut pending = self.pending.lock();
                let Some(list) = pending.get_mut(&leaf) else { continue };
                let mut mine = Vec::new();
                list.retain(|op| {
                    if op.tx_id == tx_id {
                        mine.push(op.clone());
                        false
                    } else {
                        true
                    }
                });
                if list.is_empty() {
                    pending.remove(&leaf);
                }
                mine
            };
            for op in ops {
                match op.kind {
                    LeafOpKind::Insert => self.insert_key(root, op.key)?,
                    LeafOpKind::Delete => {
                        let _ = self.delete_key(root, &op.key)?;
                    }
                }
            }
        }
    }

    /// Direct insert of a composite key (flush path and index backfill).
    ///
    /// # Errors
    /// Allocation and I/O failures.
    pub fn insert_key(&self, root: &mut PageId, key: Vec<u8>) -> DbResult<()> {
        match self.insert_rec(*root, key, 0)? {
            InsertEffect::Done => Ok(()),
            InsertEffect::Split { separator, right } => {
                let new_root_id = self.pm.allocate()?;
                let new_root = SecNode {
                    page_id: new_root_id,
                    is_leaf: false,
                    keys: vec![separator],
                    children: vec![*root, right],
                    next_leaf: NO_PAGE,
                };
                self.write_node(&new_root)?;
                *root = new_root_id;
                Ok(())
            }
        }
    }

    fn insert_rec(&self, page_id: PageId, key: Vec<u8>, depth: usize) -> DbResult<InsertEffect> {
        if depth >= MAX_TREE_DEPTH {
            return Err(DbError::ChecksumMismatch(
                "secondary tree deeper than the depth bound".into(),
            ));
        }
        let mut node = self.read_node(page_id)?;
        if node.is_leaf {
            match node.keys.binary_search(&key) {
                Ok(_) => return Ok(InsertEffect::Done),
                Err(pos) => node.keys.insert(pos, key),
            }
            let over_capacity = node.keys.len()
                + self.pending_net(node.page_id).max(0) as usize
                > self.max_keys()
                || node.encoded_len() > self.usable();
            if !over_capacity {
                self.write_node(&node)?;
                return Ok(InsertEffect::Done);
            }
            let mid = node.keys.len() / 2;
            let right_id = self.pm.allocate()?;
            let right = SecNode {
                page_id: right_id,
                is_leaf: true,
                keys: node.keys.split_off(mid),
                children: Vec::new(),
                next_leaf: node.next_leaf,
            };
            node.next_leaf = right_id;
            let separator = right.keys[0].clone();
            // Re-home pending ops split off to the new right leaf.
            {
                let mut pending = self.pending.lock();
                if let Some(ops) = pending.remove(&node.page_id) {
                    let (stay, moved): (Vec<_>, Vec<_>) =
                        ops.into_iter().partition(|op| op.key < separator);
                    if !stay.is_empty() {
                        pending.insert(node.page_id, stay);
                    }
                    if !moved.is_empty() {
                        pending.entry(right_id).or_default().extend(moved);
                    }
                }
            }
            self.write_node(&right)?;
            self.write_node(&node)?;
            return Ok(InsertEffect::Split { separator, right: right_id });
        }

        let idx = node.child_index(&key);
        match self.insert_rec(node.children[idx], key, depth + 1)? {
            InsertEffect::Done => Ok(InsertEffect::Done),
            InsertEffect::Split { separator, right } => {
                node.keys.insert(idx, separator);
                node.children.insert(idx + 1, right);
                if node.keys.len() <= self.max_keys() && node.encoded_len() <= self.usable() {
                    self.write_node(&node)?;
                    return Ok(InsertEffect::Done);
                }
                let mid = node.keys.len() / 2;
                let promoted = node.keys[mid].clone();
                let right_id = self.pm.allocate()?;
                let right = SecNode {
                    page_id: right_id,
                    is_leaf: false,
                    keys: node.keys.split_off(mid + 1),
                    children: node.children.split_off(mid + 1),
                    next_leaf: NO_PAGE,
                };
                node.keys.truncate(mid);
                self.write_node(&right)?;
                self.write_node(&node)?;
                Ok(InsertEffect::Split { separator: promoted, right: right_id })
            }
        }
    }

    /// Direct delete of a composite key. Leaves may go underfull; the
    /// offline rebalance pass cleans up.
    ///
    /// # Errors
    /// I/O failures.
    pub fn delete_key(&self, root: &mut PageId, key: &[u8]) -> DbResult<bool> {
        let leaf = self.find_leaf(*root, key)?;
        let mut node = self.read_node(leaf)?;
        match node.keys.binary_search_by(|k| k.as_slice().cmp(key)) {
            Ok(pos) => {
                node.keys.remove(pos);
                self.write_node(&node)?;
                Ok(true)
            }
            Err(_) => Ok(false),
        }
    }

    /// Every key in the tree, ascending.
    ///
    /// # Errors
    /// Read failures.
    pub fn all_entries(&self, root: PageId) -> DbResult<Vec<Vec<u8>>> {
        let mut out = Vec::new();
        let mut node = self.read_node(root)?;
        for _ in 0..MAX_TREE_DEPTH {
            if node.is_leaf {
                break;
            }
            node = self.read_node(node.children[0])?;
        }
        loop {
            out.extend(node.keys.iter().cloned());
            if node.next_leaf == NO_PAGE {
                return Ok(out);
            }
            node = self.read_node(node.next_leaf)?;
        }
    }

    /// Offline rebalance: bulk-rebuilds the tree when leaves have gone
    /// sparse from deletes. Only runs when no pending ops exist; returns
    /// whether a rebuild happened.
    ///
    /// # Errors
    /// I/O failures.
    pub fn rebalance(&self, root: &mut PageId) -> DbResult<bool> {
        if self.has_pending() {
            return Ok(false);
        }
        let mut leaves = 0usize;
        let mut node = self.read_node(*root)?;
        for _ in 0..MAX_TREE_DEPTH {
            if node.is_leaf {
                break;
            }
            node = self.read_node(node.children[0])?;
        }
        let mut keys: Vec<Vec<u8>> = Vec::new();
        loop {
            leaves += 1;
            keys.extend(node.keys.iter().cloned());
            if node.next_leaf == NO_PAGE {
                break;
            }
            node = self.read_node(node.next_leaf)?;
        }
        let target_fill = (self.max_keys() * 3 / 4).max(1);
        let needed = keys.len().div_ceil(target_fill).max(1);
        if leaves <= 1 || needed * 2 > leaves {
            return Ok(false);
        }
        debug!("rebuilding secondary tree: {leaves} leaves -> ~{needed}");
        let old_pages = self.pages(*root)?;
        *root = self.bulk_build(keys)?;
        for page in old_pages {
            self.pm.free_page(page)?;
        }
        Ok(true)
    }

    fn bulk_build(&self, keys: Vec<Vec<u8>>) -> DbResult<PageId> {
        let usable = self.usable();
        let target_fill = (self.max_keys() * 3 / 4).max(1);
        // Build leaves greedily, bounded by count and encoded size.
        let mut leaves: Vec<SecNode> = Vec::new();
        let mut current = SecNode::new_leaf(self.pm.allocate()?);
        let mut current_len = NODE_HEADER_LEN;
        for key in keys {
            let entry = 2 + key.len();
            if !current.keys.is_empty()
                && (current.keys.len() >= target_fill || current_len + entry > usable)
            {
                leaves.push(current);
                current = SecNode::new_leaf(self.pm.allocate()?);
                current_len = NODE_HEADER_LEN;
            }
            current_len += entry;
            current.keys.push(key);
        }
        leaves.push(current);
        for i in 0..leaves.len() - 1 {
            let next = leaves[i + 1].page_id;
            leaves[i].next_leaf = next;
        }
        for leaf in &leaves {
            self.write_node(leaf)?;
        }

        // Build internal levels until a single node remains.
        let mut level: Vec<(Vec<u8>, PageId)> = leaves
            .iter()
            .map(|leaf| (leaf.keys.first().cloned().unwrap_or_default(), leaf.page_id))
            .collect();
        while level.len() > 1 {
            let mut next_level = Vec::new();
            for group in level.chunks(self.max_keys() + 1) {
                let page_id = self.pm.allocate()?;
                let node = SecNode {
                    page_id,
                    is_leaf: false,
                    keys: group.iter().skip(1).map(|(k, _)| k.clone()).collect(),
                    children: group.iter().map(|(_, c)| *c).collect(),
                    next_leaf: NO_PAGE,
                };
                self.write_node(&node)?;
                next_level.push((group[0].0.clone(), page_id));
            }
            level = next_level;
        }
        Ok(level[0].1)
    }

    /// Every node page reachable from the root.
    ///
    /// # Errors
    /// Read failures.
    pub fn pages(&self, root: PageId) -> DbResult<Vec<PageId>> {
        let mut out = Vec::new();
        let mut stack = vec![root];
        while let Some(page_id) = stack.pop() {
            let node = self.read_node(page_id)?;
            out.push(page_id);
            if !node.is_leaf {
                stack.extend(node.children.iter().copied());
            }
        }
        Ok(out)
    }

    /// Frees every node page (drop index).
    ///
    /// # Errors
    /// Read and free failures.
    pub fn free_all(&self, root: PageId) -> DbResult<()> {
        for page_id in self.pages(root)? {
            self.pm.free_page(page_id)?;
        }
        Ok(())
    }
}
