//! Int32-keyed B+Tree mapping `doc_id -> DocumentLocation`.
//!
//! Fixed order computed from the usable page size; leaves are chained
//! through `next_leaf` for range scans. Splits promote the middle key (the
//! middle key stays in the right leaf); deletes rebalance bottom-up through
//! borrow-left, borrow-right, merge-left, merge-right, in that order.

use std::sync::Arc;

use crate::errors::{DbError, DbResult};
use crate::pool::BufferPool;
use crate::storage::latch::PageLockManager;
use crate::storage::page_io::PageIo;
use crate::storage::page_manager::PageManager;
use crate::types::{DocId, DocumentLocation, NO_PAGE, PageId};

pub const PAGE_KIND_PRIMARY_LEAF: u8 = 3;
pub const PAGE_KIND_PRIMARY_INTERNAL: u8 = 4;

const NODE_HEADER_LEN: usize = 8;
const LEAF_ENTRY_LEN: usize = 12;

/// Path stacks are bounded; a deeper tree indicates corruption.
pub const MAX_TREE_DEPTH: usize = 32;

#[derive(Debug, Clone)]
struct Node {
    page_id: PageId,
    is_leaf: bool,
    keys: Vec<DocId>,
    locs: Vec<DocumentLocation>,
    children: Vec<PageId>,
    next_leaf: PageId,
}

impl Node {
    fn new_leaf(page_id: PageId) -> Self {
        Self {
            page_id,
            is_leaf: true,
            keys: Vec::new(),
            locs: Vec::new(),
            children: Vec::new(),
            next_leaf: NO_PAGE,
        }
    }

    fn decode(page_id: PageId, buf: &[u8]) -> DbResult<Self> {
        let is_leaf = match buf[0] {
            PAGE_KIND_PRIMARY_LEAF => true,
            PAGE_KIND_PRIMARY_INTERNAL => false,
            other => {
                return Err(DbError::ChecksumMismatch(format!(
                    "page {page_id} is not a primary tree node (kind {other})"
                )));
            }
        };
        let count = u16::from_le_bytes(buf[2..4].try_into().expect("2 bytes")) as usize;
        let next_leaf = PageId::from_le_bytes(buf[4..8].try_into().expect("4 bytes"));
        let mut keys = Vec::with_capacity(count);
        let mut locs = Vec::new();
        let mut children = Vec::new();
        let mut at = NODE_HEADER_LEN;
        if is_leaf {
            for _ in 0..count {
                keys.push(DocId::from_le_bytes(buf[at..at + 4].try_into().expect("4 bytes")));
                let page = PageId::from_le_bytes(buf[at + 4..at + 8].try_into().expect("4 bytes"));
                let slot = u32::from_le_bytes(buf[at + 8..at + 12].try_into().expect("4 bytes"));
                locs.push(DocumentLocation::new(page, slot as u16));
                at += LEAF_ENTRY_LEN;
            }
        } else {
            children.push(PageId::from_le_bytes(buf[at..at + 4].try_into().expect("4 bytes")));
            at += 4;
            for _ in 0..count {
                keys.push(DocId::from_le_bytes(buf[at..at + 4].try_into().expect("4 bytes")));
                children
                    .push(PageId::from_le_bytes(buf[at + 4..at + 8].try_into().expect("4 bytes")));
                at += 8;
            }
        }
        Ok(Self { page_id, is_leaf, keys, locs, children, next_leaf })
    }

    fn encode_into(&self, buf: &mut [u8]) {
        buf.iter_mut().for_each(|b| *b = 0);
        buf[0] = if self.is_leaf { PAGE_KIND_PRIMARY_LEAF } else { PAGE_KIND_PRIMARY_INTERNAL };
        buf[2..4].copy_from_slice(&(self.keys.len() as u16).to_le_bytes());
        buf[4..8].copy_from_slice(&self.next_leaf.to_le_bytes());
        let mut at = NODE_HEADER_LEN;
        if self.is_leaf {
            for (key, loc) in self.keys.iter().zip(&self.locs) {
                buf[at..at + 4].copy_from_slice(&key.to_le_bytes());
                buf[at + 4..at + 8].copy_from_slice(&loc.page_id.to_le_bytes());
                buf[at + 8..at + 12].copy_from_slice(&u32::from(loc.slot).to_le_bytes());
                at += LEAF_ENTRY_LEN;
            }
        } else {
            buf[at..at + 4].copy_from_slice(&self.children[0].to_le_bytes());
            at += 4;
            for (key, child) in self.keys.iter().zip(self.children.iter().skip(1)) {
                buf[at..at + 4].copy_from_slice(&key.to_le_bytes());
                buf[at + 4..at + 8].copy_from_slice(&child.to_le_bytes());
                at += 8;
            }
        }
    }

    /// Index of the child subtree covering `key`.
    fn child_index(&self, key: DocId) -> usize {
        self.keys.partition_point(|&k| k <= key)
    }
}

enum InsertEffect {
    Done,
    Split { separator: DocId, right: PageId },
}

pub struct PrimaryTree {
    io: Arc<dyn PageIo>,
    pm: Arc<PageManager>,
    latches: Arc<PageLockManager>,
    pool: Arc<BufferPool>,
}

impl PrimaryTree {
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

    /// B+Tree order (maximum children per internal node).
    #[must_use]
    pub fn order(&self) -> usize {
        ((self.usable() - NODE_HEADER_LEN) / LEAF_ENTRY_LEN + 1).max(3)
    }

    fn max_keys(&self) -> usize {
        self.order() - 1
    }

    fn min_keys(&self) -> usize {
        self.max_keys() / 2
    }

    fn read_node(&self, page_id: PageId) -> DbResult<Node> {
        let _latch = self.latches.read(page_id);
        let mut buf = self.pool.rent();
        self.io.read_page(page_id, &mut buf)?;
        Node::decode(page_id, &buf)
    }

    fn write_node(&self, node: &Node) -> DbResult<()> {
        let _latch = self.latches.write(node.page_id);
        let mut buf = self.pool.rent();
        node.encode_into(&mut buf);
        self.io.write_page(node.page_id, &buf)
    }

    /// Allocates an empty leaf to serve as a fresh root.
    ///
    /// # Errors
    /// Allocation and write failures.
    pub fn create_root(&self) -> DbResult<PageId> {
        let page_id = self.pm.allocate()?;
        self.write_node(&Node::new_leaf(page_id))?;
        Ok(page_id)
    }

    /// # Errors
    /// Read failures and structural corruption.
    pub fn search(&self, root: PageId, key: DocId) -> DbResult<Option<DocumentLocation>> {
        let mut node = self.read_node(root)?;
        for _ in 0..MAX_TREE_DEPTH {
            if node.is_leaf {
                return Ok(match node.keys.binary_search(&key) {
                    Ok(pos) => Some(node.locs[pos]),
                    Err(_) => None,
                });
            }
            node = self.read_node(node.children[node.child_index(key)])?;
        }
        Err(DbError::ChecksumMismatch("primary tree deeper than the depth bound".into()))
    }

    /// Inserts or replaces the location for a key. May replace the root.
    ///
    /// # Errors
    /// Allocation and I/O failures.
    pub fn insert(&self, root: &mut PageId, key: DocId, loc: DocumentLocation) -> DbResult<()> {
        match self.insert_rec(*root, key, loc, 0)? {
            InsertEffect::Done => Ok(()),
            InsertEffect::Split { separator, right } => {
                let new_root_id = self.pm.allocate()?;
                let new_root = Node {
                    page_id: new_root_id,
                    is_leaf: false,
                    keys: vec![separator],
                    locs: Vec::new(),
                    children: vec![*root, right],
                    next_leaf: NO_PAGE,
                };
                self.write_node(&new_root)?;
                *root = new_root_id;
                Ok(())
            }
        }
    }

    fn insert_rec(
        &self,
        page_id: PageId,
        key: DocId,
        loc: DocumentLocation,
        depth: usize,
    ) -> DbResult<InsertEffect> {
        if depth >= MAX_TREE_DEPTH {
            return Err(DbError::ChecksumMismatch(
                "primary tree deeper than the depth bound".into(),
            ));
        }
        let mut node = self.read_node(page_id)?;
        if node.is_leaf {
            match node.keys.binary_search(&key) {
                Ok(pos) => {
                    node.locs[pos] = loc;
                    self.write_node(&node)?;
                    return Ok(InsertEffect::Done);
                }
                Err(pos) => {
                    node.keys.insert(pos, key);
                    node.locs.insert(pos, loc);
                }
            }
            if node.keys.len() <= self.max_keys() {
                self.write_node(&node)?;
                return Ok(InsertEffect::Done);
            }
            // Leaf split keeps the middle key in the right node and promotes
            // a copy of it.
            let mid = node.keys.len() / 2;
            let right_id = self.pm.allocate()?;
            let right = Node {
                page_id: right_id,
                is_leaf: true,
                keys: node.keys.split_off(mid),
                locs: node.locs.split_off(mid),
                children: Vec::new(),
                next_leaf: node.next_leaf,
            };
            node.next_leaf = right_id;
            let separator = right.keys[0];
            self.write_node(&right)?;
            self.write_node(&node)?;
            return Ok(InsertEffect::Split { separator, right: right_id });
        }

        let idx = node.child_index(key);
        match self.insert_rec(node.children[idx], key, loc, depth + 1)? {
            InsertEffect::Done => Ok(InsertEffect::Done),
            InsertEffect::Split { separator, right } => {
                node.keys.insert(idx, separator);
                node.children.insert(idx + 1, right);
                if node.keys.len() <= self.max_keys() {
                    self.write_node(&node)?;
                    return Ok(InsertEffect::Done);
                }
                // Internal split moves the middle key up.
                let mid = node.keys.len() / 2;
                let promoted = node.keys[mid];
                let right_id = self.pm.allocate()?;
                let right = Node {
                    page_id: right_id,
                    is_leaf: false,
                    keys: node.keys.split_off(mid + 1),
                    locs: Vec::new(),
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

    /// Deletes a key, rebalancing bottom-up. Collapses the root when an
    /// internal root is left with zero keys and a single child.
    ///
    /// # Errors
    /// I/O failures; missing keys return `Ok(false)`.
    pub fn delete(&self, root: &mut PageId, key: DocId) -> DbResult<bool> {
        let mut path: Vec<(Node, usize)> = Vec::new();
        let mut node = self.read_node(*root)?;
        while !node.is_leaf {
            if path.len() >= MAX_TREE_DEPTH {
                return Err(DbError::ChecksumMismatch(
                    "primary tree deeper than the depth bound".into(),
                ));
            }
            let idx = node.child_index(key);
            let child = self.read_node(node.children[idx])?;
            path.push((node, idx));
            node = child;
        }
        let Ok(pos) = node.keys.binary_search(&key) else {
            return Ok(false);
        };
        node.keys.remove(pos);
        node.locs.remove(pos);
        self.write_node(&node)?;

        let mut current = node;
        while let Some((mut parent, idx)) = path.pop() {
            if current.keys.len() >= self.min_keys() {
                break;
            }
            self.rebalance_child(&mut parent, idx, current)?;
            self.write_node(&parent)?;
            current = parent;
        }

        // Root collapse: internal root, zero keys, one child.
        if path.is_empty() && !current.keys.is_empty() {
            return Ok(true);
        }
        let root_node = if current.page_id == *root { current } else { self.read_node(*root)? };
        if !root_node.is_leaf && root_node.keys.is_empty() && root_node.children.len() == 1 {
            let old = root_node.page_id;
            *root = root_node.children[0];
            self.pm.free_page(old)?;
        }
        Ok(true)
    }

    /// Restores the invariant for an underfull child at `parent.children[idx]`,
    /// preferring borrow-left, then borrow-right, then merge-left, then
    /// merge-right.
    fn rebalance_child(&self, parent: &mut Node, idx: usize, mut child: Node) -> DbResult<()> {
        let min = self.min_keys();
        if idx > 0 {
            let mut left = self.read_node(parent.children[idx - 1])?;
            if left.keys.len() > min {
                if child.is_leaf {
                    let key = left.keys.pop().expect("left sibling is non-empty");
                    let loc = left.locs.pop().expect("left sibling is non-empty");
                    child.keys.insert(0, key);
                    child.locs.insert(0, loc);
                    parent.keys[idx - 1] = child.keys[0];
                } else {
                    let sep = std::mem::replace(
                        &mut parent.keys[idx - 1],
                        left.keys.pop().expect("left sibling is non-empty"),
                    );
                    child.keys.insert(0, sep);
                    child
                        .children
                        .insert(0, left.children.pop().expect("left sibling has children"));
                }
                self.write_node(&left)?;
                self.write_node(&child)?;
                return Ok(());
            }
        }
        if idx + 1 < parent.children.len() {
            let mut right = self.read_node(parent.children[idx + 1])?;
            if right.keys.len() > min {
                if child.is_leaf {
                    child.keys.push(right.keys.remove(0));
                    child.locs.push(right.locs.remove(0));
                    parent.keys[idx] = right.keys[0];
                } else {
                    let sep = std::mem::replace(&mut parent.keys[idx], right.keys.remove(0));
                    child.keys.push(sep);
                    child.children.push(right.children.remove(0));
                }
                self.write_node(&right)?;
                self.write_node(&child)?;
                return Ok(());
            }
        }
        if idx > 0 {
            // Merge the child into its left sibling.
            let mut left = self.read_node(parent.children[idx - 1])?;
            if child.is_leaf {
                left.keys.append(&mut child.keys);
                left.locs.append(&mut child.locs);
                left.next_leaf = child.next_leaf;
            } else {
                left.keys.push(parent.keys[idx - 1]);
                left.keys.append(&mut child.keys);
                left.children.append(&mut child.children);
            }
            parent.keys.remove(idx - 1);
            parent.children.remove(idx);
            self.write_node(&left)?;
            self.pm.free_page(child.page_id)?;
            return Ok(());
        }
        // Merge the right sibling into the child.
        let mut right = self.read_node(parent.children[idx + 1])?;
        if child.is_leaf {
            child.keys.append(&mut right.keys);
            child.locs.append(&mut right.locs);
            child.next_leaf = right.next_leaf;
        } else {
            child.keys.push(parent.keys[idx]);
            child.keys.append(&mut right.keys);
            child.children.append(&mut right.children);
        }
        parent.keys.remove(idx);
        parent.children.remove(idx + 1);
        self.write_node(&child)?;
        self.pm.free_page(right.page_id)?;
        Ok(())
    }

    /// Range scan over the leaf chain.
    ///
    /// # Errors
    /// Read failures.
    pub fn search_range(
        &self,
        root: PageId,
        start: Option<DocId>,
        end: Option<DocId>,
        incl_start: bool,
        incl_end: bool,
    ) -> DbResult<Vec<(DocId, DocumentLocation)>> {
        let mut out = Vec::new();
        let mut node = self.read_node(root)?;
        for _ in 0..MAX_TREE_DEPTH {
            if node.is_leaf {
                break;
            }
            let idx = start.map_or(0, |s| node.child_index(s).min(node.children.len() - 1));
            node = self.read_node(node.children[idx])?;
        }
        loop {
            for (key, loc) in node.keys.iter().zip(&node.locs) {
                let after_start = match start {
                    None => true,
                    Some(s) if incl_start => *key >= s,
                    Some(s) => *key > s,
                };
                let before_end = match end {
                    None => true,
                    Some(e) if incl_end => *key <= e,
                    Some(e) => *key < e,
                };
                if !before_end {
                    return Ok(out);
                }
                if after_start {
                    out.push((*key, *loc));
                }
            }
            if node.next_leaf == NO_PAGE {
                return Ok(out);
            }
            node = self.read_node(node.next_leaf)?;
        }
    }

    /// # Errors
    /// Read failures.
    pub fn all_entries(&self, root: PageId) -> DbResult<Vec<(DocId, DocumentLocation)>> {
        self.search_range(root, None, None, true, true)
    }

    /// Largest key in the tree, used to re-seed the doc-id counter on open.
    ///
    /// # Errors
    /// Read failures.
    pub fn max_key(&self, root: PageId) -> DbResult<Option<DocId>> {
        let mut node = self.read_node(root)?;
        for _ in 0..MAX_TREE_DEPTH {
            if node.is_leaf {
                return Ok(node.keys.last().copied());
            }
            node = self.read_node(*node.children.last().expect("internal node has children"))?;
        }
        Err(DbError::ChecksumMismatch("primary tree deeper than the depth bound".into()))
    }

    /// Number of entries; derived by walking the leaves, never persisted.
    ///
    /// # Errors
    /// Read failures.
    pub fn count(&self, root: PageId) -> DbResult<u64> {
        let mut node = self.read_node(root)?;
        for _ in 0..MAX_TREE_DEPTH {
            if node.is_leaf {
                break;
            }
            node = self.read_node(node.children[0])?;
        }
        let mut total = node.keys.len() as u64;
        while node.next_leaf != NO_PAGE {
            node = self.read_node(node.next_leaf)?;
            total += node.keys.len() as u64;
        }
        Ok(total)
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

    /// Frees every node page of the tree (drop collection).
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
