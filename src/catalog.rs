//! Collections metadata: the in-memory map of collection handles and its
//! persistent form on the dedicated catalog pages.
//!
//! Entries are length-prefixed and concatenated behind a collection count.
//! Current entries start with a marker and version byte; legacy entries
//! (no marker) carry two 4-byte fields after the root page id — a document
//! count and a persisted next-id — which the compatibility decoder skips.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::AtomicI32;

use log::debug;
use parking_lot::RwLock;

use crate::btree::SecondaryTree;
use crate::errors::{DbError, DbResult};
use crate::pool::BufferPool;
use crate::storage::latch::PageLockManager;
use crate::storage::page_io::PageIo;
use crate::storage::page_manager::PageManager;
use crate::types::{FieldType, PageId};

const ENTRY_MARKER: u8 = 0xFF;
const ENTRY_VERSION: u8 = 1;

/// Collection names must stay below the entry marker to keep legacy entries
/// decodable.
pub const MAX_NAME_LEN: usize = 254;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexField {
    pub name: String,
    pub field_type: FieldType,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexDefinition {
    pub fields: Vec<IndexField>,
    pub root: PageId,
    pub unique: bool,
}

impl IndexDefinition {
    /// The index name is the underscore-joined concatenation of its field
    /// names; for single-field indexes it equals the field name.
    #[must_use]
    pub fn name(&self) -> String {
        self.fields.iter().map(|f| f.name.as_str()).collect::<Vec<_>>().join("_")
    }
}

/// Index shape requested through the DDL surface.
#[derive(Debug, Clone)]
pub struct IndexSpec {
    pub fields: Vec<IndexField>,
    pub unique: bool,
}

impl IndexSpec {
    #[must_use]
    pub fn name(&self) -> String {
        self.fields.iter().map(|f| f.name.as_str()).collect::<Vec<_>>().join("_")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectionEntry {
    pub name: String,
    pub primary_root: PageId,
    pub indexes: Vec<IndexDefinition>,
}

fn put_str(out: &mut Vec<u8>, s: &str) {
    out.extend_from_slice(&(s.len() as u16).to_le_bytes());
    out.extend_from_slice(s.as_bytes());
}

struct Reader<'a> {
    buf: &'a [u8],
    at: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> DbResult<&'a [u8]> {
        if self.at + n > self.buf.len() {
            return Err(DbError::InvalidHeader("truncated catalog entry".into()));
        }
        let out = &self.buf[self.at..self.at + n];
        self.at += n;
        Ok(out)
    }

    fn u8(&mut self) -> DbResult<u8> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> DbResult<u16> {
        Ok(u16::from_le_bytes(self.take(2)?.try_into().expect("2 bytes")))
    }

    fn u32(&mut self) -> DbResult<u32> {
        Ok(u32::from_le_bytes(self.take(4)?.try_into().expect("4 bytes")))
    }

    fn str(&mut self) -> DbResult<String> {
        let len = self.u16()? as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|_| DbError::InvalidHeader("catalog name is not UTF-8".into()))
    }
}

impl CollectionEntry {
    fn encode_into(&self, out: &mut Vec<u8>) {
        out.push(ENTRY_MARKER);
        out.push(ENTRY_VERSION);
        put_str(out, &self.name);
        out.extend_from_slice(&self.primary_root.to_le_bytes());
        out.push(self.indexes.len() as u8);
        for index in &self.indexes {
            out.push(u8::from(index.unique));
            out.extend_from_slice(&index.root.to_le_bytes());
            out.push(index.fields.len() as u8);
            for field in &index.fields {
                put_str(out, &field.name);
                out.push(field.field_type as u8);
            }
        }
    }

    fn decode(buf: &[u8]) -> DbResult<Self> {
        let mut r = Reader { buf, at: 0 };
        let legacy = buf.first() != Some(&ENTRY_MARKER);
        if !legacy {
            let _marker = r.u8()?;
            let version = r.u8()?;
            if version > ENTRY_VERSION {
                return Err(DbError::UnsupportedVersion(u32::from(version)));
            }
        }
        let name = r.str()?;
        let primary_root = r.u32()?;
        if legacy {
            // Older layouts persisted a document count and a next id here;
            // both are derivable and are dropped on the next rewrite.
            let _document_count = r.u32()?;
            let _next_id = r.u32()?;
        }
        let index_count = r.u8()?;
        let mut indexes = Vec::with_capacity(index_count as usize);
        for _ in 0..index_count {
            let unique = r.u8()? != 0;
            let root = r.u32()?;
            let field_count = r.u8()?;
            let mut fields = Vec::with_capacity(field_count as usize);
            for _ in 0..field_count {
                let fname = r.str()?;
                let tag = r.u8()?;
                let field_type = FieldType::from_tag(tag).ok_or_else(|| {
                    DbError::InvalidHeader(format!("unknown index field type tag {tag}"))
                })?;
                fields.push(IndexField { name: fname, field_type });
            }
            indexes.push(IndexDefinition { fields, root, unique });
        }
        Ok(Self { name, primary_root, indexes })
    }
}

/// Runtime state of one secondary index. The `def` lock doubles as the
/// tree's root lock: readers fetch the root in parallel, the committing
/// writer replaces it exclusively.
pub struct SecondaryIndex {
    pub def: RwLock<IndexDefinition>,
    pub tree: SecondaryTree,
}

impl SecondaryIndex {
    #[must_use]
    pub fn root(&self) -> PageId {
        self.def.read().root
    }

    #[must_use]
    pub fn is_unique(&self) -> bool {
        self.def.read().unique
    }
}

/// Runtime state of one collection. `primary_root` is the primary tree's
/// root lock: released by readers before they descend into page latches,
/// held for writing only at commit publication.
pub struct CollectionHandle {
    pub name: String,
    pub primary_root: RwLock<PageId>,
    /// Monotonic at runtime only; re-seeded from the primary tree on open.
    pub next_doc_id: AtomicI32,
    pub indexes: RwLock<HashMap<String, Arc<SecondaryIndex>>>,
}

impl CollectionHandle {
    #[must_use]
    pub fn index(&self, name: &str) -> Option<Arc<SecondaryIndex>> {
        self.indexes.read().get(name).cloned()
    }

    #[must_use]
    pub fn index_names(&self) -> Vec<String> {
        self.indexes.read().keys().cloned().collect()
    }

    fn to_entry(&self) -> CollectionEntry {
        let indexes = self.indexes.read().values().map(|ix| ix.def.read().clone()).collect();
        CollectionEntry {
            name: self.name.clone(),
            primary_root: *self.primary_root.read(),
            indexes,
        }
    }
}

/// Root replacements a committing transaction wants published: keyed by
/// `(collection, index name)`, where `None` addresses the primary tree.
pub type RootOverrides = HashMap<(String, Option<String>), PageId>;

pub struct Catalog {
    io: Arc<dyn PageIo>,
    pm: Arc<PageManager>,
    latches: Arc<PageLockManager>,
    pool: Arc<BufferPool>,
    collections: RwLock<HashMap<String, Arc<CollectionHandle>>>,
}

impl Catalog {
    #[must_use]
    pub fn new(
        io: Arc<dyn PageIo>,
        pm: Arc<PageManager>,
        latches: Arc<PageLockManager>,
        pool: Arc<BufferPool>,
    ) -> Self {
        Self { io, pm, latches, pool, collections: RwLock::new(HashMap::new()) }
    }

    fn make_handle(&self, entry: CollectionEntry) -> Arc<CollectionHandle> {
        let mut indexes = HashMap::new();
        for def in entry.indexes {
            let name = def.name();
            indexes.insert(
                name,
                Arc::new(SecondaryIndex {
                    def: RwLock::new(def),
                    tree: SecondaryTree::new(
                        Arc::clone(&self.io),
                        Arc::clone(&self.pm),
                        Arc::clone(&self.latches),
                        Arc::clone(&self.pool),
                    ),
                }),
            );
        }
        Arc::new(CollectionHandle {
            name: entry.name,
            primary_root: RwLock::new(entry.primary_root),
            next_doc_id: AtomicI32::new(1),
            indexes: RwLock::new(indexes),
        })
    }

    /// Builds a runtime index handle (used by DDL when adding an index).
    #[must_use]
    pub fn new_index(&self, def: IndexDefinition) -> Arc<SecondaryIndex> {
        Arc::new(SecondaryIndex {
            def: RwLock::new(def),
            tree: SecondaryTree::new(
                Arc::clone(&self.io),
                Arc::clone(&self.pm),
                Arc::clone(&self.latches),
                Arc::clone(&self.pool),
            ),
        })
    }

    /// Loads the catalog region into the in-memory map.
    ///
    /// # Errors
    /// `InvalidHeader` on undecodable entries.
    pub fn load(&self) -> DbResult<()> {
        let header = self.pm.header();
        let usable = self.io.usable_page_size() as usize;
        let mut bytes = vec![0u8; header.catalog_count as usize * usable];
        for i in 0..header.catalog_count {
            let start = i as usize * usable;
            self.io.read_page(header.catalog_start + i, &mut bytes[start..start + usable])?;
        }
        let mut r = Reader { buf: &bytes, at: 0 };
        let count = r.u32()?;
        let mut map = HashMap::new();
        for _ in 0..count {
            let len = r.u32()? as usize;
            let entry_bytes = r.take(len)?;
            let entry = CollectionEntry::decode(entry_bytes)?;
            debug!("loaded collection {:?} with {} indexes", entry.name, entry.indexes.len());
            map.insert(entry.name.clone(), self.make_handle(entry));
        }
        *self.collections.write() = map;
        Ok(())
    }

    /// Serializes every collection (with root overrides applied) onto the
    /// catalog pages, growing the region first when required.
    ///
    /// # Errors
    /// `CatalogGrowth` when the region cannot grow; I/O failures otherwise.
    pub fn persist(&self, overrides: &RootOverrides) -> DbResult<()> {
        let entries: Vec<CollectionEntry> = {
            let collections = self.collections.read();
            let mut entries: Vec<CollectionEntry> =
                collections.values().map(|h| h.to_entry()).collect();
            entries.sort_by(|a, b| a.name.cmp(&b.name));
            entries
        };
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&(entries.len() as u32).to_le_bytes());
        for mut entry in entries {
            if let Some(&root) = overrides.get(&(entry.name.clone(), None)) {
                entry.primary_root = root;
            }
            for index in &mut entry.indexes {
                if let Some(&root) = overrides.get(&(entry.name.clone(), Some(index.name()))) {
                    index.root = root;
                }
            }
            let mut body = Vec::new();
            entry.encode_into(&mut body);
            bytes.extend_from_slice(&(body.len() as u32).to_le_bytes());
            bytes.extend_from_slice(&body);
        }

        let usable = self.io.usable_page_size() as usize;
        let mut header = self.pm.header();
        let capacity = header.catalog_count as usize * usable;
        if bytes.len() > capacity {
            let additional = (bytes.len() - capacity).div_ceil(usable) as u32;
            let (start, count) = self.pm.grow_catalog(additional)?;
            header.catalog_start = start;
            header.catalog_count = count;
        }
        bytes.resize(header.catalog_count as usize * usable, 0);
        for i in 0..header.catalog_count {
            let start = i as usize * usable;
            self.io.write_page(header.catalog_start + i, &bytes[start..start + usable])?;
        }
        Ok(())
    }

    #[must_use]
    pub fn handle(&self, name: &str) -> Option<Arc<CollectionHandle>> {
        self.collections.read().get(name).cloned()
    }

    /// # Errors
    /// `NoSuchCollection` when absent.
    pub fn require(&self, name: &str) -> DbResult<Arc<CollectionHandle>> {
        self.handle(name).ok_or_else(|| DbError::NoSuchCollection(name.to_string()))
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.collections.read().contains_key(name)
    }

    #[must_use]
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.collections.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn insert_handle(&self, entry: CollectionEntry) -> Arc<CollectionHandle> {
        let handle = self.make_handle(entry);
        self.collections.write().insert(handle.name.clone(), Arc::clone(&handle));
        handle
    }

    pub fn remove(&self, name: &str) -> Option<Arc<CollectionHandle>> {
        self.collections.write().remove(name)
    }

    /// Puts a previously removed handle back (failed drop rollback).
    pub(crate) fn restore(&self, handle: Arc<CollectionHandle>) {
        self.collections.write().insert(handle.name.clone(), handle);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_round_trip() {
        let entry = CollectionEntry {
            name: "users".into(),
            primary_root: 9,
            indexes: vec![IndexDefinition {
                fields: vec![
                    IndexField { name: "last".into(), field_type: FieldType::String },
                    IndexField { name: "first".into(), field_type: FieldType::String },
                ],
                root: 11,
                unique: false,
            }],
        };
        let mut bytes = Vec::new();
        entry.encode_into(&mut bytes);
        let decoded = CollectionEntry::decode(&bytes).unwrap();
        assert_eq!(decoded, entry);
        assert_eq!(decoded.indexes[0].name(), "last_first");
    }

    #[test]
    fn legacy_entry_skips_count_and_next_id() {
        // Legacy layout: name, root, document_count, next_id, index count.
        let mut bytes = Vec::new();
        put_str(&mut bytes, "old");
        bytes.extend_from_slice(&7u32.to_le_bytes());
        bytes.extend_from_slice(&123u32.to_le_bytes());
        bytes.extend_from_slice(&456u32.to_le_bytes());
        bytes.push(0);
        let decoded = CollectionEntry::decode(&bytes).unwrap();
        assert_eq!(decoded.name, "old");
        assert_eq!(decoded.primary_root, 7);
        assert!(decoded.indexes.is_empty());
    }
}
