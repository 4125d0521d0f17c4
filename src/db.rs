//! The database facade: file lifecycle, the component stack, the commit
//! pipeline, DDL, maintenance (checkpoint, vacuum, compaction), and async
//! siblings of the public operations.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use log::{debug, info, warn};
use parking_lot::Mutex;

use crate::btree::secondary::{NULL_KEY, composite_key, doc_id_of};
use crate::btree::{PrimaryTree, SecondaryTree};
use crate::catalog::{
    Catalog, CollectionEntry, IndexDefinition, IndexField, IndexSpec, MAX_NAME_LEN, RootOverrides,
};
use crate::config::Options;
use crate::errors::{DbError, DbResult};
use crate::mvcc::gc::{self, GcOutcome};
use crate::mvcc::{PublishOp, TransactionManager, VersionIndex};
use crate::pool::BufferPool;
use crate::storage::header::DbHeader;
use crate::storage::page_io::{BasePageIo, CachedPageIo, PageIo};
use crate::storage::{DocumentStorage, PageLockManager, PageManager};
use crate::tx::{Transaction, WriteKind, index_field_bytes};
use crate::types::{
    AUTO_COMMIT_TX, CancelToken, DocId, IndexValue, PageId, TxId, VacuumStats,
};
use crate::wal::{TxPageIo, Wal};

/// The `extractIndexedFields` capability: the embedding application decodes
/// a stored document far enough to produce the value of one indexed field.
/// Only index backfill (`ensure_indexes` over existing documents) needs it.
pub trait FieldExtractor: Send + Sync {
    /// # Errors
    /// Implementations surface their own decode failures.
    fn extract(&self, doc: &[u8], field: &IndexField) -> DbResult<IndexValue>;
}

#[derive(Debug, Clone)]
pub struct CollectionInfo {
    pub name: String,
    pub document_count: u64,
    pub primary_root: PageId,
    pub indexes: Vec<IndexDefinition>,
}

fn wal_path_for(path: &Path) -> PathBuf {
    let mut os = path.as_os_str().to_owned();
    os.push(".wal");
    PathBuf::from(os)
}

pub(crate) struct DbInner {
    pub(crate) path: PathBuf,
    pub(crate) options: Options,
    /// The stack below the transaction overlay (cache or base); checkpoint
    /// and recovery apply frames here.
    pub(crate) below: Arc<dyn PageIo>,
    pub(crate) io: Arc<TxPageIo>,
    pub(crate) wal: Option<Arc<Wal>>,
    pub(crate) cache: Option<Arc<CachedPageIo>>,
    pub(crate) pm: Arc<PageManager>,
    pub(crate) latches: Arc<PageLockManager>,
    pub(crate) pool: Arc<BufferPool>,
    pub(crate) docs: DocumentStorage,
    pub(crate) primary: PrimaryTree,
    pub(crate) catalog: Catalog,
    pub(crate) versions: VersionIndex,
    pub(crate) tx_mgr: TransactionManager,
    /// Serializes version validation, the WAL write phase, and version
    /// publication. Nothing else mutates pages.
    pub(crate) commit_lock: Mutex<()>,
    /// Outermost lock: createCollection, dropCollection, dropIndex,
    /// ensureIndexes.
    pub(crate) ddl_lock: Mutex<()>,
    pub(crate) commits_since_gc: AtomicU64,
}

/// An embedded, single-file document database with snapshot isolation.
#[derive(Clone)]
pub struct Database {
    inner: Arc<DbInner>,
}

impl Database {
    /// Creates a new database file (and its WAL sibling when enabled).
    ///
    /// # Errors
    /// `FileExists` when the path is taken; validation and I/O errors.
    pub fn create(path: &Path, options: Options) -> DbResult<Self> {
        options.validate()?;
        let base = BasePageIo::create(
            path,
            options.page_size,
            options.encryption.as_ref(),
            options.use_mmap,
        )?;
        Self::assemble(path, options, Arc::new(base), true)
    }

    /// Opens an existing database. The stored page size wins over the
    /// configured one; recovery runs when the WAL file exists and is
    /// non-empty.
    ///
    /// # Errors
    /// `FileNotFound`, `InvalidPassword`, `EncryptionMismatch`,
    /// `InvalidHeader`, and I/O errors.
    pub fn open(path: &Path, options: Options) -> DbResult<Self> {
        options.validate()?;
        // The password check happens inside BasePageIo::open, before the WAL
        // is opened or created.
        let base =
            BasePageIo::open(path, options.encryption.as_ref(), options.use_mmap)?;
        Self::assemble(path, options, Arc::new(base), false)
    }

    /// # Errors
    /// As `open`/`create`.
    pub fn open_or_create(path: &Path, options: Options) -> DbResult<Self> {
        if path.exists() { Self::open(path, options) } else { Self::create(path, options) }
    }

    fn assemble(
        path: &Path,
        options: Options,
        base: Arc<BasePageIo>,
        fresh: bool,
    ) -> DbResult<Self> {
        let base_dyn: Arc<dyn PageIo> = base;
        let (below, cache): (Arc<dyn PageIo>, Option<Arc<CachedPageIo>>) =
            if options.page_cache_size > 0 {
                let cached =
                    Arc::new(CachedPageIo::new(Arc::clone(&base_dyn), options.page_cache_size));
                (Arc::clone(&cached) as Arc<dyn PageIo>, Some(cached))
            } else {
                (base_dyn, None)
            };
        let data_len = below.usable_page_size();

        // Recovery is required when the WAL file exists and is non-empty,
        // even if this open disables the WAL.
        let wal_path = wal_path_for(path);
        let mut recovered_tx: TxId = 0;
        let mut wal: Option<Arc<Wal>> = None;
        if !fresh && wal_path.exists() {
            let (existing, needs_recovery) = Wal::open(&wal_path, data_len)?;
            if needs_recovery {
                recovered_tx = existing.recover(below.as_ref())?;
            }
            if options.use_wal {
                wal = Some(Arc::new(existing));
            }
        }
        if options.use_wal && wal.is_none() {
            wal = Some(Arc::new(Wal::create(&wal_path, data_len)?));
        }

        let io = Arc::new(TxPageIo::new(Arc::clone(&below), wal.clone()));
        let io_dyn: Arc<dyn PageIo> = Arc::clone(&io) as Arc<dyn PageIo>;
        let pm = if fresh {
            Arc::new(PageManager::format(
                Arc::clone(&io_dyn),
                options.expansion_page_count,
                options.use_mmap,
            )?)
        } else {
            let usable = io_dyn.usable_page_size() as usize;
            let mut header_page = vec![0u8; usable];
            io_dyn.read_page(0, &mut header_page)?;
            let header = DbHeader::decode(&header_page)?;
            Arc::new(PageManager::open(
                Arc::clone(&io_dyn),
                header,
                options.expansion_page_count,
            )?)
        };
        let latches = Arc::new(PageLockManager::new());
        let pool = BufferPool::new(io_dyn.usable_page_size() as usize, 64);
        let docs = DocumentStorage::new(
            Arc::clone(&io_dyn),
            Arc::clone(&pm),
            Arc::clone(&latches),
            Arc::clone(&pool),
        );
        let primary = PrimaryTree::new(
            Arc::clone(&io_dyn),
            Arc::clone(&pm),
            Arc::clone(&latches),
            Arc::clone(&pool),
        );
        let catalog = Catalog::new(
            Arc::clone(&io_dyn),
            Arc::clone(&pm),
            Arc::clone(&latches),
            Arc::clone(&pool),
        );
        if fresh {
            catalog.persist(&RootOverrides::new())?;
            io_dyn.flush()?;
        } else {
            catalog.load()?;
        }

        let tx_mgr = TransactionManager::new();
        tx_mgr.seed_recovered(recovered_tx.max(wal.as_ref().map_or(0, |w| w.last_committed())));

        let inner = Arc::new(DbInner {
            path: path.to_path_buf(),
            options,
            below,
            io,
            wal,
            cache,
            pm,
            latches,
            pool,
            docs,
            primary,
            catalog,
            versions: VersionIndex::new(),
            tx_mgr,
            commit_lock: Mutex::new(()),
            ddl_lock: Mutex::new(()),
            commits_since_gc: AtomicU64::new(0),
        });

        // Re-seed the runtime doc-id counters from the primary trees.
        for name in inner.catalog.names() {
            let handle = inner.catalog.require(&name)?;
            let root = *handle.primary_root.read();
            if let Some(max) = inner.primary.max_key(root)? {
                handle.next_doc_id.store(max + 1, Ordering::SeqCst);
            }
        }

        if inner.options.warmup_on_open
            && let Some(cache) = &inner.cache
        {
            cache.warm(inner.pm.allocated_pages());
        }

        info!(
            "opened {} ({} pages of {}, wal={})",
            inner.path.display(),
            inner.pm.page_count(),
            inner.io.page_size(),
            inner.wal.is_some()
        );
        Ok(Self { inner })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    #[must_use]
    pub fn begin_transaction(&self) -> Transaction {
        self.begin_internal(false)
    }

    #[must_use]
    pub fn begin_read_only_transaction(&self) -> Transaction {
        self.begin_internal(true)
    }

    fn begin_internal(&self, read_only: bool) -> Transaction {
        let inner = Arc::clone(&self.inner);
        let (id, snapshot) = inner.tx_mgr.begin();
        if let Some(wal) = &inner.wal {
            wal.begin_snapshot();
        }
        Transaction {
            db: inner,
            id,
            snapshot,
            read_only,
            open: true,
            ops: Vec::new(),
            touched_indexes: Vec::new(),
            cancel: CancelToken::new(),
        }
    }

    // --- auto-commit CRUD ---

    /// # Errors
    /// As `Transaction::insert` plus commit errors.
    pub fn insert(
        &self,
        collection: &str,
        bytes: &[u8],
        fields: &HashMap<String, IndexValue>,
    ) -> DbResult<DocId> {
        let mut tx = self.begin_transaction();
        let doc_id = tx.insert(collection, bytes, fields)?;
        tx.commit()?;
        Ok(doc_id)
    }

    /// # Errors
    /// As `Transaction::replace` plus commit errors.
    pub fn replace(
        &self,
        collection: &str,
        doc_id: DocId,
        bytes: &[u8],
        new_fields: &HashMap<String, IndexValue>,
        old_fields: &HashMap<String, IndexValue>,
    ) -> DbResult<bool> {
        let mut tx = self.begin_transaction();
        let replaced = tx.replace(collection, doc_id, bytes, new_fields, old_fields)?;
        tx.commit()?;
        Ok(replaced)
    }

    /// # Errors
    /// As `Transaction::delete` plus commit errors.
    pub fn delete_by_id(
        &self,
        collection: &str,
        doc_id: DocId,
        old_fields: &HashMap<String, IndexValue>,
    ) -> DbResult<bool> {
        let mut tx = self.begin_transaction();
        let deleted = tx.delete(collection, doc_id, old_fields)?;
        tx.commit()?;
        Ok(deleted)
    }

    /// # Errors
    /// Storage failures.
    pub fn get_by_id(&self, collection: &str, doc_id: DocId) -> DbResult<Option<Vec<u8>>> {
        let tx = self.begin_read_only_transaction();
        let result = tx.get(collection, doc_id);
        let _ = tx.abort();
        result
    }

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
        let tx = self.begin_read_only_transaction();
        let result = tx.scan_primary(collection, start, end, incl_start, incl_end);
        let _ = tx.abort();
        result
    }

    /// # Errors
    /// `NoSuchIndex` and storage failures.
    pub fn find_prefix(
        &self,
        collection: &str,
        index: &str,
        prefix: &IndexValue,
    ) -> DbResult<Vec<(DocId, Vec<u8>)>> {
        let tx = self.begin_read_only_transaction();
        let result = tx.find_prefix(collection, index, prefix);
        let _ = tx.abort();
        result
    }

    /// # Errors
    /// `NoSuchIndex` and storage failures.
    pub fn find_eq(
        &self,
        collection: &str,
        index: &str,
        values: &[IndexValue],
    ) -> DbResult<Vec<(DocId, Vec<u8>)>> {
        let tx = self.begin_read_only_transaction();
        let result = tx.find_eq(collection, index, values);
        let _ = tx.abort();
        result
    }

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
        let tx = self.begin_read_only_transaction();
        let result = tx.find_range(collection, index, start, end, incl_start, incl_end);
        let _ = tx.abort();
        result
    }

    // --- DDL ---

    /// Creates a collection and (optionally) its indexes in one step.
    ///
    /// # Errors
    /// `CollectionExists`, growth and I/O errors.
    pub fn create_collection(&self, name: &str, indexes: &[IndexSpec]) -> DbResult<()> {
        if name.is_empty() || name.len() > MAX_NAME_LEN {
            return Err(DbError::InvalidHeader(format!(
                "collection name must be 1..={MAX_NAME_LEN} bytes"
            )));
        }
        let inner = &self.inner;
        let _ddl = inner.ddl_lock.lock();
        if inner.catalog.contains(name) {
            return Err(DbError::CollectionExists(name.to_string()));
        }
        let _guard = inner.commit_lock.lock();
        inner.io.begin_write(AUTO_COMMIT_TX)?;
        let result: DbResult<()> = (|| {
            let primary_root = inner.primary.create_root()?;
            let mut defs = Vec::with_capacity(indexes.len());
            for spec in indexes {
                let tree = inner.new_secondary_tree();
                let root = tree.create_root()?;
                defs.push(IndexDefinition {
                    fields: spec.fields.clone(),
                    root,
                    unique: spec.unique,
                });
            }
            let entry =
                CollectionEntry { name: name.to_string(), primary_root, indexes: defs };
            inner.catalog.insert_handle(entry);
            inner.catalog.persist(&RootOverrides::new())
        })();
        match result.and_then(|()| inner.io.commit_write()) {
            Ok(()) => {
                info!("created collection {name:?}");
                Ok(())
            }
            Err(e) => {
                inner.io.abort_write();
                inner.catalog.remove(name);
                Err(e)
            }
        }
    }

    /// Ensures the given indexes exist, backfilling from existing documents
    /// through the extractor capability when one is supplied.
    ///
    /// # Errors
    /// `NoSuchCollection`, `UniqueViolation` during backfill, I/O errors.
    pub fn ensure_indexes(
        &self,
        collection: &str,
        specs: &[IndexSpec],
        extractor: Option<&dyn FieldExtractor>,
    ) -> DbResult<()> {
        let inner = &self.inner;
        let _ddl = inner.ddl_lock.lock();
        let handle = inner.catalog.require(collection)?;
        let missing: Vec<&IndexSpec> =
            specs.iter().filter(|spec| handle.index(&spec.name()).is_none()).collect();
        if missing.is_empty() {
            return Ok(());
        }
        let _guard = inner.commit_lock.lock();
        inner.io.begin_write(AUTO_COMMIT_TX)?;
        let mut added: Vec<String> = Vec::new();
        let cancel = CancelToken::new();
        let result: DbResult<()> = (|| {
            for spec in &missing {
                let tree = inner.new_secondary_tree();
                let mut root = tree.create_root()?;
                let def = IndexDefinition {
                    fields: spec.fields.clone(),
                    root,
                    unique: spec.unique,
                };
                if let Some(extractor) = extractor {
                    let proot = *handle.primary_root.read();
                    for (doc_id, loc) in inner.primary.all_entries(proot)? {
                        let bytes = match inner.docs.read(loc, &cancel) {
                            Ok(bytes) => bytes,
                            Err(e) if e.is_slot_deleted() => continue,
                            Err(e) => return Err(e),
                        };
                        let mut field_bytes = Vec::new();
                        for field in &def.fields {
                            extractor.extract(&bytes, field)?.encode_into(&mut field_bytes);
                        }
                        if def.unique
                            && field_bytes != NULL_KEY
                            && tree.contains_field(root, None, &field_bytes, Some(doc_id))?
                        {
                            return Err(DbError::UniqueViolation {
                                collection: collection.to_string(),
                                index: def.name(),
                            });
                        }
                        tree.insert_key(&mut root, composite_key(&field_bytes, doc_id))?;
                    }
                }
                let mut def = def;
                def.root = root;
                let name = def.name();
                let ix = inner.catalog.new_index(def);
                handle.indexes.write().insert(name.clone(), ix);
                added.push(name);
            }
            inner.catalog.persist(&RootOverrides::new())
        })();
        match result.and_then(|()| inner.io.commit_write()) {
            Ok(()) => Ok(()),
            Err(e) => {
                inner.io.abort_write();
                let mut indexes = handle.indexes.write();
                for name in added {
                    indexes.remove(&name);
                }
                Err(e)
            }
        }
    }

    /// Drops one index by name (the underscore-joined field list).
    ///
    /// # Errors
    /// `NoSuchIndex`, I/O errors.
    pub fn drop_index(&self, collection: &str, index: &str) -> DbResult<()> {
        let inner = &self.inner;
        let _ddl = inner.ddl_lock.lock();
        let handle = inner.catalog.require(collection)?;
        let Some(ix) = handle.indexes.write().remove(index) else {
            return Err(DbError::NoSuchIndex(index.to_string()));
        };
        let _guard = inner.commit_lock.lock();
        inner.io.begin_write(AUTO_COMMIT_TX)?;
        let result: DbResult<()> = (|| {
            ix.tree.free_all(ix.root())?;
            inner.catalog.persist(&RootOverrides::new())
        })();
        match result.and_then(|()| inner.io.commit_write()) {
            Ok(()) => Ok(()),
            Err(e) => {
                inner.io.abort_write();
                handle.indexes.write().insert(index.to_string(), ix);
                Err(e)
            }
        }
    }

    /// Drops a collection; `delete_docs` additionally reclaims its document
    /// slots and overflow pages.
    ///
    /// # Errors
    /// `NoSuchCollection`, I/O errors.
    pub fn drop_collection(&self, name: &str, delete_docs: bool) -> DbResult<()> {
        let inner = &self.inner;
        let _ddl = inner.ddl_lock.lock();
        let Some(handle) = inner.catalog.remove(name) else {
            return Err(DbError::NoSuchCollection(name.to_string()));
        };
        let _guard = inner.commit_lock.lock();
        inner.io.begin_write(AUTO_COMMIT_TX)?;
        let result: DbResult<()> = (|| {
            let proot = *handle.primary_root.read();
            if delete_docs {
                for (_, loc) in inner.primary.all_entries(proot)? {
                    let _ = inner.docs.try_delete(loc)?;
                }
                for (_, chain) in inner.versions.chains_of(name) {
                    for version in chain {
                        let _ = inner.docs.try_delete(version.location)?;
                    }
                }
            }
            inner.primary.free_all(proot)?;
            for ix_name in handle.index_names() {
                if let Some(ix) = handle.index(&ix_name) {
                    ix.tree.free_all(ix.root())?;
                }
            }
            inner.versions.forget_collection(name);
            inner.catalog.persist(&RootOverrides::new())
        })();
        match result.and_then(|()| inner.io.commit_write()) {
            Ok(()) => {
                info!("dropped collection {name:?} (delete_docs={delete_docs})");
                Ok(())
            }
            Err(e) => {
                inner.io.abort_write();
                inner.catalog.restore(handle);
                Err(e)
            }
        }
    }

    /// # Errors
    /// `NoSuchCollection`, read failures (the count walks primary leaves).
    pub fn collection_info(&self, name: &str) -> DbResult<CollectionInfo> {
        let handle = self.inner.catalog.require(name)?;
        let root = *handle.primary_root.read();
        let document_count = self.inner.primary.count(root)?;
        let indexes =
            handle.indexes.read().values().map(|ix| ix.def.read().clone()).collect();
        Ok(CollectionInfo { name: name.to_string(), document_count, primary_root: root, indexes })
    }

    #[must_use]
    pub fn collection_names(&self) -> Vec<String> {
        self.inner.catalog.names()
    }

    /// # Errors
    /// `NoSuchCollection`.
    pub fn indexes(&self, collection: &str) -> DbResult<Vec<IndexDefinition>> {
        let handle = self.inner.catalog.require(collection)?;
        let defs = handle.indexes.read().values().map(|ix| ix.def.read().clone()).collect();
        Ok(defs)
    }

    /// Collections present in the catalog that the embedding application no
    /// longer declares.
    #[must_use]
    pub fn orphaned_schema(&self, known: &[&str]) -> Vec<String> {
        self.inner
            .catalog
            .names()
            .into_iter()
            .filter(|name| !known.contains(&name.as_str()))
            .collect()
    }

    /// Drops every orphaned collection; returns the dropped names.
    ///
    /// # Errors
    /// I/O errors from the drops.
    pub fn cleanup_orphaned_schema(
        &self,
        known: &[&str],
        delete_docs: bool,
    ) -> DbResult<Vec<String>> {
        let orphans = self.orphaned_schema(known);
        for name in &orphans {
            self.drop_collection(name, delete_docs)?;
        }
        Ok(orphans)
    }

    // --- maintenance ---

    /// Applies committed WAL frames to the base file and truncates the log.
    ///
    /// # Errors
    /// I/O errors.
    pub fn checkpoint(&self) -> DbResult<()> {
        self.inner.checkpoint()
    }

    /// Garbage-collects versions, compacts fragmented pages, and rebalances
    /// sparse secondary trees.
    ///
    /// # Errors
    /// I/O errors.
    pub fn vacuum(&self) -> DbResult<VacuumStats> {
        self.inner.vacuum()
    }

    /// Rebuilds the database into a fresh file at `target`, copying every
    /// document visible to a current snapshot plus the index definitions.
    ///
    /// # Errors
    /// `FileExists` when the target is taken; I/O errors.
    pub fn compact_to(&self, target: &Path) -> DbResult<()> {
        let inner = &self.inner;
        let target_db = Self::create(target, inner.options.clone())?;
        let tx = self.begin_read_only_transaction();
        let result = (|| -> DbResult<()> {
            for name in inner.catalog.names() {
                let handle = inner.catalog.require(&name)?;
                let specs: Vec<IndexSpec> = handle
                    .indexes
                    .read()
                    .values()
                    .map(|ix| {
                        let def = ix.def.read();
                        IndexSpec { fields: def.fields.clone(), unique: def.unique }
                    })
                    .collect();
                target_db.create_collection(&name, &specs)?;
                let docs = tx.scan_primary(&name, None, None, true, true)?;
                let visible: HashSet<DocId> = docs.iter().map(|(id, _)| *id).collect();
                target_db.inner.bulk_load(&name, &docs, &handle, &visible, &tx.cancel_token())?;
            }
            Ok(())
        })();
        let _ = tx.abort();
        result?;
        target_db.inner.io.flush()?;
        info!("compacted {} into {}", inner.path.display(), target.display());
        Ok(())
    }

    /// Structural self-check: bitmap/FSM agreement and index/primary
    /// agreement. Returns human-readable issues (empty when consistent).
    ///
    /// # Errors
    /// Read failures.
    pub fn verify(&self) -> DbResult<Vec<String>> {
        self.inner.verify()
    }

    // --- async siblings ---

    /// # Errors
    /// As `insert`.
    pub async fn insert_async(
        &self,
        collection: String,
        bytes: Vec<u8>,
        fields: HashMap<String, IndexValue>,
    ) -> DbResult<DocId> {
        let db = self.clone();
        tokio::task::spawn_blocking(move || db.insert(&collection, &bytes, &fields))
            .await
            .map_err(|_| DbError::Cancelled)?
    }

    /// # Errors
    /// As `replace`.
    pub async fn replace_async(
        &self,
        collection: String,
        doc_id: DocId,
        bytes: Vec<u8>,
        new_fields: HashMap<String, IndexValue>,
        old_fields: HashMap<String, IndexValue>,
    ) -> DbResult<bool> {
        let db = self.clone();
        tokio::task::spawn_blocking(move || {
            db.replace(&collection, doc_id, &bytes, &new_fields, &old_fields)
        })
        .await
        .map_err(|_| DbError::Cancelled)?
    }

    /// # Errors
    /// As `delete_by_id`.
    pub async fn delete_by_id_async(
        &self,
        collection: String,
        doc_id: DocId,
        old_fields: HashMap<String, IndexValue>,
    ) -> DbResult<bool> {
        let db = self.clone();
        tokio::task::spawn_blocking(move || db.delete_by_id(&collection, doc_id, &old_fields))
            .await
            .map_err(|_| DbError::Cancelled)?
    }

    /// # Errors
    /// As `get_by_id`.
    pub async fn get_by_id_async(
        &self,
        collection: String,
        doc_id: DocId,
    ) -> DbResult<Option<Vec<u8>>> {
        let db = self.clone();
        tokio::task::spawn_blocking(move || db.get_by_id(&collection, doc_id))
            .await
            .map_err(|_| DbError::Cancelled)?
    }

    /// # Errors
    /// As `checkpoint`.
    pub async fn checkpoint_async(&self) -> DbResult<()> {
        let db = self.clone();
        tokio::task::spawn_blocking(move || db.checkpoint())
            .await
            .map_err(|_| DbError::Cancelled)?
    }

    /// # Errors
    /// As `vacuum`.
    pub async fn vacuum_async(&self) -> DbResult<VacuumStats> {
        let db = self.clone();
        tokio::task::spawn_blocking(move || db.vacuum())
            .await
            .map_err(|_| DbError::Cancelled)?
    }
}

impl DbInner {
    fn new_secondary_tree(&self) -> SecondaryTree {
        SecondaryTree::new(
            Arc::clone(&self.io) as Arc<dyn PageIo>,
            Arc::clone(&self.pm),
            Arc::clone(&self.latches),
            Arc::clone(&self.pool),
        )
    }

    /// Ends a transaction without publishing anything: staged index ops are
    /// discarded and the registration dropped.
    pub(crate) fn abort_tx(&self, tx: &mut Transaction) {
        if !tx.open {
            return;
        }
        tx.open = false;
        for (collection, index_name) in &tx.touched_indexes {
            if let Some(handle) = self.catalog.handle(collection)
                && let Some(ix) = handle.index(index_name)
            {
                ix.tree.discard_tx(tx.id);
            }
        }
        tx.ops.clear();
        self.tx_mgr.end(tx.id);
        if let Some(wal) = &self.wal {
            wal.end_snapshot();
        }
    }

    /// The commit pipeline (spec order): commit latch, version validation,
    /// unique re-check, WAL write phase (documents, trees, catalog), commit
    /// frame + fsync, root publication, version publication.
    pub(crate) fn commit_tx(&self, tx: &mut Transaction) -> DbResult<()> {
        if !tx.open {
            return Err(DbError::TransactionClosed);
        }
        if tx.ops.is_empty() {
            self.abort_tx(tx);
            return Ok(());
        }
        if let Err(e) = tx.cancel.check() {
            self.abort_tx(tx);
            return Err(e);
        }

        let guard = self.commit_lock.lock();

        let template: Vec<PublishOp> = tx
            .ops
            .iter()
            .map(|op| PublishOp {
                collection: op.collection.clone(),
                doc_id: op.doc_id,
                expected_head: op.expected_head,
                expects_existing: op.expects_existing,
                new_location: None,
                old_location: op.old_location,
            })
            .collect();
        if let Err(e) = self.versions.validate(&template) {
            drop(guard);
            self.abort_tx(tx);
            return Err(e);
        }
        if let Err(e) = self.verify_unique(tx) {
            drop(guard);
            self.abort_tx(tx);
            return Err(e);
        }

        if let Err(e) = self.io.begin_write(tx.id) {
            drop(guard);
            self.abort_tx(tx);
            return Err(e);
        }
        let applied = self.apply_writes(tx);
        let (publish, overrides) = match applied {
            Ok(done) => done,
            Err(e) => {
                self.io.abort_write();
                drop(guard);
                self.abort_tx(tx);
                return Err(e);
            }
        };
        if !overrides.is_empty()
            && let Err(e) = self.catalog.persist(&overrides)
        {
            self.io.abort_write();
            drop(guard);
            self.abort_tx(tx);
            return Err(e);
        }
        if let Err(e) = self.io.commit_write() {
            drop(guard);
            self.abort_tx(tx);
            return Err(e);
        }

        // Publication: pending root updates first, then versions; both under
        // the commit latch so visibility is atomic at the commit point.
        for ((collection, index_name), root) in &overrides {
            let Some(handle) = self.catalog.handle(collection) else { continue };
            match index_name {
                None => *handle.primary_root.write() = *root,
                Some(index_name) => {
                    if let Some(ix) = handle.index(index_name) {
                        ix.def.write().root = *root;
                    }
                }
            }
        }
        self.versions.add_versions(tx.id, &publish);
        self.tx_mgr.mark_committed(tx.id);
        self.tx_mgr.end(tx.id);
        tx.open = false;
        drop(guard);
        if let Some(wal) = &self.wal {
            wal.end_snapshot();
        }
        debug!("tx {} committed {} ops", tx.id, publish.len());
        self.after_commit();
        Ok(())
    }

    /// Definitive unique check against the physical (committed) trees, run
    /// under the commit latch. The stage-time check cannot see other
    /// transactions' pending inserts.
    fn verify_unique(&self, tx: &Transaction) -> DbResult<()> {
        for (collection, index_name) in &tx.touched_indexes {
            let handle = self.catalog.require(collection)?;
            let Some(ix) = handle.index(index_name) else { continue };
            if !ix.is_unique() {
                continue;
            }
            let def = ix.def.read().clone();
            for op in &tx.ops {
                if op.collection != *collection {
                    continue;
                }
                let Some(fields) = &op.new_fields else { continue };
                let field_bytes = index_field_bytes(&def, fields);
                if field_bytes == NULL_KEY {
                    continue;
                }
                if ix.tree.contains_field(ix.root(), None, &field_bytes, Some(op.doc_id))? {
                    return Err(DbError::UniqueViolation {
                        collection: collection.clone(),
                        index: def.name(),
                    });
                }
            }
        }
        Ok(())
    }

    /// The write phase: document slots, primary tree entries, and secondary
    /// flushes, all through the session overlay. Root changes collect into
    /// the override map for later publication.
    fn apply_writes(&self, tx: &Transaction) -> DbResult<(Vec<PublishOp>, RootOverrides)> {
        let mut overrides = RootOverrides::new();
        let mut publish = Vec::with_capacity(tx.ops.len());
        for op in &tx.ops {
            let handle = self.catalog.require(&op.collection)?;
            let key = (op.collection.clone(), None);
            let original =
                overrides.get(&key).copied().unwrap_or_else(|| *handle.primary_root.read());
            let mut root = original;
            let new_location = match op.kind {
                WriteKind::Insert | WriteKind::Replace => {
                    let bytes = op.bytes.as_ref().expect("write op carries bytes");
                    let loc = self.docs.write(bytes, &tx.cancel)?;
                    self.primary.insert(&mut root, op.doc_id, loc)?;
                    Some(loc)
                }
                WriteKind::Delete => {
                    let _ = self.primary.delete(&mut root, op.doc_id)?;
                    None
                }
            };
            if root != original {
                overrides.insert(key, root);
            }
            publish.push(PublishOp {
                collection: op.collection.clone(),
                doc_id: op.doc_id,
                expected_head: op.expected_head,
                expects_existing: op.expects_existing,
                new_location,
                old_location: op.old_location,
            });
        }
        for (collection, index_name) in &tx.touched_indexes {
            let handle = self.catalog.require(collection)?;
            let Some(ix) = handle.index(index_name) else { continue };
            let key = (collection.clone(), Some(index_name.clone()));
            let original = overrides.get(&key).copied().unwrap_or_else(|| ix.root());
            let mut root = original;
            ix.tree.flush_tx(&mut root, tx.id)?;
            if root != original {
                overrides.insert(key, root);
            }
        }
        Ok((publish, overrides))
    }

    fn after_commit(&self) {
        let commits = self.commits_since_gc.fetch_add(1, Ordering::SeqCst) + 1;
        if self.options.auto_gc && commits >= self.options.gc_threshold {
            self.commits_since_gc.store(0, Ordering::SeqCst);
            match self.run_gc() {
                Ok(outcome) => debug!(
                    "auto gc: {} versions, {} slots",
                    outcome.versions_collected, outcome.docs_deleted
                ),
                Err(e) => warn!("auto gc failed: {e}"),
            }
        }
        if let Some(wal) = &self.wal
            && self.options.auto_checkpoint
            && wal.frames() >= self.options.wal_checkpoint_threshold
            && let Err(e) = self.checkpoint()
        {
            warn!("auto checkpoint failed: {e}");
        }
    }

    fn checkpoint(&self) -> DbResult<()> {
        let _guard = self.commit_lock.lock();
        if let Some(wal) = &self.wal {
            wal.checkpoint(self.below.as_ref())?;
        }
        Ok(())
    }

    /// GC inside its own short auto-committed write.
    fn run_gc(&self) -> DbResult<GcOutcome> {
        let _guard = self.commit_lock.lock();
        let cutoff = gc::cutoff(&self.tx_mgr);
        self.io.begin_write(AUTO_COMMIT_TX)?;
        match gc::collect(&self.versions, &self.docs, cutoff) {
            Ok(outcome) => {
                self.io.commit_write()?;
                Ok(outcome)
            }
            Err(e) => {
                self.io.abort_write();
                Err(e)
            }
        }
    }

    fn vacuum(&self) -> DbResult<VacuumStats> {
        let gc_outcome = self.run_gc()?;

        // Compaction sweep: pages whose reclaimable bytes exceed what their
        // FSM bucket declares get rewritten.
        let pages_compacted = {
            let _guard = self.commit_lock.lock();
            self.io.begin_write(AUTO_COMMIT_TX)?;
            let swept: DbResult<u64> = (|| {
                let mut compacted = 0u64;
                for page_id in self.docs.slotted_pages()? {
                    if self.docs.compact_page(page_id)? {
                        compacted += 1;
                    }
                }
                Ok(compacted)
            })();
            match swept {
                Ok(compacted) => {
                    self.io.commit_write()?;
                    compacted
                }
                Err(e) => {
                    self.io.abort_write();
                    return Err(e);
                }
            }
        };

        // Offline secondary rebalance, only for trees without pending ops.
        {
            let _guard = self.commit_lock.lock();
            self.io.begin_write(AUTO_COMMIT_TX)?;
            let rebuilt: DbResult<RootOverrides> = (|| {
                let mut overrides = RootOverrides::new();
                for name in self.catalog.names() {
                    let handle = self.catalog.require(&name)?;
                    for ix_name in handle.index_names() {
                        let Some(ix) = handle.index(&ix_name) else { continue };
                        let mut root = ix.root();
                        if ix.tree.rebalance(&mut root)? {
                            overrides.insert((name.clone(), Some(ix_name)), root);
                        }
                    }
                }
                if !overrides.is_empty() {
                    self.catalog.persist(&overrides)?;
                }
                Ok(overrides)
            })();
            match rebuilt {
                Ok(overrides) => {
                    self.io.commit_write()?;
                    for ((collection, index_name), root) in &overrides {
                        if let Some(handle) = self.catalog.handle(collection)
                            && let Some(name) = index_name
                            && let Some(ix) = handle.index(name)
                        {
                            ix.def.write().root = *root;
                        }
                    }
                }
                Err(e) => {
                    self.io.abort_write();
                    return Err(e);
                }
            }
        }

        Ok(VacuumStats {
            versions_collected: gc_outcome.versions_collected,
            docs_processed: gc_outcome.docs_deleted,
            pages_compacted,
        })
    }

    /// Loads pre-scanned documents and index entries into a fresh target
    /// (compaction path); runs inside the target's structural session.
    fn bulk_load(
        &self,
        collection: &str,
        docs: &[(DocId, Vec<u8>)],
        source_handle: &crate::catalog::CollectionHandle,
        visible: &HashSet<DocId>,
        cancel: &CancelToken,
    ) -> DbResult<()> {
        let handle = self.catalog.require(collection)?;
        let _guard = self.commit_lock.lock();
        self.io.begin_write(AUTO_COMMIT_TX)?;
        let result: DbResult<RootOverrides> = (|| {
            let mut overrides = RootOverrides::new();
            let mut root = *handle.primary_root.read();
            let original = root;
            let mut max_id = 0;
            for (doc_id, bytes) in docs {
                let loc = self.docs.write(bytes, cancel)?;
                self.primary.insert(&mut root, *doc_id, loc)?;
                max_id = max_id.max(*doc_id);
            }
            if root != original {
                overrides.insert((collection.to_string(), None), root);
            }
            for ix_name in source_handle.index_names() {
                let Some(source_ix) = source_handle.index(&ix_name) else { continue };
                let Some(target_ix) = handle.index(&ix_name) else { continue };
                let mut iroot = target_ix.root();
                let ioriginal = iroot;
                for key in source_ix.tree.all_entries(source_ix.root())? {
                    if visible.contains(&doc_id_of(&key)) {
                        target_ix.tree.insert_key(&mut iroot, key)?;
                    }
                }
                if iroot != ioriginal {
                    overrides.insert((collection.to_string(), Some(ix_name)), iroot);
                }
            }
            handle.next_doc_id.store(max_id + 1, Ordering::SeqCst);
            if !overrides.is_empty() {
                self.catalog.persist(&overrides)?;
            }
            Ok(overrides)
        })();
        match result {
            Ok(overrides) => {
                self.io.commit_write()?;
                for ((coll, index_name), root) in &overrides {
                    let Some(handle) = self.catalog.handle(coll) else { continue };
                    match index_name {
                        None => *handle.primary_root.write() = *root,
                        Some(name) => {
                            if let Some(ix) = handle.index(name) {
                                ix.def.write().root = *root;
                            }
                        }
                    }
                }
                Ok(())
            }
            Err(e) => {
                self.io.abort_write();
                Err(e)
            }
        }
    }

    fn verify(&self) -> DbResult<Vec<String>> {
        let mut issues = Vec::new();
        for name in self.catalog.names() {
            let handle = self.catalog.require(&name)?;
            let proot = *handle.primary_root.read();
            for page_id in self.primary.pages(proot)? {
                if !self.pm.is_allocated(page_id) {
                    issues.push(format!(
                        "primary node page {page_id} of {name:?} has bitmap bit 0"
                    ));
                }
            }
            for ix_name in handle.index_names() {
                let Some(ix) = handle.index(&ix_name) else { continue };
                for page_id in ix.tree.pages(ix.root())? {
                    if !self.pm.is_allocated(page_id) {
                        issues.push(format!(
                            "index {ix_name:?} node page {page_id} has bitmap bit 0"
                        ));
                    }
                }
                for key in ix.tree.all_entries(ix.root())? {
                    let doc_id = doc_id_of(&key);
                    if self.primary.search(proot, doc_id)?.is_none() {
                        issues.push(format!(
                            "index {ix_name:?} references doc {doc_id} missing from the primary tree of {name:?}"
                        ));
                    }
                }
            }
            for (_, loc) in self.primary.all_entries(proot)? {
                if !self.pm.is_allocated(loc.page_id) {
                    issues.push(format!(
                        "document page {} of {name:?} has bitmap bit 0",
                        loc.page_id
                    ));
                }
            }
        }
        let usable = self.io.usable_page_size() as usize;
        for page_id in self.docs.slotted_pages()? {
            if let Some((contiguous, _)) = self.docs.page_free_info(page_id)? {
                let declared = self.pm.fsm_level(page_id);
                let computed = crate::types::FreeLevel::for_free_bytes(contiguous, usable);
                if declared != computed {
                    issues.push(format!(
                        "page {page_id}: FSM declares {declared:?} but free bytes compute {computed:?}"
                    ));
                }
            }
        }
        Ok(issues)
    }
}

impl Drop for DbInner {
    fn drop(&mut self) {
        if let Some(wal) = &self.wal
            && self.tx_mgr.active_count() == 0
            && let Err(e) = wal.checkpoint(self.below.as_ref())
        {
            warn!("final checkpoint failed: {e}");
        }
        if let Err(e) = self.io.flush() {
            warn!("final flush failed: {e}");
        }
    }
}
