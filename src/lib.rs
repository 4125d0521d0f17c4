//! QuillDB: an embedded, single-file document database engine.
//!
//! The engine stores collections of opaque encoded documents in a paged
//! file with a bitmap/free-space-map allocator, a frame-structured
//! write-ahead log for atomic group commit and crash recovery, B+Tree
//! primary and secondary indexes, slotted document pages with overflow
//! chains, and MVCC snapshot isolation with background version garbage
//! collection. Serialization of user types stays with the embedding
//! application: documents cross the API as bytes, indexed fields as
//! [`IndexValue`]s.
//!
//! ```no_run
//! use std::collections::HashMap;
//! use quilldb::{Database, IndexValue, Options};
//!
//! # fn main() -> quilldb::DbResult<()> {
//! let db = Database::create(std::path::Path::new("app.qdb"), Options::default())?;
//! db.create_collection("users", &[])?;
//! let mut fields = HashMap::new();
//! fields.insert("name".to_string(), IndexValue::String("ada".into()));
//! let id = db.insert("users", b"{\"name\":\"ada\"}", &fields)?;
//! assert!(db.get_by_id("users", id)?.is_some());
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_code)]

pub mod btree;
pub mod catalog;
pub mod config;
pub mod db;
pub mod errors;
pub mod logger;
pub mod mvcc;
pub mod pool;
pub mod storage;
pub mod tx;
pub mod types;
pub mod wal;

pub use catalog::{IndexDefinition, IndexField, IndexSpec};
pub use config::{EncryptionOptions, KdfParams, Options};
pub use db::{CollectionInfo, Database, FieldExtractor};
pub use errors::{DbError, DbResult};
pub use tx::Transaction;
pub use types::{
    CancelToken, DocId, DocumentLocation, FieldType, FreeLevel, IndexValue, PageId, Snapshot,
    TxId, VacuumStats,
};
