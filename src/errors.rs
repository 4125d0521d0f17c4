use thiserror::Error;

use crate::types::{DocId, PageId};

#[derive(Debug, Error)]
pub enum DbError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("file not found: {0}")]
    FileNotFound(String),

    #[error("file already exists: {0}")]
    FileExists(String),

    #[error("invalid password")]
    InvalidPassword,

    #[error("encryption mismatch: {0}")]
    EncryptionMismatch(String),

    #[error("invalid header: {0}")]
    InvalidHeader(String),

    #[error("unsupported format version: {0}")]
    UnsupportedVersion(u32),

    #[error("checksum mismatch: {0}")]
    ChecksumMismatch(String),

    #[error("out of space")]
    OutOfSpace,

    #[error("catalog growth failed: {0}")]
    CatalogGrowth(String),

    #[error("no contiguous run of {0} pages")]
    NoContiguousPages(u32),

    #[error("collection not found: {0}")]
    NoSuchCollection(String),

    #[error("collection already exists: {0}")]
    CollectionExists(String),

    #[error("index not found: {0}")]
    NoSuchIndex(String),

    #[error("index already exists: {0}")]
    IndexExists(String),

    #[error("unique constraint violated on index {index} in {collection}")]
    UniqueViolation { collection: String, index: String },

    #[error("slot already deleted at page {page_id} slot {slot}")]
    SlotDeleted { page_id: PageId, slot: u16 },

    #[error("write conflict on document {doc_id} in {collection}")]
    VersionConflict { collection: String, doc_id: DocId },

    #[error("transaction is read-only")]
    ReadOnlyTransaction,

    #[error("transaction is no longer active")]
    TransactionClosed,

    #[error("operation cancelled")]
    Cancelled,
}

pub type DbResult<T> = Result<T, DbError>;

impl DbError {
    /// A `SlotDeleted` during a read is a benign GC race; callers map it to
    /// an absent document instead of surfacing an error.
    #[must_use]
    pub const fn is_slot_deleted(&self) -> bool {
        matches!(self, Self::SlotDeleted { .. })
    }
}
