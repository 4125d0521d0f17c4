use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::errors::{DbError, DbResult};

/// Stable page number within a database file. Page 0 is the header.
pub type PageId = u32;

/// Monotonic 64-bit transaction identifier; snapshot identifiers share the
/// same space. Id 0 is reserved for auto-committed structural writes.
pub type TxId = u64;

/// Per-collection document key, the fixed key of the primary tree.
pub type DocId = i32;

/// Sentinel for "no page" in leaf chains and child slots.
pub const NO_PAGE: PageId = 0;

/// `deleted_by` value of a live version.
pub const TX_LIVE: TxId = u64::MAX;

pub const AUTO_COMMIT_TX: TxId = 0;

/// Physical address of a stored document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DocumentLocation {
    pub page_id: PageId,
    pub slot: u16,
}

impl DocumentLocation {
    #[must_use]
    pub const fn new(page_id: PageId, slot: u16) -> Self {
        Self { page_id, slot }
    }
}

/// Free-space-map bucket, two bits per page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum FreeLevel {
    None = 0,
    Low = 1,
    Medium = 2,
    High = 3,
}

impl FreeLevel {
    #[must_use]
    pub const fn from_bits(bits: u8) -> Self {
        match bits & 0b11 {
            1 => Self::Low,
            2 => Self::Medium,
            3 => Self::High,
            _ => Self::None,
        }
    }

    /// Bucket for `free` logical bytes out of `usable` per page:
    /// High >= 70%, Medium >= 40%, Low >= 10%, else None.
    #[must_use]
    pub fn for_free_bytes(free: usize, usable: usize) -> Self {
        if usable == 0 {
            return Self::None;
        }
        let pct = free * 100 / usable;
        if pct >= 70 {
            Self::High
        } else if pct >= 40 {
            Self::Medium
        } else if pct >= 10 {
            Self::Low
        } else {
            Self::None
        }
    }

    /// Minimum level a page must advertise to host a document of `len`
    /// bytes: High above 60% of the usable page, Medium above 30%, else Low.
    #[must_use]
    pub fn required_for(len: usize, usable: usize) -> Self {
        if usable == 0 {
            return Self::High;
        }
        let pct = len * 100 / usable;
        if pct > 60 {
            Self::High
        } else if pct > 30 {
            Self::Medium
        } else {
            Self::Low
        }
    }
}

/// Indexable field types carried by index definitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FieldType {
    String = 1,
    Int32 = 2,
    Int64 = 3,
    Double = 4,
    Bool = 5,
    Null = 6,
}

impl FieldType {
    #[must_use]
    pub const fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            1 => Some(Self::String),
            2 => Some(Self::Int32),
            3 => Some(Self::Int64),
            4 => Some(Self::Double),
            5 => Some(Self::Bool),
            6 => Some(Self::Null),
            _ => None,
        }
    }
}

/// A single extracted field value, as handed over by the embedding
/// application. Encoded into order-preserving bytes for secondary keys.
#[derive(Debug, Clone, PartialEq)]
pub enum IndexValue {
    Null,
    Bool(bool),
    Int32(i32),
    Int64(i64),
    Double(f64),
    String(String),
}

const TAG_NULL: u8 = 0x00;
const TAG_BOOL: u8 = 0x01;
const TAG_INT32: u8 = 0x02;
const TAG_INT64: u8 = 0x03;
const TAG_DOUBLE: u8 = 0x04;
const TAG_STRING: u8 = 0x05;

impl IndexValue {
    /// Appends the order-preserving encoding of this value. Null encodes as
    /// the single byte 0x00 (the null key is exempt from unique checks).
    /// Strings are zero-escaped and zero-terminated so that concatenated
    /// segments of a compound key compare field by field.
    pub fn encode_into(&self, out: &mut Vec<u8>) {
        match self {
            Self::Null => out.push(TAG_NULL),
            Self::Bool(b) => {
                out.push(TAG_BOOL);
                out.push(u8::from(*b));
            }
            Self::Int32(v) => {
                out.push(TAG_INT32);
                out.extend_from_slice(&((*v as u32) ^ 0x8000_0000).to_be_bytes());
            }
            Self::Int64(v) => {
                out.push(TAG_INT64);
                out.extend_from_slice(&((*v as u64) ^ 0x8000_0000_0000_0000).to_be_bytes());
            }
            Self::Double(v) => {
                out.push(TAG_DOUBLE);
                let bits = v.to_bits();
                let ordered = if bits & 0x8000_0000_0000_0000 != 0 {
                    !bits
                } else {
                    bits | 0x8000_0000_0000_0000
                };
                out.extend_from_slice(&ordered.to_be_bytes());
            }
            Self::String(s) => {
                out.push(TAG_STRING);
                for &b in s.as_bytes() {
                    out.push(b);
                    if b == 0 {
                        out.push(0xFF);
                    }
                }
                out.extend_from_slice(&[0x00, 0x00]);
            }
        }
    }

    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        self.encode_into(&mut out);
        out
    }

    /// Encoding suitable as a scan prefix: for strings the terminator is
    /// omitted so that every key starting with `s` matches.
    #[must_use]
    pub fn encode_prefix(&self) -> Vec<u8> {
        match self {
            Self::String(s) => {
                let mut out = vec![TAG_STRING];
                for &b in s.as_bytes() {
                    out.push(b);
                    if b == 0 {
                        out.push(0xFF);
                    }
                }
                out
            }
            other => other.encode(),
        }
    }

    #[must_use]
    pub const fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }
}

/// The transaction's view of the committed world, captured at begin.
///
/// A version created by `t` is part of the snapshot when `t <= high` and `t`
/// was not active at begin; a version deleted by `t` is still readable when
/// the deleting transaction is outside the snapshot.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub high: TxId,
    pub active: Vec<TxId>,
}

impl Snapshot {
    #[must_use]
    pub fn sees(&self, tx: TxId) -> bool {
        tx <= self.high && !self.active.contains(&tx)
    }

    #[must_use]
    pub fn version_visible(&self, created_by: TxId, deleted_by: TxId) -> bool {
        self.sees(created_by) && (deleted_by == TX_LIVE || !self.sees(deleted_by))
    }
}

/// Outcome of an explicit `vacuum` call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VacuumStats {
    pub versions_collected: u64,
    pub docs_processed: u64,
    pub pages_compacted: u64,
}

/// Cooperative cancellation flag, checked at page-I/O boundaries.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Release);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }

    /// # Errors
    /// Returns `Cancelled` once the token has been triggered.
    pub fn check(&self) -> DbResult<()> {
        if self.is_cancelled() { Err(DbError::Cancelled) } else { Ok(()) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn int32_encoding_orders_like_numbers() {
        let values = [i32::MIN, -7, -1, 0, 1, 42, i32::MAX];
        let encoded: Vec<Vec<u8>> = values.iter().map(|v| IndexValue::Int32(*v).encode()).collect();
        let mut sorted = encoded.clone();
        sorted.sort();
        assert_eq!(encoded, sorted);
    }

    #[test]
    fn double_encoding_orders_like_numbers() {
        let values = [f64::NEG_INFINITY, -2.5, -0.0, 0.0, 1.5, f64::INFINITY];
        let encoded: Vec<Vec<u8>> = values.iter().map(|v| IndexValue::Double(*v).encode()).collect();
        for pair in encoded.windows(2) {
            assert!(pair[0] <= pair[1]);
        }
    }

    #[test]
    fn compound_segments_compare_field_by_field() {
        // ("ab", "c") must not collide with ("a", "bc")
        let mut k1 = IndexValue::String("ab".into()).encode();
        IndexValue::String("c".into()).encode_into(&mut k1);
        let mut k2 = IndexValue::String("a".into()).encode();
        IndexValue::String("bc".into()).encode_into(&mut k2);
        assert_ne!(k1, k2);
        assert!(k2 < k1);
    }

    #[test]
    fn snapshot_excludes_active_set() {
        let snap = Snapshot { high: 10, active: vec![7] };
        assert!(snap.sees(6));
        assert!(!snap.sees(7));
        assert!(!snap.sees(11));
        assert!(snap.version_visible(5, TX_LIVE));
        assert!(snap.version_visible(5, 7));
        assert!(!snap.version_visible(5, 6));
    }
}
