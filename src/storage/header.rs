//! Header page (page 0) layout. All integers little-endian; the page size
//! lives at offset 8 so `open` can read it before anything else is decoded.

use crate::errors::{DbError, DbResult};
use crate::types::PageId;

pub const DB_MAGIC: &[u8; 4] = b"QLDB";
pub const DB_FORMAT_VERSION: u32 = 1;

pub const HEADER_LEN: usize = 45;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DbHeader {
    pub version: u32,
    pub page_size: u32,
    pub page_count: u32,
    pub bitmap_start: PageId,
    pub bitmap_count: u32,
    pub fsm_start: PageId,
    pub fsm_count: u32,
    pub catalog_start: PageId,
    pub catalog_count: u32,
    pub next_free_hint: PageId,
    pub use_mmap: bool,
}

impl DbHeader {
    pub fn encode_into(&self, buf: &mut [u8]) {
        buf[0..4].copy_from_slice(DB_MAGIC);
        buf[4..8].copy_from_slice(&self.version.to_le_bytes());
        buf[8..12].copy_from_slice(&self.page_size.to_le_bytes());
        buf[12..16].copy_from_slice(&self.page_count.to_le_bytes());
        buf[16..20].copy_from_slice(&self.bitmap_start.to_le_bytes());
        buf[20..24].copy_from_slice(&self.bitmap_count.to_le_bytes());
        buf[24..28].copy_from_slice(&self.fsm_start.to_le_bytes());
        buf[28..32].copy_from_slice(&self.fsm_count.to_le_bytes());
        buf[32..36].copy_from_slice(&self.catalog_start.to_le_bytes());
        buf[36..40].copy_from_slice(&self.catalog_count.to_le_bytes());
        buf[40..44].copy_from_slice(&self.next_free_hint.to_le_bytes());
        buf[44] = u8::from(self.use_mmap);
    }

    /// # Errors
    /// `InvalidHeader` on bad magic or nonsensical regions,
    /// `UnsupportedVersion` when the format version is newer than this build.
    pub fn decode(buf: &[u8]) -> DbResult<Self> {
        if buf.len() < HEADER_LEN {
            return Err(DbError::InvalidHeader("header page too short".into()));
        }
        if &buf[0..4] != DB_MAGIC {
            return Err(DbError::InvalidHeader("bad magic".into()));
        }
        let le = |range: std::ops::Range<usize>| {
            u32::from_le_bytes(buf[range].try_into().expect("4 bytes"))
        };
        let version = le(4..8);
        if version > DB_FORMAT_VERSION {
            return Err(DbError::UnsupportedVersion(version));
        }
        let header = Self {
            version,
            page_size: le(8..12),
            page_count: le(12..16),
            bitmap_start: le(16..20),
            bitmap_count: le(20..24),
            fsm_start: le(24..28),
            fsm_count: le(28..32),
            catalog_start: le(32..36),
            catalog_count: le(36..40),
            next_free_hint: le(40..44),
            use_mmap: buf[44] != 0,
        };
        if header.page_size < 1024 || !header.page_size.is_power_of_two() {
            return Err(DbError::InvalidHeader(format!(
                "stored page size {} is not a power of two >= 1024",
                header.page_size
            )));
        }
        if header.bitmap_count == 0 || header.fsm_count == 0 || header.catalog_count == 0 {
            return Err(DbError::InvalidHeader("empty structural region".into()));
        }
        Ok(header)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_decode_round_trip() {
        let header = DbHeader {
            version: DB_FORMAT_VERSION,
            page_size: 4096,
            page_count: 64,
            bitmap_start: 1,
            bitmap_count: 1,
            fsm_start: 2,
            fsm_count: 1,
            catalog_start: 3,
            catalog_count: 2,
            next_free_hint: 5,
            use_mmap: true,
        };
        let mut buf = vec![0u8; 4096];
        header.encode_into(&mut buf);
        assert_eq!(DbHeader::decode(&buf).unwrap(), header);
        // page size must sit at offset 8
        assert_eq!(u32::from_le_bytes(buf[8..12].try_into().unwrap()), 4096);
    }

    #[test]
    fn bad_magic_is_rejected() {
        let buf = vec![0u8; 4096];
        assert!(matches!(DbHeader::decode(&buf), Err(DbError::InvalidHeader(_))));
    }
}
