use crate::errors::{DbError, DbResult};

pub const MIN_PAGE_SIZE: u32 = 1024;
/// Slot offsets are 16-bit, which caps the page size.
pub const MAX_PAGE_SIZE: u32 = 32 * 1024;
pub const DEFAULT_PAGE_SIZE: u32 = 4096;

/// Argon2id parameters stored in the encrypted-file prelude.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KdfParams {
    pub t_cost: u32,
    pub m_cost_kib: u32,
    pub lanes: u32,
}

impl Default for KdfParams {
    fn default() -> Self {
        Self { t_cost: 3, m_cost_kib: 64 * 1024, lanes: 1 }
    }
}

#[derive(Clone, Debug)]
pub struct EncryptionOptions {
    pub password: String,
    pub kdf: KdfParams,
}

impl EncryptionOptions {
    #[must_use]
    pub fn new(password: impl Into<String>) -> Self {
        Self { password: password.into(), kdf: KdfParams::default() }
    }
}

/// Database tuning knobs. `Default` matches a small embedded deployment.
#[derive(Clone, Debug)]
pub struct Options {
    /// Power of two, at least 1024. Fixed at creation; `open` always trusts
    /// the on-disk value.
    pub page_size: u32,
    pub use_wal: bool,
    /// Memory-mapped read path; silently falls back to file reads when the
    /// platform refuses the mapping.
    pub use_mmap: bool,
    /// Committed frames that trigger an automatic checkpoint.
    pub wal_checkpoint_threshold: u64,
    pub auto_checkpoint: bool,
    /// Commits between automatic garbage-collection passes.
    pub gc_threshold: u64,
    pub auto_gc: bool,
    /// Pre-read allocated pages into the page cache on open.
    pub warmup_on_open: bool,
    /// Pages added per file growth.
    pub expansion_page_count: u32,
    /// Page-cache capacity in pages; 0 disables the cache layer.
    pub page_cache_size: usize,
    pub encryption: Option<EncryptionOptions>,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            use_wal: true,
            use_mmap: false,
            wal_checkpoint_threshold: 1024,
            auto_checkpoint: true,
            gc_threshold: 256,
            auto_gc: true,
            warmup_on_open: false,
            expansion_page_count: 16,
            page_cache_size: 256,
            encryption: None,
        }
    }
}

impl Options {
    /// # Errors
    /// Returns `InvalidHeader` when the page size is not a power of two of at
    /// least 1024, or when growth/threshold knobs are zero.
    pub fn validate(&self) -> DbResult<()> {
        if self.page_size < MIN_PAGE_SIZE
            || self.page_size > MAX_PAGE_SIZE
            || !self.page_size.is_power_of_two()
        {
            return Err(DbError::InvalidHeader(format!(
                "page size {} must be a power of two in {MIN_PAGE_SIZE}..={MAX_PAGE_SIZE}",
                self.page_size
            )));
        }
        if self.expansion_page_count == 0 {
            return Err(DbError::InvalidHeader("expansion_page_count must be > 0".into()));
        }
        if self.use_wal && self.wal_checkpoint_threshold == 0 {
            return Err(DbError::InvalidHeader("wal_checkpoint_threshold must be > 0".into()));
        }
        Ok(())
    }
}
