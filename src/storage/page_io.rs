//! Raw block device over a single file: fixed-size pages, optional
//! memory-mapped reads, optional page-level encryption, optional LRU cache.
//!
//! The stack composes as `BasePageIo -> [CachedPageIo] -> [TxPageIo]`;
//! encryption stays inside `BasePageIo`, so everything above it works with
//! logical (usable-size) page buffers.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::{debug, warn};
use lru::LruCache;
use memmap2::Mmap;
use parking_lot::{Mutex, RwLock};

use crate::config::EncryptionOptions;
use crate::errors::{DbError, DbResult};
use crate::storage::encryption::{ENC_MAGIC, ENC_PRELUDE_LEN, PAGE_CRYPTO_OVERHEAD, PageCipher};
use crate::types::PageId;

pub trait PageIo: Send + Sync {
    /// Physical page size, as stored on disk.
    fn page_size(&self) -> u32;

    /// Logical bytes available per page: the page size minus any
    /// encryption/MAC overhead. All buffers above `BasePageIo` use this.
    fn usable_page_size(&self) -> u32;

    /// Number of pages the file currently holds.
    ///
    /// # Errors
    /// Propagates metadata I/O failures.
    fn page_count(&self) -> DbResult<u64>;

    /// # Errors
    /// Propagates I/O failures; `ChecksumMismatch` when an encrypted page
    /// fails authentication.
    fn read_page(&self, id: PageId, buf: &mut [u8]) -> DbResult<()>;

    /// # Errors
    /// Propagates I/O failures.
    fn write_page(&self, id: PageId, buf: &[u8]) -> DbResult<()>;

    /// Extends (or truncates) the file to `pages` pages without pushing the
    /// intermediate zeros through any write-ahead logging.
    ///
    /// # Errors
    /// Propagates I/O failures.
    fn set_len_pages(&self, pages: u64) -> DbResult<()>;

    /// Durably flushes pending writes.
    ///
    /// # Errors
    /// Propagates I/O failures.
    fn flush(&self) -> DbResult<()>;
}

#[allow(unsafe_code)]
fn try_map(file: &File) -> Option<Mmap> {
    // SAFETY: read-only mapping of a file this process keeps open for the
    // lifetime of the handle; writers go through the same OS page cache.
    unsafe { Mmap::map(file).ok() }
}

pub struct BasePageIo {
    file: Mutex<File>,
    path: PathBuf,
    page_size: u32,
    data_offset: u64,
    cipher: Option<PageCipher>,
    map: RwLock<Option<Mmap>>,
    use_mmap: bool,
}

impl BasePageIo {
    /// Creates the backing file. Encrypted files get their prelude written
    /// immediately.
    ///
    /// # Errors
    /// `FileExists` when the path is already taken; otherwise I/O and KDF
    /// errors.
    pub fn create(
        path: &Path,
        page_size: u32,
        encryption: Option<&EncryptionOptions>,
        use_mmap: bool,
    ) -> DbResult<Self> {
        let file = OpenOptions::new().read(true).write(true).create_new(true).open(path).map_err(
            |e| {
                if e.kind() == std::io::ErrorKind::AlreadyExists {
                    DbError::FileExists(path.display().to_string())
                } else {
                    DbError::Io(e)
                }
            },
        )?;
        let (cipher, data_offset) = match encryption {
            Some(opts) => {
                let (cipher, prelude) = PageCipher::create(opts, page_size)?;
                let mut f = &file;
                f.write_all(&prelude)?;
                f.sync_data()?;
                (Some(cipher), ENC_PRELUDE_LEN as u64)
            }
            None => (None, 0),
        };
        Ok(Self {
            file: Mutex::new(file),
            path: path.to_path_buf(),
            page_size,
            data_offset,
            cipher,
            map: RwLock::new(None),
            use_mmap,
        })
    }

    /// Opens an existing file, reading the page size from disk. Callers may
    /// not override the stored page size.
    ///
    /// # Errors
    /// `FileNotFound`, `InvalidPassword`, `EncryptionMismatch`,
    /// `InvalidHeader`, or I/O errors.
    pub fn open(
        path: &Path,
        encryption: Option<&EncryptionOptions>,
        use_mmap: bool,
    ) -> DbResult<Self> {
        let mut file =
            OpenOptions::new().read(true).write(true).open(path).map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    DbError::FileNotFound(path.display().to_string())
                } else {
                    DbError::Io(e)
                }
            })?;
        let mut probe = [0u8; 12];
        file.seek(SeekFrom::Start(0))?;
        let read = file.read(&mut probe)?;
        if read < 12 {
            return Err(DbError::InvalidHeader("file too short".into()));
        }
        let (cipher, page_size, data_offset) = if &probe[0..4] == ENC_MAGIC {
            let Some(opts) = encryption else {
                return Err(DbError::EncryptionMismatch(
                    "file is encrypted; a password is required".into(),
                ));
            };
            let mut prelude = vec![0u8; ENC_PRELUDE_LEN];
            file.seek(SeekFrom::Start(0))?;
            file.read_exact(&mut prelude)?;
            let (cipher, page_size) = PageCipher::open(opts, &prelude)?;
            (Some(cipher), page_size, ENC_PRELUDE_LEN as u64)
        } else {
            if encryption.is_some() {
                return Err(DbError::EncryptionMismatch("file is not encrypted".into()));
            }
            // Plaintext files store the page size at header offset 8.
            let page_size = u32::from_le_bytes(probe[8..12].try_into().expect("4 bytes"));
            (None, page_size, 0)
        };
        if page_size < 1024 || !page_size.is_power_of_two() {
            return Err(DbError::InvalidHeader(format!(
                "stored page size {page_size} is not a power of two >= 1024"
            )));
        }
        let io = Self {
            file: Mutex::new(file),
            path: path.to_path_buf(),
            page_size,
            data_offset,
            cipher,
            map: RwLock::new(None),
            use_mmap,
        };
        io.remap();
        Ok(io)
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn remap(&self) {
        if !self.use_mmap {
            return;
        }
        let file = self.file.lock();
        let map = try_map(&file);
        if map.is_none() {
            debug!("mmap unavailable for {}; falling back to file reads", self.path.display());
        }
        *self.map.write() = map;
    }

    fn page_offset(&self, id: PageId) -> u64 {
        self.data_offset + u64::from(id) * u64::from(self.page_size)
    }

    fn read_stored(&self, id: PageId, stored: &mut [u8]) -> DbResult<()> {
        let offset = self.page_offset(id);
        if let Some(map) = self.map.read().as_ref() {
            let end = offset as usize + stored.len();
            if map.len() >= end {
                stored.copy_from_slice(&map[offset as usize..end]);
                return Ok(());
            }
        }
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(offset))?;
        file.read_exact(stored)?;
        Ok(())
    }
}

impl PageIo for BasePageIo {
    fn page_size(&self) -> u32 {
        self.page_size
    }

    fn usable_page_size(&self) -> u32 {
        if self.cipher.is_some() {
            self.page_size - PAGE_CRYPTO_OVERHEAD as u32
        } else {
            self.page_size
        }
    }

    fn page_count(&self) -> DbResult<u64> {
        let len = self.file.lock().metadata()?.len();
        Ok(len.saturating_sub(self.data_offset) / u64::from(self.page_size))
    }

    fn read_page(&self, id: PageId, buf: &mut [u8]) -> DbResult<()> {
        debug_assert_eq!(buf.len(), self.usable_page_size() as usize);
        match &self.cipher {
            Some(cipher) => {
                let mut stored = vec![0u8; self.page_size as usize];
                self.read_stored(id, &mut stored)?;
                cipher.unseal(&stored, buf)
            }
            None => self.read_stored(id, buf),
        }
    }

    fn write_page(&self, id: PageId, buf: &[u8]) -> DbResult<()> {
        debug_assert_eq!(buf.len(), self.usable_page_size() as usize);
        let offset = self.page_offset(id);
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(offset))?;
        match &self.cipher {
            Some(cipher) => {
                let mut stored = vec![0u8; self.page_size as usize];
                cipher.seal(buf, &mut stored)?;
                file.write_all(&stored)?;
            }
            None => file.write_all(buf)?,
        }
        Ok(())
    }

    fn set_len_pages(&self, pages: u64) -> DbResult<()> {
        {
            let file = self.file.lock();
            file.set_len(self.data_offset + pages * u64::from(self.page_size))?;
        }
        self.remap();
        Ok(())
    }

    fn flush(&self) -> DbResult<()> {
        self.file.lock().sync_all()?;
        Ok(())
    }
}

/// Write-through LRU cache of decoded pages, keyed by page id.
pub struct CachedPageIo {
    inner: Arc<dyn PageIo>,
    cache: Mutex<LruCache<PageId, Vec<u8>>>,
}

impl CachedPageIo {
    #[must_use]
    pub fn new(inner: Arc<dyn PageIo>, capacity_pages: usize) -> Self {
        let cap = NonZeroUsize::new(capacity_pages.max(1))
            .unwrap_or_else(|| NonZeroUsize::new(1).expect("NonZeroUsize(1) must exist"));
        Self { inner, cache: Mutex::new(LruCache::new(cap)) }
    }

    pub fn warm(&self, pages: impl IntoIterator<Item = PageId>) {
        let usable = self.inner.usable_page_size() as usize;
        for id in pages {
            let mut buf = vec![0u8; usable];
            match self.inner.read_page(id, &mut buf) {
                Ok(()) => {
                    self.cache.lock().put(id, buf);
                }
                Err(e) => {
                    warn!("warmup read of page {id} failed: {e}");
                    break;
                }
            }
        }
    }
}

impl PageIo for CachedPageIo {
    fn page_size(&self) -> u32 {
        self.inner.page_size()
    }

    fn usable_page_size(&self) -> u32 {
        self.inner.usable_page_size()
    }

    fn page_count(&self) -> DbResult<u64> {
        self.inner.page_count()
    }

    fn read_page(&self, id: PageId, buf: &mut [u8]) -> DbResult<()> {
        if let Some(cached) = self.cache.lock().get(&id) {
            buf.copy_from_slice(cached);
            return Ok(());
        }
        self.inner.read_page(id, buf)?;
        self.cache.lock().put(id, buf.to_vec());
        Ok(())
    }

    fn write_page(&self, id: PageId, buf: &[u8]) -> DbResult<()> {
        self.inner.write_page(id, buf)?;
        self.cache.lock().put(id, buf.to_vec());
        Ok(())
    }

    fn set_len_pages(&self, pages: u64) -> DbResult<()> {
        self.inner.set_len_pages(pages)
    }

    fn flush(&self) -> DbResult<()> {
        self.inner.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::KdfParams;

    fn tmp(name: &str) -> PathBuf {
        let mut p = std::env::temp_dir();
        p.push(format!("quilldb-pageio-{name}-{}", std::process::id()));
        let _ = std::fs::remove_file(&p);
        p
    }

    #[test]
    fn plaintext_round_trip_and_reopen() {
        let path = tmp("plain");
        {
            let io = BasePageIo::create(&path, 1024, None, false).unwrap();
            io.set_len_pages(4).unwrap();
            let mut page0 = vec![0u8; 1024];
            page0[0..4].copy_from_slice(b"QLDB");
            page0[8..12].copy_from_slice(&1024u32.to_le_bytes());
            io.write_page(0, &page0).unwrap();
            let mut data = vec![0xABu8; 1024];
            data[8..12].copy_from_slice(&[0; 4]);
            io.write_page(3, &data).unwrap();
            io.flush().unwrap();
        }
        let io = BasePageIo::open(&path, None, false).unwrap();
        assert_eq!(io.page_size(), 1024);
        assert_eq!(io.page_count().unwrap(), 4);
        let mut buf = vec![0u8; 1024];
        io.read_page(3, &mut buf).unwrap();
        assert_eq!(buf[0], 0xAB);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn encrypted_file_requires_the_right_password() {
        let path = tmp("enc");
        let opts = EncryptionOptions {
            password: "secret".into(),
            kdf: KdfParams { t_cost: 1, m_cost_kib: 8, lanes: 1 },
        };
        {
            let io = BasePageIo::create(&path, 1024, Some(&opts), false).unwrap();
            io.set_len_pages(2).unwrap();
            let payload = vec![0x42u8; io.usable_page_size() as usize];
            io.write_page(1, &payload).unwrap();
            io.flush().unwrap();
        }
        let wrong = EncryptionOptions { password: "nope".into(), kdf: opts.kdf.clone() };
        assert!(matches!(
            BasePageIo::open(&path, Some(&wrong), false),
            Err(DbError::InvalidPassword)
        ));
        let io = BasePageIo::open(&path, Some(&opts), false).unwrap();
        assert_eq!(io.usable_page_size(), 1024 - PAGE_CRYPTO_OVERHEAD as u32);
        let mut buf = vec![0u8; io.usable_page_size() as usize];
        io.read_page(1, &mut buf).unwrap();
        assert!(buf.iter().all(|&b| b == 0x42));
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn cache_serves_repeated_reads() {
        let path = tmp("cache");
        let base: Arc<dyn PageIo> =
            Arc::new(BasePageIo::create(&path, 1024, None, false).unwrap());
        base.set_len_pages(2).unwrap();
        let mut page = vec![9u8; 1024];
        page[8..12].copy_from_slice(&1024u32.to_le_bytes());
        base.write_page(1, &page).unwrap();
        let cached = CachedPageIo::new(base, 8);
        let mut buf = vec![0u8; 1024];
        cached.read_page(1, &mut buf).unwrap();
        cached.read_page(1, &mut buf).unwrap();
        assert_eq!(buf[0], 9);
        let _ = std::fs::remove_file(&path);
    }
}
