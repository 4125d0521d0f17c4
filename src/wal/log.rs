//! Frame-structured write-ahead log.
//!
//! Frame: `[page_id:i32][page_size:i32][commit_marker:u32][salt:u32]
//! [page_data][checksum:u64]`. The commit marker is non-zero only on the
//! last frame of a transaction and stores `tx_id + 1`. Salts chain from a
//! per-file seed, binding frames to the file they belong to; the checksum is
//! the salt-seeded crc32 of the frame, zero-extended into the 8-byte slot.
//!
//! A transaction's frames are appended as one contiguous run terminated by
//! its marker frame, so recovery attributes frames positionally and replays
//! committed runs in file order (auto-commits at tx id 0 interleave freely
//! with regular transactions).

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use log::{debug, info, warn};
use parking_lot::Mutex;

use crate::errors::{DbError, DbResult};
use crate::storage::page_io::PageIo;
use crate::types::{PageId, TxId};

pub const WAL_MAGIC: &[u8; 4] = b"QWAL";
pub const WAL_FORMAT_VERSION: u32 = 1;
pub const WAL_HEADER_LEN: u64 = 16;

const FRAME_HEADER_LEN: usize = 16;
const FRAME_TRAILER_LEN: usize = 8;

const fn salt_step(s: u32) -> u32 {
    s.wrapping_mul(0x9E37_79B1).wrapping_add(0x85EB_CA6B)
}

fn frame_checksum(page_id: PageId, marker: u32, salt: u32, data: &[u8]) -> u64 {
    let mut h = crc32fast::Hasher::new_with_initial(salt);
    h.update(&(page_id as i32).to_le_bytes());
    h.update(&(data.len() as i32).to_le_bytes());
    h.update(&marker.to_le_bytes());
    h.update(&salt.to_le_bytes());
    h.update(data);
    u64::from(h.finalize())
}

struct WalState {
    /// Newest committed frame per page: byte offset of the frame's data.
    committed: HashMap<PageId, u64>,
    frames: u64,
    next_salt: u32,
    readers: u64,
    last_committed: TxId,
}

pub struct Wal {
    path: PathBuf,
    file: Mutex<File>,
    data_len: u32,
    seed: u32,
    state: Mutex<WalState>,
}

impl Wal {
    /// Creates (or truncates) the log file and writes its header with a
    /// fresh salt seed.
    ///
    /// # Errors
    /// Propagates I/O and entropy failures.
    pub fn create(path: &Path, data_len: u32) -> DbResult<Self> {
        let mut seed_bytes = [0u8; 4];
        getrandom::fill(&mut seed_bytes)
            .map_err(|e| DbError::Io(std::io::Error::other(format!("entropy: {e}"))))?;
        let seed = u32::from_le_bytes(seed_bytes);
        let mut file = OpenOptions::new().read(true).write(true).create(true).truncate(true).open(path)?;
        let mut header = [0u8; WAL_HEADER_LEN as usize];
        header[0..4].copy_from_slice(WAL_MAGIC);
        header[4..8].copy_from_slice(&WAL_FORMAT_VERSION.to_le_bytes());
        header[8..12].copy_from_slice(&data_len.to_le_bytes());
        header[12..16].copy_from_slice(&seed.to_le_bytes());
        file.write_all(&header)?;
        file.sync_data()?;
        Ok(Self {
            path: path.to_path_buf(),
            file: Mutex::new(file),
            data_len,
            seed,
            state: Mutex::new(WalState {
                committed: HashMap::new(),
                frames: 0,
                next_salt: seed,
                readers: 0,
                last_committed: 0,
            }),
        })
    }

    /// Opens an existing log. Returns the handle plus whether the file holds
    /// frames that require recovery.
    ///
    /// # Errors
    /// `InvalidHeader`/`UnsupportedVersion` on malformed headers,
    /// `ChecksumMismatch` on a data-length disagreement with the database.
    pub fn open(path: &Path, expected_data_len: u32) -> DbResult<(Self, bool)> {
        let mut file = OpenOptions::new().read(true).write(true).open(path)?;
        let len = file.metadata()?.len();
        if len < WAL_HEADER_LEN {
            // A crash before the header hit the disk leaves a stub; no
            // frames can exist, so reinitialize.
            drop(file);
            return Ok((Self::create(path, expected_data_len)?, false));
        }
        let mut header = [0u8; WAL_HEADER_LEN as usize];
        file.seek(SeekFrom::Start(0))?;
        file.read_exact(&mut header)?;
        if &header[0..4] != WAL_MAGIC {
            return Err(DbError::InvalidHeader("bad WAL magic".into()));
        }
        let version = u32::from_le_bytes(header[4..8].try_into().expect("4 bytes"));
        if version > WAL_FORMAT_VERSION {
            return Err(DbError::UnsupportedVersion(version));
        }
        let data_len = u32::from_le_bytes(header[8..12].try_into().expect("4 bytes"));
        if data_len != expected_data_len {
            return Err(DbError::ChecksumMismatch(format!(
                "WAL frame size {data_len} does not match database page payload {expected_data_len}"
            )));
        }
        let seed = u32::from_le_bytes(header[12..16].try_into().expect("4 bytes"));
        let needs_recovery = len > WAL_HEADER_LEN;
        Ok((
            Self {
                path: path.to_path_buf(),
                file: Mutex::new(file),
                data_len,
                seed,
                state: Mutex::new(WalState {
                    committed: HashMap::new(),
                    frames: 0,
                    next_salt: seed,
                    readers: 0,
                    last_committed: 0,
                }),
            },
            needs_recovery,
        ))
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub fn frames(&self) -> u64 {
        self.state.lock().frames
    }

    #[must_use]
    pub fn last_committed(&self) -> TxId {
        self.state.lock().last_committed
    }

    pub fn begin_snapshot(&self) {
        self.state.lock().readers += 1;
    }

    pub fn end_snapshot(&self) {
        let mut state = self.state.lock();
        state.readers = state.readers.saturating_sub(1);
    }

    /// Appends all frames of one transaction plus its commit marker, then
    /// flushes the log to durability and publishes the frames.
    ///
    /// # Errors
    /// On I/O failure the partial append is truncated away and the error
    /// surfaces to the caller; nothing is published.
    pub fn append_commit(&self, tx: TxId, frames: &[(PageId, Vec<u8>)]) -> DbResult<()> {
        assert!(!frames.is_empty(), "a commit must carry at least one frame");
        let mut file = self.file.lock();
        let mut state = self.state.lock();
        let start = file.seek(SeekFrom::End(0))?;
        // The marker slot is 32 bits on the wire; ids stay far below that
        // within a single log generation.
        let marker = (tx + 1) as u32;

        let mut salt = state.next_salt;
        let mut published: Vec<(PageId, u64)> = Vec::with_capacity(frames.len());
        let mut offset = start;
        let result: DbResult<()> = (|| {
            for (i, (page_id, data)) in frames.iter().enumerate() {
                debug_assert_eq!(data.len(), self.data_len as usize);
                let frame_marker = if i + 1 == frames.len() { marker } else { 0 };
                let checksum = frame_checksum(*page_id, frame_marker, salt, data);
                let mut head = [0u8; FRAME_HEADER_LEN];
                head[0..4].copy_from_slice(&(*page_id as i32).to_le_bytes());
                head[4..8].copy_from_slice(&(data.len() as i32).to_le_bytes());
                head[8..12].copy_from_slice(&frame_marker.to_le_bytes());
                head[12..16].copy_from_slice(&salt.to_le_bytes());
                file.write_all(&head)?;
                file.write_all(data)?;
                file.write_all(&checksum.to_le_bytes())?;
                published.push((*page_id, offset + FRAME_HEADER_LEN as u64));
                offset += (FRAME_HEADER_LEN + data.len() + FRAME_TRAILER_LEN) as u64;
                salt = salt_step(salt);
            }
            file.sync_data()?;
            Ok(())
        })();
        if let Err(e) = result {
            warn!("WAL append for tx {tx} failed, truncating partial run: {e}");
            let _ = file.set_len(start);
            return Err(e);
        }
        for (page_id, data_offset) in published {
            state.committed.insert(page_id, data_offset);
        }
        state.frames += frames.len() as u64;
        state.next_salt = salt;
        state.last_committed = state.last_committed.max(tx);
        Ok(())
    }

    /// Newest committed frame contents for a page, if any.
    ///
    /// # Errors
    /// Propagates read failures.
    pub fn read_committed(&self, page_id: PageId) -> DbResult<Option<Vec<u8>>> {
        let offset = {
            let state = self.state.lock();
            match state.committed.get(&page_id) {
                Some(&o) => o,
                None => return Ok(None),
            }
        };
        let mut file = self.file.lock();
        let mut data = vec![0u8; self.data_len as usize];
        file.seek(SeekFrom::Start(offset))?;
        file.read_exact(&mut data)?;
        Ok(Some(data))
    }

    /// Replays committed frames into the base file and truncates the log.
    /// Returns the maximum committed tx id found.
    ///
    /// Frames are validated by checksum and salt chain; the scan stops at
    /// the first torn or stale frame. Replay is in file order, not tx-id
    /// order.
    ///
    /// # Errors
    /// Propagates I/O failures from the scan or the base-file writes.
    pub fn recover(&self, apply_to: &dyn PageIo) -> DbResult<TxId> {
        let mut raw = Vec::new();
        {
            let mut file = self.file.lock();
            file.seek(SeekFrom::Start(WAL_HEADER_LEN))?;
            file.read_to_end(&mut raw)?;
        }
        let frame_len = FRAME_HEADER_LEN + self.data_len as usize + FRAME_TRAILER_LEN;
        let mut salt = self.seed;
        let mut runs: Vec<(Option<TxId>, Vec<(PageId, usize)>)> = vec![(None, Vec::new())];
        let mut at = 0usize;
        while at + frame_len <= raw.len() {
            let head = &raw[at..at + FRAME_HEADER_LEN];
            let page_id = i32::from_le_bytes(head[0..4].try_into().expect("4 bytes"));
            let stored_len = i32::from_le_bytes(head[4..8].try_into().expect("4 bytes"));
            let marker = u32::from_le_bytes(head[8..12].try_into().expect("4 bytes"));
            let frame_salt = u32::from_le_bytes(head[12..16].try_into().expect("4 bytes"));
            if page_id < 0 || stored_len != self.data_len as i32 || frame_salt != salt {
                debug!("WAL scan stopped at byte {at}: stale or malformed frame");
                break;
            }
            let data_at = at + FRAME_HEADER_LEN;
            let data = &raw[data_at..data_at + self.data_len as usize];
            let trailer = &raw[data_at + self.data_len as usize..at + frame_len];
            let checksum = u64::from_le_bytes(trailer.try_into().expect("8 bytes"));
            if checksum != frame_checksum(page_id as PageId, marker, salt, data) {
                debug!("WAL scan stopped at byte {at}: checksum mismatch");
                break;
            }
            let current = runs.last_mut().expect("runs is never empty");
            current.1.push((page_id as PageId, data_at));
            if marker != 0 {
                current.0 = Some(TxId::from(marker) - 1);
                runs.push((None, Vec::new()));
            }
            salt = salt_step(salt);
            at += frame_len;
        }

        let mut max_tx = 0;
        let mut applied = 0usize;
        for (tx, frames) in &runs {
            let Some(tx) = tx else { continue };
            max_tx = max_tx.max(*tx);
            for (page_id, data_at) in frames {
                apply_to.write_page(*page_id, &raw[*data_at..*data_at + self.data_len as usize])?;
                applied += 1;
            }
        }
        apply_to.flush()?;
        {
            let mut file = self.file.lock();
            file.set_len(WAL_HEADER_LEN)?;
            file.sync_data()?;
        }
        let mut state = self.state.lock();
        state.committed.clear();
        state.frames = 0;
        state.next_salt = self.seed;
        state.last_committed = max_tx;
        info!("WAL recovery applied {applied} frames, last committed tx {max_tx}");
        Ok(max_tx)
    }

    /// Applies every committed frame to the base file; the log is truncated
    /// only when no snapshot readers are active.
    ///
    /// # Errors
    /// Propagates I/O failures.
    pub fn checkpoint(&self, apply_to: &dyn PageIo) -> DbResult<()> {
        let pages: Vec<(PageId, u64)> = {
            let state = self.state.lock();
            state.committed.iter().map(|(&p, &o)| (p, o)).collect()
        };
        if pages.is_empty() {
            return Ok(());
        }
        let mut data = vec![0u8; self.data_len as usize];
        for (page_id, offset) in &pages {
            {
                let mut file = self.file.lock();
                file.seek(SeekFrom::Start(*offset))?;
                file.read_exact(&mut data)?;
            }
            apply_to.write_page(*page_id, &data)?;
        }
        apply_to.flush()?;
        let mut state = self.state.lock();
        if state.readers > 0 {
            debug!("checkpoint applied {} pages; truncation deferred, {} readers", pages.len(), state.readers);
            return Ok(());
        }
        let mut file = self.file.lock();
        file.set_len(WAL_HEADER_LEN)?;
        file.sync_data()?;
        state.committed.clear();
        state.frames = 0;
        state.next_salt = self.seed;
        info!("checkpoint applied {} pages and truncated the log", pages.len());
        Ok(())
    }
}
