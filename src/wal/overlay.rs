//! Copy-on-write page overlay for transactions.
//!
//! Reads resolve, in priority order: the current write session's frames
//! (visible only to the committing thread), the newest committed WAL frame,
//! then the base file. Writes during a session accumulate in memory; commit
//! appends them to the log as one run with a commit marker. Without a WAL
//! (durability traded away by configuration) commit writes the frames
//! straight to the base file.

use std::collections::HashMap;
use std::sync::Arc;
use std::thread::ThreadId;

use parking_lot::Mutex;

use crate::errors::{DbError, DbResult};
use crate::storage::page_io::PageIo;
use crate::types::{PageId, TxId};
use crate::wal::log::Wal;

struct WriteSession {
    tx_id: TxId,
    owner: ThreadId,
    frames: HashMap<PageId, Vec<u8>>,
    order: Vec<PageId>,
}

pub struct TxPageIo {
    inner: Arc<dyn PageIo>,
    wal: Option<Arc<Wal>>,
    session: Mutex<Option<WriteSession>>,
}

impl TxPageIo {
    #[must_use]
    pub fn new(inner: Arc<dyn PageIo>, wal: Option<Arc<Wal>>) -> Self {
        Self { inner, wal, session: Mutex::new(None) }
    }

    #[must_use]
    pub fn wal(&self) -> Option<&Arc<Wal>> {
        self.wal.as_ref()
    }

    /// Starts the write phase of a transaction. Callers serialize commits,
    /// so at most one session exists at a time.
    ///
    /// # Errors
    /// Returns an error if a session is somehow still active.
    pub fn begin_write(&self, tx_id: TxId) -> DbResult<()> {
        let mut session = self.session.lock();
        if session.is_some() {
            return Err(DbError::Io(std::io::Error::other(
                "a write session is already active",
            )));
        }
        *session = Some(WriteSession {
            tx_id,
            owner: std::thread::current().id(),
            frames: HashMap::new(),
            order: Vec::new(),
        });
        Ok(())
    }

    /// Publishes the session: appends all frames plus the commit marker and
    /// fsyncs (WAL mode), or writes the frames through and flushes (no-WAL
    /// mode). On error the session is discarded and nothing is published.
    ///
    /// # Errors
    /// Propagates append/write failures.
    pub fn commit_write(&self) -> DbResult<()> {
        let session = self
            .session
            .lock()
            .take()
            .ok_or_else(|| DbError::Io(std::io::Error::other("no active write session")))?;
        if session.order.is_empty() {
            return Ok(());
        }
        let mut frames: Vec<(PageId, Vec<u8>)> = Vec::with_capacity(session.order.len());
        let mut map = session.frames;
        for page_id in session.order {
            if let Some(data) = map.remove(&page_id) {
                frames.push((page_id, data));
            }
        }
        match &self.wal {
            Some(wal) => wal.append_commit(session.tx_id, &frames),
            None => {
                for (page_id, data) in &frames {
                    self.inner.write_page(*page_id, data)?;
                }
                self.inner.flush()
            }
        }
    }

    /// Discards the session's frames.
    pub fn abort_write(&self) {
        self.session.lock().take();
    }
}

impl PageIo for TxPageIo {
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
        {
            let session = self.session.lock();
            if let Some(session) = session.as_ref()
                && session.owner == std::thread::current().id()
                && let Some(data) = session.frames.get(&id)
            {
                buf.copy_from_slice(data);
                return Ok(());
            }
        }
        if let Some(wal) = &self.wal
            && let Some(data) = wal.read_committed(id)?
        {
            buf.copy_from_slice(&data);
            return Ok(());
        }
        self.inner.read_page(id, buf)
    }

    fn write_page(&self, id: PageId, buf: &[u8]) -> DbResult<()> {
        {
            let mut session = self.session.lock();
            if let Some(session) = session.as_mut() {
                debug_assert_eq!(
                    session.owner,
                    std::thread::current().id(),
                    "page writes must come from the committing thread"
                );
                if session.frames.insert(id, buf.to_vec()).is_none() {
                    session.order.push(id);
                }
                return Ok(());
            }
        }
        // No session: initialization writes go straight to the base stack.
        self.inner.write_page(id, buf)
    }

    fn set_len_pages(&self, pages: u64) -> DbResult<()> {
        // File growth bypasses the log so zeros are never materialized as
        // frames.
        self.inner.set_len_pages(pages)
    }

    fn flush(&self) -> DbResult<()> {
        self.inner.flush()
    }
}
