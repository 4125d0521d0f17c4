use std::sync::Arc;

use parking_lot::Mutex;

/// Pool of page-sized byte buffers. Buffers are zeroed on rent and handed
/// back on drop; every exit path returns its buffer automatically.
pub struct BufferPool {
    buf_len: usize,
    free: Mutex<Vec<Vec<u8>>>,
    max_retained: usize,
}

impl BufferPool {
    #[must_use]
    pub fn new(buf_len: usize, max_retained: usize) -> Arc<Self> {
        Arc::new(Self { buf_len, free: Mutex::new(Vec::new()), max_retained })
    }

    #[must_use]
    pub const fn buf_len(&self) -> usize {
        self.buf_len
    }

    pub fn rent(self: &Arc<Self>) -> PooledBuf {
        let mut buf = self.free.lock().pop().unwrap_or_else(|| vec![0u8; self.buf_len]);
        buf.iter_mut().for_each(|b| *b = 0);
        PooledBuf { pool: Arc::clone(self), buf }
    }

    fn give_back(&self, mut buf: Vec<u8>) {
        if buf.len() != self.buf_len {
            return;
        }
        let mut free = self.free.lock();
        if free.len() < self.max_retained {
            buf.iter_mut().for_each(|b| *b = 0);
            free.push(buf);
        }
    }
}

pub struct PooledBuf {
    pool: Arc<BufferPool>,
    buf: Vec<u8>,
}

impl std::ops::Deref for PooledBuf {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.buf
    }
}

impl std::ops::DerefMut for PooledBuf {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.buf
    }
}

impl Drop for PooledBuf {
    fn drop(&mut self) {
        self.pool.give_back(std::mem::take(&mut self.buf));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rented_buffers_are_zeroed_and_recycled() {
        let pool = BufferPool::new(64, 4);
        {
            let mut b = pool.rent();
            b[0] = 0xAA;
        }
        let b = pool.rent();
        assert_eq!(b[0], 0);
        assert_eq!(b.len(), 64);
    }
}
