use std::sync::Mutex;

/// Pool of reusable read buffers, each sized for one datagram.
///
/// The listener acquires one buffer per socket read and must release it on
/// every exit path. Buffers come back with whatever length the caller left
/// them at; `acquire` restores the full length before handing one out.
pub struct BufferPool {
    buf_size: usize,
    free: Mutex<Vec<Vec<u8>>>,
}

impl BufferPool {
    pub fn new(buf_size: usize) -> Self {
        Self {
            buf_size,
            free: Mutex::new(Vec::new()),
        }
    }

    pub fn buf_size(&self) -> usize {
        self.buf_size
    }

    pub fn acquire(&self) -> Vec<u8> {
        let mut buf = self
            .free
            .lock()
            .expect("buffer pool lock poisoned")
            .pop()
            .unwrap_or_else(|| Vec::with_capacity(self.buf_size));
        buf.resize(self.buf_size, 0);
        buf
    }

    pub fn release(&self, buf: Vec<u8>) {
        // A buffer from an older pool configuration is simply dropped.
        if buf.capacity() < self.buf_size {
            return;
        }
        self.free.lock().expect("buffer pool lock poisoned").push(buf);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_returns_full_length() {
        let pool = BufferPool::new(1024);
        let buf = pool.acquire();
        assert_eq!(buf.len(), 1024);
    }

    #[test]
    fn release_tolerates_truncated_length() {
        let pool = BufferPool::new(64);
        let mut buf = pool.acquire();
        buf.truncate(3);
        pool.release(buf);

        let buf = pool.acquire();
        assert_eq!(buf.len(), 64);
    }

    #[test]
    fn undersized_buffer_is_dropped() {
        let pool = BufferPool::new(64);
        pool.release(vec![0u8; 8]);
        let buf = pool.acquire();
        assert_eq!(buf.len(), 64);
    }
}
