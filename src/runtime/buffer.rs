//! Per-worker read buffer pool.
//!
//! Every connection owns exactly one `ReadBuf` for its whole lifetime.
//! Buffers are handed out by value and returned by value, so a buffer can
//! only ever be reachable from one place: the pool, a connection, or the
//! descriptor of an outstanding receive.
//!
//! Buffers are allocated lazily up to the pool limit and recycled LIFO for
//! cache locality.

use std::fmt;

/// A fixed-capacity read buffer with a stable identity.
///
/// Bytes `[0, filled)` hold received data not yet answered; the remainder
/// is the spare region a receive may write into. The heap allocation never
/// moves, so a pointer into the spare region stays valid while the buffer
/// is parked inside a descriptor.
pub struct ReadBuf {
    id: usize,
    data: Box<[u8]>,
    filled: usize,
}

impl ReadBuf {
    fn new(id: usize, size: usize) -> Self {
        Self {
            id,
            data: vec![0u8; size].into_boxed_slice(),
            filled: 0,
        }
    }

    /// Pool-unique identity of this buffer.
    #[inline]
    pub fn id(&self) -> usize {
        self.id
    }

    /// Total capacity in bytes.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Number of buffered bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.filled
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.filled == 0
    }

    /// Whether there is no spare room left for another receive.
    #[inline]
    pub fn is_full(&self) -> bool {
        self.filled == self.data.len()
    }

    /// Buffered bytes.
    #[inline]
    pub fn filled(&self) -> &[u8] {
        &self.data[..self.filled]
    }

    /// Spare region after the buffered bytes.
    #[inline]
    pub fn spare_mut(&mut self) -> &mut [u8] {
        &mut self.data[self.filled..]
    }

    /// Record that `n` bytes were written into the spare region.
    pub fn commit(&mut self, n: usize) {
        debug_assert!(self.filled + n <= self.data.len(), "commit past capacity");
        self.filled = (self.filled + n).min(self.data.len());
    }

    /// Drop the first `n` buffered bytes, shifting any remainder to the front.
    pub fn consume(&mut self, n: usize) {
        if n >= self.filled {
            self.filled = 0;
        } else {
            self.data.copy_within(n..self.filled, 0);
            self.filled -= n;
        }
    }

    /// Forget all buffered bytes.
    pub fn clear(&mut self) {
        self.filled = 0;
    }
}

impl fmt::Debug for ReadBuf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReadBuf")
            .field("id", &self.id)
            .field("filled", &self.filled)
            .field("capacity", &self.data.len())
            .finish()
    }
}

/// Pool of read buffers owned by one worker.
pub struct BufferPool {
    /// Returned buffers ready for reuse (LIFO).
    free: Vec<ReadBuf>,
    /// Buffers ever created; also the next buffer id.
    created: usize,
    /// Maximum number of buffers this pool may create.
    limit: usize,
    /// Size of each buffer.
    buffer_size: usize,
}

impl BufferPool {
    /// Create a pool that hands out up to `limit` buffers of `size` bytes.
    pub fn new(limit: usize, size: usize) -> Self {
        Self {
            free: Vec::with_capacity(limit.min(1024)),
            created: 0,
            limit,
            buffer_size: size,
        }
    }

    /// Take a buffer out of the pool.
    ///
    /// Returns `None` when every buffer is owned elsewhere.
    pub fn alloc(&mut self) -> Option<ReadBuf> {
        if let Some(mut buf) = self.free.pop() {
            buf.clear();
            return Some(buf);
        }
        if self.created < self.limit {
            let buf = ReadBuf::new(self.created, self.buffer_size);
            self.created += 1;
            return Some(buf);
        }
        None
    }

    /// Return a buffer to the pool.
    pub fn free(&mut self, mut buf: ReadBuf) {
        debug_assert!(buf.id < self.created, "buffer from another pool");
        buf.clear();
        self.free.push(buf);
    }

    /// Size of each buffer.
    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// Maximum number of buffers.
    pub fn capacity(&self) -> usize {
        self.limit
    }

    /// Buffers that can still be handed out.
    pub fn available(&self) -> usize {
        self.free.len() + (self.limit - self.created)
    }

    /// Buffers currently owned outside the pool.
    pub fn outstanding(&self) -> usize {
        self.created - self.free.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buffer_pool_basic() {
        let mut pool = BufferPool::new(2, 64);

        assert_eq!(pool.capacity(), 2);
        assert_eq!(pool.available(), 2);
        assert_eq!(pool.buffer_size(), 64);

        let b0 = pool.alloc().unwrap();
        let b1 = pool.alloc().unwrap();
        assert_ne!(b0.id(), b1.id());
        assert_eq!(pool.outstanding(), 2);
        assert!(pool.alloc().is_none());

        let id1 = b1.id();
        pool.free(b1);
        assert_eq!(pool.available(), 1);

        // LIFO reuse keeps the identity
        let b2 = pool.alloc().unwrap();
        assert_eq!(b2.id(), id1);

        pool.free(b0);
        pool.free(b2);
        assert_eq!(pool.outstanding(), 0);
    }

    #[test]
    fn test_read_buf_fill_and_consume() {
        let mut pool = BufferPool::new(1, 16);
        let mut buf = pool.alloc().unwrap();

        buf.spare_mut()[..10].copy_from_slice(b"GET /\r\nabc");
        buf.commit(10);
        assert_eq!(buf.filled(), b"GET /\r\nabc");
        assert_eq!(buf.spare_mut().len(), 6);

        buf.consume(7);
        assert_eq!(buf.filled(), b"abc");

        buf.consume(100);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_read_buf_full() {
        let mut pool = BufferPool::new(1, 4);
        let mut buf = pool.alloc().unwrap();
        buf.spare_mut().copy_from_slice(b"abcd");
        buf.commit(4);
        assert!(buf.is_full());
        assert!(buf.spare_mut().is_empty());
    }

    #[test]
    fn test_freed_buffer_comes_back_empty() {
        let mut pool = BufferPool::new(1, 8);
        let mut buf = pool.alloc().unwrap();
        buf.spare_mut()[..3].copy_from_slice(b"xyz");
        buf.commit(3);
        pool.free(buf);

        let buf = pool.alloc().unwrap();
        assert!(buf.is_empty());
    }
}
