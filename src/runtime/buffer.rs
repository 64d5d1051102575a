//! Pooled byte buffers.
//!
//! Provides fixed-capacity buffer allocation without per-operation malloc
//! overhead. Every buffer drawn from the pool goes back to it exactly once:
//! I/O primitives take buffers by value and always hand them back, so the
//! caller can offer them along every exit path.
//!
//! ## Buffer Chains
//!
//! A response may be composed of several independently owned buffers
//! (header + body, or a large payload split across pool buffers).
//! `BufferChain` holds them as one logical write, tracks how far a partial
//! write got, and releases fully drained buffers as it advances.

use crate::runtime::pool::{ObjectPool, PoolStats};
use bytes::BytesMut;
use std::collections::VecDeque;
use std::io::IoSlice;

/// Thread-safe pool of fixed-capacity buffers.
///
/// Buffers are cleared on return. A buffer whose capacity dropped below the
/// pool's buffer size (e.g. after `split_to`) is not taken back.
#[derive(Debug)]
pub struct BufferPool {
    inner: ObjectPool<BytesMut>,
    buffer_size: usize,
}

impl BufferPool {
    /// Create a new buffer pool.
    ///
    /// # Arguments
    /// * `max_idle` - Maximum number of idle buffers kept for reuse
    /// * `size` - Capacity of each buffer in bytes
    pub fn new(max_idle: usize, size: usize) -> Self {
        Self {
            inner: ObjectPool::new(
                max_idle,
                move || BytesMut::with_capacity(size),
                move |buf: &mut BytesMut| {
                    buf.clear();
                    buf.capacity() >= size
                },
            ),
            buffer_size: size,
        }
    }

    /// Take a cleared buffer from the pool.
    pub fn get(&self) -> BytesMut {
        self.inner.get()
    }

    /// Return a buffer to the pool.
    pub fn offer(&self, buf: BytesMut) {
        self.inner.offer(buf);
    }

    /// Get the capacity of each buffer.
    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// Get the number of idle buffers.
    pub fn available(&self) -> usize {
        self.inner.idle()
    }

    /// Pool counters.
    pub fn stats(&self) -> PoolStats {
        self.inner.stats()
    }
}

/// An ordered set of owned buffers written as one logical operation.
///
/// The chain remembers how many bytes of its front buffer were already
/// written, so a partial scatter/gather write can be resumed with only the
/// remaining bytes.
#[derive(Debug, Default)]
pub struct BufferChain {
    /// Buffers in write order.
    buffers: VecDeque<BytesMut>,
    /// Bytes of the front buffer already written.
    head_written: usize,
}

impl BufferChain {
    /// Create a new empty buffer chain.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a buffer to the end of the chain. Empty buffers are kept so
    /// that they are handed back on release like any other.
    pub fn push(&mut self, buf: BytesMut) {
        self.buffers.push_back(buf);
    }

    /// Bytes not yet written.
    pub fn remaining(&self) -> usize {
        self.buffers.iter().map(|b| b.len()).sum::<usize>() - self.head_written
    }

    /// Check if every byte of the chain has been written.
    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    /// Number of buffers still held by the chain.
    pub fn buffer_count(&self) -> usize {
        self.buffers.len()
    }

    /// Create IoSlice views over the unwritten bytes, for scatter-gather I/O.
    pub fn io_slices(&self) -> Vec<IoSlice<'_>> {
        let mut slices = Vec::with_capacity(self.buffers.len());
        for (i, buf) in self.buffers.iter().enumerate() {
            let start = if i == 0 { self.head_written } else { 0 };
            if start < buf.len() {
                slices.push(IoSlice::new(&buf[start..]));
            }
        }
        slices
    }

    /// Mark `cnt` bytes as written.
    ///
    /// Buffers that become fully drained are removed from the chain and
    /// passed to `drained`, in order.
    pub fn advance(&mut self, mut cnt: usize, mut drained: impl FnMut(BytesMut)) {
        while let Some(front) = self.buffers.front() {
            let left = front.len() - self.head_written;
            if cnt < left {
                self.head_written += cnt;
                return;
            }
            cnt -= left;
            self.head_written = 0;
            if let Some(buf) = self.buffers.pop_front() {
                drained(buf);
            }
            if cnt == 0 && self.buffers.front().is_some_and(|b| !b.is_empty()) {
                return;
            }
        }
    }

    /// Hand every remaining buffer to `release`, leaving the chain empty.
    pub fn release(&mut self, mut release: impl FnMut(BytesMut)) {
        self.head_written = 0;
        for buf in self.buffers.drain(..) {
            release(buf);
        }
    }
}

impl From<BytesMut> for BufferChain {
    fn from(buf: BytesMut) -> Self {
        let mut chain = Self::new();
        chain.push(buf);
        chain
    }
}

impl From<Vec<BytesMut>> for BufferChain {
    fn from(buffers: Vec<BytesMut>) -> Self {
        Self {
            buffers: buffers.into(),
            head_written: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filled(pool: &BufferPool, data: &[u8]) -> BytesMut {
        let mut buf = pool.get();
        buf.extend_from_slice(data);
        buf
    }

    #[test]
    fn test_buffer_pool_basic() {
        let pool = BufferPool::new(4, 1024);
        assert_eq!(pool.buffer_size(), 1024);
        assert_eq!(pool.available(), 0);

        let mut b0 = pool.get();
        assert!(b0.capacity() >= 1024);
        b0.extend_from_slice(b"hello");
        pool.offer(b0);
        assert_eq!(pool.available(), 1);

        // Reused buffer comes back cleared
        let b1 = pool.get();
        assert!(b1.is_empty());
        assert_eq!(pool.stats().created, 1);
        pool.offer(b1);
    }

    #[test]
    fn test_buffer_pool_rejects_shrunk_buffer() {
        let pool = BufferPool::new(4, 64);
        let mut buf = pool.get();
        buf.extend_from_slice(&[0u8; 64]);
        let _head = buf.split_to(32);
        pool.offer(buf);
        assert_eq!(pool.available(), 0);
        assert_eq!(pool.stats().recycled, 0);
    }

    #[test]
    fn test_buffer_chain_partial_advance() {
        let pool = BufferPool::new(4, 64);
        let mut chain = BufferChain::new();
        chain.push(filled(&pool, b"head"));
        chain.push(filled(&pool, b"body!"));
        assert_eq!(chain.remaining(), 9);

        let mut drained = Vec::new();
        chain.advance(2, |b| drained.push(b));
        assert!(drained.is_empty());
        let slices = chain.io_slices();
        assert_eq!(slices.len(), 2);
        assert_eq!(&*slices[0], b"ad");

        // Crossing the buffer boundary drains the header
        chain.advance(3, |b| drained.push(b));
        assert_eq!(drained.len(), 1);
        assert_eq!(&drained[0][..], b"head");
        let slices = chain.io_slices();
        assert_eq!(slices.len(), 1);
        assert_eq!(&*slices[0], b"ody!");

        chain.advance(4, |b| drained.push(b));
        assert!(chain.is_empty());
        assert_eq!(drained.len(), 2);
        assert_eq!(chain.buffer_count(), 0);
    }

    #[test]
    fn test_buffer_chain_release_returns_everything() {
        let pool = BufferPool::new(8, 64);
        let mut chain = BufferChain::from(vec![
            filled(&pool, b"a"),
            filled(&pool, b""),
            filled(&pool, b"c"),
        ]);
        chain.advance(1, |b| pool.offer(b));
        chain.release(|b| pool.offer(b));

        let stats = pool.stats();
        assert_eq!(stats.polled, 3);
        assert_eq!(stats.offered, 3);
        assert_eq!(chain.buffer_count(), 0);
    }

    #[test]
    fn test_buffer_chain_skips_empty_buffers_when_draining() {
        let pool = BufferPool::new(8, 64);
        let mut chain = BufferChain::from(vec![filled(&pool, b"ab"), filled(&pool, b"")]);
        let mut drained = 0;
        chain.advance(2, |_| drained += 1);
        assert_eq!(drained, 2);
        assert!(chain.is_empty());
    }
}
