//! Reusable-object pools for the hot path: events, byte buffers, and gzip
//! compressors.
//!
//! Every pool hands out a cleared/reset item on `acquire` and accepts a
//! `release`. Pools never block: `acquire` falls back to allocating a fresh
//! item when empty, and `release` either recycles the item or drops it,
//! depending on the pool's retention policy. This mirrors the teacher's
//! preference for lock-free, self-synchronizing structures on the hot path
//! (`crossbeam-queue`, already in the teacher's buffer-crate dependency set)
//! over a `Mutex<Vec<T>>`.

use crossbeam_queue::SegQueue;
use flate2::{Compress, Compression};

/// Something a [`Pool`] can clear in place before handing it to the next
/// acquirer.
pub trait Poolable {
    fn clear(&mut self);
}

/// A lock-free pool of `Default + Poolable` items.
pub struct Pool<T> {
    items: SegQueue<T>,
}

impl<T: Poolable + Default> Pool<T> {
    pub fn new() -> Self {
        Self { items: SegQueue::new() }
    }

    /// Returns a cleared item, reusing one from the pool if available.
    pub fn acquire(&self) -> T {
        self.items.pop().unwrap_or_default()
    }

    /// Clears `item` and returns it to the pool for reuse.
    pub fn release(&self, mut item: T) {
        item.clear();
        self.items.push(item);
    }
}

impl<T: Poolable + Default> Default for Pool<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Pool of `Vec<u8>` scratch buffers pre-sized to avoid repeated growth on the
/// encode/upload critical path.
///
/// Buffers whose capacity has grown past `max_capacity` are dropped instead of
/// returned, bounding steady-state memory after a rare oversized batch.
pub struct BufferPool {
    items: SegQueue<Vec<u8>>,
    initial_capacity: usize,
    max_capacity: usize,
}

/// ~256 KiB, the teacher-sized default for a single encoded batch's working buffer.
pub const DEFAULT_INITIAL_BUFFER_CAPACITY: usize = 256 * 1024;
/// 1 MiB: buffers larger than this are dropped on release rather than retained.
pub const DEFAULT_MAX_BUFFER_CAPACITY: usize = 1024 * 1024;

impl BufferPool {
    pub fn new(initial_capacity: usize, max_capacity: usize) -> Self {
        Self { items: SegQueue::new(), initial_capacity, max_capacity }
    }

    pub fn acquire(&self) -> Vec<u8> {
        match self.items.pop() {
            Some(mut buf) => {
                buf.clear();
                buf
            }
            None => Vec::with_capacity(self.initial_capacity),
        }
    }

    pub fn release(&self, buf: Vec<u8>) {
        if buf.capacity() <= self.max_capacity {
            self.items.push(buf);
        }
        // else: drop it, returning the allocation to the global allocator.
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new(DEFAULT_INITIAL_BUFFER_CAPACITY, DEFAULT_MAX_BUFFER_CAPACITY)
    }
}

/// Pool of raw-deflate [`Compress`] workers configured for fastest-speed
/// compression. `Compress::reset` discards any in-flight stream state without
/// freeing the compressor's internal window, which is the expensive part to
/// re-allocate.
pub struct CompressPool {
    items: SegQueue<Compress>,
}

impl CompressPool {
    pub fn new() -> Self {
        Self { items: SegQueue::new() }
    }

    pub fn acquire(&self) -> Compress {
        match self.items.pop() {
            Some(mut compress) => {
                compress.reset();
                compress
            }
            None => Compress::new(Compression::fast(), false),
        }
    }

    pub fn release(&self, compress: Compress) {
        self.items.push(compress);
    }
}

impl Default for CompressPool {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Event;

    #[test]
    fn event_pool_clears_on_acquire_and_release() {
        let pool: Pool<Event> = Pool::new();
        let mut ev = pool.acquire();
        ev.body = "hello".to_string();
        pool.release(ev);

        let reused = pool.acquire();
        assert_eq!(reused.body, "");
    }

    #[test]
    fn buffer_pool_drops_oversized_buffers() {
        let pool = BufferPool::new(16, 32);
        let small = pool.acquire();
        pool.release(small);
        assert!(!pool.items.is_empty());

        let mut big = Vec::with_capacity(64);
        big.resize(64, 0u8);
        pool.release(big);
        // Oversized buffer must not have been retained alongside the small one.
        assert_eq!(pool.items.len(), 1);
    }

    #[test]
    fn compress_pool_reuses_workers() {
        let pool = CompressPool::new();
        let c1 = pool.acquire();
        pool.release(c1);
        let _c2 = pool.acquire();
        assert!(pool.items.is_empty());
    }
}
