//! Process-wide pool of fixed-size integer buffers.
//!
//! Formulas iterating large bitmaps borrow a buffer, fill it batch by batch
//! and give it back. Buffers are returned when their [`BufferLease`] drops,
//! so an early return or an error cannot leak them.

use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;

use crate::config::BufferPoolConfig;

static GLOBAL_POOL: OnceLock<Arc<SharedBufferPool>> = OnceLock::new();

/// Bounded pool of reusable `u32` buffers.
#[derive(Debug)]
pub struct SharedBufferPool {
    buffer_size: usize,
    max_retained: usize,
    free: Mutex<Vec<Box<[u32]>>>,
    created: AtomicUsize,
    outstanding: AtomicUsize,
}

impl SharedBufferPool {
    /// Create a pool.
    pub fn new(config: &BufferPoolConfig) -> Self {
        Self {
            buffer_size: config.buffer_size.max(1),
            max_retained: config.max_retained,
            free: Mutex::new(Vec::new()),
            created: AtomicUsize::new(0),
            outstanding: AtomicUsize::new(0),
        }
    }

    /// The process-wide pool with default configuration.
    pub fn global() -> Arc<SharedBufferPool> {
        Arc::clone(GLOBAL_POOL.get_or_init(|| {
            Arc::new(SharedBufferPool::new(&BufferPoolConfig::default()))
        }))
    }

    /// Length of every buffer.
    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// Take a buffer out of the pool. It must be handed back with
    /// [`SharedBufferPool::return_buffer`].
    pub fn borrow_buffer(&self) -> Box<[u32]> {
        self.outstanding.fetch_add(1, Ordering::Relaxed);
        if let Some(buffer) = self.free.lock().pop() {
            return buffer;
        }
        self.created.fetch_add(1, Ordering::Relaxed);
        vec![0u32; self.buffer_size].into_boxed_slice()
    }

    /// Hand a buffer back to the pool.
    pub fn return_buffer(&self, buffer: Box<[u32]>) {
        self.outstanding.fetch_sub(1, Ordering::Relaxed);
        if buffer.len() != self.buffer_size {
            return;
        }
        let mut free = self.free.lock();
        if free.len() < self.max_retained {
            free.push(buffer);
        }
    }

    /// Settle buffers that were borrowed and dropped without being handed
    /// back. Their memory is gone, the pool allocates replacements on demand.
    pub(crate) fn write_off(&self, count: usize) {
        let _ = self
            .outstanding
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| {
                Some(n.saturating_sub(count))
            });
    }

    /// Borrow a buffer that returns itself on drop.
    pub fn lease(self: &Arc<Self>) -> BufferLease {
        self.lease_tracked(None)
    }

    /// Borrow a buffer whose lifetime is also counted by `tracker`.
    pub fn lease_tracked(self: &Arc<Self>, tracker: Option<Arc<AtomicUsize>>) -> BufferLease {
        if let Some(tracker) = &tracker {
            tracker.fetch_add(1, Ordering::Relaxed);
        }
        BufferLease {
            buffer: Some(self.borrow_buffer()),
            pool: Arc::clone(self),
            tracker,
        }
    }

    /// Idle buffers ready for reuse.
    pub fn available(&self) -> usize {
        self.free.lock().len()
    }

    /// Buffers currently borrowed.
    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::Relaxed)
    }

    /// Buffers allocated since the pool was created.
    pub fn created(&self) -> usize {
        self.created.load(Ordering::Relaxed)
    }
}

/// A borrowed buffer, returned to its pool on drop.
#[derive(Debug)]
pub struct BufferLease {
    buffer: Option<Box<[u32]>>,
    pool: Arc<SharedBufferPool>,
    tracker: Option<Arc<AtomicUsize>>,
}

impl Deref for BufferLease {
    type Target = [u32];

    fn deref(&self) -> &[u32] {
        self.buffer.as_deref().unwrap_or(&[])
    }
}

impl DerefMut for BufferLease {
    fn deref_mut(&mut self) -> &mut [u32] {
        self.buffer.as_deref_mut().unwrap_or(&mut [])
    }
}

impl Drop for BufferLease {
    fn drop(&mut self) {
        if let Some(buffer) = self.buffer.take() {
            self.pool.return_buffer(buffer);
        }
        if let Some(tracker) = &self.tracker {
            tracker.fetch_sub(1, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(max_retained: usize) -> Arc<SharedBufferPool> {
        Arc::new(SharedBufferPool::new(&BufferPoolConfig {
            buffer_size: 8,
            max_retained,
        }))
    }

    #[test]
    fn test_lease_returns_buffer() {
        let pool = pool(4);
        {
            let mut lease = pool.lease();
            assert_eq!(lease.len(), 8);
            lease[0] = 42;
            assert_eq!(pool.outstanding(), 1);
        }
        assert_eq!(pool.outstanding(), 0);
        assert_eq!(pool.available(), 1);

        let _again = pool.lease();
        assert_eq!(pool.created(), 1);
    }

    #[test]
    fn test_pool_conservation() {
        let pool = pool(4);
        let before = pool.available();
        let leases: Vec<BufferLease> = (0..3).map(|_| pool.lease()).collect();
        assert_eq!(pool.outstanding(), 3);
        drop(leases);
        assert_eq!(pool.outstanding(), 0);
        assert_eq!(pool.available(), before + pool.created());
    }

    #[test]
    fn test_pool_retains_at_most_max() {
        let pool = pool(1);
        let leases: Vec<BufferLease> = (0..3).map(|_| pool.lease()).collect();
        drop(leases);
        assert_eq!(pool.available(), 1);
    }

    #[test]
    fn test_tracker_counts_leases() {
        let pool = pool(2);
        let tracker = Arc::new(AtomicUsize::new(0));
        let lease = pool.lease_tracked(Some(Arc::clone(&tracker)));
        assert_eq!(tracker.load(Ordering::Relaxed), 1);
        drop(lease);
        assert_eq!(tracker.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_explicit_borrow_and_return() {
        let pool = pool(2);
        let buffer = pool.borrow_buffer();
        pool.return_buffer(buffer);
        assert_eq!(pool.outstanding(), 0);
        assert_eq!(pool.available(), 1);
    }

    #[test]
    fn test_write_off_settles_dropped_buffers() {
        let pool = pool(2);
        let kept = pool.borrow_buffer();
        drop(pool.borrow_buffer());
        pool.write_off(1);
        assert_eq!(pool.outstanding(), 1);
        pool.return_buffer(kept);
        assert_eq!(pool.outstanding(), 0);
        pool.write_off(5);
        assert_eq!(pool.outstanding(), 0);
    }

    #[test]
    fn test_global_pool_is_shared() {
        let a = SharedBufferPool::global();
        let b = SharedBufferPool::global();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.buffer_size(), 512);
    }
}
