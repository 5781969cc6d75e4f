//! Reference-counted byte buffers with copy-on-share semantics, plus a
//! recycling block pool for the zero-copy send path.
//!
//! A [`SharedBuf`] hands out cheap clones that all view the same bytes.
//! Mutation through a shared handle first detaches a private copy
//! (`clone_if_shared` semantics), so readers holding older clones never
//! observe writes. [`BufferPool`] amortizes allocation for fixed-size
//! blocks the way a frame-per-send workload wants.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// A reference-counted byte buffer.
///
/// # Examples
///
/// ```rust
/// use conduit::pool::SharedBuf;
///
/// let mut buf = SharedBuf::from_slice(b"hello");
/// let snapshot = buf.clone();
/// assert!(buf.is_shared());
///
/// // Mutation through a shared handle detaches a private copy.
/// buf.make_mut()[0] = b'H';
/// assert_eq!(buf.as_slice(), b"Hello");
/// assert_eq!(snapshot.as_slice(), b"hello");
/// ```
#[derive(Clone, Debug, Default)]
pub struct SharedBuf {
    inner: Arc<Vec<u8>>,
}

impl SharedBuf {
    /// Allocate a zeroed buffer of `len` bytes.
    pub fn zeroed(len: usize) -> Self {
        Self {
            inner: Arc::new(vec![0u8; len]),
        }
    }

    /// Copy `data` into a fresh buffer.
    pub fn from_slice(data: &[u8]) -> Self {
        Self {
            inner: Arc::new(data.to_vec()),
        }
    }

    /// Wrap an owned vector without copying.
    pub fn from_vec(data: Vec<u8>) -> Self {
        Self {
            inner: Arc::new(data),
        }
    }

    /// View the bytes.
    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        &self.inner
    }

    /// Buffer length in bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Whether the buffer is empty.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Number of live handles to these bytes.
    #[inline]
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.inner)
    }

    /// Whether another handle currently shares the bytes.
    #[inline]
    pub fn is_shared(&self) -> bool {
        self.ref_count() > 1
    }

    /// Mutable access, detaching a private copy first when shared.
    pub fn make_mut(&mut self) -> &mut Vec<u8> {
        Arc::make_mut(&mut self.inner)
    }

    /// Mutable access only while this handle is unique.
    ///
    /// Returns `None` when the buffer is shared; use
    /// [`SharedBuf::make_mut`] to copy-on-write instead.
    pub fn try_mut(&mut self) -> Option<&mut Vec<u8>> {
        Arc::get_mut(&mut self.inner)
    }

    /// Recover the owned vector when this is the last handle.
    pub fn into_vec(self) -> Vec<u8> {
        Arc::try_unwrap(self.inner).unwrap_or_else(|shared| shared.as_ref().clone())
    }
}

impl AsRef<[u8]> for SharedBuf {
    fn as_ref(&self) -> &[u8] {
        self.as_slice()
    }
}

impl From<Vec<u8>> for SharedBuf {
    fn from(data: Vec<u8>) -> Self {
        Self::from_vec(data)
    }
}

/// Counters exposed by [`BufferPool::stats`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Buffers handed out.
    pub allocations: u64,
    /// Allocations served from the free list.
    pub pool_hits: u64,
    /// Allocations that fell through to the system allocator.
    pub pool_misses: u64,
    /// Buffers returned for reuse.
    pub recycled: u64,
    /// Largest free-list depth observed.
    pub peak_free: u64,
}

/// Recycling allocator for fixed-size byte blocks.
///
/// Requests at or below the block size reuse returned blocks; larger
/// requests fall through to a plain allocation. At most
/// [`BufferPool::MAX_FREE_BLOCKS`] blocks are retained.
pub struct BufferPool {
    block_size: usize,
    free: Mutex<Vec<Vec<u8>>>,
    allocations: AtomicU64,
    pool_hits: AtomicU64,
    pool_misses: AtomicU64,
    recycled: AtomicU64,
    peak_free: AtomicU64,
}

impl BufferPool {
    /// Default block size in bytes.
    pub const DEFAULT_BLOCK_SIZE: usize = 4096;
    /// Maximum number of retained free blocks.
    pub const MAX_FREE_BLOCKS: usize = 64;

    /// Create a pool with the given block size.
    pub fn new(block_size: usize) -> Self {
        Self {
            block_size,
            free: Mutex::new(Vec::new()),
            allocations: AtomicU64::new(0),
            pool_hits: AtomicU64::new(0),
            pool_misses: AtomicU64::new(0),
            recycled: AtomicU64::new(0),
            peak_free: AtomicU64::new(0),
        }
    }

    /// Block size this pool recycles.
    #[inline]
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Allocate a zeroed buffer of `len` bytes.
    pub fn allocate(&self, len: usize) -> SharedBuf {
        self.allocations.fetch_add(1, Ordering::Relaxed);

        if len <= self.block_size {
            let reused = self.free.lock().unwrap_or_else(|e| e.into_inner()).pop();
            if let Some(mut block) = reused {
                self.pool_hits.fetch_add(1, Ordering::Relaxed);
                block.clear();
                block.resize(len, 0);
                return SharedBuf::from_vec(block);
            }
            self.pool_misses.fetch_add(1, Ordering::Relaxed);
            let mut block = Vec::with_capacity(self.block_size);
            block.resize(len, 0);
            return SharedBuf::from_vec(block);
        }

        self.pool_misses.fetch_add(1, Ordering::Relaxed);
        SharedBuf::zeroed(len)
    }

    /// Allocate a buffer initialized from `data`.
    pub fn allocate_from(&self, data: &[u8]) -> SharedBuf {
        let mut buf = self.allocate(data.len());
        buf.make_mut().copy_from_slice(data);
        buf
    }

    /// Return a buffer for reuse.
    ///
    /// Only uniquely-held, block-sized buffers are retained; anything else
    /// simply drops.
    pub fn recycle(&self, buf: SharedBuf) {
        if buf.is_shared() || buf.len() > self.block_size {
            return;
        }
        let block = buf.into_vec();
        if block.capacity() < self.block_size {
            return;
        }

        let mut free = self.free.lock().unwrap_or_else(|e| e.into_inner());
        if free.len() < Self::MAX_FREE_BLOCKS {
            free.push(block);
            self.recycled.fetch_add(1, Ordering::Relaxed);
            let depth = free.len() as u64;
            self.peak_free.fetch_max(depth, Ordering::Relaxed);
        }
    }

    /// Drop all retained blocks.
    pub fn clear(&self) {
        self.free.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }

    /// Snapshot the counters.
    pub fn stats(&self) -> PoolStats {
        PoolStats {
            allocations: self.allocations.load(Ordering::Relaxed),
            pool_hits: self.pool_hits.load(Ordering::Relaxed),
            pool_misses: self.pool_misses.load(Ordering::Relaxed),
            recycled: self.recycled.load(Ordering::Relaxed),
            peak_free: self.peak_free.load(Ordering::Relaxed),
        }
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new(Self::DEFAULT_BLOCK_SIZE)
    }
}
