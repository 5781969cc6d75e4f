//! Bounded byte FIFO for single-producer / single-consumer streams.
//!
//! The classic head/tail ring over a fixed byte array: `head` is the write
//! cursor, `tail` the read cursor, both modulo the storage size, and one
//! slot is sacrificed to distinguish full from empty (capacity is
//! `size - 1`). Bulk operations honor wrap-around by copying in at most two
//! contiguous segments.
//!
//! The C ancestry of this structure guarded every mutation with a pluggable
//! critical section (interrupt masking or a mutex). Here the `&mut self`
//! methods *are* the no-op hook — exclusivity holds by construction — and
//! [`SyncByteRing`] is the mutex-protected deployment for rings shared
//! between threads.

use std::sync::Mutex;

use crate::config::RINGBUF_SIZE;

/// Single-owner bounded byte FIFO.
///
/// # Examples
///
/// ```rust
/// use conduit::ringbuf::ByteRing;
///
/// let mut ring = ByteRing::new(16);
/// assert_eq!(ring.capacity(), 15);
/// assert_eq!(ring.write(b"hello"), 5);
///
/// let mut out = [0u8; 8];
/// assert_eq!(ring.read(&mut out), 5);
/// assert_eq!(&out[..5], b"hello");
/// ```
#[derive(Debug)]
pub struct ByteRing {
    buf: Box<[u8]>,
    head: usize,
    tail: usize,
}

impl ByteRing {
    /// Create a ring over `size` bytes of storage (capacity `size - 1`).
    ///
    /// # Panics
    ///
    /// Panics when `size < 2`.
    pub fn new(size: usize) -> Self {
        assert!(size >= 2, "ring needs at least two bytes of storage");
        Self {
            buf: vec![0u8; size].into_boxed_slice(),
            head: 0,
            tail: 0,
        }
    }

    /// Create a ring with the configured default size.
    pub fn with_default_size() -> Self {
        Self::new(RINGBUF_SIZE)
    }

    /// Usable capacity in bytes.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.buf.len() - 1
    }

    /// Bytes currently queued.
    #[inline]
    pub fn available(&self) -> usize {
        if self.head >= self.tail {
            self.head - self.tail
        } else {
            self.buf.len() - self.tail + self.head
        }
    }

    /// Bytes that can still be written.
    #[inline]
    pub fn free_space(&self) -> usize {
        self.capacity() - self.available()
    }

    /// Whether no bytes are queued.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.head == self.tail
    }

    /// Whether the ring is at capacity.
    #[inline]
    pub fn is_full(&self) -> bool {
        (self.head + 1) % self.buf.len() == self.tail
    }

    /// Enqueue one byte. Returns false when full.
    pub fn put(&mut self, byte: u8) -> bool {
        let next_head = (self.head + 1) % self.buf.len();
        if next_head == self.tail {
            return false;
        }
        self.buf[self.head] = byte;
        self.head = next_head;
        true
    }

    /// Dequeue one byte.
    pub fn get(&mut self) -> Option<u8> {
        if self.head == self.tail {
            return None;
        }
        let byte = self.buf[self.tail];
        self.tail = (self.tail + 1) % self.buf.len();
        Some(byte)
    }

    /// Enqueue up to `data.len()` bytes, returning how many were written.
    pub fn write(&mut self, data: &[u8]) -> usize {
        let to_write = data.len().min(self.free_space());
        if to_write == 0 {
            return 0;
        }

        let size = self.buf.len();
        let until_end = size - self.head;
        if to_write <= until_end {
            self.buf[self.head..self.head + to_write].copy_from_slice(&data[..to_write]);
            self.head = (self.head + to_write) % size;
        } else {
            self.buf[self.head..].copy_from_slice(&data[..until_end]);
            self.buf[..to_write - until_end].copy_from_slice(&data[until_end..to_write]);
            self.head = to_write - until_end;
        }
        to_write
    }

    /// Dequeue up to `out.len()` bytes, returning how many were read.
    pub fn read(&mut self, out: &mut [u8]) -> usize {
        let to_read = out.len().min(self.available());
        if to_read == 0 {
            return 0;
        }

        let size = self.buf.len();
        let until_end = size - self.tail;
        if to_read <= until_end {
            out[..to_read].copy_from_slice(&self.buf[self.tail..self.tail + to_read]);
            self.tail = (self.tail + to_read) % size;
        } else {
            out[..until_end].copy_from_slice(&self.buf[self.tail..]);
            out[until_end..to_read].copy_from_slice(&self.buf[..to_read - until_end]);
            self.tail = to_read - until_end;
        }
        to_read
    }

    /// Copy up to `out.len()` bytes without consuming them.
    pub fn peek(&self, out: &mut [u8]) -> usize {
        let to_peek = out.len().min(self.available());
        let mut tail = self.tail;
        for slot in out[..to_peek].iter_mut() {
            *slot = self.buf[tail];
            tail = (tail + 1) % self.buf.len();
        }
        to_peek
    }

    /// Discard all queued bytes.
    pub fn clear(&mut self) {
        self.head = 0;
        self.tail = 0;
    }
}

/// Mutex-protected ring for producer and consumer on different threads.
#[derive(Debug)]
pub struct SyncByteRing {
    inner: Mutex<ByteRing>,
}

impl SyncByteRing {
    /// Create a shared ring over `size` bytes of storage.
    pub fn new(size: usize) -> Self {
        Self {
            inner: Mutex::new(ByteRing::new(size)),
        }
    }

    /// Enqueue one byte. Returns false when full.
    pub fn put(&self, byte: u8) -> bool {
        self.lock().put(byte)
    }

    /// Dequeue one byte.
    pub fn get(&self) -> Option<u8> {
        self.lock().get()
    }

    /// Enqueue up to `data.len()` bytes, returning how many were written.
    pub fn write(&self, data: &[u8]) -> usize {
        self.lock().write(data)
    }

    /// Dequeue up to `out.len()` bytes, returning how many were read.
    pub fn read(&self, out: &mut [u8]) -> usize {
        self.lock().read(out)
    }

    /// Copy up to `out.len()` bytes without consuming them.
    pub fn peek(&self, out: &mut [u8]) -> usize {
        self.lock().peek(out)
    }

    /// Bytes currently queued.
    pub fn available(&self) -> usize {
        self.lock().available()
    }

    /// Bytes that can still be written.
    pub fn free_space(&self) -> usize {
        self.lock().free_space()
    }

    /// Discard all queued bytes.
    pub fn clear(&self) {
        self.lock().clear()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ByteRing> {
        // A poisoned ring only means a writer panicked mid-copy; cursors
        // are always consistent, so keep going.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}
