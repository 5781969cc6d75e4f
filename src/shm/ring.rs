//! Multi-reader ring layout inside the shared region.
//!
//! Each endpoint owns one ring:
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────┐
//! │ RingHeader (64 bytes)                                         │
//! │   write_pos: AtomicU64   │ capacity: AtomicU64                │
//! ├───────────────────────────────────────────────────────────────┤
//! │ ReaderState[0..max_readers] (64 bytes each, own cache line)   │
//! │   read_pos │ active │ reader_id │ last_access                 │
//! ├───────────────────────────────────────────────────────────────┤
//! │ data[0..capacity]  (capacity is a power of two)               │
//! └───────────────────────────────────────────────────────────────┘
//! ```
//!
//! `write_pos` and every `read_pos` grow monotonically without modulus;
//! wrap is implicit through masking, which is why capacity must be a power
//! of two. The writer-side invariant
//! `write_pos − slowest_active_read_pos ≤ capacity` makes the broadcast
//! lossless: the slowest registered reader gates writable space, and a
//! reader that deactivates stops gating immediately. Readers never block
//! the writer; cursor publication is plain acquire/release.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::crc::crc32;

/// Size of the intra-ring message header.
pub(crate) const MSG_HEADER_SIZE: usize = 28;

/// Sentinel for an unowned reader slot.
const NO_READER: u32 = u32::MAX;

/// Per-ring control word, one cache line.
#[repr(C, align(64))]
pub(crate) struct RingHeader {
    /// Monotonic write cursor, published with release ordering.
    write_pos: AtomicU64,
    /// Ring capacity in bytes; power of two, set once at init.
    capacity: AtomicU64,
}

/// One registered reader, cache-line aligned to avoid false sharing
/// between reader cursors.
#[repr(C, align(64))]
pub(crate) struct ReaderState {
    read_pos: AtomicU64,
    active: AtomicU32,
    reader_id: AtomicU32,
    last_access_secs: AtomicU32,
}

/// A message read out of a ring.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RingMessage {
    /// Endpoint that wrote the message.
    pub sender: u32,
    /// Ring position at publish time; strictly increasing per ring.
    pub sequence: u64,
    /// Wall-clock publish time, seconds since the epoch.
    pub timestamp_secs: u32,
    /// Message payload.
    pub payload: Vec<u8>,
}

struct MsgHeader {
    length: u32,
    sender: u32,
    sequence: u64,
    timestamp_secs: u32,
    payload_crc: u32,
    flags: u8,
}

impl MsgHeader {
    fn to_bytes(&self) -> [u8; MSG_HEADER_SIZE] {
        let mut buf = [0u8; MSG_HEADER_SIZE];
        buf[0..4].copy_from_slice(&self.length.to_le_bytes());
        buf[4..8].copy_from_slice(&self.sender.to_le_bytes());
        buf[8..16].copy_from_slice(&self.sequence.to_le_bytes());
        buf[16..20].copy_from_slice(&self.timestamp_secs.to_le_bytes());
        buf[20..24].copy_from_slice(&self.payload_crc.to_le_bytes());
        buf[24] = self.flags;
        buf
    }

    fn from_bytes(buf: &[u8; MSG_HEADER_SIZE]) -> Self {
        Self {
            length: u32::from_le_bytes(buf[0..4].try_into().unwrap()),
            sender: u32::from_le_bytes(buf[4..8].try_into().unwrap()),
            sequence: u64::from_le_bytes(buf[8..16].try_into().unwrap()),
            timestamp_secs: u32::from_le_bytes(buf[16..20].try_into().unwrap()),
            payload_crc: u32::from_le_bytes(buf[20..24].try_into().unwrap()),
            flags: buf[24],
        }
    }
}

fn now_secs() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as u32)
        .unwrap_or(0)
}

/// Borrowed view over one endpoint's ring inside the mapped region.
pub(crate) struct RingView<'a> {
    header: &'a RingHeader,
    readers: &'a [ReaderState],
    data: *mut u8,
    capacity: u64,
}

// SAFETY: all mutable ring state is atomics or raw shared-memory bytes
// whose writers are serialized by the per-endpoint lock.
unsafe impl Send for RingView<'_> {}

impl<'a> RingView<'a> {
    /// Assemble a view from raw region pointers.
    ///
    /// # Safety
    ///
    /// `header` must point at an initialized `RingHeader` followed by
    /// `max_readers` `ReaderState` slots and `capacity` data bytes, all
    /// inside one live mapping.
    pub(crate) unsafe fn from_raw(
        header: *const RingHeader,
        readers: *const ReaderState,
        data: *mut u8,
        max_readers: u32,
    ) -> Self {
        let header = unsafe { &*header };
        let readers = unsafe { std::slice::from_raw_parts(readers, max_readers as usize) };
        let capacity = header.capacity.load(Ordering::Acquire);
        Self {
            header,
            readers,
            data,
            capacity,
        }
    }

    /// Initialize ring state. Called once by the region creator.
    ///
    /// # Panics
    ///
    /// Panics when `capacity` is not a power of two.
    pub(crate) fn init(&self, capacity: u64) {
        assert!(
            capacity.is_power_of_two(),
            "ring capacity must be a power of two"
        );
        self.header.capacity.store(capacity, Ordering::Release);
        self.header.write_pos.store(0, Ordering::Release);
        for reader in self.readers {
            reader.read_pos.store(0, Ordering::Relaxed);
            reader.reader_id.store(NO_READER, Ordering::Relaxed);
            reader.last_access_secs.store(0, Ordering::Relaxed);
            reader.active.store(0, Ordering::Release);
        }
    }

    #[inline]
    fn mask(&self) -> u64 {
        self.capacity - 1
    }

    /// Claim an inactive reader slot for `reader_id`.
    pub(crate) fn register_reader(&self, reader_id: u32) -> bool {
        for reader in self.readers {
            if reader
                .active
                .compare_exchange(0, 1, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                reader.reader_id.store(reader_id, Ordering::Release);
                reader.read_pos.store(
                    self.header.write_pos.load(Ordering::Acquire),
                    Ordering::Release,
                );
                reader.last_access_secs.store(now_secs(), Ordering::Relaxed);
                return true;
            }
        }
        false
    }

    /// Release every slot owned by `reader_id`.
    pub(crate) fn unregister_reader(&self, reader_id: u32) {
        for reader in self.readers {
            if reader.active.load(Ordering::Acquire) != 0
                && reader.reader_id.load(Ordering::Acquire) == reader_id
            {
                reader.active.store(0, Ordering::Release);
                reader.reader_id.store(NO_READER, Ordering::Release);
            }
        }
    }

    fn slowest_active_pos(&self) -> u64 {
        let mut min_pos = self.header.write_pos.load(Ordering::Acquire);
        for reader in self.readers {
            if reader.active.load(Ordering::Acquire) != 0 {
                let pos = reader.read_pos.load(Ordering::Acquire);
                if pos < min_pos {
                    min_pos = pos;
                }
            }
        }
        min_pos
    }

    /// Writable bytes before the slowest active reader gates the writer.
    pub(crate) fn available_write(&self) -> u64 {
        let w = self.header.write_pos.load(Ordering::Acquire);
        self.capacity - (w - self.slowest_active_pos())
    }

    /// Unread bytes for `reader_id`, zero when not registered.
    pub(crate) fn available_read(&self, reader_id: u32) -> u64 {
        match self.find_reader(reader_id) {
            Some(reader) => {
                let w = self.header.write_pos.load(Ordering::Acquire);
                w - reader.read_pos.load(Ordering::Acquire)
            }
            None => 0,
        }
    }

    /// Number of currently registered readers.
    pub(crate) fn active_readers(&self) -> u32 {
        self.readers
            .iter()
            .filter(|r| r.active.load(Ordering::Acquire) != 0)
            .count() as u32
    }

    /// Publish one message. The caller must hold the ring's endpoint lock.
    ///
    /// Returns false when the slowest active reader leaves insufficient
    /// space; the message is dropped, never truncated.
    pub(crate) fn write(&self, payload: &[u8], sender: u32) -> bool {
        let total = (MSG_HEADER_SIZE + payload.len()) as u64;
        if total > self.capacity || self.available_write() < total {
            return false;
        }

        let w = self.header.write_pos.load(Ordering::Relaxed);
        let header = MsgHeader {
            length: payload.len() as u32,
            sender,
            sequence: w,
            timestamp_secs: now_secs(),
            payload_crc: if payload.is_empty() {
                0
            } else {
                crc32(payload)
            },
            flags: 0,
        };

        self.copy_in(w, &header.to_bytes());
        if !payload.is_empty() {
            self.copy_in(w + MSG_HEADER_SIZE as u64, payload);
        }
        self.header.write_pos.store(w + total, Ordering::Release);
        true
    }

    /// Consume the next message for `reader_id`, wait-free.
    pub(crate) fn read(&self, reader_id: u32) -> Option<RingMessage> {
        let reader = self.find_reader(reader_id)?;

        let r = reader.read_pos.load(Ordering::Relaxed);
        let w = self.header.write_pos.load(Ordering::Acquire);
        if w - r < MSG_HEADER_SIZE as u64 {
            return None;
        }

        let mut header_bytes = [0u8; MSG_HEADER_SIZE];
        self.copy_out(r, &mut header_bytes);
        let header = MsgHeader::from_bytes(&header_bytes);

        let payload_len = header.length as u64;
        if payload_len > self.capacity - MSG_HEADER_SIZE as u64 {
            // Corrupt length; skip the header and resynchronize at the
            // writer's cursor.
            tracing::error!(payload_len, "corrupt ring message length");
            reader.read_pos.store(w, Ordering::Release);
            return None;
        }
        if w - (r + MSG_HEADER_SIZE as u64) < payload_len {
            // Header published but payload not yet visible.
            return None;
        }

        let mut payload = vec![0u8; header.length as usize];
        self.copy_out(r + MSG_HEADER_SIZE as u64, &mut payload);

        reader
            .read_pos
            .store(r + MSG_HEADER_SIZE as u64 + payload_len, Ordering::Release);
        reader.last_access_secs.store(now_secs(), Ordering::Relaxed);

        if !payload.is_empty() && crc32(&payload) != header.payload_crc {
            tracing::warn!(sequence = header.sequence, "ring payload failed crc, dropped");
            return None;
        }

        Some(RingMessage {
            sender: header.sender,
            sequence: header.sequence,
            timestamp_secs: header.timestamp_secs,
            payload,
        })
    }

    fn find_reader(&self, reader_id: u32) -> Option<&ReaderState> {
        self.readers.iter().find(|r| {
            r.active.load(Ordering::Acquire) != 0
                && r.reader_id.load(Ordering::Acquire) == reader_id
        })
    }

    /// Copy `src` into the ring at absolute position `pos`, wrapping in at
    /// most two segments.
    fn copy_in(&self, pos: u64, src: &[u8]) {
        let idx = (pos & self.mask()) as usize;
        let first = src.len().min(self.capacity as usize - idx);
        // SAFETY: idx + first <= capacity and the data region is `capacity`
        // bytes long inside the live mapping; the endpoint lock serializes
        // writers.
        unsafe {
            std::ptr::copy_nonoverlapping(src.as_ptr(), self.data.add(idx), first);
            if first < src.len() {
                std::ptr::copy_nonoverlapping(
                    src.as_ptr().add(first),
                    self.data,
                    src.len() - first,
                );
            }
        }
    }

    /// Copy out of the ring at absolute position `pos`.
    fn copy_out(&self, pos: u64, dst: &mut [u8]) {
        let idx = (pos & self.mask()) as usize;
        let first = dst.len().min(self.capacity as usize - idx);
        // SAFETY: as in `copy_in`; readers only touch bytes at or below the
        // acquire-loaded write cursor.
        unsafe {
            std::ptr::copy_nonoverlapping(self.data.add(idx), dst.as_mut_ptr(), first);
            if first < dst.len() {
                std::ptr::copy_nonoverlapping(
                    self.data,
                    dst.as_mut_ptr().add(first),
                    dst.len() - first,
                );
            }
        }
    }
}
