//! Wire frame codec.
//!
//! Every frame starts with a fixed 32-byte header, little-endian on the
//! wire:
//!
//! ```text
//! ┌───────┬─────────┬───────┬────────┬───────────┬───────────┬──────────┬──────────┬────────────┬─────────────┐
//! │ magic │ version │ flags │ length │ src_ep    │ dst_ep    │ sequence │ cmd_type │ header_crc │ payload_crc │
//! │ 2B    │ 1B      │ 1B    │ 4B     │ 4B        │ 4B        │ 4B       │ 4B       │ 4B         │ 4B          │
//! └───────┴─────────┴───────┴────────┴───────────┴───────────┴──────────┴──────────┴────────────┴─────────────┘
//! ```
//!
//! `length` counts header plus payload. `header_crc` covers the first 28
//! header bytes with the crc field itself zeroed; `payload_crc` covers the
//! raw payload bytes (zero when there is no payload). Headers are stored
//! native and converted to little-endian on both the read and write paths.

use crate::config::MAX_FRAME_SIZE;
use crate::crc::crc32;
use crate::error::{Error, Result};

/// Frame magic constant.
pub const FRAME_MAGIC: u16 = 0xA55A;
/// Current frame format version.
pub const FRAME_VERSION: u8 = 1;
/// Fixed size of the wire header in bytes.
pub const HEADER_SIZE: usize = 32;

/// Header flag bits.
///
/// ```rust
/// use conduit::frame::FrameFlags;
///
/// let flags = FrameFlags::ACK | FrameFlags::HEARTBEAT;
/// assert!(flags.contains(FrameFlags::ACK));
/// assert!(!flags.contains(FrameFlags::ENCRYPTED));
/// ```
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct FrameFlags(pub u8);

impl FrameFlags {
    /// No flags set.
    pub const NONE: Self = Self(0);
    /// Payload is compressed.
    pub const COMPRESSED: Self = Self(1 << 0);
    /// Payload is encrypted.
    pub const ENCRYPTED: Self = Self(1 << 1);
    /// Payload travels through the zero-copy pool.
    pub const ZERO_COPY: Self = Self(1 << 2);
    /// Frame is one fragment of a larger message.
    pub const FRAGMENTED: Self = Self(1 << 3);
    /// Positive acknowledgement; `sequence` is the acked sequence.
    pub const ACK: Self = Self(1 << 4);
    /// Negative acknowledgement.
    pub const NACK: Self = Self(1 << 5);
    /// Liveness probe.
    pub const HEARTBEAT: Self = Self(1 << 6);
    /// An extended header follows the fixed header.
    pub const EXTENDED_HEADER: Self = Self(1 << 7);

    /// Whether every bit in `other` is set in `self`.
    #[inline]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for FrameFlags {
    type Output = Self;

    #[inline]
    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl std::ops::BitOrAssign for FrameFlags {
    #[inline]
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

/// Native-endian frame header.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FrameHeader {
    /// Must equal [`FRAME_MAGIC`].
    pub magic: u16,
    /// Must equal [`FRAME_VERSION`].
    pub version: u8,
    /// Flag bits.
    pub flags: FrameFlags,
    /// Total frame length, header included.
    pub length: u32,
    /// Sender identifier (low 32 bits of the endpoint).
    pub src_endpoint: u32,
    /// Receiver identifier.
    pub dst_endpoint: u32,
    /// ARQ sequence, or the acked sequence for ACK frames.
    pub sequence: u32,
    /// Command / message type code.
    pub cmd_type: u32,
    /// CRC-32 of the first 28 header bytes with this field zeroed.
    pub header_crc: u32,
    /// CRC-32 of the raw payload, zero when there is no payload.
    pub payload_crc: u32,
}

impl FrameHeader {
    /// A data-frame header between two endpoints. Length and crc fields are
    /// filled in by [`encode`].
    pub fn new(src_endpoint: u32, dst_endpoint: u32, cmd_type: u32) -> Self {
        Self {
            magic: FRAME_MAGIC,
            version: FRAME_VERSION,
            flags: FrameFlags::NONE,
            length: 0,
            src_endpoint,
            dst_endpoint,
            sequence: 0,
            cmd_type,
            header_crc: 0,
            payload_crc: 0,
        }
    }

    /// Serialize to the little-endian wire form. `header_crc` is written
    /// exactly as stored; callers zero it before computing the checksum.
    pub(crate) fn write_le(&self, out: &mut [u8; HEADER_SIZE]) {
        out[0..2].copy_from_slice(&self.magic.to_le_bytes());
        out[2] = self.version;
        out[3] = self.flags.0;
        out[4..8].copy_from_slice(&self.length.to_le_bytes());
        out[8..12].copy_from_slice(&self.src_endpoint.to_le_bytes());
        out[12..16].copy_from_slice(&self.dst_endpoint.to_le_bytes());
        out[16..20].copy_from_slice(&self.sequence.to_le_bytes());
        out[20..24].copy_from_slice(&self.cmd_type.to_le_bytes());
        out[24..28].copy_from_slice(&self.header_crc.to_le_bytes());
        out[28..32].copy_from_slice(&self.payload_crc.to_le_bytes());
    }

    /// Parse the little-endian wire form into native endianness.
    ///
    /// The slice must hold at least [`HEADER_SIZE`] bytes.
    pub(crate) fn read_le(bytes: &[u8]) -> Self {
        let u16_at = |o: usize| u16::from_le_bytes([bytes[o], bytes[o + 1]]);
        let u32_at =
            |o: usize| u32::from_le_bytes([bytes[o], bytes[o + 1], bytes[o + 2], bytes[o + 3]]);
        Self {
            magic: u16_at(0),
            version: bytes[2],
            flags: FrameFlags(bytes[3]),
            length: u32_at(4),
            src_endpoint: u32_at(8),
            dst_endpoint: u32_at(12),
            sequence: u32_at(16),
            cmd_type: u32_at(20),
            header_crc: u32_at(24),
            payload_crc: u32_at(28),
        }
    }

    /// Compute `header_crc` for this header: CRC-32 over the first 28 wire
    /// bytes with the crc field zeroed.
    pub(crate) fn compute_header_crc(&self) -> u32 {
        let mut wire = [0u8; HEADER_SIZE];
        let mut zeroed = *self;
        zeroed.header_crc = 0;
        zeroed.write_le(&mut wire);
        crc32(&wire[..28])
    }
}

/// Structural header validation without checksum verification.
///
/// `received_len` must equal the header's `length` field; magic, version
/// and length bounds are checked.
pub fn validate(header: &FrameHeader, received_len: usize) -> Result<()> {
    if header.magic != FRAME_MAGIC {
        return Err(Error::Invalid("frame magic"));
    }
    if header.version != FRAME_VERSION {
        return Err(Error::Invalid("frame version"));
    }
    let length = header.length as usize;
    if length < HEADER_SIZE {
        return Err(Error::Invalid("frame length below header size"));
    }
    if length > MAX_FRAME_SIZE {
        return Err(Error::Invalid("frame length above maximum"));
    }
    if received_len != length {
        return Err(Error::Invalid("received byte count"));
    }
    Ok(())
}

/// Encode a frame into `dst`, returning the total length written.
///
/// Fills `header.length` with `HEADER_SIZE + payload.len()`, computes
/// `payload_crc` over the raw payload (zero when empty), serializes the
/// header little-endian with `header_crc` computed over the first 28
/// bytes, then appends the payload verbatim.
///
/// Fails with [`Error::NoMem`] when `dst` is smaller than the total frame.
pub fn encode(dst: &mut [u8], payload: &[u8], header: &mut FrameHeader) -> Result<usize> {
    let total_len = HEADER_SIZE + payload.len();
    if dst.len() < total_len {
        return Err(Error::NoMem {
            needed: total_len,
            available: dst.len(),
        });
    }

    header.length = total_len as u32;
    header.payload_crc = if payload.is_empty() {
        0
    } else {
        crc32(payload)
    };
    header.header_crc = header.compute_header_crc();

    let mut wire = [0u8; HEADER_SIZE];
    header.write_le(&mut wire);
    dst[..HEADER_SIZE].copy_from_slice(&wire);
    dst[HEADER_SIZE..total_len].copy_from_slice(payload);

    Ok(total_len)
}

/// Decode a frame from `src`, returning the header and payload.
///
/// Validates magic, version and length bounds, requires
/// `header.length <= src.len()` (trailing bytes are ignored), then verifies
/// both checksums. Returns [`Error::Crc`] on integrity failure and
/// [`Error::Invalid`] on structural failure.
pub fn decode(src: &[u8]) -> Result<(FrameHeader, Vec<u8>)> {
    if src.len() < HEADER_SIZE {
        return Err(Error::Invalid("short frame"));
    }

    let header = FrameHeader::read_le(src);

    if header.magic != FRAME_MAGIC {
        return Err(Error::Invalid("frame magic"));
    }
    if header.version != FRAME_VERSION {
        return Err(Error::Invalid("frame version"));
    }
    let length = header.length as usize;
    if !(HEADER_SIZE..=MAX_FRAME_SIZE).contains(&length) {
        return Err(Error::Invalid("frame length"));
    }
    if length > src.len() {
        return Err(Error::Invalid("frame truncated"));
    }

    if header.compute_header_crc() != header.header_crc {
        return Err(Error::Crc("header"));
    }

    let payload = src[HEADER_SIZE..length].to_vec();
    if !payload.is_empty() && crc32(&payload) != header.payload_crc {
        return Err(Error::Crc("payload"));
    }

    Ok((header, payload))
}

/// Incremental decode from a byte stream.
///
/// Returns `(consumed, frame)`. When the buffer head does not look like a
/// frame (bad magic or impossible length) a single byte is consumed so the
/// stream can resynchronize. When a frame is structurally complete but
/// fails its integrity checks, the whole frame is consumed and silently
/// dropped. An incomplete frame consumes nothing.
pub fn stream_decode(buf: &[u8]) -> (usize, Option<(FrameHeader, Vec<u8>)>) {
    if buf.len() < 8 {
        return (0, None);
    }

    let magic = u16::from_le_bytes([buf[0], buf[1]]);
    let length = u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]) as usize;
    if magic != FRAME_MAGIC || !(HEADER_SIZE..=MAX_FRAME_SIZE).contains(&length) {
        // Resynchronize one byte at a time.
        return (1, None);
    }
    if buf.len() < length {
        return (0, None);
    }

    match decode(&buf[..length]) {
        Ok(frame) => (length, Some(frame)),
        Err(err) => {
            tracing::debug!(length, %err, "dropping corrupt frame from stream");
            (length, None)
        }
    }
}
