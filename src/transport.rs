//! Transport envelopes: the wrap/unwrap stage of a pipeline.
//!
//! A transport is a pure envelope over payload bytes. Failures on the
//! unwrap side mean "no frame" — the packet is silently dropped and the
//! receive loop moves on, per the integrity policy.

use std::time::{SystemTime, UNIX_EPOCH};

use crate::config::MAX_FRAME_SIZE;
use crate::crc::crc32;

/// An envelope over payload bytes.
pub trait Transport {
    /// Wrap `data` for transmission.
    fn wrap(&mut self, data: &[u8]) -> Option<Vec<u8>>;

    /// Remove this transport's envelope, or `None` when the packet is not
    /// valid under it.
    fn unwrap(&mut self, data: &[u8]) -> Option<Vec<u8>>;
}

/// Identity transport.
#[derive(Clone, Copy, Debug, Default)]
pub struct PassThrough;

impl Transport for PassThrough {
    fn wrap(&mut self, data: &[u8]) -> Option<Vec<u8>> {
        Some(data.to_vec())
    }

    fn unwrap(&mut self, data: &[u8]) -> Option<Vec<u8>> {
        Some(data.to_vec())
    }
}

/// Four-byte little-endian length prefix.
///
/// Unwrap rejects lengths above [`MAX_FRAME_SIZE`] and packets shorter
/// than the prefix claims.
#[derive(Clone, Copy, Debug, Default)]
pub struct LengthPrefixed;

impl Transport for LengthPrefixed {
    fn wrap(&mut self, data: &[u8]) -> Option<Vec<u8>> {
        let mut out = Vec::with_capacity(4 + data.len());
        out.extend_from_slice(&(data.len() as u32).to_le_bytes());
        out.extend_from_slice(data);
        Some(out)
    }

    fn unwrap(&mut self, data: &[u8]) -> Option<Vec<u8>> {
        if data.len() < 4 {
            return None;
        }
        let length = u32::from_le_bytes([data[0], data[1], data[2], data[3]]) as usize;
        if length > MAX_FRAME_SIZE {
            return None;
        }
        if data.len() < 4 + length {
            return None;
        }
        Some(data[4..4 + length].to_vec())
    }
}

/// Four-byte little-endian CRC-32 suffix over the payload.
#[derive(Clone, Copy, Debug, Default)]
pub struct Crc;

impl Transport for Crc {
    fn wrap(&mut self, data: &[u8]) -> Option<Vec<u8>> {
        let mut out = Vec::with_capacity(data.len() + 4);
        out.extend_from_slice(data);
        out.extend_from_slice(&crc32(data).to_le_bytes());
        Some(out)
    }

    fn unwrap(&mut self, data: &[u8]) -> Option<Vec<u8>> {
        if data.len() < 4 {
            return None;
        }
        let payload = &data[..data.len() - 4];
        let stored = u32::from_le_bytes(data[data.len() - 4..].try_into().ok()?);
        if crc32(payload) != stored {
            tracing::debug!(len = payload.len(), "crc transport dropped corrupt packet");
            return None;
        }
        Some(payload.to_vec())
    }
}

/// Eight-byte little-endian millisecond timestamp prefix.
#[derive(Clone, Copy, Debug, Default)]
pub struct Timestamped {
    last_received_ms: u64,
}

impl Timestamped {
    /// The timestamp carried by the most recently unwrapped packet.
    pub fn last_timestamp(&self) -> u64 {
        self.last_received_ms
    }

    fn now_ms() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }
}

impl Transport for Timestamped {
    fn wrap(&mut self, data: &[u8]) -> Option<Vec<u8>> {
        let mut out = Vec::with_capacity(8 + data.len());
        out.extend_from_slice(&Self::now_ms().to_le_bytes());
        out.extend_from_slice(data);
        Some(out)
    }

    fn unwrap(&mut self, data: &[u8]) -> Option<Vec<u8>> {
        if data.len() < 8 {
            return None;
        }
        self.last_received_ms = u64::from_le_bytes(data[..8].try_into().ok()?);
        Some(data[8..].to_vec())
    }
}

/// Two transports layered: `wrap` applies the inner then the outer,
/// `unwrap` peels the outer then the inner.
///
/// `Chain::new(a, b).wrap(x)` computes `b.wrap(a.wrap(x))`; deeper stacks
/// nest chains.
#[derive(Clone, Copy, Debug, Default)]
pub struct Chain<A, B> {
    inner: A,
    outer: B,
}

impl<A: Transport, B: Transport> Chain<A, B> {
    /// Layer `outer` around `inner`.
    pub fn new(inner: A, outer: B) -> Self {
        Self { inner, outer }
    }

    /// The inner transport.
    pub fn inner(&self) -> &A {
        &self.inner
    }

    /// The outer transport.
    pub fn outer(&self) -> &B {
        &self.outer
    }
}

impl<A: Transport, B: Transport> Transport for Chain<A, B> {
    fn wrap(&mut self, data: &[u8]) -> Option<Vec<u8>> {
        let inner = self.inner.wrap(data)?;
        self.outer.wrap(&inner)
    }

    fn unwrap(&mut self, data: &[u8]) -> Option<Vec<u8>> {
        let outer = self.outer.unwrap(data)?;
        self.inner.unwrap(&outer)
    }
}

/// Length prefix protected by a CRC suffix.
pub type CrcLengthPrefixed = Chain<LengthPrefixed, Crc>;
/// Timestamp prefix protected by a CRC suffix.
pub type TimestampedCrc = Chain<Timestamped, Crc>;
/// Length prefix, then timestamp, then CRC — the full stack.
pub type FullTransport = Chain<Chain<LengthPrefixed, Timestamped>, Crc>;
