//! Shared-memory broadcast rings.
//!
//! A named region holds one single-writer / multi-reader ring per endpoint.
//! Every attached process registers as a reader on every ring except its
//! own, so publishing on the local ring reaches each peer exactly once, in
//! write order, for any number of endpoints. Writers targeting one ring are
//! serialized by a timed per-ring lock; reads are wait-free; the slowest
//! active reader gates writable space (lossless broadcast with
//! backpressure).
//!
//! # Example
//!
//! ```rust,no_run
//! use conduit::shm::{BroadcastRing, RegionConfig, SharedRegion};
//!
//! # fn main() -> conduit::Result<()> {
//! let writer = BroadcastRing::open("/my-bus", 0, RegionConfig::default())?;
//! let mut reader = BroadcastRing::open("/my-bus", 1, RegionConfig::default())?;
//!
//! writer.broadcast(b"hello peers");
//! if let Some(msg) = reader.read() {
//!     assert_eq!(msg.payload, b"hello peers");
//!     assert_eq!(msg.sender, 0);
//! }
//! # SharedRegion::unlink("/my-bus")?;
//! # Ok(())
//! # }
//! ```

mod lock;
mod region;
mod ring;

pub use region::{RegionConfig, SharedRegion, REGION_MAGIC, REGION_VERSION};
pub use ring::RingMessage;

use std::time::Duration;

use crate::config::SHM_LOCK_TIMEOUT_MS;
use crate::error::{Error, Result};
use crate::shm::ring::MSG_HEADER_SIZE;

/// Aggregate counters over a [`BroadcastRing`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ShmStats {
    /// Processes currently attached to the region.
    pub ref_count: u32,
    /// Writable bytes summed over all rings.
    pub available_write: u64,
    /// Unread bytes for this endpoint summed over all rings.
    pub available_read: u64,
    /// Percentage of total ring space currently occupied.
    pub utilization_pct: u32,
    /// Registered reader slots across all rings.
    pub active_readers: u32,
}

/// One endpoint's attachment to a shared-memory broadcast region.
pub struct BroadcastRing {
    region: SharedRegion,
    local_endpoint: u32,
    lock_timeout: Duration,
    closed: bool,
}

impl BroadcastRing {
    /// Create or attach to the named region as `local_endpoint`.
    ///
    /// The opener is registered as a reader on every ring except its own,
    /// positioned at the current write cursor (history is not replayed).
    pub fn open(name: &str, local_endpoint: u32, cfg: RegionConfig) -> Result<Self> {
        if local_endpoint >= cfg.max_endpoints {
            return Err(Error::Invalid("local endpoint out of range"));
        }
        let region = SharedRegion::open(name, cfg)?;

        for endpoint in 0..cfg.max_endpoints {
            if endpoint == local_endpoint {
                continue;
            }
            if let Some(ring) = region.ring(endpoint) {
                if !ring.register_reader(local_endpoint) {
                    // Roll back before surfacing the failure.
                    for ep in 0..endpoint {
                        if ep == local_endpoint {
                            continue;
                        }
                        if let Some(r) = region.ring(ep) {
                            r.unregister_reader(local_endpoint);
                        }
                    }
                    return Err(Error::Overflow("no free reader slot"));
                }
            }
        }

        Ok(Self {
            region,
            local_endpoint,
            lock_timeout: Duration::from_millis(SHM_LOCK_TIMEOUT_MS),
            closed: false,
        })
    }

    /// This attachment's endpoint index.
    #[inline]
    pub fn local_endpoint(&self) -> u32 {
        self.local_endpoint
    }

    /// Number of endpoint rings in the region.
    #[inline]
    pub fn max_endpoints(&self) -> u32 {
        self.region.config().max_endpoints
    }

    /// Largest payload one message can carry.
    #[inline]
    pub fn mtu(&self) -> usize {
        self.region.config().buffer_size as usize - MSG_HEADER_SIZE
    }

    /// Override the per-write lock acquisition timeout.
    pub fn set_lock_timeout(&mut self, timeout: Duration) {
        self.lock_timeout = timeout;
    }

    /// Publish `payload` into endpoint `endpoint`'s ring.
    ///
    /// Serialized against other writers by the ring's timed lock; returns
    /// false on lock timeout or when the slowest active reader leaves
    /// insufficient space (the message is dropped, not truncated).
    pub fn write_to(&self, endpoint: u32, payload: &[u8]) -> bool {
        if self.closed {
            return false;
        }
        let Some(ring) = self.region.ring(endpoint) else {
            return false;
        };
        let Some(lock) = self.region.lock(endpoint) else {
            return false;
        };
        let Some(_guard) = lock.lock_timeout(self.lock_timeout) else {
            tracing::warn!(endpoint, "ring lock acquisition timed out");
            return false;
        };
        ring.write(payload, self.local_endpoint)
    }

    /// Publish `payload` to every peer.
    ///
    /// One copy lands in the local endpoint's ring; every other endpoint is
    /// a registered reader of that ring, so each observes the message
    /// exactly once, in publish order.
    pub fn broadcast(&self, payload: &[u8]) -> bool {
        self.write_to(self.local_endpoint, payload)
    }

    /// Drain the next available message from any ring this endpoint reads.
    ///
    /// Wait-free; returns `None` when nothing is pending.
    pub fn read(&mut self) -> Option<RingMessage> {
        if self.closed {
            return None;
        }
        for endpoint in 0..self.max_endpoints() {
            if endpoint == self.local_endpoint {
                continue;
            }
            if let Some(ring) = self.region.ring(endpoint) {
                if let Some(msg) = ring.read(self.local_endpoint) {
                    return Some(msg);
                }
            }
        }
        None
    }

    /// Writable bytes before backpressure on the local (broadcast) ring.
    pub fn available_write(&self) -> u64 {
        self.region
            .ring(self.local_endpoint)
            .map(|r| r.available_write())
            .unwrap_or(0)
    }

    /// Snapshot counters across all rings.
    pub fn stats(&self) -> ShmStats {
        let cfg = self.region.config();
        let mut stats = ShmStats {
            ref_count: self.region.ref_count(),
            ..Default::default()
        };
        for endpoint in 0..cfg.max_endpoints {
            if let Some(ring) = self.region.ring(endpoint) {
                stats.available_write += ring.available_write();
                stats.available_read += ring.available_read(self.local_endpoint);
                stats.active_readers += ring.active_readers();
            }
        }
        let total = cfg.buffer_size as u64 * cfg.max_endpoints as u64;
        stats.utilization_pct = ((total - stats.available_write) * 100 / total) as u32;
        stats
    }

    /// Detach from the region: unregister everywhere and drop the
    /// reference count. Further reads and writes return nothing.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        for endpoint in 0..self.max_endpoints() {
            if endpoint == self.local_endpoint {
                continue;
            }
            if let Some(ring) = self.region.ring(endpoint) {
                ring.unregister_reader(self.local_endpoint);
            }
        }
    }
}

impl Drop for BroadcastRing {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    static NAME_SEQ: AtomicU64 = AtomicU64::new(0);

    fn unique_name(tag: &str) -> String {
        format!(
            "/conduit-bus-{tag}-{}-{}",
            std::process::id(),
            NAME_SEQ.fetch_add(1, Ordering::Relaxed)
        )
    }

    fn small_cfg() -> RegionConfig {
        RegionConfig {
            buffer_size: 4096,
            max_endpoints: 4,
            max_readers: 4,
        }
    }

    #[test]
    fn test_broadcast_reaches_all_peers_once() {
        let name = unique_name("bcast");
        let writer = BroadcastRing::open(&name, 0, small_cfg()).unwrap();
        let mut r1 = BroadcastRing::open(&name, 1, small_cfg()).unwrap();
        let mut r2 = BroadcastRing::open(&name, 2, small_cfg()).unwrap();

        for i in 0u8..3 {
            assert!(writer.broadcast(&[i; 100]));
        }

        for reader in [&mut r1, &mut r2] {
            for i in 0u8..3 {
                let msg = reader.read().unwrap();
                assert_eq!(msg.payload, vec![i; 100]);
                assert_eq!(msg.sender, 0);
            }
            assert!(reader.read().is_none());
        }

        drop(writer);
        drop(r1);
        drop(r2);
        SharedRegion::unlink(&name).unwrap();
    }

    #[test]
    fn test_stalled_reader_backpressure_and_release() {
        let cfg = RegionConfig {
            buffer_size: 1024,
            max_endpoints: 2,
            max_readers: 2,
        };
        let name = unique_name("pressure");
        let writer = BroadcastRing::open(&name, 0, cfg).unwrap();
        let mut reader = BroadcastRing::open(&name, 1, cfg).unwrap();

        // Fill until the stalled reader refuses further writes.
        let payload = [7u8; 100];
        let mut written = 0;
        while writer.broadcast(&payload) {
            written += 1;
            assert!(written < 64, "backpressure never engaged");
        }
        assert_eq!(written, 8); // 8 * (28 + 100) = 1024 bytes exactly

        // Draining one message frees space for exactly one more.
        assert!(reader.read().is_some());
        assert!(writer.broadcast(&payload));
        assert!(!writer.broadcast(&payload));

        drop(writer);
        drop(reader);
        SharedRegion::unlink(&name).unwrap();
    }

    #[test]
    fn test_closed_ring_stops_gating_writers() {
        let cfg = RegionConfig {
            buffer_size: 1024,
            max_endpoints: 2,
            max_readers: 2,
        };
        let name = unique_name("close");
        let writer = BroadcastRing::open(&name, 0, cfg).unwrap();
        let mut reader = BroadcastRing::open(&name, 1, cfg).unwrap();

        let payload = [7u8; 100];
        while writer.broadcast(&payload) {}

        // Detaching the stalled reader releases the ring.
        reader.close();
        assert!(writer.broadcast(&payload));

        drop(writer);
        drop(reader);
        SharedRegion::unlink(&name).unwrap();
    }

    #[test]
    fn test_cross_thread_broadcast() {
        let name = unique_name("threads");
        let cfg = small_cfg();
        let writer = BroadcastRing::open(&name, 0, cfg).unwrap();
        let mut reader = BroadcastRing::open(&name, 1, cfg).unwrap();

        let producer = std::thread::spawn(move || {
            for i in 0u32..50 {
                let payload = i.to_le_bytes();
                while !writer.broadcast(&payload) {
                    std::thread::yield_now();
                }
            }
        });

        let mut seen = Vec::new();
        while seen.len() < 50 {
            match reader.read() {
                Some(msg) => {
                    seen.push(u32::from_le_bytes(msg.payload.try_into().unwrap()));
                }
                None => std::thread::yield_now(),
            }
        }
        producer.join().unwrap();

        let expected: Vec<u32> = (0..50).collect();
        assert_eq!(seen, expected, "messages observed in publish order");

        drop(reader);
        SharedRegion::unlink(&name).unwrap();
    }

    #[test]
    fn test_unicast_ring_write() {
        let name = unique_name("unicast");
        let a = BroadcastRing::open(&name, 0, small_cfg()).unwrap();
        let mut b = BroadcastRing::open(&name, 1, small_cfg()).unwrap();
        let mut c = BroadcastRing::open(&name, 2, small_cfg()).unwrap();

        // Publishing into ring 2 reaches its registered readers (every
        // endpoint except 2).
        assert!(a.write_to(2, b"on ring two"));
        assert_eq!(b.read().unwrap().payload, b"on ring two");
        assert!(c.read().is_none());

        drop(a);
        drop(b);
        drop(c);
        SharedRegion::unlink(&name).unwrap();
    }

    #[test]
    fn test_stats_snapshot() {
        let name = unique_name("stats");
        let writer = BroadcastRing::open(&name, 0, small_cfg()).unwrap();
        let mut reader = BroadcastRing::open(&name, 1, small_cfg()).unwrap();

        writer.broadcast(&[1u8; 200]);
        let stats = writer.stats();
        assert_eq!(stats.ref_count, 2);
        assert!(stats.active_readers >= 2);
        assert!(stats.utilization_pct >= 1);
        assert_eq!(stats.available_write, 4 * 4096 - 228);

        let reader_stats = reader.stats();
        assert_eq!(reader_stats.available_read, 228);

        reader.read().unwrap();
        assert_eq!(reader.stats().available_read, 0);

        drop(writer);
        drop(reader);
        SharedRegion::unlink(&name).unwrap();
    }

    #[test]
    fn test_endpoint_out_of_range() {
        let name = unique_name("range");
        assert!(BroadcastRing::open(&name, 99, small_cfg()).is_err());
    }

    #[test]
    fn test_mtu() {
        let name = unique_name("mtu");
        let ring = BroadcastRing::open(&name, 0, small_cfg()).unwrap();
        assert_eq!(ring.mtu(), 4096 - 28);
        drop(ring);
        SharedRegion::unlink(&name).unwrap();
    }
}
