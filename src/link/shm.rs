//! Cross-process link over the shared-memory broadcast ring.

use crate::endpoint::EndpointId;
use crate::error::Result;
use crate::link::{Link, LinkStats};
use crate::shm::{BroadcastRing, RegionConfig, ShmStats};

/// A [`Link`] backed by a [`BroadcastRing`].
///
/// The ring is a broadcast medium: a packet published on endpoint `e`'s
/// ring is observed by every endpoint registered there (all but `e`).
/// Writing to the broadcast endpoint — or to any destination, in the
/// common one-ring-per-publisher pattern — publishes on the local ring so
/// each peer sees the packet exactly once; addressing a specific peer is
/// the frame layer's business (`dst_endpoint` in the frame header).
/// Writing to another node index publishes on that ring instead, reaching
/// that endpoint's subscribers.
pub struct SharedMemoryLink {
    ring: BroadcastRing,
    stats: LinkStats,
    connected: bool,
}

impl SharedMemoryLink {
    /// Create or attach to the named region as `local_endpoint`.
    pub fn open(name: &str, local_endpoint: u32, cfg: RegionConfig) -> Result<Self> {
        let ring = BroadcastRing::open(name, local_endpoint, cfg)?;
        Ok(Self {
            ring,
            stats: LinkStats::default(),
            connected: true,
        })
    }

    /// This attachment's endpoint index.
    pub fn local_endpoint(&self) -> u32 {
        self.ring.local_endpoint()
    }

    /// Publish to every peer via the local ring.
    pub fn broadcast(&mut self, data: &[u8]) -> bool {
        if !self.connected {
            return false;
        }
        if self.ring.broadcast(data) {
            self.stats.packets_sent += 1;
            self.stats.bytes_sent += data.len() as u64;
            true
        } else {
            false
        }
    }

    /// Ring-level counters for this attachment.
    pub fn shm_stats(&self) -> ShmStats {
        self.ring.stats()
    }
}

impl Link for SharedMemoryLink {
    fn mtu(&self) -> usize {
        self.ring.mtu()
    }

    fn write(&mut self, dst: EndpointId, data: &[u8]) -> bool {
        if !self.connected {
            return false;
        }
        let target = if dst.is_broadcast() || dst.node == self.ring.local_endpoint() {
            self.ring.local_endpoint()
        } else if dst.node < self.ring.max_endpoints() {
            dst.node
        } else {
            // Unknown node: fall back to the local (broadcast) ring.
            self.ring.local_endpoint()
        };
        if self.ring.write_to(target, data) {
            self.stats.packets_sent += 1;
            self.stats.bytes_sent += data.len() as u64;
            true
        } else {
            false
        }
    }

    fn read(&mut self) -> Option<Vec<u8>> {
        if !self.connected {
            return None;
        }
        let msg = self.ring.read()?;
        self.stats.packets_received += 1;
        self.stats.bytes_received += msg.payload.len() as u64;
        Some(msg.payload)
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    fn close(&mut self) {
        if self.connected {
            self.connected = false;
            self.ring.close();
        }
    }

    fn stats(&self) -> LinkStats {
        self.stats
    }
}
