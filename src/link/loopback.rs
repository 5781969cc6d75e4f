//! In-process pair link over bounded channels.

use crate::endpoint::EndpointId;
use crate::link::{Link, LinkStats};

const DEFAULT_CAPACITY: usize = 64;
const DEFAULT_MTU: usize = 64 * 1024;

/// One end of an in-process link.
///
/// The two ends of a [`LoopbackLink::pair`] are cross-connected: packets
/// written on one end are read on the other. Handy as the transport under
/// tests and for wiring two pipelines inside one process.
///
/// # Examples
///
/// ```rust
/// use conduit::endpoint::EndpointId;
/// use conduit::link::{Link, LoopbackLink};
///
/// let (mut a, mut b) = LoopbackLink::pair(16);
/// assert!(a.write(EndpointId::new(0, 0, 1), b"ping"));
/// assert_eq!(b.read().unwrap(), b"ping");
/// ```
pub struct LoopbackLink {
    tx: kanal::Sender<Vec<u8>>,
    rx: kanal::Receiver<Vec<u8>>,
    mtu: usize,
    connected: bool,
    stats: LinkStats,
}

impl LoopbackLink {
    /// Create a cross-connected pair with the given per-direction queue
    /// capacity.
    pub fn pair(capacity: usize) -> (Self, Self) {
        Self::pair_with_mtu(capacity, DEFAULT_MTU)
    }

    /// Create a pair with an explicit MTU.
    pub fn pair_with_mtu(capacity: usize, mtu: usize) -> (Self, Self) {
        let (a_tx, b_rx) = kanal::bounded(capacity);
        let (b_tx, a_rx) = kanal::bounded(capacity);
        let make = |tx, rx| LoopbackLink {
            tx,
            rx,
            mtu,
            connected: true,
            stats: LinkStats::default(),
        };
        (make(a_tx, a_rx), make(b_tx, b_rx))
    }

    /// Create a pair with the default capacity.
    pub fn pair_default() -> (Self, Self) {
        Self::pair(DEFAULT_CAPACITY)
    }

    /// Packets waiting on the peer's side of this end's send queue.
    pub fn pending_sends(&self) -> usize {
        self.tx.len()
    }
}

impl Link for LoopbackLink {
    fn mtu(&self) -> usize {
        self.mtu
    }

    fn write(&mut self, _dst: EndpointId, data: &[u8]) -> bool {
        if !self.connected || data.len() > self.mtu {
            return false;
        }
        match self.tx.try_send(data.to_vec()) {
            Ok(true) => {
                self.stats.packets_sent += 1;
                self.stats.bytes_sent += data.len() as u64;
                true
            }
            Ok(false) => false, // queue full
            Err(_) => false,    // peer gone
        }
    }

    fn read(&mut self) -> Option<Vec<u8>> {
        if !self.connected {
            return None;
        }
        match self.rx.try_recv() {
            Ok(Some(packet)) => {
                self.stats.packets_received += 1;
                self.stats.bytes_received += packet.len() as u64;
                Some(packet)
            }
            _ => None,
        }
    }

    fn is_connected(&self) -> bool {
        self.connected && !self.tx.is_disconnected()
    }

    fn close(&mut self) {
        self.connected = false;
    }

    fn stats(&self) -> LinkStats {
        self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dst() -> EndpointId {
        EndpointId::new(0, 0, 1)
    }

    #[test]
    fn test_pair_roundtrip_both_directions() {
        let (mut a, mut b) = LoopbackLink::pair(8);

        assert!(a.write(dst(), b"from a"));
        assert!(b.write(dst(), b"from b"));

        assert_eq!(b.read().unwrap(), b"from a");
        assert_eq!(a.read().unwrap(), b"from b");
        assert!(a.read().is_none());
    }

    #[test]
    fn test_capacity_limit() {
        let (mut a, _b) = LoopbackLink::pair(2);
        assert!(a.write(dst(), b"1"));
        assert!(a.write(dst(), b"2"));
        assert!(!a.write(dst(), b"3"), "queue full drops the packet");
        assert_eq!(a.pending_sends(), 2);
    }

    #[test]
    fn test_mtu_enforced() {
        let (mut a, _b) = LoopbackLink::pair_with_mtu(8, 16);
        assert_eq!(a.mtu(), 16);
        assert!(a.write(dst(), &[0u8; 16]));
        assert!(!a.write(dst(), &[0u8; 17]));
    }

    #[test]
    fn test_close_disables_io() {
        let (mut a, mut b) = LoopbackLink::pair(8);
        a.write(dst(), b"x");
        a.close();
        assert!(!a.write(dst(), b"y"));
        assert!(!a.is_connected());
        // Already-queued data still arrives at the peer.
        assert_eq!(b.read().unwrap(), b"x");
    }

    #[test]
    fn test_peer_drop_detected() {
        let (a, b) = LoopbackLink::pair(8);
        drop(b);
        let mut a = a;
        assert!(!a.write(dst(), b"z"));
        assert!(!a.is_connected());
    }

    #[test]
    fn test_stats_accumulate() {
        let (mut a, mut b) = LoopbackLink::pair(8);
        a.write(dst(), b"12345");
        a.write(dst(), b"678");
        b.read();
        b.read();

        assert_eq!(a.stats().packets_sent, 2);
        assert_eq!(a.stats().bytes_sent, 8);
        assert_eq!(b.stats().packets_received, 2);
        assert_eq!(b.stats().bytes_received, 8);
    }
}
