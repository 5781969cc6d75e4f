//! Reliable delivery over a lossy in-process link: frame codec plus the
//! ARQ engine driven end to end from a simulated millisecond clock.

use conduit::endpoint::EndpointId;
use conduit::frame::{self, FrameFlags, FrameHeader, HEADER_SIZE};
use conduit::link::{Link, LoopbackLink};
use conduit::reliable::ReliableContext;

fn dst() -> EndpointId {
    EndpointId::new(0, 0, 2)
}

/// The sender's end of the pair: data frames out are dropped according to
/// a fixed pattern, incoming ACKs always pass.
struct LossyLink {
    inner: LoopbackLink,
    drop_pattern: Vec<bool>,
    sent: usize,
}

impl LossyLink {
    fn new(inner: LoopbackLink, drop_pattern: Vec<bool>) -> Self {
        Self {
            inner,
            drop_pattern,
            sent: 0,
        }
    }

    fn send_frame(&mut self, bytes: &[u8]) -> bool {
        let lose = self.drop_pattern[self.sent % self.drop_pattern.len()];
        self.sent += 1;
        if lose {
            true // swallowed by the wire
        } else {
            self.inner.write(dst(), bytes)
        }
    }

    fn recv_ack(&mut self) -> Option<Vec<u8>> {
        self.inner.read()
    }
}

fn encode_next(
    ctx: &mut ReliableContext,
    payload: &[u8],
    now_ms: u32,
) -> Vec<u8> {
    let mut header = FrameHeader::new(0x11, 0x22, 1);
    header.sequence = ctx.next_sequence();
    let mut wire = vec![0u8; 1024];
    let n = frame::encode(&mut wire, payload, &mut header).unwrap();
    wire.truncate(n);
    ctx.on_send(&wire, &mut header, now_ms).unwrap();
    wire
}

#[test]
fn lossy_channel_delivers_everything_in_order() {
    // Drop every third data frame on first transmission.
    let (a, b) = LoopbackLink::pair(128);
    let mut sender_wire = LossyLink::new(a, vec![false, false, true]);
    let mut receiver_wire = b;

    let mut tx = ReliableContext::new(8);
    let mut rx = ReliableContext::new(8);

    let payloads: Vec<Vec<u8>> = (0u8..24).map(|i| vec![i; 32]).collect();
    let mut delivered: Vec<Vec<u8>> = Vec::new();
    let mut now_ms: u32 = 0;
    let mut next_to_send = 0usize;

    while delivered.len() < payloads.len() {
        // Send while the window allows.
        while next_to_send < payloads.len() && tx.can_send() {
            let frame_bytes = encode_next(&mut tx, &payloads[next_to_send], now_ms);
            sender_wire.send_frame(&frame_bytes);
            next_to_send += 1;
        }

        // Receiver drains its end, delivering in order and acking.
        while let Some(packet) = receiver_wire.read() {
            let (header, payload) = frame::decode(&packet).unwrap();
            let ack = rx
                .on_receive(&header, &payload, |_, bytes| {
                    delivered.push(bytes.to_vec())
                })
                .unwrap();
            let mut ack_wire = [0u8; HEADER_SIZE];
            let mut ack_header = ack;
            frame::encode(&mut ack_wire, &[], &mut ack_header).unwrap();
            receiver_wire.write(dst(), &ack_wire);
        }

        // Sender processes ACKs.
        while let Some(packet) = sender_wire.recv_ack() {
            let (header, _) = frame::decode(&packet).unwrap();
            assert!(header.flags.contains(FrameFlags::ACK));
            tx.on_ack(&header).unwrap();
        }

        // Advance time past the RTO and retransmit losses.
        now_ms += 1100;
        let mut resent = Vec::new();
        tx.poll(now_ms, |bytes| resent.push(bytes.to_vec()));
        for bytes in resent {
            sender_wire.send_frame(&bytes);
        }
    }

    assert_eq!(delivered, payloads, "in-order exactly-once delivery");
    let stats = tx.stats();
    assert!(stats.retransmits >= 8, "a third of first sends were lost");

    // Window fully drained once every ACK has arrived: send everything,
    // nothing pending.
    assert!(tx.can_send());
}

#[test]
fn duplicated_wire_traffic_is_discarded() {
    // Duplicate every data frame instead of losing any.
    let (a, b) = LoopbackLink::pair(128);
    let mut wire_ab = a;
    let mut wire_ba = b;

    let mut tx = ReliableContext::new(4);
    let mut rx = ReliableContext::new(4);

    let mut delivered = Vec::new();
    for i in 0u8..8 {
        let mut header = FrameHeader::new(0x11, 0x22, 1);
        header.sequence = tx.next_sequence();
        let mut wire = vec![0u8; 256];
        let n = frame::encode(&mut wire, &[i; 16], &mut header).unwrap();
        wire.truncate(n);
        tx.on_send(&wire, &mut header, 0).unwrap();

        // Two copies of every frame hit the wire.
        wire_ab.write(dst(), &wire);
        wire_ab.write(dst(), &wire);

        while let Some(packet) = wire_ba.read() {
            let (h, p) = frame::decode(&packet).unwrap();
            let ack = rx
                .on_receive(&h, &p, |seq, bytes| delivered.push((seq, bytes.to_vec())))
                .unwrap();
            tx.on_ack(&ack).unwrap();
        }
    }

    assert_eq!(delivered.len(), 8, "each payload delivered exactly once");
    for (i, (seq, payload)) in delivered.iter().enumerate() {
        assert_eq!(*seq, i as u32);
        assert_eq!(payload, &vec![i as u8; 16]);
    }
    assert_eq!(rx.stats().duplicates, 8);
    assert_eq!(rx.stats().out_of_order, 0);
}

#[test]
fn reordered_frames_release_in_sequence() {
    let mut tx = ReliableContext::new(8);
    let mut rx = ReliableContext::new(8);

    // Build four frames, then deliver them shuffled: 2, 0, 3, 1.
    let mut frames = Vec::new();
    for i in 0u8..4 {
        let mut header = FrameHeader::new(1, 2, 0);
        header.sequence = tx.next_sequence();
        let mut wire = vec![0u8; 256];
        let n = frame::encode(&mut wire, &[i; 8], &mut header).unwrap();
        wire.truncate(n);
        tx.on_send(&wire, &mut header, 0).unwrap();
        frames.push(wire);
    }

    let mut delivered = Vec::new();
    let mut last_ack = None;
    for idx in [2usize, 0, 3, 1] {
        let (h, p) = frame::decode(&frames[idx]).unwrap();
        let ack = rx
            .on_receive(&h, &p, |seq, _| delivered.push(seq))
            .unwrap();
        last_ack = Some(ack);
    }

    assert_eq!(delivered, vec![0, 1, 2, 3]);
    assert_eq!(last_ack.unwrap().sequence, 3, "cumulative ack covers all");
    assert!(rx.stats().out_of_order >= 2);
}
