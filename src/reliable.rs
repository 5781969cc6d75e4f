//! Reliable delivery engine: sliding-window ARQ.
//!
//! One [`ReliableContext`] tracks a single direction of a conversation:
//! outgoing sequences with a pending bitmap and a retransmission cache, and
//! incoming sequences with an out-of-order bitmap plus per-slot payload
//! buffers so delivery stays strictly in order.
//!
//! The engine has no clock of its own. Callers pass a monotonic millisecond
//! timestamp into [`ReliableContext::on_send`] and
//! [`ReliableContext::poll`]; the timer is the only retransmission trigger
//! (there is no NACK-driven fast path). Acknowledgements are cumulative:
//! an ACK for sequence `n` releases everything up to and including `n`, so
//! a lost ACK at worst causes a duplicate delivery that the receiver
//! discards and counts.

use crate::config::{DEFAULT_RTO_MS, MAX_FRAME_SIZE, MAX_WINDOW_SIZE};
use crate::error::{Error, Result};
use crate::frame::{FrameFlags, FrameHeader, FRAME_MAGIC, FRAME_VERSION, HEADER_SIZE};

/// Counters exposed by [`ReliableContext::stats`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ReliableStats {
    /// Sequences assigned on the transmit side.
    pub tx_frames: u32,
    /// Sequences delivered in order on the receive side.
    pub rx_frames: u32,
    /// Timed-out frames re-sent by [`ReliableContext::poll`].
    pub retransmits: u32,
    /// Frames received more than once.
    pub duplicates: u32,
    /// Frames that arrived ahead of the expected sequence.
    pub out_of_order: u32,
}

#[derive(Debug)]
struct TxSlot {
    data: Vec<u8>,
    sequence: u32,
    timestamp_ms: u32,
}

/// Per-direction ARQ state.
#[derive(Debug)]
pub struct ReliableContext {
    next_tx_seq: u32,
    next_rx_seq: u32,
    tx_window_base: u32,
    rx_window_base: u32,
    window_size: u8,
    rto_ms: u32,

    tx_pending_mask: u32,
    tx_slots: Vec<Option<TxSlot>>,

    rx_received_mask: u32,
    rx_slots: Vec<Option<Vec<u8>>>,

    stat_retransmits: u32,
    stat_duplicates: u32,
    stat_out_of_order: u32,
}

impl ReliableContext {
    /// Create a context with the requested window size.
    ///
    /// The window is clamped to `min(requested, MAX_WINDOW_SIZE, 32)`; the
    /// pending bitmaps are 32-bit, so a wider window can never exist and
    /// the cumulative-ACK shift can never exceed the mask width.
    ///
    /// # Panics
    ///
    /// Panics when `window_size` is zero.
    pub fn new(window_size: u8) -> Self {
        let window = window_size.min(MAX_WINDOW_SIZE).min(32);
        assert!(window > 0, "window size must be at least 1");
        Self {
            next_tx_seq: 0,
            next_rx_seq: 0,
            tx_window_base: 0,
            rx_window_base: 0,
            window_size: window,
            rto_ms: DEFAULT_RTO_MS,
            tx_pending_mask: 0,
            tx_slots: (0..window).map(|_| None).collect(),
            rx_received_mask: 0,
            rx_slots: (0..window).map(|_| None).collect(),
            stat_retransmits: 0,
            stat_duplicates: 0,
            stat_out_of_order: 0,
        }
    }

    /// Effective window size after clamping.
    #[inline]
    pub fn window_size(&self) -> u8 {
        self.window_size
    }

    /// Retransmission timeout in milliseconds.
    #[inline]
    pub fn rto(&self) -> u32 {
        self.rto_ms
    }

    /// Override the retransmission timeout.
    pub fn set_rto(&mut self, rto_ms: u32) {
        self.rto_ms = rto_ms;
    }

    /// The sequence the next [`ReliableContext::on_send`] will assign.
    #[inline]
    pub fn next_sequence(&self) -> u32 {
        self.next_tx_seq
    }

    /// Whether the send window has room for another outstanding frame.
    #[inline]
    pub fn can_send(&self) -> bool {
        self.next_tx_seq.wrapping_sub(self.tx_window_base) < self.window_size as u32
    }

    /// Register an outgoing frame.
    ///
    /// Assigns `header.sequence`, caches the wire bytes for retransmission
    /// (when they fit in a frame slot), stamps the transmit time and marks
    /// the sequence pending. Returns [`Error::Overflow`] when the window is
    /// full so the caller can apply backpressure.
    pub fn on_send(
        &mut self,
        frame: &[u8],
        header: &mut FrameHeader,
        now_ms: u32,
    ) -> Result<()> {
        if !self.can_send() {
            return Err(Error::Overflow("send window full"));
        }

        let seq = self.next_tx_seq;
        header.sequence = seq;

        let slot = (seq % self.window_size as u32) as usize;
        self.tx_slots[slot] = Some(TxSlot {
            data: if frame.len() <= MAX_FRAME_SIZE {
                frame.to_vec()
            } else {
                Vec::new()
            },
            sequence: seq,
            timestamp_ms: now_ms,
        });

        let offset = seq.wrapping_sub(self.tx_window_base);
        if offset < 32 {
            self.tx_pending_mask |= 1 << offset;
        }

        self.next_tx_seq = self.next_tx_seq.wrapping_add(1);
        Ok(())
    }

    /// Process an incoming data frame.
    ///
    /// Applies the delivery policy — in-sequence frames are handed to
    /// `deliver` immediately (followed by any buffered successors that the
    /// arrival unblocks), ahead-of-sequence frames inside the window are
    /// buffered and counted, everything else is counted as a duplicate —
    /// and returns the cumulative ACK header to send back. Sequences
    /// beyond the window return [`Error::Invalid`].
    ///
    /// `deliver` observes strictly increasing sequences, each exactly once.
    pub fn on_receive(
        &mut self,
        header: &FrameHeader,
        payload: &[u8],
        mut deliver: impl FnMut(u32, &[u8]),
    ) -> Result<FrameHeader> {
        let recv_seq = header.sequence;
        let window = self.window_size as u32;

        if recv_seq == self.next_rx_seq {
            deliver(recv_seq, payload);
            self.next_rx_seq = self.next_rx_seq.wrapping_add(1);

            // Drain buffered successors now contiguous with the cursor.
            loop {
                let offset = self.next_rx_seq.wrapping_sub(self.rx_window_base);
                if offset < 32 && self.rx_received_mask & (1 << offset) != 0 {
                    self.rx_received_mask &= !(1 << offset);
                    let slot = (self.next_rx_seq % window) as usize;
                    if let Some(buffered) = self.rx_slots[slot].take() {
                        deliver(self.next_rx_seq, &buffered);
                    }
                    self.next_rx_seq = self.next_rx_seq.wrapping_add(1);
                } else {
                    break;
                }
            }

            while self.next_rx_seq.wrapping_sub(self.rx_window_base) >= window {
                self.rx_window_base = self.rx_window_base.wrapping_add(1);
                self.rx_received_mask >>= 1;
            }
        } else if recv_seq.wrapping_sub(self.next_rx_seq) < u32::MAX / 2 {
            // Ahead of the expected sequence.
            let offset = recv_seq.wrapping_sub(self.rx_window_base);
            if offset < window && offset < 32 {
                if self.rx_received_mask & (1 << offset) == 0 {
                    self.stat_out_of_order += 1;
                    self.rx_received_mask |= 1 << offset;
                    let slot = (recv_seq % window) as usize;
                    self.rx_slots[slot] = Some(payload.to_vec());
                } else {
                    self.stat_duplicates += 1;
                }
            } else {
                return Err(Error::Invalid("sequence outside receive window"));
            }
        } else {
            // Behind the cursor: already delivered.
            self.stat_duplicates += 1;
        }

        Ok(ack_build(header, self.next_rx_seq.wrapping_sub(1)))
    }

    /// Process a cumulative acknowledgement.
    ///
    /// An ACK below the window base is a late duplicate and succeeds
    /// silently. Otherwise the window slides past every sequence up to and
    /// including the acked one.
    pub fn on_ack(&mut self, ack: &FrameHeader) -> Result<()> {
        if !ack.flags.contains(FrameFlags::ACK) {
            return Err(Error::Invalid("ack flag missing"));
        }

        let ack_seq = ack.sequence;
        if ack_seq.wrapping_sub(self.tx_window_base) >= u32::MAX / 2 {
            // Late ACK for an already-released sequence.
            return Ok(());
        }

        let shift = ack_seq
            .wrapping_sub(self.tx_window_base)
            .wrapping_add(1)
            .min(32);
        if shift == 32 {
            self.tx_pending_mask = 0;
        } else {
            self.tx_pending_mask >>= shift;
        }
        self.tx_window_base = self.tx_window_base.wrapping_add(shift);
        Ok(())
    }

    /// Retransmit every pending frame whose timeout has expired.
    ///
    /// `now_ms` comes from the caller's monotonic clock. Each expired
    /// slot's timestamp is refreshed so a frame retransmits at most once
    /// per timeout period.
    pub fn poll(&mut self, now_ms: u32, mut retransmit: impl FnMut(&[u8])) {
        let window = (self.window_size as u32).min(32);
        for offset in 0..window {
            if self.tx_pending_mask & (1 << offset) == 0 {
                continue;
            }
            let seq = self.tx_window_base.wrapping_add(offset);
            let slot = (seq % self.window_size as u32) as usize;
            if let Some(cached) = self.tx_slots[slot].as_mut() {
                if cached.sequence == seq
                    && now_ms.wrapping_sub(cached.timestamp_ms) > self.rto_ms
                {
                    cached.timestamp_ms = now_ms;
                    self.stat_retransmits += 1;
                    retransmit(&cached.data);
                }
            }
        }
    }

    /// Snapshot the counters.
    pub fn stats(&self) -> ReliableStats {
        ReliableStats {
            tx_frames: self.next_tx_seq,
            rx_frames: self.next_rx_seq,
            retransmits: self.stat_retransmits,
            duplicates: self.stat_duplicates,
            out_of_order: self.stat_out_of_order,
        }
    }

    /// Zero the counters and all sequence state.
    pub fn reset_stats(&mut self) {
        self.next_tx_seq = 0;
        self.next_rx_seq = 0;
        self.tx_window_base = 0;
        self.rx_window_base = 0;
        self.tx_pending_mask = 0;
        self.rx_received_mask = 0;
        self.stat_retransmits = 0;
        self.stat_duplicates = 0;
        self.stat_out_of_order = 0;
        for slot in &mut self.tx_slots {
            *slot = None;
        }
        for slot in &mut self.rx_slots {
            *slot = None;
        }
    }
}

/// Build the ACK header answering `src`.
///
/// Source and destination are swapped, the ACK flag is set,
/// `sequence = ack_seq` (the highest contiguously delivered sequence) and
/// `header_crc` is computed exactly as for data frames so ACKs survive the
/// same integrity checks.
pub fn ack_build(src: &FrameHeader, ack_seq: u32) -> FrameHeader {
    let mut ack = FrameHeader {
        magic: FRAME_MAGIC,
        version: FRAME_VERSION,
        flags: FrameFlags::ACK,
        length: HEADER_SIZE as u32,
        src_endpoint: src.dst_endpoint,
        dst_endpoint: src.src_endpoint,
        sequence: ack_seq,
        cmd_type: 0,
        header_crc: 0,
        payload_crc: 0,
    };
    ack.header_crc = ack.compute_header_crc();
    ack
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame;

    fn data_header(seq: u32) -> FrameHeader {
        let mut h = FrameHeader::new(0x10, 0x20, 1);
        h.sequence = seq;
        h.length = HEADER_SIZE as u32;
        h
    }

    fn send_one(ctx: &mut ReliableContext, now_ms: u32) -> u32 {
        let mut header = FrameHeader::new(0x10, 0x20, 1);
        let frame = vec![0xAB; 48];
        ctx.on_send(&frame, &mut header, now_ms).unwrap();
        header.sequence
    }

    #[test]
    fn test_window_clamp_and_init() {
        let ctx = ReliableContext::new(200);
        assert!(ctx.window_size() <= MAX_WINDOW_SIZE);
        assert!(ctx.window_size() <= 32);
        assert_eq!(ctx.rto(), 1000);
        assert!(ctx.can_send());
    }

    #[test]
    fn test_window_fills_and_overflows() {
        let mut ctx = ReliableContext::new(4);
        for i in 0..4 {
            assert_eq!(send_one(&mut ctx, 0), i);
        }
        assert!(!ctx.can_send());

        let mut header = FrameHeader::new(0x10, 0x20, 1);
        assert!(matches!(
            ctx.on_send(&[0u8; 8], &mut header, 0),
            Err(Error::Overflow(_))
        ));
    }

    #[test]
    fn test_cumulative_ack_slides_window() {
        let mut ctx = ReliableContext::new(4);
        for _ in 0..4 {
            send_one(&mut ctx, 0);
        }

        let ack = ack_build(&data_header(0), 2);
        ctx.on_ack(&ack).unwrap();
        assert!(ctx.can_send());
        assert_eq!(send_one(&mut ctx, 10), 4);

        // Late ACK is silently accepted.
        let late = ack_build(&data_header(0), 1);
        ctx.on_ack(&late).unwrap();
        assert_eq!(ctx.next_sequence(), 5);
    }

    #[test]
    fn test_ack_requires_flag() {
        let mut ctx = ReliableContext::new(4);
        send_one(&mut ctx, 0);
        let bogus = data_header(0);
        assert!(ctx.on_ack(&bogus).is_err());
    }

    #[test]
    fn test_retransmission_after_timeout() {
        // Window 8, rto 1000. Sequences 0..3 sent at t = 0, 100, 200, 300.
        // A cumulative ACK for 1 arrives, then poll at t = 5000 must
        // retransmit exactly sequences 2 and 3.
        let mut ctx = ReliableContext::new(8);
        let mut frames = Vec::new();
        for i in 0..4u32 {
            let mut header = FrameHeader::new(0x10, 0x20, 1);
            let mut wire = vec![0u8; 64];
            header.sequence = ctx.next_sequence();
            let n = frame::encode(&mut wire, &[i as u8; 8], &mut header).unwrap();
            wire.truncate(n);
            ctx.on_send(&wire, &mut header, i * 100).unwrap();
            frames.push(wire);
        }

        let ack = ack_build(&data_header(0), 1);
        ctx.on_ack(&ack).unwrap();

        let mut resent = Vec::new();
        ctx.poll(5000, |bytes| resent.push(bytes.to_vec()));

        assert_eq!(resent.len(), 2);
        assert_eq!(resent[0], frames[2]);
        assert_eq!(resent[1], frames[3]);

        let stats = ctx.stats();
        assert_eq!(stats.retransmits, 2);
        assert_eq!(stats.duplicates, 0);

        // Timestamps were refreshed: an immediate second poll is quiet.
        let mut again = 0;
        ctx.poll(5100, |_| again += 1);
        assert_eq!(again, 0);
    }

    #[test]
    fn test_poll_before_timeout_is_quiet() {
        let mut ctx = ReliableContext::new(8);
        send_one(&mut ctx, 0);
        let mut fired = 0;
        ctx.poll(999, |_| fired += 1);
        assert_eq!(fired, 0);
        ctx.poll(1001, |_| fired += 1);
        assert_eq!(fired, 1);
    }

    #[test]
    fn test_out_of_order_buffered_and_delivered_in_order() {
        // Sequence 2 arrives before 0 and 1; the handler must observe
        // 0, 1, 2 in order and exactly once each.
        let mut ctx = ReliableContext::new(8);
        let mut delivered = Vec::new();

        let ack = ctx
            .on_receive(&data_header(2), b"two", |seq, p| {
                delivered.push((seq, p.to_vec()))
            })
            .unwrap();
        assert!(delivered.is_empty());
        assert!(ctx.stats().out_of_order >= 1);
        // Nothing contiguously delivered yet.
        assert_eq!(ack.sequence, u32::MAX);

        ctx.on_receive(&data_header(0), b"zero", |seq, p| {
            delivered.push((seq, p.to_vec()))
        })
        .unwrap();
        assert_eq!(delivered, vec![(0, b"zero".to_vec())]);

        let ack = ctx
            .on_receive(&data_header(1), b"one", |seq, p| {
                delivered.push((seq, p.to_vec()))
            })
            .unwrap();
        assert_eq!(
            delivered,
            vec![
                (0, b"zero".to_vec()),
                (1, b"one".to_vec()),
                (2, b"two".to_vec()),
            ]
        );
        assert_eq!(ack.sequence, 2);
        assert!(ack.flags.contains(FrameFlags::ACK));
    }

    #[test]
    fn test_duplicates_counted_not_redelivered() {
        let mut ctx = ReliableContext::new(8);
        let mut count = 0;

        ctx.on_receive(&data_header(0), b"x", |_, _| count += 1)
            .unwrap();
        ctx.on_receive(&data_header(0), b"x", |_, _| count += 1)
            .unwrap();
        assert_eq!(count, 1);
        assert_eq!(ctx.stats().duplicates, 1);

        // Duplicate of a buffered out-of-order frame.
        ctx.on_receive(&data_header(3), b"y", |_, _| count += 1)
            .unwrap();
        ctx.on_receive(&data_header(3), b"y", |_, _| count += 1)
            .unwrap();
        assert_eq!(count, 1);
        assert_eq!(ctx.stats().duplicates, 2);
        assert_eq!(ctx.stats().out_of_order, 1);
    }

    #[test]
    fn test_receive_outside_window_rejected() {
        let mut ctx = ReliableContext::new(4);
        let err = ctx
            .on_receive(&data_header(100), b"", |_, _| {})
            .unwrap_err();
        assert!(matches!(err, Error::Invalid(_)));
    }

    #[test]
    fn test_window_liveness_under_ack_loss() {
        // Every frame is "lost" once, then retransmitted and acked; the
        // in-flight count must drain to zero once sending stops.
        let mut tx = ReliableContext::new(4);
        let mut rx = ReliableContext::new(4);
        let mut now = 0u32;

        for _ in 0..12u32 {
            let mut header = FrameHeader::new(1, 2, 0);
            header.sequence = tx.next_sequence();
            let mut wire = vec![0u8; 64];
            let n = frame::encode(&mut wire, b"payload", &mut header).unwrap();
            wire.truncate(n);
            tx.on_send(&wire, &mut header, now).unwrap();

            // First transmission lost; poll retransmits after rto.
            now += 1500;
            let mut resent = Vec::new();
            tx.poll(now, |bytes| resent.push(bytes.to_vec()));
            assert_eq!(resent.len(), 1);

            let (h, p) = frame::decode(&resent[0]).unwrap();
            let ack = rx.on_receive(&h, &p, |_, _| {}).unwrap();
            tx.on_ack(&ack).unwrap();
        }

        assert!(tx.can_send());
        assert_eq!(tx.next_sequence(), 12);
        assert_eq!(tx.stats().retransmits, 12);
        // Window fully drained: base caught up with the cursor.
        let mut pending = 0;
        tx.poll(u32::MAX / 2, |_| pending += 1);
        assert_eq!(pending, 0);
    }

    #[test]
    fn test_reset_stats_clears_sequence_state() {
        let mut ctx = ReliableContext::new(4);
        send_one(&mut ctx, 0);
        ctx.on_receive(&data_header(0), b"x", |_, _| {}).unwrap();
        ctx.reset_stats();

        let stats = ctx.stats();
        assert_eq!(stats, ReliableStats::default());
        assert_eq!(ctx.next_sequence(), 0);
    }

    #[test]
    fn test_ack_header_crc_matches_data_frames() {
        let ack = ack_build(&data_header(5), 5);
        assert_eq!(ack.header_crc, ack.compute_header_crc());
        assert_eq!(ack.src_endpoint, 0x20);
        assert_eq!(ack.dst_endpoint, 0x10);

        // The ACK serializes into a frame that decodes cleanly.
        let mut wire = [0u8; HEADER_SIZE];
        ack.write_le(&mut wire);
        let (decoded, payload) = frame::decode(&wire).unwrap();
        assert!(payload.is_empty());
        assert_eq!(decoded.sequence, 5);
    }
}
