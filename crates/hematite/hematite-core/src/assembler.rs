//! Streaming frame reassembly with byte-level resync.
//!
//! TCP hands the consumer arbitrary chunk boundaries; the assembler
//! buffers them and walks complete frames out of the front. Corruption
//! never stalls the stream: an unknown kind or a bad checksum advances
//! the read cursor by a single byte and tries again, so progress on
//! garbage is at worst O(bytes).

use ferrite_wire::{
    checksum, frame_bytes_for, view_header, view_heartbeat, view_quote, view_trade, FrameKind,
    HeartbeatFrame, QuoteFrame, TradeFrame, CHECKSUM_BYTES, HEADER_BYTES, MAX_FRAME_BYTES,
};
use tracing::warn;

/// Initial reassembly buffer capacity.
pub const INITIAL_BUFFER_BYTES: usize = 4 * 1024 * 1024;
/// Hard cap; ingest is refused beyond this.
pub const MAX_BUFFER_BYTES: usize = 16 * 1024 * 1024;

/// Result of one parse step.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ParseOutcome {
    /// A valid, in-order frame was delivered.
    Ok,
    /// A valid frame was delivered but its sequence number jumped.
    Gap,
    /// The buffer holds only a frame prefix.
    NeedMore,
    /// Unrecognized kind byte; cursor advanced by one.
    Invalid,
    /// Checksum mismatch; cursor advanced by one.
    ChecksumError,
}

/// Receiver of validated frames. Views borrow the assembler's buffer:
/// copy fields by value, never hold them past the callback.
pub trait FrameSink {
    fn on_trade(&mut self, frame: &TradeFrame);
    fn on_quote(&mut self, frame: &QuoteFrame);
    fn on_heartbeat(&mut self, _frame: &HeartbeatFrame) {}
    fn on_gap(&mut self, _expected: u32, _received: u32) {}
}

/// Counters exposed alongside the stream.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct AssemblerStats {
    pub frames: u64,
    pub trades: u64,
    pub quotes: u64,
    pub gaps: u64,
    pub checksum_errors: u64,
    pub malformed: u64,
}

pub struct FrameAssembler {
    buf: Vec<u8>,
    read_pos: usize,
    write_pos: usize,
    expected_seq: u32,
    first_frame: bool,
    stats: AssemblerStats,
}

impl FrameAssembler {
    pub fn new() -> Self {
        Self {
            buf: vec![0u8; INITIAL_BUFFER_BYTES],
            read_pos: 0,
            write_pos: 0,
            expected_seq: 0,
            first_frame: true,
            stats: AssemblerStats::default(),
        }
    }

    pub fn stats(&self) -> AssemblerStats {
        self.stats
    }

    pub fn buffered(&self) -> usize {
        self.write_pos - self.read_pos
    }

    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    /// Next sequence number the assembler expects; test/resync hook.
    pub fn expected_seq(&self) -> u32 {
        self.expected_seq
    }

    /// Append raw bytes, compacting and growing (doubling, capped) as
    /// needed. Returns bytes accepted: 0 when the hard cap forces a drop.
    pub fn ingest(&mut self, data: &[u8]) -> usize {
        if data.is_empty() {
            return 0;
        }

        if self.buf.len() - self.write_pos < data.len() {
            self.compact();

            while self.buf.len() - self.write_pos < data.len() {
                let new_size = (self.buf.len() * 2).min(MAX_BUFFER_BYTES);
                if new_size <= self.buf.len() {
                    // At the cap and still short on room; the stream will
                    // have to resync on whatever survives.
                    self.stats.malformed += 1;
                    warn!(
                        buffered = self.buffered(),
                        dropped = data.len(),
                        "reassembly buffer exhausted"
                    );
                    return 0;
                }
                self.buf.resize(new_size, 0);
            }
        }

        self.buf[self.write_pos..self.write_pos + data.len()].copy_from_slice(data);
        self.write_pos += data.len();
        data.len()
    }

    /// Slide the unread window to the front of the buffer.
    fn compact(&mut self) {
        if self.read_pos == 0 {
            return;
        }
        let used = self.buffered();
        if used > 0 {
            self.buf.copy_within(self.read_pos..self.write_pos, 0);
        }
        self.read_pos = 0;
        self.write_pos = used;
    }

    /// Parse every complete frame currently buffered, invoking `sink` per
    /// frame. Returns the number of delivered frames.
    pub fn drain(&mut self, sink: &mut impl FrameSink) -> usize {
        let mut delivered = 0usize;
        loop {
            match self.parse_one(sink) {
                ParseOutcome::Ok | ParseOutcome::Gap => delivered += 1,
                ParseOutcome::NeedMore => break,
                // Resync outcomes consumed a byte; keep scanning.
                ParseOutcome::Invalid | ParseOutcome::ChecksumError => {}
            }
        }
        delivered
    }

    /// Attempt to parse one frame at the read cursor.
    pub fn parse_one(&mut self, sink: &mut impl FrameSink) -> ParseOutcome {
        if self.buffered() < HEADER_BYTES {
            return ParseOutcome::NeedMore;
        }

        let start = self.read_pos;
        let header = unsafe { view_header(&self.buf[start..]) };
        let frame_len = frame_bytes_for(header.kind);

        // Unknown kind, or a length no real frame can have: shift one
        // byte and rescan. The length gate is redundant while the table
        // is closed but guards a future kind whose size outgrows the cap.
        if frame_len == 0 || frame_len > MAX_FRAME_BYTES {
            self.read_pos += 1;
            self.stats.malformed += 1;
            return ParseOutcome::Invalid;
        }

        if self.buffered() < frame_len {
            return ParseOutcome::NeedMore;
        }

        let body = frame_len - CHECKSUM_BYTES;
        let expected_sum = checksum(&self.buf[start..start + body]);
        let stored_sum = u32::from_le_bytes([
            self.buf[start + body],
            self.buf[start + body + 1],
            self.buf[start + body + 2],
            self.buf[start + body + 3],
        ]);
        if expected_sum != stored_sum {
            self.read_pos += 1;
            self.stats.checksum_errors += 1;
            return ParseOutcome::ChecksumError;
        }

        let gapped = !self.check_sequence(header.seq, sink);

        match FrameKind::from_u16(header.kind) {
            Some(FrameKind::Trade) => {
                let frame = unsafe { view_trade(&self.buf[start..start + frame_len]) };
                sink.on_trade(frame);
                self.stats.trades += 1;
            }
            Some(FrameKind::Quote) => {
                let frame = unsafe { view_quote(&self.buf[start..start + frame_len]) };
                sink.on_quote(frame);
                self.stats.quotes += 1;
            }
            Some(FrameKind::Heartbeat) => {
                let frame = unsafe { view_heartbeat(&self.buf[start..start + frame_len]) };
                sink.on_heartbeat(frame);
            }
            // frame_bytes_for already rejected unknown kinds.
            None => unreachable!("kind validated above"),
        }

        self.stats.frames += 1;
        self.read_pos += frame_len;

        if gapped {
            ParseOutcome::Gap
        } else {
            ParseOutcome::Ok
        }
    }

    /// Track the sequence; the frame is delivered either way. The first
    /// frame of a session seeds the expectation.
    fn check_sequence(&mut self, received: u32, sink: &mut impl FrameSink) -> bool {
        if self.first_frame {
            self.first_frame = false;
            self.expected_seq = received.wrapping_add(1);
            return true;
        }

        if received != self.expected_seq {
            sink.on_gap(self.expected_seq, received);
            self.stats.gaps += 1;
            self.expected_seq = received.wrapping_add(1);
            return false;
        }

        self.expected_seq = received.wrapping_add(1);
        true
    }

    /// Forget buffered bytes, sequence state and counters.
    pub fn reset(&mut self) {
        self.read_pos = 0;
        self.write_pos = 0;
        self.expected_seq = 0;
        self.first_frame = true;
        self.stats = AssemblerStats::default();
    }

    /// Forget stream position but keep counters: used across reconnects,
    /// where the new session starts a fresh sequence.
    pub fn resync(&mut self) {
        self.read_pos = 0;
        self.write_pos = 0;
        self.first_frame = true;
    }
}

impl Default for FrameAssembler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ferrite_wire::{
        encode_heartbeat, encode_quote, encode_trade, FrameHeader, QuotePayload, TradePayload,
        QUOTE_FRAME_BYTES, TRADE_FRAME_BYTES,
    };

    /// Sink that records everything it sees.
    #[derive(Default)]
    struct Recorder {
        trades: Vec<(u32, u16, f64, u32)>,
        quotes: Vec<(u32, u16, f64, f64)>,
        heartbeats: Vec<u32>,
        gaps: Vec<(u32, u32)>,
    }

    impl FrameSink for Recorder {
        fn on_trade(&mut self, frame: &TradeFrame) {
            self.trades.push((
                { frame.header.seq },
                { frame.header.symbol_id },
                { frame.payload.price },
                { frame.payload.qty },
            ));
        }

        fn on_quote(&mut self, frame: &QuoteFrame) {
            self.quotes.push((
                { frame.header.seq },
                { frame.header.symbol_id },
                { frame.payload.bid_px },
                { frame.payload.ask_px },
            ));
        }

        fn on_heartbeat(&mut self, frame: &HeartbeatFrame) {
            self.heartbeats.push({ frame.header.seq });
        }

        fn on_gap(&mut self, expected: u32, received: u32) {
            self.gaps.push((expected, received));
        }
    }

    fn trade_bytes(seq: u32, symbol_id: u16, price: f64, qty: u32) -> Vec<u8> {
        let mut out = vec![0u8; TRADE_FRAME_BYTES];
        let header = FrameHeader {
            kind: 0,
            seq,
            ts_ns: 1000 + seq as u64,
            symbol_id,
        };
        encode_trade(&header, &TradePayload { price, qty }, &mut out);
        out
    }

    fn quote_bytes(seq: u32, symbol_id: u16) -> Vec<u8> {
        let mut out = vec![0u8; QUOTE_FRAME_BYTES];
        let header = FrameHeader {
            kind: 0,
            seq,
            ts_ns: 1000 + seq as u64,
            symbol_id,
        };
        let payload = QuotePayload {
            bid_px: 99.5,
            bid_qty: 10,
            ask_px: 100.5,
            ask_qty: 20,
        };
        encode_quote(&header, &payload, &mut out);
        out
    }

    fn heartbeat_bytes(seq: u32) -> Vec<u8> {
        let mut out = vec![0u8; ferrite_wire::HEARTBEAT_FRAME_BYTES];
        let header = FrameHeader {
            kind: 0,
            seq,
            ts_ns: 0,
            symbol_id: 0,
        };
        encode_heartbeat(&header, &mut out);
        out
    }

    #[test]
    fn whole_frames_parse_in_order() {
        let mut asm = FrameAssembler::new();
        let mut sink = Recorder::default();

        asm.ingest(&trade_bytes(1, 3, 42.5, 100));
        asm.ingest(&quote_bytes(2, 4));
        asm.ingest(&heartbeat_bytes(3));
        assert_eq!(asm.drain(&mut sink), 3);

        assert_eq!(sink.trades, vec![(1, 3, 42.5, 100)]);
        assert_eq!(sink.quotes, vec![(2, 4, 99.5, 100.5)]);
        assert_eq!(sink.heartbeats, vec![3]);
        assert!(sink.gaps.is_empty());

        let stats = asm.stats();
        assert_eq!(stats.frames, 3);
        assert_eq!(stats.trades, 1);
        assert_eq!(stats.quotes, 1);
        assert_eq!(stats.gaps, 0);
    }

    /// The defining property: any chunking of a frame stream, down to one
    /// byte at a time, reproduces exactly the same frames in order.
    #[test]
    fn single_byte_fragmentation() {
        let mut stream = Vec::new();
        for seq in 1..=50u32 {
            if seq % 3 == 0 {
                stream.extend_from_slice(&quote_bytes(seq, 7));
            } else {
                stream.extend_from_slice(&trade_bytes(seq, 7, 10.0 + seq as f64, seq));
            }
        }

        let mut asm = FrameAssembler::new();
        let mut sink = Recorder::default();
        let mut delivered = 0;
        for byte in &stream {
            asm.ingest(std::slice::from_ref(byte));
            delivered += asm.drain(&mut sink);
        }

        assert_eq!(delivered, 50);
        assert_eq!(sink.trades.len() + sink.quotes.len(), 50);
        assert!(sink.gaps.is_empty());
        assert_eq!(asm.stats().checksum_errors, 0);
        assert_eq!(asm.buffered(), 0);
    }

    #[test]
    fn ragged_chunk_sizes() {
        let mut stream = Vec::new();
        for seq in 1..=200u32 {
            stream.extend_from_slice(&trade_bytes(seq, 1, 5.0, 1));
        }

        let mut asm = FrameAssembler::new();
        let mut sink = Recorder::default();
        let mut delivered = 0;
        // Chunk sizes that never align with the 32-byte frame.
        let mut at = 0usize;
        let mut step = 1usize;
        while at < stream.len() {
            let end = (at + step).min(stream.len());
            asm.ingest(&stream[at..end]);
            delivered += asm.drain(&mut sink);
            at = end;
            step = step % 61 + 1;
        }
        assert_eq!(delivered, 200);
        assert!(sink.gaps.is_empty());
    }

    #[test]
    fn first_frame_seeds_sequence() {
        let mut asm = FrameAssembler::new();
        let mut sink = Recorder::default();
        // Session starts mid-stream at seq 1000: not a gap.
        asm.ingest(&trade_bytes(1000, 0, 1.0, 1));
        asm.ingest(&trade_bytes(1001, 0, 1.0, 1));
        assert_eq!(asm.drain(&mut sink), 2);
        assert!(sink.gaps.is_empty());
        assert_eq!(asm.expected_seq(), 1002);
    }

    #[test]
    fn gap_is_reported_but_frame_still_delivered() {
        let mut asm = FrameAssembler::new();
        let mut sink = Recorder::default();
        asm.ingest(&trade_bytes(1, 0, 1.0, 1));
        asm.ingest(&trade_bytes(2, 0, 1.0, 1));
        // 3 and 4 lost.
        asm.ingest(&trade_bytes(5, 0, 1.0, 1));
        asm.ingest(&trade_bytes(6, 0, 1.0, 1));

        assert_eq!(asm.drain(&mut sink), 4);
        assert_eq!(sink.gaps, vec![(3, 5)]);
        assert_eq!(asm.stats().gaps, 1);
        assert_eq!(sink.trades.len(), 4, "gapped frame must not be suppressed");
    }

    #[test]
    fn noise_between_frames_resyncs() {
        let mut asm = FrameAssembler::new();
        let mut sink = Recorder::default();

        asm.ingest(&trade_bytes(1, 0, 1.0, 1));
        // Garbage that looks nothing like a frame header.
        asm.ingest(&[0xDE, 0xAD, 0xBE, 0xEF, 0x99, 0x00, 0x77]);
        asm.ingest(&trade_bytes(2, 0, 2.0, 2));

        asm.drain(&mut sink);
        assert_eq!(sink.trades.len(), 2, "frame after noise must survive");
        let stats = asm.stats();
        assert!(
            stats.malformed + stats.checksum_errors > 0,
            "noise should be counted"
        );
    }

    #[test]
    fn corrupted_byte_is_a_checksum_error_not_a_stall() {
        let mut asm = FrameAssembler::new();
        let mut sink = Recorder::default();

        let mut bad = trade_bytes(1, 0, 1.0, 1);
        bad[20] ^= 0xFF;
        asm.ingest(&bad);
        asm.ingest(&trade_bytes(2, 0, 2.0, 2));

        asm.drain(&mut sink);
        assert!(asm.stats().checksum_errors >= 1);
        // The clean frame made it through.
        assert!(sink.trades.iter().any(|t| t.0 == 2));
    }

    #[test]
    fn partial_header_waits_for_more() {
        let mut asm = FrameAssembler::new();
        let mut sink = Recorder::default();
        let frame = trade_bytes(1, 0, 1.0, 1);
        asm.ingest(&frame[..10]);
        assert_eq!(asm.parse_one(&mut sink), ParseOutcome::NeedMore);
        asm.ingest(&frame[10..]);
        assert_eq!(asm.parse_one(&mut sink), ParseOutcome::Ok);
    }

    #[test]
    fn compaction_preserves_partial_frames() {
        let mut asm = FrameAssembler::new();
        let mut sink = Recorder::default();

        // Fill most of the buffer with frames and drain them, leaving the
        // read cursor deep in the buffer.
        let frame = trade_bytes(1, 0, 1.0, 1);
        let mut seq = 0u32;
        while asm.buffered() + frame.len() < INITIAL_BUFFER_BYTES {
            seq += 1;
            if asm.ingest(&trade_bytes(seq, 0, 1.0, 1)) == 0 {
                break;
            }
        }
        asm.drain(&mut sink);
        assert_eq!(asm.buffered(), 0);

        // The next quote won't fit in the remaining tail, forcing a
        // compaction with a partial frame already buffered.
        let tail = quote_bytes(seq + 1, 0);
        asm.ingest(&tail[..13]);
        asm.ingest(&tail[13..]);
        let before = sink.quotes.len();
        asm.drain(&mut sink);
        assert_eq!(sink.quotes.len(), before + 1);
        assert!(sink.gaps.is_empty());
    }

    #[test]
    fn hard_cap_refuses_ingest() {
        let mut asm = FrameAssembler::new();
        // Stuff the buffer with unparseable bytes up to the cap without
        // draining.
        let junk = vec![0u8; 1 << 20];
        let mut accepted = 0usize;
        for _ in 0..(MAX_BUFFER_BYTES / junk.len()) + 4 {
            accepted += asm.ingest(&junk);
        }
        assert_eq!(accepted, MAX_BUFFER_BYTES);
        assert!(asm.stats().malformed >= 1);
        assert_eq!(asm.capacity(), MAX_BUFFER_BYTES);
    }

    #[test]
    fn sequence_wraps_at_u32_max() {
        let mut asm = FrameAssembler::new();
        let mut sink = Recorder::default();
        asm.ingest(&trade_bytes(u32::MAX, 0, 1.0, 1));
        asm.ingest(&trade_bytes(0, 0, 1.0, 1));
        asm.drain(&mut sink);
        assert!(sink.gaps.is_empty(), "u32 wrap is not a gap");
    }

    #[test]
    fn resync_keeps_counters_but_reseeds_sequence() {
        let mut asm = FrameAssembler::new();
        let mut sink = Recorder::default();
        asm.ingest(&trade_bytes(1, 0, 1.0, 1));
        asm.drain(&mut sink);
        let frames_before = asm.stats().frames;

        asm.resync();
        // New session starting from an unrelated sequence: no gap.
        asm.ingest(&trade_bytes(500, 0, 1.0, 1));
        asm.drain(&mut sink);
        assert!(sink.gaps.is_empty());
        assert_eq!(asm.stats().frames, frames_before + 1);
    }
}
