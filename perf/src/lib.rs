//! Shared fixtures for the ferrite benchmark suite.

use ferrite_wire::{
    encode_quote, encode_trade, FrameHeader, QuotePayload, TradePayload, MAX_FRAME_BYTES,
};

pub fn test_quote_payload() -> QuotePayload {
    QuotePayload {
        bid_px: 1234.55,
        bid_qty: 1_500,
        ask_px: 1234.65,
        ask_qty: 2_300,
    }
}

pub fn test_trade_payload() -> TradePayload {
    TradePayload {
        price: 1234.60,
        qty: 750,
    }
}

pub fn test_header(seq: u32) -> FrameHeader {
    FrameHeader {
        kind: 0,
        seq,
        ts_ns: 1_700_000_000_000_000_000 + seq as u64,
        symbol_id: (seq % 64) as u16,
    }
}

/// A contiguous stream of `count` alternating trade/quote frames with
/// consecutive sequence numbers, as the publisher would emit it.
pub fn frame_stream(count: u32) -> Vec<u8> {
    let mut stream = Vec::with_capacity(count as usize * MAX_FRAME_BYTES);
    let mut buf = [0u8; MAX_FRAME_BYTES];
    for seq in 1..=count {
        let header = test_header(seq);
        let len = if seq % 2 == 0 {
            encode_quote(&header, &test_quote_payload(), &mut buf)
        } else {
            encode_trade(&header, &test_trade_payload(), &mut buf)
        };
        stream.extend_from_slice(&buf[..len]);
    }
    stream
}
