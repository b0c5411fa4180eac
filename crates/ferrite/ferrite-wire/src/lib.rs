//! `ferrite-wire`: binary wire format for the market data feed.
//!
//! Frames are fixed-size packed records: a 16-byte header, a
//! kind-determined payload, and a trailing 4-byte XOR checksum. Everything
//! is little-endian on the wire, which is also the in-memory layout of the
//! packed structs on the targets we support — encode and decode are plain
//! unaligned copies, no per-field shuffling.
//!
//! # Frame sizes
//!
//! | Kind      | Header | Payload | Checksum | Total |
//! |-----------|--------|---------|----------|-------|
//! | Trade     | 16     | 12      | 4        | 32    |
//! | Quote     | 16     | 24      | 4        | 44    |
//! | Heartbeat | 16     | 0       | 4        | 20    |

#[cfg(target_endian = "big")]
compile_error!("ferrite-wire assumes a little-endian target (wire format is little-endian POD)");

mod clock;
mod codec;
mod frame;

pub use clock::wall_clock_ns;
pub use codec::{
    checksum, encode_heartbeat, encode_quote, encode_trade, view_header, view_heartbeat,
    view_quote, view_trade,
};
pub use frame::{
    FrameHeader, FrameKind, HeartbeatFrame, QuoteFrame, QuotePayload, TradeFrame, TradePayload,
    frame_bytes_for, CHECKSUM_BYTES, DEFAULT_PORT, HEADER_BYTES, HEARTBEAT_FRAME_BYTES,
    MAX_FRAME_BYTES, MAX_SYMBOLS, QUOTE_FRAME_BYTES, SUBSCRIBE_CMD, TRADE_FRAME_BYTES,
};
