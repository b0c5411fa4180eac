//! Frame layout: packed POD structs shared by encoder and decoder.

/// Size of the fixed frame header in bytes.
pub const HEADER_BYTES: usize = 16;
/// Size of the trailing checksum word in bytes.
pub const CHECKSUM_BYTES: usize = 4;

pub const TRADE_FRAME_BYTES: usize = 32;
pub const QUOTE_FRAME_BYTES: usize = 44;
pub const HEARTBEAT_FRAME_BYTES: usize = 20;

/// Largest legal frame. Anything claiming to be bigger is garbage.
pub const MAX_FRAME_BYTES: usize = QUOTE_FRAME_BYTES;

/// Upper bound on symbol ids the feed will ever carry.
pub const MAX_SYMBOLS: usize = 500;

pub const DEFAULT_PORT: u16 = 9876;

/// First byte of a client -> server subscription frame.
pub const SUBSCRIBE_CMD: u8 = 0xFF;

/// Wire discriminant for the three frame kinds.
#[repr(u16)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameKind {
    Trade = 1,
    Quote = 2,
    Heartbeat = 3,
}

impl FrameKind {
    pub fn from_u16(raw: u16) -> Option<Self> {
        match raw {
            1 => Some(FrameKind::Trade),
            2 => Some(FrameKind::Quote),
            3 => Some(FrameKind::Heartbeat),
            _ => None,
        }
    }

    /// Total frame length for this kind, checksum included.
    #[inline]
    pub fn frame_bytes(self) -> usize {
        match self {
            FrameKind::Trade => TRADE_FRAME_BYTES,
            FrameKind::Quote => QUOTE_FRAME_BYTES,
            FrameKind::Heartbeat => HEARTBEAT_FRAME_BYTES,
        }
    }
}

/// Frame length for a raw kind value, or 0 when the kind is unknown.
///
/// The decoder uses the 0 return to trigger byte-level resync rather than
/// carrying an `Option` through the hot path.
#[inline]
pub fn frame_bytes_for(raw_kind: u16) -> usize {
    match FrameKind::from_u16(raw_kind) {
        Some(kind) => kind.frame_bytes(),
        None => 0,
    }
}

/// Fixed 16-byte header at the start of every frame.
///
/// Packed so the struct bytes are exactly the wire bytes. Fields read out
/// of a packed struct are copied by value; never borrow them.
#[repr(C, packed)]
#[derive(Clone, Copy, Debug, Default)]
pub struct FrameHeader {
    pub kind: u16,
    /// Monotonically increasing per publisher session, wraps at u32::MAX.
    pub seq: u32,
    /// Publisher wall clock, nanoseconds since the epoch.
    pub ts_ns: u64,
    /// Ignored for heartbeats.
    pub symbol_id: u16,
}

#[repr(C, packed)]
#[derive(Clone, Copy, Debug, Default)]
pub struct TradePayload {
    pub price: f64,
    pub qty: u32,
}

#[repr(C, packed)]
#[derive(Clone, Copy, Debug, Default)]
pub struct QuotePayload {
    pub bid_px: f64,
    pub bid_qty: u32,
    pub ask_px: f64,
    pub ask_qty: u32,
}

/// Complete trade frame as laid out on the wire.
#[repr(C, packed)]
#[derive(Clone, Copy, Debug)]
pub struct TradeFrame {
    pub header: FrameHeader,
    pub payload: TradePayload,
    pub checksum: u32,
}

/// Complete quote frame as laid out on the wire.
#[repr(C, packed)]
#[derive(Clone, Copy, Debug)]
pub struct QuoteFrame {
    pub header: FrameHeader,
    pub payload: QuotePayload,
    pub checksum: u32,
}

/// Complete heartbeat frame as laid out on the wire.
#[repr(C, packed)]
#[derive(Clone, Copy, Debug)]
pub struct HeartbeatFrame {
    pub header: FrameHeader,
    pub checksum: u32,
}

// The decoder casts raw buffer bytes straight to these structs, so the
// layouts must never drift from the wire constants.
const _: () = assert!(std::mem::size_of::<FrameHeader>() == HEADER_BYTES);
const _: () = assert!(std::mem::size_of::<TradeFrame>() == TRADE_FRAME_BYTES);
const _: () = assert!(std::mem::size_of::<QuoteFrame>() == QUOTE_FRAME_BYTES);
const _: () = assert!(std::mem::size_of::<HeartbeatFrame>() == HEARTBEAT_FRAME_BYTES);
const _: () = assert!(std::mem::align_of::<QuoteFrame>() == 1);

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem::{align_of, size_of};

    /// The packed layouts are the wire format; a silent size change would
    /// corrupt every stream, so pin them here as well as at compile time.
    #[test]
    fn frame_layouts_are_wire_exact() {
        assert_eq!(size_of::<FrameHeader>(), 16);
        assert_eq!(size_of::<TradePayload>(), 12);
        assert_eq!(size_of::<QuotePayload>(), 24);
        assert_eq!(size_of::<TradeFrame>(), 32);
        assert_eq!(size_of::<QuoteFrame>(), 44);
        assert_eq!(size_of::<HeartbeatFrame>(), 20);
        assert_eq!(align_of::<FrameHeader>(), 1, "header should be packed");
    }

    #[test]
    fn kind_roundtrip_and_sizes() {
        assert_eq!(FrameKind::from_u16(1), Some(FrameKind::Trade));
        assert_eq!(FrameKind::from_u16(2), Some(FrameKind::Quote));
        assert_eq!(FrameKind::from_u16(3), Some(FrameKind::Heartbeat));
        assert_eq!(FrameKind::from_u16(0), None);
        assert_eq!(FrameKind::from_u16(0xBEEF), None);

        assert_eq!(frame_bytes_for(1), TRADE_FRAME_BYTES);
        assert_eq!(frame_bytes_for(2), QUOTE_FRAME_BYTES);
        assert_eq!(frame_bytes_for(3), HEARTBEAT_FRAME_BYTES);
        assert_eq!(frame_bytes_for(99), 0);
    }
}
