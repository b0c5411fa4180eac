//! Synthetic tick generation: geometric Brownian motion per symbol,
//! serialized straight into wire frames.

use ferrite_wire::{
    encode_heartbeat, encode_quote, encode_trade, wall_clock_ns, FrameHeader, QuotePayload,
    TradePayload,
};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use std::str::FromStr;

/// Fraction of ticks emitted as trades; the rest are quotes.
const TRADE_RATIO: f64 = 0.30;

/// GBM time step (1 ms).
const TIME_STEP: f64 = 0.001;

/// Price clamp keeping the random walk out of numerical trouble.
const PRICE_FLOOR: f64 = 1.0;
const PRICE_CEIL: f64 = 100_000.0;

/// One gap per this many ticks when fault injection is on.
const FAULT_PERIOD: u64 = 100;

/// Session-wide drift regime applied to every symbol.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MarketCondition {
    Neutral,
    Bullish,
    Bearish,
}

impl MarketCondition {
    fn drift(self) -> f64 {
        match self {
            MarketCondition::Neutral => 0.0,
            MarketCondition::Bullish => 0.05,
            MarketCondition::Bearish => -0.05,
        }
    }
}

impl FromStr for MarketCondition {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "neutral" => Ok(MarketCondition::Neutral),
            "bullish" | "bull" => Ok(MarketCondition::Bullish),
            "bearish" | "bear" => Ok(MarketCondition::Bearish),
            other => Err(format!("unknown market condition '{other}'")),
        }
    }
}

/// Per-symbol model state.
#[derive(Clone, Copy, Debug, Default)]
struct SymbolModel {
    price: f64,
    bid_px: f64,
    ask_px: f64,
    volatility: f64,
    drift: f64,
    bid_qty: u32,
    ask_qty: u32,
    last_trade_qty: u32,
}

/// Stateful frame generator. Pure producer: fills caller buffers, does no
/// I/O, and owns the session sequence counter.
pub struct TickSource {
    symbols: Vec<SymbolModel>,
    sequence: u32,
    condition: MarketCondition,
    rng: SmallRng,
    /// Box–Muller produces normals in pairs; the spare is cached here.
    spare_normal: Option<f64>,
    fault_injection: bool,
    fault_counter: u64,
}

impl TickSource {
    pub fn new(num_symbols: usize) -> Self {
        Self::with_seed(num_symbols, rand::random())
    }

    /// Deterministic construction for tests and replayable sessions.
    pub fn with_seed(num_symbols: usize, seed: u64) -> Self {
        let num_symbols = num_symbols.clamp(1, ferrite_wire::MAX_SYMBOLS);
        let mut source = Self {
            symbols: vec![SymbolModel::default(); num_symbols],
            sequence: 0,
            condition: MarketCondition::Neutral,
            rng: SmallRng::seed_from_u64(seed),
            spare_normal: None,
            fault_injection: false,
            fault_counter: 0,
        };
        source.reset();
        source
    }

    /// Re-seed every symbol with a fresh starting price and zero the
    /// session sequence.
    pub fn reset(&mut self) {
        self.sequence = 0;
        self.spare_normal = None;
        self.fault_counter = 0;
        let drift = self.condition.drift();
        for i in 0..self.symbols.len() {
            let mut sym = SymbolModel {
                price: self.rng.gen_range(100.0..5000.0),
                volatility: self.rng.gen_range(0.01..0.06),
                drift,
                bid_qty: self.rng.gen_range(100..=10_000),
                ask_qty: self.rng.gen_range(100..=10_000),
                ..Default::default()
            };
            self.update_spread(&mut sym);
            self.symbols[i] = sym;
        }
    }

    pub fn set_market(&mut self, condition: MarketCondition) {
        self.condition = condition;
        let drift = condition.drift();
        for sym in &mut self.symbols {
            sym.drift = drift;
        }
    }

    pub fn set_fault_injection(&mut self, enabled: bool) {
        self.fault_injection = enabled;
        self.fault_counter = 0;
    }

    pub fn sequence(&self) -> u32 {
        self.sequence
    }

    pub fn num_symbols(&self) -> usize {
        self.symbols.len()
    }

    /// Standard normal via the cached-pair Box–Muller transform.
    fn next_normal(&mut self) -> f64 {
        if let Some(z) = self.spare_normal.take() {
            return z;
        }
        let mut u1: f64 = self.rng.gen();
        while u1 <= 0.0 {
            u1 = self.rng.gen();
        }
        let u2: f64 = self.rng.gen();

        let mag = (-2.0 * u1.ln()).sqrt();
        let theta = 2.0 * std::f64::consts::PI * u2;
        self.spare_normal = Some(mag * theta.sin());
        mag * theta.cos()
    }

    /// One GBM step: dS = µS dt + σS dW, then refresh the spread.
    fn update_price(&mut self, symbol_id: u16) {
        let dw = self.next_normal() * TIME_STEP.sqrt();
        let mut sym = self.symbols[symbol_id as usize];
        sym.price += sym.drift * sym.price * TIME_STEP + sym.volatility * sym.price * dw;
        sym.price = sym.price.clamp(PRICE_FLOOR, PRICE_CEIL);
        self.update_spread(&mut sym);
        self.symbols[symbol_id as usize] = sym;
    }

    /// Spread is 0.05%..0.2% of price, prices rounded to 2 decimals.
    fn update_spread(&mut self, sym: &mut SymbolModel) {
        let spread_pct = 0.0005 + self.rng.gen::<f64>() * 0.0015;
        let half_spread = sym.price * spread_pct / 2.0;
        sym.bid_px = round2(sym.price - half_spread);
        sym.ask_px = round2(sym.price + half_spread);
    }

    /// Generate one tick for a random symbol into `out`.
    ///
    /// Returns the frame length and the chosen symbol. With fault
    /// injection enabled, every [`FAULT_PERIOD`]th call first generates
    /// and discards a tick, burning a sequence number to fabricate a gap
    /// downstream.
    pub fn emit_tick(&mut self, out: &mut [u8]) -> (usize, u16) {
        if self.fault_injection {
            self.fault_counter += 1;
            if self.fault_counter % FAULT_PERIOD == 0 {
                let symbol_id = self.rng.gen_range(0..self.symbols.len() as u16);
                let _ = self.emit_tick_for(symbol_id, out);
            }
        }
        let symbol_id = self.rng.gen_range(0..self.symbols.len() as u16);
        let len = self.emit_tick_for(symbol_id, out);
        (len, symbol_id)
    }

    /// Generate one tick for a specific symbol into `out`.
    pub fn emit_tick_for(&mut self, symbol_id: u16, out: &mut [u8]) -> usize {
        if symbol_id as usize >= self.symbols.len() {
            return 0;
        }

        self.update_price(symbol_id);
        self.sequence = self.sequence.wrapping_add(1);

        let header = FrameHeader {
            kind: 0, // stamped by the encoder
            seq: self.sequence,
            ts_ns: wall_clock_ns(),
            symbol_id,
        };

        let is_trade = self.rng.gen::<f64>() < TRADE_RATIO;
        if is_trade {
            let sym = self.symbols[symbol_id as usize];
            // Trade prints near the mid, jittered within the spread.
            let offset = (self.rng.gen::<f64>() - 0.5) * (sym.ask_px - sym.bid_px);
            let qty = 100 + (self.rng.gen::<f64>() * 9_900.0) as u32;
            self.symbols[symbol_id as usize].last_trade_qty = qty;

            let payload = TradePayload {
                price: round2(sym.price + offset),
                qty,
            };
            encode_trade(&header, &payload, out)
        } else {
            // Quote quantities take a bounded random walk with a floor.
            let bid_step = self.rng.gen_range(-500i32..=500);
            let ask_step = self.rng.gen_range(-500i32..=500);
            let sym = &mut self.symbols[symbol_id as usize];
            sym.bid_qty = (sym.bid_qty as i32 + bid_step).max(100) as u32;
            sym.ask_qty = (sym.ask_qty as i32 + ask_step).max(100) as u32;

            let payload = QuotePayload {
                bid_px: sym.bid_px,
                bid_qty: sym.bid_qty,
                ask_px: sym.ask_px,
                ask_qty: sym.ask_qty,
            };
            encode_quote(&header, &payload, out)
        }
    }

    /// Generate a heartbeat carrying the next sequence number.
    pub fn emit_heartbeat(&mut self, out: &mut [u8]) -> usize {
        self.sequence = self.sequence.wrapping_add(1);
        let header = FrameHeader {
            kind: 0,
            seq: self.sequence,
            ts_ns: wall_clock_ns(),
            symbol_id: 0,
        };
        encode_heartbeat(&header, out)
    }
}

#[inline]
fn round2(x: f64) -> f64 {
    (x * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use ferrite_wire::{
        checksum, frame_bytes_for, view_header, view_quote, view_trade, FrameKind,
        MAX_FRAME_BYTES,
    };

    fn decode_kind(buf: &[u8]) -> FrameKind {
        let header = unsafe { view_header(buf) };
        FrameKind::from_u16({ header.kind }).expect("generated frame has valid kind")
    }

    #[test]
    fn ticks_are_wellformed_frames() {
        let mut src = TickSource::with_seed(10, 42);
        let mut buf = [0u8; MAX_FRAME_BYTES];

        for _ in 0..1000 {
            let (len, symbol_id) = src.emit_tick(&mut buf);
            assert!((symbol_id as usize) < 10);

            let header = unsafe { view_header(&buf) };
            assert_eq!(frame_bytes_for({ header.kind }), len);
            assert_eq!({ header.symbol_id }, symbol_id);
            // Trailing checksum validates.
            let stored = u32::from_le_bytes(buf[len - 4..len].try_into().unwrap());
            assert_eq!(stored, checksum(&buf[..len - 4]));
        }
    }

    #[test]
    fn sequence_is_contiguous_without_faults() {
        let mut src = TickSource::with_seed(5, 7);
        let mut buf = [0u8; MAX_FRAME_BYTES];
        for expected in 1..=500u32 {
            src.emit_tick(&mut buf);
            let header = unsafe { view_header(&buf) };
            assert_eq!({ header.seq }, expected);
        }
    }

    #[test]
    fn fault_injection_burns_sequence_numbers() {
        let mut src = TickSource::with_seed(5, 7);
        src.set_fault_injection(true);
        let mut buf = [0u8; MAX_FRAME_BYTES];

        let mut gaps = 0;
        let mut last_seq = 0u32;
        for _ in 0..1000 {
            src.emit_tick(&mut buf);
            let seq = {
                let header = unsafe { view_header(&buf) };
                header.seq
            };
            if last_seq != 0 && seq != last_seq + 1 {
                assert_eq!(seq, last_seq + 2, "fault gap should skip exactly one");
                gaps += 1;
            }
            last_seq = seq;
        }
        assert_eq!(gaps, 10, "one gap per {FAULT_PERIOD} ticks");
    }

    #[test]
    fn trade_ratio_is_roughly_thirty_percent() {
        let mut src = TickSource::with_seed(20, 99);
        let mut buf = [0u8; MAX_FRAME_BYTES];
        let mut trades = 0;
        const N: usize = 10_000;
        for _ in 0..N {
            src.emit_tick(&mut buf);
            if decode_kind(&buf) == FrameKind::Trade {
                trades += 1;
            }
        }
        let ratio = trades as f64 / N as f64;
        assert!(
            (0.25..0.35).contains(&ratio),
            "trade ratio {ratio} out of tolerance"
        );
    }

    #[test]
    fn quotes_have_positive_spread_and_floored_qty() {
        let mut src = TickSource::with_seed(3, 5);
        let mut buf = [0u8; MAX_FRAME_BYTES];
        for _ in 0..2000 {
            src.emit_tick(&mut buf);
            if decode_kind(&buf) == FrameKind::Quote {
                let frame = unsafe { view_quote(&buf) };
                let bid = { frame.payload.bid_px };
                let ask = { frame.payload.ask_px };
                assert!(ask > bid, "crossed quote: bid={bid} ask={ask}");
                assert!({ frame.payload.bid_qty } >= 100);
                assert!({ frame.payload.ask_qty } >= 100);
            }
        }
    }

    #[test]
    fn prices_stay_in_bounds_under_bearish_drift() {
        let mut src = TickSource::with_seed(2, 11);
        src.set_market(MarketCondition::Bearish);
        let mut buf = [0u8; MAX_FRAME_BYTES];
        for _ in 0..20_000 {
            src.emit_tick(&mut buf);
            if decode_kind(&buf) == FrameKind::Trade {
                let frame = unsafe { view_trade(&buf) };
                let price = { frame.payload.price };
                assert!(price >= PRICE_FLOOR - 0.5 && price <= PRICE_CEIL + 0.5);
            }
        }
    }

    #[test]
    fn heartbeat_advances_sequence() {
        let mut src = TickSource::with_seed(1, 1);
        let mut buf = [0u8; MAX_FRAME_BYTES];
        let (_, _) = src.emit_tick(&mut buf);
        let len = src.emit_heartbeat(&mut buf);
        assert_eq!(len, ferrite_wire::HEARTBEAT_FRAME_BYTES);
        let header = unsafe { view_header(&buf) };
        assert_eq!({ header.kind }, FrameKind::Heartbeat as u16);
        assert_eq!({ header.seq }, 2);
    }

    #[test]
    fn market_condition_parsing() {
        assert_eq!(
            "bull".parse::<MarketCondition>().unwrap(),
            MarketCondition::Bullish
        );
        assert_eq!(
            "BEARISH".parse::<MarketCondition>().unwrap(),
            MarketCondition::Bearish
        );
        assert_eq!(
            "neutral".parse::<MarketCondition>().unwrap(),
            MarketCondition::Neutral
        );
        assert!("sideways".parse::<MarketCondition>().is_err());
    }

    #[test]
    fn reset_restarts_the_session() {
        let mut src = TickSource::with_seed(4, 3);
        let mut buf = [0u8; MAX_FRAME_BYTES];
        for _ in 0..10 {
            src.emit_tick(&mut buf);
        }
        assert_eq!(src.sequence(), 10);
        src.reset();
        assert_eq!(src.sequence(), 0);
        src.emit_tick(&mut buf);
        let header = unsafe { view_header(&buf) };
        assert_eq!({ header.seq }, 1);
    }
}
