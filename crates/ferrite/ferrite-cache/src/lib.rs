//! `ferrite-cache`: lock-free per-symbol market snapshot cache.
//!
//! One writer (the feed thread) and any number of readers (presentation,
//! exporters) share a fixed array of per-symbol entries. Each entry is
//! guarded by a sequence counter — the seqlock protocol:
//!
//! **Writer:**
//! 1. Store `seq + 1` with Release (odd: write in progress)
//! 2. Publish the payload fields
//! 3. Store `seq + 2` with Release (even: stable)
//!
//! **Reader:**
//! 1. Load seq with Acquire; if odd, spin
//! 2. Copy the payload
//! 3. Load seq again; if it moved, the copy may be torn — retry
//!
//! Readers never block the writer and the writer never waits. The payload
//! is plain scalars (`Copy`, no pointers), so a torn copy is merely
//! discarded, never dereferenced.

mod market_state;
mod symbol_cache;

pub use market_state::MarketState;
pub use symbol_cache::{SymbolCache, MAX_CACHE_SYMBOLS};
