use crate::market_state::MarketState;
use std::cell::UnsafeCell;
use std::ptr;
use std::sync::atomic::{fence, AtomicU64, Ordering};

/// Hard upper bound on cache entries; matches the feed's symbol id space.
pub const MAX_CACHE_SYMBOLS: usize = 500;

/// One symbol slot: sequence counter plus payload, padded onto its own
/// pair of cache lines so neighbouring symbols never false-share.
#[repr(C, align(128))]
struct CacheEntry {
    /// Odd while a write is in flight, even when the payload is stable.
    sequence: AtomicU64,
    state: UnsafeCell<MarketState>,
}

impl CacheEntry {
    fn new() -> Self {
        Self {
            sequence: AtomicU64::new(0),
            state: UnsafeCell::new(MarketState::default()),
        }
    }
}

/// Single-writer, multi-reader snapshot cache indexed by symbol id.
///
/// Writer methods take `&self` so the cache can sit behind an `Arc`
/// shared with reader threads; the *caller* upholds the single-writer
/// contract (exactly one thread ever calls the `apply_*`/`reset`
/// methods). Out-of-range symbol ids are silently absorbed: writes
/// become no-ops, reads return a zeroed snapshot.
pub struct SymbolCache {
    entries: Box<[CacheEntry]>,
}

// Entries are only mutated through the seqlock protocol; readers copy,
// never alias live data.
unsafe impl Sync for SymbolCache {}
unsafe impl Send for SymbolCache {}

impl SymbolCache {
    pub fn new(num_symbols: usize) -> Self {
        let n = num_symbols.min(MAX_CACHE_SYMBOLS);
        Self {
            entries: (0..n).map(|_| CacheEntry::new()).collect(),
        }
    }

    pub fn num_symbols(&self) -> usize {
        self.entries.len()
    }

    /// Run one seqlock write cycle over an entry.
    ///
    /// The release fences pin the payload store between the odd and even
    /// sequence stores; without them the compiler or CPU could float the
    /// payload write outside the guarded window and a reader could accept
    /// a half-published state with a clean sequence check.
    #[inline]
    fn publish(&self, symbol_id: u16, mutate: impl FnOnce(&mut MarketState)) {
        let Some(entry) = self.entries.get(symbol_id as usize) else {
            return;
        };

        // Single writer: nobody else writes the payload, so a plain read
        // of our own last commit is race-free.
        let mut state = unsafe { ptr::read(entry.state.get()) };
        mutate(&mut state);

        let seq = entry.sequence.load(Ordering::Relaxed);
        entry.sequence.store(seq.wrapping_add(1), Ordering::Release);
        fence(Ordering::Release);
        unsafe { ptr::write_volatile(entry.state.get(), state) };
        fence(Ordering::Release);
        entry.sequence.store(seq.wrapping_add(2), Ordering::Release);
    }

    #[inline]
    fn stamp(state: &mut MarketState, ts_ns: u64) {
        state.last_update_ns = ts_ns;
        state.update_count += 1;
    }

    /// Apply a two-sided quote. The first priced update fixes opening_px
    /// at the quote midpoint.
    pub fn apply_quote(
        &self,
        symbol_id: u16,
        bid_px: f64,
        bid_qty: u32,
        ask_px: f64,
        ask_qty: u32,
        ts_ns: u64,
    ) {
        self.publish(symbol_id, |state| {
            state.best_bid = bid_px;
            state.bid_qty = bid_qty;
            state.best_ask = ask_px;
            state.ask_qty = ask_qty;
            if state.opening_px == 0.0 {
                state.opening_px = (bid_px + ask_px) / 2.0;
            }
            Self::stamp(state, ts_ns);
        });
    }

    /// Apply a trade print. The first priced update fixes opening_px at
    /// the trade price.
    pub fn apply_trade(&self, symbol_id: u16, price: f64, qty: u32, ts_ns: u64) {
        self.publish(symbol_id, |state| {
            state.last_px = price;
            state.last_qty = qty;
            if state.opening_px == 0.0 {
                state.opening_px = price;
            }
            Self::stamp(state, ts_ns);
        });
    }

    pub fn apply_bid(&self, symbol_id: u16, price: f64, qty: u32, ts_ns: u64) {
        self.publish(symbol_id, |state| {
            state.best_bid = price;
            state.bid_qty = qty;
            Self::stamp(state, ts_ns);
        });
    }

    pub fn apply_ask(&self, symbol_id: u16, price: f64, qty: u32, ts_ns: u64) {
        self.publish(symbol_id, |state| {
            state.best_ask = price;
            state.ask_qty = qty;
            Self::stamp(state, ts_ns);
        });
    }

    /// Lock-free consistent snapshot of one symbol.
    ///
    /// Retries while the writer is mid-commit; two identical even
    /// sequence reads bracketing the copy prove the copy was atomic with
    /// respect to writer commits.
    pub fn snapshot(&self, symbol_id: u16) -> MarketState {
        let Some(entry) = self.entries.get(symbol_id as usize) else {
            return MarketState::default();
        };

        loop {
            let s1 = entry.sequence.load(Ordering::Acquire);
            if s1 & 1 != 0 {
                std::hint::spin_loop();
                continue;
            }

            fence(Ordering::Acquire);
            let copy = unsafe { ptr::read_volatile(entry.state.get()) };
            fence(Ordering::Acquire);

            let s2 = entry.sequence.load(Ordering::Acquire);
            if s1 == s2 {
                return copy;
            }
            std::hint::spin_loop();
        }
    }

    /// Fill `out_ids`/`out_states` with the most-updated symbols, busiest
    /// first, ties going to the lower symbol id. The winners are
    /// re-snapshotted after selection so the returned rows are as fresh
    /// as one extra read can make them. Unused tail slots are zeroed.
    pub fn top_by_activity(&self, out_ids: &mut [u16], out_states: &mut [MarketState]) {
        let want = out_ids.len().min(out_states.len());

        let mut active: Vec<(u64, u16)> = Vec::with_capacity(self.entries.len());
        for id in 0..self.entries.len() as u16 {
            let snap = self.snapshot(id);
            if snap.update_count > 0 {
                active.push((snap.update_count, id));
            }
        }
        active.sort_unstable_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));

        let filled = want.min(active.len());
        for i in 0..filled {
            let id = active[i].1;
            out_ids[i] = id;
            out_states[i] = self.snapshot(id);
        }
        for i in filled..want {
            out_ids[i] = 0;
            out_states[i] = MarketState::default();
        }
    }

    /// Sum of update counts across all symbols. Entries are snapshotted
    /// one at a time, so the total is eventually consistent, not a
    /// point-in-time figure.
    pub fn total_updates(&self) -> u64 {
        (0..self.entries.len() as u16)
            .map(|id| self.snapshot(id).update_count)
            .sum()
    }

    /// Zero every entry and its sequence counter.
    ///
    /// Writer-side, quiescent only: concurrent readers may observe the
    /// sequence move backwards and must not assume monotonicity across a
    /// reset.
    pub fn reset(&self) {
        for entry in self.entries.iter() {
            entry.sequence.store(1, Ordering::Release);
            fence(Ordering::Release);
            unsafe { ptr::write_volatile(entry.state.get(), MarketState::default()) };
            fence(Ordering::Release);
            entry.sequence.store(0, Ordering::Release);
        }
    }
}
