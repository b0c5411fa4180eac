/// Live market view for one symbol.
///
/// Plain-old-data by design: the seqlock copies the whole struct in and
/// out, so every field must be a scalar that a memcpy can move without
/// synchronization. No pointers, ever.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct MarketState {
    pub best_bid: f64,
    pub best_ask: f64,
    pub bid_qty: u32,
    pub ask_qty: u32,
    pub last_px: f64,
    pub last_qty: u32,
    pub last_update_ns: u64,
    pub update_count: u64,
    /// First observed price; set once (quote midpoint or trade price) and
    /// used for session change calculations.
    pub opening_px: f64,
}

impl MarketState {
    #[inline]
    pub fn mid(&self) -> f64 {
        (self.best_bid + self.best_ask) / 2.0
    }

    /// Percent change from the opening price, 0 until one is set.
    pub fn change_pct(&self) -> f64 {
        if self.opening_px == 0.0 {
            return 0.0;
        }
        let reference = if self.last_px != 0.0 {
            self.last_px
        } else {
            self.mid()
        };
        (reference - self.opening_px) / self.opening_px * 100.0
    }
}
