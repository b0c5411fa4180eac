//! `magnetite-core`: the publisher's moving parts.
//!
//! [`TickSource`] turns a stochastic price model into serialized wire
//! frames; [`SubscriberTable`] owns the accepted connections and fans
//! frames out to them without ever blocking on a slow peer.

pub mod subscribers;
pub mod tick_source;

pub use subscribers::{SubscriberTable, SEND_BUF_BYTES, SLOW_HIGH_BYTES, SLOW_LOW_BYTES};
pub use tick_source::{MarketCondition, TickSource};
