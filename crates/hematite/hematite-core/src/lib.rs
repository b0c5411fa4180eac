//! `hematite-core`: stream reassembly and the feed-side socket.
//!
//! [`FrameAssembler`] turns arbitrary byte chunks back into validated
//! frames; [`FeedSocket`] owns the TCP session, its readiness
//! registration, and the reconnect backoff policy.

pub mod assembler;
pub mod socket;

pub use assembler::{AssemblerStats, FrameAssembler, FrameSink, ParseOutcome};
pub use socket::{FeedError, FeedSocket, Readiness, MAX_RECONNECT_ATTEMPTS, RECV_BUF_BYTES};
