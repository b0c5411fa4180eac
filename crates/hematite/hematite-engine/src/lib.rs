//! `hematite-engine`: the feed-handler event loop.
//!
//! One iteration: wait up to 100 ms for readiness, drain the socket in
//! edge-triggered discipline, feed every chunk to the assembler, and for
//! each validated frame record end-to-end latency and publish into the
//! symbol cache. Presentation threads read the cache and histogram
//! concurrently through the `Arc`s this engine hands out.

use ferrite_cache::SymbolCache;
use ferrite_latency::LatencyHistogram;
use ferrite_wire::{wall_clock_ns, HeartbeatFrame, QuoteFrame, TradeFrame, MAX_SYMBOLS};
use hematite_config::HematiteConfig;
use hematite_core::{
    AssemblerStats, FeedError, FeedSocket, FrameAssembler, FrameSink, Readiness, RECV_BUF_BYTES,
};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Ceiling on one reactor wait, bounding shutdown responsiveness.
const WAIT_TIMEOUT_MS: i32 = 100;

/// Applies validated frames to the cache and histogram.
struct CacheSink<'a> {
    cache: &'a SymbolCache,
    latency: &'a LatencyHistogram,
    heartbeats: &'a AtomicU64,
}

impl CacheSink<'_> {
    #[inline]
    fn record_latency(&self, ts_ns: u64) {
        let now = wall_clock_ns();
        // Clock skew can put the publisher stamp in our future; only
        // positive deltas are meaningful.
        if now > ts_ns {
            self.latency.record(now - ts_ns);
        }
    }
}

impl FrameSink for CacheSink<'_> {
    fn on_trade(&mut self, frame: &TradeFrame) {
        self.record_latency({ frame.header.ts_ns });
        self.cache.apply_trade(
            { frame.header.symbol_id },
            { frame.payload.price },
            { frame.payload.qty },
            { frame.header.ts_ns },
        );
    }

    fn on_quote(&mut self, frame: &QuoteFrame) {
        self.record_latency({ frame.header.ts_ns });
        self.cache.apply_quote(
            { frame.header.symbol_id },
            { frame.payload.bid_px },
            { frame.payload.bid_qty },
            { frame.payload.ask_px },
            { frame.payload.ask_qty },
            { frame.header.ts_ns },
        );
    }

    fn on_heartbeat(&mut self, frame: &HeartbeatFrame) {
        self.record_latency({ frame.header.ts_ns });
        self.heartbeats.fetch_add(1, Ordering::Relaxed);
    }

    fn on_gap(&mut self, expected: u32, received: u32) {
        debug!(expected, received, "sequence gap");
    }
}

/// Consumer engine: one socket, one assembler, one writer thread into
/// the shared cache.
pub struct HematiteEngine {
    socket: FeedSocket,
    assembler: FrameAssembler,
    cache: Arc<SymbolCache>,
    latency: Arc<LatencyHistogram>,
    heartbeats: Arc<AtomicU64>,
    recv_buf: Vec<u8>,
    running: Arc<AtomicBool>,
    config: HematiteConfig,
}

impl HematiteEngine {
    /// Connect to the feed, subscribe if configured, and assemble the
    /// engine.
    pub fn connect(config: HematiteConfig) -> Result<Self, FeedError> {
        let mut socket = FeedSocket::connect(&config.host, config.port, config.connect_timeout_ms)?;
        if !config.subscribe.is_empty() {
            socket.send_subscription(&config.subscribe)?;
        }

        Ok(Self {
            socket,
            assembler: FrameAssembler::new(),
            cache: Arc::new(SymbolCache::new(MAX_SYMBOLS)),
            latency: Arc::new(LatencyHistogram::new()),
            heartbeats: Arc::new(AtomicU64::new(0)),
            recv_buf: vec![0u8; RECV_BUF_BYTES],
            running: Arc::new(AtomicBool::new(true)),
            config,
        })
    }

    /// Shared snapshot cache; hand clones to reader threads.
    pub fn cache(&self) -> Arc<SymbolCache> {
        Arc::clone(&self.cache)
    }

    pub fn latency(&self) -> Arc<LatencyHistogram> {
        Arc::clone(&self.latency)
    }

    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.running)
    }

    pub fn stats(&self) -> AssemblerStats {
        self.assembler.stats()
    }

    pub fn heartbeats_seen(&self) -> u64 {
        self.heartbeats.load(Ordering::Relaxed)
    }

    pub fn bytes_received(&self) -> u64 {
        self.socket.bytes_received()
    }

    /// Reset session statistics (the presentation layer's 'r' key).
    pub fn reset_stats(&mut self) {
        self.assembler.reset();
        self.latency.reset();
        self.cache.reset();
        self.heartbeats.store(0, Ordering::Relaxed);
    }

    /// Run until stopped or the connection is lost beyond repair.
    pub fn run(&mut self) -> Result<(), FeedError> {
        while self.running.load(Ordering::Relaxed) {
            match self.socket.wait(WAIT_TIMEOUT_MS) {
                Ok(Readiness::Timeout) => continue,
                Ok(Readiness::Readable) => {
                    if let Err(err) = self.drain_socket() {
                        self.handle_disconnect(err)?;
                    }
                }
                Ok(Readiness::Closed) => {
                    self.handle_disconnect(FeedError::ConnectionClosed)?;
                }
                Err(err) => return Err(err),
            }
        }

        let stats = self.assembler.stats();
        info!(
            frames = stats.frames,
            gaps = stats.gaps,
            checksum_errors = stats.checksum_errors,
            heartbeats = self.heartbeats_seen(),
            "hematite stopped"
        );
        Ok(())
    }

    /// Edge-triggered drain: recv until the socket would block, feeding
    /// each chunk through the assembler.
    fn drain_socket(&mut self) -> Result<(), FeedError> {
        loop {
            match self.socket.recv(&mut self.recv_buf)? {
                Some(n) => {
                    let mut sink = CacheSink {
                        cache: &*self.cache,
                        latency: &*self.latency,
                        heartbeats: &*self.heartbeats,
                    };
                    let chunk = &self.recv_buf[..n];
                    self.assembler.ingest(chunk);
                    self.assembler.drain(&mut sink);
                }
                None => return Ok(()),
            }
        }
    }

    /// Reconnect loop per the backoff policy, replaying the subscription
    /// once the session is back.
    fn handle_disconnect(&mut self, cause: FeedError) -> Result<(), FeedError> {
        if !self.config.auto_reconnect {
            warn!(error = %cause, "connection lost, reconnect disabled");
            return Err(cause);
        }

        warn!(error = %cause, "connection lost, entering reconnect");
        loop {
            if !self.running.load(Ordering::Relaxed) {
                return Ok(());
            }
            match self.socket.reconnect() {
                Ok(()) => {
                    // New session, new sequence space.
                    self.assembler.resync();
                    if !self.config.subscribe.is_empty() {
                        self.socket.send_subscription(&self.config.subscribe)?;
                    }
                    info!("feed session re-established");
                    return Ok(());
                }
                Err(FeedError::MaxRetries(n)) => {
                    warn!(attempts = n, "reconnect exhausted");
                    return Err(FeedError::MaxRetries(n));
                }
                Err(err) => debug!(error = %err, "reconnect attempt failed"),
            }
        }
    }
}
