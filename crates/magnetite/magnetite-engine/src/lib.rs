//! `magnetite-engine`: the exchange-simulator event loop.
//!
//! Single-threaded and edge-triggered: one iteration drains readiness
//! (accepts, subscription bytes, hangups), then emits a wall-clock-paced
//! burst of ticks, then a heartbeat once a second. The only suspension
//! point is the 1 ms reactor wait; everything else runs to completion
//! without blocking.

use ferrite_pool::BlockPool;
use ferrite_reactor::{Reactor, ReadyEvent};
use ferrite_wire::{MAX_FRAME_BYTES, SUBSCRIBE_CMD};
use magnetite_config::MagnetiteConfig;
use magnetite_core::{MarketCondition, SubscriberTable, TickSource};
use std::io;
use std::net::{SocketAddr, TcpListener};
use std::os::unix::io::{AsRawFd, RawFd};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Ceiling on ticks emitted in one catch-up burst.
const MAX_TICK_BURST: u64 = 100;

/// Subscription frames larger than one pool block are nonsense anyway.
const SUB_READ_BYTES: usize = 1024;

const MIN_TICK_RATE: u32 = 1;
const MAX_TICK_RATE: u32 = 500_000;

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("failed to bind 0.0.0.0:{port}")]
    Bind {
        port: u16,
        #[source]
        source: io::Error,
    },

    #[error("failed to initialize event reactor")]
    Reactor(#[source] io::Error),

    #[error("invalid market condition: {0}")]
    Market(String),
}

/// Publisher engine: owns the listener, the reactor, the tick source and
/// the subscriber table for the lifetime of the session.
pub struct MagnetiteEngine {
    listener: TcpListener,
    listener_fd: RawFd,
    reactor: Reactor,
    ticks: TickSource,
    subscribers: SubscriberTable,
    pool: BlockPool,
    running: Arc<AtomicBool>,
    tick_rate: u32,
    // Reused scratch: readiness batch and per-broadcast casualty list.
    events: Vec<ReadyEvent>,
    dropped: Vec<RawFd>,
}

impl MagnetiteEngine {
    /// Bind the listening socket and assemble the engine.
    ///
    /// Fails fast on an unusable port or market string so the binary can
    /// exit nonzero before touching any subscriber state.
    pub fn bind(config: &MagnetiteConfig) -> Result<Self, ServerError> {
        let market: MarketCondition = config
            .market
            .parse()
            .map_err(ServerError::Market)?;

        let listener = TcpListener::bind(("0.0.0.0", config.port)).map_err(|source| {
            ServerError::Bind {
                port: config.port,
                source,
            }
        })?;
        listener
            .set_nonblocking(true)
            .map_err(|source| ServerError::Bind {
                port: config.port,
                source,
            })?;

        let reactor = Reactor::new().map_err(ServerError::Reactor)?;
        let listener_fd = listener.as_raw_fd();
        reactor
            .register_read(listener_fd)
            .map_err(ServerError::Reactor)?;

        let mut ticks = TickSource::new(config.num_symbols);
        ticks.set_market(market);
        ticks.set_fault_injection(config.fault_injection);

        let tick_rate = config.tick_rate.clamp(MIN_TICK_RATE, MAX_TICK_RATE);
        if tick_rate != config.tick_rate {
            warn!(
                requested = config.tick_rate,
                clamped = tick_rate,
                "tick rate clamped"
            );
        }

        info!(
            port = config.port,
            symbols = config.num_symbols,
            tick_rate,
            market = ?market,
            fault_injection = config.fault_injection,
            "magnetite listening"
        );

        Ok(Self {
            listener,
            listener_fd,
            reactor,
            ticks,
            subscribers: SubscriberTable::new(),
            pool: BlockPool::with_defaults(),
            running: Arc::new(AtomicBool::new(true)),
            tick_rate,
            events: Vec::new(),
            dropped: Vec::new(),
        })
    }

    /// The port actually bound — useful when the config asked for 0.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Shared flag the loop polls between iterations; flip it from a
    /// signal handler or another thread to stop cleanly.
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.running)
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    pub fn messages_sent(&self) -> u64 {
        self.subscribers.total_messages_sent
    }

    pub fn bytes_sent(&self) -> u64 {
        self.subscribers.total_bytes_sent
    }

    /// Run the loop until the stop flag flips.
    pub fn run(&mut self) {
        let tick_interval = Duration::from_nanos(1_000_000_000 / self.tick_rate as u64);
        let mut last_tick = Instant::now();
        let mut last_heartbeat = last_tick;

        while self.running.load(Ordering::Relaxed) {
            self.poll_sockets();

            let now = Instant::now();
            let elapsed = now.duration_since(last_tick);
            if elapsed >= tick_interval {
                let due = (elapsed.as_nanos() / tick_interval.as_nanos()) as u64;
                let burst = due.min(MAX_TICK_BURST);
                if !self.subscribers.is_empty() {
                    self.emit_burst(burst);
                }
                last_tick = now;
            }

            if now.duration_since(last_heartbeat) >= Duration::from_secs(1) {
                self.send_heartbeat();
                last_heartbeat = now;
            }
        }

        info!(
            messages = self.messages_sent(),
            bytes = self.bytes_sent(),
            "magnetite stopped"
        );
        let _ = self.reactor.deregister(self.listener_fd);
    }

    /// Drain one batch of readiness events.
    fn poll_sockets(&mut self) {
        let mut events = std::mem::take(&mut self.events);
        if let Err(err) = self.reactor.wait(&mut events, 1) {
            error!(error = %err, "reactor wait failed");
            self.events = events;
            return;
        }

        for i in 0..events.len() {
            let event = events[i];
            if event.fd == self.listener_fd {
                self.accept_pending();
            } else if event.closed {
                self.drop_subscriber(event.fd, "peer closed");
            } else if event.readable {
                self.read_subscription(event.fd);
            }
        }
        self.events = events;
    }

    /// Edge-triggered accept: take every pending connection.
    fn accept_pending(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    info!(%peer, "client connected");
                    match self.subscribers.attach(stream, peer) {
                        Ok(fd) => {
                            if let Err(err) = self.reactor.register_read(fd) {
                                error!(fd, error = %err, "failed to register client");
                                self.subscribers.detach(fd, "reactor registration failed");
                            }
                        }
                        Err(err) => warn!(%peer, error = %err, "failed to attach client"),
                    }
                }
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) => {
                    warn!(error = %err, "accept failed");
                    break;
                }
            }
        }
    }

    /// Try to read one complete subscription frame from a client.
    ///
    /// The protocol sends the whole frame in a single write; a frame
    /// split across reads is discarded rather than accumulated.
    fn read_subscription(&mut self, fd: RawFd) {
        let Some(block) = self.pool.alloc() else {
            warn!(fd, "buffer pool exhausted, dropping subscription read");
            return;
        };
        let buf = unsafe { block_slice(block, SUB_READ_BYTES) };

        let rc = unsafe {
            libc::recv(
                fd,
                buf.as_mut_ptr() as *mut libc::c_void,
                buf.len(),
                libc::MSG_DONTWAIT,
            )
        };

        if rc <= 0 {
            let disconnect = rc == 0 || {
                let err = io::Error::last_os_error();
                !matches!(
                    err.kind(),
                    io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
                )
            };
            unsafe { self.pool.free(block) };
            if disconnect {
                self.drop_subscriber(fd, "read failed");
            }
            return;
        }

        let n = rc as usize;
        if buf[0] == SUBSCRIBE_CMD && n >= 3 {
            let count = u16::from_le_bytes([buf[1], buf[2]]) as usize;
            if n >= 3 + count * 2 {
                let mut symbols = Vec::with_capacity(count);
                for i in 0..count {
                    let at = 3 + i * 2;
                    symbols.push(u16::from_le_bytes([buf[at], buf[at + 1]]));
                }
                self.subscribers.set_subscription(fd, &symbols);
                info!(fd, count, "client subscription updated");
            } else {
                debug!(fd, have = n, want = 3 + count * 2, "short subscription dropped");
            }
        }
        unsafe { self.pool.free(block) };
    }

    /// Generate and broadcast up to `burst` ticks.
    fn emit_burst(&mut self, burst: u64) {
        let Some(block) = self.pool.alloc() else {
            warn!("buffer pool exhausted, skipping tick burst");
            return;
        };
        let buf = unsafe { block_slice(block, MAX_FRAME_BYTES) };

        for _ in 0..burst {
            let (len, symbol_id) = self.ticks.emit_tick(buf);
            if len == 0 {
                continue;
            }
            self.dropped.clear();
            self.subscribers
                .broadcast(&buf[..len], symbol_id, &mut self.dropped);
            self.reap_dropped();
        }
        unsafe { self.pool.free(block) };
    }

    fn send_heartbeat(&mut self) {
        let Some(block) = self.pool.alloc() else {
            return;
        };
        let buf = unsafe { block_slice(block, MAX_FRAME_BYTES) };
        let len = self.ticks.emit_heartbeat(buf);
        self.dropped.clear();
        self.subscribers.send_to_all(&buf[..len], &mut self.dropped);
        self.reap_dropped();
        unsafe { self.pool.free(block) };
    }

    fn reap_dropped(&mut self) {
        while let Some(fd) = self.dropped.pop() {
            self.drop_subscriber(fd, "send error");
        }
    }

    fn drop_subscriber(&mut self, fd: RawFd, reason: &str) {
        if let Err(err) = self.reactor.deregister(fd) {
            debug!(fd, error = %err, "deregister failed");
        }
        self.subscribers.detach(fd, reason);
    }
}

/// View a pool block as a byte slice.
///
/// # Safety
/// `len` must not exceed the pool's block size and the block must stay
/// allocated for the slice's lifetime.
unsafe fn block_slice<'a>(block: NonNull<u8>, len: usize) -> &'a mut [u8] {
    std::slice::from_raw_parts_mut(block.as_ptr(), len)
}
