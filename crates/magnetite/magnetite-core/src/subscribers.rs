//! Accepted-connection table and the non-blocking broadcast path.
//!
//! Backpressure is delegated entirely to the kernel: before every send
//! the table reads the socket's outbound queue depth and skips peers
//! whose queue is past the high-water mark. A skipped peer stays marked
//! slow — and keeps missing frames, no backfill — until a later send both
//! completes in full and observes the queue drained below the low-water
//! mark. Fast consumers never wait for slow ones.

use std::collections::{HashMap, HashSet};
use std::io;
use std::net::{SocketAddr, TcpStream};
use std::os::unix::io::{AsRawFd, RawFd};
use std::time::Instant;
use tracing::{debug, warn};

/// Kernel send-queue depth that marks a subscriber slow.
pub const SLOW_HIGH_BYTES: usize = 1 << 20;
/// Queue depth below which a completed send clears the slow flag.
pub const SLOW_LOW_BYTES: usize = SLOW_HIGH_BYTES / 2;
/// Requested kernel send buffer per subscriber socket.
pub const SEND_BUF_BYTES: usize = 4 << 20;

#[cfg(target_os = "linux")]
const SEND_FLAGS: libc::c_int = libc::MSG_NOSIGNAL;
#[cfg(not(target_os = "linux"))]
const SEND_FLAGS: libc::c_int = 0;

/// State for one accepted connection.
///
/// The `TcpStream` is the sole owner of the descriptor, so dropping the
/// entry closes the socket exactly once on every removal path.
pub struct Subscriber {
    stream: TcpStream,
    pub peer: String,
    symbols: HashSet<u16>,
    pub subscribe_all: bool,
    /// Sticky slow-consumer flag; see module docs for the hysteresis.
    pub is_slow: bool,
    pub slow_transitions: u64,
    pub messages_sent: u64,
    pub bytes_sent: u64,
    pub connected_at: Instant,
    pub last_activity: Instant,
}

impl Subscriber {
    pub fn wants(&self, symbol_id: u16) -> bool {
        self.subscribe_all || self.symbols.contains(&symbol_id)
    }
}

enum SendOutcome {
    /// Whole frame handed to the kernel.
    Sent,
    /// Skipped or partially written; peer marked slow.
    Backpressured,
    /// Connection-level failure; caller should detach.
    Disconnected,
}

/// Map of socket handle to subscriber state, plus aggregate counters.
#[derive(Default)]
pub struct SubscriberTable {
    subscribers: HashMap<RawFd, Subscriber>,
    pub total_messages_sent: u64,
    pub total_bytes_sent: u64,
}

impl SubscriberTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.subscribers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscribers.is_empty()
    }

    pub fn get(&self, fd: RawFd) -> Option<&Subscriber> {
        self.subscribers.get(&fd)
    }

    pub fn fds(&self) -> Vec<RawFd> {
        self.subscribers.keys().copied().collect()
    }

    pub fn slow_fds(&self) -> Vec<RawFd> {
        self.subscribers
            .iter()
            .filter(|(_, s)| s.is_slow)
            .map(|(fd, _)| *fd)
            .collect()
    }

    /// Take ownership of a freshly accepted stream.
    ///
    /// Configures the socket for the broadcast path (non-blocking, Nagle
    /// off, large send buffer) and starts the peer on subscribe-all.
    pub fn attach(&mut self, stream: TcpStream, peer: SocketAddr) -> io::Result<RawFd> {
        stream.set_nonblocking(true)?;
        stream.set_nodelay(true)?;
        let fd = stream.as_raw_fd();
        set_send_buffer(fd, SEND_BUF_BYTES)?;
        #[cfg(not(target_os = "linux"))]
        set_nosigpipe(fd)?;

        let now = Instant::now();
        let entry = Subscriber {
            stream,
            peer: peer.to_string(),
            symbols: HashSet::new(),
            subscribe_all: true,
            is_slow: false,
            slow_transitions: 0,
            messages_sent: 0,
            bytes_sent: 0,
            connected_at: now,
            last_activity: now,
        };
        debug!(fd, peer = %entry.peer, "subscriber attached");
        self.subscribers.insert(fd, entry);
        Ok(fd)
    }

    /// Remove a subscriber; dropping its stream closes the socket.
    pub fn detach(&mut self, fd: RawFd, reason: &str) {
        if let Some(entry) = self.subscribers.remove(&fd) {
            debug!(
                fd,
                peer = %entry.peer,
                reason,
                messages = entry.messages_sent,
                bytes = entry.bytes_sent,
                "subscriber detached"
            );
        }
    }

    /// Replace a subscriber's symbol filter. An empty list means all
    /// symbols.
    pub fn set_subscription(&mut self, fd: RawFd, symbol_ids: &[u16]) -> bool {
        let Some(entry) = self.subscribers.get_mut(&fd) else {
            return false;
        };
        entry.symbols.clear();
        entry.subscribe_all = symbol_ids.is_empty();
        entry.symbols.extend(symbol_ids.iter().copied());
        debug!(
            fd,
            peer = %entry.peer,
            count = symbol_ids.len(),
            all = entry.subscribe_all,
            "subscription replaced"
        );
        true
    }

    /// Fan one frame out to every eligible subscriber.
    ///
    /// Never blocks: slow peers are skipped outright, backpressured sends
    /// mark the peer slow, and connection-resetting failures are reported
    /// through `dropped` for the event loop to detach. Returns how many
    /// peers received the full frame.
    pub fn broadcast(&mut self, frame: &[u8], symbol_id: u16, dropped: &mut Vec<RawFd>) -> usize {
        let mut delivered = 0usize;

        for (&fd, entry) in self.subscribers.iter_mut() {
            if entry.is_slow || !entry.wants(symbol_id) {
                continue;
            }
            match send_one(entry, frame) {
                SendOutcome::Sent => delivered += 1,
                SendOutcome::Backpressured => {}
                SendOutcome::Disconnected => dropped.push(fd),
            }
        }

        self.total_messages_sent += delivered as u64;
        self.total_bytes_sent += (delivered * frame.len()) as u64;
        delivered
    }

    /// Send a frame to every subscriber regardless of its symbol filter
    /// or slow flag — the liveness path (heartbeats).
    pub fn send_to_all(&mut self, frame: &[u8], dropped: &mut Vec<RawFd>) -> usize {
        let mut delivered = 0usize;
        for (&fd, entry) in self.subscribers.iter_mut() {
            match send_one(entry, frame) {
                SendOutcome::Sent => delivered += 1,
                SendOutcome::Backpressured => {}
                SendOutcome::Disconnected => dropped.push(fd),
            }
        }
        self.total_messages_sent += delivered as u64;
        self.total_bytes_sent += (delivered * frame.len()) as u64;
        delivered
    }
}

/// One non-blocking send attempt with slow-consumer hysteresis.
fn send_one(entry: &mut Subscriber, frame: &[u8]) -> SendOutcome {
    let fd = entry.stream.as_raw_fd();

    let pending = send_queue_depth(fd);
    if pending > SLOW_HIGH_BYTES {
        mark_slow(entry);
        return SendOutcome::Backpressured;
    }

    let rc = unsafe {
        libc::send(
            fd,
            frame.as_ptr() as *const libc::c_void,
            frame.len(),
            SEND_FLAGS,
        )
    };

    if rc < 0 {
        let err = io::Error::last_os_error();
        return match err.kind() {
            io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted => {
                mark_slow(entry);
                SendOutcome::Backpressured
            }
            _ => {
                warn!(fd, peer = %entry.peer, error = %err, "send failed");
                SendOutcome::Disconnected
            }
        };
    }

    if (rc as usize) < frame.len() {
        // A partial frame is already on the wire; the peer's stream stays
        // valid but the peer is clearly not draining.
        mark_slow(entry);
        entry.bytes_sent += rc as u64;
        return SendOutcome::Backpressured;
    }

    entry.messages_sent += 1;
    entry.bytes_sent += frame.len() as u64;
    entry.last_activity = Instant::now();

    if entry.is_slow && pending < SLOW_LOW_BYTES {
        entry.is_slow = false;
        debug!(fd, peer = %entry.peer, "subscriber recovered from slow state");
    }

    SendOutcome::Sent
}

fn mark_slow(entry: &mut Subscriber) {
    if !entry.is_slow {
        entry.is_slow = true;
        entry.slow_transitions += 1;
        warn!(
            peer = %entry.peer,
            transitions = entry.slow_transitions,
            "subscriber marked slow"
        );
    }
}

/// Bytes currently queued in the kernel's outbound buffer for `fd`.
#[cfg(target_os = "linux")]
fn send_queue_depth(fd: RawFd) -> usize {
    let mut pending: libc::c_int = 0;
    let rc = unsafe { libc::ioctl(fd, libc::TIOCOUTQ, &mut pending) };
    if rc < 0 {
        0
    } else {
        pending.max(0) as usize
    }
}

/// Bytes currently queued in the kernel's outbound buffer for `fd`.
#[cfg(not(target_os = "linux"))]
fn send_queue_depth(fd: RawFd) -> usize {
    let mut pending: libc::c_int = 0;
    let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
    let rc = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_NWRITE,
            &mut pending as *mut _ as *mut libc::c_void,
            &mut len,
        )
    };
    if rc < 0 {
        0
    } else {
        pending.max(0) as usize
    }
}

fn set_send_buffer(fd: RawFd, bytes: usize) -> io::Result<()> {
    let value = bytes as libc::c_int;
    let rc = unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_SNDBUF,
            &value as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn set_nosigpipe(fd: RawFd) -> io::Result<()> {
    let value: libc::c_int = 1;
    let rc = unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_NOSIGPIPE,
            &value as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}
