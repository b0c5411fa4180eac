//! Feed-side TCP session: connect with a deadline, non-blocking drain,
//! reconnect with exponential backoff.

use ferrite_reactor::{Reactor, ReadyEvent};
use ferrite_wire::SUBSCRIBE_CMD;
use std::io::{self, Write};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::os::unix::io::{AsRawFd, RawFd};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Requested kernel receive buffer.
pub const RECV_BUF_BYTES: usize = 4 * 1024 * 1024;
/// Reconnect attempts before the session is declared dead.
pub const MAX_RECONNECT_ATTEMPTS: u32 = 5;

const INITIAL_BACKOFF_MS: u64 = 100;
const MAX_BACKOFF_MS: u64 = 30_000;

#[derive(Debug, thiserror::Error)]
pub enum FeedError {
    #[error("failed to resolve {host}:{port}")]
    Resolve {
        host: String,
        port: u16,
        #[source]
        source: io::Error,
    },

    #[error("failed to connect to {host}:{port}")]
    Connect {
        host: String,
        port: u16,
        #[source]
        source: io::Error,
    },

    #[error("event reactor failure")]
    Reactor(#[source] io::Error),

    #[error("connection closed by peer")]
    ConnectionClosed,

    #[error("socket error")]
    Io(#[source] io::Error),

    #[error("gave up after {0} reconnect attempts")]
    MaxRetries(u32),
}

/// What a bounded wait on the session produced.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Readiness {
    Timeout,
    Readable,
    /// Error or hangup reported by the kernel; reconnect or bail.
    Closed,
}

/// One persistent outbound TCP session and its readiness registration.
#[derive(Debug)]
pub struct FeedSocket {
    stream: Option<TcpStream>,
    reactor: Reactor,
    host: String,
    port: u16,
    connect_timeout: Duration,
    reconnect_attempts: u32,
    backoff_ms: u64,
    bytes_received: u64,
    events: Vec<ReadyEvent>,
}

impl FeedSocket {
    /// Resolve, connect within the timeout, and register for readiness.
    pub fn connect(host: &str, port: u16, timeout_ms: u32) -> Result<Self, FeedError> {
        let reactor = Reactor::new().map_err(FeedError::Reactor)?;
        let mut socket = Self {
            stream: None,
            reactor,
            host: host.to_string(),
            port,
            connect_timeout: Duration::from_millis(timeout_ms as u64),
            reconnect_attempts: 0,
            backoff_ms: INITIAL_BACKOFF_MS,
            bytes_received: 0,
            events: Vec::new(),
        };
        socket.establish()?;
        Ok(socket)
    }

    fn establish(&mut self) -> Result<(), FeedError> {
        self.disconnect();

        let addrs: Vec<SocketAddr> = (self.host.as_str(), self.port)
            .to_socket_addrs()
            .map_err(|source| FeedError::Resolve {
                host: self.host.clone(),
                port: self.port,
                source,
            })?
            .collect();

        // connect_timeout polls the non-blocking connect and verifies
        // SO_ERROR on completion; try each resolved address in turn.
        let mut last_err = io::Error::new(io::ErrorKind::NotFound, "no addresses resolved");
        let mut connected = None;
        for addr in addrs {
            match TcpStream::connect_timeout(&addr, self.connect_timeout) {
                Ok(stream) => {
                    connected = Some(stream);
                    break;
                }
                Err(err) => last_err = err,
            }
        }
        let stream = connected.ok_or_else(|| FeedError::Connect {
            host: self.host.clone(),
            port: self.port,
            source: last_err,
        })?;

        stream.set_nonblocking(true).map_err(FeedError::Io)?;
        stream.set_nodelay(true).map_err(FeedError::Io)?;
        set_recv_buffer(stream.as_raw_fd(), RECV_BUF_BYTES).map_err(FeedError::Io)?;
        self.reactor
            .register_read(stream.as_raw_fd())
            .map_err(FeedError::Reactor)?;

        info!(host = %self.host, port = self.port, "feed connected");
        self.stream = Some(stream);
        Ok(())
    }

    pub fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    pub fn bytes_received(&self) -> u64 {
        self.bytes_received
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.reconnect_attempts
    }

    /// Block up to `timeout_ms` for readiness on the session.
    pub fn wait(&mut self, timeout_ms: i32) -> Result<Readiness, FeedError> {
        if self.stream.is_none() {
            return Ok(Readiness::Closed);
        }
        let mut events = std::mem::take(&mut self.events);
        let n = self
            .reactor
            .wait(&mut events, timeout_ms)
            .map_err(FeedError::Reactor)?;
        let readiness = if n == 0 {
            Readiness::Timeout
        } else if events.iter().any(|e| e.closed) && !events.iter().any(|e| e.readable) {
            Readiness::Closed
        } else {
            // Hangup with data still queued: drain first, the EOF will
            // resurface on the next recv.
            Readiness::Readable
        };
        self.events = events;
        Ok(readiness)
    }

    /// Non-blocking read into `buf`.
    ///
    /// `Ok(None)` means the socket would block (drained); `Ok(Some(n))`
    /// is a chunk. EOF and hard errors tear the session down and return
    /// the corresponding [`FeedError`].
    pub fn recv(&mut self, buf: &mut [u8]) -> Result<Option<usize>, FeedError> {
        let Some(stream) = &self.stream else {
            return Err(FeedError::ConnectionClosed);
        };
        let rc = unsafe {
            libc::recv(
                stream.as_raw_fd(),
                buf.as_mut_ptr() as *mut libc::c_void,
                buf.len(),
                libc::MSG_DONTWAIT,
            )
        };

        if rc > 0 {
            self.bytes_received += rc as u64;
            return Ok(Some(rc as usize));
        }

        if rc == 0 {
            self.disconnect();
            return Err(FeedError::ConnectionClosed);
        }

        let err = io::Error::last_os_error();
        match err.kind() {
            io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted => Ok(None),
            _ => {
                self.disconnect();
                Err(FeedError::Io(err))
            }
        }
    }

    /// Send one subscription frame: 0xFF, u16 count, count ids.
    pub fn send_subscription(&mut self, symbol_ids: &[u16]) -> Result<(), FeedError> {
        let Some(stream) = &mut self.stream else {
            return Err(FeedError::ConnectionClosed);
        };

        let mut frame = Vec::with_capacity(3 + symbol_ids.len() * 2);
        frame.push(SUBSCRIBE_CMD);
        frame.extend_from_slice(&(symbol_ids.len() as u16).to_le_bytes());
        for id in symbol_ids {
            frame.extend_from_slice(&id.to_le_bytes());
        }

        stream.write_all(&frame).map_err(FeedError::Io)?;
        debug!(count = symbol_ids.len(), "subscription sent");
        Ok(())
    }

    /// One backoff-paced reconnect attempt.
    ///
    /// Sleeps the current backoff, doubles it (capped), and tries to
    /// re-establish. Success resets both the backoff and the attempt
    /// counter; exhausting [`MAX_RECONNECT_ATTEMPTS`] is terminal.
    pub fn reconnect(&mut self) -> Result<(), FeedError> {
        if self.reconnect_attempts >= MAX_RECONNECT_ATTEMPTS {
            return Err(FeedError::MaxRetries(self.reconnect_attempts));
        }

        warn!(
            attempt = self.reconnect_attempts + 1,
            backoff_ms = self.backoff_ms,
            "reconnecting"
        );
        std::thread::sleep(Duration::from_millis(self.backoff_ms));
        self.backoff_ms = (self.backoff_ms * 2).min(MAX_BACKOFF_MS);
        self.reconnect_attempts += 1;

        match self.establish() {
            Ok(()) => {
                self.backoff_ms = INITIAL_BACKOFF_MS;
                self.reconnect_attempts = 0;
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    /// Deregister and close the current stream, if any. Idempotent; the
    /// stream drop is the single close.
    pub fn disconnect(&mut self) {
        if let Some(stream) = self.stream.take() {
            let fd: RawFd = stream.as_raw_fd();
            if let Err(err) = self.reactor.deregister(fd) {
                debug!(fd, error = %err, "deregister on disconnect failed");
            }
        }
    }
}

impl Drop for FeedSocket {
    fn drop(&mut self) {
        self.disconnect();
    }
}

fn set_recv_buffer(fd: RawFd, bytes: usize) -> io::Result<()> {
    let value = bytes as libc::c_int;
    let rc = unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_RCVBUF,
            &value as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use std::net::TcpListener;

    fn listener() -> (TcpListener, u16) {
        let l = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = l.local_addr().unwrap().port();
        (l, port)
    }

    #[test]
    fn connects_and_reports_state() {
        let (l, port) = listener();
        let socket = FeedSocket::connect("127.0.0.1", port, 1000).unwrap();
        assert!(socket.is_connected());
        let _ = l.accept().unwrap();
        drop(socket);
    }

    #[test]
    fn connect_to_closed_port_fails() {
        let (l, port) = listener();
        drop(l);
        let err = FeedSocket::connect("127.0.0.1", port, 500).unwrap_err();
        assert!(matches!(err, FeedError::Connect { .. }));
    }

    #[test]
    fn resolve_failure_is_distinct() {
        let err = FeedSocket::connect("no.such.host.invalid", 9876, 500).unwrap_err();
        assert!(matches!(err, FeedError::Resolve { .. }));
    }

    #[test]
    fn recv_drains_then_would_blocks() {
        let (l, port) = listener();
        let mut socket = FeedSocket::connect("127.0.0.1", port, 1000).unwrap();
        let (mut server, _) = l.accept().unwrap();

        server.write_all(b"hello feed").unwrap();
        assert_eq!(socket.wait(1000).unwrap(), Readiness::Readable);

        let mut buf = [0u8; 64];
        let n = socket.recv(&mut buf).unwrap().unwrap();
        assert_eq!(&buf[..n], b"hello feed");
        assert_eq!(socket.bytes_received(), 10);
        // Drained: next recv would block.
        assert!(socket.recv(&mut buf).unwrap().is_none());
    }

    #[test]
    fn peer_close_surfaces_as_connection_closed() {
        let (l, port) = listener();
        let mut socket = FeedSocket::connect("127.0.0.1", port, 1000).unwrap();
        let (server, _) = l.accept().unwrap();
        drop(server);

        // Drain until the EOF shows up.
        let mut buf = [0u8; 64];
        let err = loop {
            let _ = socket.wait(1000).unwrap();
            match socket.recv(&mut buf) {
                Ok(Some(_)) => continue,
                Ok(None) => continue,
                Err(err) => break err,
            }
        };
        assert!(matches!(err, FeedError::ConnectionClosed));
        assert!(!socket.is_connected());
    }

    #[test]
    fn subscription_frame_layout() {
        let (l, port) = listener();
        let mut socket = FeedSocket::connect("127.0.0.1", port, 1000).unwrap();
        let (mut server, _) = l.accept().unwrap();

        socket.send_subscription(&[1, 0x0203]).unwrap();

        let mut buf = [0u8; 16];
        let n = server.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], &[0xFF, 2, 0, 1, 0, 0x03, 0x02]);
    }

    #[test]
    fn reconnect_backs_off_and_gives_up() {
        let (l, port) = listener();
        let mut socket = FeedSocket::connect("127.0.0.1", port, 200).unwrap();
        let _ = l.accept().unwrap();
        drop(l);
        socket.disconnect();

        let start = std::time::Instant::now();
        let mut outcome = Ok(());
        for _ in 0..MAX_RECONNECT_ATTEMPTS + 1 {
            outcome = socket.reconnect();
            match &outcome {
                Err(FeedError::MaxRetries(_)) => break,
                _ => {}
            }
        }
        assert!(matches!(outcome, Err(FeedError::MaxRetries(n)) if n == MAX_RECONNECT_ATTEMPTS));
        // Backoff 100+200+400+800+1600 ms before the terminal attempt.
        assert!(start.elapsed() >= Duration::from_millis(3100 - 200));
    }

    #[test]
    fn reconnect_succeeds_when_server_returns() {
        let (l, port) = listener();
        let mut socket = FeedSocket::connect("127.0.0.1", port, 1000).unwrap();
        let _ = l.accept().unwrap();
        socket.disconnect();
        assert!(!socket.is_connected());

        // Server is still listening on the same port.
        socket.reconnect().unwrap();
        assert!(socket.is_connected());
        assert_eq!(socket.reconnect_attempts(), 0, "success resets the counter");
        let _ = l.accept().unwrap();
    }
}
