//! `ferrite-reactor`: edge-triggered readiness multiplexer.
//!
//! A thin facade over the kernel's readiness API — epoll on Linux, kqueue
//! on the BSDs and macOS — hiding the two event-struct shapes behind one
//! [`ReadyEvent`]. Registration is always read-interest in edge-triggered
//! mode: the kernel reports each not-ready → ready transition once, and
//! the owner must drain until `EAGAIN`.
//!
//! Peer hangups and socket errors surface as `closed` on the ready entry
//! so the owning loop can tear the connection down; they are not folded
//! into `readable`.

use std::io;
use std::os::unix::io::RawFd;

/// Largest batch of ready handles returned by one `wait` call.
pub const MAX_EVENTS: usize = 64;

/// One readiness notification.
#[derive(Clone, Copy, Debug)]
pub struct ReadyEvent {
    pub fd: RawFd,
    /// Bytes (or pending connections) are waiting to be read.
    pub readable: bool,
    /// Error or peer hangup; the handle should be detached.
    pub closed: bool,
}

#[cfg(target_os = "linux")]
mod epoll;
#[cfg(target_os = "linux")]
pub use epoll::Reactor;

#[cfg(not(target_os = "linux"))]
mod kqueue;
#[cfg(not(target_os = "linux"))]
pub use kqueue::Reactor;

/// Convert a syscall return into `io::Result`, treating EINTR during a
/// wait as an empty batch rather than an error.
pub(crate) fn wait_result(rc: libc::c_int) -> io::Result<usize> {
    if rc >= 0 {
        return Ok(rc as usize);
    }
    let err = io::Error::last_os_error();
    if err.kind() == io::ErrorKind::Interrupted {
        Ok(0)
    } else {
        Err(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::net::{TcpListener, TcpStream};
    use std::os::unix::io::AsRawFd;

    fn connected_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).unwrap();
        let (server, _) = listener.accept().unwrap();
        (client, server)
    }

    #[test]
    fn wait_times_out_with_no_events() {
        let reactor = Reactor::new().unwrap();
        let mut events = Vec::new();
        let n = reactor.wait(&mut events, 10).unwrap();
        assert_eq!(n, 0);
        assert!(events.is_empty());
    }

    #[test]
    fn readable_after_peer_write() {
        let (mut client, server) = connected_pair();
        server.set_nonblocking(true).unwrap();

        let reactor = Reactor::new().unwrap();
        reactor.register_read(server.as_raw_fd()).unwrap();

        client.write_all(b"ping").unwrap();

        let mut events = Vec::new();
        let n = reactor.wait(&mut events, 1000).unwrap();
        assert_eq!(n, 1);
        assert_eq!(events[0].fd, server.as_raw_fd());
        assert!(events[0].readable);
    }

    #[test]
    fn peer_close_is_surfaced() {
        let (client, server) = connected_pair();
        server.set_nonblocking(true).unwrap();

        let reactor = Reactor::new().unwrap();
        reactor.register_read(server.as_raw_fd()).unwrap();

        drop(client);

        let mut events = Vec::new();
        let n = reactor.wait(&mut events, 1000).unwrap();
        assert_eq!(n, 1);
        // Kernel-dependent whether EOF arrives as readable-with-zero or a
        // hangup flag; either path lets the owner detect the close.
        assert!(events[0].readable || events[0].closed);
    }

    #[test]
    fn deregistered_fd_stays_silent() {
        let (mut client, server) = connected_pair();
        server.set_nonblocking(true).unwrap();

        let reactor = Reactor::new().unwrap();
        reactor.register_read(server.as_raw_fd()).unwrap();
        reactor.deregister(server.as_raw_fd()).unwrap();

        client.write_all(b"ping").unwrap();

        let mut events = Vec::new();
        let n = reactor.wait(&mut events, 50).unwrap();
        assert_eq!(n, 0);
    }
}
