//! The datagram transport the event loop runs over. Kept as a narrow trait
//! so the core state machine can be driven against an in-memory fake in
//! tests instead of a real socket.

use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::os::unix::io::AsRawFd;
use std::time::Duration;

use nix::poll::{poll, PollFd, PollFlags};

use crate::error::Error;

pub trait DatagramSocket {
    /// Non-blocking receive. `Ok(None)` means nothing is available right now.
    fn try_recv(&self, buf: &mut [u8]) -> io::Result<Option<usize>>;

    fn send(&self, buf: &[u8]) -> io::Result<usize>;

    /// Blocks up to `timeout` waiting for the socket to become readable.
    /// A quality-of-implementation hint to avoid a busy spin; the event
    /// loop still performs a non-blocking `try_recv` afterwards regardless
    /// of the result. The default does nothing (used by in-memory fakes
    /// that never need to sleep).
    fn wait_readable(&self, timeout: Duration) {
        let _ = timeout;
    }
}

/// Production `DatagramSocket` over a connected, non-blocking `UdpSocket`.
pub struct UdpDatagramSocket {
    socket: UdpSocket,
}

impl UdpDatagramSocket {
    /// Binds `local` and connects to `peer`, putting the socket in
    /// non-blocking mode as required by the event loop.
    pub fn connect(local: SocketAddr, peer: SocketAddr) -> Result<Self, Error> {
        let socket = UdpSocket::bind(local)?;
        socket.connect(peer)?;
        socket.set_nonblocking(true)?;
        Ok(UdpDatagramSocket { socket })
    }

    pub fn raw(&self) -> &UdpSocket {
        &self.socket
    }
}

impl DatagramSocket for UdpDatagramSocket {
    fn try_recv(&self, buf: &mut [u8]) -> io::Result<Option<usize>> {
        match self.socket.recv(buf) {
            Ok(n) => Ok(Some(n)),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn send(&self, buf: &[u8]) -> io::Result<usize> {
        self.socket.send(buf)
    }

    fn wait_readable(&self, timeout: Duration) {
        let mut fds = [PollFd::new(self.socket.as_raw_fd(), PollFlags::POLLIN)];
        let millis = timeout.as_millis().min(i32::MAX as u128) as i32;
        let _ = poll(&mut fds, millis);
    }
}
