//! Session operations abstraction
//!
//! This module provides the session operations pattern that allows
//! transparent switching between plain TCP and TLS connections.
//!
//! Sessions are byte streams (`Read + Write`) over a non-blocking socket.
//! Reads and writes return `WouldBlock` instead of waiting; callers wait for
//! readiness with [`SessionOps::poll`] or through the reactor, which polls
//! the descriptor from [`SessionOps::raw_fd`].

use super::{Error, Result};
use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::os::fd::{AsRawFd, RawFd};
use std::time::Duration;

/// Session operations trait
///
/// This trait defines the operations that can be performed on a session,
/// abstracting over plain TCP and TLS connections.
pub trait SessionOps: Read + Write + Send {
    /// Poll the session for events
    ///
    /// Returns true if the session is ready for the requested operation
    fn poll(&self, events: PollEvents, timeout: Option<Duration>) -> Result<bool>;

    /// Descriptor to register with a readiness poller
    fn raw_fd(&self) -> RawFd;

    /// Whether decrypted bytes are waiting that a descriptor poll cannot see
    fn has_buffered_data(&self) -> bool {
        false
    }

    /// Cheap check that an idle session was not closed by the peer
    fn is_alive(&self) -> bool;

    /// Close the session
    fn close(&mut self) -> Result<()>;
}

/// Poll events
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollEvents {
    Read,
    Write,
    Both,
}

impl PollEvents {
    pub(crate) fn as_poll_flags(self) -> libc::c_short {
        match self {
            PollEvents::Read => libc::POLLIN,
            PollEvents::Write => libc::POLLOUT,
            PollEvents::Both => libc::POLLIN | libc::POLLOUT,
        }
    }
}

/// Convert an optional timeout to poll(2) milliseconds, -1 meaning forever
pub(crate) fn timeout_millis(timeout: Option<Duration>) -> libc::c_int {
    match timeout {
        Some(d) => {
            let ms = d.as_millis().min(libc::c_int::MAX as u128) as libc::c_int;
            // round sub-millisecond waits up so they do not spin
            if ms == 0 && !d.is_zero() {
                1
            } else {
                ms
            }
        }
        None => -1,
    }
}

/// Wait for readiness on a single descriptor
pub fn poll_fd(fd: RawFd, events: PollEvents, timeout: Option<Duration>) -> Result<bool> {
    let mut pfd = libc::pollfd {
        fd,
        events: events.as_poll_flags(),
        revents: 0,
    };

    loop {
        let result =
            unsafe { libc::poll(&mut pfd as *mut libc::pollfd, 1, timeout_millis(timeout)) };

        if result < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(Error::Io(err));
        }

        return Ok(result > 0);
    }
}

/// Liveness check for an idle TCP socket
///
/// An idle keep-alive connection must have nothing to read. Readable means
/// either the peer closed it or it sent bytes nobody asked for; both make
/// the connection unusable.
pub(crate) fn socket_is_alive(stream: &TcpStream) -> bool {
    match poll_fd(stream.as_raw_fd(), PollEvents::Read, Some(Duration::ZERO)) {
        Ok(false) => true,
        Ok(true) => {
            let mut peek = [0u8; 1];
            match stream.peek(&mut peek) {
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => true,
                _ => false,
            }
        }
        Err(_) => false,
    }
}

/// Plain file descriptor session operations
pub struct FdSessionOps {
    stream: TcpStream,
}

impl FdSessionOps {
    /// Create a new FD session operations from a connected TCP stream
    ///
    /// The stream is switched to non-blocking mode.
    pub fn new(stream: TcpStream) -> Result<Self> {
        stream.set_nonblocking(true)?;
        stream.set_nodelay(true)?;
        Ok(FdSessionOps { stream })
    }

    /// Get a reference to the underlying stream
    pub fn stream(&self) -> &TcpStream {
        &self.stream
    }
}

impl Read for FdSessionOps {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.stream.read(buf)
    }
}

impl Write for FdSessionOps {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.stream.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.stream.flush()
    }
}

impl SessionOps for FdSessionOps {
    fn poll(&self, events: PollEvents, timeout: Option<Duration>) -> Result<bool> {
        poll_fd(self.stream.as_raw_fd(), events, timeout)
    }

    fn raw_fd(&self) -> RawFd {
        self.stream.as_raw_fd()
    }

    fn is_alive(&self) -> bool {
        socket_is_alive(&self.stream)
    }

    fn close(&mut self) -> Result<()> {
        match self.stream.shutdown(Shutdown::Both) {
            Err(e) if e.kind() != io::ErrorKind::NotConnected => Err(Error::from(e)),
            _ => Ok(()),
        }
    }
}
