//! TLS session operations
//!
//! This module implements the SessionOps trait for TLS connections,
//! enabling transparent switching between plain TCP and TLS I/O.

use super::config::{TlsConfig, TlsError};
use crate::http::session::{poll_fd, socket_is_alive, PollEvents, SessionOps};
use crate::http::{Error, Result as HttpResult};
use openssl::ssl::{ErrorCode, HandshakeError, MidHandshakeSslStream, Ssl, SslStream};
use std::io::{self, Read, Write};
use std::net::{IpAddr, Shutdown, TcpStream};
use std::os::fd::{AsRawFd, RawFd};
use std::time::Duration;

/// TLS session operations
///
/// Implements SessionOps trait for TLS-encrypted connections.
/// Wraps an OpenSSL SslStream over a non-blocking socket.
pub struct TlsSessionOps {
    stream: SslStream<TcpStream>,
    failed: bool,
}

/// Outcome of one handshake step
pub enum Handshake {
    Done(TlsSessionOps),
    Pending(TlsHandshake),
}

/// Client handshake parked until the socket is ready again
pub struct TlsHandshake {
    mid: MidHandshakeSslStream<TcpStream>,
    host: String,
}

impl TlsHandshake {
    /// Readiness OpenSSL is waiting for
    pub fn interest(&self) -> PollEvents {
        match self.mid.error().code() {
            ErrorCode::WANT_WRITE => PollEvents::Write,
            _ => PollEvents::Read,
        }
    }

    pub fn raw_fd(&self) -> RawFd {
        self.mid.get_ref().as_raw_fd()
    }

    /// Continue the handshake after the socket became ready
    pub fn resume(self) -> std::result::Result<Handshake, TlsError> {
        let TlsHandshake { mid, host } = self;
        step(mid.handshake(), host)
    }
}

fn step(
    result: std::result::Result<SslStream<TcpStream>, HandshakeError<TcpStream>>,
    host: String,
) -> std::result::Result<Handshake, TlsError> {
    match result {
        Ok(stream) => {
            log::debug!(
                "TLS session with {} using {}",
                host,
                stream.ssl().version_str()
            );
            Ok(Handshake::Done(TlsSessionOps {
                stream,
                failed: false,
            }))
        }
        Err(HandshakeError::WouldBlock(mid)) => {
            Ok(Handshake::Pending(TlsHandshake { mid, host }))
        }
        Err(HandshakeError::Failure(mid)) => {
            Err(TlsError::HandshakeFailed(mid.error().to_string()))
        }
        Err(HandshakeError::SetupFailure(stack)) => Err(TlsError::OpenSsl(stack)),
    }
}

impl TlsSessionOps {
    /// Start a client handshake on a connected socket
    ///
    /// The socket is switched to non-blocking mode, so the first step
    /// usually comes back as [`Handshake::Pending`].
    pub fn handshake(
        tcp_stream: TcpStream,
        config: &TlsConfig,
        host: &str,
    ) -> std::result::Result<Handshake, TlsError> {
        tcp_stream.set_nonblocking(true)?;

        let mut ssl = Ssl::new(&config.ctx)?;

        let ip: Option<IpAddr> = host.trim_matches(|c| c == '[' || c == ']').parse().ok();
        let servername = config.servername.as_deref().unwrap_or(host);
        if ip.is_none() || config.servername.is_some() {
            ssl.set_hostname(servername)?;
        }

        if config.verify_peer {
            let param = ssl.param_mut();
            match ip {
                Some(ip) => param.set_ip(ip)?,
                None => param.set_host(servername)?,
            }
        }

        step(ssl.connect(tcp_stream), host.to_string())
    }

    /// Negotiated protocol version, e.g. `TLSv1.3`
    pub fn version(&self) -> &'static str {
        self.stream.ssl().version_str()
    }

    /// Check if TLS failed
    pub fn failed(&self) -> bool {
        self.failed
    }

    /// Get reference to underlying TCP stream
    pub fn get_ref(&self) -> &TcpStream {
        self.stream.get_ref()
    }

    fn track(&mut self, result: io::Result<usize>) -> io::Result<usize> {
        if let Err(e) = &result {
            if !matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted) {
                self.failed = true;
            }
        }
        result
    }
}

impl Read for TlsSessionOps {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let result = self.stream.read(buf);
        self.track(result)
    }
}

impl Write for TlsSessionOps {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let result = self.stream.write(buf);
        self.track(result)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.stream.flush()
    }
}

impl SessionOps for TlsSessionOps {
    fn poll(&self, events: PollEvents, timeout: Option<Duration>) -> HttpResult<bool> {
        // Decrypted bytes already buffered in the SSL object are invisible
        // to poll(2)
        if events != PollEvents::Write && self.has_buffered_data() {
            return Ok(true);
        }
        poll_fd(self.raw_fd(), events, timeout)
    }

    fn raw_fd(&self) -> RawFd {
        self.stream.get_ref().as_raw_fd()
    }

    fn has_buffered_data(&self) -> bool {
        self.stream.ssl().pending() > 0
    }

    fn is_alive(&self) -> bool {
        !self.failed && !self.has_buffered_data() && socket_is_alive(self.stream.get_ref())
    }

    fn close(&mut self) -> HttpResult<()> {
        if !self.failed {
            let _ = self.stream.shutdown();
        }

        match self.stream.get_ref().shutdown(Shutdown::Both) {
            Err(e) if e.kind() != io::ErrorKind::NotConnected => Err(Error::from(e)),
            _ => Ok(()),
        }
    }
}
