//! Transport factory
//!
//! A [`Connector`] turns an [`Authority`] into a [`PendingConnect`], a
//! connection attempt that never blocks. Each [`PendingConnect::advance`]
//! makes what progress it can and otherwise reports the readiness it waits
//! for, so the client waits on it in the same poll as every other request.
//!
//! [`TcpConnector`] goes through up to three steps: name lookup on a worker
//! thread, a non-blocking TCP connect, and a TLS handshake for `https`.
//! Name lookup goes through the [`Resolver`] collaborator so tests and
//! embedders can substitute their own.

use super::session::{FdSessionOps, PollEvents, SessionOps};
use super::tls::{Handshake, TlsConfig, TlsHandshake, TlsOptions, TlsSessionOps};
use super::{Error, Result, DEFAULT_HTTPS_PORT, DEFAULT_HTTP_PORT};
use socket2::{Domain, Protocol, SockAddr, Socket, TcpKeepalive, Type};
use std::fmt;
use std::io::{self, Write};
use std::net::{IpAddr, SocketAddr, TcpStream, ToSocketAddrs};
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::sync::mpsc::{self, Receiver, TryRecvError};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use url::Url;

/// Connection target: host, port and transport kind
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Authority {
    pub host: String,
    pub port: u16,
    pub secure: bool,
}

impl Authority {
    pub fn new(host: impl Into<String>, port: u16, secure: bool) -> Self {
        Authority {
            host: host.into().to_ascii_lowercase(),
            port,
            secure,
        }
    }

    /// Derive the authority of a URL, defaulting the port by scheme
    pub fn from_url(url: &Url) -> Result<Self> {
        let secure = match url.scheme() {
            "http" => false,
            "https" => true,
            other => return Err(Error::InvalidRequest(format!("unsupported scheme {}", other))),
        };
        let host = url
            .host_str()
            .ok_or_else(|| Error::InvalidRequest(format!("no host in {}", url)))?;
        let default_port = if secure {
            DEFAULT_HTTPS_PORT
        } else {
            DEFAULT_HTTP_PORT
        };
        Ok(Authority::new(host, url.port().unwrap_or(default_port), secure))
    }

    /// Host name as given to the resolver, without IPv6 brackets
    pub fn lookup_host(&self) -> &str {
        self.host.trim_start_matches('[').trim_end_matches(']')
    }
}

impl fmt::Display for Authority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Address family of a resolved address
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressFamily {
    Inet,
    Inet6,
}

/// Result of a successful name lookup
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedAddress {
    pub addr: IpAddr,
    pub family: AddressFamily,
}

impl From<IpAddr> for ResolvedAddress {
    fn from(addr: IpAddr) -> Self {
        let family = match addr {
            IpAddr::V4(_) => AddressFamily::Inet,
            IpAddr::V6(_) => AddressFamily::Inet6,
        };
        ResolvedAddress { addr, family }
    }
}

/// Name resolution collaborator
///
/// Returns `None` when the name does not resolve. Lookups run on a worker
/// thread and may block; IP literals never reach the resolver.
pub trait Resolver: Send + Sync {
    fn resolve(&self, name: &str) -> Option<ResolvedAddress>;
}

/// Resolver backed by the platform's `getaddrinfo`
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemResolver;

impl Resolver for SystemResolver {
    fn resolve(&self, name: &str) -> Option<ResolvedAddress> {
        if let Ok(ip) = name.parse::<IpAddr>() {
            return Some(ip.into());
        }
        match (name, 0).to_socket_addrs() {
            Ok(mut addrs) => addrs.next().map(|a| a.ip().into()),
            Err(e) => {
                log::debug!("resolving {} failed: {}", name, e);
                None
            }
        }
    }
}

impl<F> Resolver for F
where
    F: Fn(&str) -> Option<IpAddr> + Send + Sync,
{
    fn resolve(&self, name: &str) -> Option<ResolvedAddress> {
        self(name).map(ResolvedAddress::from)
    }
}

/// Per-connection transport options
#[derive(Debug, Clone, Default)]
pub struct ConnectOptions {
    pub connect_timeout: Option<Duration>,
    /// Idle time before TCP keepalive packets start
    pub keep_alive_timeout: Option<Duration>,
    pub bind_address: Option<SocketAddr>,
    pub tls_handshake_timeout: Option<Duration>,
}

/// A connection attempt in progress
pub trait PendingConnect: Send {
    /// Make whatever progress is possible without blocking
    ///
    /// Returns the session once it is usable.
    fn advance(&mut self) -> Result<Option<Box<dyn SessionOps>>>;

    /// Readiness to wait for on [`PendingConnect::raw_fd`] before the next
    /// [`PendingConnect::advance`]
    fn interest(&self) -> PollEvents;

    fn raw_fd(&self) -> RawFd;

    /// When the current step gives up
    fn deadline(&self) -> Option<Instant>;
}

/// Transport factory
pub trait Connector: Send {
    /// Start connecting to `authority`; must return without waiting
    fn connect(
        &mut self,
        authority: &Authority,
        options: &ConnectOptions,
    ) -> Result<Box<dyn PendingConnect>>;
}

/// A session that is usable right away, for connectors over transports
/// that need no setup
pub struct Established {
    session: Option<Box<dyn SessionOps>>,
    fd: RawFd,
}

impl Established {
    pub fn new(session: impl SessionOps + 'static) -> Self {
        let fd = session.raw_fd();
        Established {
            session: Some(Box::new(session)),
            fd,
        }
    }
}

impl PendingConnect for Established {
    fn advance(&mut self) -> Result<Option<Box<dyn SessionOps>>> {
        self.session.take().map(Some).ok_or(Error::ConnectionClosed)
    }

    fn interest(&self) -> PollEvents {
        PollEvents::Write
    }

    fn raw_fd(&self) -> RawFd {
        self.fd
    }

    fn deadline(&self) -> Option<Instant> {
        None
    }
}

/// Name lookup running on a worker thread
///
/// The worker sends its answer over a channel, then writes one byte to a
/// socket pair so `signal` turns readable for the poller.
struct Lookup {
    answer: Receiver<Option<ResolvedAddress>>,
    signal: UnixStream,
}

impl Lookup {
    fn spawn(resolver: Arc<dyn Resolver>, name: String) -> Result<Self> {
        let (signal, mut notify) = UnixStream::pair()?;
        signal.set_nonblocking(true)?;
        let (tx, answer) = mpsc::channel();

        thread::Builder::new()
            .name("h1client-resolver".to_string())
            .spawn(move || {
                let resolved = resolver.resolve(&name);
                // the attempt may have been dropped meanwhile
                let _ = tx.send(resolved);
                let _ = notify.write_all(&[1]);
            })?;

        Ok(Lookup { answer, signal })
    }
}

enum Stage {
    Resolving(Lookup),
    Connecting(Socket),
    Handshaking(TlsHandshake),
    Failed,
}

/// Connection attempt started by [`TcpConnector`]
pub struct TcpConnect {
    authority: Authority,
    options: ConnectOptions,
    /// Present until the handshake starts, for `https` only
    tls: Option<TlsConfig>,
    stage: Stage,
    deadline: Option<Instant>,
}

impl TcpConnect {
    fn connected(&mut self, socket: Socket) -> Result<Option<Box<dyn SessionOps>>> {
        let stream: TcpStream = socket.into();
        log::debug!("connected to {}", self.authority);

        let config = match self.tls.take() {
            Some(config) => config,
            None => return Ok(Some(Box::new(FdSessionOps::new(stream)?))),
        };

        self.deadline = self
            .options
            .tls_handshake_timeout
            .map(|timeout| Instant::now() + timeout);
        let step = TlsSessionOps::handshake(stream, &config, self.authority.lookup_host())?;
        Ok(self.handshaken(step))
    }

    fn handshaken(&mut self, step: Handshake) -> Option<Box<dyn SessionOps>> {
        match step {
            Handshake::Done(session) => Some(Box::new(session)),
            Handshake::Pending(handshake) => {
                self.stage = Stage::Handshaking(handshake);
                None
            }
        }
    }
}

impl PendingConnect for TcpConnect {
    fn advance(&mut self) -> Result<Option<Box<dyn SessionOps>>> {
        loop {
            match std::mem::replace(&mut self.stage, Stage::Failed) {
                Stage::Resolving(lookup) => match lookup.answer.try_recv() {
                    Ok(Some(resolved)) => {
                        let socket = open_socket(&self.authority, resolved.addr, &self.options)?;
                        self.stage = Stage::Connecting(socket);
                    }
                    Ok(None) | Err(TryRecvError::Disconnected) => {
                        return Err(Error::Dns(self.authority.host.clone()));
                    }
                    Err(TryRecvError::Empty) => {
                        self.stage = Stage::Resolving(lookup);
                        return Ok(None);
                    }
                },
                Stage::Connecting(socket) => {
                    if let Some(err) = socket.take_error()? {
                        return Err(connect_error(&self.authority, err));
                    }
                    match socket.peer_addr() {
                        Ok(_) => return self.connected(socket),
                        Err(e) if e.kind() == io::ErrorKind::NotConnected => {
                            self.stage = Stage::Connecting(socket);
                            return Ok(None);
                        }
                        Err(e) => return Err(connect_error(&self.authority, e)),
                    }
                }
                Stage::Handshaking(handshake) => {
                    let step = handshake.resume()?;
                    return Ok(self.handshaken(step));
                }
                Stage::Failed => return Err(Error::ConnectionClosed),
            }
        }
    }

    fn interest(&self) -> PollEvents {
        match &self.stage {
            Stage::Resolving(_) | Stage::Failed => PollEvents::Read,
            Stage::Connecting(_) => PollEvents::Write,
            Stage::Handshaking(handshake) => handshake.interest(),
        }
    }

    fn raw_fd(&self) -> RawFd {
        match &self.stage {
            Stage::Resolving(lookup) => lookup.signal.as_raw_fd(),
            Stage::Connecting(socket) => socket.as_raw_fd(),
            Stage::Handshaking(handshake) => handshake.raw_fd(),
            Stage::Failed => -1,
        }
    }

    fn deadline(&self) -> Option<Instant> {
        self.deadline
    }
}

impl fmt::Debug for TcpConnect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let stage = match self.stage {
            Stage::Resolving(_) => "resolving",
            Stage::Connecting(_) => "connecting",
            Stage::Handshaking(_) => "handshaking",
            Stage::Failed => "failed",
        };
        f.debug_struct("TcpConnect")
            .field("authority", &self.authority)
            .field("stage", &stage)
            .finish()
    }
}

fn connect_error(authority: &Authority, source: io::Error) -> Error {
    Error::Connect {
        authority: authority.to_string(),
        source,
    }
}

/// Create a non-blocking socket and start connecting it
fn open_socket(authority: &Authority, ip: IpAddr, options: &ConnectOptions) -> Result<Socket> {
    let addr = SocketAddr::new(ip, authority.port);

    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    if let Some(bind) = options.bind_address {
        socket
            .bind(&SockAddr::from(bind))
            .map_err(|e| connect_error(authority, e))?;
    }
    socket.set_nonblocking(true)?;
    socket.set_nodelay(true)?;
    if let Some(idle) = options.keep_alive_timeout {
        socket.set_tcp_keepalive(&TcpKeepalive::new().with_time(idle))?;
    }

    log::debug!("connecting to {} ({})", authority, addr);
    match socket.connect(&SockAddr::from(addr)) {
        Ok(()) => Ok(socket),
        Err(e) if e.raw_os_error() == Some(libc::EINPROGRESS) => Ok(socket),
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(socket),
        Err(e) => Err(connect_error(authority, e)),
    }
}

/// Default connector: TCP via socket2, optionally wrapped in TLS
pub struct TcpConnector {
    resolver: Arc<dyn Resolver>,
    tls_options: TlsOptions,
    tls: Option<TlsConfig>,
}

impl TcpConnector {
    pub fn new(tls_options: TlsOptions) -> Self {
        Self::with_resolver(tls_options, SystemResolver)
    }

    pub fn with_resolver(tls_options: TlsOptions, resolver: impl Resolver + 'static) -> Self {
        TcpConnector {
            resolver: Arc::new(resolver),
            tls_options,
            tls: None,
        }
    }

    fn tls_config(&mut self) -> Result<TlsConfig> {
        if self.tls.is_none() {
            self.tls = Some(self.tls_options.build()?);
        }
        self.tls
            .clone()
            .ok_or_else(|| Error::InvalidRequest("TLS configuration unavailable".to_string()))
    }
}

impl Connector for TcpConnector {
    fn connect(
        &mut self,
        authority: &Authority,
        options: &ConnectOptions,
    ) -> Result<Box<dyn PendingConnect>> {
        let tls = if authority.secure {
            Some(self.tls_config()?)
        } else {
            None
        };
        let deadline = options
            .connect_timeout
            .map(|timeout| Instant::now() + timeout);

        let host = authority.lookup_host();
        let stage = match host.parse::<IpAddr>() {
            Ok(ip) => Stage::Connecting(open_socket(authority, ip, options)?),
            Err(_) => {
                log::trace!("resolving {}", host);
                Stage::Resolving(Lookup::spawn(self.resolver.clone(), host.to_string())?)
            }
        };

        Ok(Box::new(TcpConnect {
            authority: authority.clone(),
            options: options.clone(),
            tls,
            stage,
            deadline,
        }))
    }
}

impl fmt::Debug for TcpConnector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TcpConnector")
            .field("tls_options", &self.tls_options)
            .finish()
    }
}
