//! HTTP client
//!
//! The [`Client`] owns one lifecycle per in-flight request and multiplexes
//! them over the [`ConnectionPool`]. Each lifecycle embeds a
//! [`RequestWriter`] and a [`ResponseParser`] and moves through
//! [`RequestPhase`]s as its connection becomes writable or readable.
//!
//! Nothing here waits on a single request: name lookup, TCP connect and
//! the TLS handshake are steps of a [`RequestPhase::Connecting`] lifecycle
//! and wait in the same poll as every other request.
//!
//! Two ways to drive it:
//!
//! - non-blocking: [`Client::submit`] requests, then call
//!   [`Client::run_once`] repeatedly and collect finished outcomes
//! - blocking: [`Client::request`], [`Client::request_multi`] and
//!   [`Client::get`] loop over `run_once` internally
//!
//! # Examples
//!
//! ```no_run
//! use h1client::http::{Client, ClientConfig, Request};
//! use std::time::Duration;
//!
//! let mut client = Client::new(ClientConfig::default());
//! let a = client.submit(Request::get("http://127.0.0.1:8080/a").unwrap()).unwrap();
//! let b = client.submit(Request::get("http://127.0.0.1:8080/b").unwrap()).unwrap();
//!
//! while !client.is_idle() {
//!     for (id, outcome) in client.run_once(Some(Duration::from_millis(100))).unwrap() {
//!         match outcome {
//!             Ok(response) => println!("{} -> {}", id, response.status()),
//!             Err(e) => println!("{} failed in {}: {}", id, e.phase(), e),
//!         }
//!     }
//! }
//! # let _ = (a, b);
//! ```

use super::config::{ClientConfig, FollowPolicy};
use super::connector::{Authority, Connector, TcpConnector};
use super::events::{ClientEvent, Flow, Observers};
use super::parser::{BodyMode, ParseErrorKind, ResponseParser};
use super::pool::{Checkout, ConnectProgress, ConnectionId, ConnectionPool};
use super::reactor::{Reactor, TimerKind, Timers};
use super::session::PollEvents;
use super::writer::{RequestWriter, WriteStatus, WriterState};
use super::{
    Body, Error, Method, Phase, Request, Response, Result, Status, TransferStats, ValidationError,
    Version,
};
use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::io::{self, Read};
use std::time::{Duration, Instant};
use url::Url;

/// Upper bound for one wait when no descriptor is registered
const IDLE_WAIT: Duration = Duration::from_millis(10);

/// Handle to a submitted request
///
/// Ids increase in submission order and are never reused by a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestId(u64);

impl RequestId {
    pub fn as_u64(&self) -> u64 {
        self.0
    }

    #[cfg(test)]
    pub(crate) fn from_raw(raw: u64) -> Self {
        RequestId(raw)
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "req#{}", self.0)
    }
}

/// Lifecycle phase of a request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestPhase {
    NeedsConnection,
    /// Resolving, connecting or in the TLS handshake
    Connecting,
    WritingHeaders,
    WritingBufferedBody,
    WritingStreamBody,
    ReadingHeaders,
    ReadingToContentLength,
    ReadingToClose,
    ReadingChunks,
    Complete,
    Error,
}

impl RequestPhase {
    /// The error phase a failure in this lifecycle phase belongs to
    pub fn error_phase(&self) -> Phase {
        match self {
            RequestPhase::NeedsConnection | RequestPhase::Connecting => Phase::Connect,
            RequestPhase::WritingHeaders
            | RequestPhase::WritingBufferedBody
            | RequestPhase::WritingStreamBody => Phase::Write,
            RequestPhase::ReadingHeaders
            | RequestPhase::ReadingToContentLength
            | RequestPhase::ReadingToClose
            | RequestPhase::ReadingChunks => Phase::Read,
            RequestPhase::Complete | RequestPhase::Error => Phase::Policy,
        }
    }

    fn is_writing(&self) -> bool {
        matches!(
            self,
            RequestPhase::WritingHeaders
                | RequestPhase::WritingBufferedBody
                | RequestPhase::WritingStreamBody
        )
    }

    fn is_reading(&self) -> bool {
        matches!(
            self,
            RequestPhase::ReadingHeaders
                | RequestPhase::ReadingToContentLength
                | RequestPhase::ReadingToClose
                | RequestPhase::ReadingChunks
        )
    }

    fn for_body(mode: BodyMode) -> Self {
        match mode {
            BodyMode::Empty => RequestPhase::ReadingHeaders,
            BodyMode::ContentLength(_) => RequestPhase::ReadingToContentLength,
            BodyMode::Chunked => RequestPhase::ReadingChunks,
            BodyMode::UntilClose => RequestPhase::ReadingToClose,
        }
    }
}

/// Outcome of one request
pub type Outcome = (RequestId, Result<Response>);

/// Lifecycle notifications, turned into [`ClientEvent`]s by the client
enum Notice {
    CheckedOut { connection: ConnectionId, reused: bool },
    Sent { bytes: u64 },
    Continue,
    Headers(Status),
    Redirect { from: Url, to: Url, status: Status },
}

enum Progress {
    Continue,
    Blocked,
    /// Wait for this readiness on the connection's descriptor
    Await(PollEvents),
    Done(Response),
}

/// Per-connection state of the current hop
struct Active {
    connection: ConnectionId,
    writer: RequestWriter,
    parser: ResponseParser,
    /// Response bytes read on this hop
    received: u64,
    eof: bool,
    head_reported: bool,
}

/// What a lifecycle step may touch besides its own state
struct Exchange<'a> {
    pool: &'a mut ConnectionPool,
    timers: &'a mut Timers<RequestId>,
    config: &'a ClientConfig,
    notices: &'a mut Vec<Notice>,
    read_buf: &'a mut [u8],
}

struct Lifecycle {
    id: RequestId,
    phase: RequestPhase,
    request: Request,
    authority: Authority,
    active: Option<Active>,
    history: Vec<Url>,
    stats: TransferStats,
    /// Readiness the lifecycle waits for; `None` means runnable
    wants: Option<PollEvents>,
}

impl Lifecycle {
    fn drive(&mut self, ex: &mut Exchange<'_>) -> Option<Result<Response>> {
        loop {
            let step = match self.phase {
                RequestPhase::NeedsConnection => self.acquire(ex),
                RequestPhase::Connecting => self.connect(ex),
                phase if phase.is_writing() => self.write(ex),
                phase if phase.is_reading() => self.read(ex),
                _ => return None,
            };

            match step {
                Ok(Progress::Continue) => continue,
                Ok(Progress::Blocked) => {
                    self.wants = self.interest();
                    return None;
                }
                Ok(Progress::Await(events)) => {
                    self.wants = Some(events);
                    return None;
                }
                Ok(Progress::Done(response)) => return Some(Ok(response)),
                Err(e) => {
                    self.abort(ex.pool, ex.timers);
                    return Some(Err(e));
                }
            }
        }
    }

    fn interest(&self) -> Option<PollEvents> {
        match self.phase {
            phase if phase.is_writing() => match &self.active {
                Some(active) if active.writer.state() == WriterState::AwaitingContinue => {
                    Some(PollEvents::Read)
                }
                _ => Some(PollEvents::Both),
            },
            phase if phase.is_reading() => Some(PollEvents::Read),
            _ => None,
        }
    }

    fn acquire(&mut self, ex: &mut Exchange<'_>) -> Result<Progress> {
        let (connection, open) = match ex.pool.checkout(&self.authority)? {
            Checkout::Connection(id) => (id, true),
            Checkout::Connecting(id) => (id, false),
            Checkout::NoCapacity => return Ok(Progress::Blocked),
        };

        let reused = ex
            .pool
            .get(connection)
            .map(|c| c.is_reused())
            .unwrap_or(false);

        let mut parser = ResponseParser::new(ex.config.parser_options());
        parser.set_head_request(self.request.method() == Method::Head);
        let writer = RequestWriter::new(&mut self.request, ex.config.writer_options());

        self.active = Some(Active {
            connection,
            writer,
            parser,
            received: 0,
            eof: false,
            head_reported: false,
        });
        if open {
            self.stats.connected_at = Some(Instant::now());
            self.phase = RequestPhase::WritingHeaders;
        } else {
            self.phase = RequestPhase::Connecting;
        }

        if let Some(timeout) = ex.config.transfer_timeout {
            ex.timers
                .schedule(self.id, TimerKind::Transfer, Instant::now() + timeout);
        }
        ex.notices.push(Notice::CheckedOut { connection, reused });
        log::debug!("{} using {} for {}", self.id, connection, self.authority);
        Ok(Progress::Continue)
    }

    fn connect(&mut self, ex: &mut Exchange<'_>) -> Result<Progress> {
        let connection = self.connection().ok_or(Error::ConnectionClosed)?;
        match ex.pool.advance_connect(connection)? {
            ConnectProgress::Established => {
                ex.timers.cancel(self.id, TimerKind::Connect);
                self.stats.connected_at = Some(Instant::now());
                self.phase = RequestPhase::WritingHeaders;
                Ok(Progress::Continue)
            }
            ConnectProgress::Pending { interest, deadline } => {
                match deadline {
                    Some(deadline) => ex.timers.schedule(self.id, TimerKind::Connect, deadline),
                    None => {
                        ex.timers.cancel(self.id, TimerKind::Connect);
                    }
                }
                Ok(Progress::Await(interest))
            }
        }
    }

    fn write(&mut self, ex: &mut Exchange<'_>) -> Result<Progress> {
        let active = self.active.as_mut().ok_or(Error::ConnectionClosed)?;
        let conn = ex
            .pool
            .get_mut(active.connection)
            .ok_or(Error::ConnectionClosed)?;

        let status = active.writer.send(conn)?;
        match active.writer.state() {
            WriterState::Body => self.phase = RequestPhase::WritingBufferedBody,
            WriterState::BodyStream | WriterState::BodyStreamChunked => {
                self.phase = RequestPhase::WritingStreamBody
            }
            _ => {}
        }

        match status {
            WriteStatus::Complete => {
                ex.timers.cancel(self.id, TimerKind::ContinueDelay);
                ex.notices.push(Notice::Sent {
                    bytes: active.writer.bytes_written(),
                });
                self.phase = RequestPhase::ReadingHeaders;
                Ok(Progress::Continue)
            }
            WriteStatus::Pending => {
                if let Some(deadline) = active.writer.continue_deadline() {
                    ex.timers
                        .schedule(self.id, TimerKind::ContinueDelay, deadline);
                }
                // the server may answer (100 or a final status) before the
                // body is out
                if active.writer.has_started() {
                    self.read(ex)
                } else {
                    Ok(Progress::Blocked)
                }
            }
        }
    }

    fn read(&mut self, ex: &mut Exchange<'_>) -> Result<Progress> {
        loop {
            let active = self.active.as_mut().ok_or(Error::ConnectionClosed)?;

            let parsed = match active.parser.parse() {
                Ok(parsed) => parsed,
                Err(err) => return Err(classify_parse_error(err, active)),
            };

            match parsed {
                Some(response) if response.status().is_informational() => {
                    if response.status() == Status::CONTINUE {
                        log::debug!("{} received 100 Continue", self.id);
                        active.writer.allow_continue();
                        ex.timers.cancel(self.id, TimerKind::ContinueDelay);
                        ex.notices.push(Notice::Continue);
                    } else {
                        log::debug!("{} discarding interim {}", self.id, response.status());
                    }
                    active.parser.reset();
                    active.head_reported = false;
                    if !active.writer.is_complete() {
                        return Ok(Progress::Continue);
                    }
                    continue;
                }
                Some(response) => {
                    if !active.head_reported {
                        ex.notices.push(Notice::Headers(response.status()));
                    }
                    return self.finish_exchange(response, ex);
                }
                None => {}
            }

            if active.parser.head_complete() && !active.head_reported {
                if let Some(status) = active.parser.status() {
                    active.head_reported = true;
                    ex.notices.push(Notice::Headers(status));
                }
            }
            if active.writer.is_complete() {
                if let Some(mode) = active.parser.body_mode() {
                    self.phase = RequestPhase::for_body(mode);
                }
            }

            if active.eof {
                // end of stream was delivered and the message is still open
                return Err(Error::ConnectionClosed);
            }

            let conn = ex
                .pool
                .get_mut(active.connection)
                .ok_or(Error::ConnectionClosed)?;

            match conn.read(&mut ex.read_buf[..]) {
                Ok(0) => {
                    log::trace!("{} peer closed after {} bytes", self.id, active.received);
                    active.parser.feed_eof();
                    active.eof = true;
                }
                Ok(n) => {
                    active.parser.feed(&ex.read_buf[..n]);
                    active.received += n as u64;
                    self.stats.bytes_received += n as u64;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(Progress::Blocked),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) if active.parser.body_mode() == Some(BodyMode::UntilClose) => {
                    log::debug!("{} read-to-close body ended by {}", self.id, e);
                    active.parser.feed_eof();
                    active.eof = true;
                }
                Err(e) => return Err(Error::Read(e)),
            }
        }
    }

    /// Validate the response, release the connection and decide whether
    /// to follow a redirect
    fn finish_exchange(
        &mut self,
        response: Response,
        ex: &mut Exchange<'_>,
    ) -> Result<Progress> {
        let mut active = self.active.take().ok_or(Error::ConnectionClosed)?;
        ex.timers.cancel_all(self.id);

        let body_sent = active.writer.is_complete();
        if !body_sent {
            log::debug!(
                "{} got {} before the request body was sent",
                self.id,
                response.status()
            );
            active.writer.skip_body();
        }
        self.stats.bytes_sent += active.writer.bytes_written();

        let mode = active.parser.body_mode();
        let mut leftover = active.parser.buffered() as u64;
        let mut peer_closed = active.eof;

        // a body longer than declared shows up as bytes past its end
        if leftover == 0 && !peer_closed && matches!(mode, Some(BodyMode::ContentLength(_))) {
            if let Some(conn) = ex.pool.get_mut(active.connection) {
                match conn.read(&mut ex.read_buf[..]) {
                    Ok(0) => peer_closed = true,
                    Ok(n) => {
                        leftover += n as u64;
                        self.stats.bytes_received += n as u64;
                    }
                    Err(_) => {}
                }
            }
        }

        let reusable = ex.config.keep_alive
            && body_sent
            && !peer_closed
            && leftover == 0
            && mode != Some(BodyMode::UntilClose)
            && keeps_alive(&self.request, &response);

        if reusable {
            ex.pool.checkin(active.connection);
        } else {
            log::debug!("{} closing {} after response", self.id, active.connection);
            ex.pool.close(active.connection);
        }

        if let Some(BodyMode::ContentLength(declared)) = mode {
            if leftover > 0 {
                return Err(ValidationError::ContentLength {
                    declared,
                    actual: active.parser.body_stats().received + leftover,
                }
                .into());
            }
        }

        if let Some(declared) = response.headers().get("Content-MD5") {
            if let Some(computed) = active.parser.body_digest() {
                if computed != declared.trim() {
                    return Err(ValidationError::ContentMd5 {
                        declared: declared.trim().to_string(),
                        computed: computed.to_string(),
                    }
                    .into());
                }
            }
        }

        if let Some(target) = self.redirect_target(&response, ex.config)? {
            let body = active.writer.into_body();
            self.follow(target, response.status(), body, ex)?;
            return Ok(Progress::Continue);
        }

        self.stats.completed_at = Some(Instant::now());
        let mut response = response;
        response.set_history(self.history.clone());
        response.set_stats(self.stats);
        self.phase = RequestPhase::Complete;
        Ok(Progress::Done(response))
    }

    fn redirect_target(&self, response: &Response, config: &ClientConfig) -> Result<Option<Url>> {
        let policy = config.follow_location;
        let status = response.status();
        let eligible = (status.is_redirection()
            && status != Status::NOT_MODIFIED
            && policy.contains(FollowPolicy::ON_3XX))
            || (status.is_success() && policy.contains(FollowPolicy::ON_2XX));
        if !eligible {
            return Ok(None);
        }

        let location = match response.headers().get("Location") {
            Some(location) if !location.trim().is_empty() => location.trim(),
            _ => return Ok(None),
        };

        if !self.request.method().is_safe() && !policy.contains(FollowPolicy::ON_UNSAFE_METHOD) {
            log::debug!(
                "{} not following {} for {}",
                self.id,
                status.code(),
                self.request.method()
            );
            return Ok(None);
        }

        let mut target = match self.request.url().join(location) {
            Ok(target) => target,
            Err(e) => {
                log::warn!("{} ignoring Location {:?}: {}", self.id, location, e);
                return Ok(None);
            }
        };
        target.set_fragment(None);

        if !matches!(target.scheme(), "http" | "https") {
            log::warn!("{} ignoring redirect to {}", self.id, target);
            return Ok(None);
        }
        if self.history.contains(&target) {
            return Err(Error::RedirectLoop(target.to_string()));
        }
        if self.stats.redirects >= config.max_redirects {
            return Err(Error::TooManyRedirects(config.max_redirects));
        }
        Ok(Some(target))
    }

    fn follow(
        &mut self,
        target: Url,
        status: Status,
        mut body: Body,
        ex: &mut Exchange<'_>,
    ) -> Result<()> {
        body.rewind()?;
        let previous = self.request.url().clone();

        self.authority = Authority::from_url(&target)?;
        self.request.set_url(target.clone());
        self.request.set_body(body);

        if let Some(host) = self.request.host_header() {
            self.request.headers_mut().set("Host", host);
        }
        if ex.config.auto_referer {
            let mut referer = previous.clone();
            referer.set_fragment(None);
            let _ = referer.set_username("");
            let _ = referer.set_password(None);
            self.request.headers_mut().set("Referer", referer.as_str());
        }

        log::debug!(
            "{} following {} from {} to {}",
            self.id,
            status.code(),
            previous,
            target
        );
        self.history.push(target.clone());
        self.stats.redirects += 1;
        ex.notices.push(Notice::Redirect {
            from: previous,
            to: target,
            status,
        });

        self.phase = RequestPhase::NeedsConnection;
        self.wants = None;
        Ok(())
    }

    /// Release the connection and timers of an abandoned lifecycle
    fn abort(&mut self, pool: &mut ConnectionPool, timers: &mut Timers<RequestId>) {
        timers.cancel_all(self.id);
        if let Some(active) = self.active.take() {
            if active.writer.has_started() {
                pool.close(active.connection);
            } else {
                pool.checkin(active.connection);
            }
        }
        self.phase = RequestPhase::Error;
        self.wants = None;
    }

    fn connection(&self) -> Option<ConnectionId> {
        self.active.as_ref().map(|a| a.connection)
    }
}

/// Keep-alive as negotiated by the request and response headers
fn keeps_alive(request: &Request, response: &Response) -> bool {
    if request.headers().has_token("Connection", "close")
        || response.headers().has_token("Connection", "close")
    {
        return false;
    }
    !(response.version() == Version::Http10 && !response.headers().contains("Connection"))
}

/// Turn an end-of-stream parse failure into the error the caller cares
/// about: a closed connection, or a short Content-Length body
fn classify_parse_error(err: Error, active: &Active) -> Error {
    let eof = matches!(&err, Error::Parse(p) if p.kind == ParseErrorKind::UnexpectedEof);
    if !eof {
        return err;
    }
    if active.received == 0 {
        return Error::ConnectionClosed;
    }
    match active.parser.body_mode() {
        Some(BodyMode::ContentLength(declared)) => ValidationError::ContentLength {
            declared,
            actual: active.parser.body_stats().received,
        }
        .into(),
        _ => err,
    }
}

/// Fill in the headers a request needs on the wire
///
/// Derives Host, defaults User-Agent, frames the body with Content-Length
/// or chunked coding and strips the body of TRACE requests.
pub(crate) fn normalize(request: &mut Request, config: &ClientConfig) -> Result<()> {
    if !request.headers().contains("Host") {
        if let Some(host) = request.host_header() {
            request.headers_mut().set("Host", host);
        }
    }
    if !config.user_agent.is_empty() {
        request
            .headers_mut()
            .set_default("User-Agent", config.user_agent.clone());
    }

    let method = request.method();
    let version = request.version();
    let body = request.take_body();

    let body = if method == Method::Trace {
        request.headers_mut().remove("Content-Length");
        request.headers_mut().remove("Transfer-Encoding");
        Body::Empty
    } else if body.is_empty() {
        request.headers_mut().remove("Transfer-Encoding");
        if method.expects_body() && !request.headers().contains("Content-Length") {
            request.headers_mut().set("Content-Length", "0");
        }
        Body::Empty
    } else {
        match body {
            Body::Bytes(bytes) => {
                request.headers_mut().remove("Transfer-Encoding");
                request
                    .headers_mut()
                    .set("Content-Length", bytes.len().to_string());
                Body::Bytes(bytes)
            }
            Body::Stream(stream) => {
                let chunked = version == Version::Http11
                    && request.headers().has_token("Transfer-Encoding", "chunked");
                let headers = request.headers_mut();
                match (chunked, stream.size_hint()) {
                    (true, _) => {
                        headers.remove("Content-Length");
                        Body::Stream(stream)
                    }
                    (false, Some(len)) => {
                        headers.remove("Transfer-Encoding");
                        headers.set("Content-Length", len.to_string());
                        Body::Stream(stream)
                    }
                    (false, None) if headers.contains("Content-Length") => {
                        headers.remove("Transfer-Encoding");
                        Body::Stream(stream)
                    }
                    (false, None) if version == Version::Http11 => {
                        headers.set("Transfer-Encoding", "chunked");
                        Body::Stream(stream)
                    }
                    (false, None) => {
                        // HTTP/1.0 has no chunked coding; buffer to learn the length
                        headers.remove("Transfer-Encoding");
                        let buffered = Body::Stream(stream).into_buffered()?;
                        let len = buffered.len().unwrap_or(0);
                        headers.set("Content-Length", len.to_string());
                        buffered
                    }
                }
            }
            Body::Empty => Body::Empty,
        }
    };
    request.set_body(body);

    if !config.keep_alive {
        request.headers_mut().set("Connection", "close");
    }
    Ok(())
}

/// HTTP/1.1 client engine
pub struct Client {
    config: ClientConfig,
    pool: ConnectionPool,
    requests: BTreeMap<RequestId, Lifecycle>,
    next_id: u64,
    reactor: Reactor<RequestId>,
    timers: Timers<RequestId>,
    observers: Observers,
    /// Outcomes collected by a blocking call on behalf of other requests
    finished: VecDeque<Outcome>,
    read_buf: Vec<u8>,
}

impl Client {
    /// Create a client with the default TCP/TLS connector
    pub fn new(config: ClientConfig) -> Self {
        let connector = TcpConnector::new(config.tls.clone());
        Self::with_connector(config, connector)
    }

    /// Create a client with a custom transport factory
    pub fn with_connector(config: ClientConfig, connector: impl Connector + 'static) -> Self {
        let pool = ConnectionPool::new(
            Box::new(connector),
            config.connect_options(),
            config.max_connections_per_host,
        );
        let read_buf = vec![0u8; config.io_granularity.max(1)];

        Client {
            config,
            pool,
            requests: BTreeMap::new(),
            next_id: 1,
            reactor: Reactor::new(),
            timers: Timers::new(),
            observers: Observers::new(),
            finished: VecDeque::new(),
            read_buf,
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    pub fn pool_mut(&mut self) -> &mut ConnectionPool {
        &mut self.pool
    }

    /// Register an observer for client events
    pub fn subscribe<F>(&mut self, observer: F)
    where
        F: FnMut(&ClientEvent<'_>) -> Flow + Send + 'static,
    {
        self.observers.subscribe(observer);
    }

    /// Queue a request; it makes progress in [`Client::run_once`]
    pub fn submit(&mut self, mut request: Request) -> Result<RequestId> {
        normalize(&mut request, &self.config)?;
        let authority = Authority::from_url(request.url())?;

        let id = RequestId(self.next_id);
        self.next_id += 1;

        let mut first = request.url().clone();
        first.set_fragment(None);

        log::debug!("{} {} {}", id, request.method(), request.url());
        self.observers.emit(&ClientEvent::Submitted {
            id,
            url: request.url(),
        });

        self.requests.insert(
            id,
            Lifecycle {
                id,
                phase: RequestPhase::NeedsConnection,
                request,
                authority,
                active: None,
                history: vec![first],
                stats: TransferStats::new(Instant::now()),
                wants: None,
            },
        );
        Ok(id)
    }

    /// Run one scheduling pass
    ///
    /// Drives every runnable request, waits up to `timeout` for readiness
    /// (or the next timer), drives again and returns the requests that
    /// finished. An empty result means nothing finished yet.
    pub fn run_once(&mut self, timeout: Option<Duration>) -> Result<Vec<Outcome>> {
        let mut done: Vec<Outcome> = self.finished.drain(..).collect();
        if !done.is_empty() {
            return Ok(done);
        }
        done = self.pass(timeout)?;
        Ok(done)
    }

    /// Send one request and wait for its response
    ///
    /// Other submitted requests keep making progress; their outcomes are
    /// kept for the next [`Client::run_once`].
    pub fn request(&mut self, request: Request) -> Result<Response> {
        let id = self.submit(request)?;
        self.wait_for(id)
    }

    /// Send several requests concurrently and wait for all of them
    ///
    /// Results come back in input order. A failing request does not
    /// affect its siblings.
    pub fn request_multi(&mut self, requests: Vec<Request>) -> Vec<Result<Response>> {
        let submitted: Vec<Result<RequestId>> =
            requests.into_iter().map(|r| self.submit(r)).collect();

        let mut outcomes: BTreeMap<RequestId, Result<Response>> = BTreeMap::new();
        let waiting = |outcomes: &BTreeMap<RequestId, Result<Response>>| {
            submitted
                .iter()
                .filter_map(|s| s.as_ref().ok())
                .any(|id| !outcomes.contains_key(id))
        };

        while waiting(&outcomes) {
            let finished = match self.pass(None) {
                Ok(finished) => finished,
                Err(e) => {
                    log::warn!("scheduling pass failed: {}", e);
                    for id in submitted.iter().filter_map(|s| s.as_ref().ok()) {
                        if !outcomes.contains_key(id) {
                            self.cancel_quietly(*id);
                            let error = io::Error::other(e.to_string());
                            outcomes.insert(*id, Err(Error::Io(error)));
                        }
                    }
                    break;
                }
            };
            for (id, outcome) in finished {
                if submitted.iter().any(|s| matches!(s, Ok(sid) if *sid == id)) {
                    outcomes.insert(id, outcome);
                } else {
                    self.finished.push_back((id, outcome));
                }
            }
        }

        submitted
            .into_iter()
            .map(|s| match s {
                Ok(id) => outcomes.remove(&id).unwrap_or(Err(Error::Cancelled)),
                Err(e) => Err(e),
            })
            .collect()
    }

    /// GET a URL
    pub fn get(&mut self, url: &str) -> Result<Response> {
        self.request(Request::get(url)?)
    }

    /// Abandon a request
    ///
    /// Its connection goes back to the pool when nothing was written yet
    /// and is closed otherwise. Returns false for unknown or finished ids.
    pub fn cancel(&mut self, id: RequestId) -> bool {
        if !self.cancel_quietly(id) {
            return false;
        }
        log::warn!("{} cancelled", id);
        self.observers.emit(&ClientEvent::Cancelled { id });
        true
    }

    /// Release a body held back for `100 Continue`
    pub fn allow_continue(&mut self, id: RequestId) -> bool {
        match self.requests.get_mut(&id) {
            Some(lc) => match lc.active.as_mut() {
                Some(active) if active.writer.state() == WriterState::AwaitingContinue => {
                    active.writer.allow_continue();
                    self.timers.cancel(id, TimerKind::ContinueDelay);
                    lc.wants = None;
                    true
                }
                _ => false,
            },
            None => false,
        }
    }

    /// Phase of an in-flight request
    pub fn phase(&self, id: RequestId) -> Option<RequestPhase> {
        self.requests.get(&id).map(|lc| lc.phase)
    }

    /// No request in flight and no outcome waiting to be collected
    pub fn is_idle(&self) -> bool {
        self.requests.is_empty() && self.finished.is_empty()
    }

    /// Requests in flight
    pub fn pending(&self) -> usize {
        self.requests.len()
    }

    fn wait_for(&mut self, id: RequestId) -> Result<Response> {
        loop {
            if let Some(pos) = self.finished.iter().position(|(fid, _)| *fid == id) {
                if let Some((_, outcome)) = self.finished.remove(pos) {
                    return outcome;
                }
            }
            if !self.requests.contains_key(&id) {
                return Err(Error::Cancelled);
            }

            let finished = self.pass(None)?;
            self.finished.extend(finished);
        }
    }

    fn pass(&mut self, timeout: Option<Duration>) -> Result<Vec<Outcome>> {
        let mut done = Vec::new();

        if let Some(idle) = self.config.keep_alive_timeout {
            self.pool.close_idle(idle);
        }

        self.fire_timers(&mut done);
        self.drive_runnable(&mut done);
        if !done.is_empty() || self.requests.is_empty() {
            return Ok(done);
        }

        let mut orphaned = Vec::new();
        for (id, lc) in self.requests.iter() {
            let (events, connection) = match (lc.wants, lc.connection()) {
                (Some(events), Some(connection)) => (events, connection),
                _ => continue,
            };
            match self.pool.get(connection) {
                Some(conn) if events != PollEvents::Write && conn.has_buffered_data() => {
                    self.reactor.wake(*id)
                }
                Some(conn) => self.reactor.register(*id, conn.raw_fd(), events),
                None => orphaned.push(*id),
            }
        }
        for id in orphaned {
            if let Some(lc) = self.requests.get_mut(&id) {
                lc.wants = None;
                self.reactor.wake(id);
            }
        }

        let mut wait = timeout;
        if let Some(next) = self.timers.next_timeout(Instant::now()) {
            wait = Some(wait.map_or(next, |w| w.min(next)));
        }
        if self.reactor.is_empty() {
            wait = Some(wait.map_or(IDLE_WAIT, |w| w.min(IDLE_WAIT)));
        }

        for id in self.reactor.poll(wait)? {
            if let Some(lc) = self.requests.get_mut(&id) {
                lc.wants = None;
            }
        }

        self.fire_timers(&mut done);
        self.drive_runnable(&mut done);
        Ok(done)
    }

    /// Drive runnable lifecycles until a full round finishes nothing, so
    /// requests waiting for a slot pick up connections released this pass
    fn drive_runnable(&mut self, done: &mut Vec<Outcome>) {
        loop {
            let runnable: Vec<RequestId> = self
                .requests
                .iter()
                .filter(|(_, lc)| lc.wants.is_none())
                .map(|(id, _)| *id)
                .collect();

            let before = done.len();
            for id in runnable {
                if let Some(outcome) = self.drive(id) {
                    self.requests.remove(&id);
                    self.deliver(id, outcome, done);
                }
            }
            if done.len() == before {
                break;
            }
        }
    }

    fn drive(&mut self, id: RequestId) -> Option<Result<Response>> {
        let Client {
            config,
            pool,
            requests,
            timers,
            observers,
            read_buf,
            ..
        } = self;

        let lc = requests.get_mut(&id)?;
        let mut notices = Vec::new();
        let outcome = {
            let mut ex = Exchange {
                pool,
                timers,
                config,
                notices: &mut notices,
                read_buf: read_buf.as_mut_slice(),
            };
            lc.drive(&mut ex)
        };

        for notice in &notices {
            announce(observers, id, notice);
        }
        outcome
    }

    fn fire_timers(&mut self, done: &mut Vec<Outcome>) {
        for (id, kind) in self.timers.expired(Instant::now()) {
            match kind {
                TimerKind::ContinueDelay => {
                    if let Some(lc) = self.requests.get_mut(&id) {
                        lc.wants = None;
                    }
                }
                TimerKind::Transfer | TimerKind::Connect => {
                    if let Some(mut lc) = self.requests.remove(&id) {
                        let phase = match kind {
                            TimerKind::Connect => Phase::Connect,
                            _ => lc.phase.error_phase(),
                        };
                        log::warn!("{} timed out in {:?}", id, lc.phase);
                        lc.abort(&mut self.pool, &mut self.timers);
                        self.deliver(id, Err(Error::Timeout(phase)), done);
                    }
                }
            }
        }
    }

    fn deliver(&mut self, id: RequestId, outcome: Result<Response>, done: &mut Vec<Outcome>) {
        match &outcome {
            Ok(response) => {
                log::debug!("{} completed with {}", id, response.status());
                self.observers.emit(&ClientEvent::Response { id, response });
            }
            Err(error) => {
                log::debug!("{} failed in {} phase: {}", id, error.phase(), error);
                self.observers.emit(&ClientEvent::Error { id, error });
            }
        }
        done.push((id, outcome));
    }

    fn cancel_quietly(&mut self, id: RequestId) -> bool {
        self.finished.retain(|(fid, _)| *fid != id);
        match self.requests.remove(&id) {
            Some(mut lc) => {
                lc.abort(&mut self.pool, &mut self.timers);
                true
            }
            None => false,
        }
    }
}

fn announce(observers: &mut Observers, id: RequestId, notice: &Notice) {
    let event = match notice {
        Notice::CheckedOut { connection, reused } => ClientEvent::SocketCheckedOut {
            id,
            connection: *connection,
            reused: *reused,
        },
        Notice::Sent { bytes } => ClientEvent::RequestSent { id, bytes: *bytes },
        Notice::Continue => ClientEvent::ContinueReceived { id },
        Notice::Headers(status) => ClientEvent::HeadersReceived {
            id,
            status: *status,
        },
        Notice::Redirect { from, to, status } => ClientEvent::Redirect {
            id,
            from,
            to,
            status: *status,
        },
    };
    observers.emit(&event);
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("pending", &self.requests.len())
            .field("pool", &self.pool)
            .finish()
    }
}
