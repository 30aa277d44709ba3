//! Request serialization
//!
//! [`RequestWriter`] is the output-side state machine. Each call to
//! [`RequestWriter::send`] writes as much as the destination accepts and
//! returns [`WriteStatus::Pending`] when it would block, so the same writer
//! drives blocking and non-blocking sockets.

use super::chunked::{encode_chunk, LAST_CHUNK};
use super::{Body, Error, Method, Request, Result, Version, CRLF};
use bytes::Bytes;
use std::io::{self, Read, Write};
use std::time::{Duration, Instant};

/// Writer progress
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriterState {
    Start,
    StartLine,
    Headers,
    AwaitingContinue,
    InitBody,
    Body,
    BodyStream,
    BodyStreamChunked,
    Complete,
}

/// Outcome of one `send()` call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteStatus {
    /// The destination would block; call again when it is writable
    Pending,
    Complete,
}

/// Writer settings
#[derive(Debug, Clone)]
pub struct WriterOptions {
    /// Upper bound for one read from a streamed body
    pub io_granularity: usize,
    /// How long to wait for `100 Continue` before sending the body anyway
    pub continue_delay: Duration,
}

impl Default for WriterOptions {
    fn default() -> Self {
        WriterOptions {
            io_granularity: 16 * 1024,
            continue_delay: Duration::from_secs(1),
        }
    }
}

/// Non-blocking request writer
pub struct RequestWriter {
    state: WriterState,
    start_line: String,
    headers: Vec<u8>,
    method: Method,
    chunked: bool,
    declared_length: Option<u64>,
    body: Body,

    out: Bytes,
    pos: usize,
    stream_sent: u64,
    stream_done: bool,

    expect_continue: bool,
    continue_allowed: bool,
    continue_deadline: Option<Instant>,
    options: WriterOptions,
    bytes_written: u64,
}

impl RequestWriter {
    /// Create a writer for a request, taking its body
    ///
    /// The body is handed back by [`RequestWriter::into_body`] so it can be
    /// rewound and resent after a redirect.
    pub fn new(request: &mut Request, options: WriterOptions) -> Self {
        let body = request.take_body();
        let headers = request.headers();

        let start_line = format!(
            "{} {} {}",
            request.method(),
            request.target(),
            request.version()
        );

        let mut header_block = Vec::with_capacity(256);
        headers.write_to(&mut header_block);
        header_block.extend_from_slice(CRLF.as_bytes());

        let chunked = request.version() == Version::Http11
            && headers.has_token("Transfer-Encoding", "chunked");
        let declared_length = headers
            .get("Content-Length")
            .and_then(|v| v.trim().parse::<u64>().ok());
        let expect_continue = headers.has_token("Expect", "100-continue");

        RequestWriter {
            state: WriterState::Start,
            start_line,
            headers: header_block,
            method: request.method(),
            chunked,
            declared_length,
            body,
            out: Bytes::new(),
            pos: 0,
            stream_sent: 0,
            stream_done: false,
            expect_continue,
            continue_allowed: false,
            continue_deadline: None,
            options,
            bytes_written: 0,
        }
    }

    /// Current state
    pub fn state(&self) -> WriterState {
        self.state
    }

    /// Whether the whole request has been written
    pub fn is_complete(&self) -> bool {
        self.state == WriterState::Complete
    }

    /// Bytes handed to the destination so far
    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    /// Whether anything reached the destination yet
    pub fn has_started(&self) -> bool {
        self.bytes_written > 0
    }

    /// Release a writer paused for `100 Continue`
    pub fn allow_continue(&mut self) {
        self.continue_allowed = true;
    }

    /// When the continue delay elapses, while paused for `100 Continue`
    pub fn continue_deadline(&self) -> Option<Instant> {
        match self.state {
            WriterState::AwaitingContinue => self.continue_deadline,
            _ => None,
        }
    }

    /// Abandon the body, e.g. when the server answered early
    pub fn skip_body(&mut self) {
        if self.state != WriterState::Complete {
            log::debug!("skipping request body in state {:?}", self.state);
            self.out = Bytes::new();
            self.pos = 0;
            self.state = WriterState::Complete;
        }
    }

    /// Give back the request body
    pub fn into_body(self) -> Body {
        self.body
    }

    /// Write as much of the request as `dest` accepts
    pub fn send<W: Write + ?Sized>(&mut self, dest: &mut W) -> Result<WriteStatus> {
        loop {
            match self.state {
                WriterState::Start => {
                    log::trace!("> {}", self.start_line);
                    let mut line = Vec::with_capacity(self.start_line.len() + 2);
                    line.extend_from_slice(self.start_line.as_bytes());
                    line.extend_from_slice(CRLF.as_bytes());
                    self.load(Bytes::from(line));
                    self.state = WriterState::StartLine;
                }

                WriterState::StartLine => {
                    if !self.flush(dest)? {
                        return Ok(WriteStatus::Pending);
                    }
                    if log::log_enabled!(log::Level::Trace) {
                        for line in String::from_utf8_lossy(&self.headers).lines() {
                            if !line.is_empty() {
                                log::trace!("> {}", line);
                            }
                        }
                    }
                    let headers = std::mem::take(&mut self.headers);
                    self.load(Bytes::from(headers));
                    self.state = WriterState::Headers;
                }

                WriterState::Headers => {
                    if !self.flush(dest)? {
                        return Ok(WriteStatus::Pending);
                    }
                    if self.expect_continue && self.has_body() {
                        self.continue_deadline = Some(Instant::now() + self.options.continue_delay);
                        self.state = WriterState::AwaitingContinue;
                    } else {
                        self.state = WriterState::InitBody;
                    }
                }

                WriterState::AwaitingContinue => {
                    let expired = self
                        .continue_deadline
                        .map_or(true, |deadline| Instant::now() >= deadline);
                    if !self.continue_allowed && !expired {
                        return Ok(WriteStatus::Pending);
                    }
                    if !self.continue_allowed {
                        log::debug!(
                            "no 100 Continue within {:?}, sending body",
                            self.options.continue_delay
                        );
                    }
                    self.state = WriterState::InitBody;
                }

                WriterState::InitBody => {
                    if !self.has_body() {
                        self.state = WriterState::Complete;
                        continue;
                    }
                    self.state = match &self.body {
                        Body::Empty => WriterState::Complete,
                        Body::Bytes(bytes) => {
                            self.out = bytes.clone();
                            self.pos = 0;
                            WriterState::Body
                        }
                        Body::Stream(_) if self.chunked => WriterState::BodyStreamChunked,
                        Body::Stream(_) => WriterState::BodyStream,
                    };
                }

                WriterState::Body => {
                    if !self.flush(dest)? {
                        return Ok(WriteStatus::Pending);
                    }
                    self.state = WriterState::Complete;
                }

                WriterState::BodyStream => {
                    if !self.flush(dest)? {
                        return Ok(WriteStatus::Pending);
                    }
                    if self.stream_done {
                        self.state = WriterState::Complete;
                        continue;
                    }
                    let block = self.read_stream()?;
                    if block.is_empty() {
                        self.check_stream_length()?;
                        self.stream_done = true;
                    } else {
                        self.load(Bytes::from(block));
                    }
                }

                WriterState::BodyStreamChunked => {
                    if !self.flush(dest)? {
                        return Ok(WriteStatus::Pending);
                    }
                    if self.stream_done {
                        self.state = WriterState::Complete;
                        continue;
                    }
                    let block = self.read_stream()?;
                    if block.is_empty() {
                        self.stream_done = true;
                        self.load(Bytes::from_static(LAST_CHUNK));
                    } else {
                        let mut chunk = Vec::with_capacity(block.len() + 16);
                        encode_chunk(&block, &mut chunk);
                        self.load(Bytes::from(chunk));
                    }
                }

                WriterState::Complete => return Ok(WriteStatus::Complete),
            }
        }
    }

    fn has_body(&self) -> bool {
        self.method != Method::Trace && !self.body.is_empty()
    }

    fn load(&mut self, data: Bytes) {
        self.out = data;
        self.pos = 0;
    }

    /// Write pending output; `Ok(false)` means the destination would block
    fn flush<W: Write + ?Sized>(&mut self, dest: &mut W) -> Result<bool> {
        while self.pos < self.out.len() {
            match dest.write(&self.out[self.pos..]) {
                Ok(0) => return Err(Error::WriteClosed),
                Ok(n) => {
                    self.pos += n;
                    self.bytes_written += n as u64;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::BrokenPipe
                            | io::ErrorKind::ConnectionReset
                            | io::ErrorKind::ConnectionAborted
                    ) =>
                {
                    return Err(Error::WriteClosed)
                }
                Err(e) => return Err(Error::Write(e)),
            }
        }
        Ok(true)
    }

    /// Read the next block of a streamed body; empty at end of stream
    fn read_stream(&mut self) -> Result<Vec<u8>> {
        let mut limit = self.options.io_granularity.max(1) as u64;
        if !self.chunked {
            if let Some(declared) = self.declared_length {
                limit = limit.min(declared.saturating_sub(self.stream_sent));
                if limit == 0 {
                    return Ok(Vec::new());
                }
            }
        }

        let stream = match &mut self.body {
            Body::Stream(stream) => stream,
            _ => return Ok(Vec::new()),
        };

        let mut block = vec![0u8; limit as usize];
        let n = loop {
            match stream.read(&mut block) {
                Ok(n) => break n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(Error::Io(e)),
            }
        };
        block.truncate(n);
        self.stream_sent += n as u64;
        Ok(block)
    }

    fn check_stream_length(&self) -> Result<()> {
        match self.declared_length {
            Some(declared) if self.stream_sent < declared => Err(Error::InvalidRequest(format!(
                "body stream ended after {} of {} declared bytes",
                self.stream_sent, declared
            ))),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    /// Accepts at most `step` bytes per call and blocks on every other call
    struct Trickle {
        data: Vec<u8>,
        step: usize,
        block_next: bool,
    }

    impl Trickle {
        fn new(step: usize) -> Self {
            Trickle {
                data: Vec::new(),
                step,
                block_next: false,
            }
        }
    }

    impl Write for Trickle {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.block_next = !self.block_next;
            if !self.block_next {
                return Err(io::ErrorKind::WouldBlock.into());
            }
            let n = buf.len().min(self.step);
            self.data.extend_from_slice(&buf[..n]);
            Ok(n)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn request(method: Method, body: Body, headers: &[(&str, &str)]) -> Request {
        let mut builder = Request::builder()
            .method(method)
            .uri("http://example.com/upload?x=1")
            .body(body);
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        builder.build().unwrap()
    }

    fn send_all(writer: &mut RequestWriter, dest: &mut Trickle) -> usize {
        let mut calls = 0;
        while writer.send(dest).unwrap() == WriteStatus::Pending {
            calls += 1;
            assert!(calls < 10_000, "writer never completed");
        }
        calls
    }

    #[test]
    fn test_buffered_body() {
        let mut req = request(
            Method::Post,
            Body::from("hello"),
            &[("Host", "example.com"), ("Content-Length", "5")],
        );
        let mut writer = RequestWriter::new(&mut req, WriterOptions::default());
        let mut dest = Trickle::new(7);

        let pending_calls = send_all(&mut writer, &mut dest);
        assert!(pending_calls > 0);
        assert_eq!(
            dest.data,
            b"POST /upload?x=1 HTTP/1.1\r\nHost: example.com\r\nContent-Length: 5\r\n\r\nhello"
        );
        assert_eq!(writer.bytes_written(), dest.data.len() as u64);
        assert!(writer.is_complete());
    }

    #[test]
    fn test_chunked_stream() {
        let body = Body::from_reader(Cursor::new(b"abcdefghij".to_vec()), None);
        let mut req = request(Method::Put, body, &[("Transfer-Encoding", "chunked")]);
        let mut writer = RequestWriter::new(
            &mut req,
            WriterOptions {
                io_granularity: 4,
                ..WriterOptions::default()
            },
        );
        let mut dest = Trickle::new(1024);
        send_all(&mut writer, &mut dest);

        let text = String::from_utf8(dest.data).unwrap();
        assert!(text.ends_with("\r\n\r\n4\r\nabcd\r\n4\r\nefgh\r\n2\r\nij\r\n0\r\n\r\n"));
    }

    #[test]
    fn test_length_prefixed_stream() {
        let body = Body::from_reader(Cursor::new(b"0123456789".to_vec()), Some(10));
        let mut req = request(Method::Post, body, &[("Content-Length", "10")]);
        let mut writer = RequestWriter::new(
            &mut req,
            WriterOptions {
                io_granularity: 3,
                ..WriterOptions::default()
            },
        );
        let mut dest = Trickle::new(1024);
        send_all(&mut writer, &mut dest);
        assert!(dest.data.ends_with(b"\r\n\r\n0123456789"));
    }

    #[test]
    fn test_short_stream_is_an_error() {
        let body = Body::from_reader(Cursor::new(b"abc".to_vec()), None);
        let mut req = request(Method::Post, body, &[("Content-Length", "10")]);
        let mut writer = RequestWriter::new(&mut req, WriterOptions::default());
        let mut dest = Vec::new();
        assert!(matches!(writer.send(&mut dest), Err(Error::InvalidRequest(_))));
    }

    #[test]
    fn test_trace_sends_no_body() {
        let mut req = request(Method::Trace, Body::from("ignored"), &[]);
        let mut writer = RequestWriter::new(&mut req, WriterOptions::default());
        let mut dest = Vec::new();
        assert_eq!(writer.send(&mut dest).unwrap(), WriteStatus::Complete);
        assert_eq!(dest, b"TRACE /upload?x=1 HTTP/1.1\r\n\r\n");
    }

    #[test]
    fn test_expect_continue_pauses() {
        let mut req = request(
            Method::Post,
            Body::from("data"),
            &[("Content-Length", "4"), ("Expect", "100-continue")],
        );
        let mut writer = RequestWriter::new(
            &mut req,
            WriterOptions {
                continue_delay: Duration::from_secs(60),
                ..WriterOptions::default()
            },
        );
        let mut dest = Vec::new();

        assert_eq!(writer.send(&mut dest).unwrap(), WriteStatus::Pending);
        assert_eq!(writer.state(), WriterState::AwaitingContinue);
        assert!(writer.continue_deadline().is_some());
        assert!(dest.ends_with(b"\r\n\r\n"));

        writer.allow_continue();
        assert_eq!(writer.send(&mut dest).unwrap(), WriteStatus::Complete);
        assert!(dest.ends_with(b"\r\n\r\ndata"));
    }

    #[test]
    fn test_expect_continue_delay_elapses() {
        let mut req = request(
            Method::Post,
            Body::from("data"),
            &[("Content-Length", "4"), ("Expect", "100-continue")],
        );
        let mut writer = RequestWriter::new(
            &mut req,
            WriterOptions {
                continue_delay: Duration::ZERO,
                ..WriterOptions::default()
            },
        );
        let mut dest = Vec::new();
        assert_eq!(writer.send(&mut dest).unwrap(), WriteStatus::Complete);
        assert!(dest.ends_with(b"data"));
    }

    #[test]
    fn test_skip_body() {
        let mut req = request(
            Method::Post,
            Body::from("data"),
            &[("Content-Length", "4"), ("Expect", "100-continue")],
        );
        let mut writer = RequestWriter::new(
            &mut req,
            WriterOptions {
                continue_delay: Duration::from_secs(60),
                ..WriterOptions::default()
            },
        );
        let mut dest = Vec::new();
        writer.send(&mut dest).unwrap();
        writer.skip_body();
        assert_eq!(writer.send(&mut dest).unwrap(), WriteStatus::Complete);
        assert!(!dest.ends_with(b"data"));
        assert!(writer.into_body().len() == Some(4));
    }

    #[test]
    fn test_closed_destination() {
        struct Closed(io::ErrorKind);
        impl Write for Closed {
            fn write(&mut self, _: &[u8]) -> io::Result<usize> {
                match self.0 {
                    io::ErrorKind::Other => Ok(0),
                    kind => Err(kind.into()),
                }
            }
            fn flush(&mut self) -> io::Result<()> {
                Ok(())
            }
        }

        let mut req = request(Method::Get, Body::Empty, &[]);
        let mut writer = RequestWriter::new(&mut req, WriterOptions::default());
        assert!(matches!(
            writer.send(&mut Closed(io::ErrorKind::Other)),
            Err(Error::WriteClosed)
        ));

        let mut req = request(Method::Get, Body::Empty, &[]);
        let mut writer = RequestWriter::new(&mut req, WriterOptions::default());
        assert!(matches!(
            writer.send(&mut Closed(io::ErrorKind::BrokenPipe)),
            Err(Error::WriteClosed)
        ));

        let mut req = request(Method::Get, Body::Empty, &[]);
        let mut writer = RequestWriter::new(&mut req, WriterOptions::default());
        assert!(matches!(
            writer.send(&mut Closed(io::ErrorKind::PermissionDenied)),
            Err(Error::Write(_))
        ));
    }
}
