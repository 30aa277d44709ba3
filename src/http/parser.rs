//! HTTP response parsing
//!
//! [`ResponseParser`] is a state machine over the [`Symbol`] stream of a
//! [`Tokenizer`]. The message head is parsed one classified byte at a time.
//! Once the head is complete the body framing is chosen and the tokenizer
//! is switched to block reads sized to what remains of the body or chunk.
//!
//! The parser never blocks: [`ResponseParser::parse`] returns `Ok(None)`
//! while the message is incomplete and the stream is still open.

use super::body::BodySink;
use super::tokenizer::{ByteClass, Granularity, Symbol, Tokenizer};
use super::{Error, Headers, Response, ResponseBody, Result, Status, Version, MAX_HEADER_BYTES};
use std::fmt;

/// Grammar site of a parse failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ParseErrorKind {
    StartLine,
    HeaderToken,
    HeaderValue,
    ContentLength,
    ChunkSize,
    ChunkTerminator,
    Trailer,
    UnexpectedEof,
    HeaderTooLarge,
}

impl ParseErrorKind {
    /// Stable numeric code
    pub fn code(&self) -> u8 {
        match self {
            ParseErrorKind::StartLine => 1,
            ParseErrorKind::HeaderToken => 2,
            ParseErrorKind::HeaderValue => 3,
            ParseErrorKind::ContentLength => 4,
            ParseErrorKind::ChunkSize => 5,
            ParseErrorKind::ChunkTerminator => 6,
            ParseErrorKind::Trailer => 7,
            ParseErrorKind::UnexpectedEof => 8,
            ParseErrorKind::HeaderTooLarge => 9,
        }
    }
}

impl fmt::Display for ParseErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            ParseErrorKind::StartLine => "malformed status line",
            ParseErrorKind::HeaderToken => "malformed header name",
            ParseErrorKind::HeaderValue => "malformed header value",
            ParseErrorKind::ContentLength => "invalid Content-Length",
            ParseErrorKind::ChunkSize => "malformed chunk size",
            ParseErrorKind::ChunkTerminator => "missing CRLF after chunk data",
            ParseErrorKind::Trailer => "malformed trailer",
            ParseErrorKind::UnexpectedEof => "unexpected end of stream",
            ParseErrorKind::HeaderTooLarge => "header section too large",
        };
        f.write_str(text)
    }
}

/// Parse failure with the stream offset where it was detected
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{} (code {}) at offset {}", .kind, .kind.code(), .offset)]
pub struct ParseError {
    pub kind: ParseErrorKind,
    pub offset: u64,
}

impl ParseError {
    pub fn new(kind: ParseErrorKind, offset: u64) -> Self {
        ParseError { kind, offset }
    }
}

/// How the body of a response is delimited
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyMode {
    /// No body: 1xx, 204, 304 or a response to HEAD
    Empty,
    /// Exactly this many bytes
    ContentLength(u64),
    /// Chunked transfer-coding
    Chunked,
    /// Until the peer closes the connection
    UntilClose,
}

/// Body progress of the message being parsed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BodyStats {
    pub mode: Option<BodyMode>,
    pub received: u64,
}

/// Parser settings
#[derive(Debug, Clone)]
pub struct ParserOptions {
    /// Reject bare LF line endings, control characters in values and
    /// repeated spaces in the status line
    pub strict: bool,
    /// Upper bound for one body block read
    pub io_granularity: usize,
    /// Body size kept in memory before spilling to a temporary file
    pub spool_threshold: usize,
    /// Read spilled bodies back into memory once complete
    pub buffer_body: bool,
}

impl Default for ParserOptions {
    fn default() -> Self {
        ParserOptions {
            strict: false,
            io_granularity: 16 * 1024,
            spool_threshold: 2 * 1024 * 1024,
            buffer_body: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Section {
    Head,
    Trailer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Start,
    StartLf,
    Version,
    StatusCode,
    Reason,
    StartLineLf,
    HeaderLineStart,
    HeaderName,
    HeaderValueStart,
    HeaderValue,
    HeaderLf,
    SectionEndLf,
    ContentLength,
    UntilClose,
    ChunkSize,
    ChunkExt,
    ChunkSizeLf,
    ChunkData,
    ChunkDataCr,
    ChunkDataLf,
    Complete,
    Done,
    Failed,
}

impl State {
    fn in_head(self) -> bool {
        matches!(
            self,
            State::Start
                | State::StartLf
                | State::Version
                | State::StatusCode
                | State::Reason
                | State::StartLineLf
                | State::HeaderLineStart
                | State::HeaderName
                | State::HeaderValueStart
                | State::HeaderValue
                | State::HeaderLf
                | State::SectionEndLf
        )
    }
}

/// Incremental HTTP/1.x response parser
pub struct ResponseParser {
    tokenizer: Tokenizer,
    options: ParserOptions,
    state: State,
    section: Section,
    section_start: u64,
    head_request: bool,

    scratch: Vec<u8>,
    pending: Option<(Vec<u8>, Vec<u8>)>,
    version: Version,
    status: Option<Status>,
    reason: String,
    headers: Headers,
    trailers: Headers,

    body_mode: Option<BodyMode>,
    remaining: u64,
    chunk_size: u64,
    chunk_digits: usize,
    sink: Option<BodySink>,
    received: u64,
    digest: Option<String>,
    failure: Option<ParseError>,
}

impl ResponseParser {
    /// Create a parser for a live stream
    pub fn new(options: ParserOptions) -> Self {
        Self::with_tokenizer(Tokenizer::new(), options)
    }

    /// Create a parser over a complete response
    pub fn from_bytes(data: &[u8], options: ParserOptions) -> Self {
        Self::with_tokenizer(Tokenizer::from_bytes(data), options)
    }

    fn with_tokenizer(tokenizer: Tokenizer, options: ParserOptions) -> Self {
        let sink = BodySink::new(options.spool_threshold);
        let section_start = tokenizer.offset();
        ResponseParser {
            tokenizer,
            options,
            state: State::Start,
            section: Section::Head,
            section_start,
            head_request: false,
            scratch: Vec::with_capacity(64),
            pending: None,
            version: Version::Http11,
            status: None,
            reason: String::new(),
            headers: Headers::new(),
            trailers: Headers::new(),
            body_mode: None,
            remaining: 0,
            chunk_size: 0,
            chunk_digits: 0,
            sink: Some(sink),
            received: 0,
            digest: None,
            failure: None,
        }
    }

    /// Append bytes read from the transport
    pub fn feed(&mut self, data: &[u8]) {
        self.tokenizer.feed(data);
    }

    /// Signal that the transport reached end of stream
    pub fn feed_eof(&mut self) {
        self.tokenizer.set_eof();
    }

    /// The response answers a HEAD request and carries no body
    pub fn set_head_request(&mut self, head: bool) {
        self.head_request = head;
    }

    /// Prepare for the next message, keeping unconsumed input
    pub fn reset(&mut self) {
        self.tokenizer.set_granularity(Granularity::Byte);
        self.state = State::Start;
        self.section = Section::Head;
        self.section_start = self.tokenizer.offset();
        self.scratch.clear();
        self.pending = None;
        self.version = Version::Http11;
        self.status = None;
        self.reason.clear();
        self.headers = Headers::new();
        self.trailers = Headers::new();
        self.body_mode = None;
        self.remaining = 0;
        self.chunk_size = 0;
        self.chunk_digits = 0;
        self.sink = Some(BodySink::new(self.options.spool_threshold));
        self.received = 0;
        self.digest = None;
        self.failure = None;
    }

    /// Drive the state machine over the available input
    ///
    /// Returns `Ok(Some(response))` once a message is complete and
    /// `Ok(None)` while more input is needed.
    pub fn parse(&mut self) -> Result<Option<Response>> {
        loop {
            match self.state {
                State::Complete => return self.finish().map(Some),
                State::Done => return Ok(None),
                State::Failed => {
                    let failure = self.failure.clone().unwrap_or_else(|| {
                        ParseError::new(ParseErrorKind::UnexpectedEof, self.offset())
                    });
                    return Err(Error::Parse(failure));
                }
                _ => {}
            }

            let offset = self.tokenizer.offset();
            let symbol = match self.tokenizer.current() {
                Some(symbol) => symbol,
                None => return Ok(None),
            };
            self.tokenizer.next();

            if let Err(err) = self.handle(symbol, offset) {
                self.state = State::Failed;
                if let Error::Parse(failure) = &err {
                    self.failure = Some(failure.clone());
                }
                return Err(err);
            }
        }
    }

    /// Body framing, once the head is parsed
    pub fn body_mode(&self) -> Option<BodyMode> {
        self.body_mode
    }

    /// Status of the message being parsed, once the status line is read
    pub fn status(&self) -> Option<Status> {
        self.status
    }

    /// Whether the status line and headers are complete
    pub fn head_complete(&self) -> bool {
        self.body_mode.is_some()
    }

    /// Body progress of the current message
    pub fn body_stats(&self) -> BodyStats {
        BodyStats {
            mode: self.body_mode,
            received: self.received,
        }
    }

    /// Base64 MD5 of the last completed body, when it declared Content-MD5
    pub fn body_digest(&self) -> Option<&str> {
        self.digest.as_deref()
    }

    /// Input received past the end of the current message
    pub fn buffered(&self) -> usize {
        self.tokenizer.buffered()
    }

    /// Stream offset of the next unconsumed byte
    pub fn offset(&self) -> u64 {
        self.tokenizer.offset()
    }

    /// Skip the head and parse a bare body with the given framing
    pub(crate) fn start_body(&mut self, mode: BodyMode) {
        self.status = Some(Status::OK);
        self.enter_body(mode);
    }

    fn handle(&mut self, symbol: Symbol, offset: u64) -> Result<()> {
        match symbol {
            Symbol::Eof => self.handle_eof(offset),
            Symbol::Block(block) => self.handle_block(&block),
            Symbol::Byte(class, byte) => self.handle_byte(class, byte, offset),
        }
    }

    fn handle_byte(&mut self, class: ByteClass, byte: u8, offset: u64) -> Result<()> {
        if self.state.in_head() && offset - self.section_start >= MAX_HEADER_BYTES as u64 {
            return Err(self.error(ParseErrorKind::HeaderTooLarge, offset));
        }

        let strict = self.options.strict;

        match self.state {
            State::Start => match class {
                ByteClass::Cr => self.state = State::StartLf,
                ByteClass::Lf if !strict => {}
                _ if class.is_token_char() => {
                    self.scratch.clear();
                    self.scratch.push(byte);
                    self.state = State::Version;
                }
                _ => return Err(self.error(ParseErrorKind::StartLine, offset)),
            },

            State::StartLf => match class {
                ByteClass::Lf => self.state = State::Start,
                _ => return Err(self.error(ParseErrorKind::StartLine, offset)),
            },

            State::Version => match class {
                ByteClass::Sp => {
                    self.version = self.parse_version(offset)?;
                    self.scratch.clear();
                    self.state = State::StatusCode;
                }
                _ if (class.is_token_char() || byte == b'/') && self.scratch.len() < 16 => {
                    self.scratch.push(byte);
                }
                _ => return Err(self.error(ParseErrorKind::StartLine, offset)),
            },

            State::StatusCode => match class {
                ByteClass::Digit if self.scratch.len() < 3 => self.scratch.push(byte),
                ByteClass::Sp if self.scratch.is_empty() && !strict => {}
                ByteClass::Sp if self.scratch.len() == 3 => {
                    self.status = Some(self.parse_status(offset)?);
                    self.scratch.clear();
                    self.state = State::Reason;
                }
                ByteClass::Cr if self.scratch.len() == 3 => {
                    self.status = Some(self.parse_status(offset)?);
                    self.state = State::StartLineLf;
                }
                ByteClass::Lf if self.scratch.len() == 3 && !strict => {
                    self.status = Some(self.parse_status(offset)?);
                    self.state = State::HeaderLineStart;
                }
                _ => return Err(self.error(ParseErrorKind::StartLine, offset)),
            },

            State::Reason => match class {
                ByteClass::Cr => {
                    self.take_reason();
                    self.state = State::StartLineLf;
                }
                ByteClass::Lf if !strict => {
                    self.take_reason();
                    self.state = State::HeaderLineStart;
                }
                _ if !strict || class.is_text() || class == ByteClass::Ht => {
                    self.scratch.push(byte)
                }
                _ => return Err(self.error(ParseErrorKind::StartLine, offset)),
            },

            State::StartLineLf => match class {
                ByteClass::Lf => self.state = State::HeaderLineStart,
                _ => return Err(self.error(ParseErrorKind::StartLine, offset)),
            },

            State::HeaderLineStart => match class {
                ByteClass::Cr => {
                    self.commit_header();
                    self.state = State::SectionEndLf;
                }
                ByteClass::Lf if !strict => {
                    self.commit_header();
                    self.end_section(offset)?;
                }
                ByteClass::Sp | ByteClass::Ht => match self.pending.as_mut() {
                    // obs-fold: the line continues the previous value
                    Some((_, value)) => {
                        trim_trailing_whitespace(value);
                        value.push(b' ');
                        self.state = State::HeaderValueStart;
                    }
                    None => return Err(self.header_error(ParseErrorKind::HeaderToken, offset)),
                },
                _ if class.is_token_char() => {
                    self.commit_header();
                    self.pending = Some((vec![byte], Vec::new()));
                    self.state = State::HeaderName;
                }
                _ => return Err(self.header_error(ParseErrorKind::HeaderToken, offset)),
            },

            State::HeaderName => match class {
                ByteClass::Separator if byte == b':' => self.state = State::HeaderValueStart,
                _ if class.is_token_char() => {
                    if let Some((name, _)) = self.pending.as_mut() {
                        name.push(byte);
                    }
                }
                _ => return Err(self.header_error(ParseErrorKind::HeaderToken, offset)),
            },

            State::HeaderValueStart => match class {
                ByteClass::Sp | ByteClass::Ht => {}
                ByteClass::Cr => self.state = State::HeaderLf,
                ByteClass::Lf if !strict => self.state = State::HeaderLineStart,
                _ => {
                    self.push_value(class, byte, offset)?;
                    self.state = State::HeaderValue;
                }
            },

            State::HeaderValue => match class {
                ByteClass::Cr => self.state = State::HeaderLf,
                ByteClass::Lf if !strict => self.state = State::HeaderLineStart,
                _ => self.push_value(class, byte, offset)?,
            },

            State::HeaderLf => match class {
                ByteClass::Lf => self.state = State::HeaderLineStart,
                _ => return Err(self.header_error(ParseErrorKind::HeaderValue, offset)),
            },

            State::SectionEndLf => match class {
                ByteClass::Lf => self.end_section(offset)?,
                _ => return Err(self.header_error(ParseErrorKind::HeaderToken, offset)),
            },

            State::ChunkSize => match class {
                _ if class.is_hex() => {
                    let digit = hex_value(byte);
                    self.chunk_size = self
                        .chunk_size
                        .checked_mul(16)
                        .and_then(|v| v.checked_add(digit))
                        .ok_or_else(|| self.error(ParseErrorKind::ChunkSize, offset))?;
                    self.chunk_digits += 1;
                }
                ByteClass::Separator if byte == b';' && self.chunk_digits > 0 => {
                    self.state = State::ChunkExt
                }
                ByteClass::Sp | ByteClass::Ht if self.chunk_digits > 0 && !strict => {
                    self.state = State::ChunkExt
                }
                ByteClass::Cr if self.chunk_digits > 0 => self.state = State::ChunkSizeLf,
                ByteClass::Lf if self.chunk_digits > 0 && !strict => self.start_chunk(offset),
                _ => return Err(self.error(ParseErrorKind::ChunkSize, offset)),
            },

            State::ChunkExt => match class {
                ByteClass::Cr => self.state = State::ChunkSizeLf,
                ByteClass::Lf if !strict => self.start_chunk(offset),
                ByteClass::Ctl | ByteClass::Lf => {
                    return Err(self.error(ParseErrorKind::ChunkSize, offset))
                }
                _ => {}
            },

            State::ChunkSizeLf => match class {
                ByteClass::Lf => self.start_chunk(offset),
                _ => return Err(self.error(ParseErrorKind::ChunkSize, offset)),
            },

            State::ChunkDataCr => match class {
                ByteClass::Cr => self.state = State::ChunkDataLf,
                ByteClass::Lf if !strict => self.next_chunk(),
                _ => return Err(self.error(ParseErrorKind::ChunkTerminator, offset)),
            },

            State::ChunkDataLf => match class {
                ByteClass::Lf => self.next_chunk(),
                _ => return Err(self.error(ParseErrorKind::ChunkTerminator, offset)),
            },

            State::ContentLength
            | State::UntilClose
            | State::ChunkData
            | State::Complete
            | State::Done
            | State::Failed => {
                debug_assert!(false, "byte symbol in state {:?}", self.state);
            }
        }

        Ok(())
    }

    fn handle_block(&mut self, block: &[u8]) -> Result<()> {
        match self.state {
            State::ContentLength => {
                self.write_body(block)?;
                self.remaining -= block.len() as u64;
                if self.remaining == 0 {
                    self.state = State::Complete;
                } else {
                    self.tokenizer.set_granularity(self.block_for(self.remaining));
                }
            }
            State::UntilClose => self.write_body(block)?,
            State::ChunkData => {
                self.write_body(block)?;
                self.remaining -= block.len() as u64;
                if self.remaining == 0 {
                    self.tokenizer.set_granularity(Granularity::Byte);
                    self.state = State::ChunkDataCr;
                } else {
                    self.tokenizer.set_granularity(self.block_for(self.remaining));
                }
            }
            _ => debug_assert!(false, "block symbol in state {:?}", self.state),
        }
        Ok(())
    }

    fn handle_eof(&mut self, offset: u64) -> Result<()> {
        match self.state {
            State::UntilClose => self.state = State::Complete,
            // the peer closed after the last chunk without ending the trailer
            State::HeaderLineStart if self.section == Section::Trailer => {
                self.commit_header();
                self.state = State::Complete;
            }
            _ => return Err(self.error(ParseErrorKind::UnexpectedEof, offset)),
        }
        Ok(())
    }

    fn end_section(&mut self, offset: u64) -> Result<()> {
        match self.section {
            Section::Head => self.finish_head(offset),
            Section::Trailer => {
                self.state = State::Complete;
                Ok(())
            }
        }
    }

    fn finish_head(&mut self, offset: u64) -> Result<()> {
        let status = match self.status {
            Some(status) => status,
            None => return Err(self.error(ParseErrorKind::StartLine, offset)),
        };

        let mode = if self.head_request || status.forbids_body() {
            BodyMode::Empty
        } else if self.is_chunked() {
            BodyMode::Chunked
        } else if let Some(len) = self.content_length(offset)? {
            BodyMode::ContentLength(len)
        } else {
            BodyMode::UntilClose
        };

        if mode != BodyMode::Empty && self.headers.contains("Content-MD5") {
            if let Some(sink) = self.sink.as_mut() {
                sink.enable_md5()?;
            }
        }

        log::trace!("< {} {} ({:?})", self.version, status, mode);
        self.enter_body(mode);
        Ok(())
    }

    fn enter_body(&mut self, mode: BodyMode) {
        self.body_mode = Some(mode);
        match mode {
            BodyMode::Empty | BodyMode::ContentLength(0) => self.state = State::Complete,
            BodyMode::ContentLength(len) => {
                self.remaining = len;
                self.state = State::ContentLength;
                self.tokenizer.set_granularity(self.block_for(len));
            }
            BodyMode::Chunked => self.next_chunk(),
            BodyMode::UntilClose => {
                self.state = State::UntilClose;
                self.tokenizer
                    .set_granularity(Granularity::Block(self.options.io_granularity.max(1)));
            }
        }
    }

    fn is_chunked(&self) -> bool {
        self.headers
            .get_all("Transfer-Encoding")
            .iter()
            .flat_map(|v| v.split(','))
            .map(str::trim)
            .any(|coding| !coding.is_empty() && !coding.eq_ignore_ascii_case("identity"))
    }

    /// Parse Content-Length, accepting repeated values only when equal
    fn content_length(&self, offset: u64) -> Result<Option<u64>> {
        let mut length = None;
        for value in self.headers.get_all("Content-Length") {
            for part in value.split(',') {
                let part = part.trim();
                if part.is_empty() || !part.bytes().all(|b| b.is_ascii_digit()) {
                    return Err(self.error(ParseErrorKind::ContentLength, offset));
                }
                let parsed = part
                    .parse::<u64>()
                    .map_err(|_| self.error(ParseErrorKind::ContentLength, offset))?;
                match length {
                    Some(existing) if existing != parsed => {
                        return Err(self.error(ParseErrorKind::ContentLength, offset))
                    }
                    _ => length = Some(parsed),
                }
            }
        }
        Ok(length)
    }

    fn start_chunk(&mut self, offset: u64) {
        if self.chunk_size == 0 {
            self.section = Section::Trailer;
            self.section_start = offset + 1;
            self.state = State::HeaderLineStart;
        } else {
            self.remaining = self.chunk_size;
            self.state = State::ChunkData;
            self.tokenizer.set_granularity(self.block_for(self.remaining));
        }
    }

    fn next_chunk(&mut self) {
        self.chunk_size = 0;
        self.chunk_digits = 0;
        self.state = State::ChunkSize;
    }

    fn block_for(&self, remaining: u64) -> Granularity {
        let max = self.options.io_granularity.max(1) as u64;
        Granularity::Block(remaining.min(max) as usize)
    }

    fn write_body(&mut self, data: &[u8]) -> Result<()> {
        if let Some(sink) = self.sink.as_mut() {
            sink.write(data)?;
        }
        self.received += data.len() as u64;
        Ok(())
    }

    fn push_value(&mut self, class: ByteClass, byte: u8, offset: u64) -> Result<()> {
        let allowed = match class {
            ByteClass::Lf | ByteClass::Cr => false,
            ByteClass::Ctl => !self.options.strict,
            _ => true,
        };
        if !allowed {
            return Err(self.header_error(ParseErrorKind::HeaderValue, offset));
        }
        if let Some((_, value)) = self.pending.as_mut() {
            value.push(byte);
        }
        Ok(())
    }

    fn commit_header(&mut self) {
        if let Some((name, value)) = self.pending.take() {
            let name = latin1(&name);
            let value = latin1(&value).trim_matches(is_ows).to_string();
            match self.section {
                Section::Head => self.headers.append(name, value),
                Section::Trailer => self.trailers.append(name, value),
            }
        }
    }

    fn take_reason(&mut self) {
        let reason = latin1(&self.scratch);
        self.reason = if self.options.strict {
            reason
        } else {
            reason.trim_matches(is_ows).to_string()
        };
        self.scratch.clear();
    }

    fn parse_version(&self, offset: u64) -> Result<Version> {
        let text = &self.scratch;
        let has_prefix = if self.options.strict {
            text.starts_with(b"HTTP/")
        } else {
            text.len() >= 5 && text[..5].eq_ignore_ascii_case(b"HTTP/")
        };
        if !has_prefix {
            return Err(self.error(ParseErrorKind::StartLine, offset));
        }

        let numbers = std::str::from_utf8(&text[5..])
            .map_err(|_| self.error(ParseErrorKind::StartLine, offset))?;
        let (major, minor) = numbers
            .split_once('.')
            .ok_or_else(|| self.error(ParseErrorKind::StartLine, offset))?;
        let start_line = || self.error(ParseErrorKind::StartLine, offset);
        let major = parse_digits(major).ok_or_else(start_line)?;
        let minor = parse_digits(minor).ok_or_else(start_line)?;

        Version::from_parts(major, minor).ok_or_else(start_line)
    }

    fn parse_status(&self, offset: u64) -> Result<Status> {
        let code = self
            .scratch
            .iter()
            .fold(0u16, |acc, b| acc * 10 + (b - b'0') as u16);
        Status::new(code).ok_or_else(|| self.error(ParseErrorKind::StartLine, offset))
    }

    fn error(&self, kind: ParseErrorKind, offset: u64) -> Error {
        Error::Parse(ParseError::new(kind, offset))
    }

    fn header_error(&self, kind: ParseErrorKind, offset: u64) -> Error {
        match self.section {
            Section::Head => self.error(kind, offset),
            Section::Trailer => self.error(ParseErrorKind::Trailer, offset),
        }
    }

    fn finish(&mut self) -> Result<Response> {
        self.state = State::Done;

        let (body, digest) = match self.sink.take() {
            Some(sink) => sink.finish(self.options.buffer_body)?,
            None => (ResponseBody::empty(), None),
        };
        self.digest = digest;

        let status = self.status.unwrap_or(Status::OK);
        Ok(Response::builder()
            .version(self.version)
            .status(status)
            .reason(std::mem::take(&mut self.reason))
            .headers(std::mem::take(&mut self.headers))
            .trailers(std::mem::take(&mut self.trailers))
            .body(body)
            .build())
    }
}

impl fmt::Debug for ResponseParser {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResponseParser")
            .field("state", &self.state)
            .field("body_mode", &self.body_mode)
            .field("received", &self.received)
            .field("offset", &self.tokenizer.offset())
            .finish()
    }
}

/// Decode field bytes one char per byte, so obs-text survives and the
/// original bytes are `value.chars().map(|c| c as u8)`
fn latin1(bytes: &[u8]) -> String {
    bytes.iter().map(|&b| b as char).collect()
}

fn is_ows(c: char) -> bool {
    c == ' ' || c == '\t'
}

fn parse_digits(s: &str) -> Option<u32> {
    if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    s.parse().ok()
}

fn hex_value(byte: u8) -> u64 {
    match byte {
        b'0'..=b'9' => (byte - b'0') as u64,
        b'a'..=b'f' => (byte - b'a' + 10) as u64,
        b'A'..=b'F' => (byte - b'A' + 10) as u64,
        _ => 0,
    }
}

fn trim_trailing_whitespace(value: &mut Vec<u8>) {
    while matches!(value.last(), Some(b' ') | Some(b'\t')) {
        value.pop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn parse_all(data: &[u8]) -> Result<Option<Response>> {
        ResponseParser::from_bytes(data, ParserOptions::default()).parse()
    }

    fn parse_ok(data: &[u8]) -> Response {
        match parse_all(data) {
            Ok(Some(response)) => response,
            other => panic!("expected a response, got {:?}", other),
        }
    }

    fn parse_kind(data: &[u8]) -> ParseErrorKind {
        match parse_all(data) {
            Err(Error::Parse(err)) => err.kind,
            other => panic!("expected a parse error, got {:?}", other),
        }
    }

    #[test]
    fn test_simple_response() {
        let resp = parse_ok(b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\nX-A: b\r\n\r\nhello");
        assert_eq!(resp.version(), Version::Http11);
        assert_eq!(resp.status().code(), 200);
        assert_eq!(resp.reason(), "OK");
        assert_eq!(resp.headers().get("x-a"), Some("b"));
        assert_eq!(resp.body().as_bytes(), Some(&b"hello"[..]));
    }

    #[test]
    fn test_leading_crlf_and_empty_reason() {
        let resp = parse_ok(b"\r\n\r\nHTTP/1.0 404\r\nContent-Length: 0\r\n\r\n");
        assert_eq!(resp.version(), Version::Http10);
        assert_eq!(resp.status().code(), 404);
        assert_eq!(resp.reason(), "");
    }

    #[test]
    fn test_header_folding() {
        let resp = parse_ok(
            b"HTTP/1.1 200 OK\r\nX-Long: first\r\n   second \r\n\tthird\r\nContent-Length: 0\r\n\r\n",
        );
        assert_eq!(resp.headers().get("X-Long"), Some("first second third"));
    }

    #[test]
    fn test_repeated_headers() {
        let resp = parse_ok(b"HTTP/1.1 200 OK\r\nVary: a\r\nVary: b\r\nContent-Length: 0\r\n\r\n");
        assert_eq!(resp.headers().get_all("Vary"), vec!["a", "b"]);
        assert_eq!(resp.headers().get_joined("Vary").as_deref(), Some("a,b"));
    }

    #[test]
    fn test_chunked_with_trailers() {
        let resp = parse_ok(
            b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n\
              5;ext=1\r\nhello\r\n6\r\n world\r\n0\r\nX-Checksum: abc\r\n\r\n",
        );
        assert_eq!(resp.body().as_bytes(), Some(&b"hello world"[..]));
        assert_eq!(resp.trailers().get("X-Checksum"), Some("abc"));
    }

    #[test]
    fn test_chunked_eof_after_last_chunk() {
        let resp =
            parse_ok(b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n3\r\nabc\r\n0\r\n");
        assert_eq!(resp.body().as_bytes(), Some(&b"abc"[..]));
    }

    #[test]
    fn test_read_until_close() {
        let resp = parse_ok(b"HTTP/1.0 200 OK\r\n\r\nstreamed until close");
        assert_eq!(resp.body().as_bytes(), Some(&b"streamed until close"[..]));
    }

    #[test]
    fn test_body_forbidden_statuses() {
        for head in [
            &b"HTTP/1.1 204 No Content\r\nContent-Length: 10\r\n\r\n"[..],
            &b"HTTP/1.1 304 Not Modified\r\nContent-Length: 10\r\n\r\n"[..],
        ] {
            let mut data = head.to_vec();
            data.extend_from_slice(b"trailing garbage");
            let mut parser = ResponseParser::new(ParserOptions::default());
            parser.feed(&data);

            let resp = parser.parse().unwrap().unwrap();
            assert!(resp.body().is_empty());
            assert_eq!(parser.buffered(), b"trailing garbage".len());
        }
    }

    #[test]
    fn test_head_response() {
        let mut parser = ResponseParser::new(ParserOptions::default());
        parser.set_head_request(true);
        parser.feed(b"HTTP/1.1 200 OK\r\nContent-Length: 1000\r\n\r\nextra");

        let resp = parser.parse().unwrap().unwrap();
        assert!(resp.body().is_empty());
        assert_eq!(parser.body_mode(), Some(BodyMode::Empty));
        assert_eq!(parser.buffered(), 5);
    }

    #[test]
    fn test_incomplete_returns_none() {
        let mut parser = ResponseParser::new(ParserOptions::default());
        parser.feed(b"HTTP/1.1 200 OK\r\nContent-Length: 10\r\n\r\nhel");
        assert!(parser.parse().unwrap().is_none());
        assert!(parser.head_complete());
        assert_eq!(parser.body_stats().received, 3);

        parser.feed(b"lo wor");
        assert!(parser.parse().unwrap().is_none());
        parser.feed(b"ld");
        let resp = parser.parse().unwrap().unwrap();
        assert_eq!(resp.body().as_bytes(), Some(&b"hello worl"[..]));
        assert_eq!(parser.buffered(), 1);
    }

    #[test]
    fn test_fragmented_matches_whole() {
        let input: &[u8] = b"HTTP/1.1 201 Created\r\nX-A: 1\r\nX-Fold: a\r\n b\r\n\
            Transfer-Encoding: chunked\r\n\r\n4\r\nWiki\r\n5\r\npedia\r\n0\r\nT: v\r\n\r\n";

        let whole = parse_ok(input);

        let mut parser = ResponseParser::new(ParserOptions {
            io_granularity: 3,
            ..ParserOptions::default()
        });
        let mut fragmented = None;
        for b in input {
            parser.feed(&[*b]);
            if let Some(resp) = parser.parse().unwrap() {
                fragmented = Some(resp);
            }
        }
        let fragmented = fragmented.expect("fragmented parse completes");

        assert_eq!(fragmented.status(), whole.status());
        assert_eq!(fragmented.reason(), whole.reason());
        assert_eq!(fragmented.headers(), whole.headers());
        assert_eq!(fragmented.trailers(), whole.trailers());
        assert_eq!(fragmented.body().as_bytes(), whole.body().as_bytes());
        assert_eq!(whole.body().as_bytes(), Some(&b"Wikipedia"[..]));
    }

    #[test]
    fn test_error_codes() {
        assert_eq!(parse_kind(b"HTTX/1.1 200 OK\r\n\r\n"), ParseErrorKind::StartLine);
        assert_eq!(parse_kind(b"HTTP/1.1 20 OK\r\n\r\n"), ParseErrorKind::StartLine);
        assert_eq!(parse_kind(b"HTTP/2.0 200 OK\r\n\r\n"), ParseErrorKind::StartLine);
        assert_eq!(
            parse_kind(b"HTTP/1.1 200 OK\r\nBad Name: x\r\n\r\n"),
            ParseErrorKind::HeaderToken
        );
        assert_eq!(
            parse_kind(b"HTTP/1.1 200 OK\r\n folded: x\r\n\r\n"),
            ParseErrorKind::HeaderToken
        );
        assert_eq!(parse_kind(b"HTTP/1.1 200 OK\r\nA: b\rc\r\n\r\n"), ParseErrorKind::HeaderValue);
        assert_eq!(
            parse_kind(b"HTTP/1.1 200 OK\r\nContent-Length: 12abc\r\n\r\n"),
            ParseErrorKind::ContentLength
        );
        assert_eq!(
            parse_kind(b"HTTP/1.1 200 OK\r\nContent-Length: 3\r\nContent-Length: 4\r\n\r\nabcd"),
            ParseErrorKind::ContentLength
        );
        assert_eq!(
            parse_kind(b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\nzz\r\n"),
            ParseErrorKind::ChunkSize
        );
        assert_eq!(
            parse_kind(b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n3\r\nabcX\r\n0\r\n\r\n"),
            ParseErrorKind::ChunkTerminator
        );
        assert_eq!(
            parse_kind(b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n0\r\nbad trailer\r\n\r\n"),
            ParseErrorKind::Trailer
        );
        assert_eq!(
            parse_kind(b"HTTP/1.1 200 OK\r\nContent-Length: 10\r\n\r\nshort"),
            ParseErrorKind::UnexpectedEof
        );
        assert_eq!(ParseErrorKind::UnexpectedEof.code(), 8);
    }

    #[test]
    fn test_error_offset() {
        match parse_all(b"HTTP/1.1 200 OK\r\nA\x01: b\r\n\r\n") {
            Err(Error::Parse(err)) => {
                assert_eq!(err.kind, ParseErrorKind::HeaderToken);
                assert_eq!(err.offset, 18);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_content_length_must_be_digits() {
        for value in ["+3", "-3", "3 3", "0x3"] {
            let data = format!("HTTP/1.1 200 OK\r\nContent-Length: {}\r\n\r\nabc", value);
            assert_eq!(
                parse_kind(data.as_bytes()),
                ParseErrorKind::ContentLength,
                "{:?}",
                value
            );
        }
    }

    #[test]
    fn test_obs_text_is_kept() {
        let resp =
            parse_ok(b"HTTP/1.1 200 Caf\xe9\r\nX-L: caf\xe9\xa0\r\nContent-Length: 0\r\n\r\n");
        assert_eq!(resp.reason(), "Caf\u{e9}");

        let value = resp.headers().get("X-L").unwrap();
        assert_eq!(value, "caf\u{e9}\u{a0}");
        let raw: Vec<u8> = value.chars().map(|c| c as u8).collect();
        assert_eq!(raw, b"caf\xe9\xa0");
    }

    #[test]
    fn test_duplicate_equal_content_length() {
        let resp = parse_ok(b"HTTP/1.1 200 OK\r\nContent-Length: 3, 3\r\n\r\nabc");
        assert_eq!(resp.body().as_bytes(), Some(&b"abc"[..]));
    }

    #[test]
    fn test_strict_rejects_bare_lf() {
        let data = b"HTTP/1.1 200 OK\nContent-Length: 0\n\n";
        assert!(parse_all(data).unwrap().is_some());

        let mut strict = ResponseParser::from_bytes(
            data,
            ParserOptions {
                strict: true,
                ..ParserOptions::default()
            },
        );
        assert!(strict.parse().is_err());
    }

    #[test]
    fn test_header_too_large() {
        let mut data = b"HTTP/1.1 200 OK\r\nX-Big: ".to_vec();
        data.extend(std::iter::repeat(b'a').take(MAX_HEADER_BYTES));
        data.extend_from_slice(b"\r\n\r\n");
        assert_eq!(parse_kind(&data), ParseErrorKind::HeaderTooLarge);
    }

    #[test]
    fn test_interim_then_final() {
        let mut parser = ResponseParser::new(ParserOptions::default());
        parser.feed(b"HTTP/1.1 100 Continue\r\n\r\nHTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok");

        let interim = parser.parse().unwrap().unwrap();
        assert_eq!(interim.status(), Status::CONTINUE);

        parser.reset();
        let resp = parser.parse().unwrap().unwrap();
        assert_eq!(resp.status(), Status::OK);
        assert_eq!(resp.body().as_bytes(), Some(&b"ok"[..]));
    }

    #[test]
    fn test_content_md5_digest() {
        let mut parser = ResponseParser::from_bytes(
            b"HTTP/1.1 200 OK\r\nContent-MD5: XrY7u+Ae7tCTyyK7j1rNww==\r\nContent-Length: 11\r\n\r\nhello world",
            ParserOptions::default(),
        );
        parser.parse().unwrap().unwrap();
        assert_eq!(parser.body_digest(), Some("XrY7u+Ae7tCTyyK7j1rNww=="));
    }

    #[test]
    fn test_spooled_body() {
        let mut data = b"HTTP/1.1 200 OK\r\nContent-Length: 64\r\n\r\n".to_vec();
        data.extend_from_slice(&[b'z'; 64]);

        let mut parser = ResponseParser::from_bytes(
            &data,
            ParserOptions {
                spool_threshold: 16,
                buffer_body: false,
                ..ParserOptions::default()
            },
        );
        let resp = parser.parse().unwrap().unwrap();
        assert!(!resp.body().is_buffered());
        assert_eq!(resp.into_body().into_vec().unwrap(), vec![b'z'; 64]);
    }
}
