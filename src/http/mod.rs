//! HTTP/1.1 client implementation
//!
//! This module provides the wire protocol pieces and the orchestration that
//! drives them over non-blocking sockets.
//!
//! # Architecture
//!
//! Data flows leaf to root:
//!
//! - `Tokenizer` classifies raw octets into grammar symbols, one byte at a
//!   time for the message head and in blocks once a body length is known
//! - `ResponseParser` is a state machine over that symbol stream
//! - `RequestWriter` is the output-side state machine
//! - `ConnectionPool` owns live transports keyed by authority and enforces
//!   the per-host concurrency limit
//! - `Client` owns one lifecycle per in-flight request and multiplexes them
//!   over the pool with a poll-based `Reactor`
//!
//! Transports go through the `SessionOps` trait so plain TCP and TLS share
//! every line of the protocol code.
//!
//! # Examples
//!
//! ```no_run
//! use h1client::http::{Client, ClientConfig, Request, Method};
//!
//! let mut client = Client::new(ClientConfig::default());
//!
//! let request = Request::builder()
//!     .method(Method::Get)
//!     .uri("http://127.0.0.1:8080/")
//!     .build()
//!     .unwrap();
//!
//! let response = client.request(request).unwrap();
//! assert_eq!(response.status().code(), 200);
//! ```

pub mod body;
pub mod chunked;
pub mod client;
pub mod config;
pub mod connector;
pub mod events;
pub mod headers;
pub mod message;
pub mod parser;
pub mod pool;
pub mod reactor;
pub mod session;
pub mod tls;
pub mod tokenizer;
pub mod writer;

pub use body::{Body, BodyStream, ResponseBody};
pub use client::{Client, RequestId, RequestPhase};
pub use config::{ClientConfig, ClientConfigBuilder, FollowPolicy};
pub use connector::{
    Authority, Connector, Established, PendingConnect, Resolver, SystemResolver, TcpConnector,
};
pub use events::{ClientEvent, Flow};
pub use headers::Headers;
pub use message::{Method, Request, Response, Status, TransferStats, Version};
pub use parser::{ParseError, ParseErrorKind, ResponseParser};
pub use pool::{Checkout, ConnectProgress, ConnectionId, ConnectionPool};
pub use session::{FdSessionOps, PollEvents, SessionOps};
pub use tokenizer::{ByteClass, Granularity, Symbol, Tokenizer};
pub use writer::{RequestWriter, WriteStatus, WriterState};

use std::fmt;

/// Result type for HTTP operations
pub type Result<T> = std::result::Result<T, Error>;

/// Phase of a request in which an error occurred
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    Connect,
    Write,
    Read,
    Parse,
    Validate,
    Policy,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Connect => "connect",
            Phase::Write => "write",
            Phase::Read => "read",
            Phase::Parse => "parse",
            Phase::Validate => "validate",
            Phase::Policy => "policy",
        };
        f.write_str(name)
    }
}

/// HTTP operation errors
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("DNS resolution failed: {0}")]
    Dns(String),

    #[error("Connect to {authority} failed: {source}")]
    Connect {
        authority: String,
        #[source]
        source: std::io::Error,
    },

    #[error("TLS error: {0}")]
    Tls(#[from] tls::TlsError),

    #[error("Write failed: {0}")]
    Write(#[source] std::io::Error),

    #[error("Connection lost while writing request")]
    WriteClosed,

    #[error("Read failed: {0}")]
    Read(#[source] std::io::Error),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Parse error: {0}")]
    Parse(#[from] ParseError),

    #[error("Response validation failed: {0}")]
    Validation(#[from] ValidationError),

    #[error("Redirect loop detected: {0}")]
    RedirectLoop(String),

    #[error("Too many redirects ({0})")]
    TooManyRedirects(usize),

    #[error("Timed out during {0}")]
    Timeout(Phase),

    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Request cancelled")]
    Cancelled,
}

impl Error {
    /// The request phase this error belongs to
    pub fn phase(&self) -> Phase {
        match self {
            Error::Dns(_) | Error::Connect { .. } | Error::Tls(_) => Phase::Connect,
            Error::Write(_) | Error::WriteClosed => Phase::Write,
            Error::Io(_) | Error::Read(_) | Error::ConnectionClosed => Phase::Read,
            Error::Parse(_) => Phase::Parse,
            Error::Validation(_) => Phase::Validate,
            Error::Timeout(phase) => *phase,
            Error::RedirectLoop(_)
            | Error::TooManyRedirects(_)
            | Error::InvalidUrl(_)
            | Error::InvalidRequest(_)
            | Error::Cancelled => Phase::Policy,
        }
    }
}

/// Response integrity failures detected after the body is fully read
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("Content-Length declared {declared} bytes, received {actual}")]
    ContentLength { declared: u64, actual: u64 },

    #[error("Content-MD5 declared {declared}, computed {computed}")]
    ContentMd5 { declared: String, computed: String },
}

/// Upper bound on the size of a response head (status line and headers)
pub const MAX_HEADER_BYTES: usize = 64 * 1024;

/// Default HTTP port
pub const DEFAULT_HTTP_PORT: u16 = 80;

/// Default HTTPS port
pub const DEFAULT_HTTPS_PORT: u16 = 443;

/// CRLF line ending
pub const CRLF: &str = "\r\n";
