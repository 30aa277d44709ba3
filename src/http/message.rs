//! HTTP message types
//!
//! This module defines the core types for HTTP requests and responses.

use super::{Body, Error, Headers, ResponseBody, Result, DEFAULT_HTTPS_PORT, DEFAULT_HTTP_PORT};
use std::fmt;
use std::time::{Duration, Instant};
use url::Url;

/// HTTP methods
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Head,
    Post,
    Put,
    Delete,
    Connect,
    Options,
    Trace,
    Patch,
}

impl Method {
    /// Parse method from string
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Result<Self> {
        match s {
            "GET" => Ok(Method::Get),
            "HEAD" => Ok(Method::Head),
            "POST" => Ok(Method::Post),
            "PUT" => Ok(Method::Put),
            "DELETE" => Ok(Method::Delete),
            "CONNECT" => Ok(Method::Connect),
            "OPTIONS" => Ok(Method::Options),
            "TRACE" => Ok(Method::Trace),
            "PATCH" => Ok(Method::Patch),
            _ => Err(Error::InvalidRequest(format!("unknown method {}", s))),
        }
    }

    /// Convert method to string
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Head => "HEAD",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
            Method::Connect => "CONNECT",
            Method::Options => "OPTIONS",
            Method::Trace => "TRACE",
            Method::Patch => "PATCH",
        }
    }

    /// GET and HEAD, the methods redirects follow without opt-in
    pub fn is_safe(&self) -> bool {
        matches!(self, Method::Get | Method::Head)
    }

    /// Methods that conventionally carry an entity body
    pub fn expects_body(&self) -> bool {
        matches!(self, Method::Post | Method::Put | Method::Patch)
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// HTTP version
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub enum Version {
    Http10,
    #[default]
    Http11,
}

impl Version {
    /// Parse version from string
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Result<Self> {
        match s {
            "HTTP/1.0" => Ok(Version::Http10),
            "HTTP/1.1" => Ok(Version::Http11),
            _ => Err(Error::InvalidRequest(format!("unsupported version {}", s))),
        }
    }

    /// Map a parsed `major.minor` pair onto a supported version
    ///
    /// Any 1.x minor above 0 is treated as 1.1.
    pub fn from_parts(major: u32, minor: u32) -> Option<Self> {
        match (major, minor) {
            (1, 0) => Some(Version::Http10),
            (1, _) => Some(Version::Http11),
            _ => None,
        }
    }

    /// Convert version to string
    pub fn as_str(&self) -> &'static str {
        match self {
            Version::Http10 => "HTTP/1.0",
            Version::Http11 => "HTTP/1.1",
        }
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// HTTP status code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Status {
    code: u16,
}

impl Status {
    /// Create a new status code
    pub fn new(code: u16) -> Option<Self> {
        if (100..1000).contains(&code) {
            Some(Status { code })
        } else {
            None
        }
    }

    /// Get the status code
    pub fn code(&self) -> u16 {
        self.code
    }

    /// Get the canonical reason phrase for this status code
    pub fn reason_phrase(&self) -> &'static str {
        match self.code {
            100 => "Continue",
            101 => "Switching Protocols",
            200 => "OK",
            201 => "Created",
            202 => "Accepted",
            203 => "Non-Authoritative Information",
            204 => "No Content",
            205 => "Reset Content",
            206 => "Partial Content",
            300 => "Multiple Choices",
            301 => "Moved Permanently",
            302 => "Found",
            303 => "See Other",
            304 => "Not Modified",
            305 => "Use Proxy",
            307 => "Temporary Redirect",
            308 => "Permanent Redirect",
            400 => "Bad Request",
            401 => "Unauthorized",
            403 => "Forbidden",
            404 => "Not Found",
            405 => "Method Not Allowed",
            408 => "Request Timeout",
            411 => "Length Required",
            413 => "Payload Too Large",
            414 => "URI Too Long",
            417 => "Expectation Failed",
            500 => "Internal Server Error",
            501 => "Not Implemented",
            502 => "Bad Gateway",
            503 => "Service Unavailable",
            504 => "Gateway Timeout",
            505 => "HTTP Version Not Supported",
            _ => "Unknown",
        }
    }

    /// Check if this is an informational status (1xx)
    pub fn is_informational(&self) -> bool {
        (100..200).contains(&self.code)
    }

    /// Check if this is a success status (2xx)
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.code)
    }

    /// Check if this is a redirection status (3xx)
    pub fn is_redirection(&self) -> bool {
        (300..400).contains(&self.code)
    }

    /// Check if this is a client error status (4xx)
    pub fn is_client_error(&self) -> bool {
        (400..500).contains(&self.code)
    }

    /// Check if this is a server error status (5xx)
    pub fn is_server_error(&self) -> bool {
        (500..600).contains(&self.code)
    }

    /// Whether a response with this status never carries a body
    pub fn forbids_body(&self) -> bool {
        self.is_informational() || self.code == 204 || self.code == 304
    }

    pub const CONTINUE: Status = Status { code: 100 };
    pub const SWITCHING_PROTOCOLS: Status = Status { code: 101 };
    pub const OK: Status = Status { code: 200 };
    pub const NO_CONTENT: Status = Status { code: 204 };
    pub const NOT_MODIFIED: Status = Status { code: 304 };
    pub const NOT_FOUND: Status = Status { code: 404 };
    pub const INTERNAL_SERVER_ERROR: Status = Status { code: 500 };
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.code, self.reason_phrase())
    }
}

/// HTTP request
#[derive(Debug)]
pub struct Request {
    method: Method,
    url: Url,
    version: Version,
    headers: Headers,
    body: Body,
    proxied: bool,
}

impl Request {
    /// Create a new HTTP request
    pub fn new(method: Method, url: Url) -> Self {
        Request {
            method,
            url,
            version: Version::default(),
            headers: Headers::new(),
            body: Body::Empty,
            proxied: false,
        }
    }

    /// Create a builder for constructing requests
    pub fn builder() -> RequestBuilder {
        RequestBuilder::default()
    }

    /// Create a GET request for a URL string
    pub fn get(url: &str) -> Result<Self> {
        Ok(Request::new(Method::Get, Url::parse(url)?))
    }

    /// Get the request method
    pub fn method(&self) -> Method {
        self.method
    }

    /// Get the request URL
    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Point the request at a new URL
    pub fn set_url(&mut self, url: Url) {
        self.url = url;
    }

    /// Get the HTTP version
    pub fn version(&self) -> Version {
        self.version
    }

    /// Get the headers
    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    /// Get mutable headers
    pub fn headers_mut(&mut self) -> &mut Headers {
        &mut self.headers
    }

    /// Get the body
    pub fn body(&self) -> &Body {
        &self.body
    }

    /// Set the body
    pub fn set_body(&mut self, body: impl Into<Body>) {
        self.body = body.into();
    }

    /// Take the body out, leaving it empty
    pub fn take_body(&mut self) -> Body {
        std::mem::take(&mut self.body)
    }

    /// Whether the request goes through a forward proxy
    pub fn is_proxied(&self) -> bool {
        self.proxied
    }

    /// The request-target written on the request line
    ///
    /// Origin-form by default, absolute-form for proxied requests and
    /// authority-form for CONNECT. Fragments are never sent.
    pub fn target(&self) -> String {
        if self.method == Method::Connect {
            let host = self.url.host_str().unwrap_or_default();
            let port = self
                .url
                .port_or_known_default()
                .unwrap_or(DEFAULT_HTTP_PORT);
            return format!("{}:{}", host, port);
        }

        if self.proxied {
            let mut url = self.url.clone();
            url.set_fragment(None);
            return url.to_string();
        }

        let mut target = self.url.path().to_string();
        if target.is_empty() {
            target.push('/');
        }
        if let Some(query) = self.url.query() {
            target.push('?');
            target.push_str(query);
        }
        target
    }

    /// Value for the Host header: the host, plus the port when it is not
    /// the scheme default
    pub fn host_header(&self) -> Option<String> {
        let host = self.url.host_str()?;
        let default_port = match self.url.scheme() {
            "https" => DEFAULT_HTTPS_PORT,
            _ => DEFAULT_HTTP_PORT,
        };
        Some(match self.url.port() {
            Some(port) if port != default_port => format!("{}:{}", host, port),
            _ => host.to_string(),
        })
    }
}

/// Builder for HTTP requests
#[derive(Debug, Default)]
pub struct RequestBuilder {
    method: Option<Method>,
    uri: Option<String>,
    version: Option<Version>,
    headers: Headers,
    body: Body,
    proxied: bool,
}

impl RequestBuilder {
    /// Set the HTTP method
    pub fn method(mut self, method: Method) -> Self {
        self.method = Some(method);
        self
    }

    /// Set the absolute URI
    pub fn uri(mut self, uri: impl Into<String>) -> Self {
        self.uri = Some(uri.into());
        self
    }

    /// Set the HTTP version
    pub fn version(mut self, version: Version) -> Self {
        self.version = Some(version);
        self
    }

    /// Add a header
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.append(name, value);
        self
    }

    /// Set the body
    pub fn body(mut self, body: impl Into<Body>) -> Self {
        self.body = body.into();
        self
    }

    /// Send through a forward proxy (absolute-form request-target)
    pub fn proxied(mut self, proxied: bool) -> Self {
        self.proxied = proxied;
        self
    }

    /// Build the request
    pub fn build(self) -> Result<Request> {
        let uri = self
            .uri
            .ok_or_else(|| Error::InvalidRequest("missing URI".to_string()))?;
        let url = Url::parse(&uri)?;

        match url.scheme() {
            "http" | "https" => {}
            other => {
                return Err(Error::InvalidRequest(format!(
                    "unsupported scheme {}",
                    other
                )))
            }
        }
        if url.host_str().is_none() {
            return Err(Error::InvalidRequest(format!("no host in {}", url)));
        }

        Ok(Request {
            method: self.method.unwrap_or(Method::Get),
            url,
            version: self.version.unwrap_or_default(),
            headers: self.headers,
            body: self.body,
            proxied: self.proxied,
        })
    }
}

/// Byte counts and timestamps for one request/response exchange
#[derive(Debug, Clone, Copy)]
pub struct TransferStats {
    /// Bytes written to the network, across redirects
    pub bytes_sent: u64,
    /// Bytes read from the network, across redirects
    pub bytes_received: u64,
    /// When the request was submitted
    pub submitted_at: Instant,
    /// When the latest connection was assigned
    pub connected_at: Option<Instant>,
    /// When the final response completed
    pub completed_at: Option<Instant>,
    /// Number of redirects followed
    pub redirects: usize,
}

impl TransferStats {
    pub(crate) fn new(submitted_at: Instant) -> Self {
        TransferStats {
            bytes_sent: 0,
            bytes_received: 0,
            submitted_at,
            connected_at: None,
            completed_at: None,
            redirects: 0,
        }
    }

    /// Time from submission to completion
    pub fn elapsed(&self) -> Option<Duration> {
        self.completed_at.map(|t| t.duration_since(self.submitted_at))
    }
}

impl Default for TransferStats {
    fn default() -> Self {
        TransferStats::new(Instant::now())
    }
}

/// HTTP response
#[derive(Debug)]
pub struct Response {
    version: Version,
    status: Status,
    reason: String,
    headers: Headers,
    body: ResponseBody,
    trailers: Headers,
    history: Vec<Url>,
    stats: TransferStats,
}

impl Response {
    /// Create a new HTTP response
    pub fn new(status: Status) -> Self {
        Response {
            version: Version::default(),
            status,
            reason: status.reason_phrase().to_string(),
            headers: Headers::new(),
            body: ResponseBody::empty(),
            trailers: Headers::new(),
            history: Vec::new(),
            stats: TransferStats::default(),
        }
    }

    /// Create a builder for constructing responses
    pub fn builder() -> ResponseBuilder {
        ResponseBuilder::default()
    }

    /// Get the HTTP version
    pub fn version(&self) -> Version {
        self.version
    }

    /// Get the status code
    pub fn status(&self) -> Status {
        self.status
    }

    /// Get the reason phrase
    pub fn reason(&self) -> &str {
        &self.reason
    }

    /// Get the headers
    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    /// Get mutable headers
    pub fn headers_mut(&mut self) -> &mut Headers {
        &mut self.headers
    }

    /// Get the body
    pub fn body(&self) -> &ResponseBody {
        &self.body
    }

    /// Get the body mutably, e.g. to read a spooled body
    pub fn body_mut(&mut self) -> &mut ResponseBody {
        &mut self.body
    }

    /// Take ownership of the body
    pub fn into_body(self) -> ResponseBody {
        self.body
    }

    /// Trailer fields sent after a chunked body
    pub fn trailers(&self) -> &Headers {
        &self.trailers
    }

    /// Every URI requested to produce this response, final one last
    pub fn history(&self) -> &[Url] {
        &self.history
    }

    /// The URI that produced this response
    pub fn url(&self) -> Option<&Url> {
        self.history.last()
    }

    /// Transfer statistics
    pub fn stats(&self) -> &TransferStats {
        &self.stats
    }

    pub(crate) fn set_history(&mut self, history: Vec<Url>) {
        self.history = history;
    }

    pub(crate) fn set_stats(&mut self, stats: TransferStats) {
        self.stats = stats;
    }
}

/// Builder for HTTP responses
#[derive(Debug, Default)]
pub struct ResponseBuilder {
    version: Option<Version>,
    status: Option<Status>,
    reason: Option<String>,
    headers: Headers,
    body: Option<ResponseBody>,
    trailers: Headers,
}

impl ResponseBuilder {
    /// Set the HTTP version
    pub fn version(mut self, version: Version) -> Self {
        self.version = Some(version);
        self
    }

    /// Set the status code
    pub fn status(mut self, status: Status) -> Self {
        self.status = Some(status);
        self
    }

    /// Set the reason phrase
    pub fn reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    /// Add a header
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.append(name, value);
        self
    }

    /// Replace all headers
    pub fn headers(mut self, headers: Headers) -> Self {
        self.headers = headers;
        self
    }

    /// Set the body
    pub fn body(mut self, body: ResponseBody) -> Self {
        self.body = Some(body);
        self
    }

    /// Set the trailer fields
    pub fn trailers(mut self, trailers: Headers) -> Self {
        self.trailers = trailers;
        self
    }

    /// Build the response
    pub fn build(self) -> Response {
        let status = self.status.unwrap_or(Status::OK);
        let reason = self
            .reason
            .unwrap_or_else(|| status.reason_phrase().to_string());
        Response {
            version: self.version.unwrap_or_default(),
            status,
            reason,
            headers: self.headers,
            body: self.body.unwrap_or_default(),
            trailers: self.trailers,
            history: Vec::new(),
            stats: TransferStats::default(),
        }
    }
}
