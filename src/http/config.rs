//! Client configuration
//!
//! [`ClientConfig`] collects every knob the client recognizes. Timeouts
//! are `Option<Duration>` where `None` means unlimited.
//!
//! ```
//! use h1client::http::{ClientConfig, FollowPolicy};
//! use std::time::Duration;
//!
//! let config = ClientConfig::builder()
//!     .keep_alive(true)
//!     .transfer_timeout(Duration::from_secs(10))
//!     .follow_location(FollowPolicy::ON_3XX | FollowPolicy::ON_UNSAFE_METHOD)
//!     .max_connections_per_host(4)
//!     .build();
//!
//! assert_eq!(config.max_connections_per_host, 4);
//! assert!(config.follow_location.contains(FollowPolicy::ON_UNSAFE_METHOD));
//! ```

use super::connector::ConnectOptions;
use super::parser::ParserOptions;
use super::tls::TlsOptions;
use super::writer::WriterOptions;
use std::fmt;
use std::net::SocketAddr;
use std::ops::{BitOr, BitOrAssign};
use std::time::Duration;

/// Which responses redirect the request (bitmask)
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct FollowPolicy(u8);

impl FollowPolicy {
    /// Never follow
    pub const NONE: FollowPolicy = FollowPolicy(0);

    /// Follow 3xx responses carrying a Location header
    pub const ON_3XX: FollowPolicy = FollowPolicy(0x1);

    /// Follow 2xx responses carrying a Location header
    pub const ON_2XX: FollowPolicy = FollowPolicy(0x2);

    /// Also follow for methods other than GET and HEAD
    pub const ON_UNSAFE_METHOD: FollowPolicy = FollowPolicy(0x4);

    /// Create from raw bits; unknown bits are dropped
    pub fn from_bits(bits: u8) -> Self {
        FollowPolicy(bits & 0x7)
    }

    pub fn bits(&self) -> u8 {
        self.0
    }

    /// Whether every flag of `other` is set
    pub fn contains(&self, other: FollowPolicy) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn is_none(&self) -> bool {
        self.0 == 0
    }
}

impl Default for FollowPolicy {
    fn default() -> Self {
        FollowPolicy::ON_3XX
    }
}

impl BitOr for FollowPolicy {
    type Output = FollowPolicy;

    fn bitor(self, rhs: FollowPolicy) -> FollowPolicy {
        FollowPolicy(self.0 | rhs.0)
    }
}

impl BitOrAssign for FollowPolicy {
    fn bitor_assign(&mut self, rhs: FollowPolicy) {
        self.0 |= rhs.0;
    }
}

impl fmt::Debug for FollowPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_none() {
            return f.write_str("FollowPolicy(NONE)");
        }
        let names: Vec<&str> = [
            (FollowPolicy::ON_3XX, "ON_3XX"),
            (FollowPolicy::ON_2XX, "ON_2XX"),
            (FollowPolicy::ON_UNSAFE_METHOD, "ON_UNSAFE_METHOD"),
        ]
        .iter()
        .filter(|(flag, _)| self.contains(*flag))
        .map(|(_, name)| *name)
        .collect();
        write!(f, "FollowPolicy({})", names.join(" | "))
    }
}

/// Client settings
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Reuse connections across requests
    pub keep_alive: bool,
    pub connect_timeout: Option<Duration>,
    /// Bound on one exchange, from checkout to the last body byte
    pub transfer_timeout: Option<Duration>,
    /// Idle connections older than this are closed
    pub keep_alive_timeout: Option<Duration>,
    pub follow_location: FollowPolicy,
    /// Send the previous URI as Referer when redirecting
    pub auto_referer: bool,
    /// Connection limit per authority, at least 1
    pub max_connections_per_host: usize,
    /// Upper bound for one socket read or body block
    pub io_granularity: usize,
    /// Wait for `100 Continue` at most this long before sending the body
    pub continue_delay: Duration,
    /// Materialize response bodies in memory
    pub buffer_body: bool,
    /// Response body size kept in memory before spilling to disk
    pub body_spool_threshold: usize,
    pub max_redirects: usize,
    pub user_agent: String,
    /// Local address for outgoing connections
    pub bind_address: Option<SocketAddr>,
    pub tls_handshake_timeout: Option<Duration>,
    pub tls: TlsOptions,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            keep_alive: true,
            connect_timeout: Some(Duration::from_secs(30)),
            transfer_timeout: None,
            keep_alive_timeout: Some(Duration::from_secs(30)),
            follow_location: FollowPolicy::default(),
            auto_referer: false,
            max_connections_per_host: 8,
            io_granularity: 16 * 1024,
            continue_delay: Duration::from_secs(1),
            buffer_body: true,
            body_spool_threshold: 2 * 1024 * 1024,
            max_redirects: 10,
            user_agent: concat!("h1client/", env!("CARGO_PKG_VERSION")).to_string(),
            bind_address: None,
            tls_handshake_timeout: Some(Duration::from_secs(30)),
            tls: TlsOptions::default(),
        }
    }
}

impl ClientConfig {
    pub fn builder() -> ClientConfigBuilder {
        ClientConfigBuilder::new()
    }

    pub(crate) fn parser_options(&self) -> ParserOptions {
        ParserOptions {
            strict: false,
            io_granularity: self.io_granularity.max(1),
            spool_threshold: self.body_spool_threshold,
            buffer_body: self.buffer_body,
        }
    }

    pub(crate) fn writer_options(&self) -> WriterOptions {
        WriterOptions {
            io_granularity: self.io_granularity.max(1),
            continue_delay: self.continue_delay,
        }
    }

    pub(crate) fn connect_options(&self) -> ConnectOptions {
        ConnectOptions {
            connect_timeout: self.connect_timeout,
            keep_alive_timeout: self.keep_alive_timeout,
            bind_address: self.bind_address,
            tls_handshake_timeout: self.tls_handshake_timeout,
        }
    }
}

/// Builder for [`ClientConfig`]
#[derive(Debug, Clone, Default)]
pub struct ClientConfigBuilder {
    config: ClientConfig,
}

impl ClientConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn keep_alive(mut self, enable: bool) -> Self {
        self.config.keep_alive = enable;
        self
    }

    pub fn connect_timeout(mut self, timeout: impl Into<Option<Duration>>) -> Self {
        self.config.connect_timeout = timeout.into();
        self
    }

    pub fn transfer_timeout(mut self, timeout: impl Into<Option<Duration>>) -> Self {
        self.config.transfer_timeout = timeout.into();
        self
    }

    pub fn keep_alive_timeout(mut self, timeout: impl Into<Option<Duration>>) -> Self {
        self.config.keep_alive_timeout = timeout.into();
        self
    }

    pub fn follow_location(mut self, policy: FollowPolicy) -> Self {
        self.config.follow_location = policy;
        self
    }

    pub fn auto_referer(mut self, enable: bool) -> Self {
        self.config.auto_referer = enable;
        self
    }

    pub fn max_connections_per_host(mut self, max: usize) -> Self {
        self.config.max_connections_per_host = max;
        self
    }

    pub fn io_granularity(mut self, bytes: usize) -> Self {
        self.config.io_granularity = bytes;
        self
    }

    pub fn continue_delay(mut self, delay: Duration) -> Self {
        self.config.continue_delay = delay;
        self
    }

    pub fn buffer_body(mut self, enable: bool) -> Self {
        self.config.buffer_body = enable;
        self
    }

    pub fn body_spool_threshold(mut self, bytes: usize) -> Self {
        self.config.body_spool_threshold = bytes;
        self
    }

    pub fn max_redirects(mut self, max: usize) -> Self {
        self.config.max_redirects = max;
        self
    }

    pub fn user_agent(mut self, agent: impl Into<String>) -> Self {
        self.config.user_agent = agent.into();
        self
    }

    pub fn bind_address(mut self, addr: SocketAddr) -> Self {
        self.config.bind_address = Some(addr);
        self
    }

    pub fn tls_handshake_timeout(mut self, timeout: impl Into<Option<Duration>>) -> Self {
        self.config.tls_handshake_timeout = timeout.into();
        self
    }

    pub fn tls(mut self, tls: TlsOptions) -> Self {
        self.config.tls = tls;
        self
    }

    /// Finish, clamping out-of-range values
    pub fn build(mut self) -> ClientConfig {
        self.config.max_connections_per_host = self.config.max_connections_per_host.max(1);
        self.config.io_granularity = self.config.io_granularity.max(1);
        self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_follow_policy_bits() {
        let policy = FollowPolicy::ON_3XX | FollowPolicy::ON_2XX;
        assert!(policy.contains(FollowPolicy::ON_3XX));
        assert!(policy.contains(FollowPolicy::ON_2XX));
        assert!(!policy.contains(FollowPolicy::ON_UNSAFE_METHOD));
        assert_eq!(policy.bits(), 3);

        assert!(FollowPolicy::NONE.is_none());
        assert_eq!(FollowPolicy::from_bits(0xff).bits(), 7);
        assert_eq!(FollowPolicy::default(), FollowPolicy::ON_3XX);
        assert_eq!(format!("{:?}", policy), "FollowPolicy(ON_3XX | ON_2XX)");
    }

    #[test]
    fn test_builder_clamps() {
        let config = ClientConfig::builder()
            .max_connections_per_host(0)
            .io_granularity(0)
            .keep_alive_timeout(None)
            .build();

        assert_eq!(config.max_connections_per_host, 1);
        assert_eq!(config.io_granularity, 1);
        assert_eq!(config.keep_alive_timeout, None);
    }

    #[test]
    fn test_derived_options() {
        let config = ClientConfig::builder()
            .io_granularity(4096)
            .continue_delay(Duration::from_millis(250))
            .buffer_body(false)
            .connect_timeout(Duration::from_secs(3))
            .build();

        let parser = config.parser_options();
        assert_eq!(parser.io_granularity, 4096);
        assert!(!parser.buffer_body);

        let writer = config.writer_options();
        assert_eq!(writer.continue_delay, Duration::from_millis(250));

        let connect = config.connect_options();
        assert_eq!(connect.connect_timeout, Some(Duration::from_secs(3)));
    }

    #[test]
    fn test_defaults() {
        let config = ClientConfig::default();
        assert!(config.keep_alive);
        assert_eq!(config.max_redirects, 10);
        assert!(config.user_agent.starts_with("h1client/"));
        assert!(config.tls.verify_peer);
    }
}
