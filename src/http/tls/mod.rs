//! TLS support for HTTPS connections
//!
//! The TLS implementation uses the session operations abstraction pattern:
//!
//! 1. `TlsOptions` describes client TLS settings (versions, ciphers, CAs,
//!    client certificate, SNI)
//! 2. `TlsConfig` is the compiled OpenSSL context, built once per client
//! 3. `TlsSessionOps` implements the `SessionOps` trait for encrypted I/O;
//!    it is produced by a non-blocking `TlsHandshake` the client resumes
//!    whenever the socket becomes ready
//!
//! All HTTP code stays unchanged; it goes through `SessionOps` either way.
//!
//! # Examples
//!
//! ```no_run
//! use h1client::http::tls::{TlsOptions, TlsVersion};
//! use h1client::http::{Client, ClientConfig};
//!
//! let tls = TlsOptions::default()
//!     .version_range(TlsVersion::Tls12, TlsVersion::Tls13)
//!     .verify_peer(true);
//!
//! let config = ClientConfig::builder().tls(tls).build();
//! let mut client = Client::new(config);
//! let response = client.get("https://example.com/").unwrap();
//! println!("{}", response.status());
//! ```

pub mod config;
pub mod session;

pub use config::{TlsConfig, TlsError, TlsOptions, TlsVersion};
pub use session::{Handshake, TlsHandshake, TlsSessionOps};

/// Result type for TLS operations
pub type Result<T> = std::result::Result<T, TlsError>;
