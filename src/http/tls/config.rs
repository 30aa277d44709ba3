//! TLS configuration
//!
//! [`TlsOptions`] is the plain, cloneable description carried by the client
//! configuration. It is compiled once into a [`TlsConfig`] holding the
//! OpenSSL context shared by every TLS connection.

use openssl::ssl::{SslContext, SslContextBuilder, SslFiletype, SslMethod, SslVerifyMode};
use std::path::PathBuf;

/// TLS version
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum TlsVersion {
    /// TLS 1.0
    Tls10,
    /// TLS 1.1
    Tls11,
    /// TLS 1.2
    Tls12,
    /// TLS 1.3
    Tls13,
}

impl TlsVersion {
    /// Parse TLS version from string (case-insensitive)
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Result<Self, TlsError> {
        match s.to_uppercase().as_str() {
            "TLSV1.0" | "TLS1.0" | "TLSV1" | "TLS1" => Ok(TlsVersion::Tls10),
            "TLSV1.1" | "TLS1.1" => Ok(TlsVersion::Tls11),
            "TLSV1.2" | "TLS1.2" => Ok(TlsVersion::Tls12),
            "TLSV1.3" | "TLS1.3" => Ok(TlsVersion::Tls13),
            _ => Err(TlsError::InvalidVersion(s.to_string())),
        }
    }

    /// Get OpenSSL protocol version constant
    pub fn to_openssl_version(&self) -> openssl::ssl::SslVersion {
        use openssl::ssl::SslVersion;
        match self {
            TlsVersion::Tls10 => SslVersion::TLS1,
            TlsVersion::Tls11 => SslVersion::TLS1_1,
            TlsVersion::Tls12 => SslVersion::TLS1_2,
            TlsVersion::Tls13 => SslVersion::TLS1_3,
        }
    }

    /// Get version as string
    pub fn as_str(&self) -> &'static str {
        match self {
            TlsVersion::Tls10 => "TLSv1.0",
            TlsVersion::Tls11 => "TLSv1.1",
            TlsVersion::Tls12 => "TLSv1.2",
            TlsVersion::Tls13 => "TLSv1.3",
        }
    }
}

/// TLS errors
#[derive(Debug, thiserror::Error)]
pub enum TlsError {
    #[error("OpenSSL error: {0}")]
    OpenSsl(#[from] openssl::error::ErrorStack),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid TLS version: {0}")]
    InvalidVersion(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Handshake failed: {0}")]
    HandshakeFailed(String),
}

/// Client TLS settings
#[derive(Debug, Clone)]
pub struct TlsOptions {
    /// Verify the server certificate chain and host name
    pub verify_peer: bool,
    /// PEM bundle of trusted CAs
    pub ca_file: Option<PathBuf>,
    /// Directory of hashed CA certificates
    pub ca_path: Option<PathBuf>,
    /// Client certificate chain (PEM)
    pub cert_file: Option<PathBuf>,
    /// Client private key (PEM); defaults to `cert_file`
    pub key_file: Option<PathBuf>,
    /// Server name sent in SNI; defaults to the request host
    pub sni: Option<String>,
    /// OpenSSL cipher list for TLS 1.2 and below
    pub cipher_list: Option<String>,
    pub min_version: Option<TlsVersion>,
    pub max_version: Option<TlsVersion>,
}

impl Default for TlsOptions {
    fn default() -> Self {
        TlsOptions {
            verify_peer: true,
            ca_file: None,
            ca_path: None,
            cert_file: None,
            key_file: None,
            sni: None,
            cipher_list: None,
            min_version: None,
            max_version: None,
        }
    }
}

impl TlsOptions {
    /// Set TLS version (both min and max)
    pub fn version(mut self, version: TlsVersion) -> Self {
        self.min_version = Some(version);
        self.max_version = Some(version);
        self
    }

    /// Set TLS version range
    pub fn version_range(mut self, min: TlsVersion, max: TlsVersion) -> Self {
        self.min_version = Some(min);
        self.max_version = Some(max);
        self
    }

    /// Enable/disable peer certificate verification
    pub fn verify_peer(mut self, verify: bool) -> Self {
        self.verify_peer = verify;
        self
    }

    /// Set SNI servername
    pub fn servername(mut self, name: impl Into<String>) -> Self {
        self.sni = Some(name.into());
        self
    }

    /// Compile the options into an OpenSSL context
    pub fn build(&self) -> Result<TlsConfig, TlsError> {
        if let (Some(min), Some(max)) = (self.min_version, self.max_version) {
            if min > max {
                return Err(TlsError::InvalidConfig(format!(
                    "minimum version {} above maximum {}",
                    min.as_str(),
                    max.as_str()
                )));
            }
        }

        let mut builder = SslContextBuilder::new(SslMethod::tls_client())?;

        if self.verify_peer {
            builder.set_verify(SslVerifyMode::PEER);
        } else {
            builder.set_verify(SslVerifyMode::NONE);
        }

        match (&self.ca_file, &self.ca_path) {
            (None, None) => builder.set_default_verify_paths()?,
            (ca_file, ca_path) => {
                if let Some(file) = ca_file {
                    builder.set_ca_file(file)?;
                }
                if let Some(path) = ca_path {
                    builder.load_verify_locations(None, Some(path.as_path()))?;
                }
            }
        }

        if let Some(cert) = &self.cert_file {
            builder.set_certificate_chain_file(cert)?;
            let key = self.key_file.as_ref().unwrap_or(cert);
            builder.set_private_key_file(key, SslFiletype::PEM)?;
            builder.check_private_key()?;
        } else if self.key_file.is_some() {
            return Err(TlsError::InvalidConfig(
                "private key given without a certificate".to_string(),
            ));
        }

        if let Some(ciphers) = &self.cipher_list {
            builder.set_cipher_list(ciphers)?;
        }

        builder.set_min_proto_version(self.min_version.map(|v| v.to_openssl_version()))?;
        builder.set_max_proto_version(self.max_version.map(|v| v.to_openssl_version()))?;

        Ok(TlsConfig {
            ctx: builder.build(),
            servername: self.sni.clone(),
            verify_peer: self.verify_peer,
        })
    }
}

/// TLS configuration (immutable after building)
#[derive(Clone)]
pub struct TlsConfig {
    pub(crate) ctx: SslContext,
    pub(crate) servername: Option<String>,
    pub(crate) verify_peer: bool,
}

impl TlsConfig {
    /// Whether peer verification is enabled
    pub fn verify_peer(&self) -> bool {
        self.verify_peer
    }
}

impl std::fmt::Debug for TlsConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsConfig")
            .field("servername", &self.servername)
            .field("verify_peer", &self.verify_peer)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tls_version_parsing() {
        assert_eq!(TlsVersion::from_str("TLSv1.2").unwrap(), TlsVersion::Tls12);
        assert_eq!(TlsVersion::from_str("tlsv1.3").unwrap(), TlsVersion::Tls13);
        assert_eq!(TlsVersion::from_str("TLS1.0").unwrap(), TlsVersion::Tls10);
        assert!(TlsVersion::from_str("invalid").is_err());
    }

    #[test]
    fn test_build_client_config() {
        let config = TlsOptions::default()
            .version(TlsVersion::Tls13)
            .servername("example.com")
            .verify_peer(false)
            .build()
            .unwrap();

        assert_eq!(config.servername, Some("example.com".to_string()));
        assert!(!config.verify_peer());
    }

    #[test]
    fn test_version_range() {
        let options = TlsOptions::default().version_range(TlsVersion::Tls12, TlsVersion::Tls13);
        assert!(options.build().is_ok());

        let inverted = TlsOptions::default().version_range(TlsVersion::Tls13, TlsVersion::Tls12);
        assert!(matches!(inverted.build(), Err(TlsError::InvalidConfig(_))));
    }

    #[test]
    fn test_missing_ca_file() {
        let options = TlsOptions {
            ca_file: Some(PathBuf::from("/nonexistent/ca.pem")),
            ..TlsOptions::default()
        };
        assert!(matches!(options.build(), Err(TlsError::OpenSsl(_))));
    }

    #[test]
    fn test_key_without_cert() {
        let options = TlsOptions {
            key_file: Some(PathBuf::from("key.pem")),
            ..TlsOptions::default()
        };
        assert!(matches!(options.build(), Err(TlsError::InvalidConfig(_))));
    }
}
