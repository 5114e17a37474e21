//! TLS certificate lifecycle.
//!
//! The daemon always has exactly one active certificate. It comes from one
//! of two places:
//!
//! ```text
//!   CLIBRIDGE_CERT_MODE
//!          │
//!   ┌──────┴───────┬──────────────┐
//!   ▼              ▼              ▼
//! external        auto        self_signed
//!   │              │              │
//!   ▼              ▼              │
//! deposited pair present & valid? │
//!   │ yes          │ no           │
//!   ▼              └──────┬───────┘
//! Loaded                  ▼
//!              persisted self-signed pair valid
//!              and covering hostname + SANs?
//!                 │ yes          │ no
//!                 ▼              ▼
//!               reuse        generate + persist
//!                 └──────┬───────┘
//!                        ▼
//!                    SelfSigned
//! ```
//!
//! Material is swapped atomically through a `watch` channel; the gateway
//! reads the current `rustls::ServerConfig` once per accepted connection,
//! so a reload only affects new connections.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use sha2::{Digest, Sha256};
use thiserror::Error;

mod manager;
mod material;
mod store;

pub use manager::{ActiveCertificate, CertificateInfo, CertificateManager, CertificateState, ReloadOutcome};
pub use material::{CertificateMaterial, SELF_SIGNED_ORGANIZATION, SELF_SIGNED_VALIDITY_DAYS};
pub use store::{CertificateStore, MAX_BACKUPS};

// ============================================================================
// Configuration
// ============================================================================

/// Where certificate material should come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CertMode {
    /// Deposited pair if present and valid, otherwise self-signed
    #[default]
    Auto,
    /// Always self-signed
    SelfSigned,
    /// Deposited pair expected; self-signed is a logged fallback
    External,
}

impl CertMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Auto => "auto",
            Self::SelfSigned => "self_signed",
            Self::External => "external",
        }
    }
}

impl fmt::Display for CertMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CertMode {
    type Err = CertificateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "auto" => Ok(Self::Auto),
            "self_signed" | "self-signed" | "selfsigned" => Ok(Self::SelfSigned),
            "external" | "commercial" => Ok(Self::External),
            other => Err(CertificateError::Parse(format!(
                "unknown certificate mode: {other}"
            ))),
        }
    }
}

/// Certificate manager settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateConfig {
    pub mode: CertMode,
    /// Directory holding `server.crt` / `server.key` for self-signed material
    pub self_signed_dir: PathBuf,
    /// Deposited certificate chain (PEM)
    pub external_cert_path: PathBuf,
    /// Deposited private key (PEM)
    pub external_key_path: PathBuf,
    /// Common name, also the first SAN
    pub hostname: String,
    /// Additional SANs; IP literals become IP SANs
    pub subject_alt_names: Vec<String>,
}

impl CertificateConfig {
    /// Hostname followed by the extra SANs, deduplicated, in order.
    #[must_use]
    pub fn required_names(&self) -> Vec<String> {
        let mut names: Vec<String> = Vec::with_capacity(self.subject_alt_names.len() + 1);
        for name in std::iter::once(&self.hostname).chain(&self.subject_alt_names) {
            let name = name.trim();
            if !name.is_empty() && !names.iter().any(|n| n == name) {
                names.push(name.to_string());
            }
        }
        names
    }
}

/// Origin of the active material.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Provenance {
    SelfSigned,
    External,
}

impl Provenance {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SelfSigned => "self_signed",
            Self::External => "external",
        }
    }
}

impl fmt::Display for Provenance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Errors
// ============================================================================

/// Errors raised while loading, validating or generating certificates.
#[derive(Debug, Error)]
pub enum CertificateError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid certificate material: {0}")]
    Parse(String),

    #[error("no certificate found in PEM input")]
    NoCertificate,

    #[error("private key does not match certificate")]
    KeyMismatch,

    #[error("certificate is not valid before {0}")]
    NotYetValid(chrono::DateTime<chrono::Utc>),

    #[error("certificate expired at {0}")]
    Expired(chrono::DateTime<chrono::Utc>),

    #[error("failed to generate self-signed certificate: {0}")]
    Generate(String),

    #[error("TLS configuration error: {0}")]
    Tls(String),
}

impl CertificateError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

// ============================================================================
// Fingerprint
// ============================================================================

/// Prefix of every fingerprint string.
pub const FINGERPRINT_PREFIX: &str = "SHA256:";

/// SHA-256 fingerprint of a DER certificate.
///
/// Formatted as `SHA256:` followed by colon-separated upper-case hex bytes.
/// Depends on the certificate bytes only.
#[must_use]
pub fn fingerprint(cert_der: &[u8]) -> String {
    let digest = Sha256::digest(cert_der);
    let pairs: Vec<String> = digest.iter().map(|b| hex::encode_upper([*b])).collect();
    format!("{FINGERPRINT_PREFIX}{}", pairs.join(":"))
}
