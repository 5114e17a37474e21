//! Certificate/key pairs: generation, parsing, validation.

use std::net::IpAddr;
use std::sync::Arc;

use chrono::{DateTime, Datelike, Duration as ChronoDuration, Utc};
use rcgen::{
    CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, KeyPair,
    KeyUsagePurpose, SanType,
};
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::sign::CertifiedKey;
use rustls::ServerConfig;

use super::{fingerprint, CertificateError, Provenance};

/// Validity of generated certificates.
pub const SELF_SIGNED_VALIDITY_DAYS: i64 = 3650;

/// Organization name stamped on generated certificates.
pub const SELF_SIGNED_ORGANIZATION: &str = "clibridge self-signed";

/// ALPN protocols offered by the gateway.
const ALPN_PROTOCOLS: [&[u8]; 2] = [b"h2", b"http/1.1"];

/// A parsed and validated certificate chain with its private key.
#[derive(Clone, PartialEq, Eq)]
pub struct CertificateMaterial {
    /// Full chain, leaf first
    pub cert_pem: String,
    pub key_pem: String,
    /// Leaf certificate DER
    pub cert_der: Vec<u8>,
    pub fingerprint: String,
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
    pub subject_alt_names: Vec<String>,
    pub provenance: Provenance,
}

impl CertificateMaterial {
    /// Generates a fresh ECDSA P-256 self-signed pair.
    ///
    /// `names[0]` becomes the common name; every entry becomes a SAN.
    ///
    /// # Errors
    ///
    /// `CertificateError::Generate` if key generation or signing fails.
    pub fn generate_self_signed(names: &[String]) -> Result<Self, CertificateError> {
        let common_name = names
            .first()
            .ok_or_else(|| CertificateError::Generate("no hostname configured".to_string()))?;

        let mut params = CertificateParams::new(names.to_vec())
            .map_err(|e| CertificateError::Generate(e.to_string()))?;

        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, common_name.as_str());
        dn.push(DnType::OrganizationName, SELF_SIGNED_ORGANIZATION);
        params.distinguished_name = dn;

        // Backdate one day to tolerate clock skew on clients
        let start = Utc::now() - ChronoDuration::days(1);
        let end = start + ChronoDuration::days(SELF_SIGNED_VALIDITY_DAYS);
        params.not_before = rcgen::date_time_ymd(start.year(), start.month() as u8, start.day() as u8);
        params.not_after = rcgen::date_time_ymd(end.year(), end.month() as u8, end.day() as u8);

        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];

        let key = KeyPair::generate().map_err(|e| CertificateError::Generate(e.to_string()))?;
        let cert = params
            .self_signed(&key)
            .map_err(|e| CertificateError::Generate(e.to_string()))?;

        Self::from_pem(&cert.pem(), &key.serialize_pem(), Provenance::SelfSigned)
            .map_err(|e| CertificateError::Generate(e.to_string()))
    }

    /// Parses and validates a PEM chain and key.
    ///
    /// # Errors
    ///
    /// - `NoCertificate` / `Parse` for unreadable input
    /// - `KeyMismatch` if the key does not belong to the leaf certificate
    /// - `NotYetValid` / `Expired` outside the validity window
    pub fn from_pem(
        cert_pem: &str,
        key_pem: &str,
        provenance: Provenance,
    ) -> Result<Self, CertificateError> {
        let chain = parse_chain(cert_pem.as_bytes())?;
        let leaf = chain.first().ok_or(CertificateError::NoCertificate)?.clone();
        let key = parse_key(key_pem.as_bytes())?;

        let signing_key = rustls::crypto::ring::sign::any_supported_type(&key)
            .map_err(|e| CertificateError::Parse(format!("unsupported private key: {e}")))?;
        CertifiedKey::new(chain, signing_key)
            .keys_match()
            .map_err(|_| CertificateError::KeyMismatch)?;

        let params = CertificateParams::from_ca_cert_der(&leaf)
            .map_err(|e| CertificateError::Parse(e.to_string()))?;
        let not_before = to_utc(params.not_before.unix_timestamp())?;
        let not_after = to_utc(params.not_after.unix_timestamp())?;

        let now = Utc::now();
        if now < not_before {
            return Err(CertificateError::NotYetValid(not_before));
        }
        if now > not_after {
            return Err(CertificateError::Expired(not_after));
        }

        let subject_alt_names = params
            .subject_alt_names
            .iter()
            .filter_map(|san| match san {
                SanType::DnsName(name) => Some(name.as_str().to_string()),
                SanType::IpAddress(ip) => Some(ip.to_string()),
                _ => None,
            })
            .collect();

        Ok(Self {
            cert_pem: cert_pem.to_string(),
            key_pem: key_pem.to_string(),
            fingerprint: fingerprint(leaf.as_ref()),
            cert_der: leaf.as_ref().to_vec(),
            not_before,
            not_after,
            subject_alt_names,
            provenance,
        })
    }

    /// Returns true if every required name appears among the SANs.
    ///
    /// IP literals are compared as addresses, DNS names case-insensitively.
    #[must_use]
    pub fn covers(&self, required: &[String]) -> bool {
        required.iter().all(|name| {
            self.subject_alt_names.iter().any(|san| names_match(san, name))
        })
    }

    /// Builds the rustls server configuration for this material.
    ///
    /// # Errors
    ///
    /// `CertificateError::Tls` if rustls rejects the pair.
    pub fn server_config(&self) -> Result<Arc<ServerConfig>, CertificateError> {
        let chain = parse_chain(self.cert_pem.as_bytes())?;
        let key = parse_key(self.key_pem.as_bytes())?;

        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let mut config = ServerConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .map_err(|e| CertificateError::Tls(e.to_string()))?
            .with_no_client_auth()
            .with_single_cert(chain, key)
            .map_err(|e| CertificateError::Tls(e.to_string()))?;
        config.alpn_protocols = ALPN_PROTOCOLS.iter().map(|p| p.to_vec()).collect();

        Ok(Arc::new(config))
    }
}

impl std::fmt::Debug for CertificateMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertificateMaterial")
            .field("fingerprint", &self.fingerprint)
            .field("provenance", &self.provenance)
            .field("not_before", &self.not_before)
            .field("not_after", &self.not_after)
            .field("subject_alt_names", &self.subject_alt_names)
            .finish_non_exhaustive()
    }
}

fn parse_chain(pem: &[u8]) -> Result<Vec<CertificateDer<'static>>, CertificateError> {
    let chain = CertificateDer::pem_slice_iter(pem)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| CertificateError::Parse(format!("failed to parse certificates: {e}")))?;
    if chain.is_empty() {
        return Err(CertificateError::NoCertificate);
    }
    Ok(chain)
}

fn parse_key(pem: &[u8]) -> Result<PrivateKeyDer<'static>, CertificateError> {
    PrivateKeyDer::from_pem_slice(pem)
        .map_err(|e| CertificateError::Parse(format!("failed to parse private key: {e}")))
}

fn to_utc(timestamp: i64) -> Result<DateTime<Utc>, CertificateError> {
    DateTime::from_timestamp(timestamp, 0)
        .ok_or_else(|| CertificateError::Parse(format!("timestamp out of range: {timestamp}")))
}

fn names_match(san: &str, wanted: &str) -> bool {
    match (san.parse::<IpAddr>(), wanted.parse::<IpAddr>()) {
        (Ok(a), Ok(b)) => a == b,
        (Err(_), Err(_)) => san.eq_ignore_ascii_case(wanted),
        _ => false,
    }
}
