//! Daemon configuration.
//!
//! All settings come from `CLIBRIDGE_*` environment variables, optionally
//! seeded from a `.env` file in the working directory. Parsing goes through
//! a lookup function so tests can supply values without touching the
//! process environment.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use clibridge_core::{ToolOverrides, DEFAULT_EVENT_LOG_CAPACITY};
use thiserror::Error;
use tracing::debug;

use crate::certs::{CertMode, CertificateConfig};
use crate::gateway::GatewayConfig;
use crate::registry::{RegistryConfig, WorkspacePolicy, MAX_SESSIONS};

/// Default HTTPS port.
pub const DEFAULT_PORT: u16 = 8443;

/// Default idle timeout (30 minutes).
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// Environment variable holding the API key.
pub const API_KEY_VAR: &str = "CLIBRIDGE_API_KEY";

/// Errors raised while reading configuration.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("missing required setting {var}")]
    Missing { var: &'static str },

    #[error("invalid value for {var}: {value:?} (expected {expected})")]
    Invalid {
        var: &'static str,
        value: String,
        expected: &'static str,
    },
}

/// Fully parsed daemon configuration.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Shared secret every authenticated request must present
    pub api_key: String,
    pub listen_addr: IpAddr,
    pub port: u16,
    /// Serve TLS (disable only for local development)
    pub tls_enabled: bool,

    pub cert_mode: CertMode,
    pub cert_dir: PathBuf,
    pub external_cert_path: PathBuf,
    pub external_key_path: PathBuf,
    pub hostname: String,
    pub subject_alt_names: Vec<String>,

    /// Local network advertisement flag; advertisement itself is external
    pub discovery_enabled: bool,

    pub idle_timeout: Duration,
    pub sweep_interval: Duration,
    pub event_log_capacity: usize,
    pub grace_period: Duration,
    pub heartbeat_interval: Duration,
    pub max_sessions: usize,
    pub event_rate_limit: Duration,

    /// Roots under which a session workspace may live
    pub workspace_roots: Vec<PathBuf>,
    pub tool_overrides: ToolOverrides,
}

impl BridgeConfig {
    /// Loads `.env` (if present) and reads the process environment.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` for a missing API key or unparsable values.
    pub fn from_env() -> Result<Self, ConfigError> {
        match dotenvy::dotenv() {
            Ok(path) => debug!(path = %path.display(), "Loaded .env file"),
            Err(e) => debug!(error = %e, "No .env file loaded"),
        }
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the configuration from an arbitrary variable lookup.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` for a missing API key or unparsable values.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |var: &str| lookup(var).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let api_key = get(API_KEY_VAR).ok_or(ConfigError::Missing { var: API_KEY_VAR })?;

        let listen_addr = match get("CLIBRIDGE_LISTEN_ADDR") {
            Some(v) => v.parse().map_err(|_| ConfigError::Invalid {
                var: "CLIBRIDGE_LISTEN_ADDR",
                value: v,
                expected: "an IP address",
            })?,
            None => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        };

        let port = match get("CLIBRIDGE_PORT") {
            Some(v) => v.parse().map_err(|_| ConfigError::Invalid {
                var: "CLIBRIDGE_PORT",
                value: v,
                expected: "a port number",
            })?,
            None => DEFAULT_PORT,
        };

        let cert_mode = match get("CLIBRIDGE_CERT_MODE") {
            Some(v) => v.parse().map_err(|_| ConfigError::Invalid {
                var: "CLIBRIDGE_CERT_MODE",
                value: v,
                expected: "auto, self_signed or external",
            })?,
            None => CertMode::Auto,
        };

        let certs_root = state_dir().join("certs");
        let cert_dir = get("CLIBRIDGE_CERT_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| certs_root.join("self_signed"));
        let external_cert_path = get("CLIBRIDGE_EXTERNAL_CERT")
            .map(PathBuf::from)
            .unwrap_or_else(|| certs_root.join("external").join("fullchain.pem"));
        let external_key_path = get("CLIBRIDGE_EXTERNAL_KEY")
            .map(PathBuf::from)
            .unwrap_or_else(|| certs_root.join("external").join("privkey.pem"));

        let hostname = get("CLIBRIDGE_HOSTNAME").unwrap_or_else(|| "localhost".to_string());
        let subject_alt_names = get("CLIBRIDGE_SAN")
            .map(|v| split_list(&v, ','))
            .unwrap_or_else(|| vec!["127.0.0.1".to_string()]);

        let workspace_roots = match get("CLIBRIDGE_WORKSPACE_ROOTS") {
            Some(v) => split_list(&v, ':').into_iter().map(PathBuf::from).collect(),
            None => std::env::current_dir().map(|d| vec![d]).unwrap_or_default(),
        };

        Ok(Self {
            api_key,
            listen_addr,
            port,
            tls_enabled: parse_bool(&get, "CLIBRIDGE_TLS", true)?,
            cert_mode,
            cert_dir,
            external_cert_path,
            external_key_path,
            hostname,
            subject_alt_names,
            discovery_enabled: parse_bool(&get, "CLIBRIDGE_DISCOVERY", true)?,
            idle_timeout: parse_secs(&get, "CLIBRIDGE_IDLE_TIMEOUT_SECS", DEFAULT_IDLE_TIMEOUT)?,
            sweep_interval: parse_secs(&get, "CLIBRIDGE_SWEEP_INTERVAL_SECS", Duration::from_secs(30))?,
            event_log_capacity: parse_usize(
                &get,
                "CLIBRIDGE_EVENT_LOG_CAPACITY",
                DEFAULT_EVENT_LOG_CAPACITY,
            )?,
            grace_period: parse_secs(&get, "CLIBRIDGE_GRACE_PERIOD_SECS", Duration::from_secs(5))?,
            heartbeat_interval: parse_secs(&get, "CLIBRIDGE_HEARTBEAT_SECS", Duration::from_secs(15))?,
            max_sessions: parse_usize(&get, "CLIBRIDGE_MAX_SESSIONS", MAX_SESSIONS)?,
            event_rate_limit: parse_secs(
                &get,
                "CLIBRIDGE_EVENT_RATE_LIMIT_SECS",
                Duration::from_secs(300),
            )?,
            workspace_roots,
            tool_overrides: ToolOverrides {
                claude: get("CLIBRIDGE_CLAUDE_BIN"),
                codex: get("CLIBRIDGE_CODEX_BIN"),
                gemini: get("CLIBRIDGE_GEMINI_BIN"),
            },
        })
    }

    /// Socket address the gateway binds to.
    #[must_use]
    pub fn bind_addr(&self) -> SocketAddr {
        SocketAddr::new(self.listen_addr, self.port)
    }

    /// Settings for the session registry.
    #[must_use]
    pub fn registry_config(&self) -> RegistryConfig {
        RegistryConfig {
            max_sessions: self.max_sessions,
            idle_timeout: self.idle_timeout,
            sweep_interval: self.sweep_interval,
            event_log_capacity: self.event_log_capacity,
            grace_period: self.grace_period,
            tool_overrides: self.tool_overrides.clone(),
            workspace: WorkspacePolicy::new(self.workspace_roots.clone()),
        }
    }

    /// Settings for the certificate manager.
    #[must_use]
    pub fn certificate_config(&self) -> CertificateConfig {
        CertificateConfig {
            mode: self.cert_mode,
            self_signed_dir: self.cert_dir.clone(),
            external_cert_path: self.external_cert_path.clone(),
            external_key_path: self.external_key_path.clone(),
            hostname: self.hostname.clone(),
            subject_alt_names: self.subject_alt_names.clone(),
        }
    }

    /// Settings for the HTTP gateway.
    #[must_use]
    pub fn gateway_config(&self) -> GatewayConfig {
        GatewayConfig {
            api_key: self.api_key.clone(),
            heartbeat_interval: self.heartbeat_interval,
            event_rate_limit: self.event_rate_limit,
        }
    }
}

/// Directory holding the daemon's persistent state.
#[must_use]
pub fn state_dir() -> PathBuf {
    dirs::state_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join("clibridge")
}

fn split_list(value: &str, separator: char) -> Vec<String> {
    value
        .split(separator)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn parse_bool<G>(get: &G, var: &'static str, default: bool) -> Result<bool, ConfigError>
where
    G: Fn(&str) -> Option<String>,
{
    match get(var) {
        None => Ok(default),
        Some(v) => match v.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(ConfigError::Invalid {
                var,
                value: v,
                expected: "a boolean",
            }),
        },
    }
}

fn parse_usize<G>(get: &G, var: &'static str, default: usize) -> Result<usize, ConfigError>
where
    G: Fn(&str) -> Option<String>,
{
    match get(var) {
        None => Ok(default),
        Some(v) => v.parse().map_err(|_| ConfigError::Invalid {
            var,
            value: v,
            expected: "a non-negative integer",
        }),
    }
}

fn parse_secs<G>(get: &G, var: &'static str, default: Duration) -> Result<Duration, ConfigError>
where
    G: Fn(&str) -> Option<String>,
{
    match get(var) {
        None => Ok(default),
        Some(v) => v
            .parse::<u64>()
            .map(Duration::from_secs)
            .map_err(|_| ConfigError::Invalid {
                var,
                value: v,
                expected: "a number of seconds",
            }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_from(pairs: &[(&str, &str)]) -> Result<BridgeConfig, ConfigError> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        BridgeConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_api_key_is_required() {
        assert_eq!(
            config_from(&[]).unwrap_err(),
            ConfigError::Missing { var: API_KEY_VAR }
        );
        assert!(config_from(&[(API_KEY_VAR, "   ")]).is_err());
    }

    #[test]
    fn test_defaults() {
        let config = config_from(&[(API_KEY_VAR, "secret")]).unwrap();
        assert_eq!(config.port, DEFAULT_PORT);
        assert!(config.tls_enabled);
        assert_eq!(config.cert_mode, CertMode::Auto);
        assert_eq!(config.hostname, "localhost");
        assert_eq!(config.subject_alt_names, vec!["127.0.0.1"]);
        assert_eq!(config.idle_timeout, DEFAULT_IDLE_TIMEOUT);
        assert_eq!(config.event_log_capacity, DEFAULT_EVENT_LOG_CAPACITY);
        assert_eq!(config.max_sessions, MAX_SESSIONS);
        assert!(config.cert_dir.ends_with("certs/self_signed"));
        assert_eq!(config.bind_addr().port(), 8443);
    }

    #[test]
    fn test_overrides() {
        let config = config_from(&[
            (API_KEY_VAR, "secret"),
            ("CLIBRIDGE_PORT", "9000"),
            ("CLIBRIDGE_TLS", "off"),
            ("CLIBRIDGE_CERT_MODE", "commercial"),
            ("CLIBRIDGE_SAN", "10.0.0.2, bridge.local ,"),
            ("CLIBRIDGE_IDLE_TIMEOUT_SECS", "60"),
            ("CLIBRIDGE_WORKSPACE_ROOTS", "/srv/a:/srv/b"),
            ("CLIBRIDGE_CLAUDE_BIN", "/opt/claude"),
        ])
        .unwrap();

        assert_eq!(config.port, 9000);
        assert!(!config.tls_enabled);
        assert_eq!(config.cert_mode, CertMode::External);
        assert_eq!(config.subject_alt_names, vec!["10.0.0.2", "bridge.local"]);
        assert_eq!(config.idle_timeout, Duration::from_secs(60));
        assert_eq!(
            config.workspace_roots,
            vec![PathBuf::from("/srv/a"), PathBuf::from("/srv/b")]
        );
        assert_eq!(config.tool_overrides.claude.as_deref(), Some("/opt/claude"));
    }

    #[test]
    fn test_invalid_values() {
        let err = config_from(&[(API_KEY_VAR, "k"), ("CLIBRIDGE_PORT", "http")]).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { var: "CLIBRIDGE_PORT", .. }));

        let err = config_from(&[(API_KEY_VAR, "k"), ("CLIBRIDGE_TLS", "maybe")]).unwrap_err();
        assert!(err.to_string().contains("CLIBRIDGE_TLS"));

        let err = config_from(&[(API_KEY_VAR, "k"), ("CLIBRIDGE_CERT_MODE", "acme")]).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { .. }));
    }

    #[test]
    fn test_sub_configs() {
        let config = config_from(&[(API_KEY_VAR, "k"), ("CLIBRIDGE_GRACE_PERIOD_SECS", "2")]).unwrap();
        assert_eq!(config.registry_config().grace_period, Duration::from_secs(2));
        assert_eq!(config.certificate_config().hostname, "localhost");
        assert_eq!(config.gateway_config().api_key, "k");
    }
}
