use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{MimicError, Result};

pub const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_HTTP_KEEP_ALIVE: Duration = Duration::from_secs(30);
pub const DEFAULT_IDLE_CONN_TIMEOUT: Duration = Duration::from_secs(90);
pub const DEFAULT_TLS_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Per-request description of how the egress side should reach the origin.
///
/// Numeric fields are seconds; zero means "use the default".
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Hostname to send the HTTP request to.
    #[serde(rename = "Host")]
    pub host: String,

    /// `http` or `https`.
    #[serde(rename = "Scheme")]
    pub scheme: String,

    /// Named fingerprint profile, e.g. `Chrome120`.
    #[serde(rename = "Fingerprint")]
    pub fingerprint: String,

    /// Hex encoded ClientHello. Takes precedence over `fingerprint` when set.
    #[serde(rename = "HexClientHello")]
    pub hex_client_hello: String,

    #[serde(rename = "HttpTimeout")]
    pub http_timeout: u64,

    #[serde(rename = "HttpKeepAliveInterval")]
    pub http_keep_alive_interval: u64,

    #[serde(rename = "IdleConnTimeout")]
    pub idle_conn_timeout: u64,

    #[serde(rename = "TLSHandshakeTimeout", alias = "TlsHandshakeTimeout")]
    pub tls_handshake_timeout: u64,

    /// Prefer the fingerprint captured from the real client for the same server name.
    #[serde(rename = "UseInterceptedFingerprint")]
    pub use_intercepted_fingerprint: bool,
}

/// Timeouts after the zero-value defaults have been applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    pub connect: Duration,
    pub keep_alive: Duration,
    pub idle: Duration,
    pub handshake: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            connect: DEFAULT_HTTP_TIMEOUT,
            keep_alive: DEFAULT_HTTP_KEEP_ALIVE,
            idle: DEFAULT_IDLE_CONN_TIMEOUT,
            handshake: DEFAULT_TLS_HANDSHAKE_TIMEOUT,
        }
    }
}

fn seconds_or(value: u64, default: Duration) -> Duration {
    if value == 0 {
        default
    } else {
        Duration::from_secs(value)
    }
}

impl TransportConfig {
    /// Parses a JSON configuration document.
    pub fn parse(data: &str) -> Result<Self> {
        if data.trim().is_empty() {
            return Err(MimicError::Configuration(
                "missing transport configuration".to_string(),
            ));
        }

        serde_json::from_str(data).map_err(|e| {
            MimicError::Configuration(format!("invalid transport configuration: {e}"))
        })
    }

    pub fn timeouts(&self) -> Timeouts {
        Timeouts {
            connect: seconds_or(self.http_timeout, DEFAULT_HTTP_TIMEOUT),
            keep_alive: seconds_or(self.http_keep_alive_interval, DEFAULT_HTTP_KEEP_ALIVE),
            idle: seconds_or(self.idle_conn_timeout, DEFAULT_IDLE_CONN_TIMEOUT),
            handshake: seconds_or(self.tls_handshake_timeout, DEFAULT_TLS_HANDSHAKE_TIMEOUT),
        }
    }

    /// Whether a literal ClientHello overrides the named profile.
    pub fn has_literal_hello(&self) -> bool {
        !self.hex_client_hello.trim().is_empty()
    }

    /// Copy of this configuration aimed at another origin.
    pub fn with_target(&self, scheme: &str, host: &str) -> Self {
        Self {
            scheme: scheme.to_string(),
            host: host.to_string(),
            ..self.clone()
        }
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self)
            .map_err(|e| MimicError::Configuration(format!("encode transport configuration: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_is_rejected() {
        for doc in ["", "   ", "\n\t"] {
            match TransportConfig::parse(doc) {
                Err(MimicError::Configuration(msg)) => {
                    assert_eq!(msg, "missing transport configuration")
                }
                other => panic!("unexpected result: {other:?}"),
            }
        }
    }

    #[test]
    fn malformed_document_is_a_configuration_error() {
        assert!(matches!(
            TransportConfig::parse("{\"Host\": 12"),
            Err(MimicError::Configuration(_))
        ));
    }

    #[test]
    fn zero_fields_fall_back_to_defaults() {
        let config = TransportConfig::parse(r#"{"Host":"example.com","Scheme":"https"}"#).unwrap();
        let timeouts = config.timeouts();
        assert_eq!(timeouts.connect, Duration::from_secs(30));
        assert_eq!(timeouts.keep_alive, Duration::from_secs(30));
        assert_eq!(timeouts.idle, Duration::from_secs(90));
        assert_eq!(timeouts.handshake, Duration::from_secs(10));
        assert_eq!(timeouts, Timeouts::default());
    }

    #[test]
    fn explicit_timeouts_override_defaults() {
        let config = TransportConfig::parse(
            r#"{"HttpTimeout":5,"HttpKeepAliveInterval":7,"IdleConnTimeout":11,"TLSHandshakeTimeout":3}"#,
        )
        .unwrap();
        let timeouts = config.timeouts();
        assert_eq!(timeouts.connect, Duration::from_secs(5));
        assert_eq!(timeouts.keep_alive, Duration::from_secs(7));
        assert_eq!(timeouts.idle, Duration::from_secs(11));
        assert_eq!(timeouts.handshake, Duration::from_secs(3));
    }

    #[test]
    fn accepts_full_document_and_handshake_alias() {
        let config = TransportConfig::parse(
            r#"{
                "Host": "example.com",
                "Scheme": "https",
                "Fingerprint": "Chrome120",
                "HexClientHello": "",
                "TlsHandshakeTimeout": 4,
                "UseInterceptedFingerprint": true,
                "SomethingElse": 1
            }"#,
        )
        .unwrap();
        assert_eq!(config.host, "example.com");
        assert_eq!(config.fingerprint, "Chrome120");
        assert_eq!(config.tls_handshake_timeout, 4);
        assert!(config.use_intercepted_fingerprint);
        assert!(!config.has_literal_hello());
    }

    #[test]
    fn serializes_with_document_field_names() {
        let config = TransportConfig {
            host: "example.com".into(),
            tls_handshake_timeout: 2,
            ..Default::default()
        };
        let json = config.to_json().unwrap();
        assert!(json.contains("\"Host\""));
        assert!(json.contains("\"TLSHandshakeTimeout\": 2"));
        assert_eq!(TransportConfig::parse(&json).unwrap(), config);
    }
}
