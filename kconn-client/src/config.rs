//! # Connection Configuration
//!
//! Purpose: Describe one broker connection: where to dial, how long to block,
//! and which TLS options to apply.
//!
//! The configuration is immutable once a connection is built from it and is
//! shared read-only between a connection and its clones.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Deserializer};

use kconn_common::{Endpoint, DEFAULT_PORT};

/// Socket timeout applied when none is configured.
pub const DEFAULT_SOCKET_TIMEOUT: Duration = Duration::from_secs(120);

/// Configuration for a single broker connection.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ConnectionConfig {
    /// Broker host name or IP address.
    pub host: String,
    /// Broker port.
    #[serde(default = "default_port")]
    pub port: u16,
    /// Bound on connect, send and receive. `None` blocks indefinitely.
    ///
    /// In JSON this is a number of seconds; `null` disables the timeout.
    #[serde(default = "default_timeout", deserialize_with = "timeout_secs")]
    pub timeout: Option<Duration>,
    /// Raw TLS options, validated when the connection is built.
    #[serde(default)]
    pub tls_options: Option<BTreeMap<String, String>>,
}

impl ConnectionConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        ConnectionConfig {
            host: host.into(),
            port,
            timeout: Some(DEFAULT_SOCKET_TIMEOUT),
            tls_options: None,
        }
    }

    /// Configuration for a resolved endpoint with default settings.
    pub fn for_endpoint(endpoint: &Endpoint) -> Self {
        Self::new(endpoint.host.clone(), endpoint.port)
    }

    /// Parses a configuration from JSON.
    pub fn from_json(json: &str) -> serde_json::Result<Self> {
        serde_json::from_str(json)
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_tls_option(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tls_options
            .get_or_insert_with(BTreeMap::new)
            .insert(key.into(), value.into());
        self
    }

    pub fn endpoint(&self) -> Endpoint {
        Endpoint::new(self.host.clone(), self.port)
    }
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_timeout() -> Option<Duration> {
    Some(DEFAULT_SOCKET_TIMEOUT)
}

fn timeout_secs<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<f64>::deserialize(deserializer)? {
        None => Ok(None),
        Some(secs) if secs.is_finite() && secs > 0.0 => Ok(Some(Duration::from_secs_f64(secs))),
        Some(secs) => Err(serde::de::Error::custom(format!(
            "timeout must be a positive number of seconds, got {}",
            secs
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_to_missing_fields() {
        let config = ConnectionConfig::from_json(r#"{"host": "broker-1"}"#).unwrap();
        assert_eq!(config, ConnectionConfig::new("broker-1", DEFAULT_PORT));
        assert_eq!(config.timeout, Some(DEFAULT_SOCKET_TIMEOUT));
    }

    #[test]
    fn null_timeout_blocks_forever() {
        let config =
            ConnectionConfig::from_json(r#"{"host": "b", "port": 9093, "timeout": null}"#).unwrap();
        assert_eq!(config.port, 9093);
        assert_eq!(config.timeout, None);
    }

    #[test]
    fn fractional_timeout() {
        let config = ConnectionConfig::from_json(r#"{"host": "b", "timeout": 0.25}"#).unwrap();
        assert_eq!(config.timeout, Some(Duration::from_millis(250)));
    }

    #[test]
    fn rejects_non_positive_timeout() {
        assert!(ConnectionConfig::from_json(r#"{"host": "b", "timeout": 0}"#).is_err());
        assert!(ConnectionConfig::from_json(r#"{"host": "b", "timeout": -3}"#).is_err());
    }

    #[test]
    fn reads_tls_options() {
        let json = r#"{
            "host": "b",
            "tls_options": {"security.protocol": "SSL", "cert_reqs": "CERT_NONE"}
        }"#;
        let config = ConnectionConfig::from_json(json).unwrap();
        let expected = ConnectionConfig::new("b", DEFAULT_PORT)
            .with_tls_option("security.protocol", "SSL")
            .with_tls_option("cert_reqs", "CERT_NONE");
        assert_eq!(config, expected);
    }

    #[test]
    fn builds_from_endpoint() {
        let config = ConnectionConfig::for_endpoint(&Endpoint::new("b", 1234));
        assert_eq!(config.endpoint(), Endpoint::new("b", 1234));
    }
}
