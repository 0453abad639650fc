//! # Error Taxonomy
//!
//! Purpose: Classify every failure the broker client can surface so callers
//! can tell a dead transport apart from a configuration they must fix.
//!
//! ## Design Principles
//! 1. **Two Families**: Transport failures are recoverable by reconnecting;
//!    configuration errors are not, and retrying them is pointless.
//! 2. **Returned, Never Fatal**: A bad TLS option is an `Err`, leaving the
//!    decision to exit with the embedding program.
//! 3. **Context Carrying**: Transport failures name the broker endpoint and
//!    keep the underlying `io::Error` as their source.

use std::io;

use thiserror::Error;

use crate::endpoint::Endpoint;

/// Result type for broker client operations.
pub type ConnResult<T> = Result<T, ConnError>;

/// Errors surfaced by the broker client.
#[derive(Debug, Error)]
pub enum ConnError {
    /// The socket failed during dial, send, receive or TLS negotiation.
    ///
    /// The handle has already been closed when this is returned.
    #[error("broker @ {endpoint} went away: {source}")]
    Connection {
        endpoint: Endpoint,
        #[source]
        source: io::Error,
    },

    /// A TLS option key outside the recognized set.
    #[error("tls option \"{key}\" not supported")]
    UnsupportedTlsOption { key: String },

    /// A recognized TLS option with a value that cannot be used.
    #[error("tls option \"{key}\" is invalid: {reason}")]
    InvalidTlsOption { key: &'static str, reason: String },

    /// A connection setting that can never produce a working socket.
    #[error("invalid {field}: {reason}")]
    InvalidConfig { field: &'static str, reason: String },
}

impl ConnError {
    /// Builds a transport failure for the given broker.
    pub fn connection(endpoint: Endpoint, source: io::Error) -> Self {
        ConnError::Connection { endpoint, source }
    }

    /// Builds an invalid-value error for a recognized TLS key.
    pub fn invalid_tls(key: &'static str, reason: impl Into<String>) -> Self {
        ConnError::InvalidTlsOption {
            key,
            reason: reason.into(),
        }
    }

    /// True for failures that invalidate the socket; the next call redials.
    pub fn is_connection_failure(&self) -> bool {
        matches!(self, ConnError::Connection { .. })
    }

    /// True for misconfiguration that no reconnect can fix.
    pub fn is_configuration_error(&self) -> bool {
        matches!(
            self,
            ConnError::UnsupportedTlsOption { .. }
                | ConnError::InvalidTlsOption { .. }
                | ConnError::InvalidConfig { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_error_names_endpoint() {
        let err = ConnError::connection(
            Endpoint::new("broker-1", 9092),
            io::Error::new(io::ErrorKind::ConnectionReset, "reset"),
        );
        assert!(err.is_connection_failure());
        assert!(!err.is_configuration_error());
        assert_eq!(err.to_string(), "broker @ broker-1:9092 went away: reset");
    }

    #[test]
    fn tls_errors_are_configuration_errors() {
        let unknown = ConnError::UnsupportedTlsOption {
            key: "bogus".to_string(),
        };
        assert!(unknown.is_configuration_error());
        assert_eq!(unknown.to_string(), "tls option \"bogus\" not supported");

        let invalid = ConnError::invalid_tls("cert_reqs", "unknown mode");
        assert!(invalid.is_configuration_error());
        assert!(!invalid.is_connection_failure());
    }

    #[test]
    fn invalid_config_is_configuration_error() {
        let err = ConnError::InvalidConfig {
            field: "timeout",
            reason: "must be greater than zero".to_string(),
        };
        assert!(err.is_configuration_error());
        assert_eq!(err.to_string(), "invalid timeout: must be greater than zero");
    }
}
