//! # TLS Upgrade
//!
//! Purpose: Validate the TLS option map and wrap a freshly dialed socket in a
//! client-side TLS session before any frame is exchanged.
//!
//! ## Design Principles
//! 1. **Closed Option Set**: Every key is checked against a fixed list; an
//!    unknown key is a configuration error returned before any socket I/O.
//! 2. **Build Once**: Certificates and keys are loaded when the connection is
//!    constructed, and the resulting `ClientConfig` is shared by all redials.
//! 3. **Eager Handshake**: The handshake completes inside the upgrade, so a
//!    negotiation failure surfaces as a transport error on the dial.
//! 4. **Verification Off By Default**: Peer certificates are only checked
//!    when `cert_reqs` asks for it.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{self, BufReader};
use std::net::TcpStream;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{ring, CryptoProvider};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::{
    ClientConfig, ClientConnection, DigitallySignedStruct, RootCertStore, SignatureScheme,
    StreamOwned, SupportedCipherSuite,
};
use tracing::{debug, warn};

use kconn_common::{ConnError, ConnResult};

/// Selects the security protocol; TLS is enabled when it equals `SSL`.
pub const SECURITY_PROTOCOL: &str = "security.protocol";
/// PEM private key for client authentication.
pub const KEYFILE: &str = "keyfile";
/// PEM certificate chain for client authentication.
pub const CERTFILE: &str = "certfile";
/// Peer verification mode.
pub const CERT_REQS: &str = "cert_reqs";
/// PEM bundle of trusted CA certificates.
pub const CA_CERTS: &str = "ca_certs";
/// Colon-separated cipher suite names.
pub const CIPHERS: &str = "ciphers";

const SUPPORTED_OPTIONS: &[&str] = &[
    SECURITY_PROTOCOL,
    KEYFILE,
    CERTFILE,
    CERT_REQS,
    CA_CERTS,
    CIPHERS,
];

/// A TLS stream over a blocking TCP socket.
pub type TlsStream = StreamOwned<ClientConnection, TcpStream>;

/// How strictly the broker certificate is checked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CertRequirement {
    /// Accept any certificate.
    #[default]
    None,
    /// Treated as `Required` on the client side of a handshake.
    Optional,
    /// The chain must verify against `ca_certs`.
    Required,
}

impl CertRequirement {
    /// Parses `CERT_NONE`, `CERT_OPTIONAL` or `CERT_REQUIRED`.
    ///
    /// Matching is case-insensitive and the `CERT_` prefix may be omitted.
    pub fn parse(value: &str) -> ConnResult<Self> {
        let upper = value.trim().to_ascii_uppercase();
        match upper.strip_prefix("CERT_").unwrap_or(&upper) {
            "NONE" => Ok(CertRequirement::None),
            "OPTIONAL" => Ok(CertRequirement::Optional),
            "REQUIRED" => Ok(CertRequirement::Required),
            _ => Err(ConnError::invalid_tls(
                CERT_REQS,
                format!("unknown verification mode \"{}\"", value),
            )),
        }
    }

    pub fn verifies_peer(self) -> bool {
        self != CertRequirement::None
    }
}

/// Parsed and validated TLS options.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TlsOptions {
    /// True when `security.protocol` selects SSL.
    pub enabled: bool,
    pub keyfile: Option<PathBuf>,
    pub certfile: Option<PathBuf>,
    pub cert_reqs: CertRequirement,
    pub ca_certs: Option<PathBuf>,
    pub ciphers: Option<Vec<String>>,
}

impl TlsOptions {
    /// Validates a raw option map.
    ///
    /// Keys are checked even when TLS is not enabled by the map.
    pub fn from_map(options: &BTreeMap<String, String>) -> ConnResult<Self> {
        if let Some(key) = options
            .keys()
            .find(|key| !SUPPORTED_OPTIONS.contains(&key.as_str()))
        {
            return Err(ConnError::UnsupportedTlsOption { key: key.clone() });
        }

        let path = |key: &str| options.get(key).map(PathBuf::from);
        let parsed = TlsOptions {
            enabled: options
                .get(SECURITY_PROTOCOL)
                .map_or(false, |value| value.trim().eq_ignore_ascii_case("SSL")),
            keyfile: path(KEYFILE),
            certfile: path(CERTFILE),
            cert_reqs: match options.get(CERT_REQS) {
                Some(value) => CertRequirement::parse(value)?,
                None => CertRequirement::None,
            },
            ca_certs: path(CA_CERTS),
            ciphers: options.get(CIPHERS).map(|value| {
                value
                    .split(':')
                    .map(str::trim)
                    .filter(|name| !name.is_empty())
                    .map(str::to_string)
                    .collect()
            }),
        };

        if parsed.keyfile.is_some() && parsed.certfile.is_none() {
            return Err(ConnError::invalid_tls(KEYFILE, "keyfile requires certfile"));
        }
        if parsed.cert_reqs.verifies_peer() && parsed.ca_certs.is_none() {
            return Err(ConnError::invalid_tls(
                CA_CERTS,
                "peer verification requires a CA bundle",
            ));
        }
        if matches!(&parsed.ciphers, Some(names) if names.is_empty()) {
            return Err(ConnError::invalid_tls(CIPHERS, "empty cipher list"));
        }

        for key in parsed.ignored_keys(options) {
            warn!(key, "tls option ignored");
        }

        debug!(
            keyfile = ?parsed.keyfile,
            certfile = ?parsed.certfile,
            ca_certs = ?parsed.ca_certs,
            ciphers = ?parsed.ciphers,
            cert_reqs = ?parsed.cert_reqs,
            "parsed tls options"
        );
        Ok(parsed)
    }

    /// Keys present in `options` that have no effect with these settings.
    ///
    /// Everything but `security.protocol` is unused while TLS is disabled,
    /// and `ca_certs` is unused without peer verification.
    pub fn ignored_keys<'a>(&self, options: &'a BTreeMap<String, String>) -> Vec<&'a str> {
        options
            .keys()
            .map(String::as_str)
            .filter(|key| *key != SECURITY_PROTOCOL)
            .filter(|key| !self.enabled || (*key == CA_CERTS && !self.cert_reqs.verifies_peer()))
            .collect()
    }

    /// Loads certificates and keys and builds the rustls client config.
    pub fn build_client_config(&self) -> ConnResult<Arc<ClientConfig>> {
        let provider = Arc::new(self.crypto_provider()?);
        let builder = ClientConfig::builder_with_provider(Arc::clone(&provider))
            .with_safe_default_protocol_versions()
            .map_err(|e| ConnError::invalid_tls(CIPHERS, e.to_string()))?;

        let builder = match (&self.ca_certs, self.cert_reqs.verifies_peer()) {
            (Some(ca_path), true) => {
                let mut roots = RootCertStore::empty();
                for cert in load_certs(ca_path, CA_CERTS)? {
                    roots.add(cert).map_err(|e| {
                        ConnError::invalid_tls(CA_CERTS, format!("failed to add CA cert: {}", e))
                    })?;
                }
                builder.with_root_certificates(roots)
            }
            _ => builder
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(NoVerification(provider))),
        };

        let config = match &self.certfile {
            Some(certfile) => {
                let certs = load_certs(certfile, CERTFILE)?;
                let (key_path, key_option) = match &self.keyfile {
                    Some(keyfile) => (keyfile, KEYFILE),
                    None => (certfile, CERTFILE),
                };
                let key = load_private_key(key_path, key_option)?;
                builder
                    .with_client_auth_cert(certs, key)
                    .map_err(|e| ConnError::invalid_tls(CERTFILE, e.to_string()))?
            }
            None => builder.with_no_client_auth(),
        };

        Ok(Arc::new(config))
    }

    fn crypto_provider(&self) -> ConnResult<CryptoProvider> {
        let mut provider = ring::default_provider();
        if let Some(names) = &self.ciphers {
            provider.cipher_suites = select_cipher_suites(names, &provider.cipher_suites)?;
        }
        Ok(provider)
    }
}

/// Wraps sockets in TLS sessions using a prebuilt client config.
#[derive(Debug, Clone)]
pub struct TlsConnector {
    config: Arc<ClientConfig>,
}

impl TlsConnector {
    /// Validates the option map and builds a connector when TLS is enabled.
    ///
    /// Returns `Ok(None)` for a map that does not select SSL.
    pub fn from_map(options: &BTreeMap<String, String>) -> ConnResult<Option<Self>> {
        let options = TlsOptions::from_map(options)?;
        if !options.enabled {
            return Ok(None);
        }
        Ok(Some(TlsConnector {
            config: options.build_client_config()?,
        }))
    }

    /// Performs the client handshake on `sock`.
    ///
    /// The socket timeouts already set on `sock` bound the handshake.
    pub fn upgrade(&self, mut sock: TcpStream, host: &str) -> io::Result<TlsStream> {
        let server_name = ServerName::try_from(host.to_string()).map_err(|e| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("invalid server name {}: {}", host, e),
            )
        })?;
        let mut conn = ClientConnection::new(Arc::clone(&self.config), server_name)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, format!("tls setup failed: {}", e)))?;

        while conn.is_handshaking() {
            let (read, written) = conn.complete_io(&mut sock)?;
            if read == 0 && written == 0 && conn.is_handshaking() {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "peer closed the socket during tls handshake",
                ));
            }
        }

        debug!(
            host,
            protocol = ?conn.protocol_version(),
            suite = ?conn.negotiated_cipher_suite().map(|s| s.suite()),
            "tls handshake complete"
        );
        Ok(StreamOwned::new(conn, sock))
    }
}

fn select_cipher_suites(
    names: &[String],
    available: &[SupportedCipherSuite],
) -> ConnResult<Vec<SupportedCipherSuite>> {
    names
        .iter()
        .map(|name| {
            available
                .iter()
                .find(|suite| format!("{:?}", suite.suite()).eq_ignore_ascii_case(name))
                .copied()
                .ok_or_else(|| {
                    ConnError::invalid_tls(
                        CIPHERS,
                        format!("unsupported cipher suite \"{}\"", name),
                    )
                })
        })
        .collect()
}

fn load_certs(path: &Path, option: &'static str) -> ConnResult<Vec<CertificateDer<'static>>> {
    let file = File::open(path).map_err(|e| {
        ConnError::invalid_tls(option, format!("failed to open {}: {}", path.display(), e))
    })?;
    let mut reader = BufReader::new(file);

    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut reader)
        .filter_map(Result::ok)
        .collect();

    if certs.is_empty() {
        return Err(ConnError::invalid_tls(
            option,
            format!("no certificates found in {}", path.display()),
        ));
    }
    Ok(certs)
}

fn load_private_key(path: &Path, option: &'static str) -> ConnResult<PrivateKeyDer<'static>> {
    let file = File::open(path).map_err(|e| {
        ConnError::invalid_tls(option, format!("failed to open {}: {}", path.display(), e))
    })?;
    let mut reader = BufReader::new(file);

    match rustls_pemfile::private_key(&mut reader) {
        Ok(Some(key)) => Ok(key),
        Ok(None) => Err(ConnError::invalid_tls(
            option,
            format!("no private key found in {}", path.display()),
        )),
        Err(e) => Err(ConnError::invalid_tls(
            option,
            format!("failed to parse {}: {}", path.display(), e),
        )),
    }
}

/// Accepts any server certificate while still checking handshake signatures.
#[derive(Debug)]
struct NoVerification(Arc<CryptoProvider>);

impl ServerCertVerifier for NoVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}
