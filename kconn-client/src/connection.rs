//! # Broker Connection
//!
//! Purpose: Own exactly one socket to one broker, exchange length-prefixed
//! frames over it, and rebuild it transparently after a transport failure.
//!
//! ## Design Principles
//! 1. **Owned, Not Shared**: A `BrokerConnection` holds its socket by value.
//!    Sharing configuration across threads is done by cloning, which yields a
//!    disconnected copy with its own future socket.
//! 2. **Tear Down Before Reporting**: Every transport error closes the socket
//!    before it is returned, so the caller never sees a half-open handle.
//! 3. **Lazy Redial**: `send` and `recv` dial when disconnected; one attempt
//!    per call, no retry loop.
//! 4. **Half-Duplex**: Each `send` must be followed by a `recv`. This is the
//!    caller's contract and is not enforced here.
//!
//! ## State Machine
//!
//! ```text
//!                  reinitialize (ok)
//!  Disconnected --------------------> Connected
//!       ^                                 |
//!       +----- close() / I/O failure -----+
//! ```

use std::fmt;
use std::io::{self, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tracing::{debug, error};

use kconn_common::{read_frame, ConnError, ConnResult, Endpoint};

use crate::config::ConnectionConfig;
use crate::stream::BrokerStream;
use crate::tls::TlsConnector;

/// Observable connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connected,
}

/// Read-only data shared by a connection and all of its clones.
#[derive(Debug)]
struct Shared {
    config: ConnectionConfig,
    endpoint: Endpoint,
    tls: Option<TlsConnector>,
}

/// A blocking, single-socket connection to one broker.
///
/// Not meant for concurrent use: all I/O takes `&mut self`. To hand the
/// connection's settings to another thread, `clone()` it and move the clone;
/// the clone starts disconnected.
pub struct BrokerConnection {
    shared: Arc<Shared>,
    stream: Option<BrokerStream>,
}

impl BrokerConnection {
    /// Builds a disconnected connection.
    ///
    /// The timeout and TLS options are validated, and TLS files loaded,
    /// here, before any socket is opened.
    pub fn new(config: ConnectionConfig) -> ConnResult<Self> {
        if config.timeout == Some(Duration::ZERO) {
            return Err(ConnError::InvalidConfig {
                field: "timeout",
                reason: "must be greater than zero; use None to block indefinitely"
                    .to_string(),
            });
        }
        let tls = match &config.tls_options {
            Some(options) => TlsConnector::from_map(options)?,
            None => None,
        };
        let endpoint = config.endpoint();
        Ok(BrokerConnection {
            shared: Arc::new(Shared {
                config,
                endpoint,
                tls,
            }),
            stream: None,
        })
    }

    /// Builds a connection and dials it immediately.
    pub fn connect(config: ConnectionConfig) -> ConnResult<Self> {
        let mut conn = Self::new(config)?;
        conn.reinitialize()?;
        Ok(conn)
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.shared.config
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.shared.endpoint
    }

    pub fn state(&self) -> ConnectionState {
        if self.stream.is_some() {
            ConnectionState::Connected
        } else {
            ConnectionState::Disconnected
        }
    }

    pub fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    /// Closes any current socket and dials a fresh one.
    ///
    /// On failure the connection is left disconnected.
    pub fn reinitialize(&mut self) -> ConnResult<()> {
        let shared = Arc::clone(&self.shared);
        let endpoint = &shared.endpoint;
        debug!(host = %endpoint.host, port = endpoint.port, "reinitializing socket connection");

        if self.stream.is_some() {
            self.close();
        }

        match self.dial() {
            Ok(stream) => {
                self.stream = Some(stream);
                Ok(())
            }
            Err(err) => {
                error!(
                    host = %endpoint.host,
                    port = endpoint.port,
                    error = %err,
                    "unable to connect to broker"
                );
                Err(ConnError::connection(endpoint.clone(), err))
            }
        }
    }

    /// Writes an already-encoded request in full.
    ///
    /// `request_id` is only used for log correlation. On failure the request
    /// must be assumed lost.
    pub fn send(&mut self, request_id: i32, payload: &[u8]) -> ConnResult<()> {
        debug!(request_id, bytes = payload.len(), "about to send request to broker");
        self.with_stream("send payload to", |stream| {
            stream.write_all(payload)?;
            stream.flush()
        })
    }

    /// Reads one response frame and returns its payload.
    ///
    /// `request_id` is only used for log correlation.
    pub fn recv(&mut self, request_id: i32) -> ConnResult<Bytes> {
        debug!(request_id, "reading response from broker");
        let payload = self.with_stream("receive data from", |stream| read_frame(stream))?;
        debug!(request_id, bytes = payload.len(), "received response from broker");
        Ok(payload)
    }

    /// Sends a request and waits for its response.
    pub fn request(&mut self, request_id: i32, payload: &[u8]) -> ConnResult<Bytes> {
        self.send(request_id, payload)?;
        self.recv(request_id)
    }

    /// Shuts down and closes the socket. A no-op when disconnected.
    pub fn close(&mut self) {
        let endpoint = &self.shared.endpoint;
        debug!(host = %endpoint.host, port = endpoint.port, "closing socket connection");
        match self.stream.take() {
            Some(stream) => stream.shutdown(),
            None => debug!("no socket found to close"),
        }
    }

    /// Runs one I/O operation, dialing first if needed.
    ///
    /// Any I/O error closes the socket before it is returned.
    fn with_stream<T>(
        &mut self,
        action: &'static str,
        op: impl FnOnce(&mut BrokerStream) -> io::Result<T>,
    ) -> ConnResult<T> {
        if self.stream.is_none() {
            self.reinitialize()?;
        }

        let result = match self.stream.as_mut() {
            Some(stream) => op(stream),
            None => Err(io::Error::new(io::ErrorKind::NotConnected, "no socket")),
        };

        result.map_err(|err| {
            let endpoint = self.shared.endpoint.clone();
            error!(
                host = %endpoint.host,
                port = endpoint.port,
                error = %err,
                "unable to {} broker",
                action
            );
            self.close();
            ConnError::connection(endpoint, err)
        })
    }

    fn dial(&self) -> io::Result<BrokerStream> {
        let config = &self.shared.config;
        let mut last_err = None;

        for addr in (config.host.as_str(), config.port).to_socket_addrs()? {
            let attempt = match config.timeout {
                Some(timeout) => TcpStream::connect_timeout(&addr, timeout),
                None => TcpStream::connect(addr),
            };
            match attempt {
                Ok(sock) => return self.prepare(sock),
                Err(err) => {
                    debug!(%addr, error = %err, "connect attempt failed");
                    last_err = Some(err);
                }
            }
        }

        Err(last_err.unwrap_or_else(|| {
            io::Error::new(io::ErrorKind::NotFound, "host resolved to no addresses")
        }))
    }

    fn prepare(&self, sock: TcpStream) -> io::Result<BrokerStream> {
        let config = &self.shared.config;
        sock.set_read_timeout(config.timeout)?;
        sock.set_write_timeout(config.timeout)?;
        // Requests are small and latency bound.
        sock.set_nodelay(true)?;

        match &self.shared.tls {
            Some(connector) => {
                let tls = connector.upgrade(sock, &config.host)?;
                Ok(BrokerStream::Tls(Box::new(tls)))
            }
            None => Ok(BrokerStream::Plain(sock)),
        }
    }
}

impl Clone for BrokerConnection {
    /// Returns a disconnected copy sharing this connection's configuration.
    ///
    /// The copy dials its own socket on first use or on `reinitialize`.
    fn clone(&self) -> Self {
        BrokerConnection {
            shared: Arc::clone(&self.shared),
            stream: None,
        }
    }
}

impl Drop for BrokerConnection {
    fn drop(&mut self) {
        if let Some(stream) = self.stream.take() {
            stream.shutdown();
        }
    }
}

impl fmt::Display for BrokerConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "<BrokerConnection host={} port={}>",
            self.shared.endpoint.host, self.shared.endpoint.port
        )
    }
}

impl fmt::Debug for BrokerConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BrokerConnection")
            .field("endpoint", &self.shared.endpoint)
            .field("state", &self.state())
            .finish()
    }
}
