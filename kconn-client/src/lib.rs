//! # kconn Broker Client
//!
//! Purpose: Provide a blocking, single-broker transport for a length-prefixed
//! request/response protocol over TCP, with optional TLS.
//!
//! ## Design Principles
//! 1. **One Socket Per Owner**: A `BrokerConnection` owns its socket; clones
//!    start disconnected so each thread drives its own.
//! 2. **Opaque Payloads**: Requests go out as given and responses come back
//!    as the bytes of one frame; encoding lives elsewhere.
//! 3. **Self-Healing Transport**: A failed socket is closed and the next call
//!    redials. The failed request itself is never retried.
//! 4. **Fail Fast On Misconfiguration**: TLS options are validated when the
//!    connection is built, not when it first dials.

mod config;
mod connection;
mod stream;
pub mod tls;

pub use config::{ConnectionConfig, DEFAULT_SOCKET_TIMEOUT};
pub use connection::{BrokerConnection, ConnectionState};
pub use kconn_common::{
    collect_hosts, encode_frame, parse_hosts, ConnError, ConnResult, Endpoint, DEFAULT_PORT,
};
