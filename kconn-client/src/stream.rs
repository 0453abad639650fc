//! # Broker Socket
//!
//! Purpose: Give the transport a single `Read + Write` handle whether the
//! connection is plaintext or TLS.
//!
//! ## Design Principles
//! 1. **Closed Variants**: An enum rather than a trait object; there are only
//!    two socket kinds and both are known at compile time.
//! 2. **Best-Effort Shutdown**: Closing never fails. Errors from a peer that
//!    already hung up are logged and ignored; the descriptor is released on
//!    drop regardless.

use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream};

use tracing::debug;

use crate::tls::TlsStream;

/// A live socket to a broker.
pub(crate) enum BrokerStream {
    Plain(TcpStream),
    Tls(Box<TlsStream>),
}

impl BrokerStream {
    /// Shuts down both directions and closes the socket.
    pub(crate) fn shutdown(self) {
        match self {
            BrokerStream::Plain(sock) => shutdown_socket(&sock),
            BrokerStream::Tls(tls) => {
                let mut tls = *tls;
                tls.conn.send_close_notify();
                while tls.conn.wants_write() {
                    match tls.conn.write_tls(&mut tls.sock) {
                        Ok(0) | Err(_) => break,
                        Ok(_) => {}
                    }
                }
                shutdown_socket(&tls.sock);
            }
        }
    }
}

fn shutdown_socket(sock: &TcpStream) {
    // The peer may have closed first; that is not an error here.
    if let Err(err) = sock.shutdown(Shutdown::Both) {
        debug!(error = %err, "socket shutdown failed");
    }
}

impl Read for BrokerStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            BrokerStream::Plain(sock) => sock.read(buf),
            BrokerStream::Tls(tls) => tls.read(buf),
        }
    }
}

impl Write for BrokerStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            BrokerStream::Plain(sock) => sock.write(buf),
            BrokerStream::Tls(tls) => tls.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            BrokerStream::Plain(sock) => sock.flush(),
            BrokerStream::Tls(tls) => tls.flush(),
        }
    }
}
