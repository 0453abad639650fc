//! # Broker Probe
//!
//! Purpose: Check that a broker answers framed requests, from the command
//! line, using the same transport the library exposes.
//!
//! Usage: `kconn-probe <hosts> [payload-file]`
//!
//! `hosts` is a comma-separated `host[:port]` list tried in random order. The
//! payload file (empty when omitted) is sent as one frame and the size of the
//! response frame is printed. Set `KCONN_CONFIG` to a JSON file to override
//! timeout and TLS settings; its `host` and `port` are replaced per endpoint.

use std::env;
use std::fs;

use anyhow::{bail, Context, Result};
use bytes::BytesMut;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use kconn_client::{encode_frame, parse_hosts, BrokerConnection, ConnectionConfig};

const PROBE_REQUEST_ID: i32 = 1;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let mut args = env::args().skip(1);
    let hosts = args.next().context("usage: kconn-probe <hosts> [payload-file]")?;
    let payload = match args.next() {
        Some(path) => fs::read(&path).with_context(|| format!("failed to read {}", path))?,
        None => Vec::new(),
    };

    let base = match env::var("KCONN_CONFIG") {
        Ok(path) => {
            let json = fs::read_to_string(&path)
                .with_context(|| format!("failed to read {}", path))?;
            let config = ConnectionConfig::from_json(&json)
                .with_context(|| format!("invalid config {}", path))?;
            Some(config)
        }
        Err(_) => None,
    };

    let mut request = BytesMut::new();
    encode_frame(&payload, &mut request)?;

    let endpoints = parse_hosts(&hosts, true);
    if endpoints.is_empty() {
        bail!("no hosts given");
    }

    for endpoint in &endpoints {
        let config = match &base {
            Some(base) => ConnectionConfig {
                host: endpoint.host.clone(),
                port: endpoint.port,
                ..base.clone()
            },
            None => ConnectionConfig::for_endpoint(endpoint),
        };

        // A bad TLS option fails the same way for every endpoint.
        let mut conn = BrokerConnection::new(config)?;
        match conn.request(PROBE_REQUEST_ID, &request) {
            Ok(response) => {
                info!(%endpoint, bytes = response.len(), "broker answered");
                println!("{} answered with {} bytes", endpoint, response.len());
                conn.close();
                return Ok(());
            }
            Err(err) => warn!(%endpoint, error = %err, "broker probe failed"),
        }
    }

    bail!("none of {} broker(s) answered", endpoints.len())
}
