//! # Endpoint Resolver
//!
//! Purpose: Turn a broker host list such as `"a:1, b, c:3"` into an ordered
//! list of `(host, port)` endpoints.
//!
//! ## Design Principles
//! 1. **Pure Function**: No state and no DNS; resolution happens at dial time.
//! 2. **Never Fails**: A malformed token is kept as-is and fails when dialed.
//! 3. **Load Spreading**: Optional shuffling distributes clients over brokers.

use std::fmt;
use std::net::Ipv6Addr;

use rand::seq::SliceRandom;

/// Port used when a host token carries none.
pub const DEFAULT_PORT: u16 = 9092;

/// A broker address. Equality is by value only.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Endpoint {
            host: host.into(),
            port,
        }
    }

    /// Parses a single `host` or `host:port` token.
    ///
    /// Bracketed IPv6 literals (`[::1]:9092`) are unwrapped. A port that is
    /// not a valid `u16` leaves the whole token as the host, so the error
    /// shows up when the address is dialed.
    pub fn parse(token: &str) -> Self {
        let token = token.trim();
        if let Some((host, port)) = token.rsplit_once(':') {
            let host = host.trim();
            let bracketed = host.starts_with('[') && host.ends_with(']');
            if bracketed || !host.contains(':') {
                if let Ok(port) = port.trim().parse::<u16>() {
                    let host = host.trim_start_matches('[').trim_end_matches(']');
                    return Endpoint::new(host, port);
                }
            }
        }
        Endpoint::new(token, DEFAULT_PORT)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.parse::<Ipv6Addr>().is_ok() {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// Collects already-split host tokens into endpoints.
///
/// Empty tokens are skipped. With `randomize`, the result is a uniformly
/// random permutation of the parsed list.
pub fn collect_hosts<I, S>(hosts: I, randomize: bool) -> Vec<Endpoint>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut result: Vec<Endpoint> = hosts
        .into_iter()
        .filter(|token| !token.as_ref().trim().is_empty())
        .map(|token| Endpoint::parse(token.as_ref()))
        .collect();

    if randomize {
        result.shuffle(&mut rand::thread_rng());
    }
    result
}

/// Splits a comma-separated host list and collects it.
pub fn parse_hosts(hosts: &str, randomize: bool) -> Vec<Endpoint> {
    collect_hosts(hosts.trim().split(','), randomize)
}
