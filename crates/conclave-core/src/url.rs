//! Session and registry URLs.
//!
//! The canonical form is `conclave://host:port/name`. The registry treats
//! the many names a local machine answers to (loopback literals, the bare
//! host name) as one host when comparing bindings.

use crate::error::ProtocolError;

/// A parsed `conclave://host:port/name` URL.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionUrl {
    pub host: String,
    pub port: u16,
    pub name: String,
}

impl SessionUrl {
    pub const SCHEME: &'static str = "conclave";

    pub fn parse(input: &str) -> Result<Self, ProtocolError> {
        let rest = input
            .strip_prefix("conclave://")
            .ok_or(ProtocolError::InvalidUrl)?;
        let (authority, name) = rest.split_once('/').ok_or(ProtocolError::InvalidUrl)?;
        if name.is_empty() || name.contains('/') {
            return Err(ProtocolError::InvalidUrl);
        }

        // IPv6 literals are bracketed: conclave://[::1]:4461/name
        let (host, port) = if let Some(bracketed) = authority.strip_prefix('[') {
            let (host, rest) = bracketed.split_once(']').ok_or(ProtocolError::InvalidUrl)?;
            let port = rest.strip_prefix(':').ok_or(ProtocolError::InvalidUrl)?;
            (host, port)
        } else {
            authority.split_once(':').ok_or(ProtocolError::InvalidUrl)?
        };
        if host.is_empty() {
            return Err(ProtocolError::InvalidUrl);
        }
        let port: u16 = port.parse().map_err(|_| ProtocolError::InvalidUrl)?;

        Ok(SessionUrl {
            host: host.to_string(),
            port,
            name: name.to_string(),
        })
    }

    /// The binding key: normalized host, port, and name. Two URLs that
    /// differ only in how they spell the local machine collide here.
    pub fn binding_key(&self) -> String {
        format!("{}:{}/{}", normalize_host(&self.host), self.port, self.name)
    }
}

impl std::fmt::Display for SessionUrl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.host.contains(':') {
            write!(f, "conclave://[{}]:{}/{}", self.host, self.port, self.name)
        } else {
            write!(f, "conclave://{}:{}/{}", self.host, self.port, self.name)
        }
    }
}

/// Collapse the aliases a machine answers to into one canonical form.
///
/// Loopback literals and the literal `localhost` all become `localhost`;
/// an address the local machine can bind becomes `localhost` too (covers
/// multiple local interface addresses). Everything else is lowercased.
pub fn normalize_host(host: &str) -> String {
    let lower = host.to_ascii_lowercase();
    if lower == "localhost" || lower == "127.0.0.1" || lower == "::1" {
        return "localhost".to_string();
    }
    if let Ok(addr) = lower.parse::<std::net::IpAddr>() {
        if addr.is_loopback() || is_local_addr(addr) {
            return "localhost".to_string();
        }
    }
    lower
}

/// True when the machine owns `addr` — probed by attempting to bind it.
fn is_local_addr(addr: std::net::IpAddr) -> bool {
    std::net::UdpSocket::bind((addr, 0)).is_ok()
}
