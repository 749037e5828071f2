//! Backend Addresses
//!
//! Parses and normalizes `host:port` or unix socket endpoints into a
//! comparable, displayable form. Hostnames are resolved once and can be
//! re-resolved later with [`Address::refresh`]. Code running on the
//! runtime uses [`Address::lookup`], which does not block a worker.

use std::fmt;
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::PathBuf;

use crate::error::{Error, Result};

/// Port used when an address spec carries none
pub const DEFAULT_MYSQL_PORT: u16 = 3306;

/// Resolved endpoint family
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    /// TCP endpoint
    Inet(SocketAddr),
    /// Unix domain socket path
    Unix(PathBuf),
}

/// A resolved backend address
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Address {
    /// Address as originally given (may be a hostname)
    spec: String,
    /// Normalized "ip:port" (or socket path)
    name: String,
    endpoint: Endpoint,
}

impl Address {
    /// Parse and resolve an address spec, blocking on DNS
    pub fn resolve(spec: &str) -> Result<Self> {
        let spec = spec.trim();
        if let Some(local) = Self::local(spec)? {
            return Ok(local);
        }
        let socket = resolve_inet(spec)?;
        Ok(Self::inet(spec, socket))
    }

    /// Parse and resolve an address spec through the tokio resolver
    pub async fn lookup(spec: &str) -> Result<Self> {
        let spec = spec.trim();
        if let Some(local) = Self::local(spec)? {
            return Ok(local);
        }
        let socket = lookup_inet(spec).await?;
        Ok(Self::inet(spec, socket))
    }

    /// Specs that need no name resolution
    fn local(spec: &str) -> Result<Option<Self>> {
        if spec.is_empty() {
            return Err(Error::AddressResolution("<empty>".into()));
        }
        if !spec.starts_with('/') {
            return Ok(None);
        }
        Ok(Some(Self {
            spec: spec.to_string(),
            name: spec.to_string(),
            endpoint: Endpoint::Unix(PathBuf::from(spec)),
        }))
    }

    fn inet(spec: &str, socket: SocketAddr) -> Self {
        Self {
            spec: spec.to_string(),
            name: socket.to_string(),
            endpoint: Endpoint::Inet(socket),
        }
    }

    /// Normalized name used for equality checks ("ip:port")
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Address as originally configured
    pub fn spec(&self) -> &str {
        &self.spec
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Host part of the normalized name
    pub fn host(&self) -> String {
        match &self.endpoint {
            Endpoint::Inet(addr) => addr.ip().to_string(),
            Endpoint::Unix(path) => path.display().to_string(),
        }
    }

    /// Port, or 0 for unix sockets
    pub fn port(&self) -> u16 {
        match &self.endpoint {
            Endpoint::Inet(addr) => addr.port(),
            Endpoint::Unix(_) => 0,
        }
    }

    /// Re-resolve the original spec. Returns true if the resolved
    /// address changed (e.g. a hostname now points at another IP).
    pub async fn refresh(&mut self) -> Result<bool> {
        if let Endpoint::Unix(_) = self.endpoint {
            return Ok(false);
        }

        let socket = lookup_inet(&self.spec).await?;
        if Endpoint::Inet(socket) == self.endpoint {
            return Ok(false);
        }

        tracing::info!("Address {} re-resolved: {} -> {}", self.spec, self.name, socket);
        self.name = socket.to_string();
        self.endpoint = Endpoint::Inet(socket);
        Ok(true)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}

/// Split "host:port", "[v6]:port" or bare "host"
fn split_host_port(spec: &str) -> Result<(String, u16)> {
    if let Some(rest) = spec.strip_prefix('[') {
        let end = rest
            .find(']')
            .ok_or_else(|| Error::AddressResolution(spec.to_string()))?;
        let host = &rest[..end];
        let port = match rest[end + 1..].strip_prefix(':') {
            Some(p) => parse_port(spec, p)?,
            None => DEFAULT_MYSQL_PORT,
        };
        return Ok((host.to_string(), port));
    }

    match spec.rsplit_once(':') {
        // Bare IPv6 without brackets
        Some((host, _)) if host.contains(':') => Ok((spec.to_string(), DEFAULT_MYSQL_PORT)),
        Some((host, port)) => Ok((host.to_string(), parse_port(spec, port)?)),
        None => Ok((spec.to_string(), DEFAULT_MYSQL_PORT)),
    }
}

fn parse_port(spec: &str, port: &str) -> Result<u16> {
    port.parse::<u16>()
        .map_err(|_| Error::AddressResolution(format!("{}: bad port '{}'", spec, port)))
}

fn inet_host_port(spec: &str) -> Result<(String, u16)> {
    let (host, port) = split_host_port(spec)?;
    if host.is_empty() {
        return Err(Error::AddressResolution(spec.to_string()));
    }
    Ok((host, port))
}

/// Prefer IPv4 when a name resolves to both families
fn pick_socket(spec: &str, all: Vec<SocketAddr>) -> Result<SocketAddr> {
    all.iter()
        .find(|a| a.is_ipv4())
        .or_else(|| all.first())
        .copied()
        .ok_or_else(|| Error::AddressResolution(spec.to_string()))
}

fn resolve_inet(spec: &str) -> Result<SocketAddr> {
    let (host, port) = inet_host_port(spec)?;
    let all = (host.as_str(), port)
        .to_socket_addrs()
        .map_err(|e| Error::AddressResolution(format!("{}: {}", spec, e)))?
        .collect();
    pick_socket(spec, all)
}

async fn lookup_inet(spec: &str) -> Result<SocketAddr> {
    let (host, port) = inet_host_port(spec)?;
    let all = tokio::net::lookup_host((host.as_str(), port))
        .await
        .map_err(|e| Error::AddressResolution(format!("{}: {}", spec, e)))?
        .collect();
    pick_socket(spec, all)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_ip_port() {
        let addr = Address::resolve("10.0.0.1:3307").unwrap();
        assert_eq!(addr.name(), "10.0.0.1:3307");
        assert_eq!(addr.port(), 3307);
        assert_eq!(addr.host(), "10.0.0.1");
    }

    #[test]
    fn test_default_port() {
        let addr = Address::resolve("127.0.0.1").unwrap();
        assert_eq!(addr.name(), "127.0.0.1:3306");
    }

    #[test]
    fn test_ipv6_brackets() {
        let addr = Address::resolve("[::1]:3310").unwrap();
        assert_eq!(addr.port(), 3310);
        assert_eq!(addr.name(), "[::1]:3310");
    }

    #[test]
    fn test_unix_socket() {
        let addr = Address::resolve("/var/run/mysqld/mysqld.sock").unwrap();
        assert_eq!(addr.port(), 0);
        assert!(matches!(addr.endpoint(), Endpoint::Unix(_)));
    }

    #[test]
    fn test_bad_port_is_resolution_error() {
        let err = Address::resolve("10.0.0.1:notaport").unwrap_err();
        assert!(matches!(err, Error::AddressResolution(_)));
        assert!(Address::resolve("").is_err());
    }

    #[tokio::test]
    async fn test_refresh_stable_ip() {
        let mut addr = Address::resolve("127.0.0.1:3306").unwrap();
        assert!(!addr.refresh().await.unwrap());
    }

    #[tokio::test]
    async fn test_lookup_matches_resolve() {
        let looked_up = Address::lookup("localhost:3307").await.unwrap();
        assert_eq!(looked_up, Address::resolve("localhost:3307").unwrap());
        assert_eq!(looked_up.spec(), "localhost:3307");
        assert_eq!(looked_up.port(), 3307);

        assert!(Address::lookup("/tmp/mysql.sock").await.is_ok());
        assert!(matches!(
            Address::lookup("10.0.0.1:notaport").await,
            Err(Error::AddressResolution(_))
        ));
    }
}
