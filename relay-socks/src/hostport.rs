//! `HOST:PORT` argument parsing.
//!
//! All relay binaries take their listen and upstream addresses in the same
//! shape: `HOST:PORT`, a bare port when the caller configures a default
//! host, or a bare host when it configures a default port. Upstream routes
//! additionally accept the literal `direct`, which disables the SOCKS hop.

use std::fmt;

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AddrError {
    #[error("empty address")]
    Empty,
    #[error("invalid port in {0:?}")]
    BadPort(String),
    #[error("no host in {0:?} and no default host configured")]
    MissingHost(String),
    #[error("no port in {0:?} and no default port configured")]
    MissingPort(String),
}

/// A resolvable endpoint. The host part stays a string so that DNS names
/// survive untouched until connect time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostPort {
    pub host: String,
    pub port: u16,
}

impl HostPort {
    pub fn parse(
        s: &str,
        default_host: Option<&str>,
        default_port: Option<u16>,
    ) -> Result<Self, AddrError> {
        let s = s.trim();
        if s.is_empty() {
            return Err(AddrError::Empty);
        }
        if let Some((host, port)) = s.rsplit_once(':') {
            let port = port
                .parse::<u16>()
                .map_err(|_| AddrError::BadPort(s.to_string()))?;
            let host = if host.is_empty() {
                default_host
                    .ok_or_else(|| AddrError::MissingHost(s.to_string()))?
                    .to_string()
            } else {
                host.to_string()
            };
            return Ok(HostPort { host, port });
        }
        // No colon: a bare port if it parses as one, otherwise a bare host.
        if let Ok(port) = s.parse::<u16>() {
            let host = default_host
                .ok_or_else(|| AddrError::MissingHost(s.to_string()))?
                .to_string();
            return Ok(HostPort { host, port });
        }
        let port = default_port.ok_or_else(|| AddrError::MissingPort(s.to_string()))?;
        Ok(HostPort {
            host: s.to_string(),
            port,
        })
    }
}

impl fmt::Display for HostPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Upstream route: either straight to the destination or through another
/// SOCKS5 proxy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Via {
    Direct,
    Socks(HostPort),
}

impl Via {
    pub fn parse(
        s: &str,
        default_host: Option<&str>,
        default_port: Option<u16>,
    ) -> Result<Self, AddrError> {
        if s.trim() == "direct" {
            return Ok(Via::Direct);
        }
        HostPort::parse(s, default_host, default_port).map(Via::Socks)
    }
}

impl fmt::Display for Via {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Via::Direct => write!(f, "direct"),
            Via::Socks(hp) => write!(f, "{}", hp),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_hostport() {
        let hp = HostPort::parse("127.0.0.1:1666", None, None).unwrap();
        assert_eq!(hp.host, "127.0.0.1");
        assert_eq!(hp.port, 1666);
    }

    #[test]
    fn test_bare_port_uses_default_host() {
        let hp = HostPort::parse("2666", Some("0.0.0.0"), None).unwrap();
        assert_eq!(hp.host, "0.0.0.0");
        assert_eq!(hp.port, 2666);

        assert_eq!(
            HostPort::parse("2666", None, Some(1)),
            Err(AddrError::MissingHost("2666".to_string()))
        );
    }

    #[test]
    fn test_bare_host_uses_default_port() {
        let hp = HostPort::parse("proxy.lan", None, Some(1080)).unwrap();
        assert_eq!(hp.host, "proxy.lan");
        assert_eq!(hp.port, 1080);

        assert_eq!(
            HostPort::parse("proxy.lan", Some("h"), None),
            Err(AddrError::MissingPort("proxy.lan".to_string()))
        );
    }

    #[test]
    fn test_empty_host_part() {
        let hp = HostPort::parse(":443", Some("127.0.0.1"), None).unwrap();
        assert_eq!(hp.host, "127.0.0.1");
        assert_eq!(hp.port, 443);
    }

    #[test]
    fn test_bad_port() {
        assert!(matches!(
            HostPort::parse("host:notaport", None, None),
            Err(AddrError::BadPort(_))
        ));
    }

    #[test]
    fn test_via_direct() {
        assert_eq!(Via::parse("direct", None, None), Ok(Via::Direct));
        assert_eq!(
            Via::parse("127.0.0.1:2666", None, None),
            Ok(Via::Socks(HostPort {
                host: "127.0.0.1".to_string(),
                port: 2666
            }))
        );
    }
}
