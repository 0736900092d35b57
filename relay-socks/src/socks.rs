//! SOCKS5 handshakes, both sides of the chain.
//!
//! Server side: the minimal no-auth subset the relay family speaks between
//! its own hops — CONNECT only, IPv4 or DOMAIN targets. A DOMAIN target of
//! the form `name>host` carries a logical (TLS) name alongside the address
//! actually dialed; the TLS stripper uses this to hand the decrypted stream
//! to the next hop without losing the SNI.
//!
//! Client side: the matching CONNECT request used when an upstream route is
//! another SOCKS5 proxy rather than the open internet.

use std::io::{Read, Write};
use std::net::{Ipv4Addr, TcpStream};

use thiserror::Error;

use crate::hostport::Via;

pub const SOCKS_VERSION: u8 = 5;

/// General-failure reply code sent when the remote connect fails.
pub const REPLY_GENERAL_FAILURE: u8 = 5;

#[derive(Debug, Error)]
pub enum SocksError {
    #[error("socket error: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed socks5 exchange: {0}")]
    Protocol(&'static str),
    #[error("upstream proxy refused connect (reply {0})")]
    UpstreamRefused(u8),
}

/// A parsed CONNECT request, plus the raw address bytes needed to echo the
/// target back in the reply.
#[derive(Debug, Clone)]
pub struct SocksRequest {
    /// Address actually dialed.
    pub host: String,
    /// Logical name of the destination. Equal to `host` unless the client
    /// sent the `name>host` form.
    pub tls_name: String,
    pub port: u16,
    addr_echo: Vec<u8>,
}

impl SocksRequest {
    /// Synthesize a request for transparently redirected connections, where
    /// no handshake took place.
    pub fn transparent(addr: Ipv4Addr, port: u16) -> Self {
        let mut addr_echo = vec![1u8];
        addr_echo.extend_from_slice(&addr.octets());
        SocksRequest {
            host: addr.to_string(),
            tls_name: addr.to_string(),
            port,
            addr_echo,
        }
    }
}

fn read_exact(conn: &mut TcpStream, n: usize) -> Result<Vec<u8>, SocksError> {
    let mut buf = vec![0u8; n];
    conn.read_exact(&mut buf)?;
    Ok(buf)
}

/// Run the server side of the SOCKS5 handshake up to (but not including)
/// the reply. The caller connects upstream first and then sends
/// [`reply_success`] or [`reply_failure`] depending on the outcome.
pub fn serve_handshake(conn: &mut TcpStream) -> Result<SocksRequest, SocksError> {
    let header = read_exact(conn, 2)?;
    if header[0] != SOCKS_VERSION {
        return Err(SocksError::Protocol("bad version"));
    }
    let nmethods = header[1] as usize;
    if nmethods == 0 {
        return Err(SocksError::Protocol("no auth methods offered"));
    }
    let methods = read_exact(conn, nmethods)?;
    if !methods.contains(&0) {
        return Err(SocksError::Protocol("no-auth method not offered"));
    }
    conn.write_all(&[SOCKS_VERSION, 0])?;

    let req = read_exact(conn, 4)?;
    if req[0] != SOCKS_VERSION {
        return Err(SocksError::Protocol("bad version in request"));
    }
    if req[1] != 1 {
        return Err(SocksError::Protocol("only CONNECT is supported"));
    }
    let addr_type = req[3];

    let (mut addr_echo, address) = match addr_type {
        1 => {
            let raw = read_exact(conn, 4)?;
            let ip = Ipv4Addr::new(raw[0], raw[1], raw[2], raw[3]);
            (raw, ip.to_string())
        }
        3 => {
            let len_byte = read_exact(conn, 1)?;
            let len = len_byte[0] as usize;
            let name = read_exact(conn, len)?;
            let address = String::from_utf8(name.clone())
                .map_err(|_| SocksError::Protocol("domain is not utf-8"))?;
            let mut raw = len_byte;
            raw.extend_from_slice(&name);
            (raw, address)
        }
        _ => return Err(SocksError::Protocol("unsupported address type")),
    };
    addr_echo.insert(0, addr_type);

    let port_raw = read_exact(conn, 2)?;
    let port = u16::from_be_bytes([port_raw[0], port_raw[1]]);

    let (tls_name, host) = match address.split_once('>') {
        Some((name, host)) => (name.to_string(), host.to_string()),
        None => (address.clone(), address),
    };
    if host.is_empty() {
        return Err(SocksError::Protocol("empty target address"));
    }

    Ok(SocksRequest {
        host,
        tls_name,
        port,
        addr_echo,
    })
}

/// Echo the requested target back with reply code 0 (succeeded).
pub fn reply_success(conn: &mut TcpStream, req: &SocksRequest) -> Result<(), SocksError> {
    let mut reply = vec![SOCKS_VERSION, 0, 0];
    reply.extend_from_slice(&req.addr_echo);
    reply.extend_from_slice(&req.port.to_be_bytes());
    conn.write_all(&reply)?;
    Ok(())
}

/// Reply code 5 (general failure), zeroed bound address.
pub fn reply_failure(conn: &mut TcpStream, req: &SocksRequest) -> Result<(), SocksError> {
    let addr_type = req.addr_echo.first().copied().unwrap_or(1);
    let mut reply = vec![SOCKS_VERSION, REPLY_GENERAL_FAILURE, 0, addr_type];
    reply.extend_from_slice(&[0, 0, 0, 0, 0, 0]);
    conn.write_all(&reply)?;
    Ok(())
}

/// Connect to `host:port`, either directly or by running the client side of
/// a SOCKS5 CONNECT against the `via` proxy. `tls_name`, when given, is
/// prefixed onto the DOMAIN field as `name>host` for the next hop.
pub fn connect_upstream(
    via: &Via,
    host: &str,
    port: u16,
    tls_name: Option<&str>,
) -> Result<TcpStream, SocksError> {
    let hop = match via {
        Via::Direct => return Ok(TcpStream::connect((host, port))?),
        Via::Socks(hp) => hp,
    };
    let mut conn = TcpStream::connect((hop.host.as_str(), hop.port))?;

    conn.write_all(&[SOCKS_VERSION, 1, 0])?;
    let chosen = read_exact(&mut conn, 2)?;
    if chosen[0] != SOCKS_VERSION || chosen[1] != 0 {
        return Err(SocksError::Protocol("upstream rejected no-auth"));
    }

    let target = match tls_name {
        Some(name) if name != host => format!("{}>{}", name, host),
        _ => host.to_string(),
    };
    if target.len() > 255 {
        return Err(SocksError::Protocol("target name too long for DOMAIN"));
    }
    let mut req = vec![SOCKS_VERSION, 1, 0, 3, target.len() as u8];
    req.extend_from_slice(target.as_bytes());
    req.extend_from_slice(&port.to_be_bytes());
    conn.write_all(&req)?;

    let head = read_exact(&mut conn, 4)?;
    if head[0] != SOCKS_VERSION {
        return Err(SocksError::Protocol("bad version in upstream reply"));
    }
    if head[1] != 0 {
        return Err(SocksError::UpstreamRefused(head[1]));
    }
    let skip = match head[3] {
        1 => 4,
        3 => read_exact(&mut conn, 1)?[0] as usize,
        4 => 16,
        _ => return Err(SocksError::Protocol("bad address type in upstream reply")),
    };
    read_exact(&mut conn, skip + 2)?;

    Ok(conn)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;
    use std::thread;

    fn pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).unwrap();
        let (server, _) = listener.accept().unwrap();
        (client, server)
    }

    #[test]
    fn test_handshake_domain_with_name_override() {
        let (mut client, mut server) = pair();
        let t = thread::spawn(move || {
            client.write_all(&[5, 1, 0]).unwrap();
            let mut buf = [0u8; 2];
            client.read_exact(&mut buf).unwrap();
            assert_eq!(buf, [5, 0]);
            let target = b"example.com>10.0.0.7";
            let mut req = vec![5, 1, 0, 3, target.len() as u8];
            req.extend_from_slice(target);
            req.extend_from_slice(&443u16.to_be_bytes());
            client.write_all(&req).unwrap();
            let mut reply = vec![0u8; 4 + 1 + target.len() + 2];
            client.read_exact(&mut reply).unwrap();
            assert_eq!(&reply[0..2], &[5, 0]);
        });
        let req = serve_handshake(&mut server).unwrap();
        assert_eq!(req.host, "10.0.0.7");
        assert_eq!(req.tls_name, "example.com");
        assert_eq!(req.port, 443);
        reply_success(&mut server, &req).unwrap();
        t.join().unwrap();
    }

    #[test]
    fn test_handshake_ipv4() {
        let (mut client, mut server) = pair();
        let t = thread::spawn(move || {
            client.write_all(&[5, 2, 0, 1]).unwrap();
            let mut buf = [0u8; 2];
            client.read_exact(&mut buf).unwrap();
            let mut req = vec![5, 1, 0, 1, 192, 168, 1, 9];
            req.extend_from_slice(&80u16.to_be_bytes());
            client.write_all(&req).unwrap();
            let mut reply = vec![0u8; 10];
            client.read_exact(&mut reply).unwrap();
            assert_eq!(reply[1], REPLY_GENERAL_FAILURE);
        });
        let req = serve_handshake(&mut server).unwrap();
        assert_eq!(req.host, "192.168.1.9");
        assert_eq!(req.tls_name, "192.168.1.9");
        assert_eq!(req.port, 80);
        reply_failure(&mut server, &req).unwrap();
        t.join().unwrap();
    }

    #[test]
    fn test_handshake_rejects_bind() {
        let (mut client, mut server) = pair();
        let t = thread::spawn(move || {
            client.write_all(&[5, 1, 0]).unwrap();
            let mut buf = [0u8; 2];
            client.read_exact(&mut buf).unwrap();
            // cmd 2 = BIND, unsupported
            client.write_all(&[5, 2, 0, 1, 0, 0, 0, 0, 0, 80]).unwrap();
        });
        assert!(matches!(
            serve_handshake(&mut server),
            Err(SocksError::Protocol(_))
        ));
        t.join().unwrap();
    }

    #[test]
    fn test_connect_upstream_via_socks() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let t = thread::spawn(move || {
            let (mut hop, _) = listener.accept().unwrap();
            let req = serve_handshake(&mut hop).unwrap();
            assert_eq!(req.host, "target.example");
            assert_eq!(req.tls_name, "sni.example");
            assert_eq!(req.port, 8443);
            reply_success(&mut hop, &req).unwrap();
        });
        let via = Via::Socks(crate::HostPort {
            host: addr.ip().to_string(),
            port: addr.port(),
        });
        let conn = connect_upstream(&via, "target.example", 8443, Some("sni.example"));
        assert!(conn.is_ok());
        t.join().unwrap();
    }
}
