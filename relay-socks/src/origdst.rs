//! Transparent-redirect support: recover the pre-DNAT destination of a
//! connection that iptables REDIRECTed at us.

#[cfg(target_os = "linux")]
use std::net::Ipv4Addr;
use std::net::{SocketAddrV4, TcpStream};

/// `getsockopt(SOL_IP, SO_ORIGINAL_DST)`. Only meaningful for IPv4
/// connections that went through the netfilter NAT table.
#[cfg(target_os = "linux")]
pub fn original_dst(conn: &TcpStream) -> Option<SocketAddrV4> {
    use std::os::unix::io::AsRawFd;

    const SO_ORIGINAL_DST: libc::c_int = 80;

    let mut addr: libc::sockaddr_in = unsafe { std::mem::zeroed() };
    let mut len = std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
    let rc = unsafe {
        libc::getsockopt(
            conn.as_raw_fd(),
            libc::SOL_IP,
            SO_ORIGINAL_DST,
            &mut addr as *mut _ as *mut libc::c_void,
            &mut len,
        )
    };
    if rc != 0 || addr.sin_family != libc::AF_INET as libc::sa_family_t {
        return None;
    }
    Some(SocketAddrV4::new(
        Ipv4Addr::from(u32::from_be(addr.sin_addr.s_addr)),
        u16::from_be(addr.sin_port),
    ))
}

#[cfg(not(target_os = "linux"))]
pub fn original_dst(_conn: &TcpStream) -> Option<SocketAddrV4> {
    None
}

/// The original destination, but only when it differs from the address the
/// socket actually terminated on. Equal addresses mean no REDIRECT rule was
/// involved and the lookup just echoed the local endpoint.
pub fn transparent_dst(conn: &TcpStream) -> Option<SocketAddrV4> {
    let orig = original_dst(conn)?;
    match conn.local_addr() {
        Ok(std::net::SocketAddr::V4(local)) if local != orig => Some(orig),
        _ => None,
    }
}
