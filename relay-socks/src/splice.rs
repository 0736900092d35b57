//! The raw byte splicer: once a connection needs no further protocol
//! attention, its two sockets are wired together until both directions hit
//! EOF. Buffered bytes left over from earlier stages (handshake prefixes,
//! undelivered interception residue) are flushed ahead of the live traffic.

use std::io::{Read, Write};
use std::net::{Shutdown, TcpStream};
use std::thread;

const RELAY_BUF: usize = 16 * 4096;

/// Arrange for close to send RST instead of FIN (`SO_LINGER` 0). Used when
/// a connection is being abandoned mid-stream.
pub fn set_reset_on_close(conn: &TcpStream) {
    #[cfg(unix)]
    {
        use std::os::unix::io::AsRawFd;
        let linger = libc::linger {
            l_onoff: 1,
            l_linger: 0,
        };
        unsafe {
            libc::setsockopt(
                conn.as_raw_fd(),
                libc::SOL_SOCKET,
                libc::SO_LINGER,
                &linger as *const _ as *const libc::c_void,
                std::mem::size_of::<libc::linger>() as libc::socklen_t,
            );
        }
    }
}

fn relay_one_way(src: &TcpStream, dst: &TcpStream, prefix: Vec<u8>, tag: &str, logprefix: &str) {
    let mut src = src;
    let mut dst = dst;
    if !prefix.is_empty() {
        if let Err(e) = dst.write_all(&prefix) {
            log::debug!("{}pipe_sockets {} prefix write failed: {}", logprefix, tag, e);
            return;
        }
    }
    let mut buf = [0u8; RELAY_BUF];
    loop {
        match src.read(&mut buf) {
            Ok(0) => {
                log::info!("{}pipe_sockets {} EOF", logprefix, tag);
                let _ = dst.shutdown(Shutdown::Write);
                return;
            }
            Ok(n) => {
                if let Err(e) = dst.write_all(&buf[..n]) {
                    log::debug!("{}pipe_sockets {} write failed: {}", logprefix, tag, e);
                    return;
                }
            }
            Err(e) => {
                log::debug!("{}pipe_sockets {} read failed: {}", logprefix, tag, e);
                return;
            }
        }
    }
}

/// Splice `sa` and `sb` together, prefixing `to_a` onto the stream written
/// toward `sa` and `to_b` toward `sb`. Returns when both directions have
/// finished; the sockets are closed on drop.
pub fn pipe_sockets(sa: TcpStream, sb: TcpStream, to_a: Vec<u8>, to_b: Vec<u8>, logprefix: &str) {
    log::info!("{}pipe_sockets started", logprefix);
    thread::scope(|scope| {
        scope.spawn(|| relay_one_way(&sa, &sb, to_b, "a -> b", logprefix));
        relay_one_way(&sb, &sa, to_a, "b -> a", logprefix);
    });
    log::info!("{}pipe_sockets done", logprefix);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    fn pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).unwrap();
        let (server, _) = listener.accept().unwrap();
        (client, server)
    }

    #[test]
    fn test_pipe_sockets_with_prefixes() {
        let (a_far, a_near) = pair();
        let (b_far, b_near) = pair();

        let t = thread::spawn(move || {
            pipe_sockets(
                a_near,
                b_near,
                b"to-a:".to_vec(),
                b"to-b:".to_vec(),
                "test: ",
            );
        });

        let mut a = a_far;
        let mut b = b_far;
        a.write_all(b"hello").unwrap();
        a.shutdown(Shutdown::Write).unwrap();
        b.write_all(b"world").unwrap();
        b.shutdown(Shutdown::Write).unwrap();

        let mut got_b = Vec::new();
        b.read_to_end(&mut got_b).unwrap();
        assert_eq!(got_b, b"to-b:hello");

        let mut got_a = Vec::new();
        a.read_to_end(&mut got_a).unwrap();
        assert_eq!(got_a, b"to-a:world");

        t.join().unwrap();
    }
}
