//! Bidirectional pump between a TLS session and a plaintext socket.
//!
//! `SslStream` cannot be split into independently owned halves, so both
//! directions run in one loop over non-blocking sockets, with `poll(2)`
//! deciding when either side can make progress. `WANT_READ`/`WANT_WRITE`
//! from OpenSSL are tracked so a stalled TLS operation polls for the event
//! it actually needs.

use std::io::{Read, Write};
use std::net::{Shutdown, TcpStream};
use std::os::unix::io::{AsRawFd, RawFd};

use openssl::ssl::{ErrorCode, SslStream};

const RELAY_BUF: usize = 16 * 4096;

fn is_wouldblock(e: &openssl::ssl::Error) -> bool {
    e.io_error()
        .map(|io| io.kind() == std::io::ErrorKind::WouldBlock)
        .unwrap_or(false)
}

fn poll_two(fds: &mut [libc::pollfd]) -> std::io::Result<()> {
    loop {
        let rc = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, -1) };
        if rc >= 0 {
            return Ok(());
        }
        let err = std::io::Error::last_os_error();
        if err.kind() != std::io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

/// Shuttle bytes both ways until both sides reach EOF (or either fails).
/// The caller must have completed the TLS handshake and switched both
/// underlying sockets to non-blocking mode; `tls_fd` is the descriptor
/// beneath the TLS session.
pub fn splice_tls<S: Read + Write>(
    tls: &mut SslStream<S>,
    tls_fd: RawFd,
    plain: &TcpStream,
    logprefix: &str,
) -> std::io::Result<()> {
    log::info!("{}tls splice started", logprefix);
    let plain_fd = plain.as_raw_fd();
    let mut plain_ref = plain;

    let mut to_plain: Vec<u8> = Vec::new();
    let mut to_tls: Vec<u8> = Vec::new();
    let mut tls_open = true;
    let mut plain_open = true;

    'outer: loop {
        let mut progress = false;
        let mut tls_wants_read = false;
        let mut tls_wants_write = false;

        if tls_open && to_plain.is_empty() {
            let mut buf = [0u8; RELAY_BUF];
            match tls.ssl_read(&mut buf) {
                Ok(0) => {
                    tls_open = false;
                    let _ = plain.shutdown(Shutdown::Write);
                    progress = true;
                }
                Ok(n) => {
                    to_plain.extend_from_slice(&buf[..n]);
                    progress = true;
                }
                Err(e) => match e.code() {
                    ErrorCode::WANT_READ => tls_wants_read = true,
                    ErrorCode::WANT_WRITE => tls_wants_write = true,
                    ErrorCode::ZERO_RETURN => {
                        log::info!("{}tls side EOF", logprefix);
                        tls_open = false;
                        let _ = plain.shutdown(Shutdown::Write);
                        progress = true;
                    }
                    _ if is_wouldblock(&e) => tls_wants_read = true,
                    _ => {
                        log::debug!("{}tls read failed: {}", logprefix, e);
                        break 'outer;
                    }
                },
            }
        }

        if !to_plain.is_empty() {
            match plain_ref.write(&to_plain) {
                Ok(0) => break 'outer,
                Ok(n) => {
                    to_plain.drain(..n);
                    progress = true;
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
                Err(e) => {
                    log::debug!("{}plain write failed: {}", logprefix, e);
                    break 'outer;
                }
            }
        }

        if plain_open && to_tls.is_empty() {
            let mut buf = [0u8; RELAY_BUF];
            match plain_ref.read(&mut buf) {
                Ok(0) => {
                    log::info!("{}plain side EOF", logprefix);
                    plain_open = false;
                    let _ = tls.shutdown();
                    progress = true;
                }
                Ok(n) => {
                    to_tls.extend_from_slice(&buf[..n]);
                    progress = true;
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
                Err(e) => {
                    log::debug!("{}plain read failed: {}", logprefix, e);
                    break 'outer;
                }
            }
        }

        if !to_tls.is_empty() {
            match tls.ssl_write(&to_tls) {
                Ok(n) => {
                    to_tls.drain(..n);
                    progress = true;
                }
                Err(e) => match e.code() {
                    ErrorCode::WANT_READ => tls_wants_read = true,
                    ErrorCode::WANT_WRITE => tls_wants_write = true,
                    _ if is_wouldblock(&e) => tls_wants_write = true,
                    _ => {
                        log::debug!("{}tls write failed: {}", logprefix, e);
                        break 'outer;
                    }
                },
            }
        }

        if !tls_open && !plain_open && to_plain.is_empty() && to_tls.is_empty() {
            break;
        }
        if progress {
            continue;
        }

        let mut tls_events: libc::c_short = 0;
        if (tls_open && to_plain.is_empty()) || tls_wants_read {
            tls_events |= libc::POLLIN;
        }
        if !to_tls.is_empty() || tls_wants_write {
            tls_events |= libc::POLLOUT;
        }
        let mut plain_events: libc::c_short = 0;
        if plain_open && to_tls.is_empty() {
            plain_events |= libc::POLLIN;
        }
        if !to_plain.is_empty() {
            plain_events |= libc::POLLOUT;
        }
        if tls_events == 0 && plain_events == 0 {
            break;
        }

        // only poll descriptors we actually want events from, so a
        // hung-up peer on the idle side cannot spin the loop
        let mut fds: Vec<libc::pollfd> = Vec::with_capacity(2);
        if tls_events != 0 {
            fds.push(libc::pollfd {
                fd: tls_fd,
                events: tls_events,
                revents: 0,
            });
        }
        if plain_events != 0 {
            fds.push(libc::pollfd {
                fd: plain_fd,
                events: plain_events,
                revents: 0,
            });
        }
        poll_two(&mut fds)?;
    }

    log::info!("{}tls splice done", logprefix);
    Ok(())
}
