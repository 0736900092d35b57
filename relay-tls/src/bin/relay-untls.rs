//! # Relay Untls
//!
//! The TLS stripper. For each accepted connection it peeks the ClientHello
//! to learn the SNI: when that works, it mints a CA-signed leaf for the
//! host, terminates TLS toward the client, and ships the plaintext through
//! the `--tls-via` SOCKS hop (tagging it `sni>host` so the far end can
//! re-encrypt); when it does not, the connection is spliced through raw via
//! `--via` with the peeked bytes replayed.

use std::net::{TcpListener, TcpStream};
use std::os::unix::io::AsRawFd;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use openssl::ssl::{SslAcceptor, SslMethod};

use relay_socks::{origdst, socks, splice, HostPort, Via};
use relay_tls::certgen::CertAuthority;
use relay_tls::clienthello::{extract_sni, HelloPeeker};
use relay_tls::{duplex, prefixed::PrefixedStream};

/// socks plain to tls proxy.
#[derive(Parser, Debug)]
#[command(name = "relay-untls")]
struct Args {
    /// IP:PORT to listen on
    #[arg(short = 'l', long, default_value = "0.0.0.0:1666")]
    listen: String,

    /// socks proxy for undecryptable traffic, or "direct" for none
    #[arg(short = 'c', long, default_value = "127.0.0.1:2666")]
    via: String,

    /// socks proxy receiving the decrypted traffic
    #[arg(short = 't', long = "tls-via", default_value = "127.0.0.1:3666")]
    tls_via: String,

    /// CA certificate used to sign forged leaves
    #[arg(long, default_value = "/etc/ssl/CA/CA.pem")]
    ca: String,

    /// key of the CA certificate
    #[arg(long, default_value = "/etc/ssl/CA/CA.key")]
    ca_key: String,
}

struct Config {
    via: Via,
    tls_via: Via,
}

static CONN_ID: AtomicU64 = AtomicU64::new(0);

fn main() -> anyhow::Result<()> {
    relay_tls::init_logging();
    let args = Args::parse();
    let listen =
        HostPort::parse(&args.listen, Some("0.0.0.0"), Some(1666)).context("bad --listen")?;
    let config = Arc::new(Config {
        via: Via::parse(&args.via, None, None).context("bad --via")?,
        tls_via: Via::parse(&args.tls_via, None, None).context("bad --tls-via")?,
    });
    let authority = Arc::new(
        CertAuthority::load(args.ca.as_ref(), args.ca_key.as_ref())
            .context("cannot load the signing CA")?,
    );

    let listener = TcpListener::bind((listen.host.as_str(), listen.port))
        .with_context(|| format!("failed to listen on {}", listen))?;
    log::info!("listening on {}", listen);

    for stream in listener.incoming() {
        match stream {
            Ok(sock) => {
                let config = config.clone();
                let authority = authority.clone();
                std::thread::spawn(move || {
                    let id = CONN_ID.fetch_add(1, Ordering::Relaxed) + 1;
                    if let Err(e) = serve(id, sock, &config, &authority) {
                        log::info!("s{}: connection ended: {}", id, e);
                    }
                });
            }
            Err(e) => log::error!("accept failed: {}", e),
        }
    }
    Ok(())
}

fn serve(
    id: u64,
    mut client: TcpStream,
    config: &Config,
    authority: &CertAuthority,
) -> anyhow::Result<()> {
    let (req, handshaked) = match origdst::transparent_dst(&client) {
        Some(dst) => (
            socks::SocksRequest::transparent(*dst.ip(), dst.port()),
            false,
        ),
        None => (socks::serve_handshake(&mut client)?, true),
    };

    // Dial the raw fallback early so refused destinations fail fast.
    log::info!(
        "s{}: connecting to remote {}:{}",
        id,
        req.tls_name,
        req.port
    );
    let fallback =
        match socks::connect_upstream(&config.via, &req.host, req.port, Some(&req.tls_name)) {
            Ok(s) => {
                if handshaked {
                    socks::reply_success(&mut client, &req)?;
                }
                s
            }
            Err(e) => {
                log::error!("s{}: remote connect failed: {}", id, e);
                if handshaked {
                    socks::reply_failure(&mut client, &req)?;
                }
                return Ok(());
            }
        };
    log::info!("s{}: socks5 connection established", id);

    let mut peeker = HelloPeeker::new(&client);
    let sni = match extract_sni(&mut peeker) {
        Ok(sni) => sni,
        Err(e) => {
            log::info!(
                "s{}: couldn't extract SNI ({}), assuming plain connection",
                id,
                e
            );
            let buffered = peeker.into_buffered();
            splice::pipe_sockets(
                fallback,
                client,
                buffered,
                Vec::new(),
                &format!("s{}: client <=> remote: ", id),
            );
            return Ok(());
        }
    };
    let buffered = peeker.into_buffered();
    log::info!("s{}: got SNI: {}", id, sni);
    drop(fallback);

    let leaf = authority.get(&sni)?;
    let mut acceptor = SslAcceptor::mozilla_intermediate(SslMethod::tls())?;
    acceptor.set_private_key(&leaf.key)?;
    acceptor.set_certificate(&leaf.cert)?;
    acceptor.check_private_key()?;
    let acceptor = acceptor.build();

    let mut tls = match acceptor.accept(PrefixedStream::new(buffered, client)) {
        Ok(tls) => tls,
        Err(e) => {
            log::info!("s{}: TLS accept failed: {}", id, e);
            return Ok(());
        }
    };

    let upstream = socks::connect_upstream(&config.tls_via, &req.host, req.port, Some(&sni))
        .with_context(|| format!("s{}: decrypted upstream connect failed", id))?;

    tls.get_ref().inner.set_nonblocking(true)?;
    upstream.set_nonblocking(true)?;
    let tls_fd = tls.get_ref().inner.as_raw_fd();
    duplex::splice_tls(
        &mut tls,
        tls_fd,
        &upstream,
        &format!("s{}: mitm decrypted <=> remote: ", id),
    )?;
    Ok(())
}
