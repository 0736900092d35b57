//! # Relay Retls
//!
//! The re-encrypting end of the chain. Traffic stripped by `relay-untls`
//! arrives here in plaintext, tagged `name>host` through the SOCKS hops;
//! this binary opens a verified TLS client session to the real destination
//! using that name as SNI and splices the two streams.

use std::net::{TcpListener, TcpStream};
use std::os::unix::io::AsRawFd;
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::Context;
use clap::Parser;
use openssl::ssl::{SslConnector, SslMethod};

use relay_socks::{origdst, socks, HostPort, Via};
use relay_tls::duplex;

/// socks plain to tls proxy, re-encrypting toward the real server.
#[derive(Parser, Debug)]
#[command(name = "relay-retls")]
struct Args {
    /// IP:PORT to listen on
    #[arg(short = 'l', long, default_value = "127.0.0.1:3666")]
    listen: String,

    /// IP:PORT of a socks proxy to dial through, or "direct" for none
    #[arg(short = 'c', long, default_value = "direct")]
    via: String,
}

static CONN_ID: AtomicU64 = AtomicU64::new(0);

fn main() -> anyhow::Result<()> {
    relay_tls::init_logging();
    let args = Args::parse();
    let listen =
        HostPort::parse(&args.listen, Some("127.0.0.1"), Some(3666)).context("bad --listen")?;
    let via = Via::parse(&args.via, None, None).context("bad --via")?;

    let listener = TcpListener::bind((listen.host.as_str(), listen.port))
        .with_context(|| format!("failed to listen on {}", listen))?;
    log::info!("listening on {}", listen);

    for stream in listener.incoming() {
        match stream {
            Ok(sock) => {
                let via = via.clone();
                std::thread::spawn(move || {
                    let id = CONN_ID.fetch_add(1, Ordering::Relaxed) + 1;
                    if let Err(e) = serve(id, sock, &via) {
                        log::info!("s{}: connection ended: {}", id, e);
                    }
                });
            }
            Err(e) => log::error!("accept failed: {}", e),
        }
    }
    Ok(())
}

fn serve(id: u64, mut client: TcpStream, via: &Via) -> anyhow::Result<()> {
    let (req, handshaked) = match origdst::transparent_dst(&client) {
        Some(dst) => (
            socks::SocksRequest::transparent(*dst.ip(), dst.port()),
            false,
        ),
        None => (socks::serve_handshake(&mut client)?, true),
    };

    log::info!(
        "s{}: connecting to remote {}:{} via {}",
        id,
        req.tls_name,
        req.port,
        via
    );
    let connector = SslConnector::builder(SslMethod::tls())?.build();
    let tls = socks::connect_upstream(via, &req.host, req.port, None)
        .map_err(anyhow::Error::from)
        .and_then(|tcp| {
            connector
                .connect(&req.tls_name, tcp)
                .map_err(|e| anyhow::anyhow!("TLS connect failed: {}", e))
        });
    let mut tls = match tls {
        Ok(tls) => {
            if handshaked {
                socks::reply_success(&mut client, &req)?;
            }
            tls
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

    tls.get_ref().set_nonblocking(true)?;
    client.set_nonblocking(true)?;
    let tls_fd = tls.get_ref().as_raw_fd();
    duplex::splice_tls(&mut tls, tls_fd, &client, &format!("s{}: ", id))?;
    Ok(())
}
