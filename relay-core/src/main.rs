//! # Relay Core
//!
//! The intercepting proxy of the relay family. It accepts SOCKS5 (or
//! transparently redirected) connections, opens the upstream route, and
//! runs the stream interception engine over the pair: registered protocol
//! parsers race to identify the traffic, observe or rewrite it, and when
//! they are done the connection falls back to raw byte splicing.
//!
//! One OS thread per connection; inside each thread a single-threaded
//! tokio runtime schedules the engine loop and the parser tasks
//! cooperatively.

use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::Context;
use clap::Parser;

use relay_socks::{origdst, socks, splice, HostPort, Via};

mod config;
mod engine;
mod http;

use engine::conn::{self, ConnOutcome};
use engine::registry;

static CONN_ID: AtomicU64 = AtomicU64::new(0);

fn main() -> anyhow::Result<()> {
    config::init_logging();
    let args = config::Args::parse();
    let listen = HostPort::parse(&args.listen, None, None).context("bad --listen address")?;
    let via = Via::parse(&args.via, None, None).context("bad --via address")?;

    let selection = args.plugin_selection();
    match registry::reload(&selection) {
        Ok(count) => log::info!("{} interceptor(s) loaded", count),
        Err(e) => log::error!("interceptor load failed: {}", e),
    }
    spawn_sighup_watcher(selection);

    ctrlc::set_handler(|| {
        log::info!("SIGINT received, shutting down");
        std::process::exit(0);
    })
    .context("failed to install SIGINT handler")?;

    let listener = TcpListener::bind((listen.host.as_str(), listen.port))
        .with_context(|| format!("failed to listen on {}", listen))?;
    log::info!("listening on {}", listen);

    for stream in listener.incoming() {
        match stream {
            Ok(sock) => {
                let via = via.clone();
                std::thread::spawn(move || handle_connection(sock, via));
            }
            Err(e) => log::error!("accept failed: {}", e),
        }
    }
    Ok(())
}

/// Reload the interceptor registry on SIGHUP. The swap only affects new
/// connections; live ones keep the set they started with.
fn spawn_sighup_watcher(selection: Vec<String>) {
    std::thread::spawn(move || {
        let rt = match tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
        {
            Ok(rt) => rt,
            Err(e) => {
                log::error!("signal watcher runtime failed: {}", e);
                return;
            }
        };
        rt.block_on(async move {
            let mut hup =
                match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup()) {
                    Ok(s) => s,
                    Err(e) => {
                        log::error!("cannot watch SIGHUP: {}", e);
                        return;
                    }
                };
            while hup.recv().await.is_some() {
                match registry::reload(&selection) {
                    Ok(count) => log::info!("SIGHUP: {} interceptor(s) reloaded", count),
                    Err(e) => {
                        log::error!("SIGHUP reload failed, keeping previous set: {}", e)
                    }
                }
            }
        });
    });
}

fn handle_connection(client: TcpStream, via: Via) {
    let id = CONN_ID.fetch_add(1, Ordering::Relaxed) + 1;
    let peer = client
        .peer_addr()
        .map(|a| a.to_string())
        .unwrap_or_else(|_| "?".to_string());
    log::info!("s{}: accepting connection from {}", id, peer);
    if let Err(e) = serve(id, client, &via) {
        log::info!("s{}: connection ended: {}", id, e);
    }
}

fn serve(id: u64, mut client: TcpStream, via: &Via) -> anyhow::Result<()> {
    // A transparently redirected connection carries its own destination;
    // everything else speaks SOCKS5 first.
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
    let upstream = match socks::connect_upstream(via, &req.host, req.port, Some(&req.tls_name)) {
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

    let (client, upstream, outcome) = run_engine(id, client, upstream)?;

    if outcome.reset {
        splice::set_reset_on_close(&client);
        splice::set_reset_on_close(&upstream);
        return Ok(());
    }
    if outcome.quit {
        return Ok(());
    }
    splice::pipe_sockets(
        upstream,
        client,
        outcome.to_server,
        outcome.to_client,
        &format!("s{}: ", id),
    );
    Ok(())
}

/// Run the interception engine over the two sockets on a fresh
/// single-threaded runtime, returning them in blocking mode together with
/// the residual bytes for the splicer.
fn run_engine(
    id: u64,
    client: TcpStream,
    upstream: TcpStream,
) -> anyhow::Result<(TcpStream, TcpStream, ConnOutcome)> {
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_io()
        .build()?;
    let local = tokio::task::LocalSet::new();
    let (client, upstream, result) = local.block_on(&rt, async move {
        client.set_nonblocking(true)?;
        upstream.set_nonblocking(true)?;
        let csock = tokio::net::TcpStream::from_std(client)?;
        let ssock = tokio::net::TcpStream::from_std(upstream)?;
        let shared = engine::ConnShared::new(id, registry::current());
        shared.start_interceptors(None);
        let result = conn::run(&shared, &csock, &ssock).await;
        Ok::<_, anyhow::Error>((csock.into_std()?, ssock.into_std()?, result))
    })?;
    client.set_nonblocking(false)?;
    upstream.set_nonblocking(false)?;
    match result {
        Ok(outcome) => Ok((client, upstream, outcome)),
        Err(e) => {
            // a connection aborted mid-stream resets rather than FIN-closes
            splice::set_reset_on_close(&client);
            splice::set_reset_on_close(&upstream);
            Err(e.into())
        }
    }
}
