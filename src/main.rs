mod cache;
mod config;
mod engine;
mod iam;
mod overrides;
mod proto_utils;
#[cfg(test)]
mod testutil;

use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::{RuntimeConfig, load_config};
use crate::engine::Engine;

/// Large enough for EDNS-sized answers passing through; synthesized answers stay small.
const MAX_DATAGRAM: usize = 4096;

#[derive(Parser, Debug)]
#[command(author, version, about = "Caching DNS forwarder with runtime host overrides", long_about = None)]
struct Args {
    /// Config file path (JSON)
    #[arg(short = 'c', long = "config", default_value = "dnsproxy.json")]
    config: PathBuf,
    /// Enable debug logging
    #[arg(long = "debug", default_value_t = false)]
    debug: bool,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.debug);

    let cfg = load_config(&args.config).context("load initial config")?;
    let cfg = RuntimeConfig::from_config(cfg).context("validate config")?;

    let dns = UdpSocket::from_std(create_udp_socket(cfg.bind_dns).context("create dns socket")?)
        .context("register dns socket")?;
    let iam = UdpSocket::from_std(create_udp_socket(cfg.bind_iam).context("create iam socket")?)
        .context("register iam socket")?;

    let mut engine = Engine::new(&cfg);
    if engine.overrides().is_empty() {
        info!("no static host overrides configured");
    }
    info!(
        bind_dns = %cfg.bind_dns,
        bind_iam = %cfg.bind_iam,
        upstream = %engine.upstream(),
        overrides = engine.overrides().len(),
        "dns proxy started"
    );

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("shutdown requested");
                signal.cancel();
            }
            Err(err) => error!(error = %err, "ctrl-c handler unavailable"),
        }
    });

    let result = run_dispatch(&dns, &iam, &mut engine, &shutdown).await;
    if let Err(err) = &result {
        error!(error = %err, "dispatch loop failed");
    }
    info!(stats = %engine.stats(), "dns proxy stopped");
    result
}

fn init_tracing(debug: bool) {
    let fmt_layer = fmt::layer().with_target(false).with_ansi(false);

    let level = if debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .init();
}

fn create_udp_socket(addr: SocketAddr) -> anyhow::Result<std::net::UdpSocket> {
    use socket2::{Domain, Protocol, Socket, Type};
    let domain = if addr.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    };
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    let _ = socket.set_recv_buffer_size(4 * 1024 * 1024);
    let _ = socket.set_send_buffer_size(4 * 1024 * 1024);
    socket.set_nonblocking(true)?;
    socket
        .bind(&addr.into())
        .with_context(|| format!("bind {addr}"))?;
    Ok(socket.into())
}

/// ICMP errors from earlier sends surface on the next receive; they are not fatal.
fn is_transient(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
    )
}

/// Single cooperative loop over the DNS and IAM sockets.
///
/// Each socket has exactly one receive armed at a time. A completed datagram is fully
/// handled, sends included, before either socket is polled again; the losing receive is
/// dropped and re-armed on the next iteration, which `recv_from` tolerates without
/// losing data. Cancellation is checked between datagrams only.
async fn run_dispatch(
    dns: &UdpSocket,
    iam: &UdpSocket,
    engine: &mut Engine,
    shutdown: &CancellationToken,
) -> anyhow::Result<()> {
    let mut dns_buf = vec![0u8; MAX_DATAGRAM];
    let mut iam_buf = vec![0u8; MAX_DATAGRAM];

    loop {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            res = dns.recv_from(&mut dns_buf) => match res {
                Ok((len, peer)) => engine.handle_dns(dns, &dns_buf[..len], peer).await,
                Err(err) if is_transient(&err) => {
                    warn!(target = "dispatch", socket = "dns", error = %err, "recv failed");
                }
                Err(err) => return Err(err).context("dns socket receive"),
            },
            res = iam.recv_from(&mut iam_buf) => match res {
                Ok((len, peer)) => engine.handle_iam(iam, &iam_buf[..len], peer).await,
                Err(err) if is_transient(&err) => {
                    warn!(target = "dispatch", socket = "iam", error = %err, "recv failed");
                }
                Err(err) => return Err(err).context("iam socket receive"),
            },
        }
    }

    info!(target = "dispatch", "dispatch loop stopped");
    Ok(())
}
