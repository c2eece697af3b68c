mod client;
mod config;
mod fanout;
mod metrics;
mod policy;
mod proto;
mod scope;
mod watcher;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use arc_swap::ArcSwap;
use bytes::Bytes;
use clap::Parser;
use hickory_proto::op::{Message, ResponseCode};
use hickory_proto::serialize::binary::BinDecodable;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::load_config;
use crate::fanout::{DispatchResult, Fanout};
use crate::metrics::Metrics;

#[derive(Parser, Debug)]
#[command(author, version, about = "FanDNS concurrent fan-out DNS forwarder", long_about = None)]
struct Args {
    /// Config file path (JSON)
    #[arg(short = 'c', long = "config", default_value = "config/fanout.json")]
    config: PathBuf,
    /// Enable debug logging
    #[arg(long = "debug", default_value_t = false)]
    debug: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.debug);

    let cfg = load_config(&args.config).context("load initial config")?;
    let bind_udp: SocketAddr = cfg
        .settings
        .bind_udp
        .parse()
        .context("parse udp bind addr")?;
    let bind_tcp: SocketAddr = cfg
        .settings
        .bind_tcp
        .parse()
        .context("parse tcp bind addr")?;

    let metrics = Arc::new(Metrics::new());
    let engine = Fanout::from_config(&cfg, Arc::clone(&metrics)).context("build dispatcher")?;
    let engine = Arc::new(ArcSwap::from_pointee(engine));

    watcher::spawn(args.config.clone(), engine.clone(), Arc::clone(&metrics));

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("shutdown signal received");
                cancel.cancel();
            }
        });
    }

    info!(bind_udp = %bind_udp, bind_tcp = %bind_tcp, upstreams = cfg.upstreams.len(), "dns forwarder started");

    let udp_socket = Arc::new(create_udp_socket(bind_udp).context("create udp socket")?);
    let udp_handle = {
        let engine = engine.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if let Err(err) = run_udp(udp_socket, engine, cancel).await {
                error!(error = %err, "udp server exited");
            }
        })
    };

    let tcp_listener = TcpListener::bind(bind_tcp)
        .await
        .context("bind tcp listener")?;
    let tcp_handle = {
        let engine = engine.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if let Err(err) = run_tcp(tcp_listener, engine, cancel).await {
                error!(error = %err, "tcp server exited");
            }
        })
    };

    let _ = udp_handle.await;
    let _ = tcp_handle.await;

    info!(upstreams = %metrics.snapshot(), "dns forwarder stopped");
    Ok(())
}

fn init_tracing(debug: bool) {
    let fmt_layer = fmt::layer()
        .with_target(false)
        .with_ansi(false)
        .with_level(debug);

    let level = if debug { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .init();
}

fn create_udp_socket(addr: SocketAddr) -> anyhow::Result<UdpSocket> {
    use socket2::{Domain, Protocol, Socket, Type};
    let domain = if addr.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    };
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP)).context("create socket")?;
    let _ = socket.set_recv_buffer_size(4 * 1024 * 1024);
    let _ = socket.set_send_buffer_size(4 * 1024 * 1024);
    socket.set_nonblocking(true).context("set nonblocking")?;
    socket.bind(&addr.into()).context("bind socket")?;
    Ok(UdpSocket::from_std(socket.into())?)
}

/// Runs one dispatch for a raw query packet and renders the reply bytes.
/// Returns None when the packet is unparseable or no reply can be built.
async fn handle_packet(
    engine: &Arc<ArcSwap<Fanout>>,
    cancel: &CancellationToken,
    packet: &[u8],
) -> Option<Bytes> {
    let req = match Message::from_bytes(packet) {
        Ok(msg) => msg,
        Err(err) => {
            debug!(error = %err, "dropping unparseable query");
            return None;
        }
    };

    let engine = engine.load_full();
    match engine.dispatch(&req, cancel).await {
        DispatchResult::Answered { response, .. } => Some(response),
        DispatchResult::FormatError { response } => Some(response),
        // out of scope and nothing else answers here
        DispatchResult::Skipped => proto::build_reply(&req, ResponseCode::Refused).ok(),
        DispatchResult::ServerFailure { response, cause } => {
            warn!(error = %cause, query_id = req.id(), "dispatch failed");
            if response.is_empty() {
                None
            } else {
                Some(response)
            }
        }
    }
}

async fn run_udp(
    socket: Arc<UdpSocket>,
    engine: Arc<ArcSwap<Fanout>>,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let (len, peer) = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            r = socket.recv_from(&mut buf) => r?,
        };
        let packet = Bytes::copy_from_slice(&buf[..len]);
        let engine = Arc::clone(&engine);
        let socket = Arc::clone(&socket);
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if let Some(resp) = handle_packet(&engine, &cancel, &packet).await {
                let _ = socket.send_to(&resp, peer).await;
            }
        });
    }
}

async fn run_tcp(
    listener: TcpListener,
    engine: Arc<ArcSwap<Fanout>>,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    loop {
        let (stream, peer) = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            r = listener.accept() => r?,
        };
        let engine = Arc::clone(&engine);
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let _ = handle_tcp_conn(stream, peer, engine, cancel).await;
        });
    }
}

async fn handle_tcp_conn(
    mut stream: TcpStream,
    peer: SocketAddr,
    engine: Arc<ArcSwap<Fanout>>,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    const MAX_TCP_FRAME: usize = 64 * 1024;
    let mut len_buf = [0u8; 2];

    debug!(peer = %peer, "tcp connection accepted");

    loop {
        let read = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            r = stream.read_exact(&mut len_buf) => r,
        };
        if let Err(err) = read {
            if err.kind() != std::io::ErrorKind::UnexpectedEof {
                return Err(err.into());
            }
            return Ok(());
        }
        let frame_len = u16::from_be_bytes(len_buf) as usize;
        if frame_len == 0 || frame_len > MAX_TCP_FRAME {
            return Ok(());
        }

        let mut buf = vec![0u8; frame_len];
        if stream.read_exact(&mut buf).await.is_err() {
            return Ok(());
        }

        let Some(resp) = handle_packet(&engine, &cancel, &buf).await else {
            return Ok(());
        };

        if resp.len() <= u16::MAX as usize {
            let len_bytes = (resp.len() as u16).to_be_bytes();
            if stream.write_all(&len_bytes).await.is_err() {
                return Ok(());
            }
            if stream.write_all(&resp).await.is_err() {
                return Ok(());
            }
        }
    }
}
