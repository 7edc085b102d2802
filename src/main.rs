mod cache;
mod config;
mod handler;
mod hosts;
mod ipset;
mod matcher;
mod proto_utils;
mod upstream;
mod watcher;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use bytes::BytesMut;
use clap::Parser;
use hickory_proto::op::Message;
use hickory_proto::serialize::binary::BinDecodable;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tracing::{debug, error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::handler::Handler;

#[derive(Parser, Debug)]
#[command(author, version, about = "Split-horizon DNS forwarder", long_about = None)]
struct Args {
    /// 配置文件路径（TOML）
    #[arg(short = 'c', long = "config", default_value = "splitdns.toml")]
    config: PathBuf,
    /// 启用调试日志
    #[arg(long = "debug", default_value_t = false)]
    debug: bool,
    /// UDP worker 数量（默认 CPU 核心数）
    #[arg(long = "udp-workers", default_value_t = 0)]
    udp_workers: usize,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.debug);

    // Pin the tls crypto provider before any caller builds a client config
    let _ = rustls::crypto::ring::default_provider().install_default();

    let conf = config::load_config(&args.config).context("load initial config")?;
    let listen: SocketAddr = conf.listen.parse().context("parse listen addr")?;
    let state = config::build_state(&conf).context("assemble resolver state")?;
    let handler = Arc::new(Handler::new(state));

    watcher::spawn(args.config.clone(), handler.clone());

    let udp_workers = if args.udp_workers > 0 {
        args.udp_workers
    } else {
        num_cpus::get()
    };

    info!(
        listen = %listen,
        udp_workers,
        groups = handler.current().groups.len(),
        "dns forwarder started"
    );

    let mut udp_handles = Vec::with_capacity(udp_workers);

    #[cfg(unix)]
    {
        // Per-worker sockets with SO_REUSEPORT so the kernel spreads
        // the load
        for worker_id in 0..udp_workers {
            let handler = handler.clone();
            let std_socket = create_reuseport_udp_socket(listen)
                .with_context(|| format!("create udp socket for worker {worker_id}"))?;
            let socket = UdpSocket::from_std(std_socket)?;
            let handle = tokio::spawn(async move {
                if let Err(err) = run_udp_worker(Arc::new(socket), handler).await {
                    error!(worker_id, error = %err, "udp worker exited");
                }
            });
            udp_handles.push(handle);
        }
    }

    #[cfg(not(unix))]
    {
        // Single shared socket on platforms without SO_REUSEPORT
        use socket2::{Domain, Protocol, Socket, Type};
        let domain = if listen.is_ipv4() {
            Domain::IPV4
        } else {
            Domain::IPV6
        };
        let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP)).context("create socket")?;
        let _ = socket.set_recv_buffer_size(4 * 1024 * 1024);
        let _ = socket.set_send_buffer_size(4 * 1024 * 1024);
        socket.set_nonblocking(true).context("set nonblocking")?;
        socket.bind(&listen.into()).context("bind socket")?;

        let udp_socket = Arc::new(UdpSocket::from_std(socket.into()).context("from_std")?);
        for worker_id in 0..udp_workers {
            let handler = handler.clone();
            let socket = Arc::clone(&udp_socket);
            let handle = tokio::spawn(async move {
                if let Err(err) = run_udp_worker(socket, handler).await {
                    error!(worker_id, error = %err, "udp worker exited");
                }
            });
            udp_handles.push(handle);
        }
    }

    let tcp_listener = TcpListener::bind(listen)
        .await
        .context("bind tcp listener")?;
    let tcp_handler = handler.clone();
    let tcp_handle = tokio::spawn(async move {
        if let Err(err) = run_tcp(tcp_listener, tcp_handler).await {
            error!(error = %err, "tcp server exited");
        }
    });

    let _ = tcp_handle.await;
    for handle in udp_handles {
        let _ = handle.await;
    }

    Ok(())
}

fn init_tracing(debug: bool) {
    let fmt_layer = fmt::layer().with_target(false);
    let level = if debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .init();
}

#[cfg(unix)]
fn create_reuseport_udp_socket(addr: SocketAddr) -> anyhow::Result<std::net::UdpSocket> {
    use socket2::{Domain, Protocol, Socket, Type};
    let domain = if addr.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    };
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    socket.set_reuse_port(true)?;
    let _ = socket.set_recv_buffer_size(4 * 1024 * 1024);
    let _ = socket.set_send_buffer_size(4 * 1024 * 1024);
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    Ok(socket.into())
}

async fn run_udp_worker(socket: Arc<UdpSocket>, handler: Arc<Handler>) -> anyhow::Result<()> {
    let mut buf = BytesMut::with_capacity(4096);

    loop {
        buf.resize(4096, 0);
        match socket.recv_from(&mut buf).await {
            Ok((len, peer)) => {
                let packet = buf.split_to(len).freeze();
                let handler = handler.clone();
                let socket = Arc::clone(&socket);
                tokio::spawn(async move {
                    let request = match Message::from_bytes(&packet) {
                        Ok(request) => request,
                        Err(err) => {
                            debug!(client = %peer, error = %err, "dropping unparseable packet");
                            return;
                        }
                    };
                    // No reply means the query was dropped on purpose;
                    // the client is left to time out
                    let Some(reply) = handler.serve(&request, peer.ip()).await else {
                        return;
                    };
                    match proto_utils::encode_message(&reply) {
                        Ok(bytes) => {
                            let _ = socket.send_to(&bytes, peer).await;
                        }
                        Err(err) => error!(client = %peer, error = %err, "encode reply"),
                    }
                });
            }
            Err(err) => {
                warn!(error = %err, "udp recv failed");
                buf.clear();
            }
        }
    }
}

async fn run_tcp(listener: TcpListener, handler: Arc<Handler>) -> anyhow::Result<()> {
    loop {
        let (stream, peer) = listener.accept().await?;
        let handler = handler.clone();
        tokio::spawn(async move {
            let _ = handle_tcp_conn(stream, peer, handler).await;
        });
    }
}

async fn handle_tcp_conn(
    mut stream: TcpStream,
    peer: SocketAddr,
    handler: Arc<Handler>,
) -> anyhow::Result<()> {
    const MAX_TCP_FRAME: usize = 64 * 1024;
    let mut len_buf = [0u8; 2];

    loop {
        if let Err(err) = stream.read_exact(&mut len_buf).await {
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

        let request = match Message::from_bytes(&buf) {
            Ok(request) => request,
            Err(_) => return Ok(()),
        };
        let Some(reply) = handler.serve(&request, peer.ip()).await else {
            continue;
        };

        let bytes = match proto_utils::encode_message(&reply) {
            Ok(bytes) => bytes,
            Err(err) => {
                error!(client = %peer, error = %err, "encode reply");
                continue;
            }
        };
        if bytes.len() <= u16::MAX as usize {
            let len_bytes = (bytes.len() as u16).to_be_bytes();
            if stream.write_all(&len_bytes).await.is_err() {
                return Ok(());
            }
            if stream.write_all(&bytes).await.is_err() {
                return Ok(());
            }
        }
    }
}
