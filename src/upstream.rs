use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, ensure, Context, Result};
use async_trait::async_trait;
use hickory_proto::op::Message;
use hickory_proto::serialize::binary::BinDecodable;
use rustls::pki_types::ServerName;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio_rustls::TlsConnector;
use tokio_socks::tcp::Socks5Stream;

use crate::proto_utils::encode_message;

const MAX_UDP_PAYLOAD: usize = 4096;

/// One upstream resolver. A call either yields a response or an error;
/// errors are logged by the owning group and count as "no answer" from
/// this caller only.
#[async_trait]
pub trait Caller: Send + Sync {
    async fn call(&self, request: &Message) -> Result<Message>;

    /// Stable endpoint label for log fields.
    fn endpoint(&self) -> &str;
}

/// How a group reaches its upstreams: directly, or through a SOCKS5
/// proxy (CONNECT only, so proxied traffic is always TCP-framed).
#[derive(Debug, Clone)]
pub enum Dialer {
    Direct,
    Socks5(String),
}

impl Dialer {
    pub fn is_direct(&self) -> bool {
        matches!(self, Dialer::Direct)
    }

    async fn connect(&self, target: SocketAddr) -> Result<Box<dyn IoStream>> {
        match self {
            Dialer::Direct => Ok(Box::new(
                TcpStream::connect(target)
                    .await
                    .with_context(|| format!("connect {target}"))?,
            )),
            Dialer::Socks5(proxy) => Ok(Box::new(
                Socks5Stream::connect(proxy.as_str(), target)
                    .await
                    .with_context(|| format!("connect {target} via socks5 {proxy}"))?,
            )),
        }
    }
}

pub trait IoStream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> IoStream for T {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlainProto {
    Udp,
    Tcp,
}

/// Parse a plain DNS endpoint: `ip[:port][/udp|/tcp]`, port 53 and udp
/// by default.
pub fn parse_plain_endpoint(raw: &str) -> Result<(SocketAddr, PlainProto)> {
    let (addr_part, proto) = match raw.rsplit_once('/') {
        Some((addr, "udp")) => (addr, PlainProto::Udp),
        Some((addr, "tcp")) => (addr, PlainProto::Tcp),
        Some((_, other)) => bail!("unknown transport suffix `/{other}` in {raw:?}"),
        None => (raw, PlainProto::Udp),
    };
    Ok((parse_host_port(addr_part, 53)?, proto))
}

/// Parse a DoT endpoint: `ip[:port][@server_name]`, port 853 by
/// default; without a server name the certificate is checked against
/// the address itself.
pub fn parse_dot_endpoint(raw: &str) -> Result<(SocketAddr, String)> {
    let (addr_part, sni) = match raw.split_once('@') {
        Some((addr, name)) if !name.is_empty() => (addr, Some(name)),
        Some((addr, _)) => (addr, None),
        None => (raw, None),
    };
    let addr = parse_host_port(addr_part, 853)?;
    let server_name = sni
        .map(str::to_string)
        .unwrap_or_else(|| addr.ip().to_string());
    Ok((addr, server_name))
}

fn parse_host_port(raw: &str, default_port: u16) -> Result<SocketAddr> {
    if let Ok(addr) = raw.parse::<SocketAddr>() {
        return Ok(addr);
    }
    if let Ok(ip) = raw.parse::<IpAddr>() {
        return Ok(SocketAddr::new(ip, default_port));
    }
    bail!("expected ip[:port], got {raw:?}")
}

/// Plain DNS over UDP. One ephemeral socket per call; truncated
/// responses are returned as-is and left to the client to retry over
/// TCP.
pub struct UdpCaller {
    addr: SocketAddr,
    timeout: Duration,
    label: String,
}

impl UdpCaller {
    pub fn new(addr: SocketAddr, timeout: Duration) -> Self {
        Self {
            addr,
            timeout,
            label: format!("udp://{addr}"),
        }
    }
}

#[async_trait]
impl Caller for UdpCaller {
    async fn call(&self, request: &Message) -> Result<Message> {
        let payload = encode_message(request)?;
        let bind: SocketAddr = if self.addr.is_ipv4() {
            (std::net::Ipv4Addr::UNSPECIFIED, 0).into()
        } else {
            (std::net::Ipv6Addr::UNSPECIFIED, 0).into()
        };

        let exchange = async {
            let socket = UdpSocket::bind(bind).await?;
            socket.connect(self.addr).await?;
            socket.send(&payload).await?;
            let mut buf = [0u8; MAX_UDP_PAYLOAD];
            let len = socket.recv(&mut buf).await?;
            Ok::<Vec<u8>, std::io::Error>(buf[..len].to_vec())
        };
        let raw = tokio::time::timeout(self.timeout, exchange)
            .await
            .map_err(|_| anyhow!("{} timed out", self.label))?
            .with_context(|| format!("{} exchange failed", self.label))?;
        Message::from_bytes(&raw).context("decode response")
    }

    fn endpoint(&self) -> &str {
        &self.label
    }
}

/// Plain DNS over TCP with 2-byte length framing; dials through the
/// group's SOCKS5 proxy when one is configured.
pub struct TcpCaller {
    addr: SocketAddr,
    dialer: Dialer,
    timeout: Duration,
    label: String,
}

impl TcpCaller {
    pub fn new(addr: SocketAddr, dialer: Dialer, timeout: Duration) -> Self {
        Self {
            addr,
            dialer,
            timeout,
            label: format!("tcp://{addr}"),
        }
    }
}

#[async_trait]
impl Caller for TcpCaller {
    async fn call(&self, request: &Message) -> Result<Message> {
        let payload = encode_message(request)?;
        let exchange = async {
            let mut stream = self.dialer.connect(self.addr).await?;
            framed_exchange(&mut stream, &payload).await
        };
        let raw = tokio::time::timeout(self.timeout, exchange)
            .await
            .map_err(|_| anyhow!("{} timed out", self.label))??;
        Message::from_bytes(&raw).context("decode response")
    }

    fn endpoint(&self) -> &str {
        &self.label
    }
}

/// DNS over TLS. The rustls client config with webpki roots is built
/// once per caller and reused across connections.
pub struct DotCaller {
    addr: SocketAddr,
    server_name: ServerName<'static>,
    connector: TlsConnector,
    dialer: Dialer,
    timeout: Duration,
    label: String,
}

impl DotCaller {
    pub fn new(endpoint: &str, dialer: Dialer, timeout: Duration) -> Result<Self> {
        let (addr, server_name) = parse_dot_endpoint(endpoint)?;
        let server_name = ServerName::try_from(server_name.clone())
            .map_err(|_| anyhow!("invalid tls server name {server_name:?}"))?;

        let mut roots = rustls::RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        let config = rustls::ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();

        Ok(Self {
            addr,
            server_name,
            connector: TlsConnector::from(Arc::new(config)),
            dialer,
            timeout,
            label: format!("dot://{endpoint}"),
        })
    }
}

#[async_trait]
impl Caller for DotCaller {
    async fn call(&self, request: &Message) -> Result<Message> {
        let payload = encode_message(request)?;
        let exchange = async {
            let stream = self.dialer.connect(self.addr).await?;
            let mut tls = self
                .connector
                .connect(self.server_name.clone(), stream)
                .await
                .with_context(|| format!("tls handshake with {}", self.label))?;
            framed_exchange(&mut tls, &payload).await
        };
        let raw = tokio::time::timeout(self.timeout, exchange)
            .await
            .map_err(|_| anyhow!("{} timed out", self.label))??;
        Message::from_bytes(&raw).context("decode response")
    }

    fn endpoint(&self) -> &str {
        &self.label
    }
}

/// DNS over HTTPS, RFC 8484 POST. The reqwest client carries the
/// per-call timeout and, when the group is proxied, the SOCKS5 proxy.
pub struct DohCaller {
    url: reqwest::Url,
    client: reqwest::Client,
    label: String,
}

impl DohCaller {
    pub fn new(url: &str, socks5: Option<&str>, timeout: Duration) -> Result<Self> {
        let parsed = reqwest::Url::parse(url).with_context(|| format!("bad doh url {url:?}"))?;
        ensure!(
            matches!(parsed.scheme(), "http" | "https"),
            "doh url must be http(s): {url:?}"
        );

        let mut builder = reqwest::Client::builder().timeout(timeout);
        if let Some(proxy) = socks5 {
            builder = builder.proxy(
                reqwest::Proxy::all(format!("socks5h://{proxy}"))
                    .with_context(|| format!("bad socks5 proxy {proxy:?}"))?,
            );
        }
        let client = builder.build().context("build doh client")?;

        Ok(Self {
            url: parsed,
            client,
            label: url.to_string(),
        })
    }
}

#[async_trait]
impl Caller for DohCaller {
    async fn call(&self, request: &Message) -> Result<Message> {
        let payload = encode_message(request)?;
        let response = self
            .client
            .post(self.url.clone())
            .header(reqwest::header::CONTENT_TYPE, "application/dns-message")
            .header(reqwest::header::ACCEPT, "application/dns-message")
            .body(payload)
            .send()
            .await
            .with_context(|| format!("{} request failed", self.label))?;
        ensure!(
            response.status().is_success(),
            "{} returned {}",
            self.label,
            response.status()
        );
        let body = response.bytes().await.context("read doh body")?;
        Message::from_bytes(&body).context("decode response")
    }

    fn endpoint(&self) -> &str {
        &self.label
    }
}

async fn framed_exchange<S: AsyncRead + AsyncWrite + Unpin>(
    stream: &mut S,
    payload: &[u8],
) -> Result<Vec<u8>> {
    ensure!(payload.len() <= u16::MAX as usize, "query too large");
    let mut framed = Vec::with_capacity(2 + payload.len());
    framed.extend_from_slice(&(payload.len() as u16).to_be_bytes());
    framed.extend_from_slice(payload);
    stream.write_all(&framed).await?;

    let mut len_buf = [0u8; 2];
    stream.read_exact(&mut len_buf).await?;
    let len = u16::from_be_bytes(len_buf) as usize;
    let mut buf = vec![0u8; len];
    stream.read_exact(&mut buf).await?;
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_endpoint_defaults_to_udp_53() {
        let (addr, proto) = parse_plain_endpoint("1.1.1.1").unwrap();
        assert_eq!(addr, "1.1.1.1:53".parse().unwrap());
        assert_eq!(proto, PlainProto::Udp);
    }

    #[test]
    fn plain_endpoint_accepts_port_and_transport() {
        let (addr, proto) = parse_plain_endpoint("8.8.8.8:5353/tcp").unwrap();
        assert_eq!(addr, "8.8.8.8:5353".parse().unwrap());
        assert_eq!(proto, PlainProto::Tcp);

        let (_, proto) = parse_plain_endpoint("9.9.9.9/udp").unwrap();
        assert_eq!(proto, PlainProto::Udp);
    }

    #[test]
    fn plain_endpoint_rejects_garbage() {
        assert!(parse_plain_endpoint("not exists").is_err());
        assert!(parse_plain_endpoint("1.1.1.1/quic").is_err());
        assert!(parse_plain_endpoint("").is_err());
    }

    #[test]
    fn dot_endpoint_defaults_to_853_and_ip_name() {
        let (addr, sni) = parse_dot_endpoint("1.1.1.1").unwrap();
        assert_eq!(addr, "1.1.1.1:853".parse().unwrap());
        assert_eq!(sni, "1.1.1.1");
    }

    #[test]
    fn dot_endpoint_takes_explicit_server_name() {
        let (addr, sni) = parse_dot_endpoint("1.1.1.1@cloudflare-dns.com").unwrap();
        assert_eq!(addr, "1.1.1.1:853".parse().unwrap());
        assert_eq!(sni, "cloudflare-dns.com");

        let (addr, sni) = parse_dot_endpoint("8.8.4.4:8853@dns.google").unwrap();
        assert_eq!(addr, "8.8.4.4:8853".parse().unwrap());
        assert_eq!(sni, "dns.google");
    }

    #[test]
    fn dot_endpoint_with_empty_name_falls_back_to_ip() {
        let (_, sni) = parse_dot_endpoint("1.1.1.1@").unwrap();
        assert_eq!(sni, "1.1.1.1");
    }

    #[test]
    fn dot_caller_construction_validates_endpoint() {
        assert!(DotCaller::new("1.1.1.1@name", Dialer::Direct, Duration::from_secs(5)).is_ok());
        assert!(DotCaller::new("not exists", Dialer::Direct, Duration::from_secs(5)).is_err());
    }

    #[test]
    fn doh_caller_construction_validates_url() {
        assert!(DohCaller::new(
            "https://doh.test/dns-query",
            None,
            Duration::from_secs(5)
        )
        .is_ok());
        assert!(DohCaller::new("not exists", None, Duration::from_secs(5)).is_err());
        assert!(DohCaller::new("ftp://doh.test/x", None, Duration::from_secs(5)).is_err());
    }

    #[tokio::test]
    async fn framed_exchange_round_trip() {
        let (mut client, mut server) = tokio::io::duplex(512);
        let echo = tokio::spawn(async move {
            let mut len_buf = [0u8; 2];
            server.read_exact(&mut len_buf).await.unwrap();
            let len = u16::from_be_bytes(len_buf) as usize;
            let mut buf = vec![0u8; len];
            server.read_exact(&mut buf).await.unwrap();

            let reply = b"pong";
            server
                .write_all(&(reply.len() as u16).to_be_bytes())
                .await
                .unwrap();
            server.write_all(reply).await.unwrap();
            buf
        });

        let raw = framed_exchange(&mut client, b"ping").await.unwrap();
        assert_eq!(raw, b"pong");
        assert_eq!(echo.await.unwrap(), b"ping");
    }
}
