//! Upstream exchanges: DNSCrypt over UDP/TCP and DoH through an
//! injected HTTP client. Every path caps the response at
//! `MAX_DNS_PACKET_SIZE` so a hostile upstream cannot force unbounded
//! allocation, and every path is bounded by the server's deadline.

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::time::Duration;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use seal_dns_lib::{
    decrypt_response, set_tid, tid, ProtoError, SharedKey, HALF_NONCE_SIZE, MAX_DNS_PACKET_SIZE, MIN_DNS_PACKET_SIZE,
};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt as _, AsyncWrite, AsyncWriteExt as _};
use tokio::net::{TcpStream, UdpSocket};
use url::Url;

use crate::servers::ServerInfo;

#[derive(Debug, Error)]
pub enum ExchangeError {
    #[error("upstream exchange timed out")]
    Timeout,
    #[error("transport error: {0}")]
    Transport(#[from] io::Error),
    #[error("HTTP error: {0}")]
    Http(String),
    #[error("no live server is available")]
    NoLiveServer,
    #[error("server has no {0} endpoint")]
    NoEndpoint(&'static str),
    #[error(transparent)]
    Proto(#[from] ProtoError),
}

/// Reads one length-prefixed DNS message from a TCP stream.
pub async fn read_prefixed<R: AsyncRead + Unpin>(stream: &mut R) -> Result<Vec<u8>, ExchangeError> {
    let eof = |e: io::Error| {
        if e.kind() == io::ErrorKind::UnexpectedEof {
            ExchangeError::Proto(ProtoError::ShortRead)
        } else {
            ExchangeError::Transport(e)
        }
    };
    let length = stream.read_u16().await.map_err(eof)? as usize;
    if length > MAX_DNS_PACKET_SIZE {
        return Err(ProtoError::Oversize(length).into());
    }
    let mut packet = vec![0u8; length];
    stream.read_exact(&mut packet).await.map_err(eof)?;
    Ok(packet)
}

/// Writes one length-prefixed DNS message to a TCP stream.
pub async fn write_prefixed<W: AsyncWrite + Unpin>(stream: &mut W, packet: &[u8]) -> Result<(), ExchangeError> {
    if packet.len() > 0xffff {
        return Err(ProtoError::Oversize(packet.len()).into());
    }
    stream.write_all(&(packet.len() as u16).to_be_bytes()).await?;
    stream.write_all(packet).await?;
    Ok(())
}

async fn with_deadline<T, F>(deadline: Duration, fut: F) -> Result<T, ExchangeError>
where
    F: Future<Output = Result<T, ExchangeError>>,
{
    tokio::time::timeout(deadline, fut).await.map_err(|_| ExchangeError::Timeout)?
}

/// One datagram out, one datagram in. Used both for encrypted exchanges
/// and for the plaintext certificate bootstrap.
pub async fn exchange_plain_udp(addr: SocketAddr, packet: &[u8], deadline: Duration) -> Result<Vec<u8>, ExchangeError> {
    let bind_addr: SocketAddr = if addr.is_ipv4() {
        "0.0.0.0:0".parse().unwrap()
    } else {
        "[::]:0".parse().unwrap()
    };
    with_deadline(deadline, async {
        let socket = UdpSocket::bind(bind_addr).await?;
        socket.connect(addr).await?;
        socket.send(packet).await?;
        let mut response = vec![0u8; MAX_DNS_PACKET_SIZE];
        let length = socket.recv(&mut response).await?;
        response.truncate(length);
        Ok(response)
    })
    .await
}

pub async fn exchange_plain_tcp(
    dialer: &dyn TcpDialer,
    addr: SocketAddr,
    packet: &[u8],
    deadline: Duration,
) -> Result<Vec<u8>, ExchangeError> {
    with_deadline(deadline, async {
        let mut stream = dialer.dial(addr).await?;
        write_prefixed(&mut stream, packet).await?;
        read_prefixed(&mut stream).await
    })
    .await
}

/// Sends a sealed DNSCrypt query over UDP and opens the reply. A single
/// datagram read, no retries; the stub resolver owns retry policy.
pub async fn exchange_dnscrypt_udp(
    server: &ServerInfo,
    shared_key: &SharedKey,
    encrypted_query: &[u8],
    client_nonce: &[u8; HALF_NONCE_SIZE],
) -> Result<Vec<u8>, ExchangeError> {
    let addr = server.udp_addr.ok_or(ExchangeError::NoEndpoint("UDP"))?;
    let encrypted_response = exchange_plain_udp(addr, encrypted_query, server.timeout).await?;
    Ok(decrypt_response(shared_key, client_nonce, &encrypted_response)?)
}

/// Same flow over TCP, length-prefixed, through the configured dialer.
pub async fn exchange_dnscrypt_tcp(
    server: &ServerInfo,
    dialer: &dyn TcpDialer,
    shared_key: &SharedKey,
    encrypted_query: &[u8],
    client_nonce: &[u8; HALF_NONCE_SIZE],
) -> Result<Vec<u8>, ExchangeError> {
    let addr = server.tcp_addr.ok_or(ExchangeError::NoEndpoint("TCP"))?;
    let encrypted_response = exchange_plain_tcp(dialer, addr, encrypted_query, server.timeout).await?;
    Ok(decrypt_response(shared_key, client_nonce, &encrypted_response)?)
}

/// DoH exchange per RFC 8484. The request on the wire always carries
/// transaction id zero; the original id is restored on the response.
pub async fn exchange_doh(
    http_client: &dyn HttpClient,
    server: &ServerInfo,
    query: &[u8],
) -> Result<Vec<u8>, ExchangeError> {
    let url = server.url.as_ref().ok_or(ExchangeError::NoEndpoint("DoH"))?;
    if query.len() > MAX_DNS_PACKET_SIZE {
        return Err(ProtoError::Oversize(query.len()).into());
    }
    let original_tid = tid(query);
    let mut body = query.to_vec();
    set_tid(&mut body, 0);
    let mut response = http_client
        .dns_exchange(url, server.use_get, body, server.timeout)
        .await?;
    if response.len() >= MIN_DNS_PACKET_SIZE {
        set_tid(&mut response, original_tid);
    }
    Ok(response)
}

/// Outbound TCP connector, replaceable so exchanges can be routed
/// through an outbound proxy.
pub trait TcpDialer: Send + Sync {
    fn dial<'a>(&'a self, addr: SocketAddr) -> Pin<Box<dyn Future<Output = io::Result<TcpStream>> + Send + 'a>>;
}

pub struct DirectDialer;

impl TcpDialer for DirectDialer {
    fn dial<'a>(&'a self, addr: SocketAddr) -> Pin<Box<dyn Future<Output = io::Result<TcpStream>> + Send + 'a>> {
        Box::pin(async move {
            let stream = TcpStream::connect(addr).await?;
            stream.set_nodelay(true)?;
            Ok(stream)
        })
    }
}

/// The injected HTTP client behind DoH. The default implementation wraps
/// reqwest; tests substitute a mock.
pub trait HttpClient: Send + Sync {
    fn dns_exchange<'a>(
        &'a self,
        url: &'a Url,
        use_get: bool,
        body: Vec<u8>,
        deadline: Duration,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<u8>, ExchangeError>> + Send + 'a>>;
}

pub struct ReqwestHttpClient {
    client: reqwest::Client,
}

const DNS_MESSAGE_MIME: &str = "application/dns-message";

impl ReqwestHttpClient {
    pub fn new() -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .use_rustls_tls()
            .user_agent(concat!("seal-dns/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(ReqwestHttpClient { client })
    }
}

impl HttpClient for ReqwestHttpClient {
    fn dns_exchange<'a>(
        &'a self,
        url: &'a Url,
        use_get: bool,
        body: Vec<u8>,
        deadline: Duration,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<u8>, ExchangeError>> + Send + 'a>> {
        Box::pin(async move {
            let request = if use_get {
                let mut url = url.clone();
                url.query_pairs_mut().append_pair("dns", &URL_SAFE_NO_PAD.encode(&body));
                self.client.get(url).header(reqwest::header::ACCEPT, DNS_MESSAGE_MIME)
            } else {
                self.client
                    .post(url.clone())
                    .header(reqwest::header::CONTENT_TYPE, DNS_MESSAGE_MIME)
                    .header(reqwest::header::ACCEPT, DNS_MESSAGE_MIME)
                    .body(body)
            };
            let map_err = |e: reqwest::Error| {
                if e.is_timeout() {
                    ExchangeError::Timeout
                } else {
                    ExchangeError::Http(e.to_string())
                }
            };
            let mut response = request
                .timeout(deadline)
                .send()
                .await
                .and_then(reqwest::Response::error_for_status)
                .map_err(map_err)?;
            let mut payload = Vec::new();
            while let Some(chunk) = response.chunk().await.map_err(map_err)? {
                if payload.len() + chunk.len() > MAX_DNS_PACKET_SIZE {
                    return Err(ProtoError::Oversize(payload.len() + chunk.len()).into());
                }
                payload.extend_from_slice(&chunk);
            }
            Ok(payload)
        })
    }
}
