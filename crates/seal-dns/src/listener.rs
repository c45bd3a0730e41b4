//! Client-facing accept loops. Each bound address carries a UDP and a
//! TCP listener; every incoming message is handled by its own task,
//! gated by the in-flight client counter.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context as _;
use seal_dns_lib::{MAX_DNS_PACKET_SIZE, MIN_DNS_PACKET_SIZE};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tokio::time::Instant;

use crate::pipeline::{process_query, ReplySink};
use crate::proxy::Proxy;
use crate::socket::OobUdpSocket;
use crate::transport;

pub struct DnsListener {
    udp: Arc<OobUdpSocket>,
    tcp: TcpListener,
}

impl DnsListener {
    pub async fn bind(addr: SocketAddr) -> anyhow::Result<Self> {
        let udp = OobUdpSocket::bind(addr).with_context(|| format!("failed to bind {addr}/UDP"))?;
        let tcp = TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to bind {addr}/TCP"))?;
        tracing::info!(%addr, "now listening");
        Ok(DnsListener { udp: Arc::new(udp), tcp })
    }

    /// Adopts a pre-opened UDP socket + TCP listener pair, as handed
    /// over by a privilege-dropping parent or a socket-activation
    /// supervisor.
    #[cfg(unix)]
    pub fn from_inherited_fds(udp_fd: std::os::fd::RawFd, tcp_fd: std::os::fd::RawFd) -> anyhow::Result<Self> {
        use std::os::fd::FromRawFd as _;

        // The supervisor contract guarantees these descriptors are ours
        // and open exactly once
        let std_udp = unsafe { std::net::UdpSocket::from_raw_fd(udp_fd) };
        let udp = OobUdpSocket::from_std(std_udp).context("failed to adopt the inherited UDP socket")?;

        let std_tcp = unsafe { std::net::TcpListener::from_raw_fd(tcp_fd) };
        std_tcp
            .set_nonblocking(true)
            .context("failed to adopt the inherited TCP listener")?;
        let tcp = TcpListener::from_std(std_tcp).context("failed to adopt the inherited TCP listener")?;

        tracing::info!(addr = %udp.local_addr()?, "now listening on inherited descriptors");
        Ok(DnsListener { udp: Arc::new(udp), tcp })
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        self.udp.local_addr().context("listener has no local address")
    }

    pub fn spawn(self, proxy: Arc<Proxy>, workers: &mut JoinSet<anyhow::Result<()>>) {
        workers.spawn(udp_loop(proxy.clone(), self.udp));
        workers.spawn(tcp_loop(proxy, self.tcp));
    }
}

async fn udp_loop(proxy: Arc<Proxy>, socket: Arc<OobUdpSocket>) -> anyhow::Result<()> {
    loop {
        let mut buf = vec![0u8; MAX_DNS_PACKET_SIZE - 1];
        let (len, peer, dst) = socket
            .recv_from_dst(&mut buf)
            .await
            .context("UDP listener failed to receive")?;
        if len < MIN_DNS_PACKET_SIZE {
            continue;
        }
        buf.truncate(len);

        let proxy = proxy.clone();
        let socket = socket.clone();
        tokio::spawn(async move {
            let start = Instant::now();
            if !proxy.clients.begin(proxy.config.max_clients) {
                proxy.admission_warning();
                return;
            }
            let server = proxy.servers.get_one();
            let sink = ReplySink::Udp { socket, peer, dst };
            process_query(&proxy, server, sink, buf, start).await;
            proxy.clients.end();
        });
    }
}

async fn tcp_loop(proxy: Arc<Proxy>, listener: TcpListener) -> anyhow::Result<()> {
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                tracing::debug!("TCP accept failed: {}", e);
                continue;
            }
        };
        let proxy = proxy.clone();
        tokio::spawn(async move {
            let start = Instant::now();
            if !proxy.clients.begin(proxy.config.max_clients) {
                proxy.admission_warning();
                return;
            }
            // One request per connection; the deadline covers the read,
            // the exchange and the reply
            let client = handle_tcp_client(&proxy, stream, peer, start);
            if tokio::time::timeout(proxy.config.timeout, client).await.is_err() {
                tracing::debug!(client = %peer, "TCP client timed out");
            }
            proxy.clients.end();
        });
    }
}

async fn handle_tcp_client(proxy: &Proxy, mut stream: TcpStream, peer: SocketAddr, start: Instant) {
    let query = match transport::read_prefixed(&mut stream).await {
        Ok(query) => query,
        Err(e) => {
            tracing::debug!(client = %peer, "failed to read a TCP query: {}", e);
            return;
        }
    };
    if query.len() < MIN_DNS_PACKET_SIZE {
        return;
    }
    let server = proxy.servers.get_one();
    let sink = ReplySink::Tcp {
        stream: &mut stream,
        peer,
    };
    process_query(proxy, server, sink, query, start).await;
}
