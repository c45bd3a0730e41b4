//! Registry of upstream resolvers: certificate refresh, liveness
//! tracking and per-query selection.
//!
//! `ServerInfo` is shared across in-flight exchanges; its immutable
//! facets are plain fields, the health facets are atomics (frequent,
//! racy-by-design updates where only the trend matters), and the
//! DNSCrypt certificate is swapped behind a lock that is never held
//! across an await point.

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::Context as _;
use parking_lot::RwLock;
use rand::Rng as _;
use seal_dns_lib::{
    build_query, has_tc_flag, is_response, select_certificate, tid, txt_records, Certificate, DnsCryptStamp, DohStamp,
    ProtoError, Stamp, VerifyingKey, MIN_DNS_PACKET_SIZE, QTYPE_A, QTYPE_TXT,
};
use url::Url;

use crate::proxy::Proxy;
use crate::transport;

const FAILURE_THRESHOLD: u32 = 3;
const UNHEALTHY_COOLDOWN: Duration = Duration::from_secs(60);

pub fn unix_time() -> u32 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs() as u32
}

fn epoch_ms() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as u64
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerProto {
    DnsCrypt,
    Doh,
}

impl fmt::Display for ServerProto {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServerProto::DnsCrypt => f.write_str("DNSCrypt"),
            ServerProto::Doh => f.write_str("DoH"),
        }
    }
}

#[derive(Clone)]
pub struct RegisteredServer {
    pub name: String,
    pub stamp: Stamp,
}

pub struct ServerInfo {
    pub name: String,
    pub proto: ServerProto,
    pub udp_addr: Option<SocketAddr>,
    pub tcp_addr: Option<SocketAddr>,
    pub url: Option<Url>,
    pub use_get: bool,
    pub timeout: Duration,
    certificate: RwLock<Option<Arc<Certificate>>>,
    failures: AtomicU32,
    unhealthy_until_ms: AtomicU64,
    last_latency_ms: AtomicU64,
}

impl ServerInfo {
    pub fn new_dnscrypt(name: impl Into<String>, addr: SocketAddr, timeout: Duration) -> Self {
        ServerInfo {
            name: name.into(),
            proto: ServerProto::DnsCrypt,
            udp_addr: Some(addr),
            tcp_addr: Some(addr),
            url: None,
            use_get: false,
            timeout,
            certificate: RwLock::new(None),
            failures: AtomicU32::new(0),
            unhealthy_until_ms: AtomicU64::new(0),
            last_latency_ms: AtomicU64::new(0),
        }
    }

    /// DNSCrypt server with a certificate already in hand, for static
    /// configurations and test harnesses that skip the bootstrap.
    pub fn with_certificate(
        name: impl Into<String>,
        addr: SocketAddr,
        timeout: Duration,
        certificate: Certificate,
    ) -> Self {
        let info = Self::new_dnscrypt(name, addr, timeout);
        *info.certificate.write() = Some(Arc::new(certificate));
        info
    }

    pub fn new_doh(name: impl Into<String>, url: Url, use_get: bool, timeout: Duration) -> Self {
        ServerInfo {
            name: name.into(),
            proto: ServerProto::Doh,
            udp_addr: None,
            tcp_addr: None,
            url: Some(url),
            use_get,
            timeout,
            certificate: RwLock::new(None),
            failures: AtomicU32::new(0),
            unhealthy_until_ms: AtomicU64::new(0),
            last_latency_ms: AtomicU64::new(0),
        }
    }

    fn from_stamp(registered: &RegisteredServer, use_get: bool, timeout: Duration) -> anyhow::Result<ServerInfo> {
        match &registered.stamp {
            Stamp::DnsCrypt(DnsCryptStamp { addr, .. }) => {
                Ok(ServerInfo::new_dnscrypt(&registered.name, *addr, timeout))
            }
            Stamp::Doh(DohStamp {
                hostname, port, path, ..
            }) => {
                let url = Url::parse(&format!("https://{}:{}{}", hostname, port, path))
                    .with_context(|| format!("invalid DoH endpoint for '{}'", registered.name))?;
                Ok(ServerInfo::new_doh(&registered.name, url, use_get, timeout))
            }
        }
    }

    pub fn certificate(&self) -> Option<Arc<Certificate>> {
        self.certificate.read().clone()
    }

    /// Swaps in a freshly fetched certificate. A certificate whose
    /// validity already ended is refused so a refresh can never replace
    /// a good certificate with a stale one.
    pub fn install_certificate(
        &self,
        certificate: Certificate,
        now: u32,
        ignore_timestamp: bool,
    ) -> Result<(), ProtoError> {
        if !ignore_timestamp && certificate.ts_end < now {
            return Err(ProtoError::BadCertificate("refusing to install an expired certificate"));
        }
        *self.certificate.write() = Some(Arc::new(certificate));
        Ok(())
    }

    pub fn notice_success(&self, latency: Duration) {
        let _ = self
            .failures
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |failures| Some(failures / 2));
        self.last_latency_ms.store(latency.as_millis() as u64, Ordering::Relaxed);
    }

    pub fn notice_failure(&self) {
        let failures = self.failures.fetch_add(1, Ordering::Relaxed) + 1;
        if failures >= FAILURE_THRESHOLD {
            self.unhealthy_until_ms
                .store(epoch_ms() + UNHEALTHY_COOLDOWN.as_millis() as u64, Ordering::Relaxed);
            tracing::warn!(server = %self.name, failures, "server marked unhealthy");
        }
    }

    pub fn failures(&self) -> u32 {
        self.failures.load(Ordering::Relaxed)
    }

    fn is_usable(&self, now_ms: u64) -> bool {
        if self.unhealthy_until_ms.load(Ordering::Relaxed) > now_ms {
            return false;
        }
        match self.proto {
            ServerProto::DnsCrypt => self.certificate.read().is_some(),
            ServerProto::Doh => true,
        }
    }

    /// Selection weight, biased against recent failures and high
    /// latency. Always positive.
    fn weight(&self) -> f64 {
        let failures = self.failures.load(Ordering::Relaxed) as f64;
        let latency_ms = self.last_latency_ms.load(Ordering::Relaxed) as f64;
        1.0 / ((1.0 + failures) * (1.0 + latency_ms / 128.0))
    }
}

pub struct ServersInfo {
    registered: RwLock<Vec<RegisteredServer>>,
    servers: RwLock<Vec<Arc<ServerInfo>>>,
    // Serializes refreshes; queries never touch it
    refresh_serial: tokio::sync::Mutex<()>,
}

impl ServersInfo {
    pub fn new() -> Self {
        ServersInfo {
            registered: RwLock::new(Vec::new()),
            servers: RwLock::new(Vec::new()),
            refresh_serial: tokio::sync::Mutex::new(()),
        }
    }

    /// Registers (or replaces) an upstream by name. The server becomes
    /// selectable once a refresh has probed it.
    pub fn register_server(&self, name: impl Into<String>, stamp: Stamp) {
        let registered = RegisteredServer { name: name.into(), stamp };
        let mut list = self.registered.write();
        match list.iter_mut().find(|existing| existing.name == registered.name) {
            Some(existing) => *existing = registered,
            None => list.push(registered),
        }
    }

    pub fn registered_count(&self) -> usize {
        self.registered.read().len()
    }

    /// Installs a ready-made server directly, bypassing registration and
    /// probing. Used by static configurations and tests.
    pub fn install_server(&self, server: ServerInfo) {
        self.servers.write().push(Arc::new(server));
    }

    /// Probes every registered server and publishes the refreshed set.
    /// Returns the number of live servers. Never concurrent with itself;
    /// failed servers are demoted but retained.
    pub async fn refresh(&self, proxy: &Proxy) -> usize {
        let _guard = self.refresh_serial.lock().await;
        let registered: Vec<RegisteredServer> = self.registered.read().clone();
        let mut refreshed: Vec<Arc<ServerInfo>> = Vec::with_capacity(registered.len());
        for entry in &registered {
            let server = match self.find_or_create(entry, proxy) {
                Ok(server) => server,
                Err(e) => {
                    tracing::warn!(server = %entry.name, "unusable server definition: {:#}", e);
                    continue;
                }
            };
            let probe_start = SystemTime::now();
            match probe(proxy, &server, &entry.stamp).await {
                Ok(()) => {
                    let latency = probe_start.elapsed().unwrap_or_default();
                    server.notice_success(latency);
                    tracing::debug!(server = %entry.name, proto = %server.proto, ?latency, "probe succeeded");
                }
                Err(e) => {
                    server.notice_failure();
                    tracing::warn!(server = %entry.name, "probe failed: {:#}", e);
                }
            }
            refreshed.push(server);
        }
        *self.servers.write() = refreshed;
        let live = self.live_servers();
        tracing::info!(live, registered = registered.len(), "server refresh finished");
        live
    }

    fn find_or_create(&self, entry: &RegisteredServer, proxy: &Proxy) -> anyhow::Result<Arc<ServerInfo>> {
        if let Some(existing) = self.servers.read().iter().find(|s| s.name == entry.name) {
            return Ok(existing.clone());
        }
        ServerInfo::from_stamp(entry, proxy.config.doh_use_get, proxy.config.timeout).map(Arc::new)
    }

    /// Weighted random pick among live servers, biased inversely by
    /// failure count and latency. `None` when no server is usable.
    pub fn get_one(&self) -> Option<Arc<ServerInfo>> {
        let now_ms = epoch_ms();
        let candidates: Vec<Arc<ServerInfo>> = self
            .servers
            .read()
            .iter()
            .filter(|server| server.is_usable(now_ms))
            .cloned()
            .collect();
        if candidates.is_empty() {
            return None;
        }
        let total: f64 = candidates.iter().map(|server| server.weight()).sum();
        let mut pick = rand::thread_rng().gen_range(0.0..total);
        for server in &candidates {
            pick -= server.weight();
            if pick <= 0.0 {
                return Some(server.clone());
            }
        }
        candidates.last().cloned()
    }

    pub fn live_servers(&self) -> usize {
        let now_ms = epoch_ms();
        self.servers.read().iter().filter(|server| server.is_usable(now_ms)).count()
    }
}

impl Default for ServersInfo {
    fn default() -> Self {
        Self::new()
    }
}

/// One liveness probe. For DNSCrypt this fetches and verifies the signed
/// short-term certificate; DoH servers answer a canned query.
async fn probe(proxy: &Proxy, server: &ServerInfo, stamp: &Stamp) -> anyhow::Result<()> {
    match stamp {
        Stamp::DnsCrypt(stamp) => probe_dnscrypt(proxy, server, stamp).await,
        Stamp::Doh(_) => probe_doh(proxy, server).await,
    }
}

async fn probe_dnscrypt(proxy: &Proxy, server: &ServerInfo, stamp: &DnsCryptStamp) -> anyhow::Result<()> {
    let provider_name = Stamp::DnsCrypt(stamp.clone())
        .provider_query_name()
        .context("stamp has no provider name")?;
    let query_tid: u16 = rand::thread_rng().gen();
    let query = build_query(&provider_name, QTYPE_TXT, query_tid)?;

    let udp_addr = server.udp_addr.context("no UDP endpoint")?;
    let response = match transport::exchange_plain_udp(udp_addr, &query, server.timeout).await {
        Ok(response) if response.len() >= MIN_DNS_PACKET_SIZE && !has_tc_flag(&response) => response,
        // Fall back to TCP on truncation or any UDP failure
        _ => {
            let tcp_addr = server.tcp_addr.context("no TCP endpoint")?;
            transport::exchange_plain_tcp(proxy.dialer.as_ref(), tcp_addr, &query, server.timeout)
                .await
                .context("certificate bootstrap failed over both UDP and TCP")?
        }
    };
    anyhow::ensure!(response.len() >= MIN_DNS_PACKET_SIZE, "short bootstrap response");
    anyhow::ensure!(is_response(&response), "bootstrap reply is not a response");
    anyhow::ensure!(tid(&response) == query_tid, "bootstrap transaction id mismatch");

    let blobs = txt_records(&response)?;
    let provider_pk =
        VerifyingKey::from_bytes(&stamp.provider_pk).context("stamp carries an invalid provider key")?;
    let now = unix_time();
    let certificate = select_certificate(&blobs, &provider_pk, now, proxy.config.cert_ignore_timestamp)?;
    tracing::info!(
        server = %server.name,
        serial = certificate.serial,
        cipher = ?certificate.cipher,
        "fetched server certificate"
    );
    server.install_certificate(certificate, now, proxy.config.cert_ignore_timestamp)?;
    Ok(())
}

async fn probe_doh(proxy: &Proxy, server: &ServerInfo) -> anyhow::Result<()> {
    let hostname = server
        .url
        .as_ref()
        .and_then(|url| url.host_str())
        .context("DoH server has no hostname")?
        .to_string();
    let query = build_query(&hostname, QTYPE_A, 0)?;
    let response = transport::exchange_doh(proxy.http_client.as_ref(), server, &query).await?;
    anyhow::ensure!(response.len() >= MIN_DNS_PACKET_SIZE, "short probe response");
    anyhow::ensure!(is_response(&response), "probe reply is not a response");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_server(name: &str) -> ServerInfo {
        ServerInfo::new_doh(
            name,
            Url::parse("https://doh.example.com/dns-query").unwrap(),
            false,
            Duration::from_secs(5),
        )
    }

    #[test]
    fn dnscrypt_server_without_certificate_is_not_usable() {
        let registry = ServersInfo::new();
        registry.install_server(ServerInfo::new_dnscrypt(
            "no-cert",
            "127.0.0.1:8443".parse().unwrap(),
            Duration::from_secs(5),
        ));
        assert_eq!(registry.live_servers(), 0);
        assert!(registry.get_one().is_none());
    }

    #[test]
    fn failures_past_the_threshold_exclude_a_server() {
        let registry = ServersInfo::new();
        registry.install_server(test_server("flaky"));
        assert_eq!(registry.live_servers(), 1);

        let server = registry.get_one().unwrap();
        for _ in 0..FAILURE_THRESHOLD {
            server.notice_failure();
        }
        assert!(server.failures() >= FAILURE_THRESHOLD);
        assert_eq!(registry.live_servers(), 0);
        assert!(registry.get_one().is_none());
    }

    #[test]
    fn success_decays_the_failure_counter() {
        let server = test_server("recovering");
        server.notice_failure();
        server.notice_failure();
        assert_eq!(server.failures(), 2);
        server.notice_success(Duration::from_millis(12));
        assert_eq!(server.failures(), 1);
    }

    #[test]
    fn weight_prefers_healthy_low_latency_servers() {
        let healthy = test_server("healthy");
        healthy.notice_success(Duration::from_millis(5));

        let slow = test_server("slow");
        slow.notice_success(Duration::from_millis(900));

        let failing = test_server("failing");
        failing.notice_failure();
        failing.notice_failure();

        assert!(healthy.weight() > slow.weight());
        assert!(healthy.weight() > failing.weight());
    }

    #[test]
    fn get_one_picks_among_live_servers() {
        let registry = ServersInfo::new();
        registry.install_server(test_server("a"));
        registry.install_server(test_server("b"));
        for _ in 0..32 {
            let picked = registry.get_one().unwrap();
            assert!(picked.name == "a" || picked.name == "b");
        }
    }

    #[test]
    fn register_server_replaces_by_name() {
        let registry = ServersInfo::new();
        let stamp: Stamp = "sdns://AgAAAAAAAAAAAAAPZG9oLmV4YW1wbGUuY29tCi9kbnMtcXVlcnk"
            .parse()
            .expect("fixture stamp must parse");
        registry.register_server("one", stamp.clone());
        registry.register_server("one", stamp);
        assert_eq!(registry.registered_count(), 1);
    }

    #[test]
    fn expired_certificate_is_not_installed() {
        use seal_dns_lib::Cipher;
        let server = ServerInfo::new_dnscrypt("s", "127.0.0.1:8443".parse().unwrap(), Duration::from_secs(5));
        let expired = Certificate {
            cipher: Cipher::XSalsa20Poly1305,
            serial: 1,
            resolver_pk: seal_dns_lib::PublicKey::from([0u8; 32]),
            client_magic: *b"magic!!\0",
            ts_start: 100,
            ts_end: 200,
        };
        assert!(server.install_certificate(expired.clone(), 500, false).is_err());
        assert!(server.certificate().is_none());
        server.install_certificate(expired, 500, true).unwrap();
        assert!(server.certificate().is_some());
    }
}
