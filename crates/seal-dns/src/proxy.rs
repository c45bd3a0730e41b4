use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use seal_dns_lib::{generate_keypair, PublicKey, SecretKey};

use crate::estimator::QuestionSizeEstimator;
use crate::plugins::PluginChain;
use crate::servers::ServersInfo;
use crate::transport::{DirectDialer, HttpClient, TcpDialer};

const ADMISSION_WARN_INTERVAL_SECS: u64 = 1;

#[derive(Debug, Clone)]
pub struct ProxyConfig {
    pub max_clients: u32,
    pub timeout: Duration,
    pub cert_refresh_delay: Duration,
    pub cert_refresh_delay_after_failure: Duration,
    pub cert_ignore_timestamp: bool,
    pub ephemeral_keys: bool,
    pub force_tcp: bool,
    pub doh_use_get: bool,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        ProxyConfig {
            max_clients: 250,
            timeout: Duration::from_secs(5),
            cert_refresh_delay: Duration::from_secs(240 * 60),
            cert_refresh_delay_after_failure: Duration::from_secs(10),
            cert_ignore_timestamp: false,
            ephemeral_keys: false,
            force_tcp: false,
            doh_use_get: false,
        }
    }
}

/// One long-lived value shared by reference with every task; a process
/// can host several independent proxies (the tests do).
pub struct Proxy {
    pub config: ProxyConfig,
    pub servers: ServersInfo,
    pub plugins: PluginChain,
    pub clients: ClientCounter,
    pub question_size_estimator: QuestionSizeEstimator,
    pub http_client: Arc<dyn HttpClient>,
    pub dialer: Arc<dyn TcpDialer>,
    secret_key: SecretKey,
    public_key: PublicKey,
    last_admission_warning: AtomicU64,
}

impl Proxy {
    pub fn new(config: ProxyConfig, plugins: PluginChain, http_client: Arc<dyn HttpClient>) -> Self {
        let (secret_key, public_key) = generate_keypair();
        Proxy {
            config,
            servers: ServersInfo::new(),
            plugins,
            clients: ClientCounter::new(),
            question_size_estimator: QuestionSizeEstimator::new(),
            http_client,
            dialer: Arc::new(DirectDialer),
            secret_key,
            public_key,
            last_admission_warning: AtomicU64::new(0),
        }
    }

    /// Client keypair for one upstream exchange. With ephemeral keys a
    /// fresh pair is generated per call, trading CPU for unlinkability;
    /// otherwise the process-lifetime pair is reused.
    pub fn session_keys(&self) -> (SecretKey, PublicKey) {
        if self.config.ephemeral_keys {
            generate_keypair()
        } else {
            (self.secret_key.clone(), self.public_key.clone())
        }
    }

    /// Over-capacity warning, at most once per interval so a flood of
    /// rejected clients cannot itself flood the log.
    pub fn admission_warning(&self) {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        let last = self.last_admission_warning.load(Ordering::Relaxed);
        if now.saturating_sub(last) >= ADMISSION_WARN_INTERVAL_SECS
            && self
                .last_admission_warning
                .compare_exchange(last, now, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
        {
            tracing::warn!(max_clients = self.config.max_clients, "too many in-flight clients");
        }
    }
}

/// In-flight client gate. Increments refuse to push the count past the
/// limit; decrements saturate at zero so a stray call on an error path
/// cannot underflow.
pub struct ClientCounter(AtomicU32);

impl ClientCounter {
    pub fn new() -> Self {
        ClientCounter(AtomicU32::new(0))
    }

    pub fn count(&self) -> u32 {
        self.0.load(Ordering::Relaxed)
    }

    pub fn begin(&self, max_clients: u32) -> bool {
        let mut count = self.0.load(Ordering::Relaxed);
        loop {
            if count >= max_clients {
                return false;
            }
            match self
                .0
                .compare_exchange_weak(count, count + 1, Ordering::AcqRel, Ordering::Relaxed)
            {
                Ok(_) => return true,
                Err(seen) => count = seen,
            }
        }
    }

    pub fn end(&self) {
        let mut count = self.0.load(Ordering::Relaxed);
        loop {
            if count == 0 {
                return;
            }
            match self
                .0
                .compare_exchange_weak(count, count - 1, Ordering::AcqRel, Ordering::Relaxed)
            {
                Ok(_) => return,
                Err(seen) => count = seen,
            }
        }
    }
}

impl Default for ClientCounter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counter_respects_the_limit() {
        let counter = ClientCounter::new();
        assert!(counter.begin(2));
        assert!(counter.begin(2));
        assert!(!counter.begin(2));
        assert_eq!(counter.count(), 2);
        counter.end();
        assert!(counter.begin(2));
    }

    #[test]
    fn counter_saturates_at_zero() {
        let counter = ClientCounter::new();
        counter.end();
        assert_eq!(counter.count(), 0);
        assert!(counter.begin(1));
        counter.end();
        counter.end();
        assert_eq!(counter.count(), 0);
    }

    #[test]
    fn concurrent_admission_never_exceeds_the_limit() {
        use std::sync::atomic::{AtomicU32, Ordering};

        let counter = Arc::new(ClientCounter::new());
        let admitted = Arc::new(AtomicU32::new(0));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let counter = counter.clone();
            let admitted = admitted.clone();
            handles.push(std::thread::spawn(move || {
                for _ in 0..1000 {
                    if counter.begin(16) {
                        let seen = counter.count();
                        assert!(seen <= 16);
                        admitted.fetch_add(1, Ordering::Relaxed);
                        counter.end();
                    }
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(counter.count(), 0);
        assert!(admitted.load(Ordering::Relaxed) > 0);
    }
}
