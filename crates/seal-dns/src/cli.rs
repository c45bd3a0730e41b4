use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;

#[derive(Parser)]
#[command(version, name = "seal-dns")]
pub struct Args {
    /// Loopback addresses to serve plain DNS on (UDP and TCP)
    #[arg(long, value_name = "ADDR", default_value = "127.0.0.1:5353")]
    pub listen: Vec<SocketAddr>,
    /// Upstream resolver as NAME=sdns://… (repeatable)
    #[arg(long, value_name = "NAME=STAMP")]
    pub server: Vec<String>,
    #[arg(long, value_name = "CLIENTS", default_value_t = 250)]
    pub max_clients: u32,
    /// Per-exchange and per-TCP-client deadline
    #[arg(long, value_name = "MS", default_value_t = 5000)]
    pub timeout_ms: u64,
    #[arg(long, value_name = "MINUTES", default_value_t = 240)]
    pub cert_refresh_delay: u64,
    #[arg(long, value_name = "SECONDS", default_value_t = 10)]
    pub cert_refresh_delay_after_failure: u64,
    /// Accept certificates regardless of their validity window
    #[arg(long, default_value_t = false)]
    pub cert_ignore_timestamp: bool,
    /// Fresh client keypair for every upstream exchange
    #[arg(long, default_value_t = false)]
    pub ephemeral_keys: bool,
    /// Always reach DNSCrypt servers over TCP
    #[arg(long, default_value_t = false)]
    pub force_tcp: bool,
    /// Use GET instead of POST for DoH exchanges
    #[arg(long, default_value_t = false)]
    pub doh_use_get: bool,
    #[arg(long, value_name = "PATH")]
    pub blocked_names: Option<PathBuf>,
    /// Names exempt from blocking
    #[arg(long, value_name = "PATH")]
    pub allowed_names: Option<PathBuf>,
    #[arg(long, value_name = "PATH")]
    pub cloaking_rules: Option<PathBuf>,
    #[arg(long, value_name = "PATH")]
    pub query_log: Option<PathBuf>,
    /// Answer blocked queries with REFUSED instead of a synthetic address
    #[arg(long, default_value_t = false)]
    pub refused_code_in_responses: bool,
    /// Exit if no server is reachable after the initial refresh
    #[arg(long, default_value_t = false)]
    pub require_servers: bool,
    /// Number of pre-opened UDP+TCP listener pairs inherited at fd 3
    /// (privilege-drop / socket-activation handoff)
    #[arg(long, value_name = "COUNT", default_value_t = 0)]
    pub inherited_fds: usize,
    /// Seconds between checks for changed list files
    #[arg(long, value_name = "SECONDS", default_value_t = 60)]
    pub list_refresh_interval: u64,
}
