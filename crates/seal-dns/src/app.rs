use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use parking_lot::RwLock;
use seal_dns_lib::Stamp;
use tokio::task::JoinSet;

use crate::cli::Args;
use crate::listener::DnsListener;
use crate::plugins::{query_log, BlockNamePlugin, CloakMap, CloakPlugin, NameSet, PluginChain};
use crate::prefetch::{self, ReloadableList};
use crate::proxy::{Proxy, ProxyConfig};
use crate::transport::ReqwestHttpClient;

pub struct App;

impl App {
    pub async fn run_until_completion(args: Args) -> anyhow::Result<()> {
        let config = ProxyConfig {
            max_clients: args.max_clients,
            timeout: Duration::from_millis(args.timeout_ms),
            cert_refresh_delay: Duration::from_secs(args.cert_refresh_delay * 60),
            cert_refresh_delay_after_failure: Duration::from_secs(args.cert_refresh_delay_after_failure),
            cert_ignore_timestamp: args.cert_ignore_timestamp,
            ephemeral_keys: args.ephemeral_keys,
            force_tcp: args.force_tcp,
            doh_use_get: args.doh_use_get,
        };

        let mut plugins = PluginChain::new();
        let mut lists = Vec::new();
        let mut tasks: JoinSet<anyhow::Result<()>> = JoinSet::new();

        if args.blocked_names.is_some() || args.allowed_names.is_some() {
            let blocked = Arc::new(RwLock::new(NameSet::default()));
            let allowed = Arc::new(RwLock::new(NameSet::default()));
            if let Some(path) = args.blocked_names.clone() {
                lists.push(name_set_list(path, blocked.clone()));
            }
            if let Some(path) = args.allowed_names.clone() {
                lists.push(name_set_list(path, allowed.clone()));
            }
            plugins.push_query(Box::new(BlockNamePlugin::new(
                blocked,
                allowed,
                args.refused_code_in_responses,
            )));
        }
        if let Some(path) = args.cloaking_rules.clone() {
            let map = Arc::new(RwLock::new(CloakMap::default()));
            let sink = map.clone();
            lists.push(ReloadableList::new(
                path,
                Box::new(move |text| {
                    *sink.write() = CloakMap::parse(text)?;
                    Ok(())
                }),
            ));
            plugins.push_query(Box::new(CloakPlugin::new(map)));
        }
        if let Some(path) = args.query_log.clone() {
            let (plugin, writer) = query_log(path);
            plugins.push_logging(Box::new(plugin));
            tasks.spawn(writer.run());
        }

        for list in &mut lists {
            list.load().await?;
        }

        let http_client = Arc::new(ReqwestHttpClient::new().context("failed to build the DoH client")?);
        let proxy = Arc::new(Proxy::new(config, plugins, http_client));

        anyhow::ensure!(!args.server.is_empty(), "at least one --server is required");
        for entry in &args.server {
            let (name, stamp) = entry
                .split_once('=')
                .with_context(|| format!("--server entry '{entry}' is not NAME=sdns://…"))?;
            let stamp: Stamp = stamp
                .parse()
                .with_context(|| format!("invalid stamp for server '{name}'"))?;
            proxy.servers.register_server(name, stamp);
        }

        let live = proxy.servers.refresh(&proxy).await;
        if live > 0 {
            tracing::info!(live, "proxy is ready");
        } else if args.require_servers {
            anyhow::bail!("no server is reachable");
        } else {
            tracing::warn!("waiting for at least one server to become reachable");
        }

        if args.inherited_fds > 0 {
            #[cfg(unix)]
            for pair in 0..args.inherited_fds {
                // UDP first, then TCP, in configuration order from fd 3
                let udp_fd = 3 + (2 * pair) as std::os::fd::RawFd;
                let listener = DnsListener::from_inherited_fds(udp_fd, udp_fd + 1)?;
                listener.spawn(proxy.clone(), &mut tasks);
            }
            #[cfg(not(unix))]
            anyhow::bail!("inherited descriptors are only supported on unix");
        } else {
            for addr in &args.listen {
                let listener = DnsListener::bind(*addr).await?;
                listener.spawn(proxy.clone(), &mut tasks);
            }
        }

        tasks.spawn(cert_refresh_loop(proxy.clone()));
        tasks.spawn(prefetch::run(lists, Duration::from_secs(args.list_refresh_interval)));

        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    tracing::info!("shutting down");
                    return Ok(());
                }
                joined = tasks.join_next() => {
                    match joined {
                        Some(result) => {
                            if let Err(e) = result.context("task panicked")? {
                                tracing::error!("task failed: {:#}", e);
                            }
                        }
                        None => return Ok(()),
                    }
                }
            }
        }
    }
}

fn name_set_list(path: PathBuf, target: Arc<RwLock<NameSet>>) -> ReloadableList {
    ReloadableList::new(
        path,
        Box::new(move |text| {
            *target.write() = NameSet::parse(text)?;
            Ok(())
        }),
    )
}

/// Background certificate refresh: a long cadence while at least one
/// server is live, a short one while the proxy is degraded.
async fn cert_refresh_loop(proxy: Arc<Proxy>) -> anyhow::Result<()> {
    loop {
        let delay = if proxy.servers.live_servers() > 0 {
            proxy.config.cert_refresh_delay
        } else {
            proxy.config.cert_refresh_delay_after_failure
        };
        tokio::time::sleep(delay).await;
        proxy.servers.refresh(&proxy).await;
    }
}
