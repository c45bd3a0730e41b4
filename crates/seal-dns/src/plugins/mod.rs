//! The per-query plugin pipeline.
//!
//! Query plugins may rewrite the query, drop it, or synthesize a
//! response; response plugins may rewrite the upstream's answer; logging
//! plugins observe the terminal state of every exchange exactly once.

mod block_name;
mod cloak;
mod query_log;

pub use block_name::{BlockNamePlugin, NameSet};
pub use cloak::{CloakMap, CloakPlugin};
pub use query_log::{query_log, QueryLogPlugin, QueryLogWriter};

use std::fmt;
use std::net::SocketAddr;

use seal_dns_lib::{qname, qtype};
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientProto {
    Udp,
    Tcp,
}

impl fmt::Display for ClientProto {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClientProto::Udp => f.write_str("udp"),
            ClientProto::Tcp => f.write_str("tcp"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PluginAction {
    Forward,
    Drop,
    Synth,
}

/// Terminal classification of an exchange, consumed by logging plugins.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PluginReturnCode {
    Pass,
    Forward,
    Drop,
    Synth,
    ParseError,
    ServerError,
    Cloak,
    NxDomain,
    Whitelist,
}

impl fmt::Display for PluginReturnCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PluginReturnCode::Pass => "PASS",
            PluginReturnCode::Forward => "FORWARD",
            PluginReturnCode::Drop => "DROP",
            PluginReturnCode::Synth => "SYNTH",
            PluginReturnCode::ParseError => "PARSE_ERROR",
            PluginReturnCode::ServerError => "SERVER_ERROR",
            PluginReturnCode::Cloak => "CLOAK",
            PluginReturnCode::NxDomain => "NXDOMAIN",
            PluginReturnCode::Whitelist => "WHITELIST",
        };
        f.write_str(name)
    }
}

/// Stack-local state threaded through one query's plugin invocations.
pub struct PluginsState {
    pub client_proto: ClientProto,
    pub client_addr: SocketAddr,
    pub server_name: String,
    pub qname: Option<String>,
    pub qtype: Option<u16>,
    pub action: PluginAction,
    pub synth_response: Option<Vec<u8>>,
    pub return_code: PluginReturnCode,
    pub start: Instant,
}

impl PluginsState {
    pub fn new(client_proto: ClientProto, client_addr: SocketAddr, server_name: String, start: Instant) -> Self {
        PluginsState {
            client_proto,
            client_addr,
            server_name,
            qname: None,
            qtype: None,
            action: PluginAction::Forward,
            synth_response: None,
            return_code: PluginReturnCode::Pass,
            start,
        }
    }
}

pub trait QueryPlugin: Send + Sync {
    fn name(&self) -> &'static str;
    fn evaluate(&self, state: &mut PluginsState, query: &mut Vec<u8>) -> anyhow::Result<()>;
}

pub trait ResponsePlugin: Send + Sync {
    fn name(&self) -> &'static str;
    fn evaluate(&self, state: &mut PluginsState, response: &mut Vec<u8>, ttl: &mut Option<u32>) -> anyhow::Result<()>;
}

pub trait LoggingPlugin: Send + Sync {
    fn log(&self, state: &PluginsState);
}

#[derive(Default)]
pub struct PluginChain {
    query: Vec<Box<dyn QueryPlugin>>,
    response: Vec<Box<dyn ResponsePlugin>>,
    logging: Vec<Box<dyn LoggingPlugin>>,
}

impl PluginChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_query(&mut self, plugin: Box<dyn QueryPlugin>) {
        self.query.push(plugin);
    }

    pub fn push_response(&mut self, plugin: Box<dyn ResponsePlugin>) {
        self.response.push(plugin);
    }

    pub fn push_logging(&mut self, plugin: Box<dyn LoggingPlugin>) {
        self.logging.push(plugin);
    }

    /// Runs the query plugins in order. A plugin switching the action
    /// away from `Forward` ends the chain, as does a whitelist match.
    pub fn apply_query_plugins(&self, state: &mut PluginsState, query: &mut Vec<u8>) -> anyhow::Result<()> {
        state.qname = qname(query).ok();
        state.qtype = qtype(query).ok();
        for plugin in &self.query {
            plugin
                .evaluate(state, query)
                .map_err(|e| e.context(format!("query plugin '{}' failed", plugin.name())))?;
            if state.action != PluginAction::Forward || state.return_code == PluginReturnCode::Whitelist {
                break;
            }
        }
        Ok(())
    }

    pub fn apply_response_plugins(
        &self,
        state: &mut PluginsState,
        response: &mut Vec<u8>,
        ttl: &mut Option<u32>,
    ) -> anyhow::Result<()> {
        for plugin in &self.response {
            plugin
                .evaluate(state, response, ttl)
                .map_err(|e| e.context(format!("response plugin '{}' failed", plugin.name())))?;
        }
        Ok(())
    }

    pub fn apply_logging_plugins(&self, state: &PluginsState) {
        for plugin in &self.logging {
            plugin.log(state);
        }
    }
}
