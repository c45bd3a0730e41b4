use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;

use anyhow::Context as _;
use parking_lot::RwLock;
use seal_dns_lib::{synthetic_answer, QTYPE_A, QTYPE_AAAA};

use super::{PluginAction, PluginReturnCode, PluginsState, QueryPlugin};

const CLOAK_TTL: u32 = 600;

/// Hosts-style `name address` overrides. A name may map to several
/// addresses across both families.
#[derive(Default)]
pub struct CloakMap {
    entries: HashMap<String, Vec<IpAddr>>,
}

impl CloakMap {
    pub fn parse(text: &str) -> anyhow::Result<CloakMap> {
        let mut map = CloakMap::default();
        for (line_no, line) in text.lines().enumerate() {
            let line = line.split('#').next().unwrap_or("").trim();
            if line.is_empty() {
                continue;
            }
            let (name, addr) = line
                .split_once(char::is_whitespace)
                .with_context(|| format!("missing address on line {}", line_no + 1))?;
            let addr: IpAddr = addr
                .trim()
                .parse()
                .with_context(|| format!("invalid address on line {}", line_no + 1))?;
            map.entries
                .entry(name.trim_end_matches('.').to_ascii_lowercase())
                .or_default()
                .push(addr);
        }
        Ok(map)
    }

    pub fn get(&self, qname: &str) -> Option<&[IpAddr]> {
        self.entries.get(qname).map(Vec::as_slice)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Query plugin answering configured names locally with an authoritative
/// synthetic record, never contacting any upstream.
pub struct CloakPlugin {
    map: Arc<RwLock<CloakMap>>,
}

impl CloakPlugin {
    pub fn new(map: Arc<RwLock<CloakMap>>) -> Self {
        CloakPlugin { map }
    }
}

impl QueryPlugin for CloakPlugin {
    fn name(&self) -> &'static str {
        "cloak"
    }

    fn evaluate(&self, state: &mut PluginsState, query: &mut Vec<u8>) -> anyhow::Result<()> {
        let Some(qname) = state.qname.as_deref() else {
            return Ok(());
        };
        let wanted_v4 = match state.qtype {
            Some(QTYPE_A) => true,
            Some(QTYPE_AAAA) => false,
            _ => return Ok(()),
        };
        let map = self.map.read();
        let Some(addr) = map
            .get(qname)
            .and_then(|addrs| addrs.iter().find(|addr| addr.is_ipv4() == wanted_v4))
        else {
            return Ok(());
        };
        let response = synthetic_answer(query, *addr, CLOAK_TTL)?;
        drop(map);
        state.action = PluginAction::Synth;
        state.synth_response = Some(response);
        state.return_code = PluginReturnCode::Cloak;
        Ok(())
    }
}
