use std::collections::HashSet;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::sync::Arc;

use anyhow::Context as _;
use parking_lot::RwLock;
use regex::Regex;
use seal_dns_lib::{refused_response, synthetic_answer, QTYPE_A, QTYPE_AAAA};

use super::{PluginAction, PluginReturnCode, PluginsState, QueryPlugin};

const BLOCKED_TTL: u32 = 60;

/// Domain patterns loaded from a blocked-names file: one entry per line,
/// `#` comments, plain names (matching the name and any subdomain) and
/// `/regex/` lines.
#[derive(Default)]
pub struct NameSet {
    names: HashSet<String>,
    regexes: Vec<Regex>,
}

impl NameSet {
    pub fn parse(text: &str) -> anyhow::Result<NameSet> {
        let mut set = NameSet::default();
        for (line_no, line) in text.lines().enumerate() {
            let line = line.split('#').next().unwrap_or("").trim();
            if line.is_empty() {
                continue;
            }
            if let Some(pattern) = line.strip_prefix('/').and_then(|l| l.strip_suffix('/')) {
                let regex = Regex::new(pattern)
                    .with_context(|| format!("invalid regex pattern on line {}", line_no + 1))?;
                set.regexes.push(regex);
            } else {
                let name = line.trim_start_matches("*.").trim_end_matches('.').to_ascii_lowercase();
                set.names.insert(name);
            }
        }
        Ok(set)
    }

    /// Matches the name itself and every parent domain.
    pub fn contains(&self, qname: &str) -> bool {
        if !self.names.is_empty() {
            let mut name = qname;
            loop {
                if self.names.contains(name) {
                    return true;
                }
                match name.split_once('.') {
                    Some((_, parent)) => name = parent,
                    None => break,
                }
            }
        }
        self.regexes.iter().any(|regex| regex.is_match(qname))
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty() && self.regexes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.names.len() + self.regexes.len()
    }
}

/// Query plugin answering blocked names locally: either with a synthetic
/// unspecified address or with REFUSED, depending on configuration.
/// Whitelisted names bypass blocking and end the query chain.
pub struct BlockNamePlugin {
    blocked: Arc<RwLock<NameSet>>,
    allowed: Arc<RwLock<NameSet>>,
    refused_code: bool,
}

impl BlockNamePlugin {
    pub fn new(blocked: Arc<RwLock<NameSet>>, allowed: Arc<RwLock<NameSet>>, refused_code: bool) -> Self {
        BlockNamePlugin {
            blocked,
            allowed,
            refused_code,
        }
    }
}

impl QueryPlugin for BlockNamePlugin {
    fn name(&self) -> &'static str {
        "block_name"
    }

    fn evaluate(&self, state: &mut PluginsState, query: &mut Vec<u8>) -> anyhow::Result<()> {
        let Some(qname) = state.qname.as_deref() else {
            return Ok(());
        };
        if self.allowed.read().contains(qname) {
            state.return_code = PluginReturnCode::Whitelist;
            return Ok(());
        }
        if !self.blocked.read().contains(qname) {
            return Ok(());
        }

        let response = if self.refused_code {
            refused_response(query)?
        } else {
            match state.qtype {
                Some(QTYPE_A) => synthetic_answer(query, Ipv4Addr::UNSPECIFIED.into(), BLOCKED_TTL)?,
                Some(QTYPE_AAAA) => synthetic_answer(query, Ipv6Addr::UNSPECIFIED.into(), BLOCKED_TTL)?,
                _ => refused_response(query)?,
            }
        };
        state.action = PluginAction::Synth;
        state.synth_response = Some(response);
        state.return_code = PluginReturnCode::NxDomain;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugins::ClientProto;
    use seal_dns_lib::{ancount, build_query, is_response, rcode, RCODE_REFUSED};

    fn run(plugin: &BlockNamePlugin, name: &str, qtype: u16) -> PluginsState {
        let mut query = build_query(name, qtype, 1).unwrap();
        let mut state = PluginsState::new(
            ClientProto::Udp,
            "127.0.0.1:53000".parse().unwrap(),
            "-".to_string(),
            tokio::time::Instant::now(),
        );
        state.qname = seal_dns_lib::qname(&query).ok();
        state.qtype = seal_dns_lib::qtype(&query).ok();
        plugin.evaluate(&mut state, &mut query).unwrap();
        state
    }

    fn plugin(blocked: &str, allowed: &str, refused: bool) -> BlockNamePlugin {
        BlockNamePlugin::new(
            Arc::new(RwLock::new(NameSet::parse(blocked).unwrap())),
            Arc::new(RwLock::new(NameSet::parse(allowed).unwrap())),
            refused,
        )
    }

    #[test]
    fn name_set_matches_subdomains() {
        let set = NameSet::parse("ads.example.com\n# comment\n*.tracker.net\n").unwrap();
        assert!(set.contains("ads.example.com"));
        assert!(set.contains("deep.ads.example.com"));
        assert!(set.contains("cdn.tracker.net"));
        assert!(!set.contains("example.com"));
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn name_set_matches_regexes() {
        let set = NameSet::parse("/^ad[0-9]+\\./").unwrap();
        assert!(set.contains("ad42.example.com"));
        assert!(!set.contains("ads.example.com"));
    }

    #[test]
    fn blocked_a_query_gets_an_unspecified_address() {
        let plugin = plugin("ads.example.com", "", false);
        let state = run(&plugin, "ads.example.com", QTYPE_A);
        assert_eq!(state.action, PluginAction::Synth);
        assert_eq!(state.return_code, PluginReturnCode::NxDomain);
        let response = state.synth_response.unwrap();
        assert!(is_response(&response));
        assert_eq!(ancount(&response), 1);
        assert_eq!(&response[response.len() - 4..], &[0, 0, 0, 0]);
    }

    #[test]
    fn refused_mode_answers_refused() {
        let plugin = plugin("ads.example.com", "", true);
        let state = run(&plugin, "ads.example.com", QTYPE_A);
        let response = state.synth_response.unwrap();
        assert_eq!(rcode(&response), RCODE_REFUSED);
        assert_eq!(ancount(&response), 0);
    }

    #[test]
    fn whitelisted_name_bypasses_blocking() {
        let plugin = plugin("example.com", "good.example.com", false);
        let state = run(&plugin, "good.example.com", QTYPE_A);
        assert_eq!(state.action, PluginAction::Forward);
        assert_eq!(state.return_code, PluginReturnCode::Whitelist);
    }

    #[test]
    fn unlisted_name_is_forwarded() {
        let plugin = plugin("ads.example.com", "", false);
        let state = run(&plugin, "example.org", QTYPE_A);
        assert_eq!(state.action, PluginAction::Forward);
        assert_eq!(state.return_code, PluginReturnCode::Pass);
    }
}
