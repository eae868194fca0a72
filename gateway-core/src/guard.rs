//! Early-exit block list: IP, consumer name, and method patterns
//! (exact + `*` suffix only -- spec.md 9 flags anything fancier as
//! undefined behaviour, so we don't support it).

use ipnet::IpNet;
use serde::Deserialize;
use std::collections::HashSet;
use std::net::IpAddr;

use crate::jsonrpc::match_method;

#[derive(Debug, Clone, Deserialize)]
pub struct GuardConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub blocked_ips: Vec<IpNet>,
    #[serde(default)]
    pub blocked_consumers: HashSet<String>,
    #[serde(default)]
    pub blocked_methods: Vec<String>,
    #[serde(default = "default_block_message")]
    pub block_message: String,
}

fn default_block_message() -> String {
    "blocked".to_string()
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            blocked_ips: Vec::new(),
            blocked_consumers: HashSet::new(),
            blocked_methods: Vec::new(),
            block_message: default_block_message(),
        }
    }
}

pub struct Guard {
    config: GuardConfig,
}

impl Guard {
    pub fn new(config: GuardConfig) -> Self {
        Self { config }
    }

    fn ip_blocked(&self, ip: IpAddr) -> bool {
        self.config.blocked_ips.iter().any(|net| net.contains(&ip))
    }

    /// Runs before the body is parsed, so it can only see the IP and the
    /// consumer name resolved by authentication.
    pub fn check_pre_parse(&self, client_ip: IpAddr, consumer_name: &str) -> bool {
        if !self.config.enabled {
            return false;
        }
        self.ip_blocked(client_ip) || self.config.blocked_consumers.contains(consumer_name)
    }

    /// Runs after parse, since method-level blocks need the parsed method
    /// list -- spec.md 4.8 is explicit that guard necessarily runs twice.
    pub fn check_post_parse(&self, methods: &[String]) -> bool {
        if !self.config.enabled || self.config.blocked_methods.is_empty() {
            return false;
        }
        methods.iter().any(|method| {
            self.config
                .blocked_methods
                .iter()
                .any(|pattern| match_method(method, pattern))
        })
    }

    pub fn block_message(&self) -> &str {
        &self.config.block_message
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn guard(blocked_ips: Vec<&str>, blocked_consumers: Vec<&str>, blocked_methods: Vec<&str>) -> Guard {
        Guard::new(GuardConfig {
            enabled: true,
            blocked_ips: blocked_ips.iter().map(|s| s.parse().unwrap()).collect(),
            blocked_consumers: blocked_consumers.into_iter().map(String::from).collect(),
            blocked_methods: blocked_methods.into_iter().map(String::from).collect(),
            block_message: "nope".to_string(),
        })
    }

    #[test]
    fn blocks_exact_ip() {
        let g = guard(vec!["10.0.0.5/32"], vec![], vec![]);
        assert!(g.check_pre_parse("10.0.0.5".parse().unwrap(), "alice"));
        assert!(!g.check_pre_parse("10.0.0.6".parse().unwrap(), "alice"));
    }

    #[test]
    fn blocks_ip_range() {
        let g = guard(vec!["10.0.0.0/24"], vec![], vec![]);
        assert!(g.check_pre_parse("10.0.0.200".parse().unwrap(), "alice"));
        assert!(!g.check_pre_parse("10.0.1.1".parse().unwrap(), "alice"));
    }

    #[test]
    fn blocks_consumer_by_name() {
        let g = guard(vec![], vec!["evil-corp"], vec![]);
        assert!(g.check_pre_parse("1.2.3.4".parse().unwrap(), "evil-corp"));
        assert!(!g.check_pre_parse("1.2.3.4".parse().unwrap(), "alice"));
    }

    #[test]
    fn blocks_method_by_wildcard() {
        let g = guard(vec![], vec![], vec!["debug_*"]);
        assert!(g.check_post_parse(&["debug_traceTransaction".to_string()]));
        assert!(!g.check_post_parse(&["eth_call".to_string()]));
    }

    #[test]
    fn disabled_guard_never_blocks() {
        let mut config = GuardConfig::default();
        config.blocked_consumers.insert("evil-corp".to_string());
        let g = Guard::new(config);
        assert!(!g.check_pre_parse("1.2.3.4".parse().unwrap(), "evil-corp"));
    }
}
