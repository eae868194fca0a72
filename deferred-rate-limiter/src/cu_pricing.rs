//! Per-method compute-unit pricing: exact match, then first matching
//! wildcard in file order, then a network-wide default.

use indexmap::IndexMap;
use serde::Deserialize;

use crate::config_store::ConfigSnapshot;

#[derive(Debug, Clone, Deserialize)]
pub struct RawCuConfig {
    #[serde(default = "default_cu")]
    default: u64,
    #[serde(default)]
    methods: IndexMap<String, u64>,
}

fn default_cu() -> u64 {
    1
}

#[derive(Debug, Clone)]
pub struct CuConfig {
    pub default: u64,
    /// Insertion order from the config file, so the first wildcard match
    /// wins exactly like spec.md 4.4 specifies.
    methods: IndexMap<String, u64>,
}

impl ConfigSnapshot for CuConfig {
    type Raw = RawCuConfig;

    fn process(raw: Self::Raw) -> Self {
        CuConfig {
            default: raw.default.max(1),
            methods: raw.methods,
        }
    }
}

impl CuConfig {
    /// Exact match first, then the first `prefix*` wildcard entry (in
    /// file/iteration order) whose prefix matches, else `default`.
    pub fn get_method_cu(&self, method: &str) -> u64 {
        if let Some(cu) = self.methods.get(method) {
            return *cu;
        }

        for (pattern, cu) in &self.methods {
            if let Some(prefix) = pattern.strip_suffix('*') {
                if method.starts_with(prefix) {
                    return *cu;
                }
            }
        }

        self.default
    }
}

/// Cost of one method when no pricing config could be loaded at all -- 1 CU,
/// a safe default that never throws.
fn cu_for_method(method: &str, config: Option<&CuConfig>) -> u64 {
    if method.is_empty() {
        // tombstone from a partial-batch parse failure
        return 0;
    }
    match config {
        Some(config) => config.get_method_cu(method),
        None => 1,
    }
}

/// Sum of the per-method cost over `methods`. Tombstoned entries (empty
/// string, from a partial-parse placeholder) contribute 0.
pub fn calculate(methods: &[String], config: Option<&CuConfig>) -> u64 {
    methods.iter().map(|m| cu_for_method(m, config)).sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> CuConfig {
        CuConfig::process(RawCuConfig {
            default: 1,
            methods: IndexMap::from([
                ("eth_call".to_string(), 26),
                ("eth_get*".to_string(), 19),
                ("eth_getLogs".to_string(), 75),
            ]),
        })
    }

    #[test]
    fn exact_match_wins_over_wildcard() {
        let cfg = config();
        assert_eq!(cfg.get_method_cu("eth_getLogs"), 75);
    }

    #[test]
    fn first_matching_wildcard_in_file_order_wins() {
        let cfg = config();
        assert_eq!(cfg.get_method_cu("eth_getBalance"), 19);
    }

    #[test]
    fn unknown_method_falls_back_to_default() {
        let cfg = config();
        assert_eq!(cfg.get_method_cu("net_version"), 1);
    }

    #[test]
    fn calculate_sums_across_a_batch() {
        let cfg = config();
        let methods = vec![
            "eth_call".to_string(),
            "eth_getBalance".to_string(),
            "net_version".to_string(),
        ];
        assert_eq!(calculate(&methods, Some(&cfg)), 26 + 19 + 1);
    }

    #[test]
    fn tombstones_contribute_zero() {
        let cfg = config();
        let methods = vec!["eth_call".to_string(), String::new()];
        assert_eq!(calculate(&methods, Some(&cfg)), 26);
    }

    #[test]
    fn missing_config_defaults_to_one_per_method() {
        let methods = vec!["eth_call".to_string(), "eth_chainId".to_string()];
        assert_eq!(calculate(&methods, None), 2);
    }
}
