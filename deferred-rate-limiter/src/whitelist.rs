//! Per-network method whitelist: free/paid tiers, exact names or `prefix*`
//! wildcards.

use hashbrown::{HashMap, HashSet};
use serde::Deserialize;

use crate::config_store::ConfigSnapshot;

#[derive(Debug, Clone, Deserialize)]
struct RawNetworkWhitelist {
    #[serde(default)]
    free: Vec<String>,
    #[serde(default)]
    paid: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawWhitelistConfig {
    networks: HashMap<String, RawNetworkWhitelist>,
}

#[derive(Debug, Clone)]
pub struct NetworkWhitelist {
    pub free: Vec<String>,
    pub paid: Vec<String>,
    pub free_lookup: HashSet<String>,
    pub paid_lookup: HashSet<String>,
}

#[derive(Debug, Clone, Default)]
pub struct WhitelistConfig {
    pub networks: HashMap<String, NetworkWhitelist>,
}

impl ConfigSnapshot for WhitelistConfig {
    type Raw = RawWhitelistConfig;

    fn process(raw: Self::Raw) -> Self {
        let networks = raw
            .networks
            .into_iter()
            .map(|(network, raw_net)| {
                let free_lookup = raw_net
                    .free
                    .iter()
                    .filter(|p| !p.ends_with('*'))
                    .cloned()
                    .collect();
                let paid_lookup = raw_net
                    .paid
                    .iter()
                    .filter(|p| !p.ends_with('*'))
                    .cloned()
                    .collect();
                (
                    network,
                    NetworkWhitelist {
                        free: raw_net.free,
                        paid: raw_net.paid,
                        free_lookup,
                        paid_lookup,
                    },
                )
            })
            .collect();

        WhitelistConfig { networks }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WhitelistDenial {
    UnsupportedNetwork,
    RequiresPaidTier { method: String },
    UnsupportedMethod { method: String },
}

impl WhitelistDenial {
    pub fn reason(&self) -> String {
        match self {
            Self::UnsupportedNetwork => "unsupported network".to_string(),
            Self::RequiresPaidTier { method } => {
                format!("method {method} requires paid tier")
            }
            Self::UnsupportedMethod { method } => format!("unsupported method: {method}"),
        }
    }
}

/// `true` if `pattern` matches `method`: either an exact match, or `pattern`
/// ends in `*` and `method` starts with the substring before the `*`.
pub fn match_method(method: &str, pattern: &str) -> bool {
    match pattern.strip_suffix('*') {
        Some(prefix) => method.starts_with(prefix),
        None => method == pattern,
    }
}

fn allows(lookup: &HashSet<String>, wildcards: &[String], method: &str) -> bool {
    if lookup.contains(method) {
        return true;
    }
    wildcards
        .iter()
        .filter(|p| p.ends_with('*'))
        .any(|p| match_method(method, p))
}

/// Evaluates methods left-to-right; the first disallowed method short
/// circuits the whole batch. A method listed in both free and paid is
/// treated as free (tie-break per spec.md 4.3).
pub fn check(
    network: &str,
    methods: &[String],
    is_paid: bool,
    config: &WhitelistConfig,
) -> Result<(), WhitelistDenial> {
    let Some(net) = config.networks.get(network) else {
        return Err(WhitelistDenial::UnsupportedNetwork);
    };

    for method in methods {
        if allows(&net.free_lookup, &net.free, method) {
            continue;
        }

        if allows(&net.paid_lookup, &net.paid, method) {
            if is_paid {
                continue;
            }
            return Err(WhitelistDenial::RequiresPaidTier {
                method: method.clone(),
            });
        }

        return Err(WhitelistDenial::UnsupportedMethod {
            method: method.clone(),
        });
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> WhitelistConfig {
        WhitelistConfig::process(RawWhitelistConfig {
            networks: HashMap::from([(
                "eth-mainnet".to_string(),
                RawNetworkWhitelist {
                    free: vec!["eth_blockNumber".to_string(), "eth_chainId".to_string()],
                    paid: vec!["debug_*".to_string()],
                },
            )]),
        })
    }

    #[test]
    fn exact_free_method_allowed() {
        let cfg = config();
        assert_eq!(
            check("eth-mainnet", &["eth_blockNumber".to_string()], false, &cfg),
            Ok(())
        );
    }

    #[test]
    fn paid_wildcard_rejected_for_free_tier() {
        let cfg = config();
        let err = check(
            "eth-mainnet",
            &["debug_traceTransaction".to_string()],
            false,
            &cfg,
        )
        .unwrap_err();
        assert_eq!(
            err,
            WhitelistDenial::RequiresPaidTier {
                method: "debug_traceTransaction".to_string()
            }
        );
        assert_eq!(
            err.reason(),
            "method debug_traceTransaction requires paid tier"
        );
    }

    #[test]
    fn paid_wildcard_allowed_for_paid_tier() {
        let cfg = config();
        assert_eq!(
            check(
                "eth-mainnet",
                &["debug_traceCall".to_string()],
                true,
                &cfg
            ),
            Ok(())
        );
    }

    #[test]
    fn unknown_network_fails_closed() {
        let cfg = config();
        assert_eq!(
            check("polygon-mainnet", &["eth_chainId".to_string()], true, &cfg),
            Err(WhitelistDenial::UnsupportedNetwork)
        );
    }

    #[test]
    fn first_bad_method_short_circuits_the_batch() {
        let cfg = config();
        let methods = vec![
            "eth_blockNumber".to_string(),
            "totally_unknown".to_string(),
            "eth_chainId".to_string(),
        ];
        assert_eq!(
            check("eth-mainnet", &methods, false, &cfg),
            Err(WhitelistDenial::UnsupportedMethod {
                method: "totally_unknown".to_string()
            })
        );
    }

    #[test]
    fn method_in_both_free_and_paid_is_treated_as_free() {
        let cfg = WhitelistConfig::process(RawWhitelistConfig {
            networks: HashMap::from([(
                "eth-mainnet".to_string(),
                RawNetworkWhitelist {
                    free: vec!["eth_call".to_string()],
                    paid: vec!["eth_call".to_string()],
                },
            )]),
        });
        assert_eq!(check("eth-mainnet", &["eth_call".to_string()], false, &cfg), Ok(()));
    }
}
