//! Config store (whitelist + CU pricing), whitelist evaluator, and CU
//! calculator -- C2, C3, C4 of the gateway core. All three live together
//! because C3/C4 operate purely on the snapshots C2 produces.

pub mod config_store;
pub mod cu_pricing;
pub mod whitelist;

pub use config_store::{ConfigSnapshot, ConfigStore};
pub use cu_pricing::{calculate, CuConfig};
pub use whitelist::{check, match_method, NetworkWhitelist, WhitelistConfig, WhitelistDenial};

use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigKind {
    Whitelist,
    CuPricing,
}

/// Holds the two per-route config stores side by side so a route can be
/// loaded and evaluated without the caller juggling two separate types.
#[derive(Default)]
pub struct DeferredConfigStore {
    whitelist: ConfigStore<WhitelistConfig>,
    cu_pricing: ConfigStore<CuConfig>,
}

impl DeferredConfigStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn load_whitelist(
        &self,
        route_id: &str,
        path: &Path,
        ttl: Duration,
        force_reload: bool,
    ) -> anyhow::Result<std::sync::Arc<WhitelistConfig>> {
        self.whitelist.load(route_id, path, ttl, force_reload).await
    }

    pub async fn load_cu_pricing(
        &self,
        route_id: &str,
        path: &Path,
        ttl: Duration,
        force_reload: bool,
    ) -> anyhow::Result<std::sync::Arc<CuConfig>> {
        self.cu_pricing.load(route_id, path, ttl, force_reload).await
    }

    /// `None` clears both kinds; otherwise clears just the one named.
    pub fn clear_cache(&self, kind: Option<ConfigKind>) {
        match kind {
            None => {
                self.whitelist.clear();
                self.cu_pricing.clear();
            }
            Some(ConfigKind::Whitelist) => self.whitelist.clear(),
            Some(ConfigKind::CuPricing) => self.cu_pricing.clear(),
        }
    }
}
