//! Per-route, TTL-gated, atomically-swapped config snapshot cache.
//!
//! Keyed by `(route_id, path)` rather than a shared global, so two routes
//! pointing at two different whitelist files never see each other's state --
//! the bug this replaces was exactly that cross-route interference.

use moka::future::Cache;
use serde::de::DeserializeOwned;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::warn;

/// A deserializable raw config shape plus the processing step that turns it
/// into the immutable snapshot type consumers actually use.
pub trait ConfigSnapshot: Send + Sync + Sized + 'static {
    type Raw: DeserializeOwned;

    fn process(raw: Self::Raw) -> Self;
}

struct Entry<T> {
    snapshot: Arc<T>,
    loaded_at: Instant,
}

impl<T> Clone for Entry<T> {
    fn clone(&self) -> Self {
        Self {
            snapshot: self.snapshot.clone(),
            loaded_at: self.loaded_at,
        }
    }
}

/// Reads `path`, trying JSON first and falling back to YAML -- "JSON
/// preferred when both exist side-by-side" (spec.md 4.2/6).
async fn read_and_parse<T: ConfigSnapshot>(path: &Path) -> anyhow::Result<T> {
    let bytes = tokio::fs::read(path).await?;

    let raw = match serde_json::from_slice::<T::Raw>(&bytes) {
        Ok(raw) => raw,
        Err(json_err) => serde_yaml::from_slice::<T::Raw>(&bytes)
            .map_err(|yaml_err| anyhow::anyhow!("invalid config {}: json error: {json_err}; yaml error: {yaml_err}", path.display()))?,
    };

    Ok(T::process(raw))
}

/// A single-content-kind cache (whitelist, or CU pricing). `ttl == 0`
/// disables caching entirely -- every `load` re-reads from disk.
pub struct ConfigStore<T: ConfigSnapshot> {
    cache: Cache<(String, PathBuf), Entry<T>>,
}

impl<T: ConfigSnapshot> Default for ConfigStore<T> {
    fn default() -> Self {
        Self {
            cache: Cache::builder().build(),
        }
    }
}

impl<T: ConfigSnapshot> ConfigStore<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the cached snapshot if `now - loaded_at < ttl`, else reloads
    /// from disk. A failed reload logs and returns the stale snapshot if one
    /// exists rather than ever returning a partially parsed one.
    pub async fn load(
        &self,
        route_id: &str,
        path: &Path,
        ttl: Duration,
        force_reload: bool,
    ) -> anyhow::Result<Arc<T>> {
        let key = (route_id.to_string(), path.to_path_buf());

        if !force_reload && !ttl.is_zero() {
            if let Some(entry) = self.cache.get(&key).await {
                if entry.loaded_at.elapsed() < ttl {
                    return Ok(entry.snapshot);
                }
            }
        }

        match read_and_parse::<T>(path).await {
            Ok(snapshot) => {
                let entry = Entry {
                    snapshot: Arc::new(snapshot),
                    loaded_at: Instant::now(),
                };
                self.cache.insert(key, entry.clone()).await;
                Ok(entry.snapshot)
            }
            Err(err) => {
                if let Some(stale) = self.cache.get(&key).await {
                    warn!(path = %path.display(), error = %err, "config reload failed, serving stale snapshot");
                    Ok(stale.snapshot)
                } else {
                    Err(err)
                }
            }
        }
    }

    pub fn clear(&self) {
        self.cache.invalidate_all();
    }
}
