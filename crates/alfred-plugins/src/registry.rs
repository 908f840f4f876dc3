//! Remote plugin index with a disk cache and stale-cache fallback.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::error::PluginError;

/// Default freshness window for the cached index.
const CACHE_TTL: Duration = Duration::from_secs(15 * 60);

/// One published plugin in the registry index.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryEntry {
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub author: String,
    #[serde(default)]
    pub repo_url: String,
    #[serde(default)]
    pub download_url: String,
    /// Lowercase hex SHA-256 of the downloadable archive; empty skips
    /// verification.
    #[serde(default)]
    pub checksum: String,
    #[serde(default)]
    pub types: Vec<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub verified: bool,
    #[serde(default)]
    pub min_version: String,
}

struct CachedIndex {
    fetched_at: Instant,
    entries: Vec<RegistryEntry>,
}

/// Plugin index client.
///
/// Lookup order: in-memory copy, then the on-disk cache while fresh, then
/// a network refresh. A refresh failure with any disk cache present falls
/// back to the stale copy with a warning; availability beats freshness.
pub struct Registry {
    url: String,
    cache_path: PathBuf,
    ttl: Duration,
    http: reqwest::Client,
    cached: RwLock<Option<CachedIndex>>,
}

impl Registry {
    pub fn new(url: impl Into<String>, cache_dir: impl AsRef<Path>) -> Self {
        Self {
            url: url.into(),
            cache_path: cache_dir.as_ref().join("registry.json"),
            ttl: CACHE_TTL,
            http: reqwest::Client::new(),
            cached: RwLock::new(None),
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Current index entries, fetched or cached.
    pub async fn entries(&self) -> Result<Vec<RegistryEntry>, PluginError> {
        {
            let cached = self.cached.read().await;
            if let Some(index) = cached.as_ref() {
                if index.fetched_at.elapsed() < self.ttl {
                    return Ok(index.entries.clone());
                }
            }
        }

        if let Some(entries) = self.fresh_disk_cache() {
            let mut cached = self.cached.write().await;
            *cached = Some(CachedIndex {
                fetched_at: Instant::now(),
                entries: entries.clone(),
            });
            return Ok(entries);
        }

        match self.refresh().await {
            Ok(entries) => Ok(entries),
            Err(e) => match self.any_disk_cache() {
                Some(entries) => {
                    tracing::warn!(
                        url = %self.url,
                        error = %e,
                        "registry refresh failed; serving stale cache"
                    );
                    Ok(entries)
                }
                None => Err(e),
            },
        }
    }

    /// Force-fetch the index and rewrite the caches.
    pub async fn refresh(&self) -> Result<Vec<RegistryEntry>, PluginError> {
        tracing::debug!(url = %self.url, "refreshing plugin registry");
        let response = self.http.get(&self.url).send().await?.error_for_status()?;
        let entries: Vec<RegistryEntry> = response.json().await?;

        if let Some(parent) = self.cache_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.cache_path, serde_json::to_string_pretty(&entries)?)?;

        let mut cached = self.cached.write().await;
        *cached = Some(CachedIndex {
            fetched_at: Instant::now(),
            entries: entries.clone(),
        });
        tracing::info!(entries = entries.len(), "plugin registry refreshed");
        Ok(entries)
    }

    /// Disk cache within the TTL, when present and parseable.
    fn fresh_disk_cache(&self) -> Option<Vec<RegistryEntry>> {
        let meta = std::fs::metadata(&self.cache_path).ok()?;
        let age = meta.modified().ok()?.elapsed().ok()?;
        if age >= self.ttl {
            return None;
        }
        self.any_disk_cache()
    }

    fn any_disk_cache(&self) -> Option<Vec<RegistryEntry>> {
        let content = std::fs::read_to_string(&self.cache_path).ok()?;
        serde_json::from_str(&content).ok()
    }

    /// Exact-name lookup.
    pub async fn find(&self, name: &str) -> Result<RegistryEntry, PluginError> {
        self.entries()
            .await?
            .into_iter()
            .find(|e| e.name == name)
            .ok_or_else(|| PluginError::NotFound(name.to_string()))
    }

    /// Case-insensitive substring search over name, description, author,
    /// and tags.
    pub async fn search(&self, query: &str) -> Result<Vec<RegistryEntry>, PluginError> {
        let needle = query.to_lowercase();
        Ok(self
            .entries()
            .await?
            .into_iter()
            .filter(|e| {
                e.name.to_lowercase().contains(&needle)
                    || e.description.to_lowercase().contains(&needle)
                    || e.author.to_lowercase().contains(&needle)
                    || e.tags.iter().any(|t| t.to_lowercase().contains(&needle))
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;

    fn index_json() -> serde_json::Value {
        serde_json::json!([
            {
                "name": "weather",
                "version": "1.0.0",
                "description": "Forecast lookups",
                "author": "alfred",
                "download_url": "https://example.com/weather.tar.gz",
                "checksum": "",
                "types": ["tool"],
                "tags": ["forecast", "climate"],
                "verified": true,
                "min_version": "0.1.0"
            },
            {
                "name": "notes",
                "version": "0.3.1",
                "description": "Quick notes",
                "author": "third-party",
                "tags": ["productivity"]
            }
        ])
    }

    #[tokio::test]
    async fn fetches_and_caches_index() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(GET).path("/index.json");
                then.status(200).json_body(index_json());
            })
            .await;

        let dir = tempfile::tempdir().unwrap();
        let registry = Registry::new(server.url("/index.json"), dir.path());

        let entries = registry.entries().await.unwrap();
        assert_eq!(entries.len(), 2);
        assert!(entries[0].verified);

        // Second call is served from memory.
        registry.entries().await.unwrap();
        mock.assert_hits_async(1).await;

        assert!(dir.path().join("registry.json").exists());
    }

    #[tokio::test]
    async fn fresh_disk_cache_avoids_network() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(GET).path("/index.json");
                then.status(200).json_body(index_json());
            })
            .await;

        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("registry.json"),
            serde_json::to_string(&index_json()).unwrap(),
        )
        .unwrap();

        let registry = Registry::new(server.url("/index.json"), dir.path());
        let entries = registry.entries().await.unwrap();
        assert_eq!(entries.len(), 2);
        mock.assert_hits_async(0).await;
    }

    #[tokio::test]
    async fn stale_cache_survives_network_failure() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/index.json");
                then.status(503);
            })
            .await;

        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("registry.json"),
            serde_json::to_string(&index_json()).unwrap(),
        )
        .unwrap();

        // Zero TTL: the disk cache is immediately stale, forcing a refresh
        // attempt that fails and falls back.
        let registry =
            Registry::new(server.url("/index.json"), dir.path()).with_ttl(Duration::ZERO);
        let entries = registry.entries().await.unwrap();
        assert_eq!(entries.len(), 2);
    }

    #[tokio::test]
    async fn network_failure_without_cache_errors() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/index.json");
                then.status(503);
            })
            .await;

        let dir = tempfile::tempdir().unwrap();
        let registry = Registry::new(server.url("/index.json"), dir.path());
        assert!(registry.entries().await.is_err());
    }

    #[tokio::test]
    async fn search_matches_all_fields() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/index.json");
                then.status(200).json_body(index_json());
            })
            .await;

        let dir = tempfile::tempdir().unwrap();
        let registry = Registry::new(server.url("/index.json"), dir.path());

        assert_eq!(registry.search("WEATHER").await.unwrap().len(), 1);
        assert_eq!(registry.search("forecast").await.unwrap().len(), 1);
        assert_eq!(registry.search("third-PARTY").await.unwrap().len(), 1);
        assert_eq!(registry.search("productivity").await.unwrap().len(), 1);
        assert!(registry.search("nonexistent").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn find_exact_name() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/index.json");
                then.status(200).json_body(index_json());
            })
            .await;

        let dir = tempfile::tempdir().unwrap();
        let registry = Registry::new(server.url("/index.json"), dir.path());

        assert_eq!(registry.find("notes").await.unwrap().version, "0.3.1");
        assert!(matches!(
            registry.find("weath").await.unwrap_err(),
            PluginError::NotFound(_)
        ));
    }
}
