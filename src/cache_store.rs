use crate::cache_validator::CacheSnapshot;
use crate::config::Config;
use crate::errors::{FetchError, PipelineError, ResultExt};
use crate::models::{SourceConfidence, Sourced};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use moka::future::Cache;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::future::Future;
use std::path::Path;
use std::sync::Arc;

/// TTL class of a cached payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheCategory {
    Registry,
    Price,
    Infrastructure,
}

impl CacheCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheCategory::Registry => "registry",
            CacheCategory::Price => "price",
            CacheCategory::Infrastructure => "infrastructure",
        }
    }
}

/// One cached payload. Keyed by content (region, city, category), never by
/// record identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: String,
    pub category: CacheCategory,
    pub payload: Value,
    pub fetched_at: DateTime<Utc>,
}

impl CacheEntry {
    fn storage_key(&self) -> String {
        storage_key(&self.key, self.category)
    }
}

fn storage_key(key: &str, category: CacheCategory) -> String {
    format!("{}:{}", category.as_str(), key)
}

/// Per-category time-to-live.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheTtls {
    pub registry_hours: u64,
    pub price_hours: u64,
    pub infrastructure_hours: u64,
}

impl Default for CacheTtls {
    fn default() -> Self {
        Self {
            registry_hours: 24,
            price_hours: 24,
            infrastructure_hours: 168,
        }
    }
}

impl From<&Config> for CacheTtls {
    fn from(config: &Config) -> Self {
        Self {
            registry_hours: config.cache_ttl_registry_hours,
            price_hours: config.cache_ttl_price_hours,
            infrastructure_hours: config.cache_ttl_infrastructure_hours,
        }
    }
}

impl CacheTtls {
    pub fn ttl(&self, category: CacheCategory) -> Duration {
        let hours = match category {
            CacheCategory::Registry => self.registry_hours,
            CacheCategory::Price => self.price_hours,
            CacheCategory::Infrastructure => self.infrastructure_hours,
        };
        Duration::seconds(hours.saturating_mul(3600).min(i64::MAX as u64 / 1000) as i64)
    }
}

/// Storage behind the cache store. The in-process map is the default; a
/// shared key/value service can implement the same contract for
/// multi-process deployments.
#[async_trait]
pub trait CacheBackend: Send + Sync {
    async fn get(&self, storage_key: &str) -> Option<CacheEntry>;

    /// Atomic per-key write. When two writers race, the entry with the later
    /// `fetched_at` is kept.
    async fn upsert(&self, storage_key: String, entry: CacheEntry);

    async fn remove(&self, storage_key: &str);

    fn entries(&self) -> Vec<CacheEntry>;
}

/// In-process backend. Capacity-bound only: expiry is logical, so stale
/// entries stay readable for the fallback path.
pub struct MokaBackend {
    cache: Cache<String, Arc<CacheEntry>>,
}

impl MokaBackend {
    pub fn new(capacity: u64) -> Self {
        Self {
            cache: Cache::builder().max_capacity(capacity).build(),
        }
    }
}

#[async_trait]
impl CacheBackend for MokaBackend {
    async fn get(&self, storage_key: &str) -> Option<CacheEntry> {
        self.cache
            .get(storage_key)
            .await
            .map(|entry| entry.as_ref().clone())
    }

    async fn upsert(&self, storage_key: String, entry: CacheEntry) {
        let incoming = Arc::new(entry);
        self.cache
            .entry(storage_key)
            .and_upsert_with(|existing| {
                let keep = match existing {
                    Some(current) if current.value().fetched_at > incoming.fetched_at => {
                        current.into_value()
                    }
                    _ => incoming,
                };
                std::future::ready(keep)
            })
            .await;
    }

    async fn remove(&self, storage_key: &str) {
        self.cache.invalidate(storage_key).await;
    }

    fn entries(&self) -> Vec<CacheEntry> {
        self.cache
            .iter()
            .map(|(_, entry)| entry.as_ref().clone())
            .collect()
    }
}

/// Shared cache with per-category freshness and stale-read fallback.
#[derive(Clone)]
pub struct CacheStore {
    backend: Arc<dyn CacheBackend>,
    ttls: CacheTtls,
}

impl CacheStore {
    pub fn new(backend: Arc<dyn CacheBackend>, ttls: CacheTtls) -> Self {
        Self { backend, ttls }
    }

    pub fn in_memory(capacity: u64, ttls: CacheTtls) -> Self {
        Self::new(Arc::new(MokaBackend::new(capacity)), ttls)
    }

    pub fn is_fresh(&self, entry: &CacheEntry, now: DateTime<Utc>) -> bool {
        now.signed_duration_since(entry.fetched_at) < self.ttls.ttl(entry.category)
    }

    /// `(payload, is_fresh)`, or `None` on a miss. Stale entries are
    /// returned, never deleted.
    pub async fn get(&self, key: &str, category: CacheCategory) -> Option<(Value, bool)> {
        let entry = self.backend.get(&storage_key(key, category)).await?;
        let fresh = self.is_fresh(&entry, Utc::now());
        Some((entry.payload, fresh))
    }

    pub async fn set(&self, key: &str, category: CacheCategory, payload: Value) {
        self.insert_entry(CacheEntry {
            key: key.to_string(),
            category,
            payload,
            fetched_at: Utc::now(),
        })
        .await;
    }

    /// Writes an entry with its own `fetched_at` (snapshot restore).
    pub async fn insert_entry(&self, entry: CacheEntry) {
        self.backend.upsert(entry.storage_key(), entry).await;
    }

    pub async fn invalidate(&self, key: &str, category: CacheCategory) {
        self.backend.remove(&storage_key(key, category)).await;
    }

    pub fn len(&self) -> usize {
        self.backend.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Read-through lookup with write-through on a successful fetch.
    ///
    /// Fresh hit (unless `force_refresh`) → `cachedFresh`; successful fetch →
    /// `live`; failed fetch with any entry present → that entry, tagged
    /// `cachedStale` when past its TTL. No entry and a failed fetch returns
    /// the fetch error so the caller can fall back.
    pub async fn get_or_fetch<F, Fut>(
        &self,
        key: &str,
        category: CacheCategory,
        force_refresh: bool,
        fetch: F,
    ) -> Result<Sourced<Value>, FetchError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Value, FetchError>>,
    {
        let cached = self.backend.get(&storage_key(key, category)).await;
        let fresh = cached
            .as_ref()
            .map_or(false, |entry| self.is_fresh(entry, Utc::now()));

        if let Some(entry) = &cached {
            if fresh && !force_refresh {
                tracing::debug!("✓ Cache HIT for {}:{}", category.as_str(), key);
                return Ok(Sourced::new(entry.payload.clone(), SourceConfidence::CachedFresh));
            }
        }

        match fetch().await {
            Ok(payload) => {
                self.set(key, category, payload.clone()).await;
                Ok(Sourced::new(payload, SourceConfidence::Live))
            }
            Err(err) => {
                match &err {
                    FetchError::DataIntegrity(msg) => {
                        tracing::error!(
                            "❌ Data integrity fault for {}:{}: {}",
                            category.as_str(),
                            key,
                            msg
                        )
                    }
                    other => {
                        tracing::warn!(
                            "⚠️ Fetch failed for {}:{}: {}",
                            category.as_str(),
                            key,
                            other
                        )
                    }
                }
                match cached {
                    Some(entry) => {
                        let confidence = if fresh {
                            SourceConfidence::CachedFresh
                        } else {
                            SourceConfidence::CachedStale
                        };
                        tracing::warn!(
                            "⚠️ Serving {} cache entry for {}:{}",
                            confidence,
                            category.as_str(),
                            key
                        );
                        Ok(Sourced::new(entry.payload, confidence))
                    }
                    None => Err(err),
                }
            }
        }
    }

    /// Writes every entry, each sealed with a checksum.
    pub async fn save_snapshot(&self, path: &Path) -> Result<usize, PipelineError> {
        let snapshot = CacheSnapshot::new(self.backend.entries())?;
        let count = snapshot.entries.len();
        let raw = serde_json::to_vec_pretty(&snapshot)?;
        tokio::fs::write(path, raw)
            .await
            .with_context(|| format!("writing cache snapshot {}", path.display()))?;
        tracing::info!("✓ Cache snapshot saved: {} entries → {}", count, path.display());
        Ok(count)
    }

    /// Restores verified entries. A missing file is an empty snapshot.
    pub async fn load_snapshot(&self, path: &Path) -> Result<usize, PipelineError> {
        let raw = match tokio::fs::read(path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!("No cache snapshot at {}, starting cold", path.display());
                return Ok(0);
            }
            Err(e) => {
                return Err(e).with_context(|| format!("reading cache snapshot {}", path.display()))
            }
        };

        let snapshot: CacheSnapshot = serde_json::from_slice(&raw)
            .with_context(|| format!("parsing cache snapshot {}", path.display()))?;
        let (entries, rejected) = snapshot.into_verified();
        let restored = entries.len();
        for entry in entries {
            self.insert_entry(entry).await;
        }

        if rejected > 0 {
            tracing::warn!("⚠️ Discarded {} tampered cache snapshot entries", rejected);
        }
        tracing::info!("✓ Cache snapshot restored: {} entries", restored);
        Ok(restored)
    }
}
