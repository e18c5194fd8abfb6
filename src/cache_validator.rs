use crate::cache_store::CacheEntry;
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};

/// Validates persisted cache entries using SHA-256 checksums.
///
/// Snapshots written by the cache store carry one checksum per entry. On
/// load, an entry whose checksum no longer matches its content is dropped
/// and the affected key is simply refetched (or falls back) on the next run.

/// Snapshot entry with integrity checksum.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ValidatedCacheEntry {
    /// The cache entry as a JSON string, hashed exactly as stored.
    pub data: String,
    /// SHA-256 checksum of `data` (hex encoded).
    pub checksum: String,
}

impl ValidatedCacheEntry {
    pub fn new(data: String) -> Self {
        let checksum = Self::compute_checksum(&data);
        Self { data, checksum }
    }

    pub fn seal(entry: &CacheEntry) -> Result<Self, serde_json::Error> {
        Ok(Self::new(serde_json::to_string(entry)?))
    }

    fn compute_checksum(data: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(data.as_bytes());
        hex::encode(hasher.finalize())
    }

    pub fn is_valid(&self) -> bool {
        Self::compute_checksum(&self.data) == self.checksum
    }

    /// Returns the entry when the checksum matches and the data parses.
    pub fn into_verified(self) -> Option<CacheEntry> {
        if !self.is_valid() {
            tracing::warn!("⚠️ Cache snapshot entry failed validation: checksum mismatch");
            return None;
        }
        match serde_json::from_str(&self.data) {
            Ok(entry) => Some(entry),
            Err(e) => {
                tracing::warn!("⚠️ Cache snapshot entry unreadable: {}", e);
                None
            }
        }
    }
}

/// On-disk cache snapshot.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct CacheSnapshot {
    pub saved_at: DateTime<Utc>,
    pub entries: Vec<ValidatedCacheEntry>,
}

impl CacheSnapshot {
    pub fn new(entries: Vec<CacheEntry>) -> Result<Self, serde_json::Error> {
        let entries = entries
            .iter()
            .map(ValidatedCacheEntry::seal)
            .collect::<Result<_, _>>()?;
        Ok(Self {
            saved_at: Utc::now(),
            entries,
        })
    }

    /// Verified entries plus the number rejected.
    pub fn into_verified(self) -> (Vec<CacheEntry>, usize) {
        let total = self.entries.len();
        let verified: Vec<CacheEntry> = self
            .entries
            .into_iter()
            .filter_map(ValidatedCacheEntry::into_verified)
            .collect();
        let rejected = total - verified.len();
        (verified, rejected)
    }
}
