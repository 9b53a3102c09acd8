//! Snapshot persistence.
//!
//! Two stores back every session: a primary store standing in for the host's
//! chat metadata, and a file-backed fallback cache mirroring the original's
//! local-storage backup. Load policy is "prefer primary if the owner matches,
//! else fallback if the owner matches, else nothing" — applied once at load
//! time, never continuously reconciled. An owner mismatch is logged and the
//! record skipped; it is never surfaced as a hard failure.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::history::VersionHistory;
use crate::phone::PhoneData;

/// What a store persists per owner: the live snapshot plus its version ledger,
/// so the ledger survives a lost primary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredPhone {
    pub owner_id: String,
    pub phone: PhoneData,
    pub history: VersionHistory,
    pub saved_at: DateTime<Utc>,
}

#[async_trait]
pub trait SnapshotStore: Send + Sync {
    async fn load(&self, owner_id: &str) -> Result<Option<StoredPhone>>;
    async fn save(&self, record: &StoredPhone) -> Result<()>;
    async fn clear(&self, owner_id: &str) -> Result<()>;
}

/// In-memory primary store, standing in for host-provided chat metadata.
#[derive(Debug, Default)]
pub struct MetadataStore {
    records: Mutex<HashMap<String, StoredPhone>>,
}

impl MetadataStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SnapshotStore for MetadataStore {
    async fn load(&self, owner_id: &str) -> Result<Option<StoredPhone>> {
        let records = self
            .records
            .lock()
            .map_err(|_| anyhow::anyhow!("metadata store lock poisoned"))?;
        Ok(records.get(owner_id).cloned())
    }

    async fn save(&self, record: &StoredPhone) -> Result<()> {
        let mut records = self
            .records
            .lock()
            .map_err(|_| anyhow::anyhow!("metadata store lock poisoned"))?;
        records.insert(record.owner_id.clone(), record.clone());
        Ok(())
    }

    async fn clear(&self, owner_id: &str) -> Result<()> {
        let mut records = self
            .records
            .lock()
            .map_err(|_| anyhow::anyhow!("metadata store lock poisoned"))?;
        records.remove(owner_id);
        Ok(())
    }
}

/// JSON-file fallback cache, one file per owner under `dir`, keyed
/// `<prefix>_<owner_id>.json`. A file that fails to parse is treated as
/// absent rather than an error.
#[derive(Debug)]
pub struct FileCacheStore {
    dir: PathBuf,
    prefix: String,
}

impl FileCacheStore {
    pub fn new(dir: impl Into<PathBuf>, prefix: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            prefix: prefix.into(),
        }
    }

    fn path_for(&self, owner_id: &str) -> PathBuf {
        // Owner ids come from the host; keep only filesystem-safe characters.
        let safe: String = owner_id
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
            .collect();
        self.dir.join(format!("{}_{}.json", self.prefix, safe))
    }
}

#[async_trait]
impl SnapshotStore for FileCacheStore {
    async fn load(&self, owner_id: &str) -> Result<Option<StoredPhone>> {
        let path = self.path_for(owner_id);
        if !path.exists() {
            return Ok(None);
        }
        let contents = fs::read_to_string(&path)
            .with_context(|| format!("failed to read cache file {:?}", path))?;
        match serde_json::from_str::<StoredPhone>(&contents) {
            Ok(record) => Ok(Some(record)),
            Err(e) => {
                tracing::warn!("Ignoring unreadable cache file {:?}: {}", path, e);
                Ok(None)
            }
        }
    }

    async fn save(&self, record: &StoredPhone) -> Result<()> {
        if !self.dir.exists() {
            fs::create_dir_all(&self.dir)
                .with_context(|| format!("failed to create cache dir {:?}", self.dir))?;
        }
        let path = self.path_for(&record.owner_id);
        let contents =
            serde_json::to_string_pretty(record).context("failed to serialize phone cache")?;
        fs::write(&path, contents)
            .with_context(|| format!("failed to write cache file {:?}", path))?;
        Ok(())
    }

    async fn clear(&self, owner_id: &str) -> Result<()> {
        let path = self.path_for(owner_id);
        if path.exists() {
            fs::remove_file(&path)
                .with_context(|| format!("failed to remove cache file {:?}", path))?;
        }
        Ok(())
    }
}

/// Where a loaded record came from, so the session knows whether to mirror it
/// back into the primary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadSource {
    Primary,
    Fallback,
}

/// Apply the load policy across both stores for `owner_id`.
pub async fn load_with_fallback(
    primary: &dyn SnapshotStore,
    fallback: &dyn SnapshotStore,
    owner_id: &str,
) -> Result<Option<(StoredPhone, LoadSource)>> {
    if let Some(record) = primary.load(owner_id).await? {
        if record.owner_id == owner_id {
            tracing::debug!(owner = owner_id, "loaded phone data from primary store");
            return Ok(Some((record, LoadSource::Primary)));
        }
        tracing::warn!(
            expected = owner_id,
            found = %record.owner_id,
            "primary store owner mismatch, ignoring cached data"
        );
    }

    if let Some(record) = fallback.load(owner_id).await? {
        if record.owner_id == owner_id {
            tracing::info!(owner = owner_id, "restored phone data from fallback cache");
            return Ok(Some((record, LoadSource::Fallback)));
        }
        tracing::warn!(
            expected = owner_id,
            found = %record.owner_id,
            "fallback cache owner mismatch, ignoring cached data"
        );
    }

    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record_for(owner: &str) -> StoredPhone {
        let phone = PhoneData::empty(owner, Utc::now());
        let mut history = VersionHistory::new();
        history.record(&phone);
        StoredPhone {
            owner_id: owner.to_string(),
            phone,
            history,
            saved_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn file_cache_round_trips() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = FileCacheStore::new(dir.path(), "character_phone");

        store.save(&record_for("char-1")).await.expect("save");
        let loaded = store.load("char-1").await.expect("load").expect("record");
        assert_eq!(loaded.owner_id, "char-1");
        assert_eq!(loaded.history.len(), 1);

        store.clear("char-1").await.expect("clear");
        assert!(store.load("char-1").await.expect("load").is_none());
    }

    #[tokio::test]
    async fn corrupt_cache_file_is_treated_as_absent() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = FileCacheStore::new(dir.path(), "character_phone");
        fs::write(dir.path().join("character_phone_char-1.json"), "not json").expect("write");

        assert!(store.load("char-1").await.expect("load").is_none());
    }

    #[tokio::test]
    async fn load_prefers_primary_over_fallback() {
        let primary = MetadataStore::new();
        let fallback = MetadataStore::new();
        let mut primary_record = record_for("char-1");
        primary_record.phone.wallet.balance = 10.0;
        let mut fallback_record = record_for("char-1");
        fallback_record.phone.wallet.balance = 20.0;
        primary.save(&primary_record).await.expect("save");
        fallback.save(&fallback_record).await.expect("save");

        let (record, source) = load_with_fallback(&primary, &fallback, "char-1")
            .await
            .expect("load")
            .expect("record");
        assert_eq!(source, LoadSource::Primary);
        assert!((record.phone.wallet.balance - 10.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn owner_mismatch_falls_through() {
        let fallback = MetadataStore::new();

        // A record filed under the right key but carrying the wrong owner id,
        // as happens when the host reuses a chat across characters.
        let stale = record_for("char-OLD");
        let mut records = HashMap::new();
        records.insert("char-1".to_string(), stale);
        let primary = MetadataStore {
            records: Mutex::new(records),
        };

        fallback.save(&record_for("char-1")).await.expect("save");

        let (record, source) = load_with_fallback(&primary, &fallback, "char-1")
            .await
            .expect("load")
            .expect("record");
        assert_eq!(source, LoadSource::Fallback);
        assert_eq!(record.owner_id, "char-1");
    }
}
