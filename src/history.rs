//! Bounded version ledger for phone snapshots.
//!
//! Every successful save records a deep copy of the snapshot under a strictly
//! increasing version number. The ledger keeps only the most recent
//! [`MAX_VERSIONS`] entries; eviction never renumbers or reuses versions.
//! Restoring is additive: a restored snapshot is saved as a *new* version
//! rather than rewinding the ledger.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::PhoneError;
use crate::phone::PhoneData;

pub const MAX_VERSIONS: usize = 10;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VersionEntry {
    pub version: u64,
    pub timestamp: DateTime<Utc>,
    pub snapshot: PhoneData,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VersionHistory {
    entries: VecDeque<VersionEntry>,
}

impl VersionHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a deep copy of `snapshot` and return its version number.
    pub fn record(&mut self, snapshot: &PhoneData) -> u64 {
        let version = self.latest_version() + 1;
        self.entries.push_back(VersionEntry {
            version,
            timestamp: Utc::now(),
            snapshot: snapshot.clone(),
        });
        while self.entries.len() > MAX_VERSIONS {
            let evicted = self.entries.pop_front();
            if let Some(entry) = evicted {
                tracing::debug!(version = entry.version, "evicted oldest snapshot version");
            }
        }
        version
    }

    /// Entries oldest first.
    pub fn entries(&self) -> impl Iterator<Item = &VersionEntry> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn latest_version(&self) -> u64 {
        self.entries.back().map_or(0, |e| e.version)
    }

    /// Fresh deep copy of the snapshot at `index` (0 = oldest retained).
    /// The caller must persist it as a new save, which appends a new version.
    pub fn restore(&self, index: usize) -> Result<PhoneData, PhoneError> {
        match self.entries.get(index) {
            Some(entry) => {
                tracing::info!(version = entry.version, "restored snapshot version");
                Ok(entry.snapshot.clone())
            }
            None => Err(PhoneError::OutOfRange {
                index,
                len: self.entries.len(),
            }),
        }
    }
}
