// =============================================================================
// Snapshot Cache — last-known-good feed document on disk
// =============================================================================
//
// Written after every successful poll and read only when a poll fails before
// the board was ever populated. Snapshots older than the configured maximum
// age are ignored so that a long outage never resurrects stale signals.
// =============================================================================

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::feed::record::FeedDocument;
use crate::runtime_config::write_atomic;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CachedSnapshot {
    fetched_at: DateTime<Utc>,
    document: FeedDocument,
}

/// File-backed store for the most recent good feed document.
#[derive(Debug, Clone)]
pub struct SnapshotCache {
    path: PathBuf,
}

impl SnapshotCache {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Persist `document` as fetched at `fetched_at`.
    pub fn store(&self, document: &FeedDocument, fetched_at: DateTime<Utc>) -> Result<()> {
        let snapshot = CachedSnapshot {
            fetched_at,
            document: document.clone(),
        };
        let content =
            serde_json::to_string(&snapshot).context("failed to serialise feed snapshot")?;
        write_atomic(&self.path, &content)?;
        debug!(path = %self.path.display(), "feed snapshot cached");
        Ok(())
    }

    /// Load the cached document if it exists and is no older than `max_age`
    /// at `now`. `max_age == None` accepts any age.
    pub fn load_fresh(
        &self,
        now: DateTime<Utc>,
        max_age: Option<Duration>,
    ) -> Result<Option<(FeedDocument, DateTime<Utc>)>> {
        if !self.path.exists() {
            return Ok(None);
        }

        let content = std::fs::read_to_string(&self.path)
            .with_context(|| format!("failed to read {}", self.path.display()))?;
        let snapshot: CachedSnapshot = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse {}", self.path.display()))?;

        let age = now - snapshot.fetched_at;
        if let Some(limit) = max_age {
            if age > limit {
                info!(
                    age_secs = age.num_seconds(),
                    limit_secs = limit.num_seconds(),
                    "cached feed snapshot too old — ignored"
                );
                return Ok(None);
            }
        }

        Ok(Some((snapshot.document, snapshot.fetched_at)))
    }
}
