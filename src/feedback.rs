// =============================================================================
// Feedback Collector — terminal verdicts and the local trade history
// =============================================================================
//
// One verdict per signal: the first one recorded wins, later calls are
// no-ops. Every verdict appends to a bounded FIFO history that is persisted
// to disk after each write and reloaded on startup.
//
// Each append bumps a revision under the history lock and hands a snapshot
// to the store. Inside a tokio runtime the write runs on the blocking pool.
// The store serialises writers and drops any snapshot older than the one
// already on disk, so concurrent retirements cannot roll the file back.
//
// The success rate derived from the history is ILLUSTRATIVE ONLY. Verdicts
// are whatever the user clicked; nothing checks them against real trade
// outcomes.
// =============================================================================

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::feed::{SignalKey, SignalRecord};
use crate::runtime_config::write_atomic;
use crate::types::{Direction, Phase, Verdict};

// =============================================================================
// Errors
// =============================================================================

#[derive(Error, Debug, Clone, PartialEq)]
pub enum FeedbackError {
    #[error("no live signal `{0}`")]
    UnknownSignal(String),

    #[error("feedback for `{key}` is not open (phase {phase})")]
    NotOpen { key: String, phase: Phase },

    #[error("feedback for `{0}` already recorded")]
    AlreadyRecorded(String),

    #[error("`Unset` cannot be submitted by a user")]
    UnsetVerdict,
}

// =============================================================================
// History
// =============================================================================

/// One finalised signal in the local trade history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub id: String,
    pub key: SignalKey,
    pub asset: String,
    pub direction: Direction,
    pub confidence: f64,
    pub verdict: Verdict,
    /// True when the verdict came from the timeout default, not the user.
    pub automatic: bool,
    pub recorded_at: DateTime<Utc>,
}

/// Aggregates over the history. `success_rate` is correct / (correct +
/// incorrect) and is `None` until at least one judged entry exists.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FeedbackStats {
    pub total: usize,
    pub correct: usize,
    pub incorrect: usize,
    pub skipped: usize,
    pub unset: usize,
    pub success_rate: Option<f64>,
}

// =============================================================================
// Collector
// =============================================================================

pub struct FeedbackCollector {
    history: RwLock<VecDeque<HistoryEntry>>,
    /// Bumped on every append, always while the history write lock is held.
    revision: AtomicU64,
    capacity: usize,
    timeout_verdict: Verdict,
    store: Option<Arc<HistoryStore>>,
}

impl FeedbackCollector {
    /// In-memory collector.
    pub fn new(capacity: usize, timeout_verdict: Verdict) -> Self {
        Self {
            history: RwLock::new(VecDeque::with_capacity(capacity)),
            revision: AtomicU64::new(0),
            capacity: capacity.max(1),
            timeout_verdict,
            store: None,
        }
    }

    /// Collector backed by a JSON file. An existing file is loaded; a missing
    /// one starts an empty history.
    pub fn with_store(
        capacity: usize,
        timeout_verdict: Verdict,
        path: impl Into<PathBuf>,
    ) -> Result<Self> {
        let path = path.into();
        let mut collector = Self::new(capacity, timeout_verdict);

        if path.exists() {
            let entries = load_history(&path)?;
            let mut history = collector.history.write();
            for entry in entries {
                history.push_back(entry);
            }
            while history.len() > collector.capacity {
                history.pop_front();
            }
            info!(path = %path.display(), entries = history.len(), "feedback history loaded");
        }

        collector.store = Some(Arc::new(HistoryStore::new(path)));
        Ok(collector)
    }

    pub fn timeout_verdict(&self) -> Verdict {
        self.timeout_verdict
    }

    /// Record `verdict` for `signal`. Returns `false` (and changes nothing) if
    /// the signal already has a verdict.
    pub fn record(&self, signal: &SignalRecord, verdict: Verdict, at: DateTime<Utc>) -> bool {
        self.append(signal, verdict, false, at)
    }

    /// Record the configured default for a signal whose feedback window
    /// lapsed.
    pub fn record_timeout(&self, signal: &SignalRecord, at: DateTime<Utc>) -> bool {
        self.append(signal, self.timeout_verdict, true, at)
    }

    pub fn verdict_for(&self, key: &SignalKey) -> Option<Verdict> {
        self.history
            .read()
            .iter()
            .find(|e| &e.key == key)
            .map(|e| e.verdict)
    }

    /// Most recent `count` entries, newest first.
    pub fn history(&self, count: usize) -> Vec<HistoryEntry> {
        self.history.read().iter().rev().take(count).cloned().collect()
    }

    pub fn stats(&self) -> FeedbackStats {
        let history = self.history.read();
        let mut stats = FeedbackStats {
            total: history.len(),
            ..FeedbackStats::default()
        };
        for entry in history.iter() {
            match entry.verdict {
                Verdict::Correct => stats.correct += 1,
                Verdict::Incorrect => stats.incorrect += 1,
                Verdict::Skipped => stats.skipped += 1,
                Verdict::Unset => stats.unset += 1,
            }
        }
        let judged = stats.correct + stats.incorrect;
        if judged > 0 {
            stats.success_rate = Some(stats.correct as f64 / judged as f64);
        }
        stats
    }

    /// Write the current history to the backing file, if any. Blocks; meant
    /// for shutdown.
    pub fn persist(&self) -> Result<()> {
        let Some(store) = &self.store else {
            return Ok(());
        };
        let (revision, entries) = {
            let history = self.history.read();
            (
                self.revision.load(Ordering::SeqCst),
                history.iter().cloned().collect::<Vec<_>>(),
            )
        };
        store.write(revision, &entries).map(|_| ())
    }

    fn append(&self, signal: &SignalRecord, verdict: Verdict, automatic: bool, at: DateTime<Utc>) -> bool {
        let pending = {
            let mut history = self.history.write();
            if history.iter().any(|e| e.key == signal.key) {
                return false;
            }

            history.push_back(HistoryEntry {
                id: Uuid::new_v4().to_string(),
                key: signal.key.clone(),
                asset: signal.asset.clone(),
                direction: signal.direction,
                confidence: signal.confidence,
                verdict,
                automatic,
                recorded_at: at,
            });
            while history.len() > self.capacity {
                history.pop_front();
            }

            let revision = self.revision.fetch_add(1, Ordering::SeqCst) + 1;
            self.store
                .as_ref()
                .map(|store| (store.clone(), revision, history.iter().cloned().collect::<Vec<_>>()))
        };

        info!(
            key = %signal.key,
            asset = %signal.asset,
            verdict = %verdict,
            automatic,
            "signal feedback recorded"
        );

        if let Some((store, revision, entries)) = pending {
            write_behind(store, revision, entries);
        }
        true
    }
}

impl std::fmt::Debug for FeedbackCollector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FeedbackCollector")
            .field("entries", &self.history.read().len())
            .field("capacity", &self.capacity)
            .field("timeout_verdict", &self.timeout_verdict)
            .finish()
    }
}

// =============================================================================
// Store
// =============================================================================

/// The history file. Writes are serialised; a snapshot whose revision is not
/// newer than the last one written is discarded.
struct HistoryStore {
    path: PathBuf,
    written: Mutex<u64>,
}

impl HistoryStore {
    fn new(path: PathBuf) -> Self {
        Self {
            path,
            written: Mutex::new(0),
        }
    }

    /// Returns whether the file was written.
    fn write(&self, revision: u64, entries: &[HistoryEntry]) -> Result<bool> {
        let mut written = self.written.lock();
        if revision <= *written {
            debug!(revision, written = *written, "stale feedback snapshot skipped");
            return Ok(false);
        }
        let content =
            serde_json::to_string_pretty(entries).context("failed to serialise feedback history")?;
        write_atomic(&self.path, &content)?;
        *written = revision;
        Ok(true)
    }
}

/// Persist off the async workers when a runtime is available.
fn write_behind(store: Arc<HistoryStore>, revision: u64, entries: Vec<HistoryEntry>) {
    let save = move || {
        if let Err(e) = store.write(revision, &entries) {
            warn!(error = %e, "failed to persist feedback history");
        }
    };
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn_blocking(save);
        }
        Err(_) => save(),
    }
}

fn load_history(path: &Path) -> Result<Vec<HistoryEntry>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read feedback history from {}", path.display()))?;
    serde_json::from_str(&content)
        .with_context(|| format!("failed to parse feedback history from {}", path.display()))
}
