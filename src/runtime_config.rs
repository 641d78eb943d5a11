// =============================================================================
// Runtime Configuration — signal deck settings with atomic save
// =============================================================================
//
// Every tunable of the deck lives here: feed location, polling cadence,
// selection limits, feedback window, and the remote trigger. The object is
// built once in `main` and handed to the components that need it; nothing
// reads configuration from globals.
//
// All fields carry `#[serde(default)]` so that adding new fields never breaks
// loading an older config file. Persistence uses an atomic tmp + rename.
// =============================================================================

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Duration;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::clock::{DisplayZone, DEFAULT_DISPLAY_OFFSET_SECS};
use crate::selection::SelectionPolicy;
use crate::types::Verdict;

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_feed_url() -> String {
    "http://127.0.0.1:8000/data/signals.json".to_string()
}

fn default_poll_interval_secs() -> u64 {
    30
}

fn default_tick_interval_ms() -> u64 {
    1000
}

fn default_confidence_threshold() -> f64 {
    0.70
}

fn default_max_displayed() -> usize {
    6
}

fn default_max_age_secs() -> Option<u64> {
    Some(600)
}

fn default_feedback_window_secs() -> u64 {
    60
}

fn default_history_capacity() -> usize {
    100
}

fn default_display_offset_secs() -> i32 {
    DEFAULT_DISPLAY_OFFSET_SECS
}

fn default_duration_minutes() -> u32 {
    2
}

fn default_snapshot_cache_path() -> PathBuf {
    PathBuf::from("data/last_feed.json")
}

fn default_feedback_store_path() -> PathBuf {
    PathBuf::from("data/feedback.json")
}

fn default_bind_addr() -> String {
    "0.0.0.0:3001".to_string()
}

fn default_git_ref() -> String {
    "main".to_string()
}

fn default_cooldown_secs() -> u64 {
    300
}

fn default_settle_delay_secs() -> u64 {
    30
}

fn default_run_poll_interval_secs() -> u64 {
    15
}

fn default_max_wait_secs() -> u64 {
    300
}

// =============================================================================
// TriggerSettings
// =============================================================================

/// Where and how often the remote signal generation workflow may be started.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerSettings {
    /// Repository owner. Empty disables the trigger.
    #[serde(default)]
    pub owner: String,

    #[serde(default)]
    pub repo: String,

    /// Workflow file name or numeric id, e.g. `generate.yml`.
    #[serde(default)]
    pub workflow: String,

    #[serde(default = "default_git_ref")]
    pub git_ref: String,

    /// Minimum spacing between two dispatches.
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: u64,

    /// Pause after dispatching before the first run-status query.
    #[serde(default = "default_settle_delay_secs")]
    pub settle_delay_secs: u64,

    #[serde(default = "default_run_poll_interval_secs")]
    pub poll_interval_secs: u64,

    /// Give up waiting for the run after this long.
    #[serde(default = "default_max_wait_secs")]
    pub max_wait_secs: u64,
}

impl TriggerSettings {
    pub fn is_configured(&self) -> bool {
        !self.owner.is_empty() && !self.repo.is_empty() && !self.workflow.is_empty()
    }

    pub fn cooldown(&self) -> Duration {
        Duration::seconds(self.cooldown_secs as i64)
    }
}

impl Default for TriggerSettings {
    fn default() -> Self {
        Self {
            owner: String::new(),
            repo: String::new(),
            workflow: String::new(),
            git_ref: default_git_ref(),
            cooldown_secs: default_cooldown_secs(),
            settle_delay_secs: default_settle_delay_secs(),
            poll_interval_secs: default_run_poll_interval_secs(),
            max_wait_secs: default_max_wait_secs(),
        }
    }
}

// =============================================================================
// RuntimeConfig
// =============================================================================

/// Top-level configuration for the signal deck.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    // --- Feed ---------------------------------------------------------------

    /// URL of the signals JSON document.
    #[serde(default = "default_feed_url")]
    pub feed_url: String,

    /// Seconds between two feed polls.
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,

    /// Lifecycle tick cadence in milliseconds.
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,

    // --- Selection ----------------------------------------------------------

    /// Records below this confidence are never displayed.
    #[serde(default = "default_confidence_threshold")]
    pub confidence_threshold: f64,

    #[serde(default = "default_max_displayed")]
    pub max_displayed: usize,

    /// Maximum age of a record by `generated_at`. `null` disables the limit.
    #[serde(default = "default_max_age_secs")]
    pub max_age_secs: Option<u64>,

    // --- Lifecycle / feedback ----------------------------------------------

    /// Grace period after expiry during which a verdict is accepted.
    #[serde(default = "default_feedback_window_secs")]
    pub feedback_window_secs: u64,

    /// Verdict recorded when the feedback window lapses without user action.
    #[serde(default)]
    pub timeout_verdict: Verdict,

    /// Trade history entries kept (oldest evicted first).
    #[serde(default = "default_history_capacity")]
    pub history_capacity: usize,

    /// Display zone offset in seconds east of UTC.
    #[serde(default = "default_display_offset_secs")]
    pub display_utc_offset_secs: i32,

    /// Trade length assumed for records without a `duration`.
    #[serde(default = "default_duration_minutes")]
    pub default_duration_minutes: u32,

    // --- Storage ------------------------------------------------------------

    #[serde(default = "default_snapshot_cache_path")]
    pub snapshot_cache_path: PathBuf,

    #[serde(default = "default_feedback_store_path")]
    pub feedback_store_path: PathBuf,

    // --- Surfaces -----------------------------------------------------------

    #[serde(default)]
    pub trigger: TriggerSettings,

    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            feed_url: default_feed_url(),
            poll_interval_secs: default_poll_interval_secs(),
            tick_interval_ms: default_tick_interval_ms(),
            confidence_threshold: default_confidence_threshold(),
            max_displayed: default_max_displayed(),
            max_age_secs: default_max_age_secs(),
            feedback_window_secs: default_feedback_window_secs(),
            timeout_verdict: Verdict::Unset,
            history_capacity: default_history_capacity(),
            display_utc_offset_secs: default_display_offset_secs(),
            default_duration_minutes: default_duration_minutes(),
            snapshot_cache_path: default_snapshot_cache_path(),
            feedback_store_path: default_feedback_store_path(),
            trigger: TriggerSettings::default(),
            bind_addr: default_bind_addr(),
        }
    }
}

impl RuntimeConfig {
    /// Load configuration from a JSON file at `path`.
    ///
    /// If the file does not exist, returns an error so the caller can fall
    /// back to defaults with a warning.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read runtime config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse runtime config from {}", path.display()))?;

        info!(
            path = %path.display(),
            feed_url = %config.feed_url,
            poll_interval_secs = config.poll_interval_secs,
            "runtime config loaded"
        );

        Ok(config)
    }

    /// Persist the current configuration to `path` using an atomic write
    /// (write to `.tmp`, then rename).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let content = serde_json::to_string_pretty(self)
            .context("failed to serialise runtime config to JSON")?;
        write_atomic(path.as_ref(), &content)?;
        info!(path = %path.as_ref().display(), "runtime config saved (atomic)");
        Ok(())
    }

    pub fn selection_policy(&self) -> SelectionPolicy {
        SelectionPolicy {
            confidence_threshold: self.confidence_threshold,
            max_displayed: self.max_displayed,
            max_age: self.max_age(),
        }
    }

    pub fn max_age(&self) -> Option<Duration> {
        self.max_age_secs.map(|s| Duration::seconds(s as i64))
    }

    pub fn feedback_window(&self) -> Duration {
        Duration::seconds(self.feedback_window_secs as i64)
    }

    pub fn display_zone(&self) -> DisplayZone {
        DisplayZone::from_offset_secs(self.display_utc_offset_secs)
    }
}

/// Write `content` to `path` through a temporary sibling and a rename, so a
/// crash never leaves a half-written file behind.
pub fn write_atomic(path: &Path, content: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
    }

    let mut tmp_name = path.as_os_str().to_owned();
    tmp_name.push(".tmp");
    let tmp_path = PathBuf::from(tmp_name);

    std::fs::write(&tmp_path, content)
        .with_context(|| format!("failed to write {}", tmp_path.display()))?;

    std::fs::rename(&tmp_path, path)
        .with_context(|| format!("failed to rename {} to {}", tmp_path.display(), path.display()))?;

    Ok(())
}
