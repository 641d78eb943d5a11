// =============================================================================
// Central Application State — Signal Deck
// =============================================================================
//
// Ties the subsystems together for the API and the background loops:
// configuration, the display coordinator, the feedback collector, the
// generation gate and the shutdown channel.
//
// Thread safety:
//   - Atomic counter for lock-free version tracking.
//   - parking_lot::RwLock for shared collections.
//   - Arc wrappers for subsystems that manage their own interior mutability.
// =============================================================================

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::{watch, Notify};

use crate::clock::Clock;
use crate::coordinator::{BoardSnapshot, CoordinatorSettings, DisplayCoordinator};
use crate::feedback::{FeedbackCollector, FeedbackStats};
use crate::runtime_config::RuntimeConfig;
use crate::trigger::{GateStatus, GenerationGate, RemoteTrigger};

// =============================================================================
// Error Record
// =============================================================================

/// A recorded error event for the dashboard error log.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorRecord {
    pub message: String,
    /// Optional machine-readable code (e.g. HTTP status).
    pub code: Option<String>,
    /// RFC 3339 timestamp.
    pub at: String,
}

// =============================================================================
// AppState
// =============================================================================

/// Maximum number of recent errors to retain.
const MAX_RECENT_ERRORS: usize = 50;

/// Shared state handed to every task as `Arc<AppState>`.
pub struct AppState {
    // ── Version tracking ────────────────────────────────────────────────
    /// Incremented on every state mutation outside the board (errors,
    /// generation). The board carries its own version.
    pub state_version: AtomicU64,

    // ── Configuration ───────────────────────────────────────────────────
    pub runtime_config: Arc<RwLock<RuntimeConfig>>,
    pub config_path: PathBuf,
    /// Bearer token for guarded endpoints; `None` refuses them all.
    pub admin_token: Option<String>,

    // ── Engine ──────────────────────────────────────────────────────────
    pub clock: Arc<dyn Clock>,
    pub coordinator: Arc<DisplayCoordinator>,
    pub feedback: Arc<FeedbackCollector>,

    // ── Remote generation ───────────────────────────────────────────────
    pub generation_gate: Arc<GenerationGate>,
    pub trigger: Option<Arc<RemoteTrigger>>,

    // ── Signalling ──────────────────────────────────────────────────────
    /// Wakes the poll loop for an immediate fetch.
    pub refresh: Arc<Notify>,
    shutdown: watch::Sender<bool>,

    // ── Error Log ───────────────────────────────────────────────────────
    pub recent_errors: RwLock<Vec<ErrorRecord>>,

    // ── Timing ──────────────────────────────────────────────────────────
    pub start_time: std::time::Instant,
}

impl AppState {
    pub fn new(
        config: RuntimeConfig,
        config_path: impl Into<PathBuf>,
        clock: Arc<dyn Clock>,
        feedback: Arc<FeedbackCollector>,
    ) -> Self {
        let coordinator = Arc::new(DisplayCoordinator::new(
            CoordinatorSettings::from_config(&config),
            clock.clone(),
            feedback.clone(),
        ));
        let generation_gate = Arc::new(GenerationGate::new(config.trigger.cooldown()));
        let (shutdown, _) = watch::channel(false);

        Self {
            state_version: AtomicU64::new(1),
            runtime_config: Arc::new(RwLock::new(config)),
            config_path: config_path.into(),
            admin_token: None,
            clock,
            coordinator,
            feedback,
            generation_gate,
            trigger: None,
            refresh: Arc::new(Notify::new()),
            shutdown,
            recent_errors: RwLock::new(Vec::new()),
            start_time: std::time::Instant::now(),
        }
    }

    pub fn with_admin_token(mut self, token: Option<String>) -> Self {
        self.admin_token = token.filter(|t| !t.is_empty());
        self
    }

    pub fn with_trigger(mut self, trigger: RemoteTrigger) -> Self {
        self.trigger = Some(Arc::new(trigger));
        self
    }

    // ── Version Management ──────────────────────────────────────────────

    pub fn increment_version(&self) -> u64 {
        self.state_version.fetch_add(1, Ordering::SeqCst)
    }

    pub fn current_state_version(&self) -> u64 {
        self.state_version.load(Ordering::SeqCst)
    }

    // ── Signalling ──────────────────────────────────────────────────────

    pub fn request_refresh(&self) {
        self.refresh.notify_one();
    }

    pub fn subscribe_shutdown(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    pub fn trigger_shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    // ── Error Logging ───────────────────────────────────────────────────

    /// Record an error message. The ring buffer is capped at
    /// [`MAX_RECENT_ERRORS`]; oldest entries are evicted first.
    pub fn push_error(&self, msg: String) {
        self.push_error_with_code(msg, None);
    }

    pub fn push_error_with_code(&self, msg: String, code: Option<String>) {
        let record = ErrorRecord {
            message: msg,
            code,
            at: self.clock.now().to_rfc3339(),
        };

        let mut errors = self.recent_errors.write();
        errors.push(record);
        while errors.len() > MAX_RECENT_ERRORS {
            errors.remove(0);
        }
        drop(errors);

        self.increment_version();
    }

    // ── Snapshot Builder ────────────────────────────────────────────────

    /// Everything `GET /api/v1/signals` returns.
    pub fn build_snapshot(&self) -> DeckSnapshot {
        let now = self.clock.now();
        DeckSnapshot {
            state_version: self.current_state_version(),
            uptime_secs: self.start_time.elapsed().as_secs(),
            board: self.coordinator.board(),
            feedback: self.feedback.stats(),
            generation: self.generation_gate.status(now),
            trigger_configured: self.trigger.is_some(),
            recent_errors: self.recent_errors.read().clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DeckSnapshot {
    pub state_version: u64,
    pub uptime_secs: u64,
    pub board: BoardSnapshot,
    /// Illustrative only; verdicts are never checked against real outcomes.
    pub feedback: FeedbackStats,
    pub generation: GateStatus,
    pub trigger_configured: bool,
    pub recent_errors: Vec<ErrorRecord>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::types::Verdict;
    use chrono::{TimeZone, Utc};

    fn state() -> AppState {
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2024, 5, 1, 8, 0, 0).unwrap()));
        AppState::new(
            RuntimeConfig::default(),
            "runtime_config.json",
            clock,
            Arc::new(FeedbackCollector::new(10, Verdict::Unset)),
        )
    }

    #[test]
    fn error_ring_is_bounded() {
        let s = state();
        for i in 0..(MAX_RECENT_ERRORS + 7) {
            s.push_error(format!("e{i}"));
        }
        let errors = s.recent_errors.read();
        assert_eq!(errors.len(), MAX_RECENT_ERRORS);
        assert_eq!(errors[0].message, "e7");
    }

    #[test]
    fn errors_bump_version() {
        let s = state();
        let before = s.current_state_version();
        s.push_error("boom".into());
        assert!(s.current_state_version() > before);
    }

    #[test]
    fn empty_admin_token_counts_as_unset() {
        let s = state().with_admin_token(Some(String::new()));
        assert!(s.admin_token.is_none());
    }

    #[test]
    fn shutdown_reaches_subscribers() {
        let s = state();
        let rx = s.subscribe_shutdown();
        assert!(!*rx.borrow());
        s.trigger_shutdown();
        assert!(*rx.borrow());
    }

    #[test]
    fn snapshot_starts_empty() {
        let snap = state().build_snapshot();
        assert!(snap.board.signals.is_empty());
        assert_eq!(snap.feedback.total, 0);
        assert!(!snap.generation.running);
        assert!(!snap.trigger_configured);
    }
}
