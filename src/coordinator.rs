// =============================================================================
// Display Coordinator — reconciliation, ticker tasks and retirement
// =============================================================================
//
// Owns every live `SignalLifecycle`. On each successful poll the newly
// selected records are diffed against the live set by `SignalKey`:
//
//   new key                 -> lifecycle created, ticker task spawned
//   key already live        -> left untouched (running timer preserved)
//   live key not selected   -> retired; if its trade had concluded the
//                              timeout verdict is recorded, otherwise it is
//                              discarded silently
//   tombstoned key          -> skipped until it leaves the selection
//   key with a stored verdict -> tombstoned and skipped (survives restarts)
//
// Each lifecycle ticks on its own tokio task. The `JoinHandle` lives next to
// the lifecycle and is aborted when the entry is dropped, so retirement,
// shutdown and coordinator drop all cancel the ticker.
//
// Lock order: board -> lifecycle. The board lock is never taken while a
// lifecycle mutex is held.
// =============================================================================

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Duration, FixedOffset, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::app_state::AppState;
use crate::clock::{Clock, DisplayZone};
use crate::feed::record::Reason;
use crate::feed::{ingest, FeedClient, FeedDocument, IngestOptions, SignalKey, SignalRecord, SnapshotCache};
use crate::feedback::{FeedbackCollector, FeedbackError};
use crate::lifecycle::SignalLifecycle;
use crate::runtime_config::RuntimeConfig;
use crate::selection::SelectionPolicy;
use crate::types::{Direction, Phase, RetireReason, Verdict};

/// Lower bound for the tick cadence; anything faster only burns CPU.
const MIN_TICK_INTERVAL_MS: u64 = 10;

// =============================================================================
// Settings
// =============================================================================

#[derive(Debug, Clone, Copy)]
pub struct CoordinatorSettings {
    pub policy: SelectionPolicy,
    pub ingest: IngestOptions,
    pub feedback_window: Duration,
    pub tick_interval: std::time::Duration,
}

impl CoordinatorSettings {
    pub fn from_config(config: &RuntimeConfig) -> Self {
        Self {
            policy: config.selection_policy(),
            ingest: IngestOptions {
                zone: config.display_zone(),
                default_duration_minutes: f64::from(config.default_duration_minutes),
            },
            feedback_window: config.feedback_window(),
            tick_interval: std::time::Duration::from_millis(
                config.tick_interval_ms.max(MIN_TICK_INTERVAL_MS),
            ),
        }
    }

    pub fn zone(&self) -> DisplayZone {
        self.ingest.zone
    }
}

// =============================================================================
// Reports & snapshots
// =============================================================================

/// What one reconciliation changed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    pub created: Vec<SignalKey>,
    pub kept: Vec<SignalKey>,
    pub retired: Vec<SignalKey>,
    /// Retired records whose trade had concluded; the timeout verdict was
    /// recorded for them.
    pub finalized: usize,
    /// Selected records skipped because they were already retired.
    pub suppressed: usize,
}

impl ReconcileReport {
    fn changed(&self) -> bool {
        !self.created.is_empty() || !self.retired.is_empty()
    }
}

/// Where the last applied document came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum FeedSource {
    Live,
    /// Last-known-good snapshot, fetched at the given instant.
    Cache { fetched_at: DateTime<Utc> },
}

/// Outcome of recent polls, shown on the board.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PollStatus {
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub last_success_at: Option<DateTime<Utc>>,
    pub source: Option<FeedSource>,
    /// Producer's own `last_update`.
    pub feed_updated_at: Option<DateTime<Utc>>,
    pub records_in_feed: usize,
    pub rejected: usize,
    pub selected: usize,
    pub consecutive_failures: u32,
    pub last_error: Option<String>,
}

/// One card on the board.
#[derive(Debug, Clone, Serialize)]
pub struct BoardEntry {
    pub key: SignalKey,
    pub asset: String,
    pub direction: Direction,
    pub confidence: f64,
    pub generated_at: Option<DateTime<FixedOffset>>,
    pub entry_at: Option<DateTime<FixedOffset>>,
    pub expiry_at: Option<DateTime<FixedOffset>>,
    pub phase: Phase,
    pub time_remaining_secs: u64,
    pub display_text: String,
    pub reason: Option<Reason>,
    /// English rationale, or whatever language the feed supplied.
    pub reason_text: Option<String>,
}

impl BoardEntry {
    fn build(lifecycle: &SignalLifecycle, now: DateTime<Utc>, zone: DisplayZone) -> Self {
        let record = lifecycle.record();
        let view = lifecycle.view(now);
        Self {
            key: record.key.clone(),
            asset: record.asset.clone(),
            direction: record.direction,
            confidence: record.confidence,
            generated_at: record.generated_at.map(|t| zone.to_display(t)),
            entry_at: record.entry_at.map(|t| zone.to_display(t)),
            expiry_at: lifecycle.expiry_at().map(|t| zone.to_display(t)),
            phase: view.phase,
            time_remaining_secs: view.time_remaining_secs,
            display_text: view.display_text,
            reason: record.reason.clone(),
            reason_text: record
                .reason
                .as_ref()
                .and_then(|r| r.text_for("en"))
                .map(str::to_string),
        }
    }
}

/// Everything the dashboard needs to draw the deck.
#[derive(Debug, Clone, Serialize)]
pub struct BoardSnapshot {
    pub now: DateTime<FixedOffset>,
    pub version: u64,
    pub signals: Vec<BoardEntry>,
    pub poll: PollStatus,
}

// =============================================================================
// Live state
// =============================================================================

struct LiveSignal {
    lifecycle: Arc<Mutex<SignalLifecycle>>,
    ticker: Option<JoinHandle<()>>,
}

impl LiveSignal {
    fn new(lifecycle: SignalLifecycle) -> Self {
        Self {
            lifecycle: Arc::new(Mutex::new(lifecycle)),
            ticker: None,
        }
    }
}

impl Drop for LiveSignal {
    fn drop(&mut self) {
        if let Some(handle) = self.ticker.take() {
            handle.abort();
        }
    }
}

#[derive(Default)]
struct Board {
    /// Display order, newest first as selected.
    order: Vec<SignalKey>,
    live: HashMap<SignalKey, LiveSignal>,
    /// Retired keys still present in the feed.
    tombstones: HashSet<SignalKey>,
}

// =============================================================================
// DisplayCoordinator
// =============================================================================

pub struct DisplayCoordinator {
    settings: CoordinatorSettings,
    clock: Arc<dyn Clock>,
    collector: Arc<FeedbackCollector>,
    board: RwLock<Board>,
    status: RwLock<PollStatus>,
    populated: AtomicBool,
    version: AtomicU64,
}

impl DisplayCoordinator {
    pub fn new(
        settings: CoordinatorSettings,
        clock: Arc<dyn Clock>,
        collector: Arc<FeedbackCollector>,
    ) -> Self {
        info!(
            clock = clock.name(),
            feedback_window_secs = settings.feedback_window.num_seconds(),
            tick_ms = settings.tick_interval.as_millis() as u64,
            "DisplayCoordinator initialised"
        );
        Self {
            settings,
            clock,
            collector,
            board: RwLock::new(Board::default()),
            status: RwLock::new(PollStatus::default()),
            populated: AtomicBool::new(false),
            version: AtomicU64::new(1),
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub fn settings(&self) -> &CoordinatorSettings {
        &self.settings
    }

    /// Bumped on every visible board change.
    pub fn version(&self) -> u64 {
        self.version.load(Ordering::SeqCst)
    }

    /// Whether any document (live or cached) has been applied yet.
    pub fn is_populated(&self) -> bool {
        self.populated.load(Ordering::SeqCst)
    }

    pub fn live_count(&self) -> usize {
        self.board.read().live.len()
    }

    /// Ticker tasks that are still running.
    #[cfg(test)]
    pub fn running_tickers(&self) -> usize {
        self.board
            .read()
            .live
            .values()
            .filter(|l| l.ticker.as_ref().is_some_and(|h| !h.is_finished()))
            .count()
    }

    pub fn poll_status(&self) -> PollStatus {
        self.status.read().clone()
    }

    fn bump(&self) {
        self.version.fetch_add(1, Ordering::SeqCst);
    }

    fn lifecycle(&self, key: &SignalKey) -> Option<Arc<Mutex<SignalLifecycle>>> {
        self.board.read().live.get(key).map(|l| l.lifecycle.clone())
    }

    // ── Feed application ────────────────────────────────────────────────

    /// Ingest, select and reconcile one feed document, then start tickers
    /// for the lifecycles it created.
    pub fn apply_document(
        self: &Arc<Self>,
        doc: &FeedDocument,
        source: FeedSource,
        now: DateTime<Utc>,
    ) -> ReconcileReport {
        let ingested = ingest(doc, self.settings.ingest);
        if !ingested.rejected.is_empty() {
            warn!(
                rejected = ingested.rejected.len(),
                first_error = %ingested.rejected[0].1,
                "malformed feed records dropped"
            );
        }

        let selected = self.settings.policy.select(&ingested.records, now);
        let report = self.reconcile(&selected, now);
        self.start_tickers(&report.created);

        {
            let mut status = self.status.write();
            status.last_attempt_at = Some(now);
            if source == FeedSource::Live {
                status.last_success_at = Some(now);
                status.consecutive_failures = 0;
                status.last_error = None;
            }
            status.source = Some(source);
            status.feed_updated_at = doc.last_update_at(self.settings.zone());
            status.records_in_feed = doc.signals.len();
            status.rejected = ingested.rejected.len();
            status.selected = selected.len();
        }
        self.populated.store(true, Ordering::SeqCst);
        self.bump();

        info!(
            source = ?source,
            records = doc.signals.len(),
            rejected = ingested.rejected.len(),
            selected = selected.len(),
            created = report.created.len(),
            kept = report.kept.len(),
            retired = report.retired.len(),
            "feed reconciled"
        );

        report
    }

    /// Note a failed poll. The board itself is left untouched.
    pub fn record_poll_failure(&self, error: &str, now: DateTime<Utc>) {
        let mut status = self.status.write();
        status.last_attempt_at = Some(now);
        status.consecutive_failures = status.consecutive_failures.saturating_add(1);
        status.last_error = Some(error.to_string());
        drop(status);
        self.bump();
    }

    /// Diff `selected` against the live set. Does not spawn tickers.
    pub fn reconcile(&self, selected: &[SignalRecord], now: DateTime<Utc>) -> ReconcileReport {
        let mut report = ReconcileReport::default();
        let selected_keys: HashSet<&SignalKey> = selected.iter().map(|r| &r.key).collect();
        let mut departed: Vec<(SignalKey, LiveSignal)> = Vec::new();

        {
            let mut board = self.board.write();
            board.tombstones.retain(|k| selected_keys.contains(k));

            let gone: Vec<SignalKey> = board
                .live
                .keys()
                .filter(|k| !selected_keys.contains(*k))
                .cloned()
                .collect();
            for key in gone {
                if let Some(live) = board.live.remove(&key) {
                    departed.push((key, live));
                }
            }

            let mut order: Vec<SignalKey> = Vec::with_capacity(selected.len());
            for record in selected {
                if board.tombstones.contains(&record.key) {
                    report.suppressed += 1;
                    continue;
                }
                if order.contains(&record.key) {
                    debug!(key = %record.key, "duplicate key in selection — first occurrence wins");
                    continue;
                }

                if board.live.contains_key(&record.key) {
                    report.kept.push(record.key.clone());
                    order.push(record.key.clone());
                    continue;
                }
                if self.collector.verdict_for(&record.key).is_some() {
                    debug!(key = %record.key, "signal already judged — not displayed");
                    board.tombstones.insert(record.key.clone());
                    report.suppressed += 1;
                    continue;
                }

                let mut lifecycle = SignalLifecycle::new(
                    record.clone(),
                    self.settings.feedback_window,
                    self.settings.zone(),
                );
                let first = lifecycle.tick(now);
                if first.view.phase.is_terminal() {
                    // Observed only after its feedback window closed; the
                    // user never saw it, so nothing is recorded.
                    debug!(key = %record.key, "signal already past its feedback window");
                    board.tombstones.insert(record.key.clone());
                    report.suppressed += 1;
                    continue;
                }

                info!(
                    key = %record.key,
                    asset = %record.asset,
                    direction = %record.direction,
                    confidence = record.confidence,
                    phase = %first.view.phase,
                    "signal displayed"
                );
                board.live.insert(record.key.clone(), LiveSignal::new(lifecycle));
                report.created.push(record.key.clone());
                order.push(record.key.clone());
            }
            board.order = order;
        }

        for (key, live) in departed {
            if self.finish_retirement(&key, live, RetireReason::Deselected, now) {
                report.finalized += 1;
            }
            report.retired.push(key);
        }

        if report.changed() {
            self.bump();
        }
        report
    }

    // ── Ticking ─────────────────────────────────────────────────────────

    fn start_tickers(self: &Arc<Self>, keys: &[SignalKey]) {
        if keys.is_empty() {
            return;
        }
        if tokio::runtime::Handle::try_current().is_err() {
            debug!(count = keys.len(), "no async runtime — tickers not started");
            return;
        }
        for key in keys {
            self.start_ticker(key);
        }
    }

    fn start_ticker(self: &Arc<Self>, key: &SignalKey) {
        let weak = Arc::downgrade(self);
        let period = self.settings.tick_interval;
        let task_key = key.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let Some(coordinator) = weak.upgrade() else {
                    break;
                };
                if !coordinator.tick_key(&task_key) {
                    break;
                }
            }
        });

        let mut board = self.board.write();
        match board.live.get_mut(key) {
            Some(live) => live.ticker = Some(handle),
            None => handle.abort(),
        }
    }

    /// Tick one lifecycle against the clock. Returns `false` once the key is
    /// no longer live.
    fn tick_key(&self, key: &SignalKey) -> bool {
        let Some(lifecycle) = self.lifecycle(key) else {
            return false;
        };
        let now = self.clock.now();
        let outcome = lifecycle.lock().tick(now);

        if outcome.transition.is_some() {
            self.bump();
        }
        if outcome.prompt_feedback {
            info!(
                key = %key,
                window_secs = outcome.view.time_remaining_secs,
                "feedback window open"
            );
        }
        if outcome.view.phase.is_terminal() {
            self.retire(key, RetireReason::Timeout, now);
            return false;
        }
        true
    }

    /// Tick every live lifecycle once. Returns how many were retired.
    #[cfg(test)]
    pub fn tick_all(&self) -> usize {
        let keys: Vec<SignalKey> = self.board.read().order.clone();
        keys.iter().filter(|k| !self.tick_key(k)).count()
    }

    // ── Retirement ──────────────────────────────────────────────────────

    /// Remove `key` from the board. Returns `false` if it was not live.
    pub fn retire(&self, key: &SignalKey, reason: RetireReason, now: DateTime<Utc>) -> bool {
        let removed = {
            let mut board = self.board.write();
            let removed = board.live.remove(key);
            if removed.is_some() {
                board.order.retain(|k| k != key);
                if matches!(reason, RetireReason::Feedback | RetireReason::Timeout) {
                    board.tombstones.insert(key.clone());
                }
            }
            removed
        };

        match removed {
            Some(live) => {
                self.finish_retirement(key, live, reason, now);
                self.bump();
                true
            }
            None => false,
        }
    }

    /// Record the timeout verdict when owed, then drop the entry (which
    /// aborts its ticker). Returns whether a verdict was recorded.
    fn finish_retirement(
        &self,
        key: &SignalKey,
        live: LiveSignal,
        reason: RetireReason,
        now: DateTime<Utc>,
    ) -> bool {
        let (record, verdict, concluded) = {
            let lc = live.lifecycle.lock();
            (lc.record().clone(), lc.verdict(), lc.has_concluded(now))
        };

        let finalized = verdict.is_none()
            && concluded
            && reason != RetireReason::Shutdown
            && self.collector.record_timeout(&record, now);

        info!(
            key = %key,
            asset = %record.asset,
            reason = %reason,
            verdict = ?verdict.or(finalized.then(|| self.collector.timeout_verdict())),
            finalized,
            "signal retired"
        );

        drop(live);
        finalized
    }

    // ── Feedback ────────────────────────────────────────────────────────

    /// Apply a user verdict to a live signal and retire it.
    pub fn submit_feedback(&self, key: &SignalKey, verdict: Verdict) -> Result<(), FeedbackError> {
        let Some(lifecycle) = self.lifecycle(key) else {
            if self.collector.verdict_for(key).is_some() {
                return Err(FeedbackError::AlreadyRecorded(key.to_string()));
            }
            if self.board.read().tombstones.contains(key) {
                return Err(FeedbackError::NotOpen {
                    key: key.to_string(),
                    phase: Phase::Retired,
                });
            }
            return Err(FeedbackError::UnknownSignal(key.to_string()));
        };

        let now = self.clock.now();
        let record = {
            let mut lc = lifecycle.lock();
            lc.submit_feedback(verdict, now)?;
            lc.record().clone()
        };

        let accepted = self.collector.record(&record, verdict, now);
        self.retire(key, RetireReason::Feedback, now);
        if !accepted {
            return Err(FeedbackError::AlreadyRecorded(key.to_string()));
        }
        Ok(())
    }

    // ── Snapshot / shutdown ─────────────────────────────────────────────

    pub fn board(&self) -> BoardSnapshot {
        let now = self.clock.now();
        let zone = self.settings.zone();

        let signals = {
            let board = self.board.read();
            board
                .order
                .iter()
                .filter_map(|k| board.live.get(k))
                .map(|live| BoardEntry::build(&live.lifecycle.lock(), now, zone))
                .collect()
        };

        BoardSnapshot {
            now: zone.to_display(now),
            version: self.version(),
            signals,
            poll: self.poll_status(),
        }
    }

    /// Drop every live lifecycle and cancel its ticker.
    pub fn shutdown(&self) {
        let drained: Vec<(SignalKey, LiveSignal)> = {
            let mut board = self.board.write();
            board.order.clear();
            board.live.drain().collect()
        };
        let count = drained.len();
        drop(drained);
        self.bump();
        info!(count, reason = %RetireReason::Shutdown, "display coordinator stopped — tickers cancelled");
    }
}

impl std::fmt::Debug for DisplayCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DisplayCoordinator")
            .field("live", &self.live_count())
            .field("version", &self.version())
            .finish()
    }
}

// =============================================================================
// Poll loop
// =============================================================================

/// Fetch, select and reconcile on the configured cadence until shutdown.
/// A `refresh` notification on the app state triggers an immediate poll.
pub async fn run_poll_loop(state: Arc<AppState>, client: FeedClient, cache: SnapshotCache) {
    let mut shutdown = state.subscribe_shutdown();
    let poll_secs = state.runtime_config.read().poll_interval_secs.max(1);

    info!(
        url = %client.url(),
        cache = %cache.path().display(),
        interval_secs = poll_secs,
        "Poll loop started"
    );

    let mut ticker = interval(std::time::Duration::from_secs(poll_secs));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = state.refresh.notified() => {
                debug!("feed refresh requested");
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
                continue;
            }
        }

        if *shutdown.borrow() {
            break;
        }
        poll_once(&state, &client, &cache).await;
    }

    state.coordinator.shutdown();
    info!("Poll loop stopped");
}

async fn poll_once(state: &AppState, client: &FeedClient, cache: &SnapshotCache) {
    let coordinator = &state.coordinator;
    let fetched = client.fetch().await;
    let now = coordinator.now();

    match fetched {
        Ok(doc) => {
            if let Err(e) = cache.store(&doc, now) {
                warn!(error = %e, "failed to cache feed snapshot");
            }
            coordinator.apply_document(&doc, FeedSource::Live, now);
        }
        Err(e) => {
            warn!(error = %e, "feed poll failed — display unchanged");
            coordinator.record_poll_failure(&format!("{e:#}"), now);
            state.push_error(format!("feed poll failed: {e:#}"));

            if coordinator.is_populated() {
                return;
            }
            match cache.load_fresh(now, coordinator.settings().policy.max_age) {
                Ok(Some((doc, fetched_at))) => {
                    info!(fetched_at = %fetched_at, "board populated from cached snapshot");
                    coordinator.apply_document(&doc, FeedSource::Cache { fetched_at }, now);
                }
                Ok(None) => debug!("no usable cached snapshot"),
                Err(e) => warn!(error = %e, "failed to read cached snapshot"),
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use chrono::TimeZone;
    use serde_json::json;

    /// 10:00:00 Kyiv == 08:00:00 UTC.
    fn kyiv(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, h - 2, m, s).unwrap()
    }

    fn settings(window_secs: i64) -> CoordinatorSettings {
        CoordinatorSettings {
            policy: SelectionPolicy {
                max_age: None,
                ..SelectionPolicy::default()
            },
            ingest: IngestOptions::default(),
            feedback_window: Duration::seconds(window_secs),
            tick_interval: std::time::Duration::from_millis(10),
        }
    }

    fn setup(window_secs: i64, timeout: Verdict) -> (Arc<DisplayCoordinator>, ManualClock, Arc<FeedbackCollector>) {
        let clock = ManualClock::new(kyiv(10, 0, 10));
        let collector = Arc::new(FeedbackCollector::new(100, timeout));
        let coordinator = Arc::new(DisplayCoordinator::new(
            settings(window_secs),
            Arc::new(clock.clone()),
            collector.clone(),
        ));
        (coordinator, clock, collector)
    }

    fn signal(id: &str, generated: &str, entry: &str) -> serde_json::Value {
        json!({
            "id": id,
            "asset": "EUR/USD",
            "direction": "UP",
            "confidence": 0.85,
            "generated_at": generated,
            "entry_time": entry,
            "duration": 2
        })
    }

    fn doc(signals: Vec<serde_json::Value>) -> FeedDocument {
        FeedDocument {
            last_update: Some("2024-05-01T10:00:00".into()),
            signals,
            ..FeedDocument::default()
        }
    }

    fn key(k: &str) -> SignalKey {
        SignalKey::new(k)
    }

    #[test]
    fn repeated_poll_preserves_running_timer() {
        let (coord, clock, _) = setup(60, Verdict::Unset);
        let feed = doc(vec![signal("A", "2024-05-01T10:00:00", "10:02")]);

        let first = coord.apply_document(&feed, FeedSource::Live, clock.now());
        assert_eq!(first.created, vec![key("A")]);
        assert_eq!(coord.board().signals[0].time_remaining_secs, 110);

        clock.advance(Duration::seconds(30));
        let second = coord.apply_document(&feed, FeedSource::Live, clock.now());
        assert!(second.created.is_empty());
        assert_eq!(second.kept, vec![key("A")]);

        let board = coord.board();
        assert_eq!(board.signals.len(), 1);
        assert_eq!(board.signals[0].time_remaining_secs, 80);
        assert_eq!(board.signals[0].phase, Phase::WaitingForEntry);
    }

    #[test]
    fn board_follows_selection_order() {
        let (coord, clock, _) = setup(60, Verdict::Unset);
        let feed = doc(vec![
            signal("old", "2024-05-01T09:58:00", "10:02"),
            signal("new", "2024-05-01T10:00:00", "10:03"),
        ]);
        coord.apply_document(&feed, FeedSource::Live, clock.now());

        let keys: Vec<String> = coord.board().signals.iter().map(|s| s.key.to_string()).collect();
        assert_eq!(keys, vec!["new", "old"]);
    }

    #[test]
    fn deselected_before_conclusion_is_discarded_silently() {
        let (coord, clock, collector) = setup(60, Verdict::Unset);
        coord.apply_document(
            &doc(vec![signal("A", "2024-05-01T10:00:00", "10:02")]),
            FeedSource::Live,
            clock.now(),
        );

        let report = coord.apply_document(&doc(vec![]), FeedSource::Live, clock.now());
        assert_eq!(report.retired, vec![key("A")]);
        assert_eq!(report.finalized, 0);
        assert_eq!(coord.live_count(), 0);
        assert_eq!(collector.stats().total, 0);
    }

    #[test]
    fn deselected_after_conclusion_gets_timeout_verdict() {
        let (coord, clock, collector) = setup(60, Verdict::Skipped);
        coord.apply_document(
            &doc(vec![signal("A", "2024-05-01T10:00:00", "10:02")]),
            FeedSource::Live,
            clock.now(),
        );

        clock.set(kyiv(10, 4, 20));
        let report = coord.apply_document(&doc(vec![]), FeedSource::Live, clock.now());
        assert_eq!(report.finalized, 1);
        assert_eq!(collector.verdict_for(&key("A")), Some(Verdict::Skipped));
    }

    #[test]
    fn feedback_retires_and_tombstone_blocks_resurrection() {
        let (coord, clock, collector) = setup(60, Verdict::Unset);
        let feed = doc(vec![signal("A", "2024-05-01T10:00:00", "10:02")]);
        coord.apply_document(&feed, FeedSource::Live, clock.now());

        let err = coord.submit_feedback(&key("A"), Verdict::Correct).unwrap_err();
        assert!(matches!(err, FeedbackError::NotOpen { phase: Phase::WaitingForEntry, .. }));

        clock.set(kyiv(10, 4, 5));
        coord.submit_feedback(&key("A"), Verdict::Correct).unwrap();
        assert_eq!(coord.live_count(), 0);
        assert_eq!(collector.verdict_for(&key("A")), Some(Verdict::Correct));

        let err = coord.submit_feedback(&key("A"), Verdict::Incorrect).unwrap_err();
        assert_eq!(err, FeedbackError::AlreadyRecorded("A".into()));

        let report = coord.apply_document(&feed, FeedSource::Live, clock.now());
        assert!(report.created.is_empty());
        assert_eq!(report.suppressed, 1);
        assert_eq!(coord.live_count(), 0);
    }

    #[test]
    fn tombstone_clears_once_key_leaves_feed() {
        let (coord, clock, _) = setup(60, Verdict::Unset);
        let feed = doc(vec![signal("A", "2024-05-01T10:00:00", "10:02")]);
        coord.apply_document(&feed, FeedSource::Live, clock.now());
        clock.set(kyiv(10, 4, 5));
        coord.submit_feedback(&key("A"), Verdict::Incorrect).unwrap();

        coord.apply_document(&doc(vec![]), FeedSource::Live, clock.now());
        assert!(coord.board.read().tombstones.is_empty());
    }

    #[test]
    fn unknown_key_is_rejected() {
        let (coord, _, _) = setup(60, Verdict::Unset);
        let err = coord.submit_feedback(&key("ghost"), Verdict::Correct).unwrap_err();
        assert_eq!(err, FeedbackError::UnknownSignal("ghost".into()));
    }

    #[test]
    fn tick_all_retires_after_window_with_timeout_verdict() {
        let (coord, clock, collector) = setup(60, Verdict::Skipped);
        coord.apply_document(
            &doc(vec![signal("A", "2024-05-01T10:00:00", "10:02")]),
            FeedSource::Live,
            clock.now(),
        );

        clock.set(kyiv(10, 4, 30));
        assert_eq!(coord.tick_all(), 0);
        assert_eq!(coord.board().signals[0].phase, Phase::AwaitingFeedback);

        clock.set(kyiv(10, 5, 0));
        assert_eq!(coord.tick_all(), 1);
        assert_eq!(coord.live_count(), 0);
        let history = collector.history(10);
        assert_eq!(history[0].verdict, Verdict::Skipped);
        assert!(history[0].automatic);
    }

    #[test]
    fn record_first_seen_after_window_is_not_displayed() {
        let (coord, clock, collector) = setup(60, Verdict::Unset);
        clock.set(kyiv(10, 30, 0));
        let report = coord.apply_document(
            &doc(vec![signal("late", "2024-05-01T10:00:00", "10:02")]),
            FeedSource::Live,
            clock.now(),
        );
        assert!(report.created.is_empty());
        assert_eq!(report.suppressed, 1);
        assert_eq!(collector.stats().total, 0);
    }

    #[test]
    fn degraded_signal_is_shown_but_never_auto_retired() {
        let (coord, clock, _) = setup(60, Verdict::Unset);
        coord.apply_document(
            &doc(vec![signal("D", "2024-05-01T10:00:00", "25:99")]),
            FeedSource::Live,
            clock.now(),
        );

        clock.set(kyiv(12, 0, 0));
        assert_eq!(coord.tick_all(), 0);
        let board = coord.board();
        assert_eq!(board.signals[0].phase, Phase::Degraded);
        assert_eq!(board.signals[0].time_remaining_secs, 0);
    }

    #[test]
    fn failure_leaves_board_and_is_reported() {
        let (coord, clock, _) = setup(60, Verdict::Unset);
        coord.apply_document(
            &doc(vec![signal("A", "2024-05-01T10:00:00", "10:02")]),
            FeedSource::Live,
            clock.now(),
        );
        coord.record_poll_failure("connection refused", clock.now());
        coord.record_poll_failure("connection refused", clock.now());

        let board = coord.board();
        assert_eq!(board.signals.len(), 1);
        assert_eq!(board.poll.consecutive_failures, 2);
        assert_eq!(board.poll.last_error.as_deref(), Some("connection refused"));

        coord.apply_document(&doc(vec![]), FeedSource::Live, clock.now());
        let status = coord.poll_status();
        assert_eq!(status.consecutive_failures, 0);
        assert!(status.last_error.is_none());
    }

    #[test]
    fn malformed_records_are_isolated() {
        let (coord, clock, _) = setup(60, Verdict::Unset);
        let report = coord.apply_document(
            &doc(vec![
                json!({ "asset": "EUR/USD", "direction": "SIDEWAYS", "confidence": 0.9 }),
                signal("ok", "2024-05-01T10:00:00", "10:02"),
            ]),
            FeedSource::Live,
            clock.now(),
        );
        assert_eq!(report.created, vec![key("ok")]);
        assert_eq!(coord.poll_status().rejected, 1);
    }

    fn record_of(id: &str) -> SignalRecord {
        let feed = doc(vec![signal(id, "2024-05-01T10:00:00", "10:02")]);
        ingest(&feed, IngestOptions::default()).records.remove(0)
    }

    #[test]
    fn stored_verdict_keeps_signal_off_board_after_restart() {
        let (coord, clock, collector) = setup(60, Verdict::Unset);
        // History reloaded from disk already judges A.
        collector.record(&record_of("A"), Verdict::Correct, clock.now());

        clock.set(kyiv(10, 4, 5));
        let report = coord.apply_document(
            &doc(vec![signal("A", "2024-05-01T10:00:00", "10:02")]),
            FeedSource::Live,
            clock.now(),
        );
        assert!(report.created.is_empty());
        assert_eq!(report.suppressed, 1);
        assert_eq!(coord.live_count(), 0);

        let err = coord.submit_feedback(&key("A"), Verdict::Incorrect).unwrap_err();
        assert_eq!(err, FeedbackError::AlreadyRecorded("A".into()));
        assert_eq!(collector.verdict_for(&key("A")), Some(Verdict::Correct));
        assert_eq!(collector.stats().total, 1);
    }

    #[test]
    fn losing_verdict_is_reported_and_signal_retired() {
        let (coord, clock, collector) = setup(60, Verdict::Unset);
        coord.apply_document(
            &doc(vec![signal("A", "2024-05-01T10:00:00", "10:02")]),
            FeedSource::Live,
            clock.now(),
        );
        // Verdict lands in the history while A is still on the board.
        collector.record(&record_of("A"), Verdict::Skipped, clock.now());

        clock.set(kyiv(10, 4, 5));
        let err = coord.submit_feedback(&key("A"), Verdict::Correct).unwrap_err();
        assert_eq!(err, FeedbackError::AlreadyRecorded("A".into()));
        assert_eq!(coord.live_count(), 0);
        assert_eq!(collector.verdict_for(&key("A")), Some(Verdict::Skipped));
    }

    // ── Poll path ───────────────────────────────────────────────────────

    struct PollFixture {
        state: Arc<AppState>,
        client: FeedClient,
        cache: SnapshotCache,
        dir: std::path::PathBuf,
    }

    impl Drop for PollFixture {
        fn drop(&mut self) {
            self.state.coordinator.shutdown();
            let _ = std::fs::remove_dir_all(&self.dir);
        }
    }

    fn poll_fixture(clock: &ManualClock) -> PollFixture {
        let dir = std::env::temp_dir().join(format!("signal-deck-poll-{}", uuid::Uuid::new_v4()));
        let state = Arc::new(AppState::new(
            RuntimeConfig::default(),
            dir.join("runtime_config.json"),
            Arc::new(clock.clone()),
            Arc::new(FeedbackCollector::new(100, Verdict::Unset)),
        ));
        PollFixture {
            state,
            // Nothing listens on port 1; every fetch is refused.
            client: FeedClient::new("http://127.0.0.1:1/data/signals.json").unwrap(),
            cache: SnapshotCache::new(dir.join("last_feed.json")),
            dir,
        }
    }

    fn board_keys(state: &AppState) -> Vec<String> {
        state
            .coordinator
            .board()
            .signals
            .iter()
            .map(|s| s.key.to_string())
            .collect()
    }

    #[tokio::test]
    async fn failed_poll_falls_back_to_fresh_cache_on_empty_board() {
        let clock = ManualClock::new(kyiv(10, 0, 10));
        let fx = poll_fixture(&clock);
        fx.cache
            .store(&doc(vec![signal("A", "2024-05-01T10:00:00", "10:02")]), kyiv(10, 0, 0))
            .unwrap();

        poll_once(&fx.state, &fx.client, &fx.cache).await;

        assert_eq!(board_keys(&fx.state), vec!["A"]);
        let status = fx.state.coordinator.poll_status();
        assert_eq!(status.source, Some(FeedSource::Cache { fetched_at: kyiv(10, 0, 0) }));
        assert_eq!(status.consecutive_failures, 1);
        assert!(status.last_error.is_some());
        assert_eq!(fx.state.recent_errors.read().len(), 1);
    }

    #[tokio::test]
    async fn failed_poll_leaves_populated_board_untouched() {
        let clock = ManualClock::new(kyiv(10, 0, 10));
        let fx = poll_fixture(&clock);
        fx.state.coordinator.apply_document(
            &doc(vec![signal("A", "2024-05-01T10:00:00", "10:02")]),
            FeedSource::Live,
            clock.now(),
        );
        fx.cache
            .store(&doc(vec![signal("B", "2024-05-01T10:00:05", "10:03")]), kyiv(10, 0, 5))
            .unwrap();

        poll_once(&fx.state, &fx.client, &fx.cache).await;

        assert_eq!(board_keys(&fx.state), vec!["A"]);
        let status = fx.state.coordinator.poll_status();
        assert_eq!(status.source, Some(FeedSource::Live));
        assert_eq!(status.consecutive_failures, 1);
    }

    #[tokio::test]
    async fn failed_poll_ignores_stale_cache() {
        let clock = ManualClock::new(kyiv(10, 0, 10));
        let fx = poll_fixture(&clock);
        fx.cache
            .store(&doc(vec![signal("A", "2024-05-01T10:00:00", "10:02")]), kyiv(9, 40, 0))
            .unwrap();

        poll_once(&fx.state, &fx.client, &fx.cache).await;

        assert!(board_keys(&fx.state).is_empty());
        assert!(!fx.state.coordinator.is_populated());
        assert_eq!(fx.state.coordinator.poll_status().consecutive_failures, 1);
    }

    #[tokio::test]
    async fn tickers_run_and_are_cancelled() {
        let (coord, clock, collector) = setup(60, Verdict::Unset);
        coord.apply_document(
            &doc(vec![
                signal("A", "2024-05-01T10:00:00", "10:02"),
                signal("B", "2024-05-01T10:00:00", "10:03"),
            ]),
            FeedSource::Live,
            clock.now(),
        );
        assert_eq!(coord.running_tickers(), 2);

        // A's window has closed; B is still awaiting feedback.
        clock.set(kyiv(10, 5, 30));
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        assert_eq!(coord.live_count(), 1);
        assert_eq!(collector.verdict_for(&key("A")), Some(Verdict::Unset));

        coord.shutdown();
        assert_eq!(coord.live_count(), 0);
        assert_eq!(coord.running_tickers(), 0);
    }
}
