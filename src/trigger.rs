// =============================================================================
// Remote Trigger — start signal generation on GitHub Actions
// =============================================================================
//
// A generation request runs as a sequence of named steps:
//
//   1. gate       GenerationGate::try_begin (cooldown / single flight)
//   2. dispatch   POST workflow_dispatch
//   3. settle     give the run time to appear
//   4. watch      poll the latest run until completed or max_wait elapses
//   5. refresh    wake the poll loop so new signals show up at once
//
// Steps 3 and 4 wait on the shutdown channel as well as the timer, so a
// pending generation never delays process exit.
//
// SECURITY: the token is sent as a bearer header and never logged.
// =============================================================================

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{watch, Notify};
use tracing::{debug, info, instrument, warn};

use crate::clock::Clock;
use crate::runtime_config::TriggerSettings;

const GITHUB_API: &str = "https://api.github.com";
const GITHUB_API_VERSION: &str = "2022-11-28";
const REQUEST_TIMEOUT_SECS: u64 = 15;
/// Runs created this long before our dispatch are still accepted as ours.
const RUN_CLOCK_SKEW_SECS: i64 = 10;

// =============================================================================
// Errors
// =============================================================================

#[derive(Error, Debug)]
pub enum TriggerError {
    #[error("generation is cooling down, retry in {remaining_secs} s")]
    CoolingDown { remaining_secs: u64 },

    #[error("a generation is already in progress")]
    InProgress,

    #[error("remote trigger is not configured")]
    NotConfigured,

    #[error("remote rejected the request: HTTP {status}: {body}")]
    Rejected { status: u16, body: String },

    #[error("cancelled by shutdown")]
    Cancelled,

    #[error("remote request failed: {0}")]
    Http(#[from] reqwest::Error),
}

// =============================================================================
// Gate
// =============================================================================

/// Progress of the current (or last) generation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "stage", rename_all = "snake_case")]
pub enum GenerationStage {
    Idle,
    Dispatching,
    Settling,
    WaitingForRun,
    Refreshing,
    Completed { conclusion: Option<String> },
    Failed { error: String },
}

impl GenerationStage {
    fn is_settled(&self) -> bool {
        matches!(self, Self::Idle | Self::Completed { .. } | Self::Failed { .. })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct GateStatus {
    pub running: bool,
    pub stage: GenerationStage,
    pub last_dispatch_at: Option<DateTime<Utc>>,
    pub cooldown_remaining_secs: u64,
}

#[derive(Debug)]
struct GateInner {
    running: bool,
    last_dispatch_at: Option<DateTime<Utc>>,
    stage: GenerationStage,
}

/// Cooldown and single-flight guard for generation requests. The cooldown
/// starts at a successful dispatch.
#[derive(Debug)]
pub struct GenerationGate {
    cooldown: Duration,
    inner: Mutex<GateInner>,
}

impl GenerationGate {
    pub fn new(cooldown: Duration) -> Self {
        Self {
            cooldown,
            inner: Mutex::new(GateInner {
                running: false,
                last_dispatch_at: None,
                stage: GenerationStage::Idle,
            }),
        }
    }

    /// Claim the gate. Fails while a generation runs or the cooldown since
    /// the last dispatch has not elapsed.
    pub fn try_begin(self: &Arc<Self>, now: DateTime<Utc>) -> Result<GenerationPermit, TriggerError> {
        let mut inner = self.inner.lock();
        if inner.running {
            return Err(TriggerError::InProgress);
        }
        if let Some(left) = self.remaining(inner.last_dispatch_at, now) {
            return Err(TriggerError::CoolingDown {
                remaining_secs: ceil_secs(left),
            });
        }
        inner.running = true;
        Ok(GenerationPermit { gate: self.clone() })
    }

    pub fn cooldown_remaining(&self, now: DateTime<Utc>) -> Option<Duration> {
        self.remaining(self.inner.lock().last_dispatch_at, now)
    }

    pub fn status(&self, now: DateTime<Utc>) -> GateStatus {
        let inner = self.inner.lock();
        GateStatus {
            running: inner.running,
            stage: inner.stage.clone(),
            last_dispatch_at: inner.last_dispatch_at,
            cooldown_remaining_secs: self
                .remaining(inner.last_dispatch_at, now)
                .map(ceil_secs)
                .unwrap_or(0),
        }
    }

    fn remaining(&self, last: Option<DateTime<Utc>>, now: DateTime<Utc>) -> Option<Duration> {
        let elapsed = now - last?;
        let left = self.cooldown - elapsed;
        (left > Duration::zero()).then_some(left)
    }
}

/// Held for the duration of one generation; releases the gate on drop.
#[derive(Debug)]
pub struct GenerationPermit {
    gate: Arc<GenerationGate>,
}

impl GenerationPermit {
    fn set_stage(&self, stage: GenerationStage) {
        debug!(stage = ?stage, "generation stage");
        self.gate.inner.lock().stage = stage;
    }

    fn mark_dispatched(&self, at: DateTime<Utc>) {
        self.gate.inner.lock().last_dispatch_at = Some(at);
    }
}

impl Drop for GenerationPermit {
    fn drop(&mut self) {
        let mut inner = self.gate.inner.lock();
        inner.running = false;
        if !inner.stage.is_settled() {
            inner.stage = GenerationStage::Failed {
                error: "interrupted".to_string(),
            };
        }
    }
}

fn ceil_secs(d: Duration) -> u64 {
    let ms = d.num_milliseconds().max(0) as u64;
    ms.div_ceil(1000)
}

// =============================================================================
// GitHub client
// =============================================================================

/// One workflow run as reported by the Actions API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunStatus {
    pub id: u64,
    pub status: String,
    #[serde(default)]
    pub conclusion: Option<String>,
    #[serde(default)]
    pub html_url: Option<String>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

impl RunStatus {
    pub fn is_completed(&self) -> bool {
        self.status == "completed"
    }
}

#[derive(Debug, Deserialize)]
struct RunsPage {
    #[serde(default)]
    workflow_runs: Vec<RunStatus>,
}

#[derive(Clone)]
pub struct RemoteTrigger {
    settings: TriggerSettings,
    base_url: String,
    client: reqwest::Client,
}

impl RemoteTrigger {
    pub fn new(settings: TriggerSettings, token: &str) -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("application/vnd.github+json"));
        headers.insert("X-GitHub-Api-Version", HeaderValue::from_static(GITHUB_API_VERSION));
        if !token.is_empty() {
            let mut auth = HeaderValue::from_str(&format!("Bearer {token}"))
                .context("GitHub token contains invalid header characters")?;
            auth.set_sensitive(true);
            headers.insert(AUTHORIZATION, auth);
        }

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(std::time::Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .user_agent(concat!("signal-deck/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("failed to build GitHub HTTP client")?;

        debug!(
            owner = %settings.owner,
            repo = %settings.repo,
            workflow = %settings.workflow,
            "RemoteTrigger initialised"
        );

        Ok(Self {
            settings,
            base_url: GITHUB_API.to_string(),
            client,
        })
    }

    pub fn settings(&self) -> &TriggerSettings {
        &self.settings
    }

    fn workflow_url(&self) -> String {
        format!(
            "{}/repos/{}/{}/actions/workflows/{}",
            self.base_url, self.settings.owner, self.settings.repo, self.settings.workflow
        )
    }

    /// POST .../workflows/{workflow}/dispatches
    #[instrument(skip(self), name = "github::dispatch", fields(workflow = %self.settings.workflow))]
    pub async fn dispatch(&self) -> Result<(), TriggerError> {
        if !self.settings.is_configured() {
            return Err(TriggerError::NotConfigured);
        }

        let resp = self
            .client
            .post(format!("{}/dispatches", self.workflow_url()))
            .json(&serde_json::json!({ "ref": self.settings.git_ref }))
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(TriggerError::Rejected {
                status: status.as_u16(),
                body: truncate(&body, 300),
            });
        }

        info!(git_ref = %self.settings.git_ref, "workflow dispatched");
        Ok(())
    }

    /// GET .../workflows/{workflow}/runs, newest first.
    #[instrument(skip(self), name = "github::latest_run", fields(workflow = %self.settings.workflow))]
    pub async fn latest_run(&self) -> Result<Option<RunStatus>, TriggerError> {
        if !self.settings.is_configured() {
            return Err(TriggerError::NotConfigured);
        }

        let resp = self
            .client
            .get(format!("{}/runs", self.workflow_url()))
            .query(&[("per_page", "1"), ("branch", self.settings.git_ref.as_str())])
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(TriggerError::Rejected {
                status: status.as_u16(),
                body: truncate(&body, 300),
            });
        }

        let page: RunsPage = resp.json().await?;
        Ok(page.workflow_runs.into_iter().next())
    }
}

impl std::fmt::Debug for RemoteTrigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteTrigger")
            .field("owner", &self.settings.owner)
            .field("repo", &self.settings.repo)
            .field("workflow", &self.settings.workflow)
            .finish()
    }
}

fn truncate(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}

// =============================================================================
// Generation sequence
// =============================================================================

/// What a finished generation observed.
#[derive(Debug, Clone, Serialize)]
pub struct GenerationOutcome {
    pub dispatched_at: DateTime<Utc>,
    /// Last run seen; `None` if it never appeared.
    pub run: Option<RunStatus>,
    /// True when `max_wait` elapsed before the run completed.
    pub timed_out: bool,
}

/// Drive steps 2-5 under an already acquired permit.
pub async fn run_generation(
    permit: GenerationPermit,
    trigger: Arc<RemoteTrigger>,
    clock: Arc<dyn Clock>,
    refresh: Arc<Notify>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<GenerationOutcome, TriggerError> {
    let result = generation_steps(&permit, &trigger, clock.as_ref(), &refresh, &mut shutdown).await;

    match &result {
        Ok(outcome) => {
            let conclusion = outcome.run.as_ref().and_then(|r| r.conclusion.clone());
            info!(
                conclusion = conclusion.as_deref().unwrap_or("unknown"),
                timed_out = outcome.timed_out,
                "generation finished"
            );
            permit.set_stage(GenerationStage::Completed { conclusion });
        }
        Err(e) => {
            warn!(error = %e, "generation failed");
            permit.set_stage(GenerationStage::Failed { error: e.to_string() });
        }
    }
    result
}

async fn generation_steps(
    permit: &GenerationPermit,
    trigger: &RemoteTrigger,
    clock: &dyn Clock,
    refresh: &Notify,
    shutdown: &mut watch::Receiver<bool>,
) -> Result<GenerationOutcome, TriggerError> {
    let settings = trigger.settings().clone();

    // ── dispatch ────────────────────────────────────────────────────────
    permit.set_stage(GenerationStage::Dispatching);
    trigger.dispatch().await?;
    let dispatched_at = clock.now();
    permit.mark_dispatched(dispatched_at);

    // ── settle ──────────────────────────────────────────────────────────
    permit.set_stage(GenerationStage::Settling);
    wait_or_cancel(std::time::Duration::from_secs(settings.settle_delay_secs), shutdown).await?;

    // ── watch ───────────────────────────────────────────────────────────
    permit.set_stage(GenerationStage::WaitingForRun);
    let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(settings.max_wait_secs);
    let poll_every = std::time::Duration::from_secs(settings.poll_interval_secs.max(1));
    let earliest = dispatched_at - Duration::seconds(RUN_CLOCK_SKEW_SECS);

    let mut last_seen: Option<RunStatus> = None;
    let mut timed_out = false;
    loop {
        match trigger.latest_run().await {
            Ok(Some(run)) if run.created_at.map_or(true, |c| c >= earliest) => {
                debug!(run_id = run.id, status = %run.status, "workflow run status");
                let done = run.is_completed();
                last_seen = Some(run);
                if done {
                    break;
                }
            }
            Ok(_) => debug!("workflow run not visible yet"),
            Err(e) => warn!(error = %e, "failed to query workflow run — will retry"),
        }

        if tokio::time::Instant::now() >= deadline {
            timed_out = true;
            break;
        }
        wait_or_cancel(poll_every, shutdown).await?;
    }

    // ── refresh ─────────────────────────────────────────────────────────
    permit.set_stage(GenerationStage::Refreshing);
    refresh.notify_one();

    Ok(GenerationOutcome {
        dispatched_at,
        run: last_seen,
        timed_out,
    })
}

/// Sleep for `duration` unless shutdown is signalled first.
async fn wait_or_cancel(
    duration: std::time::Duration,
    shutdown: &mut watch::Receiver<bool>,
) -> Result<(), TriggerError> {
    if *shutdown.borrow() {
        return Err(TriggerError::Cancelled);
    }
    tokio::select! {
        _ = tokio::time::sleep(duration) => Ok(()),
        _ = shutdown_signalled(shutdown) => Err(TriggerError::Cancelled),
    }
}

async fn shutdown_signalled(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow() {
            return;
        }
        if rx.changed().await.is_err() {
            // Sender gone: nobody can ask us to stop any more.
            std::future::pending::<()>().await;
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 8, 0, 0).unwrap()
    }

    #[test]
    fn gate_is_single_flight() {
        let gate = Arc::new(GenerationGate::new(Duration::minutes(5)));
        let permit = gate.try_begin(t0()).unwrap();
        assert!(matches!(gate.try_begin(t0()), Err(TriggerError::InProgress)));
        drop(permit);
        assert!(gate.try_begin(t0()).is_ok());
    }

    #[test]
    fn cooldown_starts_at_dispatch() {
        let gate = Arc::new(GenerationGate::new(Duration::minutes(5)));
        {
            let permit = gate.try_begin(t0()).unwrap();
            permit.mark_dispatched(t0());
            permit.set_stage(GenerationStage::Completed { conclusion: None });
        }

        match gate.try_begin(t0() + Duration::seconds(60)) {
            Err(TriggerError::CoolingDown { remaining_secs }) => assert_eq!(remaining_secs, 240),
            other => panic!("expected cooldown, got {other:?}"),
        }
        assert!(gate.try_begin(t0() + Duration::minutes(5)).is_ok());
    }

    #[test]
    fn failed_dispatch_does_not_start_cooldown() {
        let gate = Arc::new(GenerationGate::new(Duration::minutes(5)));
        drop(gate.try_begin(t0()).unwrap());
        assert!(gate.cooldown_remaining(t0()).is_none());
    }

    #[test]
    fn dropped_permit_marks_unfinished_stage_failed() {
        let gate = Arc::new(GenerationGate::new(Duration::minutes(5)));
        let permit = gate.try_begin(t0()).unwrap();
        permit.set_stage(GenerationStage::Settling);
        drop(permit);

        let status = gate.status(t0());
        assert!(!status.running);
        assert_eq!(
            status.stage,
            GenerationStage::Failed {
                error: "interrupted".into()
            }
        );
    }

    #[test]
    fn remaining_seconds_round_up() {
        assert_eq!(ceil_secs(Duration::milliseconds(1)), 1);
        assert_eq!(ceil_secs(Duration::seconds(3)), 3);
        assert_eq!(ceil_secs(Duration::milliseconds(-5)), 0);
    }

    #[test]
    fn runs_page_parses_github_shape() {
        let page: RunsPage = serde_json::from_value(serde_json::json!({
            "total_count": 1,
            "workflow_runs": [{
                "id": 42,
                "status": "completed",
                "conclusion": "success",
                "html_url": "https://github.com/o/r/actions/runs/42",
                "created_at": "2024-05-01T08:00:05Z",
                "head_branch": "main"
            }]
        }))
        .unwrap();
        let run = &page.workflow_runs[0];
        assert!(run.is_completed());
        assert_eq!(run.conclusion.as_deref(), Some("success"));
    }

    #[tokio::test]
    async fn unconfigured_trigger_fails_without_network() {
        let trigger = RemoteTrigger::new(TriggerSettings::default(), "").unwrap();
        assert!(matches!(trigger.dispatch().await, Err(TriggerError::NotConfigured)));
    }

    #[tokio::test]
    async fn generation_failure_is_reported_on_the_gate() {
        let gate = Arc::new(GenerationGate::new(Duration::minutes(5)));
        let permit = gate.try_begin(t0()).unwrap();
        let trigger = Arc::new(RemoteTrigger::new(TriggerSettings::default(), "").unwrap());
        let clock: Arc<dyn Clock> = Arc::new(crate::clock::ManualClock::new(t0()));
        let (_tx, rx) = watch::channel(false);

        let result = run_generation(permit, trigger, clock, Arc::new(Notify::new()), rx).await;
        assert!(matches!(result, Err(TriggerError::NotConfigured)));

        let status = gate.status(t0());
        assert!(!status.running);
        assert!(matches!(status.stage, GenerationStage::Failed { .. }));
        assert!(gate.cooldown_remaining(t0()).is_none());
    }

    #[tokio::test]
    async fn waits_are_cancelled_by_shutdown() {
        let (tx, mut rx) = watch::channel(false);
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            let _ = tx.send(true);
        });

        let started = std::time::Instant::now();
        let result = wait_or_cancel(std::time::Duration::from_secs(60), &mut rx).await;
        assert!(matches!(result, Err(TriggerError::Cancelled)));
        assert!(started.elapsed() < std::time::Duration::from_secs(5));
    }

    #[tokio::test]
    async fn short_wait_completes_normally() {
        let (_tx, mut rx) = watch::channel(false);
        assert!(wait_or_cancel(std::time::Duration::from_millis(5), &mut rx).await.is_ok());
    }
}
