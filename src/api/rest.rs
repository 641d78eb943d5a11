// =============================================================================
// REST API Endpoints — Axum 0.7
// =============================================================================
//
// All endpoints live under `/api/v1/`. Reading the board and submitting
// feedback are open to the dashboard; starting a remote generation requires a
// Bearer token checked via the `AuthBearer` extractor.
//
// CORS is configured permissively for development; tighten `allowed_origins`
// in production.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{Json, Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info};

use crate::api::auth::AuthBearer;
use crate::app_state::AppState;
use crate::feed::SignalKey;
use crate::feedback::FeedbackError;
use crate::trigger::{run_generation, TriggerError};
use crate::types::Verdict;

/// History entries returned when the caller gives no `limit`.
const DEFAULT_HISTORY_LIMIT: usize = 100;

// =============================================================================
// Router construction
// =============================================================================

/// Build the full REST API router with CORS middleware and shared state.
pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // ── Public ──────────────────────────────────────────────────
        .route("/api/v1/health", get(health))
        .route("/api/v1/signals", get(signals))
        .route("/api/v1/signals/:key/feedback", post(submit_feedback))
        .route("/api/v1/feedback/stats", get(feedback_stats))
        .route("/api/v1/feedback/history", get(feedback_history))
        .route("/api/v1/refresh", post(refresh))
        // ── Authenticated ───────────────────────────────────────────
        .route("/api/v1/generate", post(generate))
        // ── Middleware & State ──────────────────────────────────────
        .layer(cors)
        .with_state(state)
}

fn error_body(status: StatusCode, message: impl Into<String>) -> Response {
    let body = serde_json::json!({ "error": message.into() });
    (status, Json(body)).into_response()
}

// =============================================================================
// Health
// =============================================================================

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    state_version: u64,
    board_version: u64,
    live_signals: usize,
    server_time: i64,
}

async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok",
        state_version: state.current_state_version(),
        board_version: state.coordinator.version(),
        live_signals: state.coordinator.live_count(),
        server_time: state.clock.now().timestamp_millis(),
    })
}

// =============================================================================
// Board
// =============================================================================

async fn signals(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.build_snapshot())
}

// =============================================================================
// Feedback
// =============================================================================

#[derive(Deserialize)]
struct FeedbackRequest {
    verdict: Verdict,
}

#[derive(Serialize)]
struct FeedbackResponse {
    key: SignalKey,
    verdict: Verdict,
}

fn feedback_error_status(e: &FeedbackError) -> StatusCode {
    match e {
        FeedbackError::UnknownSignal(_) => StatusCode::NOT_FOUND,
        FeedbackError::NotOpen { .. } | FeedbackError::AlreadyRecorded(_) => StatusCode::CONFLICT,
        FeedbackError::UnsetVerdict => StatusCode::UNPROCESSABLE_ENTITY,
    }
}

async fn submit_feedback(
    State(state): State<Arc<AppState>>,
    Path(key): Path<String>,
    Json(req): Json<FeedbackRequest>,
) -> Response {
    let key = SignalKey::new(key);
    match state.coordinator.submit_feedback(&key, req.verdict) {
        Ok(()) => {
            state.increment_version();
            info!(key = %key, verdict = %req.verdict, "feedback submitted via API");
            Json(FeedbackResponse {
                key,
                verdict: req.verdict,
            })
            .into_response()
        }
        Err(e) => error_body(feedback_error_status(&e), e.to_string()),
    }
}

async fn feedback_stats(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.feedback.stats())
}

#[derive(Deserialize)]
struct HistoryQuery {
    #[serde(default)]
    limit: Option<usize>,
}

async fn feedback_history(
    State(state): State<Arc<AppState>>,
    Query(q): Query<HistoryQuery>,
) -> impl IntoResponse {
    Json(state.feedback.history(q.limit.unwrap_or(DEFAULT_HISTORY_LIMIT)))
}

// =============================================================================
// Refresh / generation
// =============================================================================

async fn refresh(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    state.request_refresh();
    (
        StatusCode::ACCEPTED,
        Json(serde_json::json!({ "status": "refresh requested" })),
    )
}

fn trigger_error_status(e: &TriggerError) -> StatusCode {
    match e {
        TriggerError::CoolingDown { .. } => StatusCode::TOO_MANY_REQUESTS,
        TriggerError::InProgress => StatusCode::CONFLICT,
        TriggerError::NotConfigured => StatusCode::SERVICE_UNAVAILABLE,
        TriggerError::Cancelled => StatusCode::SERVICE_UNAVAILABLE,
        TriggerError::Rejected { .. } | TriggerError::Http(_) => StatusCode::BAD_GATEWAY,
    }
}

async fn generate(_auth: AuthBearer, State(state): State<Arc<AppState>>) -> Response {
    let Some(trigger) = state.trigger.clone() else {
        let e = TriggerError::NotConfigured;
        return error_body(trigger_error_status(&e), e.to_string());
    };

    let permit = match state.generation_gate.try_begin(state.clock.now()) {
        Ok(p) => p,
        Err(e) => {
            let mut resp = error_body(trigger_error_status(&e), e.to_string());
            if let TriggerError::CoolingDown { remaining_secs } = e {
                resp.headers_mut().insert(
                    axum::http::header::RETRY_AFTER,
                    axum::http::HeaderValue::from(remaining_secs),
                );
            }
            return resp;
        }
    };

    info!("remote generation requested via API");
    state.increment_version();

    let task_state = state.clone();
    tokio::spawn(async move {
        let result = run_generation(
            permit,
            trigger,
            task_state.clock.clone(),
            task_state.refresh.clone(),
            task_state.subscribe_shutdown(),
        )
        .await;

        if let Err(e) = result {
            if !matches!(e, TriggerError::Cancelled) {
                error!(error = %e, "remote generation failed");
                let code = match &e {
                    TriggerError::Rejected { status, .. } => Some(status.to_string()),
                    _ => None,
                };
                task_state.push_error_with_code(format!("generation failed: {e}"), code);
            }
        }
        task_state.increment_version();
    });

    (
        StatusCode::ACCEPTED,
        Json(serde_json::json!({ "status": "generation started" })),
    )
        .into_response()
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};
    use crate::coordinator::FeedSource;
    use crate::feed::FeedDocument;
    use crate::feedback::FeedbackCollector;
    use crate::runtime_config::RuntimeConfig;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use chrono::{DateTime, TimeZone, Utc};
    use tower::ServiceExt;

    /// 10:00:00 Kyiv == 08:00:00 UTC.
    fn kyiv(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, h - 2, m, s).unwrap()
    }

    fn state_with(clock: &ManualClock, token: Option<&str>) -> Arc<AppState> {
        let config = RuntimeConfig {
            max_age_secs: None,
            ..RuntimeConfig::default()
        };
        let state = AppState::new(
            config,
            "runtime_config.json",
            Arc::new(clock.clone()),
            Arc::new(FeedbackCollector::new(100, Verdict::Unset)),
        )
        .with_admin_token(token.map(str::to_string));
        Arc::new(state)
    }

    fn populate(state: &Arc<AppState>) {
        let doc = FeedDocument {
            signals: vec![serde_json::json!({
                "id": "A",
                "asset": "EUR/USD",
                "direction": "UP",
                "confidence": 0.9,
                "generated_at": "2024-05-01T10:00:00",
                "entry_time": "10:02",
                "duration": 2
            })],
            ..FeedDocument::default()
        };
        let now = state.clock.now();
        state.coordinator.apply_document(&doc, FeedSource::Live, now);
    }

    async fn call(state: &Arc<AppState>, req: Request<Body>) -> (StatusCode, serde_json::Value) {
        let resp = router(state.clone()).oneshot(req).await.unwrap();
        let status = resp.status();
        let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let body = if bytes.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null)
        };
        (status, body)
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    fn post_json(uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn health_is_public() {
        let clock = ManualClock::new(kyiv(10, 0, 10));
        let (status, body) = call(&state_with(&clock, None), get("/api/v1/health")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn signals_lists_the_board() {
        let clock = ManualClock::new(kyiv(10, 0, 10));
        let state = state_with(&clock, None);
        populate(&state);

        let (status, body) = call(&state, get("/api/v1/signals")).await;
        assert_eq!(status, StatusCode::OK);
        let signals = body["board"]["signals"].as_array().unwrap();
        assert_eq!(signals.len(), 1);
        assert_eq!(signals[0]["key"], "A");
        assert_eq!(signals[0]["phase"], "WaitingForEntry");
        assert_eq!(signals[0]["direction"], "UP");
    }

    #[tokio::test]
    async fn feedback_round_trip() {
        let clock = ManualClock::new(kyiv(10, 0, 10));
        let state = state_with(&clock, None);
        populate(&state);

        let (status, _) = call(
            &state,
            post_json("/api/v1/signals/A/feedback", serde_json::json!({ "verdict": "Correct" })),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);

        clock.set(kyiv(10, 4, 10));
        let (status, body) = call(
            &state,
            post_json("/api/v1/signals/A/feedback", serde_json::json!({ "verdict": "Correct" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["verdict"], "Correct");

        let (status, _) = call(
            &state,
            post_json("/api/v1/signals/A/feedback", serde_json::json!({ "verdict": "Incorrect" })),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);

        let (_, stats) = call(&state, get("/api/v1/feedback/stats")).await;
        assert_eq!(stats["total"], 1);
        assert_eq!(stats["correct"], 1);
        assert_eq!(stats["success_rate"], 1.0);

        let (_, history) = call(&state, get("/api/v1/feedback/history?limit=5")).await;
        assert_eq!(history.as_array().unwrap().len(), 1);
        assert_eq!(history[0]["key"], "A");
    }

    #[tokio::test]
    async fn feedback_for_unknown_signal_is_404() {
        let clock = ManualClock::new(kyiv(10, 0, 10));
        let (status, body) = call(
            &state_with(&clock, None),
            post_json("/api/v1/signals/nope/feedback", serde_json::json!({ "verdict": "Skipped" })),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(body["error"].as_str().unwrap().contains("nope"));
    }

    #[tokio::test]
    async fn unset_verdict_is_rejected() {
        let clock = ManualClock::new(kyiv(10, 4, 10));
        let state = state_with(&clock, None);
        populate(&state);
        let (status, _) = call(
            &state,
            post_json("/api/v1/signals/A/feedback", serde_json::json!({ "verdict": "Unset" })),
        )
        .await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[tokio::test]
    async fn refresh_is_accepted() {
        let clock = ManualClock::new(kyiv(10, 0, 10));
        let (status, _) = call(
            &state_with(&clock, None),
            Request::builder()
                .method("POST")
                .uri("/api/v1/refresh")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::ACCEPTED);
    }

    fn generate_req(token: Option<&str>) -> Request<Body> {
        let mut builder = Request::builder().method("POST").uri("/api/v1/generate");
        if let Some(t) = token {
            builder = builder.header("authorization", format!("Bearer {t}"));
        }
        builder.body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn generate_requires_token() {
        let clock = ManualClock::new(kyiv(10, 0, 10));
        let state = state_with(&clock, Some("secret"));

        let (status, _) = call(&state, generate_req(None)).await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let (status, _) = call(&state, generate_req(Some("wrong"))).await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let (status, _) = call(&state, generate_req(Some("secret"))).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn generate_refused_without_configured_token() {
        let clock = ManualClock::new(kyiv(10, 0, 10));
        let (status, _) = call(&state_with(&clock, None), generate_req(Some("anything"))).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn generate_conflicts_while_running() {
        let clock = ManualClock::new(kyiv(10, 0, 10));
        let state = AppState::new(
            RuntimeConfig::default(),
            "runtime_config.json",
            Arc::new(clock.clone()),
            Arc::new(FeedbackCollector::new(100, Verdict::Unset)),
        )
        .with_admin_token(Some("secret".into()))
        .with_trigger(
            crate::trigger::RemoteTrigger::new(Default::default(), "").unwrap(),
        );
        let state = Arc::new(state);

        let _held = state.generation_gate.try_begin(clock.now()).unwrap();
        let (status, _) = call(&state, generate_req(Some("secret"))).await;
        assert_eq!(status, StatusCode::CONFLICT);
    }

    #[test]
    fn cooldown_maps_to_429() {
        assert_eq!(
            trigger_error_status(&TriggerError::CoolingDown { remaining_secs: 10 }),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(
            trigger_error_status(&TriggerError::Rejected {
                status: 401,
                body: String::new()
            }),
            StatusCode::BAD_GATEWAY
        );
    }
}
