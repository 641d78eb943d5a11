// =============================================================================
// Signal Deck — Main Entry Point
// =============================================================================
//
// Polls the signals feed, runs one lifecycle per displayed signal, and serves
// the resulting board to the dashboard. Ctrl+C stops the poll loop, cancels
// every ticker, and persists feedback history and configuration.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod api;
mod app_state;
mod clock;
mod coordinator;
mod feed;
mod feedback;
mod lifecycle;
mod runtime_config;
mod selection;
mod trigger;
mod types;

use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::app_state::AppState;
use crate::clock::{Clock, SystemClock};
use crate::feed::{FeedClient, SnapshotCache};
use crate::feedback::FeedbackCollector;
use crate::runtime_config::RuntimeConfig;
use crate::trigger::RemoteTrigger;

const DEFAULT_CONFIG_PATH: &str = "runtime_config.json";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("╔══════════════════════════════════════════════════════════╗");
    info!("║              Signal Deck — Starting Up                   ║");
    info!("╚══════════════════════════════════════════════════════════╝");

    let config_path =
        std::env::var("SIGNAL_DECK_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.into());

    let mut config = RuntimeConfig::load(&config_path).unwrap_or_else(|e| {
        warn!(error = %e, "Failed to load config, using defaults");
        RuntimeConfig::default()
    });

    if let Ok(url) = std::env::var("SIGNAL_DECK_FEED_URL") {
        if !url.trim().is_empty() {
            config.feed_url = url.trim().to_string();
        }
    }
    if let Ok(addr) = std::env::var("SIGNAL_DECK_BIND_ADDR") {
        if !addr.trim().is_empty() {
            config.bind_addr = addr.trim().to_string();
        }
    }

    info!(
        feed_url = %config.feed_url,
        poll_interval_secs = config.poll_interval_secs,
        confidence_threshold = config.confidence_threshold,
        max_displayed = config.max_displayed,
        max_age_secs = ?config.max_age_secs,
        feedback_window_secs = config.feedback_window_secs,
        timeout_verdict = %config.timeout_verdict,
        display_offset = %config.display_zone().offset(),
        "Configuration resolved"
    );

    // ── 2. Feedback history ──────────────────────────────────────────────
    let feedback = match FeedbackCollector::with_store(
        config.history_capacity,
        config.timeout_verdict,
        &config.feedback_store_path,
    ) {
        Ok(c) => c,
        Err(e) => {
            error!(error = %e, "Feedback history unreadable — starting with an empty one");
            FeedbackCollector::new(config.history_capacity, config.timeout_verdict)
        }
    };
    let feedback = Arc::new(feedback);

    // ── 3. Feed access ───────────────────────────────────────────────────
    let feed_client = FeedClient::new(config.feed_url.clone())?;
    let snapshot_cache = SnapshotCache::new(config.snapshot_cache_path.clone());

    // ── 4. Remote trigger (optional) ─────────────────────────────────────
    let trigger = if config.trigger.is_configured() {
        let token = std::env::var("GITHUB_TOKEN").unwrap_or_default();
        if token.is_empty() {
            warn!("GITHUB_TOKEN is not set — workflow dispatch will be rejected upstream");
        }
        match RemoteTrigger::new(config.trigger.clone(), &token) {
            Ok(t) => Some(t),
            Err(e) => {
                error!(error = %e, "Remote trigger disabled");
                None
            }
        }
    } else {
        info!("Remote trigger not configured — generation endpoint disabled");
        None
    };

    // ── 5. Build shared state ────────────────────────────────────────────
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let bind_addr = config.bind_addr.clone();

    let mut state = AppState::new(config, config_path.clone(), clock, feedback.clone())
        .with_admin_token(std::env::var("SIGNAL_DECK_ADMIN_TOKEN").ok());
    if let Some(t) = trigger {
        state = state.with_trigger(t);
    }
    let state = Arc::new(state);

    // ── 6. Poll loop ─────────────────────────────────────────────────────
    let poll_handle = tokio::spawn(coordinator::run_poll_loop(
        state.clone(),
        feed_client,
        snapshot_cache,
    ));

    // ── 7. API server ────────────────────────────────────────────────────
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .map_err(|e| anyhow::anyhow!("failed to bind API server on {bind_addr}: {e}"))?;
    info!(addr = %bind_addr, "API server listening");

    let app = api::rest::router(state.clone());
    let mut api_shutdown = state.subscribe_shutdown();
    let api_handle = tokio::spawn(async move {
        let serve = axum::serve(listener, app).with_graceful_shutdown(async move {
            while !*api_shutdown.borrow() {
                if api_shutdown.changed().await.is_err() {
                    break;
                }
            }
        });
        if let Err(e) = serve.await {
            error!(error = %e, "API server failed");
        }
    });

    info!("All subsystems running. Press Ctrl+C to stop.");

    // ── 8. Graceful shutdown ─────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    warn!("Shutdown signal received — stopping gracefully");

    state.trigger_shutdown();

    if let Err(e) = poll_handle.await {
        error!(error = %e, "Poll loop task ended abnormally");
    }
    // Covers the case where the poll loop had already died.
    state.coordinator.shutdown();

    if let Err(e) = api_handle.await {
        error!(error = %e, "API server task ended abnormally");
    }

    if let Err(e) = feedback.persist() {
        error!(error = %e, "Failed to save feedback history on shutdown");
    }
    if let Err(e) = state.runtime_config.read().save(&state.config_path) {
        error!(error = %e, "Failed to save runtime config on shutdown");
    }

    info!("Signal Deck shut down complete.");
    Ok(())
}
