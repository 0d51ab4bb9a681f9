//! HTTP server surface: webhook ingestion plus read-only status endpoints.
//!
//! Grounded on the teacher's `Router::new().route(...).with_state(...).layer(...)`
//! composition and on `LazyIVQueue/api/server.py` (`LazyIVQueueServer`) for the
//! endpoint set, auth checks, and the single-object-or-array payload shape.

use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use axum::extract::{ConnectInfo, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tower::ServiceBuilder;
use tower_http::compression::CompressionLayer;
use tower_http::trace::TraceLayer;

use crate::config::Config;
use crate::dispatcher::DispatcherStats;
use crate::error::ApiError;
use crate::queue::PriorityQueue;
use crate::rarity::RarityCensus;
use crate::webhook::{Sighting, WebhookFilter};

#[derive(Clone)]
pub struct AppState {
    pub queue: Arc<PriorityQueue>,
    pub census: Arc<RarityCensus>,
    pub config: Arc<Config>,
    pub filter: Arc<WebhookFilter>,
    pub dispatcher_stats: Arc<DispatcherStats>,
}

#[derive(Debug, Deserialize)]
struct WebhookEvent {
    #[serde(rename = "type")]
    kind: String,
    message: serde_json::Value,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum WebhookBody {
    Single(WebhookEvent),
    Batch(Vec<WebhookEvent>),
}

impl WebhookBody {
    fn pokemon_messages(self) -> Vec<serde_json::Value> {
        let events = match self {
            WebhookBody::Single(e) => vec![e],
            WebhookBody::Batch(es) => es,
        };
        events.into_iter().filter(|e| e.kind == "pokemon").map(|e| e.message).collect()
    }
}

async fn webhook(State(state): State<AppState>, Json(body): Json<WebhookBody>) -> impl IntoResponse {
    for message in body.pokemon_messages() {
        match Sighting::parse(&message) {
            Some(sighting) => state.filter.scout_feed(sighting).await,
            None => tracing::debug!(?message, "dropping malformed scout-feed sighting"),
        }
    }
    (StatusCode::OK, "OK")
}

async fn webhook_census(State(state): State<AppState>, Json(body): Json<WebhookBody>) -> impl IntoResponse {
    for message in body.pokemon_messages() {
        match Sighting::parse(&message) {
            Some(sighting) => state.filter.census_feed(sighting).await,
            None => tracing::debug!(?message, "dropping malformed census-feed sighting"),
        }
    }
    (StatusCode::OK, "OK")
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "healthy" })
}

#[derive(Serialize)]
struct StatsResponse {
    queue: crate::queue::QueueStats,
    dispatcher: DispatcherStatsView,
    #[serde(skip_serializing_if = "Option::is_none")]
    rarity: Option<crate::rarity::CensusStats>,
}

#[derive(Serialize)]
struct DispatcherStatsView {
    dispatched: u64,
    succeeded: u64,
    failed: u64,
}

async fn stats(State(state): State<AppState>) -> Json<StatsResponse> {
    let rarity = if state.config.static_cfg.rarity_enabled {
        let reloadable = state.config.reloadable.load();
        let census_config = crate::rarity::CensusStatsConfig {
            calibration_minutes: reloadable.calibration_minutes,
            iv_threshold: reloadable.iv_threshold,
            cell_threshold: reloadable.cell_threshold,
            ranking_interval_seconds: reloadable.ranking_interval_seconds,
        };
        Some(state.census.stats(census_config).await)
    } else {
        None
    };

    Json(StatsResponse {
        queue: state.queue.stats().await,
        dispatcher: DispatcherStatsView {
            dispatched: state.dispatcher_stats.dispatched.load(Ordering::Relaxed),
            succeeded: state.dispatcher_stats.succeeded.load(Ordering::Relaxed),
            failed: state.dispatcher_stats.failed.load(Ordering::Relaxed),
        },
        rarity,
    })
}

#[derive(Debug, Deserialize)]
struct QueueQuery {
    count: Option<usize>,
}

async fn queue_preview(
    State(state): State<AppState>,
    Query(q): Query<QueueQuery>,
) -> Json<Vec<crate::queue::QueueEntry>> {
    let count = q.count.unwrap_or(10).min(100);
    Json(state.queue.preview(count).await)
}

#[derive(Debug, Deserialize)]
struct RarityQuery {
    area: Option<String>,
    limit: Option<usize>,
}

async fn rarity(
    State(state): State<AppState>,
    Query(q): Query<RarityQuery>,
) -> Result<Json<Vec<crate::rarity::AreaRankingEntry>>, ApiError> {
    if !state.config.static_cfg.rarity_enabled {
        return Err(ApiError::BadRequest("rarity is disabled".to_string()));
    }
    let area = q.area.unwrap_or_else(|| crate::rarity::GLOBAL_AREA.to_string());
    let limit = q.limit.unwrap_or(100).min(500);
    let iv_threshold = state.config.reloadable.load().iv_threshold;
    Ok(Json(state.census.area_rankings(&area, limit, iv_threshold).await))
}

#[derive(Serialize)]
struct ConfigResponse {
    filter_with_koji: bool,
    rarity_enabled: bool,
    iv_threshold: usize,
    cell_threshold: usize,
    concurrency_scout: usize,
    timeout_iv: u64,
    calibration_minutes: u64,
}

async fn config_summary(State(state): State<AppState>) -> Json<ConfigResponse> {
    let reloadable = state.config.reloadable.load();
    Json(ConfigResponse {
        filter_with_koji: state.config.static_cfg.filter_with_koji,
        rarity_enabled: state.config.static_cfg.rarity_enabled,
        iv_threshold: reloadable.iv_threshold,
        cell_threshold: reloadable.cell_threshold,
        concurrency_scout: reloadable.concurrency_scout,
        timeout_iv: reloadable.timeout_iv,
        calibration_minutes: reloadable.calibration_minutes,
    })
}

fn client_ip(headers: &HeaderMap, peer: SocketAddr) -> String {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|s| s.trim().to_string())
        .unwrap_or_else(|| peer.ip().to_string())
}

/// IP allow-list and header-auth check, applied only to the webhook routes.
async fn webhook_security(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    request: axum::extract::Request,
    next: Next,
) -> Response {
    if !state.config.static_cfg.allowed_ips.is_empty() {
        let ip = client_ip(&headers, peer);
        if !state.config.static_cfg.allowed_ips.iter().any(|a| a == &ip) {
            return ApiError::Forbidden.into_response();
        }
    }

    if let Some(spec) = &state.config.static_cfg.header_auth {
        if let Some((name, expected)) = spec.split_once(':') {
            let actual = headers.get(name.trim()).and_then(|v| v.to_str().ok()).unwrap_or("");
            if actual != expected.trim() {
                return ApiError::Unauthorized.into_response();
            }
        }
    }

    next.run(request).await
}

pub fn router(state: AppState) -> Router {
    let webhooks = Router::new()
        .route("/webhook", post(webhook))
        .route("/webhook/census", post(webhook_census))
        .layer(middleware::from_fn_with_state(state.clone(), webhook_security));

    Router::new()
        .merge(webhooks)
        .route("/health", get(health))
        .route("/stats", get(stats))
        .route("/queue", get(queue_preview))
        .route("/rarity", get(rarity))
        .route("/config", get(config_summary))
        .with_state(state)
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()).layer(CompressionLayer::new()))
}
