//! Status HTTP surface.
//!
//! Read-only endpoints exposing the in-memory state for operators and
//! tests, plus Prometheus metrics and liveness/readiness probes. No write
//! API exists — all state-changing interactions are chain-driven.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use axum::{
    extract::{Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::get,
    Router,
};
use eyre::eyre;
use prometheus::{Encoder, IntCounter, IntCounterVec, IntGaugeVec, Opts, Registry, TextEncoder};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tower_governor::{governor::GovernorConfigBuilder, GovernorLayer};
use tracing::info;

use crate::chain::{ChainClient, ChainRole};
use crate::coordinator::SwapCoordinator;
use crate::runlog;
use crate::verifier::{ExpectedPayment, PaymentVerifier};

/// Per-chain operational counters.
#[derive(Debug, Default, Clone, Serialize)]
pub struct ChainCounters {
    pub last_processed_block: u64,
    pub events_seen: u64,
    pub fulfillments: u64,
    pub failed_confirmations: u64,
    pub execution_timeouts: u64,
    pub terminal_submit_errors: u64,
}

/// Oracle statistics shared between the pipeline tasks and the HTTP server.
#[derive(Debug, Default, Clone, Serialize)]
pub struct OracleStats {
    pub oracle_id: String,
    pub asset: ChainCounters,
    pub payment: ChainCounters,
    pub double_spend_rejections: u64,
    /// Cancellation callbacks that reverted; a nonzero value deserves an
    /// operator's attention because it can mask a contract-level bug.
    pub cancel_reverts: u64,
    pub verifications_passed: u64,
    pub verifications_failed: u64,
}

impl OracleStats {
    pub fn chain(&self, role: ChainRole) -> &ChainCounters {
        match role {
            ChainRole::Asset => &self.asset,
            ChainRole::Payment => &self.payment,
        }
    }

    pub fn chain_mut(&mut self, role: ChainRole) -> &mut ChainCounters {
        match role {
            ChainRole::Asset => &mut self.asset,
            ChainRole::Payment => &mut self.payment,
        }
    }
}

pub type SharedStats = Arc<RwLock<OracleStats>>;
pub type SharedMetrics = Arc<Metrics>;

/// Prometheus metrics.
pub struct Metrics {
    pub events_seen_total: IntCounterVec,
    pub fulfillments_total: IntCounterVec,
    pub failed_confirmations_total: IntCounterVec,
    pub execution_timeouts_total: IntCounterVec,
    pub terminal_submit_errors_total: IntCounterVec,
    pub double_spend_rejections_total: IntCounter,
    pub cancel_revert_total: IntCounter,
    pub verifications_total: IntCounterVec,
    pub last_processed_block: IntGaugeVec,
    pub trade_table_size: IntGaugeVec,
    pub pending_events: IntGaugeVec,
    pub registry: Registry,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let events_seen_total = IntCounterVec::new(
            Opts::new(
                "oracle_time_requests_total",
                "TimeRequestSent events observed",
            ),
            &["chain"],
        )
        .expect("constant metric name is valid");

        let fulfillments_total = IntCounterVec::new(
            Opts::new("oracle_fulfillments_total", "fulfillTime callbacks sent"),
            &["chain"],
        )
        .expect("constant metric name is valid");

        let failed_confirmations_total = IntCounterVec::new(
            Opts::new(
                "oracle_failed_confirmations_total",
                "handleFailedConfirmation callbacks sent",
            ),
            &["chain"],
        )
        .expect("constant metric name is valid");

        let execution_timeouts_total = IntCounterVec::new(
            Opts::new(
                "oracle_execution_timeouts_total",
                "handleExecutionTimeout callbacks sent",
            ),
            &["chain"],
        )
        .expect("constant metric name is valid");

        let terminal_submit_errors_total = IntCounterVec::new(
            Opts::new(
                "oracle_terminal_submit_errors_total",
                "Callback submissions that failed terminally",
            ),
            &["chain"],
        )
        .expect("constant metric name is valid");

        let double_spend_rejections_total = IntCounter::new(
            "oracle_double_spend_rejections_total",
            "Creations rejected by the timeout-inversion guard",
        )
        .expect("constant metric name is valid");

        let cancel_revert_total = IntCounter::new(
            "oracle_cancel_revert_total",
            "Cancellation callbacks that reverted on-chain",
        )
        .expect("constant metric name is valid");

        let verifications_total = IntCounterVec::new(
            Opts::new(
                "oracle_verifications_total",
                "Cross-chain payment verifications by verdict",
            ),
            &["verdict"],
        )
        .expect("constant metric name is valid");

        let last_processed_block = IntGaugeVec::new(
            Opts::new(
                "oracle_last_processed_block",
                "Last block processed by the event pump",
            ),
            &["chain"],
        )
        .expect("constant metric name is valid");

        let trade_table_size = IntGaugeVec::new(
            Opts::new("oracle_trade_table_size", "In-flight trade records"),
            &["chain"],
        )
        .expect("constant metric name is valid");

        let pending_events = IntGaugeVec::new(
            Opts::new("oracle_pending_events", "Deferred events awaiting a slot"),
            &["chain"],
        )
        .expect("constant metric name is valid");

        for collector in [
            &events_seen_total,
            &fulfillments_total,
            &failed_confirmations_total,
            &execution_timeouts_total,
            &terminal_submit_errors_total,
            &verifications_total,
        ] {
            registry
                .register(Box::new(collector.clone()))
                .expect("metric registration must not be called twice");
        }
        for gauge in [&last_processed_block, &trade_table_size, &pending_events] {
            registry
                .register(Box::new(gauge.clone()))
                .expect("metric registration must not be called twice");
        }
        registry
            .register(Box::new(double_spend_rejections_total.clone()))
            .expect("metric registration must not be called twice");
        registry
            .register(Box::new(cancel_revert_total.clone()))
            .expect("metric registration must not be called twice");

        Self {
            events_seen_total,
            fulfillments_total,
            failed_confirmations_total,
            execution_timeouts_total,
            terminal_submit_errors_total,
            double_spend_rejections_total,
            cancel_revert_total,
            verifications_total,
            last_processed_block,
            trade_table_size,
            pending_events,
            registry,
        }
    }
}

/// Shared state for all handlers.
#[derive(Clone)]
pub struct AppState {
    pub stats: SharedStats,
    pub metrics: SharedMetrics,
    pub coordinator: Arc<SwapCoordinator>,
    pub asset_client: Arc<dyn ChainClient>,
    pub payment_client: Arc<dyn ChainClient>,
    pub verifier: Arc<PaymentVerifier>,
    pub log_file: Option<PathBuf>,
    pub expose_logs: bool,
    pub api_token: Option<Arc<str>>,
    pub start_time: Instant,
}

impl AppState {
    fn client(&self, role: ChainRole) -> &Arc<dyn ChainClient> {
        match role {
            ChainRole::Asset => &self.asset_client,
            ChainRole::Payment => &self.payment_client,
        }
    }
}

/// Start the status HTTP server.
pub async fn start_server(
    bind_address: &str,
    port: u16,
    rate_per_second: u64,
    rate_burst_size: u32,
    state: AppState,
) -> eyre::Result<()> {
    let governor_conf = Arc::new(
        GovernorConfigBuilder::default()
            .per_second(rate_per_second)
            .burst_size(rate_burst_size)
            .finish()
            .ok_or_else(|| eyre!("Invalid rate limit config"))?,
    );

    if state.api_token.is_some() {
        info!("STATUS_API_TOKEN set — /logs requires authentication");
    }

    let app = Router::new()
        .route("/health", get(health_handler))
        .route("/healthz", get(liveness_handler))
        .route("/readyz", get(readiness_handler))
        .route("/status", get(status_handler))
        .route("/stats", get(stats_handler))
        .route("/logs", get(logs_handler))
        .route("/trade/:id", get(trade_handler))
        .route("/payment/:id", get(payment_handler))
        .route("/verify/:tx_hash", get(verify_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
        .layer(GovernorLayer {
            config: governor_conf,
        });

    let addr: SocketAddr = format!("{}:{}", bind_address, port)
        .parse()
        .map_err(|e| eyre!("Invalid bind address {}:{}: {}", bind_address, port, e))?;
    info!("Status server listening on {}", addr);
    info!("  /health  - liveness + per-chain reachability");
    info!("  /status  - pump cursors and in-flight trades");
    info!("  /metrics - Prometheus metrics");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;

    Ok(())
}

// ─── Handlers ───────────────────────────────────────────────────────────────

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    oracle_id: String,
    asset_reachable: bool,
    payment_reachable: bool,
}

async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    let asset_reachable = chain_reachable(state.client(ChainRole::Asset)).await;
    let payment_reachable = chain_reachable(state.client(ChainRole::Payment)).await;
    let stats = state.stats.read().await;

    Json(HealthResponse {
        status: if asset_reachable && payment_reachable {
            "healthy".to_string()
        } else {
            "degraded".to_string()
        },
        oracle_id: stats.oracle_id.clone(),
        asset_reachable,
        payment_reachable,
    })
}

async fn chain_reachable(client: &Arc<dyn ChainClient>) -> bool {
    tokio::time::timeout(std::time::Duration::from_secs(5), client.block_number())
        .await
        .map(|r| r.is_ok())
        .unwrap_or(false)
}

async fn liveness_handler() -> &'static str {
    "OK"
}

async fn readiness_handler(State(state): State<AppState>) -> &'static str {
    let stats = state.stats.read().await;
    // Ready once both pumps have recorded a head
    if stats.asset.last_processed_block > 0 && stats.payment.last_processed_block > 0 {
        "OK"
    } else {
        "NOT_READY"
    }
}

async fn chain_status(state: &AppState, role: ChainRole) -> serde_json::Value {
    let store = state.coordinator.store(role);
    let current_block = state.client(role).block_number().await.ok();
    let stats = state.stats.read().await;

    serde_json::json!({
        "last_processed_block": stats.chain(role).last_processed_block,
        "current_block": current_block,
        "active_trade_ids": store
            .active_trade_ids()
            .iter()
            .map(|id| id.to_string())
            .collect::<Vec<_>>(),
        "pending_events_count": store.pending_event_count(),
    })
}

async fn status_handler(State(state): State<AppState>) -> Json<serde_json::Value> {
    let asset = chain_status(&state, ChainRole::Asset).await;
    let payment = chain_status(&state, ChainRole::Payment).await;

    let mappings: serde_json::Map<String, serde_json::Value> = state
        .coordinator
        .pairs()
        .snapshot()
        .into_iter()
        .map(|pair| {
            (
                pair.asset_trade_id.to_string(),
                serde_json::json!({
                    "asset_trade_id": pair.asset_trade_id.to_string(),
                    "payment_trade_id": pair.payment_trade_id.to_string(),
                }),
            )
        })
        .collect();

    Json(serde_json::json!({
        "asset": asset,
        "payment": payment,
        "cross_chain_mappings": mappings,
        "log_file": state.log_file.as_ref().map(|p| p.display().to_string()),
    }))
}

fn chain_table_stats(state: &AppState, role: ChainRole) -> serde_json::Value {
    let store = state.coordinator.store(role);
    let snapshot = store.snapshot();
    let oldest = snapshot.iter().map(|r| r.inception_time).min();
    let newest = snapshot.iter().map(|r| r.inception_time).max();

    serde_json::json!({
        "trade_count": snapshot.len(),
        "oldest_trade_inception": oldest,
        "newest_trade_inception": newest,
        "pending_events": store.pending_event_count(),
    })
}

async fn stats_handler(State(state): State<AppState>) -> Json<serde_json::Value> {
    let stats = state.stats.read().await.clone();

    Json(serde_json::json!({
        "uptime_seconds": state.start_time.elapsed().as_secs(),
        "memory_resident_bytes": memory_resident_bytes(),
        "counters": stats,
        "asset": chain_table_stats(&state, ChainRole::Asset),
        "payment": chain_table_stats(&state, ChainRole::Payment),
        "pair_count": state.coordinator.pairs().snapshot().len(),
    }))
}

/// Resident set size from procfs; `None` off Linux.
fn memory_resident_bytes() -> Option<u64> {
    let statm = std::fs::read_to_string("/proc/self/statm").ok()?;
    let resident_pages: u64 = statm.split_whitespace().nth(1)?.parse().ok()?;
    Some(resident_pages * 4096)
}

#[derive(Deserialize)]
struct LogsQuery {
    limit: Option<usize>,
}

async fn logs_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<LogsQuery>,
) -> Response {
    if !state.expose_logs {
        return (StatusCode::NOT_FOUND, "log endpoint disabled").into_response();
    }
    if let Err(resp) = check_bearer(&state, &headers) {
        return resp;
    }

    let Some(path) = state.log_file.as_ref() else {
        return (StatusCode::NOT_FOUND, "no run log configured").into_response();
    };

    let limit = query.limit.unwrap_or(100).min(1000);
    match runlog::tail(path, limit) {
        Ok(lines) => Json(serde_json::json!({
            "log_file": path.display().to_string(),
            "lines": lines,
        }))
        .into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("failed to read log: {e}"),
        )
            .into_response(),
    }
}

/// Bearer-token gate in the operator-API style; open when no token is set.
fn check_bearer(state: &AppState, headers: &HeaderMap) -> Result<(), Response> {
    let Some(expected) = state.api_token.as_deref() else {
        return Ok(());
    };
    let provided = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));
    if provided == Some(expected) {
        Ok(())
    } else {
        Err((StatusCode::UNAUTHORIZED, "invalid or missing bearer token").into_response())
    }
}

async fn trade_handler(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    lookup_handler(state, id, ChainRole::Asset).await
}

async fn payment_handler(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    lookup_handler(state, id, ChainRole::Payment).await
}

/// On-chain view of one leg plus, when paired, the other leg.
async fn lookup_handler(state: AppState, id: String, role: ChainRole) -> Response {
    let Ok(trade_id) = id.parse::<alloy::primitives::U256>() else {
        return (StatusCode::BAD_REQUEST, "invalid trade id").into_response();
    };

    let primary = match role {
        ChainRole::Asset => state
            .asset_client
            .get_trade(trade_id)
            .await
            .map(|t| serde_json::to_value(t).unwrap_or_default()),
        ChainRole::Payment => state
            .payment_client
            .get_payment(trade_id)
            .await
            .map(|p| serde_json::to_value(p).unwrap_or_default()),
    };

    let primary = match primary {
        Ok(v) => v,
        Err(e) => {
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("chain read failed: {e}"),
            )
                .into_response()
        }
    };

    let paired = match state.coordinator.pairs().get(trade_id) {
        Some(pair) => {
            let peer_role = role.other();
            let peer_id = pair.leg(peer_role);
            match peer_role {
                ChainRole::Asset => state
                    .asset_client
                    .get_trade(peer_id)
                    .await
                    .ok()
                    .flatten()
                    .map(|t| serde_json::to_value(t).unwrap_or_default()),
                ChainRole::Payment => state
                    .payment_client
                    .get_payment(peer_id)
                    .await
                    .ok()
                    .flatten()
                    .map(|p| serde_json::to_value(p).unwrap_or_default()),
            }
        }
        None => None,
    };

    let (primary_key, paired_key) = match role {
        ChainRole::Asset => ("trade", "payment"),
        ChainRole::Payment => ("payment", "trade"),
    };

    let mut body = serde_json::Map::new();
    body.insert(
        "trade_id".to_string(),
        serde_json::Value::String(trade_id.to_string()),
    );
    body.insert(primary_key.to_string(), primary);
    body.insert(
        paired_key.to_string(),
        paired.unwrap_or(serde_json::Value::Null),
    );

    Json(serde_json::Value::Object(body)).into_response()
}

#[derive(Deserialize)]
struct VerifyQuery {
    payment_id: String,
    /// Transferred value in wei; selects the confirmation depth.
    value: Option<String>,
    recipient: Option<String>,
    amount: Option<String>,
}

/// Operator-invoked audit hook: run the full payment-release verification
/// pipeline for a transaction hash. Read-only; the verdict never mutates
/// trade state.
async fn verify_handler(
    State(state): State<AppState>,
    Path(tx_hash): Path<String>,
    Query(query): Query<VerifyQuery>,
) -> Response {
    let Ok(tx_hash) = tx_hash.parse::<alloy::primitives::B256>() else {
        return (StatusCode::BAD_REQUEST, "invalid transaction hash").into_response();
    };
    let Ok(payment_id) = query.payment_id.parse::<alloy::primitives::U256>() else {
        return (StatusCode::BAD_REQUEST, "invalid payment id").into_response();
    };
    let value = match &query.value {
        Some(raw) => match raw.parse::<alloy::primitives::U256>() {
            Ok(v) => v,
            Err(_) => return (StatusCode::BAD_REQUEST, "invalid value").into_response(),
        },
        None => alloy::primitives::U256::ZERO,
    };
    let recipient = match &query.recipient {
        Some(raw) => match raw.parse::<alloy::primitives::Address>() {
            Ok(a) => Some(a),
            Err(_) => return (StatusCode::BAD_REQUEST, "invalid recipient").into_response(),
        },
        None => None,
    };
    let amount = match &query.amount {
        Some(raw) => match raw.parse::<alloy::primitives::U256>() {
            Ok(a) => Some(a),
            Err(_) => return (StatusCode::BAD_REQUEST, "invalid amount").into_response(),
        },
        None => None,
    };

    let expected = ExpectedPayment {
        payment_id,
        recipient,
        amount,
    };
    let verdict = state.verifier.verify(tx_hash, value, &expected).await;
    Json(verdict).into_response()
}

async fn metrics_handler(State(state): State<AppState>) -> Response {
    // Refresh gauges from current state at scrape time
    let stats = state.stats.read().await;
    for role in [ChainRole::Asset, ChainRole::Payment] {
        let store = state.coordinator.store(role);
        state
            .metrics
            .last_processed_block
            .with_label_values(&[role.label()])
            .set(stats.chain(role).last_processed_block as i64);
        state
            .metrics
            .trade_table_size
            .with_label_values(&[role.label()])
            .set(store.trade_count() as i64);
        state
            .metrics
            .pending_events
            .with_label_values(&[role.label()])
            .set(store.pending_event_count() as i64);
    }
    drop(stats);

    let encoder = TextEncoder::new();
    let metric_families = state.metrics.registry.gather();
    let mut buffer = Vec::new();

    if encoder.encode(&metric_families, &mut buffer).is_err() {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            "Failed to encode metrics",
        )
            .into_response();
    }

    match Response::builder()
        .header(header::CONTENT_TYPE, encoder.format_type())
        .body(axum::body::Body::from(buffer))
    {
        Ok(resp) => resp,
        Err(_) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            "Failed to build metrics response",
        )
            .into_response(),
    }
}
