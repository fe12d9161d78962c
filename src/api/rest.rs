// =============================================================================
// REST API Endpoints — Axum
// =============================================================================
//
// `/health` is public; `/admin/*` takes the static operator token; every
// other route takes a session bearer token (header or `?token=`), which also
// spends one rate-limit unit. CORS is permissive for development.
// =============================================================================

use std::sync::Arc;

use axum::extract::{Json, Query, State};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::Router;
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use super::auth::{AdminBearer, AuthSession};
use super::{ApiError, ApiResult, AppCtx};
use crate::engine::{MarketOrderRequest, PendingOrderRequest};
use crate::errors::CoreError;
use crate::ohlc::Timeframe;
use crate::types::{ExecutionMode, OrderType, Side, TimeInForce};

// =============================================================================
// Router construction
// =============================================================================

pub fn router(ctx: Arc<AppCtx>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // ── Public ──────────────────────────────────────────────────
        .route("/health", get(health))
        .route("/api/login", post(login))
        // ── Authenticated ───────────────────────────────────────────
        .route("/api/logout", post(logout))
        .route("/api/account/summary", get(account_summary))
        .route("/api/orders/market", post(place_market))
        .route("/api/orders/limit", post(place_limit))
        .route("/api/orders/stop", post(place_stop))
        .route("/api/orders/cancel", post(cancel_order))
        .route("/api/orders", get(list_orders))
        .route("/api/positions", get(list_positions))
        .route("/api/positions/close", post(close_position))
        .route("/api/positions/modify", post(modify_position))
        .route("/api/trades/history", get(trade_history))
        .route("/api/ledger", get(ledger))
        .route("/api/ticks", get(ticks))
        .route("/ohlc", get(ohlc))
        // ── Admin ───────────────────────────────────────────────────
        .route("/admin/execution-mode", post(set_execution_mode))
        // ── WebSocket ───────────────────────────────────────────────
        .route("/ws", get(super::ws::ws_handler))
        // ── Middleware & State ──────────────────────────────────────
        .layer(cors)
        .with_state(ctx)
}

// =============================================================================
// Health (public)
// =============================================================================

async fn health(State(ctx): State<Arc<AppCtx>>) -> impl IntoResponse {
    let report = ctx.supervisor.health();
    Json(serde_json::json!({
        "status": report.status,
        "server_time": report.server_time,
        "components": report.components,
        "aggregator": ctx.aggregator_stats.snapshot(),
        "distributor": ctx.distributor.snapshot(),
    }))
}

// =============================================================================
// Login / logout
// =============================================================================

#[derive(Deserialize)]
struct LoginRequest {
    #[serde(default)]
    account_id: Option<String>,
    #[serde(default)]
    password: Option<String>,
    /// Alternative to password login: an externally signed assertion.
    #[serde(default)]
    sso_assertion: Option<String>,
}

async fn login(
    State(ctx): State<Arc<AppCtx>>,
    Json(req): Json<LoginRequest>,
) -> ApiResult<impl IntoResponse> {
    let issued = match (req.account_id, req.password, req.sso_assertion) {
        (_, _, Some(assertion)) => ctx.sessions.login_sso(&assertion)?,
        (Some(account_id), Some(password), None) => ctx.sessions.login(&account_id, &password)?,
        _ => {
            return Err(ApiError(CoreError::MalformedMessage(
                "login requires account_id+password or sso_assertion".into(),
            )))
        }
    };
    Ok(Json(issued))
}

async fn logout(
    auth: AuthSession,
    State(ctx): State<Arc<AppCtx>>,
) -> impl IntoResponse {
    ctx.sessions.logout(&auth.token);
    Json(serde_json::json!({ "status": "ok" }))
}

// =============================================================================
// Account summary
// =============================================================================

#[derive(Deserialize)]
struct AccountQuery {
    #[serde(rename = "accountId")]
    #[serde(default)]
    account_id: Option<String>,
}

/// The token's account unless the query names the same one. A token never
/// reads another account.
fn resolve_account(auth: &AuthSession, requested: Option<&str>) -> ApiResult<String> {
    match requested {
        None => Ok(auth.account_id.clone()),
        Some(id) if id == auth.account_id => Ok(auth.account_id.clone()),
        Some(_) => Err(ApiError(CoreError::Forbidden)),
    }
}

#[derive(Serialize)]
struct AccountSummary {
    account_id: String,
    currency: String,
    balance: f64,
    equity: f64,
    used_margin: f64,
    free_margin: f64,
    margin_level: Option<f64>,
    open_positions: usize,
    pending_orders: usize,
    margin_mode: String,
    status: String,
}

async fn account_summary(
    auth: AuthSession,
    State(ctx): State<Arc<AppCtx>>,
    Query(query): Query<AccountQuery>,
) -> ApiResult<impl IntoResponse> {
    let account_id = resolve_account(&auth, query.account_id.as_deref())?;
    let account = ctx.engine.shared.accounts.require(&account_id)?;
    let metrics = ctx.engine.shared.metrics(&ctx.registry, &account);
    Ok(Json(AccountSummary {
        account_id: account.id.clone(),
        currency: account.currency.clone(),
        balance: metrics.balance,
        equity: metrics.equity,
        used_margin: metrics.used_margin,
        free_margin: metrics.free_margin,
        margin_level: metrics.margin_level,
        open_positions: metrics.open_positions,
        pending_orders: ctx.engine.shared.orders_for(&account_id).len(),
        margin_mode: account.margin_mode.to_string(),
        status: account.status.to_string(),
    }))
}

// =============================================================================
// Orders
// =============================================================================

#[derive(Deserialize)]
struct MarketOrderBody {
    symbol: String,
    side: Side,
    volume: f64,
    #[serde(default)]
    stop_loss: Option<f64>,
    #[serde(default)]
    take_profit: Option<f64>,
}

/// Order intake stops first during graceful shutdown.
fn gate_shutdown(ctx: &AppCtx) -> ApiResult<()> {
    if ctx.supervisor.is_shutting_down() {
        return Err(ApiError(CoreError::ServerBusy));
    }
    Ok(())
}

async fn place_market(
    auth: AuthSession,
    State(ctx): State<Arc<AppCtx>>,
    Json(body): Json<MarketOrderBody>,
) -> ApiResult<impl IntoResponse> {
    gate_shutdown(&ctx)?;
    let fill = ctx
        .order_router
        .place_market(MarketOrderRequest {
            account_id: auth.account_id,
            symbol: body.symbol,
            side: body.side,
            volume: body.volume,
            stop_loss: body.stop_loss,
            take_profit: body.take_profit,
        })
        .await?;
    Ok(Json(fill))
}

#[derive(Deserialize)]
struct PendingOrderBody {
    symbol: String,
    side: Side,
    volume: f64,
    #[serde(default)]
    limit_price: Option<f64>,
    #[serde(default)]
    stop_price: Option<f64>,
    #[serde(default)]
    trail_distance: Option<f64>,
    #[serde(default)]
    stop_loss: Option<f64>,
    #[serde(default)]
    take_profit: Option<f64>,
    #[serde(default)]
    tif: TimeInForce,
    /// STOP_LIMIT / TRAILING_STOP refinements of the stop endpoint.
    #[serde(default)]
    order_type: Option<OrderType>,
}

async fn place_limit(
    auth: AuthSession,
    State(ctx): State<Arc<AppCtx>>,
    Json(body): Json<PendingOrderBody>,
) -> ApiResult<impl IntoResponse> {
    gate_shutdown(&ctx)?;
    let order = ctx
        .engine
        .pending(PendingOrderRequest {
            account_id: auth.account_id,
            symbol: body.symbol,
            order_type: OrderType::Limit,
            side: body.side,
            volume: body.volume,
            limit_price: body.limit_price,
            stop_price: None,
            trail_distance: None,
            stop_loss: body.stop_loss,
            take_profit: body.take_profit,
            tif: body.tif,
        })
        .await?;
    Ok(Json(order))
}

async fn place_stop(
    auth: AuthSession,
    State(ctx): State<Arc<AppCtx>>,
    Json(body): Json<PendingOrderBody>,
) -> ApiResult<impl IntoResponse> {
    gate_shutdown(&ctx)?;
    let order_type = match body.order_type {
        Some(OrderType::StopLimit) => OrderType::StopLimit,
        Some(OrderType::TrailingStop) => OrderType::TrailingStop,
        _ => OrderType::Stop,
    };
    let order = ctx
        .engine
        .pending(PendingOrderRequest {
            account_id: auth.account_id,
            symbol: body.symbol,
            order_type,
            side: body.side,
            volume: body.volume,
            limit_price: body.limit_price,
            stop_price: body.stop_price,
            trail_distance: body.trail_distance,
            stop_loss: body.stop_loss,
            take_profit: body.take_profit,
            tif: body.tif,
        })
        .await?;
    Ok(Json(order))
}

#[derive(Deserialize)]
struct CancelOrderBody {
    order_id: String,
}

async fn cancel_order(
    auth: AuthSession,
    State(ctx): State<Arc<AppCtx>>,
    Json(body): Json<CancelOrderBody>,
) -> ApiResult<impl IntoResponse> {
    let order = ctx.engine.cancel_order(&auth.account_id, &body.order_id).await?;
    Ok(Json(order))
}

async fn list_orders(
    auth: AuthSession,
    State(ctx): State<Arc<AppCtx>>,
    Query(query): Query<AccountQuery>,
) -> ApiResult<impl IntoResponse> {
    let account_id = resolve_account(&auth, query.account_id.as_deref())?;
    Ok(Json(ctx.engine.shared.orders_for(&account_id)))
}

// =============================================================================
// Positions
// =============================================================================

async fn list_positions(
    auth: AuthSession,
    State(ctx): State<Arc<AppCtx>>,
    Query(query): Query<AccountQuery>,
) -> ApiResult<impl IntoResponse> {
    let account_id = resolve_account(&auth, query.account_id.as_deref())?;
    Ok(Json(ctx.engine.shared.open_positions_for(&account_id)))
}

#[derive(Deserialize)]
struct ClosePositionBody {
    position_id: String,
    /// Omitted = full close.
    #[serde(default)]
    volume: Option<f64>,
}

async fn close_position(
    auth: AuthSession,
    State(ctx): State<Arc<AppCtx>>,
    Json(body): Json<ClosePositionBody>,
) -> ApiResult<impl IntoResponse> {
    let report = ctx
        .engine
        .close(&auth.account_id, &body.position_id, body.volume)
        .await?;
    Ok(Json(report))
}

#[derive(Deserialize)]
struct ModifyPositionBody {
    position_id: String,
    #[serde(default)]
    stop_loss: Option<f64>,
    #[serde(default)]
    take_profit: Option<f64>,
}

async fn modify_position(
    auth: AuthSession,
    State(ctx): State<Arc<AppCtx>>,
    Json(body): Json<ModifyPositionBody>,
) -> ApiResult<impl IntoResponse> {
    let position = ctx
        .engine
        .modify(
            &auth.account_id,
            &body.position_id,
            body.stop_loss,
            body.take_profit,
        )
        .await?;
    Ok(Json(position))
}

// =============================================================================
// History
// =============================================================================

#[derive(Deserialize)]
struct HistoryQuery {
    #[serde(rename = "accountId")]
    #[serde(default)]
    account_id: Option<String>,
    #[serde(default = "default_history_limit")]
    limit: usize,
}

fn default_history_limit() -> usize {
    100
}

async fn trade_history(
    auth: AuthSession,
    State(ctx): State<Arc<AppCtx>>,
    Query(query): Query<HistoryQuery>,
) -> ApiResult<impl IntoResponse> {
    let account_id = resolve_account(&auth, query.account_id.as_deref())?;
    Ok(Json(ctx.engine.shared.closed_for(&account_id, query.limit)))
}

async fn ledger(
    auth: AuthSession,
    State(ctx): State<Arc<AppCtx>>,
    Query(query): Query<HistoryQuery>,
) -> ApiResult<impl IntoResponse> {
    let account_id = resolve_account(&auth, query.account_id.as_deref())?;
    Ok(Json(
        ctx.engine.shared.accounts.entries_for(&account_id, query.limit),
    ))
}

// =============================================================================
// Ticks
// =============================================================================

#[derive(Deserialize)]
struct TicksQuery {
    symbol: String,
    #[serde(default = "default_ticks_limit")]
    limit: usize,
    /// Optional time-range read (epoch ms, half-open).
    #[serde(default)]
    from: Option<i64>,
    #[serde(default)]
    to: Option<i64>,
}

fn default_ticks_limit() -> usize {
    100
}

async fn ticks(
    _auth: AuthSession,
    State(ctx): State<Arc<AppCtx>>,
    Query(query): Query<TicksQuery>,
) -> ApiResult<impl IntoResponse> {
    if !ctx.registry.contains(&query.symbol) {
        return Err(ApiError(CoreError::UnknownSymbol(query.symbol)));
    }
    let ticks = match (query.from, query.to) {
        (Some(from), to) => {
            ctx.tick_store
                .range(&query.symbol, from, to.unwrap_or(i64::MAX))
        }
        _ => ctx.tick_store.last_n(&query.symbol, query.limit.min(5_000)),
    };
    Ok(Json(ticks))
}

// =============================================================================
// OHLC
// =============================================================================

#[derive(Deserialize)]
struct OhlcQuery {
    symbol: String,
    timeframe: String,
    #[serde(default = "default_ohlc_limit")]
    limit: usize,
}

fn default_ohlc_limit() -> usize {
    200
}

async fn ohlc(
    _auth: AuthSession,
    State(ctx): State<Arc<AppCtx>>,
    Query(query): Query<OhlcQuery>,
) -> ApiResult<impl IntoResponse> {
    let tf: Timeframe = query
        .timeframe
        .parse()
        .map_err(|e: String| ApiError(CoreError::MalformedMessage(e)))?;
    if !ctx.registry.contains(&query.symbol) {
        return Err(ApiError(CoreError::UnknownSymbol(query.symbol)));
    }
    Ok(Json(ctx.ohlc.bars(&query.symbol, tf, query.limit.min(5_000))))
}

// =============================================================================
// Admin
// =============================================================================

#[derive(Deserialize)]
struct ExecutionModeBody {
    mode: ExecutionMode,
}

async fn set_execution_mode(
    _admin: AdminBearer,
    State(ctx): State<Arc<AppCtx>>,
    Json(body): Json<ExecutionModeBody>,
) -> impl IntoResponse {
    info!(mode = %body.mode, "admin execution-mode switch");
    ctx.order_router.set_mode(body.mode);
    Json(serde_json::json!({ "status": "ok", "mode": body.mode }))
}
