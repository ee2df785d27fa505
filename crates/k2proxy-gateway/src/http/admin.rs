//! Admin surface over pool and refresher state. Sits behind the same
//! client key check as the chat endpoint.

use axum::{
    extract::{Path, State},
    http::HeaderMap,
    Json,
};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::info;

use k2proxy_pool::store;

use crate::app::AppState;
use crate::auth::check_client_auth;
use crate::error::ApiError;

/// GET /admin/tokens/stats
pub async fn token_stats(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<Value>, ApiError> {
    check_client_auth(&headers, &state.config)?;
    let stats = state.pool.stats();
    Ok(Json(serde_json::to_value(stats).unwrap_or_default()))
}

/// POST /admin/tokens/reload — re-read the token file and atomically
/// replace the pool. A read failure leaves the pool untouched.
pub async fn reload_tokens(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<Value>, ApiError> {
    check_client_auth(&headers, &state.config)?;
    let tokens = store::read_tokens(&state.config.tokens_file)
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    let total = tokens.len();
    state.pool.replace(tokens);
    info!(tokens = total, "token pool reloaded from disk");
    Ok(Json(json!({ "status": "ok", "total": total })))
}

/// POST /admin/tokens/reset/{index}
pub async fn reset_token(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(index): Path<usize>,
) -> Result<Json<Value>, ApiError> {
    check_client_auth(&headers, &state.config)?;
    state
        .pool
        .reset(index)
        .map_err(|e| ApiError::BadRequest(e.to_string()))?;
    Ok(Json(json!({ "status": "ok", "index": index })))
}

/// POST /admin/tokens/reset-all
pub async fn reset_all_tokens(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<Value>, ApiError> {
    check_client_auth(&headers, &state.config)?;
    state.pool.reset_all();
    Ok(Json(json!({ "status": "ok" })))
}

/// GET /admin/tokens/updater/status
pub async fn updater_status(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<Value>, ApiError> {
    check_client_auth(&headers, &state.config)?;
    let status = state.refresher.status();
    Ok(Json(serde_json::to_value(status).unwrap_or_default()))
}

/// POST /admin/tokens/updater/force-update — returns after scheduling,
/// never waits for the refresh itself.
pub async fn updater_force_update(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<Value>, ApiError> {
    check_client_auth(&headers, &state.config)?;
    state.refresher.force_update();
    Ok(Json(json!({ "status": "scheduled" })))
}
