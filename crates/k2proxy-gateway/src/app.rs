use std::sync::Arc;
use std::time::Duration;

use axum::{
    routing::{get, post},
    Router,
};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::info;

use k2proxy_core::ProxyConfig;
use k2proxy_pool::{store, RefresherSettings, TokenPool, TokenRefresher};
use k2proxy_relay::UpstreamClient;

/// Central shared state — passed as Arc<AppState> to all Axum handlers.
pub struct AppState {
    pub config: ProxyConfig,
    pub pool: Arc<TokenPool>,
    pub refresher: TokenRefresher,
    pub upstream: Arc<UpstreamClient>,
}

/// Wire the runtime pieces from a validated config: initial pool load from
/// the token file, the shared upstream client, and the refresher (started
/// by the caller).
pub fn bootstrap(config: ProxyConfig) -> anyhow::Result<Arc<AppState>> {
    let tokens = store::read_tokens(&config.tokens_file)?;
    info!(tokens = tokens.len(), path = %config.tokens_file, "loaded token pool");

    let pool = Arc::new(TokenPool::new(tokens, config.max_token_failures));
    let upstream = Arc::new(UpstreamClient::new(&config)?);
    let refresher = TokenRefresher::new(
        pool.clone(),
        upstream.clone(),
        RefresherSettings {
            tokens_file: config.tokens_file.clone(),
            accounts_file: config.accounts_file.clone(),
            interval: Duration::from_secs(config.token_update_interval_seconds),
            enabled: config.enable_token_auto_update,
        },
    );

    Ok(Arc::new(AppState {
        config,
        pool,
        refresher,
        upstream,
    }))
}

/// Assemble the full Axum router.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/v1/chat/completions", post(crate::http::chat::chat_completions))
        .route("/v1/models", get(crate::http::models::list_models))
        .route("/health", get(crate::http::health::health_handler))
        .route("/admin/tokens/stats", get(crate::http::admin::token_stats))
        .route("/admin/tokens/reload", post(crate::http::admin::reload_tokens))
        .route(
            "/admin/tokens/reset/{index}",
            post(crate::http::admin::reset_token),
        )
        .route(
            "/admin/tokens/reset-all",
            post(crate::http::admin::reset_all_tokens),
        )
        .route(
            "/admin/tokens/updater/status",
            get(crate::http::admin::updater_status),
        )
        .route(
            "/admin/tokens/updater/force-update",
            post(crate::http::admin::updater_force_update),
        )
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
