use std::net::SocketAddr;

use tracing::info;

use k2proxy_core::ProxyConfig;
use k2proxy_gateway::{bootstrap, build_router};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // config path: K2PROXY_CONFIG env > ./k2proxy.toml; K2PROXY_* env vars
    // override individual options either way
    let config_path = std::env::var("K2PROXY_CONFIG").ok();
    let config = ProxyConfig::load(config_path.as_deref())?;

    let default_filter = if config.debug_logging {
        "k2proxy_gateway=debug,k2proxy_pool=debug,k2proxy_relay=debug,tower_http=debug"
    } else {
        "k2proxy_gateway=info,k2proxy_pool=info,k2proxy_relay=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .init();

    let bind = config.host.clone();
    let port = config.port;
    let state = bootstrap(config)?;
    let refresher_task = state.refresher.start();
    let router = build_router(state.clone());

    let addr: SocketAddr = format!("{bind}:{port}").parse()?;
    info!("k2proxy listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    state.refresher.stop();
    let _ = refresher_task.await;
    Ok(())
}
