use std::net::SocketAddr;
use std::sync::Arc;

use broker_http_proxy::{config::Config, router, AppState};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    tracing_subscriber::fmt().with_env_filter(EnvFilter::from_default_env()).init();

    let config = Config::from_env().map_err(|e| anyhow::anyhow!(e.to_string()))?;
    let audit_dir = std::env::var("AUDIT_LOG_DIR").unwrap_or_else(|_| "/var/log/broker".to_string());
    let bind = config.bind;

    let state = Arc::new(AppState::new(config, audit_dir));
    let app = router(state);

    tracing::info!(%bind, "broker-http-proxy listening");
    let listener = tokio::net::TcpListener::bind(bind).await?;
    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>()).await?;
    Ok(())
}
