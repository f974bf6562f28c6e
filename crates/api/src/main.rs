use std::sync::Arc;

use anyhow::Context;
use tracing::info;

use tidemark_api::app::{build_app, services::build_services};
use tidemark_infra::config::AppConfig;
use tidemark_observability::LogFormat;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let config = AppConfig::load().context("failed to load configuration")?;

    let format = config.logging.format.parse::<LogFormat>().unwrap_or_else(|err| {
        eprintln!("{err}; falling back to json");
        LogFormat::Json
    });
    tidemark_observability::init(format, &config.logging.filter);

    config.validate().context("invalid configuration")?;

    let services = Arc::new(build_services(&config).await?);
    services.start_ingest().await?;

    let app = build_app(services.clone());

    let addr = config.server.bind_addr();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;

    info!(addr = %listener.local_addr()?, topic = %services.topic, "listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    services.shutdown().await;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %err, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    info!("shutdown requested");
}
