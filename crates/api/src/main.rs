use std::sync::Arc;

use anyhow::Context;

use lcbackup_infra::config::AppConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    lcbackup_observability::init();

    let config = AppConfig::load().context("failed to load configuration")?;
    let addr = config.bind_addr()?;

    let services = Arc::new(
        lcbackup_api::app::build_services(&config)
            .await
            .context("failed to wire services")?,
    );
    services.start_runners().context("failed to start job runners")?;

    let app = lcbackup_api::app::build_app(services.clone());
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    tracing::info!(addr = %listener.local_addr()?, "listening");

    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await;

    // Runner threads block on the runtime; stop them before it goes away.
    let stopping = services.clone();
    tokio::task::spawn_blocking(move || stopping.stop_runners())
        .await
        .context("failed to stop job runners")?;

    served.context("server error")
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown requested");
}
