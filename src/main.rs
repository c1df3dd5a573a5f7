use std::net::SocketAddr;

use anyhow::Context;
use tracing_subscriber::EnvFilter;

use upload_classifier_rs::{model, router, AppState, Config, UploadStore};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,tower_http=debug")),
        )
        .init();

    let config = Config::from_env().context("invalid configuration")?;
    tracing::info!(?config, "configuration loaded");

    let uploads = UploadStore::new(&config.upload_dir, config.keep_uploads);
    uploads.ensure_dir().with_context(|| {
        format!(
            "failed to create upload directory {}",
            uploads.dir().display()
        )
    })?;

    let classifier = model::load_shared(&config);
    let state = AppState::new(classifier, uploads);
    let app = router(state, config.body_limit_bytes);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    tracing::info!("Listening on http://{}", addr);
    axum::Server::try_bind(&addr)
        .with_context(|| format!("failed to bind {}", addr))?
        .serve(app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::warn!("Failed to listen for shutdown signal: {err}");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutting down");
}
