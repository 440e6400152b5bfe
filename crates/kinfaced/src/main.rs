use anyhow::{Context, Result};
use kinface_core::{Embedder, EnrollmentService, RecognitionService, RosterStore};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

mod api;
mod config;
mod engine;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "kinfaced starting");

    let config = Arc::new(config::Config::load()?);
    tracing::info!(
        bind = %config.bind,
        roster = %config.roster_path.display(),
        models = %config.model_dir.display(),
        threshold = config.match_threshold,
        "configuration loaded"
    );

    let embedder = build_embedder(&config)?;
    let profile = embedder.profile();

    if let Some(parent) = config.roster_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating roster directory {}", parent.display()))?;
    }
    let store = match RosterStore::open(&config.roster_path, profile.clone()) {
        Ok(store) => Arc::new(store),
        Err(e) if e.is_corruption() => {
            anyhow::bail!(
                "{e}\nthe roster cannot be used; run `kinface reset --yes --roster {}` to start over",
                config.roster_path.display()
            );
        }
        Err(e) => return Err(e).context("opening roster"),
    };
    tracing::info!(persons = store.len(), model = %profile, "roster loaded");

    let enroll = EnrollmentService::new(embedder.clone(), store.clone());
    let recognize =
        RecognitionService::new(embedder, store.clone()).with_threshold(config.match_threshold);
    let engine = engine::spawn_engine(enroll, recognize, config.request_timeout())?;

    let listener = tokio::net::TcpListener::bind(&config.bind)
        .await
        .with_context(|| format!("binding {}", config.bind))?;
    tracing::info!(addr = %config.bind, "kinfaced ready");

    let app = api::router(api::AppState::new(engine, store, config.clone()));
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("kinfaced shutting down");
        })
        .await?;

    Ok(())
}

#[cfg(feature = "onnx")]
fn build_embedder(config: &config::Config) -> Result<Arc<dyn Embedder>> {
    let embedder = kinface_core::onnx::OnnxEmbedder::load(&config.model_dir)
        .with_context(|| format!("loading models from {}", config.model_dir.display()))?;
    Ok(Arc::new(embedder))
}

#[cfg(not(feature = "onnx"))]
fn build_embedder(_config: &config::Config) -> Result<Arc<dyn Embedder>> {
    anyhow::bail!("kinfaced was built without an embedder; rebuild with `--features onnx`")
}
