use anyhow::{Context, Result};
use facewatch_core::{EmbeddingStore, SharedStore};
use facewatch_hw::Camera;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

mod config;
mod db;
mod dbus_interface;
mod engine;
mod extractor;
mod import;

use dbus_interface::{RegistryService, BUS_NAME, OBJECT_PATH};
use engine::EngineSettings;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "facewatchd starting");

    let config = config::Config::from_env();
    tracing::debug!(?config, "configuration loaded");

    let db = db::FaceDb::open(&config.db_path)
        .with_context(|| format!("opening face database {}", config.db_path.display()))?;

    let mut store = EmbeddingStore::new(config.embedding_dim);
    let failures = store.load(db.load_all().context("reading known faces")?);
    if !failures.is_empty() {
        tracing::warn!(skipped = failures.len(), "some persisted faces could not be loaded");
    }
    let store = Arc::new(SharedStore::new(store));

    let camera = Camera::open(&config.camera_device)
        .with_context(|| format!("opening camera {}", config.camera_device))?;
    tracing::info!(
        device = %config.camera_device,
        width = camera.width,
        height = camera.height,
        fourcc = ?camera.fourcc,
        "camera opened"
    );

    let extractor = extractor::CommandExtractor::spawn(&config.extractor_cmd)
        .context("starting face extractor (set FACEWATCH_EXTRACTOR_CMD)")?;

    let engine = engine::spawn_engine(
        camera,
        extractor,
        db,
        store,
        EngineSettings {
            match_threshold: config.match_threshold,
            frame_scale: config.frame_scale,
            label_capacity: config.label_capacity,
            frame_interval: Duration::from_millis(config.frame_interval_ms),
            durability: config.durability,
        },
    )?;

    let _conn = zbus::connection::Builder::session()?
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, RegistryService::new(engine))?
        .build()
        .await
        .context("registering on the session bus")?;

    tracing::info!(bus = BUS_NAME, "facewatchd ready");

    tokio::signal::ctrl_c().await?;
    tracing::info!("facewatchd shutting down");

    Ok(())
}
