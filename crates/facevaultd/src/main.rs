use anyhow::{Context, Result};
use facevault_core::onnx::OnnxEncoder;
use facevault_core::{FacePipeline, GalleryStore};
use facevault_store::SqliteBackend;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

mod config;
mod dbus_interface;
mod engine;

use config::{BusKind, Config};
use dbus_interface::{GalleryService, BUS_NAME, OBJECT_PATH};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("facevaultd starting");

    let config = Config::from_env();
    tracing::info!(
        db = %config.db_path.display(),
        models = %config.model_dir.display(),
        workers = config.workers,
        "configuration loaded"
    );

    let backend = SqliteBackend::open(&config.db_path)
        .with_context(|| format!("failed to open gallery at {}", config.db_path.display()))?;
    let store = GalleryStore::open(Box::new(backend)).context("failed to load gallery")?;
    tracing::info!(faces = store.len(), "gallery loaded");

    let pipeline = FacePipeline::new(Arc::new(store), config.pipeline_options());

    let detector_path = config.detector_model_path();
    let embedder_path = config.embedder_model_path();
    let engine = engine::spawn_engine(pipeline.clone(), config.workers, || {
        Ok(OnnxEncoder::load(&detector_path, &embedder_path)?)
    })
    .context("failed to start recognition engine")?;
    tracing::info!(workers = engine.workers(), "recognition engine ready");

    let service = GalleryService::new(engine, pipeline, config.db_path.clone());

    let builder = match config.bus {
        BusKind::Session => zbus::connection::Builder::session()?,
        BusKind::System => zbus::connection::Builder::system()?,
    };
    let _conn = builder
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, service)?
        .build()
        .await
        .context("failed to register on D-Bus")?;

    tracing::info!(bus = ?config.bus, name = BUS_NAME, "facevaultd ready");

    tokio::signal::ctrl_c().await?;
    tracing::info!("facevaultd shutting down");

    Ok(())
}
