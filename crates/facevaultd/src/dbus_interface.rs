use crate::engine::{EngineError, EngineHandle, NamedImage};
use facevault_core::{FaceError, FacePipeline};
use serde::Serialize;
use std::path::PathBuf;
use zbus::interface;

pub const BUS_NAME: &str = "org.facevault.Gallery1";
pub const OBJECT_PATH: &str = "/org/facevault/Gallery1";

/// D-Bus interface for the Facevault gallery daemon.
///
/// Bus name: org.facevault.Gallery1
/// Object path: /org/facevault/Gallery1
pub struct GalleryService {
    engine: EngineHandle,
    pipeline: FacePipeline,
    db_path: PathBuf,
}

impl GalleryService {
    pub fn new(engine: EngineHandle, pipeline: FacePipeline, db_path: PathBuf) -> Self {
        Self {
            engine,
            pipeline,
            db_path,
        }
    }

    fn status_json(&self) -> serde_json::Value {
        let store = self.pipeline.store();
        serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "faces": store.len(),
            "embedding_dimension": store.dimension(),
            "workers": self.engine.workers(),
            "database": self.db_path.display().to_string(),
        })
    }
}

#[interface(name = "org.facevault.Gallery1")]
impl GalleryService {
    /// Register every face in the given images; returns a JSON report per image.
    async fn register_faces(
        &self,
        images: Vec<NamedImage>,
        tolerance: f64,
    ) -> zbus::fdo::Result<String> {
        tracing::info!(images = images.len(), tolerance, "RegisterFaces requested");
        let reports = self
            .engine
            .register(images, tolerance as f32)
            .await
            .map_err(engine_error)?;
        to_json(&reports)
    }

    /// Report gallery matches for every face in the given images, as JSON.
    async fn recognize_faces(
        &self,
        images: Vec<NamedImage>,
        tolerance: f64,
    ) -> zbus::fdo::Result<String> {
        tracing::info!(images = images.len(), tolerance, "RecognizeFaces requested");
        let reports = self
            .engine
            .recognize(images, tolerance as f32)
            .await
            .map_err(engine_error)?;
        to_json(&reports)
    }

    /// JPEG crop stored for a registered identity.
    async fn face_image(&self, identity: i64) -> zbus::fdo::Result<Vec<u8>> {
        tracing::debug!(identity, "FaceImage requested");
        self.pipeline
            .fetch_representative_image(identity)
            .map(|jpeg| jpeg.to_vec())
            .map_err(face_error)
    }

    /// List registered identities as JSON.
    async fn list_faces(&self) -> zbus::fdo::Result<String> {
        to_json(&self.pipeline.list_entries())
    }

    /// Return daemon status information.
    async fn status(&self) -> zbus::fdo::Result<String> {
        Ok(self.status_json().to_string())
    }
}

fn to_json<T: Serialize + ?Sized>(value: &T) -> zbus::fdo::Result<String> {
    serde_json::to_string(value).map_err(|e| zbus::fdo::Error::Failed(format!("encode reply: {e}")))
}

fn face_error(e: FaceError) -> zbus::fdo::Error {
    match e {
        FaceError::NotFound(_) => zbus::fdo::Error::FileNotFound(e.to_string()),
        FaceError::InvalidInput(_) => zbus::fdo::Error::InvalidArgs(e.to_string()),
        FaceError::Storage(_) | FaceError::Detection(_) => zbus::fdo::Error::Failed(e.to_string()),
    }
}

fn engine_error(e: EngineError) -> zbus::fdo::Error {
    tracing::error!(error = %e, "engine request failed");
    zbus::fdo::Error::Failed(e.to_string())
}
