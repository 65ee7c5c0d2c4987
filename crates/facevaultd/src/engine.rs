use facevault_core::{FaceEncoder, FacePipeline, ImageRecognition, ImageRegistration};
use serde::Serialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("encoder error: {0}")]
    Encoder(String),
    #[error("failed to spawn engine thread: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("engine thread exited")]
    ChannelClosed,
}

impl From<facevault_core::onnx::OnnxError> for EngineError {
    fn from(e: facevault_core::onnx::OnnxError) -> Self {
        EngineError::Encoder(e.to_string())
    }
}

/// An uploaded image and the name it was submitted under.
pub type NamedImage = (String, Vec<u8>);

/// Per-image result labelled with the submitted file name.
#[derive(Debug, Clone, Serialize)]
pub struct FileReport<T> {
    pub file: String,
    #[serde(flatten)]
    pub result: T,
}

/// Messages sent from D-Bus handlers to the engine threads.
enum EngineRequest {
    Register {
        images: Vec<NamedImage>,
        tolerance: f32,
        reply: oneshot::Sender<Vec<FileReport<ImageRegistration>>>,
    },
    Recognize {
        images: Vec<NamedImage>,
        tolerance: f32,
        reply: oneshot::Sender<Vec<FileReport<ImageRecognition>>>,
    },
}

/// Clone-safe handle to the engine threads. Requests are spread round-robin.
#[derive(Clone)]
pub struct EngineHandle {
    workers: Arc<[mpsc::Sender<EngineRequest>]>,
    next: Arc<AtomicUsize>,
}

impl EngineHandle {
    pub fn workers(&self) -> usize {
        self.workers.len()
    }

    /// Register every face in `images`, matching at `tolerance`.
    pub async fn register(
        &self,
        images: Vec<NamedImage>,
        tolerance: f32,
    ) -> Result<Vec<FileReport<ImageRegistration>>, EngineError> {
        let (reply, rx) = oneshot::channel();
        self.dispatch(EngineRequest::Register {
            images,
            tolerance,
            reply,
        })
        .await?;
        rx.await.map_err(|_| EngineError::ChannelClosed)
    }

    /// Report gallery matches for every face in `images`.
    pub async fn recognize(
        &self,
        images: Vec<NamedImage>,
        tolerance: f32,
    ) -> Result<Vec<FileReport<ImageRecognition>>, EngineError> {
        let (reply, rx) = oneshot::channel();
        self.dispatch(EngineRequest::Recognize {
            images,
            tolerance,
            reply,
        })
        .await?;
        rx.await.map_err(|_| EngineError::ChannelClosed)
    }

    async fn dispatch(&self, req: EngineRequest) -> Result<(), EngineError> {
        let idx = self.next.fetch_add(1, Ordering::Relaxed) % self.workers.len();
        self.workers[idx]
            .send(req)
            .await
            .map_err(|_| EngineError::ChannelClosed)
    }
}

/// Spawn `workers` engine threads, each owning an encoder from `make_encoder`.
///
/// Encoders are created up front so that a missing model fails startup
/// rather than the first request.
pub fn spawn_engine<E, F>(
    pipeline: FacePipeline,
    workers: usize,
    mut make_encoder: F,
) -> Result<EngineHandle, EngineError>
where
    E: FaceEncoder + 'static,
    F: FnMut() -> Result<E, EngineError>,
{
    let mut senders = Vec::with_capacity(workers.max(1));
    for idx in 0..workers.max(1) {
        let mut encoder = make_encoder()?;
        let pipeline = pipeline.clone();
        let (tx, mut rx) = mpsc::channel::<EngineRequest>(4);

        std::thread::Builder::new()
            .name(format!("facevault-engine-{idx}"))
            .spawn(move || {
                tracing::info!(worker = idx, "engine thread started");
                while let Some(req) = rx.blocking_recv() {
                    handle_request(&pipeline, &mut encoder, req);
                }
                tracing::info!(worker = idx, "engine thread exiting");
            })?;

        senders.push(tx);
    }

    Ok(EngineHandle {
        workers: senders.into(),
        next: Arc::new(AtomicUsize::new(0)),
    })
}

fn handle_request<E: FaceEncoder>(pipeline: &FacePipeline, encoder: &mut E, req: EngineRequest) {
    match req {
        EngineRequest::Register {
            images,
            tolerance,
            reply,
        } => {
            tracing::info!(images = images.len(), tolerance, "register requested");
            let reports = images
                .into_iter()
                .map(|(file, bytes)| {
                    let result = pipeline.register_image(&mut *encoder, &bytes, tolerance);
                    FileReport { file, result }
                })
                .collect();
            // Caller may have gone away; committed registrations stay.
            let _ = reply.send(reports);
        }
        EngineRequest::Recognize {
            images,
            tolerance,
            reply,
        } => {
            tracing::info!(images = images.len(), tolerance, "recognize requested");
            let reports = images
                .into_iter()
                .map(|(file, bytes)| {
                    let result = pipeline.recognize_image(&mut *encoder, &bytes, tolerance);
                    FileReport { file, result }
                })
                .collect();
            let _ = reply.send(reports);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use facevault_core::{
        BoundingBox, DetectedFace, Embedding, FaceError, FaceRecognition, FaceRegistration,
        GalleryStore, PipelineOptions,
    };
    use image::{ImageFormat, Rgb, RgbImage};
    use std::io::Cursor;

    /// One face per image whose embedding encodes the image width.
    struct WidthEncoder;

    impl FaceEncoder for WidthEncoder {
        fn detect_and_encode(&mut self, image: &RgbImage) -> Result<Vec<DetectedFace>, FaceError> {
            Ok(vec![DetectedFace {
                bounding_box: BoundingBox::new(4, 20, 20, 4),
                embedding: Embedding::new(vec![image.width() as f32, 0.0]),
            }])
        }
    }

    fn png(width: u32) -> Vec<u8> {
        let img = RgbImage::from_pixel(width, 32, Rgb([10, 20, 30]));
        let mut buf = Cursor::new(Vec::new());
        img.write_to(&mut buf, ImageFormat::Png).unwrap();
        buf.into_inner()
    }

    fn engine(workers: usize) -> (EngineHandle, FacePipeline) {
        let pipeline = FacePipeline::new(Arc::new(GalleryStore::in_memory()), PipelineOptions::default());
        let handle = spawn_engine(pipeline.clone(), workers, || Ok(WidthEncoder)).unwrap();
        (handle, pipeline)
    }

    #[tokio::test]
    async fn test_register_then_recognize() {
        let (engine, pipeline) = engine(2);

        let first = engine
            .register(vec![("a.png".into(), png(40)), ("b.png".into(), png(50))], 0.4)
            .await
            .unwrap();
        assert_eq!(first[0].file, "a.png");
        assert!(matches!(
            first[0].result.faces(),
            [FaceRegistration::Registered { identity: 1, .. }]
        ));
        assert!(matches!(
            first[1].result.faces(),
            [FaceRegistration::Registered { identity: 2, .. }]
        ));

        let again = engine.register(vec![("c.png".into(), png(40))], 0.4).await.unwrap();
        assert!(matches!(
            again[0].result.faces(),
            [FaceRegistration::Existing { identity: 1, .. }]
        ));
        assert_eq!(pipeline.store().len(), 2);

        let seen = engine.recognize(vec![("d.png".into(), png(50))], 0.4).await.unwrap();
        match &seen[0].result.faces()[0] {
            FaceRecognition::Recognized { matches, .. } => {
                assert_eq!(matches.len(), 1);
                assert_eq!(matches[0].identity, 2);
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_concurrent_registrations_get_unique_identities() {
        let (engine, pipeline) = engine(3);
        let calls: Vec<_> = (0..12u32)
            .map(|i| {
                let engine = engine.clone();
                tokio::spawn(async move {
                    engine
                        .register(vec![(format!("{i}.png"), png(16 + i * 8))], 0.4)
                        .await
                        .unwrap()
                })
            })
            .collect();
        for call in calls {
            call.await.unwrap();
        }

        let ids: Vec<i64> = pipeline.store().snapshot().iter().map(|e| e.identity).collect();
        assert_eq!(ids, (1..=12).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_report_json_carries_file_name() {
        let (engine, _) = engine(1);
        let reports = engine.register(vec![("x.jpg".into(), b"bad".to_vec())], 0.4).await.unwrap();
        let json = serde_json::to_value(&reports).unwrap();
        assert_eq!(json[0]["file"], "x.jpg");
        assert_eq!(json[0]["outcome"], "failed");
        assert_eq!(json[0]["error"]["kind"], "invalid_input");
    }

    #[test]
    fn test_spawn_engine_propagates_encoder_failure() {
        let pipeline = FacePipeline::new(Arc::new(GalleryStore::in_memory()), PipelineOptions::default());
        let result = spawn_engine(pipeline, 2, || -> Result<WidthEncoder, EngineError> {
            Err(EngineError::Encoder("model missing".into()))
        });
        assert!(matches!(result, Err(EngineError::Encoder(_))));
    }
}
