use facevault_core::imaging::{DEFAULT_CROP_PADDING, DEFAULT_JPEG_QUALITY};
use facevault_core::PipelineOptions;
use std::path::PathBuf;

/// Which D-Bus bus the daemon registers on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusKind {
    Session,
    System,
}

/// Daemon configuration, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Directory containing ONNX model files.
    pub model_dir: PathBuf,
    /// Path to the SQLite gallery database.
    pub db_path: PathBuf,
    /// Pixels of margin around each stored face crop.
    pub crop_padding: u32,
    pub jpeg_quality: u8,
    /// Number of engine threads, each with its own encoder.
    pub workers: usize,
    pub bus: BusKind,
}

impl Config {
    /// Load configuration from `FACEVAULT_*` environment variables with defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Self {
        let model_dir = get("FACEVAULT_MODEL_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(facevault_core::default_model_dir);

        let data_dir = get("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                let home = get("HOME").unwrap_or_else(|| "/tmp".to_string());
                PathBuf::from(home).join(".local/share")
            })
            .join("facevault");

        let db_path = get("FACEVAULT_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|| data_dir.join("faces.db"));

        let bus = match get("FACEVAULT_BUS").as_deref() {
            Some("system") => BusKind::System,
            _ => BusKind::Session,
        };

        Self {
            model_dir,
            db_path,
            crop_padding: parse_or(&get, "FACEVAULT_CROP_PADDING", DEFAULT_CROP_PADDING),
            jpeg_quality: parse_or(&get, "FACEVAULT_JPEG_QUALITY", DEFAULT_JPEG_QUALITY).clamp(1, 100),
            workers: parse_or(&get, "FACEVAULT_WORKERS", 2usize).max(1),
            bus,
        }
    }

    /// Path to the SCRFD detection model.
    pub fn detector_model_path(&self) -> PathBuf {
        self.model_dir.join("det_10g.onnx")
    }

    /// Path to the face embedding model.
    pub fn embedder_model_path(&self) -> PathBuf {
        self.model_dir.join("w600k_r50.onnx")
    }

    pub fn pipeline_options(&self) -> PipelineOptions {
        PipelineOptions {
            crop_padding: self.crop_padding,
            jpeg_quality: self.jpeg_quality,
        }
    }
}

fn parse_or<T: std::str::FromStr>(get: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T {
    get(key).and_then(|v| v.parse().ok()).unwrap_or(default)
}
