use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Config file consulted when `DOORMAN_CONFIG` is not set.
const DEFAULT_CONFIG_PATH: &str = "/etc/doorman/config.toml";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("reading config {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("parsing config {path}: {source}")]
    Parse {
        path: String,
        source: toml::de::Error,
    },
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Shared daemon/CLI configuration.
///
/// Resolution order: defaults, then the TOML file, then `DOORMAN_*` variables.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// V4L2 device path.
    pub camera_device: String,
    pub frame_width: u32,
    pub frame_height: u32,
    /// Mirror frames horizontally (selfie view).
    pub mirror: bool,
    /// Directory containing the ONNX model files.
    pub model_dir: PathBuf,
    /// Minimum SCRFD score for a detection.
    pub detection_confidence: f32,
    /// Folder-per-person dataset root.
    pub dataset_dir: PathBuf,
    /// Persisted embedding cache.
    pub cache_path: PathBuf,
    /// Where authorized entries are logged as face crops.
    pub entries_dir: PathBuf,
    /// Cosine distance under which a face is authorized.
    pub threshold: f32,
    /// Embed flipped/rotated/brightened copies of each dataset image.
    pub augment: bool,
    /// Door-open endpoint.
    pub door_url: String,
    pub door_timeout_ms: u64,
    /// Minimum seconds between two door-open calls for the same identity.
    pub door_cooldown_secs: u64,
    /// Quiet period used to coalesce bursts of dataset events.
    pub rebuild_debounce_ms: u64,
    /// Consecutive capture failures tolerated before the pipeline gives up.
    pub max_capture_failures: u32,
    pub sync_interval_secs: u64,
    /// Firebase Storage bucket to pull the dataset from.
    pub firebase_bucket: Option<String>,
    pub firebase_token: Option<String>,
    /// Mounted bucket directory to pull the dataset from (alternative to Firebase).
    pub object_store_dir: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            camera_device: "/dev/video0".to_string(),
            frame_width: 640,
            frame_height: 480,
            mirror: true,
            model_dir: crate::default_model_dir(),
            detection_confidence: crate::detector::DEFAULT_CONFIDENCE_THRESHOLD,
            dataset_dir: PathBuf::from("./dataset"),
            cache_path: PathBuf::from("./authorized_embeddings.json"),
            entries_dir: PathBuf::from("./entries"),
            threshold: 0.57,
            augment: false,
            door_url: "http://localhost:5555/open".to_string(),
            door_timeout_ms: 2000,
            door_cooldown_secs: 5,
            rebuild_debounce_ms: 500,
            max_capture_failures: 100,
            sync_interval_secs: 60,
            firebase_bucket: None,
            firebase_token: None,
            object_store_dir: None,
        }
    }
}

impl Config {
    /// Load from the config file (if any) and the environment, then validate.
    pub fn load() -> Result<Self, ConfigError> {
        let (path, explicit) = match std::env::var("DOORMAN_CONFIG") {
            Ok(p) => (PathBuf::from(p), true),
            Err(_) => (PathBuf::from(DEFAULT_CONFIG_PATH), false),
        };

        let mut cfg = if explicit || path.exists() {
            Self::from_file(&path)?
        } else {
            Self::default()
        };
        cfg.apply_env(|key| std::env::var(key).ok());
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        toml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })
    }

    /// Override fields from `DOORMAN_*` variables looked up through `var`.
    /// Unparseable values are ignored with a warning.
    pub fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) {
        fn parsed<T: std::str::FromStr>(key: &str, raw: Option<String>, slot: &mut T) {
            if let Some(raw) = raw {
                match raw.parse() {
                    Ok(v) => *slot = v,
                    Err(_) => tracing::warn!(key, value = %raw, "ignoring unparseable value"),
                }
            }
        }

        if let Some(v) = var("DOORMAN_CAMERA_DEVICE") {
            self.camera_device = v;
        }
        parsed("DOORMAN_FRAME_WIDTH", var("DOORMAN_FRAME_WIDTH"), &mut self.frame_width);
        parsed("DOORMAN_FRAME_HEIGHT", var("DOORMAN_FRAME_HEIGHT"), &mut self.frame_height);
        if let Some(v) = var("DOORMAN_MIRROR") {
            self.mirror = v != "0";
        }
        if let Some(v) = var("DOORMAN_MODEL_DIR") {
            self.model_dir = PathBuf::from(v);
        }
        parsed(
            "DOORMAN_DETECTION_CONFIDENCE",
            var("DOORMAN_DETECTION_CONFIDENCE"),
            &mut self.detection_confidence,
        );
        if let Some(v) = var("DOORMAN_DATASET_DIR") {
            self.dataset_dir = PathBuf::from(v);
        }
        if let Some(v) = var("DOORMAN_CACHE_PATH") {
            self.cache_path = PathBuf::from(v);
        }
        if let Some(v) = var("DOORMAN_ENTRIES_DIR") {
            self.entries_dir = PathBuf::from(v);
        }
        parsed("DOORMAN_THRESHOLD", var("DOORMAN_THRESHOLD"), &mut self.threshold);
        if let Some(v) = var("DOORMAN_AUGMENT") {
            self.augment = v != "0";
        }
        if let Some(v) = var("DOORMAN_DOOR_URL") {
            self.door_url = v;
        }
        parsed("DOORMAN_DOOR_TIMEOUT_MS", var("DOORMAN_DOOR_TIMEOUT_MS"), &mut self.door_timeout_ms);
        parsed(
            "DOORMAN_DOOR_COOLDOWN_SECS",
            var("DOORMAN_DOOR_COOLDOWN_SECS"),
            &mut self.door_cooldown_secs,
        );
        parsed(
            "DOORMAN_REBUILD_DEBOUNCE_MS",
            var("DOORMAN_REBUILD_DEBOUNCE_MS"),
            &mut self.rebuild_debounce_ms,
        );
        parsed(
            "DOORMAN_MAX_CAPTURE_FAILURES",
            var("DOORMAN_MAX_CAPTURE_FAILURES"),
            &mut self.max_capture_failures,
        );
        parsed(
            "DOORMAN_SYNC_INTERVAL_SECS",
            var("DOORMAN_SYNC_INTERVAL_SECS"),
            &mut self.sync_interval_secs,
        );
        if let Some(v) = var("DOORMAN_FIREBASE_BUCKET") {
            self.firebase_bucket = Some(v).filter(|s| !s.is_empty());
        }
        if let Some(v) = var("DOORMAN_FIREBASE_TOKEN") {
            self.firebase_token = Some(v).filter(|s| !s.is_empty());
        }
        if let Some(v) = var("DOORMAN_OBJECT_STORE_DIR") {
            self.object_store_dir = Some(PathBuf::from(v)).filter(|p| !p.as_os_str().is_empty());
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.threshold > 0.0 && self.threshold <= 2.0) {
            return Err(ConfigError::Invalid(format!(
                "threshold must be in (0, 2], got {}",
                self.threshold
            )));
        }
        if self.frame_width == 0 || self.frame_height == 0 {
            return Err(ConfigError::Invalid("frame dimensions must be non-zero".into()));
        }
        if !(0.0..=1.0).contains(&self.detection_confidence) {
            return Err(ConfigError::Invalid(format!(
                "detection_confidence must be in [0, 1], got {}",
                self.detection_confidence
            )));
        }
        if self.sync_interval_secs == 0 {
            return Err(ConfigError::Invalid("sync_interval_secs must be non-zero".into()));
        }
        Ok(())
    }

    /// Path to the SCRFD detection model.
    pub fn scrfd_model_path(&self) -> PathBuf {
        self.model_dir.join("det_10g.onnx")
    }

    /// Path to the ArcFace recognition model.
    pub fn arcface_model_path(&self) -> PathBuf {
        self.model_dir.join("w600k_r50.onnx")
    }
}
