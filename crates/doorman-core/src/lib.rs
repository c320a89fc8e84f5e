//! doorman-core: authorized-face matching engine.
//!
//! Uses SCRFD for face detection and ArcFace for face recognition, both
//! running via ONNX Runtime, and keeps the authorized embedding set in a
//! snapshot store that can be rebuilt while it is being read.

pub mod alignment;
pub mod analyzer;
pub mod augment;
pub mod builder;
pub mod config;
pub mod detector;
pub mod matcher;
pub mod recognizer;
pub mod store;
pub mod types;

pub use analyzer::{AnalyzerError, FaceAnalyzer, OnnxFaceAnalyzer};
pub use builder::{BuildError, EmbeddingBuilder};
pub use config::Config;
pub use matcher::{CosineMatcher, MatchResult, Matcher};
pub use store::{EmbeddingStore, Snapshot, StoreError};
pub use types::{BoundingBox, Embedding, EmbeddingRecord};

use std::path::PathBuf;

/// Model directory used when none is configured: `$XDG_DATA_HOME/doorman/models`.
pub fn default_model_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("doorman/models")
}
