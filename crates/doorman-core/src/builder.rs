//! Builds an embedding [`Snapshot`] from a folder-per-person dataset.
//!
//! ```text
//! dataset/
//!   alice/  front.jpg  side.png
//!   bob/    bob1.jpg
//! ```
//!
//! Every image goes through detection + embedding; the most confident face is
//! used. Bad images are logged and skipped so one unreadable file never drops
//! a whole identity.

use crate::analyzer::{AnalyzerError, FaceAnalyzer};
use crate::augment;
use crate::store::Snapshot;
use crate::types::{Embedding, EmbeddingRecord};
use image::GrayImage;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BuildError {
    #[error("cannot read dataset {path}: {source}")]
    DatasetUnreadable {
        path: String,
        source: std::io::Error,
    },
}

/// Why a single dataset image contributed nothing.
#[derive(Error, Debug)]
pub enum ImageFailure {
    #[error("unreadable image: {0}")]
    Unreadable(#[from] image::ImageError),
    #[error(transparent)]
    Analyzer(#[from] AnalyzerError),
    #[error("embedding has zero norm")]
    ZeroNorm,
}

pub struct EmbeddingBuilder {
    augment: bool,
}

impl EmbeddingBuilder {
    pub fn new(augment: bool) -> Self {
        Self { augment }
    }

    /// Walk `root` and embed every image of every identity.
    ///
    /// Fails only when `root` itself cannot be listed; an empty dataset yields
    /// an empty snapshot.
    pub fn build<A: FaceAnalyzer + ?Sized>(
        &self,
        root: &Path,
        analyzer: &mut A,
    ) -> Result<Snapshot, BuildError> {
        let started = std::time::Instant::now();
        let identities = sorted_entries(root).map_err(|source| BuildError::DatasetUnreadable {
            path: root.display().to_string(),
            source,
        })?;

        let mut records = Vec::new();
        let mut skipped = 0usize;

        for person_dir in identities.into_iter().filter(|p| p.is_dir()) {
            let Some(identity) = person_dir.file_name().and_then(|n| n.to_str()) else {
                continue;
            };

            let images = match sorted_entries(&person_dir) {
                Ok(images) => images,
                Err(e) => {
                    tracing::warn!(identity, error = %e, "cannot list identity folder; skipping");
                    continue;
                }
            };

            for image_path in images.into_iter().filter(|p| p.is_file()) {
                match self.embed_image(&image_path, analyzer) {
                    Ok(embeddings) => {
                        tracing::debug!(
                            identity,
                            file = %image_path.display(),
                            count = embeddings.len(),
                            "embedded dataset image"
                        );
                        records.extend(embeddings.into_iter().map(|embedding| EmbeddingRecord {
                            identity: identity.to_string(),
                            embedding,
                        }));
                    }
                    Err(e) => {
                        skipped += 1;
                        tracing::warn!(
                            identity,
                            file = %image_path.display(),
                            error = %e,
                            "skipping dataset image"
                        );
                    }
                }
            }
        }

        let snapshot = Snapshot::from_records(records);
        tracing::info!(
            root = %root.display(),
            identities = snapshot.identities().len(),
            embeddings = snapshot.len(),
            skipped,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "embedding store built"
        );
        Ok(snapshot)
    }

    /// Embed one dataset image (plus its augmented variants when enabled).
    ///
    /// The original image must yield a face; failing variants are dropped.
    pub fn embed_image<A: FaceAnalyzer + ?Sized>(
        &self,
        path: &Path,
        analyzer: &mut A,
    ) -> Result<Vec<Embedding>, ImageFailure> {
        let image = image::open(path)?.to_luma8();

        let mut out = vec![embed_normalized(&image, analyzer)?];
        if self.augment {
            for variant in augment::variants(&image) {
                match embed_normalized(&variant, analyzer) {
                    Ok(embedding) => out.push(embedding),
                    Err(e) => {
                        tracing::debug!(file = %path.display(), error = %e, "augmented variant skipped");
                    }
                }
            }
        }
        Ok(out)
    }
}

fn embed_normalized<A: FaceAnalyzer + ?Sized>(
    image: &GrayImage,
    analyzer: &mut A,
) -> Result<Embedding, ImageFailure> {
    let (_, embedding) = analyzer.embed_best(image)?;
    embedding.normalized().ok_or(ImageFailure::ZeroNorm)
}

/// Non-hidden entries of `dir`, sorted by name so builds are reproducible.
fn sorted_entries(dir: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut entries = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if entry.file_name().to_string_lossy().starts_with('.') {
            continue;
        }
        entries.push(entry.path());
    }
    entries.sort();
    Ok(entries)
}
