//! Authorized-face embedding store.
//!
//! A [`Snapshot`] is an immutable pair of parallel arrays (`vectors[i]` belongs
//! to `names[i]`). The [`EmbeddingStore`] publishes one snapshot at a time
//! behind an `RwLock<Arc<_>>`: readers clone the `Arc` and release the lock
//! immediately, a rebuild swaps the pointer in one assignment.

use crate::types::{Embedding, EmbeddingRecord};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("embedding cache {path} is corrupt: {reason}")]
    CorruptState { path: String, reason: String },
    #[error("snapshot has {vectors} vectors but {names} names")]
    LengthMismatch { vectors: usize, names: usize },
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialize: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// One complete version of the authorized set.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    vectors: Vec<Embedding>,
    names: Vec<String>,
}

/// On-disk layout of the embedding cache.
#[derive(Serialize, Deserialize)]
struct PersistedCache {
    #[serde(default)]
    model_version: Option<String>,
    embeddings: Vec<Vec<f32>>,
    names: Vec<String>,
}

impl Snapshot {
    /// Build a snapshot from parallel arrays, rejecting mismatched lengths.
    pub fn new(vectors: Vec<Embedding>, names: Vec<String>) -> Result<Self, StoreError> {
        if vectors.len() != names.len() {
            return Err(StoreError::LengthMismatch {
                vectors: vectors.len(),
                names: names.len(),
            });
        }
        Ok(Self { vectors, names })
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn from_records(records: Vec<EmbeddingRecord>) -> Self {
        let (names, vectors) = records
            .into_iter()
            .map(|r| (r.identity, r.embedding))
            .unzip();
        Self { vectors, names }
    }

    pub fn vectors(&self) -> &[Embedding] {
        &self.vectors
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn len(&self) -> usize {
        self.vectors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vectors.is_empty()
    }

    /// Distinct identities in store order.
    pub fn identities(&self) -> Vec<&str> {
        let mut seen: Vec<&str> = Vec::new();
        for name in &self.names {
            if !seen.contains(&name.as_str()) {
                seen.push(name);
            }
        }
        seen
    }

    /// Model version shared by the stored embeddings, if any embedding carries one.
    pub fn model_version(&self) -> Option<&str> {
        self.vectors.iter().find_map(|e| e.model_version.as_deref())
    }

    /// Write the snapshot to `path` as JSON.
    ///
    /// The file is written to a sibling temp file first and renamed into place,
    /// so a crash mid-write never leaves a truncated cache behind.
    pub fn persist(&self, path: &Path) -> Result<(), StoreError> {
        let cache = PersistedCache {
            model_version: self.model_version().map(str::to_string),
            embeddings: self.vectors.iter().map(|e| e.values.clone()).collect(),
            names: self.names.clone(),
        };
        let data = serde_json::to_vec(&cache)?;

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = temp_path(path);
        std::fs::write(&tmp, data)?;
        if let Err(e) = std::fs::rename(&tmp, path) {
            let _ = std::fs::remove_file(&tmp);
            return Err(e.into());
        }

        tracing::info!(
            path = %path.display(),
            embeddings = self.len(),
            "embedding cache persisted"
        );
        Ok(())
    }

    /// Read a snapshot previously written by [`persist`](Self::persist).
    ///
    /// Any failure (missing file, bad JSON, mismatched arrays, zero vectors,
    /// vectors of differing dimension, model version other than
    /// `expected_model`) is reported as
    /// [`StoreError::CorruptState`]; the caller falls back to a full rebuild.
    pub fn restore(path: &Path, expected_model: Option<&str>) -> Result<Self, StoreError> {
        let corrupt = |reason: String| StoreError::CorruptState {
            path: path.display().to_string(),
            reason,
        };

        let data = std::fs::read(path).map_err(|e| corrupt(e.to_string()))?;
        let cache: PersistedCache =
            serde_json::from_slice(&data).map_err(|e| corrupt(e.to_string()))?;

        if cache.embeddings.len() != cache.names.len() {
            return Err(corrupt(format!(
                "{} embeddings but {} names",
                cache.embeddings.len(),
                cache.names.len()
            )));
        }

        if let (Some(expected), Some(found)) = (expected_model, cache.model_version.as_deref()) {
            if expected != found {
                return Err(corrupt(format!(
                    "built with model {found}, current model is {expected}"
                )));
            }
        }

        let dim = cache.embeddings.first().map(Vec::len);
        let mut vectors = Vec::with_capacity(cache.embeddings.len());
        for (i, values) in cache.embeddings.into_iter().enumerate() {
            if Some(values.len()) != dim {
                return Err(corrupt(format!(
                    "embedding {i} has {} dimensions, expected {}",
                    values.len(),
                    dim.unwrap_or(0)
                )));
            }
            let embedding = Embedding {
                values,
                model_version: cache.model_version.clone(),
            }
            .normalized()
            .ok_or_else(|| corrupt(format!("embedding {i} has zero norm")))?;
            vectors.push(embedding);
        }

        tracing::info!(
            path = %path.display(),
            embeddings = vectors.len(),
            "embedding cache restored"
        );
        Self::new(vectors, cache.names)
    }
}

/// Sibling temp file for an atomic write of `path`. Dot-prefixed so a dataset
/// watcher treats it like any other hidden file.
fn temp_path(path: &Path) -> PathBuf {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "embeddings".to_string());
    path.with_file_name(format!(".{file_name}.{}.tmp", uuid::Uuid::new_v4().simple()))
}

/// Concurrently readable, atomically replaceable holder of the current [`Snapshot`].
pub struct EmbeddingStore {
    current: RwLock<Arc<Snapshot>>,
    /// Serializes rebuilds; never held by readers.
    rebuild: Mutex<()>,
}

impl EmbeddingStore {
    pub fn new(initial: Snapshot) -> Self {
        Self {
            current: RwLock::new(Arc::new(initial)),
            rebuild: Mutex::new(()),
        }
    }

    /// The current snapshot. The read lock is held only for the `Arc` clone.
    pub fn read(&self) -> Arc<Snapshot> {
        Arc::clone(&self.current.read().unwrap_or_else(PoisonError::into_inner))
    }

    /// Publish `next`, returning the snapshot it replaced.
    pub fn replace(&self, next: Snapshot) -> Arc<Snapshot> {
        let _rebuild = self.rebuild.lock().unwrap_or_else(PoisonError::into_inner);
        self.swap(Arc::new(next))
    }

    /// Run `build` under the rebuild lock and publish its result.
    ///
    /// Readers keep seeing the previous snapshot for the whole build; a failed
    /// build leaves the store untouched.
    pub fn rebuild_with<E>(
        &self,
        build: impl FnOnce() -> Result<Snapshot, E>,
    ) -> Result<Arc<Snapshot>, E> {
        let _rebuild = self.rebuild.lock().unwrap_or_else(PoisonError::into_inner);
        let next = Arc::new(build()?);
        self.swap(Arc::clone(&next));
        Ok(next)
    }

    fn swap(&self, next: Arc<Snapshot>) -> Arc<Snapshot> {
        let mut guard = self.current.write().unwrap_or_else(PoisonError::into_inner);
        std::mem::replace(&mut *guard, next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn unit(values: &[f32]) -> Embedding {
        Embedding::new(values.to_vec()).normalized().unwrap()
    }

    fn snapshot_of(n: usize, name: &str) -> Snapshot {
        Snapshot::from_records(
            (0..n)
                .map(|i| EmbeddingRecord {
                    identity: name.to_string(),
                    embedding: unit(&[1.0, i as f32]),
                })
                .collect(),
        )
    }

    #[test]
    fn test_new_rejects_length_mismatch() {
        let err = Snapshot::new(vec![unit(&[1.0, 0.0])], vec![]).unwrap_err();
        assert!(matches!(err, StoreError::LengthMismatch { vectors: 1, names: 0 }));
    }

    #[test]
    fn test_from_records_keeps_pairs_aligned() {
        let snap = Snapshot::from_records(vec![
            EmbeddingRecord { identity: "alice".into(), embedding: unit(&[1.0, 0.0]) },
            EmbeddingRecord { identity: "bob".into(), embedding: unit(&[0.0, 1.0]) },
            EmbeddingRecord { identity: "alice".into(), embedding: unit(&[1.0, 1.0]) },
        ]);
        assert_eq!(snap.len(), 3);
        assert_eq!(snap.names(), &["alice", "bob", "alice"]);
        assert_eq!(snap.vectors()[1].values, vec![0.0, 1.0]);
        assert_eq!(snap.identities(), vec!["alice", "bob"]);
    }

    #[test]
    fn test_persist_restore() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache").join("embeddings.json");

        let mut a = unit(&[0.6, 0.8]);
        a.model_version = Some("w600k_r50".into());
        let mut b = unit(&[0.0, 1.0]);
        b.model_version = Some("w600k_r50".into());
        let snap = Snapshot::new(vec![a, b], vec!["alice".into(), "bob".into()]).unwrap();
        snap.persist(&path).unwrap();

        let restored = Snapshot::restore(&path, Some("w600k_r50")).unwrap();
        assert_eq!(restored.names(), snap.names());
        assert_eq!(restored.model_version(), Some("w600k_r50"));
        for (x, y) in restored.vectors().iter().zip(snap.vectors()) {
            assert!(x.cosine_distance(y).abs() < 1e-6);
        }

        // No temp files left behind.
        let leftovers = std::fs::read_dir(path.parent().unwrap()).unwrap().count();
        assert_eq!(leftovers, 1);
    }

    #[test]
    fn test_restore_missing_file_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let err = Snapshot::restore(&dir.path().join("nope.json"), None).unwrap_err();
        assert!(matches!(err, StoreError::CorruptState { .. }));
    }

    #[test]
    fn test_restore_malformed_json_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.json");
        std::fs::write(&path, b"{\"embeddings\": [[1.0]").unwrap();
        assert!(matches!(
            Snapshot::restore(&path, None),
            Err(StoreError::CorruptState { .. })
        ));
    }

    #[test]
    fn test_restore_mismatched_arrays_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.json");
        std::fs::write(&path, br#"{"embeddings": [[1.0, 0.0]], "names": ["a", "b"]}"#).unwrap();
        assert!(matches!(
            Snapshot::restore(&path, None),
            Err(StoreError::CorruptState { .. })
        ));
    }

    #[test]
    fn test_temp_path_is_hidden_sibling() {
        let tmp = temp_path(Path::new("/data/dataset/authorized_embeddings.json"));
        assert_eq!(tmp.parent(), Some(Path::new("/data/dataset")));
        let name = tmp.file_name().unwrap().to_string_lossy();
        assert!(name.starts_with(".authorized_embeddings.json."), "{name}");
        assert!(name.ends_with(".tmp"));
    }

    #[test]
    fn test_restore_mixed_dimensions_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.json");
        std::fs::write(&path, br#"{"embeddings": [[1.0, 0.0], [1.0, 0.0, 0.0]], "names": ["a", "b"]}"#)
            .unwrap();
        assert!(matches!(
            Snapshot::restore(&path, None),
            Err(StoreError::CorruptState { .. })
        ));
    }

    #[test]
    fn test_restore_model_mismatch_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.json");
        std::fs::write(
            &path,
            br#"{"model_version": "facenet", "embeddings": [[1.0, 0.0]], "names": ["a"]}"#,
        )
        .unwrap();
        assert!(matches!(
            Snapshot::restore(&path, Some("w600k_r50")),
            Err(StoreError::CorruptState { .. })
        ));
        assert!(Snapshot::restore(&path, None).is_ok());
    }

    #[test]
    fn test_replace_returns_previous() {
        let store = EmbeddingStore::new(snapshot_of(2, "old"));
        let old = store.replace(snapshot_of(3, "new"));
        assert_eq!(old.len(), 2);
        assert_eq!(store.read().len(), 3);
        assert_eq!(store.read().names()[0], "new");
    }

    #[test]
    fn test_rebuild_failure_keeps_previous() {
        let store = EmbeddingStore::new(snapshot_of(2, "old"));
        let result: Result<_, &str> = store.rebuild_with(|| Err("boom"));
        assert!(result.is_err());
        assert_eq!(store.read().len(), 2);
    }

    #[test]
    fn test_reader_holds_snapshot_across_replace() {
        let store = EmbeddingStore::new(snapshot_of(2, "old"));
        let held = store.read();
        store.replace(snapshot_of(5, "new"));
        assert_eq!(held.len(), 2);
        assert!(held.names().iter().all(|n| n == "old"));
    }

    #[test]
    fn test_concurrent_read_replace_never_mixed() {
        let store = Arc::new(EmbeddingStore::new(snapshot_of(1, "gen0")));
        let stop = Arc::new(AtomicBool::new(false));

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let store = Arc::clone(&store);
                let stop = Arc::clone(&stop);
                std::thread::spawn(move || {
                    let mut reads = 0usize;
                    loop {
                        let done = stop.load(Ordering::Relaxed);
                        let snap = store.read();
                        assert_eq!(snap.vectors().len(), snap.names().len());
                        // Generation N has exactly N+1 records, all named genN.
                        let generation = &snap.names()[0];
                        let n: usize = generation.trim_start_matches("gen").parse().unwrap();
                        assert_eq!(snap.len(), n + 1);
                        assert!(snap.names().iter().all(|name| name == generation));
                        reads += 1;
                        if done {
                            break reads;
                        }
                    }
                })
            })
            .collect();

        for generation in 1..200 {
            store.replace(snapshot_of(generation + 1, &format!("gen{generation}")));
        }
        stop.store(true, Ordering::Relaxed);

        for r in readers {
            assert!(r.join().unwrap() > 0);
        }
    }
}
