//! Background store rebuilds triggered by dataset changes.

use doorman_core::{BuildError, EmbeddingBuilder, EmbeddingStore, FaceAnalyzer, Snapshot};
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

enum Signal {
    Changed,
    Stop,
}

/// Cloneable handle used to request a rebuild.
#[derive(Clone)]
pub struct RebuildTrigger(mpsc::Sender<Signal>);

impl RebuildTrigger {
    pub fn fire(&self) {
        // A closed channel means the worker has stopped; nothing left to do.
        let _ = self.0.send(Signal::Changed);
    }
}

/// Rebuild the store from `dataset` and persist the result to `cache`.
///
/// A failed build leaves the current snapshot in place. A failed persist is
/// logged only: the in-memory store is already current.
pub fn rebuild<A: FaceAnalyzer + ?Sized>(
    store: &EmbeddingStore,
    builder: &EmbeddingBuilder,
    analyzer: &mut A,
    dataset: &Path,
    cache: &Path,
) -> Result<Arc<Snapshot>, BuildError> {
    let snapshot = store.rebuild_with(|| builder.build(dataset, analyzer))?;
    if let Err(e) = snapshot.persist(cache) {
        tracing::warn!(path = %cache.display(), error = %e, "persisting embedding cache failed");
    }
    Ok(snapshot)
}

/// Dedicated rebuild thread owning its own analyzer.
///
/// Change signals arriving within `debounce` of each other are coalesced into
/// one rebuild.
pub struct RebuildWorker {
    tx: mpsc::Sender<Signal>,
    handle: Option<JoinHandle<()>>,
}

impl RebuildWorker {
    pub fn spawn<A: FaceAnalyzer + 'static>(
        store: Arc<EmbeddingStore>,
        builder: EmbeddingBuilder,
        mut analyzer: A,
        dataset: PathBuf,
        cache: PathBuf,
        debounce: Duration,
    ) -> std::io::Result<Self> {
        let (tx, rx) = mpsc::channel();

        let handle = std::thread::Builder::new()
            .name("doorman-rebuild".into())
            .spawn(move || {
                tracing::debug!("rebuild worker started");
                while let Ok(Signal::Changed) = rx.recv() {
                    let mut coalesced = 1u32;
                    let stop = loop {
                        match rx.recv_timeout(debounce) {
                            Ok(Signal::Changed) => coalesced += 1,
                            Ok(Signal::Stop) | Err(RecvTimeoutError::Disconnected) => break true,
                            Err(RecvTimeoutError::Timeout) => break false,
                        }
                    };
                    if stop {
                        break;
                    }

                    let started = Instant::now();
                    match rebuild(&store, &builder, &mut analyzer, &dataset, &cache) {
                        Ok(snapshot) => tracing::info!(
                            embeddings = snapshot.len(),
                            identities = snapshot.identities().len(),
                            coalesced,
                            elapsed_ms = started.elapsed().as_millis() as u64,
                            "embedding store rebuilt"
                        ),
                        Err(e) => tracing::error!(error = %e, "rebuild failed; keeping previous snapshot"),
                    }
                }
                tracing::debug!("rebuild worker exiting");
            })?;

        Ok(Self {
            tx,
            handle: Some(handle),
        })
    }

    pub fn trigger(&self) -> RebuildTrigger {
        RebuildTrigger(self.tx.clone())
    }

    /// Stop the worker and wait for it. A rebuild in progress completes;
    /// pending signals are discarded.
    pub fn stop(&mut self) {
        if let Some(handle) = self.handle.take() {
            let _ = self.tx.send(Signal::Stop);
            if handle.join().is_err() {
                tracing::error!("rebuild worker panicked");
            }
        }
    }
}

impl Drop for RebuildWorker {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use doorman_core::{AnalyzerError, BoundingBox, Embedding};
    use crate::watcher::DatasetWatcher;
    use image::{GrayImage, Luma};
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Counts detect calls; one per dataset image per build.
    #[derive(Clone, Default)]
    struct Counting(Arc<AtomicUsize>);

    impl FaceAnalyzer for Counting {
        fn detect(&mut self, image: &GrayImage) -> Result<Vec<BoundingBox>, AnalyzerError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(vec![BoundingBox {
                x: 0.0,
                y: 0.0,
                width: image.width() as f32,
                height: image.height() as f32,
                confidence: 0.9,
                landmarks: None,
            }])
        }

        fn embed(&mut self, image: &GrayImage, _face: &BoundingBox) -> Result<Embedding, AnalyzerError> {
            let v = image.get_pixel(0, 0).0[0] as f32;
            Ok(Embedding::new(vec![v + 1.0, 1.0]))
        }
    }

    fn add_image(root: &Path, identity: &str, name: &str) {
        let dir = root.join(identity);
        std::fs::create_dir_all(&dir).unwrap();
        GrayImage::from_pixel(8, 8, Luma([100])).save(dir.join(name)).unwrap();
    }

    fn wait_for(mut cond: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        false
    }

    #[test]
    fn test_rebuild_publishes_and_persists() {
        let dataset = tempfile::tempdir().unwrap();
        let cache = dataset.path().join("cache.json");
        add_image(dataset.path(), "alice", "a.png");

        let store = EmbeddingStore::new(Snapshot::empty());
        let mut analyzer = Counting::default();
        let snap = rebuild(&store, &EmbeddingBuilder::new(false), &mut analyzer, dataset.path(), &cache).unwrap();

        assert_eq!(snap.names(), &["alice"]);
        assert_eq!(store.read().len(), 1);
        let restored = Snapshot::restore(&cache, None).unwrap();
        assert_eq!(restored.names(), &["alice"]);
    }

    #[test]
    fn test_failed_rebuild_keeps_previous_snapshot() {
        let dataset = tempfile::tempdir().unwrap();
        add_image(dataset.path(), "alice", "a.png");
        let store = EmbeddingStore::new(Snapshot::empty());
        let builder = EmbeddingBuilder::new(false);
        let mut analyzer = Counting::default();
        let cache = dataset.path().join("cache.json");
        rebuild(&store, &builder, &mut analyzer, dataset.path(), &cache).unwrap();

        let missing = dataset.path().join("gone");
        assert!(rebuild(&store, &builder, &mut analyzer, &missing, &cache).is_err());
        assert_eq!(store.read().names(), &["alice"]);
    }

    #[test]
    fn test_worker_coalesces_bursts() {
        let dataset = tempfile::tempdir().unwrap();
        add_image(dataset.path(), "alice", "a.png");
        let cache = dataset.path().join("cache.json");
        let store = Arc::new(EmbeddingStore::new(Snapshot::empty()));
        let analyzer = Counting::default();
        let calls = Arc::clone(&analyzer.0);

        let mut worker = RebuildWorker::spawn(
            Arc::clone(&store),
            EmbeddingBuilder::new(false),
            analyzer,
            dataset.path().to_path_buf(),
            cache.clone(),
            Duration::from_millis(200),
        )
        .unwrap();

        let trigger = worker.trigger();
        for _ in 0..10 {
            trigger.fire();
        }
        assert!(wait_for(|| store.read().len() == 1));
        std::thread::sleep(Duration::from_millis(300));
        assert_eq!(calls.load(Ordering::SeqCst), 1, "ten signals, one build");

        add_image(dataset.path(), "bob", "b.png");
        trigger.fire();
        assert!(wait_for(|| store.read().len() == 2));

        worker.stop();
        trigger.fire();
        assert!(cache.exists());
    }

    #[test]
    fn test_cache_inside_dataset_does_not_retrigger() {
        let dataset = tempfile::tempdir().unwrap();
        add_image(dataset.path(), "alice", "a.png");
        let cache = dataset.path().join("authorized_embeddings.json");
        let store = Arc::new(EmbeddingStore::new(Snapshot::empty()));
        let analyzer = Counting::default();
        let calls = Arc::clone(&analyzer.0);

        let mut worker = RebuildWorker::spawn(
            Arc::clone(&store),
            EmbeddingBuilder::new(false),
            analyzer,
            dataset.path().to_path_buf(),
            cache.clone(),
            Duration::from_millis(50),
        )
        .unwrap();
        let trigger = worker.trigger();
        let mut watcher = DatasetWatcher::start(dataset.path(), std::slice::from_ref(&cache), move || {
            trigger.fire()
        })
        .unwrap();

        add_image(dataset.path(), "alice", "b.png");
        assert!(wait_for(|| store.read().len() == 2));
        assert!(wait_for(|| cache.exists()));

        // Writing the cache must not start another build.
        std::thread::sleep(Duration::from_millis(1500));
        let builds = calls.load(Ordering::SeqCst) / 2;
        assert!(builds <= 2, "{builds} builds after one change");

        watcher.stop();
        worker.stop();
    }
}
