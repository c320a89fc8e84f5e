//! Recursive dataset watcher.

use notify::event::{CreateKind, ModifyKind, RemoveKind};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum WatchError {
    #[error("cannot watch {path}: {source}")]
    Init {
        path: String,
        source: notify::Error,
    },
}

/// Calls `on_change` for every relevant change under the dataset root.
///
/// After [`stop`](Self::stop) returns, the callback is never invoked again: it
/// runs under the same lock that `stop` takes to flip the active flag.
pub struct DatasetWatcher {
    watcher: Option<RecommendedWatcher>,
    active: Arc<Mutex<bool>>,
    root: PathBuf,
}

impl DatasetWatcher {
    /// Watch `root` recursively. Events on any path in `ignore` (typically the
    /// embedding cache) are dropped.
    pub fn start(
        root: &Path,
        ignore: &[PathBuf],
        on_change: impl Fn() + Send + 'static,
    ) -> Result<Self, WatchError> {
        let init_err = |source| WatchError::Init {
            path: root.display().to_string(),
            source,
        };
        let root = root.canonicalize().map_err(|e| init_err(notify::Error::io(e)))?;
        let ignore: Vec<PathBuf> = ignore.iter().map(|p| absolute(p)).collect();

        let watch_root = root.clone();
        let active = Arc::new(Mutex::new(true));
        let gate = Arc::clone(&active);

        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| match res {
            Ok(event) => {
                let active = gate.lock().unwrap_or_else(PoisonError::into_inner);
                if *active && is_relevant(&event, &watch_root, &ignore) {
                    tracing::debug!(kind = ?event.kind, paths = ?event.paths, "dataset changed");
                    on_change();
                }
            }
            Err(e) => tracing::warn!(error = %e, "dataset watch error"),
        })
        .map_err(init_err)?;
        watcher
            .watch(&root, RecursiveMode::Recursive)
            .map_err(init_err)?;

        tracing::info!(root = %root.display(), "watching dataset");
        Ok(Self {
            watcher: Some(watcher),
            active,
            root,
        })
    }

    /// Stop watching. Idempotent.
    pub fn stop(&mut self) {
        *self.active.lock().unwrap_or_else(PoisonError::into_inner) = false;
        if let Some(mut watcher) = self.watcher.take() {
            let _ = watcher.unwatch(&self.root);
            tracing::info!(root = %self.root.display(), "dataset watch stopped");
        }
    }
}

impl Drop for DatasetWatcher {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Canonical form of `path` even if the file itself does not exist yet.
fn absolute(path: &Path) -> PathBuf {
    if let Ok(p) = path.canonicalize() {
        return p;
    }
    match (path.parent(), path.file_name()) {
        (Some(parent), Some(name)) => {
            let parent = if parent.as_os_str().is_empty() {
                Path::new(".")
            } else {
                parent
            };
            parent
                .canonicalize()
                .map(|p| p.join(name))
                .unwrap_or_else(|_| path.to_path_buf())
        }
        _ => path.to_path_buf(),
    }
}

/// Whether `event` can change the authorized set.
///
/// Access and metadata-only events, new empty folders, hidden or temp files
/// (dot-prefixed, e.g. in-progress sync downloads or cache writes), ignored
/// paths and plain files at the dataset root do not. Only identity folders
/// directly under `root` count there.
fn is_relevant(event: &Event, root: &Path, ignore: &[PathBuf]) -> bool {
    match event.kind {
        EventKind::Create(CreateKind::Folder) => return false,
        EventKind::Create(_) | EventKind::Remove(_) => {}
        EventKind::Modify(ModifyKind::Metadata(_)) => return false,
        EventKind::Modify(_) => {}
        EventKind::Access(_) | EventKind::Any | EventKind::Other => return false,
    }

    event.paths.iter().any(|path| {
        let hidden = path
            .file_name()
            .map(|n| n.to_string_lossy().starts_with('.'))
            .unwrap_or(true);
        if hidden || ignore.iter().any(|i| i == path) {
            return false;
        }
        path.parent() != Some(root) || is_identity_folder(event.kind, path)
    })
}

/// Whether a path directly under the dataset root names an identity folder.
/// A removed path can no longer be inspected, so its event kind decides.
fn is_identity_folder(kind: EventKind, path: &Path) -> bool {
    match kind {
        EventKind::Remove(RemoveKind::Folder) => true,
        EventKind::Remove(RemoveKind::File) => false,
        _ => path.is_dir(),
    }
}
