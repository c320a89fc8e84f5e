//! One-way pull sync from an object store into the local dataset.
//!
//! Only missing files are downloaded; files already present are left alone,
//! even if the remote copy changed. Each download lands in a hidden temp file
//! next to its destination and is renamed into place, so the dataset watcher
//! only ever sees complete images.

use crate::store::{ObjectKey, ObjectStore, ObjectStoreError};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("listing remote objects: {0}")]
    List(#[source] ObjectStoreError),
    #[error("preparing {path}: {source}")]
    Local {
        path: String,
        source: std::io::Error,
    },
}

/// Outcome of one sync pass.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SyncReport {
    pub downloaded: usize,
    pub skipped: usize,
    pub failed: usize,
}

/// Download every image key absent from `dataset`.
///
/// A failed download is counted and logged; it is retried on the next pass.
pub async fn sync_once(store: &dyn ObjectStore, dataset: &Path) -> Result<SyncReport, SyncError> {
    tokio::fs::create_dir_all(dataset)
        .await
        .map_err(|source| SyncError::Local {
            path: dataset.display().to_string(),
            source,
        })?;

    let names = store.list().await.map_err(SyncError::List)?;
    let mut report = SyncReport::default();

    for name in names {
        let key = match ObjectKey::parse(&name) {
            Ok(key) if key.is_image() => key,
            _ => {
                tracing::trace!(key = %name, "ignoring non-dataset object");
                continue;
            }
        };

        let dest = key.local_path(dataset);
        if tokio::fs::try_exists(&dest).await.unwrap_or(false) {
            report.skipped += 1;
            continue;
        }

        match fetch(store, &key, &dest).await {
            Ok(()) => {
                report.downloaded += 1;
                tracing::info!(key = %key, "downloaded dataset image");
            }
            Err(e) => {
                report.failed += 1;
                tracing::warn!(key = %key, error = %e, "dataset image download failed");
            }
        }
    }

    tracing::debug!(
        downloaded = report.downloaded,
        skipped = report.skipped,
        failed = report.failed,
        "sync pass complete"
    );
    Ok(report)
}

async fn fetch(store: &dyn ObjectStore, key: &ObjectKey, dest: &Path) -> Result<(), ObjectStoreError> {
    let bytes = store.download(key).await?;
    let parent = dest.parent().unwrap_or(Path::new("."));
    tokio::fs::create_dir_all(parent).await?;

    let tmp = temp_path(parent, key.filename());
    if let Err(e) = tokio::fs::write(&tmp, &bytes).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(e.into());
    }
    if let Err(e) = tokio::fs::rename(&tmp, dest).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(e.into());
    }
    Ok(())
}

/// `.{filename}.{uuid}.part` in `dir`; hidden so neither the builder nor the
/// watcher picks it up.
fn temp_path(dir: &Path, filename: &str) -> PathBuf {
    dir.join(format!(".{filename}.{}.part", uuid::Uuid::new_v4().simple()))
}

/// Run [`sync_once`] every `interval` until `shutdown` flips to `true`.
pub async fn run_periodic(
    store: Box<dyn ObjectStore>,
    dataset: PathBuf,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match sync_once(store.as_ref(), &dataset).await {
                    Ok(report) if report.downloaded > 0 || report.failed > 0 => {
                        tracing::info!(
                            downloaded = report.downloaded,
                            failed = report.failed,
                            "dataset synced"
                        );
                    }
                    Ok(_) => {}
                    Err(e) => tracing::warn!(error = %e, "dataset sync failed; retrying next interval"),
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
    tracing::debug!("sync loop stopped");
}
