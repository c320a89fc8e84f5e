//! doorman-cloud: cloud storage for the enrollment dataset.
//!
//! Blobs are keyed `{person}/{filename}`, mirroring the local
//! `dataset/<person>/<image>` layout. The daemon only pulls (one-way sync);
//! the CLI uploads and deletes when enrolling or removing images.

pub mod firebase;
pub mod fs;
pub mod store;
pub mod sync;

pub use firebase::FirebaseStore;
pub use fs::FsObjectStore;
pub use store::{ObjectKey, ObjectStore, ObjectStoreError};
pub use sync::{run_periodic, sync_once, SyncError, SyncReport};

use std::path::Path;

/// The object store selected by configuration: Firebase when a bucket is
/// set, otherwise a mounted directory, otherwise none.
pub fn configured_store(
    firebase_bucket: Option<&str>,
    firebase_token: Option<&str>,
    object_store_dir: Option<&Path>,
) -> Result<Option<Box<dyn ObjectStore>>, ObjectStoreError> {
    if let Some(bucket) = firebase_bucket {
        let store = FirebaseStore::new(bucket, firebase_token.map(str::to_owned))?;
        return Ok(Some(Box::new(store)));
    }
    Ok(object_store_dir.map(|dir| Box::new(FsObjectStore::new(dir)) as Box<dyn ObjectStore>))
}
