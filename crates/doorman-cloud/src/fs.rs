//! Object store backed by a local (or mounted) directory with the same
//! `person/filename` layout as the dataset.

use crate::store::{ObjectKey, ObjectStore, ObjectStoreError};
use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

pub struct FsObjectStore {
    root: PathBuf,
}

impl FsObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

fn not_found(key: &ObjectKey) -> impl FnOnce(std::io::Error) -> ObjectStoreError + '_ {
    move |e| {
        if e.kind() == ErrorKind::NotFound {
            ObjectStoreError::NotFound(key.to_string())
        } else {
            ObjectStoreError::Io(e)
        }
    }
}

#[async_trait]
impl ObjectStore for FsObjectStore {
    async fn list(&self) -> Result<Vec<String>, ObjectStoreError> {
        let mut keys = Vec::new();
        let mut people = match tokio::fs::read_dir(&self.root).await {
            Ok(rd) => rd,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(keys),
            Err(e) => return Err(e.into()),
        };

        while let Some(person) = people.next_entry().await? {
            if !person.file_type().await?.is_dir() {
                continue;
            }
            let person_name = person.file_name().to_string_lossy().into_owned();
            let mut files = tokio::fs::read_dir(person.path()).await?;
            while let Some(file) = files.next_entry().await? {
                if file.file_type().await?.is_file() {
                    keys.push(format!("{person_name}/{}", file.file_name().to_string_lossy()));
                }
            }
        }

        keys.sort();
        Ok(keys)
    }

    async fn download(&self, key: &ObjectKey) -> Result<Vec<u8>, ObjectStoreError> {
        tokio::fs::read(key.local_path(&self.root))
            .await
            .map_err(not_found(key))
    }

    async fn upload(&self, key: &ObjectKey, bytes: Vec<u8>) -> Result<(), ObjectStoreError> {
        let path = key.local_path(&self.root);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, bytes).await?;
        tracing::debug!(key = %key, "stored object");
        Ok(())
    }

    async fn delete(&self, key: &ObjectKey) -> Result<(), ObjectStoreError> {
        tokio::fs::remove_file(key.local_path(&self.root))
            .await
            .map_err(not_found(key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_upload_list_download_delete() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsObjectStore::new(dir.path());
        let key = ObjectKey::parse("alice/a.jpg").unwrap();

        store.upload(&key, b"jpeg bytes".to_vec()).await.unwrap();
        store
            .upload(&ObjectKey::parse("bob/b.png").unwrap(), vec![1, 2, 3])
            .await
            .unwrap();
        std::fs::write(dir.path().join("stray.txt"), b"x").unwrap();

        assert_eq!(store.list().await.unwrap(), vec!["alice/a.jpg", "bob/b.png"]);
        assert_eq!(store.download(&key).await.unwrap(), b"jpeg bytes");

        store.delete(&key).await.unwrap();
        assert!(matches!(
            store.download(&key).await,
            Err(ObjectStoreError::NotFound(_))
        ));
        assert!(matches!(store.delete(&key).await, Err(ObjectStoreError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_list_missing_root_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsObjectStore::new(dir.path().join("nope"));
        assert!(store.list().await.unwrap().is_empty());
    }
}
