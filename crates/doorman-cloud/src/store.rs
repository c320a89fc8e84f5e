use async_trait::async_trait;
use std::fmt;
use std::path::{Path, PathBuf};
use thiserror::Error;

const IMAGE_EXTENSIONS: [&str; 5] = ["jpg", "jpeg", "png", "bmp", "webp"];

#[derive(Error, Debug)]
pub enum ObjectStoreError {
    #[error("object not found: {0}")]
    NotFound(String),
    #[error("invalid object key: {0}")]
    InvalidKey(String),
    #[error("http: {0}")]
    Http(#[from] reqwest::Error),
    #[error("unexpected status {status} for {key}")]
    Status { status: u16, key: String },
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

/// A validated `{person}/{filename}` key.
///
/// Both parts are single, non-hidden path components, so a key can always be
/// joined onto the dataset root without escaping it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ObjectKey {
    person: String,
    filename: String,
}

impl ObjectKey {
    pub fn new(person: &str, filename: &str) -> Result<Self, ObjectStoreError> {
        if !is_safe_component(person) || !is_safe_component(filename) {
            return Err(ObjectStoreError::InvalidKey(format!("{person}/{filename}")));
        }
        Ok(Self {
            person: person.to_string(),
            filename: filename.to_string(),
        })
    }

    /// Parse `person/filename`; anything deeper or shallower is rejected.
    pub fn parse(key: &str) -> Result<Self, ObjectStoreError> {
        match key.split('/').collect::<Vec<_>>().as_slice() {
            [person, filename] => Self::new(person, filename),
            _ => Err(ObjectStoreError::InvalidKey(key.to_string())),
        }
    }

    pub fn person(&self) -> &str {
        &self.person
    }

    pub fn filename(&self) -> &str {
        &self.filename
    }

    /// Local path of this object under `root`.
    pub fn local_path(&self, root: &Path) -> PathBuf {
        root.join(&self.person).join(&self.filename)
    }

    /// Whether the filename carries a known image extension.
    pub fn is_image(&self) -> bool {
        Path::new(&self.filename)
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| IMAGE_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
            .unwrap_or(false)
    }

    /// MIME type inferred from the extension.
    pub fn content_type(&self) -> &'static str {
        let ext = Path::new(&self.filename)
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase());
        match ext.as_deref() {
            Some("jpg" | "jpeg") => "image/jpeg",
            Some("png") => "image/png",
            Some("bmp") => "image/bmp",
            Some("webp") => "image/webp",
            _ => "application/octet-stream",
        }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.person, self.filename)
    }
}

fn is_safe_component(s: &str) -> bool {
    !s.is_empty() && !s.starts_with('.') && !s.contains(['/', '\\', '\0'])
}

/// Durable blob storage for dataset images.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// All keys in the store, in backend order. Keys that do not follow the
    /// `person/filename` layout are returned too; callers filter them.
    async fn list(&self) -> Result<Vec<String>, ObjectStoreError>;

    async fn download(&self, key: &ObjectKey) -> Result<Vec<u8>, ObjectStoreError>;

    async fn upload(&self, key: &ObjectKey, bytes: Vec<u8>) -> Result<(), ObjectStoreError>;

    /// Delete a blob. A missing blob is [`ObjectStoreError::NotFound`].
    async fn delete(&self, key: &ObjectKey) -> Result<(), ObjectStoreError>;
}
