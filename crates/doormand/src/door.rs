//! Actions taken on an authorized match: open the door and log the entry.

use crate::pipeline::AccessHandler;
use image::GrayImage;
use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::runtime::Handle;

#[derive(Error, Debug)]
pub enum DoorError {
    #[error("door request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("door endpoint answered {0}")]
    Status(u16),
}

#[derive(Error, Debug)]
pub enum EntryError {
    #[error("creating {path}: {source}")]
    Dir {
        path: String,
        source: std::io::Error,
    },
    #[error("writing entry image: {0}")]
    Image(#[from] image::ImageError),
}

#[derive(Debug, Serialize)]
struct OpenRequest<'a> {
    identity: &'a str,
    confidence: f32,
}

/// Fire-and-forget door-open POSTs, at most one per identity per cooldown.
pub struct DoorNotifier {
    client: reqwest::Client,
    url: String,
    cooldown: Duration,
    last_opened: Mutex<HashMap<String, Instant>>,
    runtime: Handle,
}

impl DoorNotifier {
    pub fn new(
        url: &str,
        timeout: Duration,
        cooldown: Duration,
        runtime: Handle,
    ) -> Result<Self, DoorError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url: url.to_string(),
            cooldown,
            last_opened: Mutex::new(HashMap::new()),
            runtime,
        })
    }

    /// Send the door-open request in the background. Returns `false` when
    /// `identity` is still inside its cooldown and nothing was sent.
    pub fn notify(&self, identity: &str, confidence: f32) -> bool {
        if !self.should_fire(identity, Instant::now()) {
            tracing::debug!(identity, "door cooldown active");
            return false;
        }

        let client = self.client.clone();
        let url = self.url.clone();
        let identity = identity.to_string();
        self.runtime.spawn(async move {
            match post_open(&client, &url, &identity, confidence).await {
                Ok(()) => tracing::info!(identity = %identity, confidence, "door opened"),
                Err(e) => tracing::warn!(identity = %identity, url = %url, error = %e, "door notification failed"),
            }
        });
        true
    }

    fn should_fire(&self, identity: &str, now: Instant) -> bool {
        let mut last = self.last_opened.lock().unwrap_or_else(PoisonError::into_inner);
        match last.get(identity) {
            Some(&at) if now.saturating_duration_since(at) < self.cooldown => false,
            _ => {
                last.insert(identity.to_string(), now);
                true
            }
        }
    }
}

async fn post_open(
    client: &reqwest::Client,
    url: &str,
    identity: &str,
    confidence: f32,
) -> Result<(), DoorError> {
    let resp = client
        .post(url)
        .json(&OpenRequest {
            identity,
            confidence,
        })
        .send()
        .await?;
    if !resp.status().is_success() {
        return Err(DoorError::Status(resp.status().as_u16()));
    }
    Ok(())
}

/// Face crops of authorized entries, saved as `<identity>_<YYYYmmdd_HHMMSS>.jpg`.
pub struct EntryLog {
    dir: PathBuf,
}

impl EntryLog {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn record(&self, identity: &str, face: &GrayImage) -> Result<PathBuf, EntryError> {
        std::fs::create_dir_all(&self.dir).map_err(|source| EntryError::Dir {
            path: self.dir.display().to_string(),
            source,
        })?;
        let path = self.dir.join(entry_file_name(identity, chrono::Local::now()));
        face.save(&path)?;
        Ok(path)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

fn entry_file_name<Tz: chrono::TimeZone>(identity: &str, at: chrono::DateTime<Tz>) -> String
where
    Tz::Offset: std::fmt::Display,
{
    format!("{identity}_{}.jpg", at.format("%Y%m%d_%H%M%S"))
}

/// The daemon's [`AccessHandler`]: door first, then the entry log, both
/// gated by the door cooldown.
pub struct DoorActions {
    door: DoorNotifier,
    entries: EntryLog,
}

impl DoorActions {
    pub fn new(door: DoorNotifier, entries: EntryLog) -> Self {
        Self { door, entries }
    }
}

impl AccessHandler for DoorActions {
    fn granted(&self, identity: &str, confidence: f32, face: &GrayImage) {
        if !self.door.notify(identity, confidence) {
            return;
        }
        match self.entries.record(identity, face) {
            Ok(path) => tracing::info!(identity, path = %path.display(), "entry logged"),
            Err(e) => tracing::warn!(identity, error = %e, "entry log failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use image::Luma;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn notifier(url: &str, cooldown: Duration) -> DoorNotifier {
        DoorNotifier::new(url, Duration::from_millis(500), cooldown, Handle::current()).unwrap()
    }

    #[tokio::test]
    async fn test_cooldown_per_identity() {
        let door = notifier("http://127.0.0.1:9/open", Duration::from_secs(5));
        let t0 = Instant::now();
        assert!(door.should_fire("alice", t0));
        assert!(!door.should_fire("alice", t0 + Duration::from_secs(2)));
        assert!(door.should_fire("bob", t0 + Duration::from_secs(2)));
        assert!(door.should_fire("alice", t0 + Duration::from_secs(6)));
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_does_not_block() {
        let door = notifier("http://127.0.0.1:9/open", Duration::ZERO);
        let started = Instant::now();
        assert!(door.notify("alice", 97.5));
        assert!(started.elapsed() < Duration::from_millis(100));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_posts_identity_and_confidence() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}/open", listener.local_addr().unwrap());
        let server = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut request = Vec::new();
            let mut buf = [0u8; 1024];
            while !String::from_utf8_lossy(&request).contains('}') {
                let n = sock.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                request.extend_from_slice(&buf[..n]);
            }
            sock.write_all(b"HTTP/1.1 200 OK\r\ncontent-length: 0\r\n\r\n")
                .await
                .unwrap();
            String::from_utf8_lossy(&request).into_owned()
        });

        let door = notifier(&url, Duration::from_secs(5));
        assert!(door.notify("alice", 88.0));
        assert!(!door.notify("alice", 90.0));

        let request = tokio::time::timeout(Duration::from_secs(5), server)
            .await
            .unwrap()
            .unwrap();
        assert!(request.starts_with("POST /open"));
        assert!(request.contains(r#""identity":"alice""#));
        assert!(request.contains(r#""confidence":88.0"#));
    }

    #[test]
    fn test_entry_file_name() {
        let at = chrono::Utc.with_ymd_and_hms(2024, 3, 9, 7, 5, 1).unwrap();
        assert_eq!(entry_file_name("alice", at), "alice_20240309_070501.jpg");
    }

    #[test]
    fn test_entry_log_writes_jpeg() {
        let dir = tempfile::tempdir().unwrap();
        let log = EntryLog::new(dir.path().join("entries"));
        let path = log
            .record("bob", &GrayImage::from_pixel(24, 24, Luma([120])))
            .unwrap();

        assert!(path.starts_with(log.dir()));
        let name = path.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("bob_") && name.ends_with(".jpg"), "{name}");
        let saved = image::open(&path).unwrap();
        assert_eq!((saved.width(), saved.height()), (24, 24));
    }
}
