//! Firebase Storage backend (REST v0 API).

use crate::store::{ObjectKey, ObjectStore, ObjectStoreError};
use async_trait::async_trait;
use reqwest::{StatusCode, Url};
use serde::Deserialize;
use std::time::Duration;

const DEFAULT_ENDPOINT: &str = "https://firebasestorage.googleapis.com";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Deserialize)]
struct ListPage {
    #[serde(default)]
    items: Vec<ListItem>,
    #[serde(rename = "nextPageToken")]
    next_page_token: Option<String>,
}

#[derive(Deserialize)]
struct ListItem {
    name: String,
}

/// Blobs in a Firebase Storage bucket, optionally authorized with a bearer token.
pub struct FirebaseStore {
    client: reqwest::Client,
    endpoint: Url,
    bucket: String,
    token: Option<String>,
}

impl FirebaseStore {
    pub fn new(bucket: &str, token: Option<String>) -> Result<Self, ObjectStoreError> {
        Self::with_endpoint(DEFAULT_ENDPOINT, bucket, token)
    }

    /// Point at a non-default endpoint (e.g. the Firebase emulator).
    pub fn with_endpoint(
        endpoint: &str,
        bucket: &str,
        token: Option<String>,
    ) -> Result<Self, ObjectStoreError> {
        let endpoint = Url::parse(endpoint)
            .map_err(|e| ObjectStoreError::InvalidKey(format!("endpoint {endpoint}: {e}")))?;
        let client = reqwest::Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self {
            client,
            endpoint,
            bucket: bucket.to_string(),
            token,
        })
    }

    /// `{endpoint}/v0/b/{bucket}/o[/{object}]`, with the object name as one
    /// percent-encoded segment (`alice/a.jpg` → `alice%2Fa.jpg`).
    fn objects_url(&self, object: Option<&str>) -> Url {
        let mut url = self.endpoint.clone();
        if let Ok(mut segments) = url.path_segments_mut() {
            segments.pop_if_empty().extend(["v0", "b", &self.bucket, "o"]);
            if let Some(object) = object {
                segments.push(object);
            }
        }
        url
    }

    fn authorized(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => req.bearer_auth(token),
            None => req,
        }
    }
}

fn check_status(status: StatusCode, key: &str) -> Result<(), ObjectStoreError> {
    if status == StatusCode::NOT_FOUND {
        return Err(ObjectStoreError::NotFound(key.to_string()));
    }
    if !status.is_success() {
        return Err(ObjectStoreError::Status {
            status: status.as_u16(),
            key: key.to_string(),
        });
    }
    Ok(())
}

#[async_trait]
impl ObjectStore for FirebaseStore {
    async fn list(&self) -> Result<Vec<String>, ObjectStoreError> {
        let mut names = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            let mut url = self.objects_url(None);
            if let Some(token) = &page_token {
                url.query_pairs_mut().append_pair("pageToken", token);
            }
            let resp = self.authorized(self.client.get(url)).send().await?;
            check_status(resp.status(), &self.bucket)?;
            let page: ListPage = resp.json().await?;

            names.extend(page.items.into_iter().map(|item| item.name));
            match page.next_page_token {
                Some(next) if !next.is_empty() => page_token = Some(next),
                _ => break,
            }
        }

        tracing::debug!(bucket = %self.bucket, count = names.len(), "listed objects");
        Ok(names)
    }

    async fn download(&self, key: &ObjectKey) -> Result<Vec<u8>, ObjectStoreError> {
        let name = key.to_string();
        let mut url = self.objects_url(Some(&name));
        url.query_pairs_mut().append_pair("alt", "media");

        let resp = self.authorized(self.client.get(url)).send().await?;
        check_status(resp.status(), &name)?;
        Ok(resp.bytes().await?.to_vec())
    }

    async fn upload(&self, key: &ObjectKey, bytes: Vec<u8>) -> Result<(), ObjectStoreError> {
        let name = key.to_string();
        let mut url = self.objects_url(None);
        url.query_pairs_mut()
            .append_pair("uploadType", "media")
            .append_pair("name", &name);

        let resp = self
            .authorized(self.client.post(url))
            .header(reqwest::header::CONTENT_TYPE, key.content_type())
            .body(bytes)
            .send()
            .await?;
        check_status(resp.status(), &name)?;
        tracing::info!(key = %name, "uploaded object");
        Ok(())
    }

    async fn delete(&self, key: &ObjectKey) -> Result<(), ObjectStoreError> {
        let name = key.to_string();
        let url = self.objects_url(Some(&name));

        let resp = self.authorized(self.client.delete(url)).send().await?;
        check_status(resp.status(), &name)?;
        tracing::info!(key = %name, "deleted object");
        Ok(())
    }
}
