//! Minimal Cloud Storage client over the JSON API.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use datamove_core::{Error, ObjectAttrs, Result};
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

pub const DEFAULT_ENDPOINT: &str = "https://storage.googleapis.com";
const REQUEST_TIMEOUT_SECS: u64 = 300;

/// Object operations the GCS store needs.
#[async_trait]
pub trait GcsClient: Send + Sync {
    /// Every object under `prefix`, with its custom metadata.
    async fn list_objects(&self, bucket: &str, prefix: &str) -> Result<Vec<ObjectAttrs>>;

    async fn upload(
        &self,
        bucket: &str,
        name: &str,
        body: Bytes,
        metadata: HashMap<String, String>,
    ) -> Result<()>;

    async fn download(&self, bucket: &str, name: &str) -> Result<Bytes>;

    async fn delete(&self, bucket: &str, name: &str) -> Result<()>;
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListResponse {
    #[serde(default)]
    items: Vec<ObjectResource>,
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ObjectResource {
    name: String,
    #[serde(default)]
    metadata: HashMap<String, String>,
}

/// Separates the JSON object resource from the media in an upload body.
const MULTIPART_BOUNDARY: &str = "datamove_chunk_5f3c9a1e7b2d4086";

/// Body of a `multipart/related` upload carrying the object's metadata
/// together with its media, so both are written in one request.
fn multipart_body(name: &str, metadata: &HashMap<String, String>, media: &[u8]) -> Result<Bytes> {
    let resource = serde_json::to_vec(&json!({ "name": name, "metadata": metadata }))?;

    let mut out = BytesMut::with_capacity(media.len() + resource.len() + 192);
    out.extend_from_slice(
        format!(
            "--{}\r\nContent-Type: application/json; charset=UTF-8\r\n\r\n",
            MULTIPART_BOUNDARY
        )
        .as_bytes(),
    );
    out.extend_from_slice(&resource);
    out.extend_from_slice(
        format!(
            "\r\n--{}\r\nContent-Type: application/octet-stream\r\n\r\n",
            MULTIPART_BOUNDARY
        )
        .as_bytes(),
    );
    out.extend_from_slice(media);
    out.extend_from_slice(format!("\r\n--{}--\r\n", MULTIPART_BOUNDARY).as_bytes());
    Ok(out.freeze())
}

/// Deleting an object that is already gone counts as success.
fn already_deleted(status: StatusCode) -> bool {
    status == StatusCode::NOT_FOUND
}

fn http_error(action: &str, name: &str, err: reqwest::Error) -> Error {
    Error::Storage(format!("failed to {} {}: {}", action, name, err))
}

pub struct HttpGcsClient {
    client: Client,
    endpoint: String,
    access_token: Option<String>,
}

impl HttpGcsClient {
    pub fn new(endpoint: impl Into<String>, access_token: Option<String>) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()
            .map_err(|e| Error::Connection(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self {
            client,
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            access_token,
        })
    }

    fn object_url(&self, bucket: &str, name: &str) -> String {
        format!(
            "{}/storage/v1/b/{}/o/{}",
            self.endpoint,
            urlencoding::encode(bucket),
            urlencoding::encode(name)
        )
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.access_token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }
}

#[async_trait]
impl GcsClient for HttpGcsClient {
    async fn list_objects(&self, bucket: &str, prefix: &str) -> Result<Vec<ObjectAttrs>> {
        let url = format!("{}/storage/v1/b/{}/o", self.endpoint, urlencoding::encode(bucket));
        let mut objects = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            let mut query = vec![("prefix", prefix.to_string())];
            if let Some(token) = page_token.take() {
                query.push(("pageToken", token));
            }
            let page: ListResponse = self
                .authorize(self.client.get(&url).query(&query))
                .send()
                .await
                .and_then(|r| r.error_for_status())
                .map_err(|e| http_error("list", prefix, e))?
                .json()
                .await
                .map_err(|e| http_error("decode listing of", prefix, e))?;

            objects.extend(page.items.into_iter().map(|item| ObjectAttrs {
                name: item.name,
                metadata: item.metadata,
            }));
            match page.next_page_token {
                Some(token) => page_token = Some(token),
                None => break,
            }
        }
        debug!(bucket, prefix, objects = objects.len(), "listed objects");
        Ok(objects)
    }

    async fn upload(
        &self,
        bucket: &str,
        name: &str,
        body: Bytes,
        metadata: HashMap<String, String>,
    ) -> Result<()> {
        let url = format!(
            "{}/upload/storage/v1/b/{}/o",
            self.endpoint,
            urlencoding::encode(bucket)
        );
        let body = multipart_body(name, &metadata, &body)?;
        self.authorize(self.client.post(&url))
            .query(&[("uploadType", "multipart")])
            .header(
                reqwest::header::CONTENT_TYPE,
                format!("multipart/related; boundary={}", MULTIPART_BOUNDARY),
            )
            .body(body)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| http_error("upload", name, e))?;
        Ok(())
    }

    async fn download(&self, bucket: &str, name: &str) -> Result<Bytes> {
        self.authorize(self.client.get(self.object_url(bucket, name)))
            .query(&[("alt", "media")])
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| http_error("download", name, e))?
            .bytes()
            .await
            .map_err(|e| http_error("read", name, e))
    }

    async fn delete(&self, bucket: &str, name: &str) -> Result<()> {
        let response = self
            .authorize(self.client.delete(self.object_url(bucket, name)))
            .send()
            .await
            .map_err(|e| http_error("delete", name, e))?;
        if already_deleted(response.status()) {
            debug!(bucket, name, "object already deleted");
            return Ok(());
        }
        response
            .error_for_status()
            .map_err(|e| http_error("delete", name, e))?;
        Ok(())
    }
}
