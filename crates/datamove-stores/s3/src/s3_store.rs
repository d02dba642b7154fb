use std::io::Cursor;
use std::sync::Arc;

use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_credential_types::provider::ProvideCredentials;
use aws_sdk_s3::config::{Credentials, Region};
use aws_sdk_s3::error::DisplayErrorContext;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client;
use datamove_core::continuation::{
    chunk_key, filter_from_continuation_point, parse_chunk_name, table_prefix,
};
use datamove_core::{
    Error, ObjectAttrs, PipeReader, Resource, ResourceReader, Result, Store, TableName,
    VerifiedTable,
};
use serde::{Deserialize, Serialize};
use tokio::sync::{oneshot, Mutex};
use tracing::{debug, info, instrument, warn};

const ROWS_METADATA_KEY: &str = "numrows";
const DEFAULT_FLUSH_SIZE: usize = 256 * 1024 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct S3StoreConfig {
    pub bucket: String,

    #[serde(default)]
    pub region: Option<String>,

    /// Custom endpoint for S3-compatible services.
    #[serde(default)]
    pub endpoint: Option<String>,

    /// Static credentials; the default provider chain is used when absent.
    #[serde(default)]
    pub access_key: Option<String>,

    #[serde(default)]
    pub secret_key: Option<String>,

    #[serde(default)]
    pub path_style: bool,
}

/// Credentials embedded into import URLs so the target can fetch the chunks.
#[derive(Clone)]
struct UrlCredentials {
    access_key_id: String,
    secret_access_key: String,
    session_token: Option<String>,
}

impl std::fmt::Debug for UrlCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UrlCredentials")
            .field("access_key_id", &self.access_key_id)
            .finish_non_exhaustive()
    }
}

impl From<&Credentials> for UrlCredentials {
    fn from(creds: &Credentials) -> Self {
        Self {
            access_key_id: creds.access_key_id().to_string(),
            secret_access_key: creds.secret_access_key().to_string(),
            session_token: creds.session_token().map(str::to_string),
        }
    }
}

fn import_url(bucket: &str, key: &str, creds: Option<&UrlCredentials>) -> String {
    let base = format!("s3://{}/{}", bucket, key);
    let Some(creds) = creds else {
        return base;
    };
    let mut url = format!(
        "{}?AWS_ACCESS_KEY_ID={}&AWS_SECRET_ACCESS_KEY={}",
        base,
        urlencoding::encode(&creds.access_key_id),
        urlencoding::encode(&creds.secret_access_key)
    );
    if let Some(token) = &creds.session_token {
        url.push_str("&AWS_SESSION_TOKEN=");
        url.push_str(&urlencoding::encode(token));
    }
    url
}

/// Keys that can survive the continuation filter. Only these are worth a
/// HEAD request for their metadata.
fn continuation_candidates(keys: Vec<String>, continuation_key: &str) -> Result<Vec<String>> {
    let (start, ext) = parse_chunk_name(continuation_key)?;
    Ok(keys
        .into_iter()
        .filter(|key| {
            matches!(parse_chunk_name(key), Ok((ordinal, e)) if ordinal >= start && e == ext)
        })
        .collect())
}

fn storage_error<E>(action: &str, key: &str, err: E) -> Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    Error::Storage(format!("failed to {} {}: {}", action, key, DisplayErrorContext(err)))
}

/// Stores each chunk as one object, with its row count in the object metadata.
///
/// A chunk is buffered in memory before upload because the row count is only
/// known once the chunk is complete; chunk size is bounded by the flush size.
pub struct S3Store {
    client: Client,
    bucket: String,
    creds: Option<UrlCredentials>,
    created: Mutex<Vec<String>>,
}

impl S3Store {
    pub async fn new(config: S3StoreConfig) -> Result<Self> {
        let region = Region::new(config.region.clone().unwrap_or_else(|| "us-east-1".to_string()));

        let (client, creds) = match (&config.access_key, &config.secret_key) {
            (Some(access_key), Some(secret_key)) => {
                let credentials = Credentials::new(access_key, secret_key, None, None, "datamove");
                let mut builder = aws_sdk_s3::Config::builder()
                    .behavior_version(BehaviorVersion::latest())
                    .credentials_provider(credentials.clone())
                    .region(region)
                    .force_path_style(config.path_style);
                if let Some(endpoint) = &config.endpoint {
                    builder = builder.endpoint_url(endpoint);
                }
                let creds = UrlCredentials::from(&credentials);
                (Client::from_conf(builder.build()), Some(creds))
            }
            (None, None) => {
                let sdk_config = aws_config::defaults(BehaviorVersion::latest())
                    .region(region)
                    .load()
                    .await;
                let mut builder =
                    aws_sdk_s3::config::Builder::from(&sdk_config).force_path_style(config.path_style);
                if let Some(endpoint) = &config.endpoint {
                    builder = builder.endpoint_url(endpoint);
                }

                let creds = match sdk_config.credentials_provider() {
                    Some(provider) => match provider.provide_credentials().await {
                        Ok(credentials) => Some(UrlCredentials::from(&credentials)),
                        Err(e) => {
                            warn!(error = %DisplayErrorContext(e), "no AWS credentials for import URLs");
                            None
                        }
                    },
                    None => None,
                };
                (Client::from_conf(builder.build()), creds)
            }
            _ => {
                return Err(Error::Configuration(
                    "s3 access_key and secret_key must be set together".to_string(),
                ))
            }
        };

        info!(bucket = %config.bucket, "S3 store initialized");
        Ok(Self {
            client,
            bucket: config.bucket,
            creds,
            created: Mutex::new(Vec::new()),
        })
    }

    fn resource(&self, key: String, rows: Option<usize>) -> S3Resource {
        S3Resource {
            client: self.client.clone(),
            bucket: self.bucket.clone(),
            key,
            rows,
            creds: self.creds.clone(),
        }
    }

    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        let mut token = None;
        loop {
            let resp = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(prefix)
                .set_continuation_token(token)
                .send()
                .await
                .map_err(|e| storage_error("list", prefix, e))?;

            keys.extend(resp.contents().iter().filter_map(|o| o.key().map(str::to_string)));
            match resp.next_continuation_token() {
                Some(next) => token = Some(next.to_string()),
                None => break,
            }
        }
        Ok(keys)
    }

    async fn object_attrs(&self, key: String) -> Result<ObjectAttrs> {
        let head = self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(&key)
            .send()
            .await
            .map_err(|e| storage_error("inspect", &key, e))?;

        let mut attrs = ObjectAttrs::new(key);
        if let Some(metadata) = head.metadata() {
            attrs.metadata = metadata.clone();
        }
        Ok(attrs)
    }
}

#[async_trait]
impl Store for S3Store {
    #[instrument(skip(self, reader, table, num_rows), fields(table = %table.name))]
    async fn create_from_reader(
        &self,
        mut reader: PipeReader,
        table: &VerifiedTable,
        ordinal: usize,
        file_ext: &str,
        num_rows: oneshot::Receiver<usize>,
    ) -> Result<Arc<dyn Resource>> {
        let key = chunk_key(&table.name, ordinal, file_ext);

        let mut body = Vec::new();
        while let Some(data) = reader.read().await? {
            body.extend_from_slice(&data);
        }
        let rows = num_rows.await.ok();
        let size = body.len();

        let mut request = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(&key)
            .body(ByteStream::from(body));
        if let Some(rows) = rows {
            request = request.metadata(ROWS_METADATA_KEY, rows.to_string());
        }
        request.send().await.map_err(|e| storage_error("upload", &key, e))?;
        self.created.lock().await.push(key.clone());

        debug!(key = %key, bytes = size, rows = ?rows, "uploaded chunk to s3://{}", self.bucket);
        Ok(Arc::new(self.resource(key, rows)))
    }

    fn default_flush_batch_size(&self) -> usize {
        DEFAULT_FLUSH_SIZE
    }

    fn can_be_target(&self) -> bool {
        true
    }

    async fn cleanup(&self) -> Result<()> {
        let created = std::mem::take(&mut *self.created.lock().await);
        let mut acc = None;
        for key in &created {
            let deleted = self
                .client
                .delete_object()
                .bucket(&self.bucket)
                .key(key)
                .send()
                .await
                .map(|_| ())
                .map_err(|e| storage_error("delete", key, e));
            acc = Error::combine_opt(acc, deleted);
        }
        info!(objects = created.len(), "cleaned up s3://{}", self.bucket);
        acc.map_or(Ok(()), Err)
    }

    #[instrument(skip(self))]
    async fn list_from_continuation_point(
        &self,
        continuation_key: &str,
        table: &TableName,
    ) -> Result<Vec<Arc<dyn Resource>>> {
        let keys = self.list_keys(&table_prefix(table)).await?;
        let mut objects = Vec::new();
        for key in continuation_candidates(keys, continuation_key)? {
            objects.push(self.object_attrs(key).await?);
        }

        let chunks = filter_from_continuation_point(objects, continuation_key, ROWS_METADATA_KEY)?;
        Ok(chunks
            .into_iter()
            .map(|chunk| Arc::new(self.resource(chunk.key, chunk.rows)) as Arc<dyn Resource>)
            .collect())
    }
}

#[derive(Debug, Clone)]
pub struct S3Resource {
    client: Client,
    bucket: String,
    key: String,
    rows: Option<usize>,
    creds: Option<UrlCredentials>,
}

#[async_trait]
impl Resource for S3Resource {
    fn key(&self) -> String {
        self.key.clone()
    }

    fn import_url(&self) -> Result<String> {
        Ok(import_url(&self.bucket, &self.key, self.creds.as_ref()))
    }

    fn rows(&self) -> Option<usize> {
        self.rows
    }

    async fn reader(&self) -> Result<ResourceReader> {
        let resp = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(&self.key)
            .send()
            .await
            .map_err(|e| storage_error("download", &self.key, e))?;
        let data = resp
            .body
            .collect()
            .await
            .map_err(|e| storage_error("read", &self.key, e))?
            .into_bytes();
        Ok(Box::new(Cursor::new(data)))
    }

    async fn mark_for_cleanup(&self) -> Result<()> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(&self.key)
            .send()
            .await
            .map_err(|e| storage_error("delete", &self.key, e))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_continuation_candidates_skip_needless_head_requests() {
        let keys = vec![
            "public.inventory/part_00000003.tar.gz".to_string(),
            "public.inventory/part_00000004.tar.gz".to_string(),
            "public.inventory/part_00000005.csv".to_string(),
            "public.inventory/manifest.json".to_string(),
            "public.inventory/part_00000006.tar.gz".to_string(),
        ];

        let candidates = continuation_candidates(keys, "part_00000004.tar.gz").unwrap();
        assert_eq!(
            candidates,
            vec![
                "public.inventory/part_00000004.tar.gz".to_string(),
                "public.inventory/part_00000006.tar.gz".to_string(),
            ]
        );

        assert!(continuation_candidates(Vec::new(), "not-a-chunk").is_err());
    }

    #[test]
    fn test_import_url_with_credentials() {
        let creds = UrlCredentials {
            access_key_id: "AKIA/EXAMPLE".to_string(),
            secret_access_key: "s3cr+t=key".to_string(),
            session_token: None,
        };
        assert_eq!(
            import_url("nangs", "public.inventory/part_00000001.csv", Some(&creds)),
            "s3://nangs/public.inventory/part_00000001.csv\
             ?AWS_ACCESS_KEY_ID=AKIA%2FEXAMPLE&AWS_SECRET_ACCESS_KEY=s3cr%2Bt%3Dkey"
        );
    }

    #[test]
    fn test_import_url_with_session_token() {
        let creds = UrlCredentials {
            access_key_id: "id".to_string(),
            secret_access_key: "secret".to_string(),
            session_token: Some("tok en".to_string()),
        };
        let url = import_url("b", "k.csv", Some(&creds));
        assert!(url.ends_with("&AWS_SESSION_TOKEN=tok%20en"));
    }

    #[test]
    fn test_import_url_without_credentials() {
        assert_eq!(import_url("b", "t/part_00000001.csv", None), "s3://b/t/part_00000001.csv");
    }

    #[tokio::test]
    async fn test_static_credentials_must_be_paired() {
        let config = S3StoreConfig {
            bucket: "nangs".to_string(),
            region: None,
            endpoint: None,
            access_key: Some("id".to_string()),
            secret_key: None,
            path_style: false,
        };
        assert!(matches!(S3Store::new(config).await, Err(Error::Configuration(_))));
    }

    #[tokio::test]
    async fn test_static_credentials_reach_import_url() {
        let config = S3StoreConfig {
            bucket: "nangs".to_string(),
            region: Some("eu-west-1".to_string()),
            endpoint: Some("http://localhost:9000".to_string()),
            access_key: Some("id".to_string()),
            secret_key: Some("secret".to_string()),
            path_style: true,
        };
        let store = S3Store::new(config).await.unwrap();
        assert_eq!(store.default_flush_batch_size(), 256 * 1024 * 1024);

        let resource = store.resource("t/part_00000002.csv".to_string(), Some(3));
        assert_eq!(
            resource.import_url().unwrap(),
            "s3://nangs/t/part_00000002.csv?AWS_ACCESS_KEY_ID=id&AWS_SECRET_ACCESS_KEY=secret"
        );
    }
}
