use std::collections::HashMap;
use std::io::Cursor;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bytes::BytesMut;
use datamove_core::continuation::{chunk_key, filter_from_continuation_point, table_prefix};
use datamove_core::{
    Error, PipeReader, Resource, ResourceReader, Result, Store, TableName, VerifiedTable,
};
use serde::{Deserialize, Serialize};
use tokio::sync::{oneshot, Mutex};
use tracing::{debug, info, instrument};

use crate::client::{GcsClient, HttpGcsClient, DEFAULT_ENDPOINT};

const ROWS_METADATA_KEY: &str = "numrows";
const DEFAULT_FLUSH_SIZE: usize = 256 * 1024 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GcsStoreConfig {
    pub bucket: String,

    /// Service account JSON, passed on to the target in import URLs.
    #[serde(default)]
    pub credentials_file: Option<PathBuf>,

    /// Inline alternative to `credentials_file`.
    #[serde(default)]
    pub credentials_json: Option<String>,

    /// OAuth bearer token for the JSON API.
    #[serde(default)]
    pub access_token: Option<String>,

    #[serde(default = "default_endpoint")]
    pub endpoint: String,
}

fn default_endpoint() -> String {
    DEFAULT_ENDPOINT.to_string()
}

pub struct GcsStore {
    client: Arc<dyn GcsClient>,
    bucket: String,
    creds: Arc<Vec<u8>>,
    /// Keys uploaded by this store and not yet deleted.
    created: Arc<Mutex<Vec<String>>>,
}

impl GcsStore {
    pub async fn new(config: GcsStoreConfig) -> Result<Self> {
        let creds = match (&config.credentials_json, &config.credentials_file) {
            (Some(json), _) => json.clone().into_bytes(),
            (None, Some(path)) => tokio::fs::read(path).await.map_err(|e| {
                Error::Configuration(format!(
                    "cannot read GCS credentials {}: {}",
                    path.display(),
                    e
                ))
            })?,
            (None, None) => Vec::new(),
        };
        let client = HttpGcsClient::new(config.endpoint.clone(), config.access_token.clone())?;

        info!(bucket = %config.bucket, "GCS store initialized");
        Ok(Self::with_client(Arc::new(client), config.bucket, creds))
    }

    pub fn with_client(client: Arc<dyn GcsClient>, bucket: impl Into<String>, creds: Vec<u8>) -> Self {
        Self {
            client,
            bucket: bucket.into(),
            creds: Arc::new(creds),
            created: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn resource(&self, key: String, rows: Option<usize>) -> GcsResource {
        GcsResource {
            client: self.client.clone(),
            bucket: self.bucket.clone(),
            key,
            rows,
            creds: self.creds.clone(),
            created: self.created.clone(),
        }
    }
}

#[async_trait]
impl Store for GcsStore {
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

        let mut body = BytesMut::new();
        while let Some(data) = reader.read().await? {
            body.extend_from_slice(&data);
        }
        let rows = num_rows.await.ok();
        let size = body.len();

        let mut metadata = HashMap::new();
        if let Some(rows) = rows {
            metadata.insert(ROWS_METADATA_KEY.to_string(), rows.to_string());
        }
        self.client
            .upload(&self.bucket, &key, body.freeze(), metadata)
            .await?;
        self.created.lock().await.push(key.clone());

        debug!(key = %key, bytes = size, rows = ?rows, "uploaded chunk to gs://{}", self.bucket);
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
            acc = Error::combine_opt(acc, self.client.delete(&self.bucket, key).await);
        }
        info!(objects = created.len(), "cleaned up gs://{}", self.bucket);
        acc.map_or(Ok(()), Err)
    }

    #[instrument(skip(self))]
    async fn list_from_continuation_point(
        &self,
        continuation_key: &str,
        table: &TableName,
    ) -> Result<Vec<Arc<dyn Resource>>> {
        let objects = self
            .client
            .list_objects(&self.bucket, &table_prefix(table))
            .await?;
        let chunks = filter_from_continuation_point(objects, continuation_key, ROWS_METADATA_KEY)?;
        Ok(chunks
            .into_iter()
            .map(|chunk| Arc::new(self.resource(chunk.key, chunk.rows)) as Arc<dyn Resource>)
            .collect())
    }
}

pub struct GcsResource {
    client: Arc<dyn GcsClient>,
    bucket: String,
    key: String,
    rows: Option<usize>,
    creds: Arc<Vec<u8>>,
    created: Arc<Mutex<Vec<String>>>,
}

impl std::fmt::Debug for GcsResource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GcsResource")
            .field("bucket", &self.bucket)
            .field("key", &self.key)
            .field("rows", &self.rows)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Resource for GcsResource {
    fn key(&self) -> String {
        self.key.clone()
    }

    fn import_url(&self) -> Result<String> {
        Ok(format!(
            "gs://{}/{}?CREDENTIALS={}",
            self.bucket,
            self.key,
            STANDARD.encode(self.creds.as_slice())
        ))
    }

    fn rows(&self) -> Option<usize> {
        self.rows
    }

    async fn reader(&self) -> Result<ResourceReader> {
        let data = self.client.download(&self.bucket, &self.key).await?;
        Ok(Box::new(Cursor::new(data)))
    }

    async fn mark_for_cleanup(&self) -> Result<()> {
        self.client.delete(&self.bucket, &self.key).await?;
        self.created.lock().await.retain(|key| key != &self.key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use datamove_core::testing::LogBuffer;
    use datamove_core::{pipe, ObjectAttrs};
    use std::sync::Mutex as StdMutex;
    use tokio_util::sync::CancellationToken;

    #[derive(Default)]
    struct MockGcsClient {
        listing: Vec<ObjectAttrs>,
        uploads: StdMutex<Vec<(String, Bytes, HashMap<String, String>)>>,
        deleted: StdMutex<Vec<String>>,
    }

    #[async_trait]
    impl GcsClient for MockGcsClient {
        async fn list_objects(&self, _bucket: &str, _prefix: &str) -> Result<Vec<ObjectAttrs>> {
            Ok(self.listing.clone())
        }

        async fn upload(
            &self,
            _bucket: &str,
            name: &str,
            body: Bytes,
            metadata: HashMap<String, String>,
        ) -> Result<()> {
            self.uploads.lock().unwrap().push((name.to_string(), body, metadata));
            Ok(())
        }

        async fn download(&self, _bucket: &str, name: &str) -> Result<Bytes> {
            let uploads = self.uploads.lock().unwrap();
            uploads
                .iter()
                .find(|(n, _, _)| n == name)
                .map(|(_, body, _)| body.clone())
                .ok_or_else(|| Error::Storage(format!("no object {}", name)))
        }

        /// Deleting an object twice fails, like a bucket without the object.
        async fn delete(&self, _bucket: &str, name: &str) -> Result<()> {
            let mut deleted = self.deleted.lock().unwrap();
            if deleted.iter().any(|d| d == name) {
                return Err(Error::Storage(format!("failed to delete {}: 404 Not Found", name)));
            }
            deleted.push(name.to_string());
            Ok(())
        }
    }

    async fn upload_chunk(store: &GcsStore, ordinal: usize) -> Arc<dyn Resource> {
        let table = VerifiedTable::new(TableName::new("public", "inventory"));
        let token = CancellationToken::new();
        let (mut w, r) = pipe(4, &token);
        let (tx, rx) = oneshot::channel();
        w.write(Bytes::from_static(b"1,a\n")).await.unwrap();
        w.close().unwrap();
        tx.send(1).unwrap();
        store.create_from_reader(r, &table, ordinal, "csv", rx).await.unwrap()
    }

    fn listing(with_rows: bool) -> Vec<ObjectAttrs> {
        (4..=8)
            .map(|i| {
                let attrs = ObjectAttrs::new(format!("part_{:08}.tar.gz", i));
                if with_rows {
                    attrs.with_metadata(ROWS_METADATA_KEY, "10")
                } else {
                    attrs
                }
            })
            .collect()
    }

    fn store(client: MockGcsClient) -> GcsStore {
        GcsStore::with_client(Arc::new(client), "fetch-test", br#"{"a":b}"#.to_vec())
    }

    #[test]
    fn test_import_url() {
        let store = GcsStore::with_client(
            Arc::new(MockGcsClient::default()),
            "nangs",
            br#"{"a":b}"#.to_vec(),
        );
        let resource = store.resource("asdf/ghjk.csv".to_string(), None);
        assert_eq!(
            resource.import_url().unwrap(),
            "gs://nangs/asdf/ghjk.csv?CREDENTIALS=eyJhIjpifQ=="
        );
    }

    #[tokio::test]
    async fn test_list_with_row_counts() {
        let store = store(MockGcsClient {
            listing: listing(true),
            ..Default::default()
        });
        let table = TableName::new("public", "inventory");

        let resources = store
            .list_from_continuation_point("part_00000004.tar.gz", &table)
            .await
            .unwrap();
        assert_eq!(resources.len(), 5);
        assert!(resources.iter().all(|r| r.rows() == Some(10)));
    }

    #[tokio::test]
    async fn test_list_without_row_counts_logs_missing_metadata() {
        let store = store(MockGcsClient {
            listing: listing(false),
            ..Default::default()
        });
        let table = TableName::new("public", "inventory");

        let logs = LogBuffer::default();
        let _guard = tracing::subscriber::set_default(logs.subscriber());

        let resources = store
            .list_from_continuation_point("part_00000004.tar.gz", &table)
            .await
            .unwrap();
        assert_eq!(resources.len(), 5);
        assert!(resources.iter().all(|r| r.rows().is_none()));

        assert!(logs.contents().contains("failed to find metadata"));
    }

    #[tokio::test]
    async fn test_cleanup_skips_resources_already_deleted() {
        let client = Arc::new(MockGcsClient::default());
        let store = GcsStore::with_client(client.clone(), "fetch-test", Vec::new());

        let first = upload_chunk(&store, 1).await;
        upload_chunk(&store, 2).await;

        first.mark_for_cleanup().await.unwrap();
        store.cleanup().await.unwrap();

        assert_eq!(
            *client.deleted.lock().unwrap(),
            vec![
                "public.inventory/part_00000001.csv".to_string(),
                "public.inventory/part_00000002.csv".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn test_upload_records_row_metadata() {
        let client = Arc::new(MockGcsClient::default());
        let store = GcsStore::with_client(client.clone(), "fetch-test", Vec::new());
        let table = VerifiedTable::new(TableName::new("public", "inventory"));

        let token = CancellationToken::new();
        let (mut w, r) = pipe(4, &token);
        let (tx, rx) = oneshot::channel();
        w.write(Bytes::from_static(b"1,a\n2,b\n")).await.unwrap();
        w.close().unwrap();
        tx.send(2).unwrap();

        let resource = store.create_from_reader(r, &table, 7, "csv", rx).await.unwrap();
        assert_eq!(resource.key(), "public.inventory/part_00000007.csv");
        assert_eq!(resource.rows(), Some(2));

        {
            let uploads = client.uploads.lock().unwrap();
            assert_eq!(uploads.len(), 1);
            assert_eq!(uploads[0].1, Bytes::from_static(b"1,a\n2,b\n"));
            assert_eq!(uploads[0].2.get("numrows").map(String::as_str), Some("2"));
        }

        store.cleanup().await.unwrap();
        assert_eq!(
            *client.deleted.lock().unwrap(),
            vec!["public.inventory/part_00000007.csv".to_string()]
        );
    }
}
