use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use datamove_core::continuation::{chunk_key, filter_from_continuation_point, table_prefix};
use datamove_core::{
    Error, ObjectAttrs, PipeReader, Resource, ResourceReader, Result, Store, TableName,
    VerifiedTable,
};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::{oneshot, Mutex};
use tracing::{debug, info, warn};

const META_SUFFIX: &str = ".meta.json";
const ROWS_METADATA_KEY: &str = "numrows";
const DEFAULT_FLUSH_SIZE: usize = 1024 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalStoreConfig {
    /// Directory the chunks are written under.
    pub base_dir: PathBuf,

    /// `host:port` of a file server exposing `base_dir`, used in import URLs.
    #[serde(default)]
    pub access_addr: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct ChunkMeta {
    numrows: usize,
}

/// Writes chunks to a local directory, one file per chunk with a JSON sidecar
/// holding its row count.
pub struct LocalStore {
    config: LocalStoreConfig,
    created: Mutex<Vec<PathBuf>>,
}

impl LocalStore {
    pub async fn new(config: LocalStoreConfig) -> Result<Self> {
        fs::create_dir_all(&config.base_dir).await.map_err(|e| {
            Error::Configuration(format!(
                "cannot create local store directory {}: {}",
                config.base_dir.display(),
                e
            ))
        })?;
        info!(base_dir = %config.base_dir.display(), "local store ready");
        Ok(Self {
            config,
            created: Mutex::new(Vec::new()),
        })
    }

    fn resource(&self, key: String, rows: Option<usize>) -> LocalResource {
        LocalResource {
            path: self.config.base_dir.join(&key),
            key,
            access_addr: self.config.access_addr.clone(),
            rows,
        }
    }

    async fn write_chunk(&self, reader: &mut PipeReader, path: &Path) -> Result<u64> {
        let mut file = fs::File::create(path).await?;
        let mut written = 0u64;
        while let Some(data) = reader.read().await? {
            file.write_all(&data).await?;
            written += data.len() as u64;
        }
        file.flush().await?;
        file.sync_all().await?;
        Ok(written)
    }
}

fn meta_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(META_SUFFIX);
    PathBuf::from(name)
}

async fn remove_if_exists(path: &Path) -> Result<()> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

async fn read_meta(path: &Path) -> Option<ChunkMeta> {
    let raw = fs::read(meta_path(path)).await.ok()?;
    match serde_json::from_slice(&raw) {
        Ok(meta) => Some(meta),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "unreadable chunk metadata");
            None
        }
    }
}

#[async_trait]
impl Store for LocalStore {
    async fn create_from_reader(
        &self,
        mut reader: PipeReader,
        table: &VerifiedTable,
        ordinal: usize,
        file_ext: &str,
        num_rows: oneshot::Receiver<usize>,
    ) -> Result<Arc<dyn Resource>> {
        let key = chunk_key(&table.name, ordinal, file_ext);
        let path = self.config.base_dir.join(&key);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        self.created.lock().await.push(path.clone());

        let written = self.write_chunk(&mut reader, &path).await?;
        let rows = num_rows.await.ok();
        if let Some(numrows) = rows {
            fs::write(meta_path(&path), serde_json::to_vec(&ChunkMeta { numrows })?).await?;
        }
        debug!(key = %key, bytes = written, rows = ?rows, "wrote local chunk");

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
        for path in &created {
            acc = Error::combine_opt(acc, remove_if_exists(path).await);
            acc = Error::combine_opt(acc, remove_if_exists(&meta_path(path)).await);
        }
        info!(files = created.len(), "cleaned up local store");
        acc.map_or(Ok(()), Err)
    }

    async fn list_from_continuation_point(
        &self,
        continuation_key: &str,
        table: &TableName,
    ) -> Result<Vec<Arc<dyn Resource>>> {
        let prefix = table_prefix(table);
        let dir = self.config.base_dir.join(&prefix);
        let mut entries = fs::read_dir(&dir).await.map_err(|e| {
            Error::Storage(format!("cannot list {}: {}", dir.display(), e))
        })?;

        let mut objects = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let file_name = entry.file_name().to_string_lossy().into_owned();
            if file_name.ends_with(META_SUFFIX) {
                continue;
            }
            let mut attrs = ObjectAttrs::new(format!("{}{}", prefix, file_name));
            if let Some(meta) = read_meta(&entry.path()).await {
                attrs = attrs.with_metadata(ROWS_METADATA_KEY, meta.numrows.to_string());
            }
            objects.push(attrs);
        }

        let chunks = filter_from_continuation_point(objects, continuation_key, ROWS_METADATA_KEY)?;
        Ok(chunks
            .into_iter()
            .map(|chunk| Arc::new(self.resource(chunk.key, chunk.rows)) as Arc<dyn Resource>)
            .collect())
    }
}

#[derive(Debug, Clone)]
pub struct LocalResource {
    key: String,
    path: PathBuf,
    access_addr: Option<String>,
    rows: Option<usize>,
}

impl LocalResource {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl Resource for LocalResource {
    fn key(&self) -> String {
        self.key.clone()
    }

    fn import_url(&self) -> Result<String> {
        match &self.access_addr {
            Some(addr) => Ok(format!("http://{}/{}", addr, self.key)),
            None => Ok(format!("file://{}", self.path.display())),
        }
    }

    fn rows(&self) -> Option<usize> {
        self.rows
    }

    async fn reader(&self) -> Result<ResourceReader> {
        let file = fs::File::open(&self.path).await?;
        Ok(Box::new(file))
    }

    async fn mark_for_cleanup(&self) -> Result<()> {
        remove_if_exists(&self.path).await?;
        remove_if_exists(&meta_path(&self.path)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use datamove_core::pipe;
    use tokio::io::AsyncReadExt;
    use tokio_util::sync::CancellationToken;

    fn table() -> VerifiedTable {
        VerifiedTable::new(TableName::new("public", "inventory"))
    }

    async fn store(dir: &Path, access_addr: Option<&str>) -> LocalStore {
        LocalStore::new(LocalStoreConfig {
            base_dir: dir.to_path_buf(),
            access_addr: access_addr.map(str::to_string),
        })
        .await
        .unwrap()
    }

    async fn put(store: &LocalStore, ordinal: usize, body: &'static [u8], rows: Option<usize>) -> Result<Arc<dyn Resource>> {
        let token = CancellationToken::new();
        let (mut w, r) = pipe(4, &token);
        let (tx, rx) = oneshot::channel();
        w.write(Bytes::from_static(body)).await?;
        w.close()?;
        match rows {
            Some(rows) => tx.send(rows).unwrap(),
            None => drop(tx),
        }
        store.create_from_reader(r, &table(), ordinal, "csv", rx).await
    }

    #[tokio::test]
    async fn test_write_chunk_with_sidecar() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path(), None).await;

        let resource = put(&store, 1, b"1,a\n2,b\n", Some(2)).await.unwrap();
        assert_eq!(resource.key(), "public.inventory/part_00000001.csv");
        assert_eq!(resource.rows(), Some(2));

        let path = dir.path().join("public.inventory/part_00000001.csv");
        assert_eq!(std::fs::read(&path).unwrap(), b"1,a\n2,b\n");
        let meta = std::fs::read_to_string(meta_path(&path)).unwrap();
        assert_eq!(meta, r#"{"numrows":2}"#);

        let mut body = String::new();
        resource.reader().await.unwrap().read_to_string(&mut body).await.unwrap();
        assert_eq!(body, "1,a\n2,b\n");
    }

    #[tokio::test]
    async fn test_import_url() {
        let dir = tempfile::tempdir().unwrap();

        let served = store(dir.path(), Some("localhost:4040")).await;
        let resource = put(&served, 3, b"1,a\n", Some(1)).await.unwrap();
        assert_eq!(
            resource.import_url().unwrap(),
            "http://localhost:4040/public.inventory/part_00000003.csv"
        );

        let unserved = store(dir.path(), None).await;
        let resource = put(&unserved, 4, b"1,a\n", Some(1)).await.unwrap();
        assert!(resource.import_url().unwrap().starts_with("file://"));
    }

    #[tokio::test]
    async fn test_failed_pipe_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path(), None).await;

        let token = CancellationToken::new();
        let (mut w, r) = pipe(4, &token);
        let (_tx, rx) = oneshot::channel();
        w.write(Bytes::from_static(b"1,a\n")).await.unwrap();
        w.close_with_error(Error::Export("export read failed".to_string()));

        let err = store.create_from_reader(r, &table(), 1, "csv", rx).await.unwrap_err();
        assert!(err.to_string().contains("export read failed"));
    }

    #[tokio::test]
    async fn test_list_from_continuation_point() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path(), None).await;
        for ordinal in 1..=8 {
            let rows = if ordinal == 6 { None } else { Some(ordinal) };
            put(&store, ordinal, b"1,a\n", rows).await.unwrap();
        }

        let resources = store
            .list_from_continuation_point("part_00000004.csv", &table().name)
            .await
            .unwrap();
        let keys: Vec<_> = resources.iter().map(|r| r.key()).collect();
        assert_eq!(
            keys,
            (4..=8)
                .map(|i| format!("public.inventory/part_{:08}.csv", i))
                .collect::<Vec<_>>()
        );
        let rows: Vec<_> = resources.iter().map(|r| r.rows()).collect();
        assert_eq!(rows, vec![Some(4), Some(5), None, Some(7), Some(8)]);
    }

    #[tokio::test]
    async fn test_cleanup_removes_created_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path(), None).await;
        let first = put(&store, 1, b"1,a\n", Some(1)).await.unwrap();
        put(&store, 2, b"2,b\n", Some(1)).await.unwrap();

        first.mark_for_cleanup().await.unwrap();
        assert!(!dir.path().join("public.inventory/part_00000001.csv").exists());

        store.cleanup().await.unwrap();
        let left = std::fs::read_dir(dir.path().join("public.inventory")).unwrap().count();
        assert_eq!(left, 0);
    }
}
