//! In-memory doubles for unit tests, shared with dependent crates through the
//! `testing` feature.

use std::io::Write;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::oneshot;

use crate::continuation::chunk_key;
use crate::pipe::{PipeReader, PipeWriter};
use crate::source::{ExportConnection, ExportSource};
use crate::store::ResourceReader;
use crate::{Error, Resource, Result, Store, TableName, VerifiedTable};

#[derive(Clone, Default)]
pub struct LogBuffer(Arc<Mutex<Vec<u8>>>);

impl Write for LogBuffer {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl LogBuffer {
    pub fn contents(&self) -> String {
        String::from_utf8(self.0.lock().unwrap().clone()).unwrap()
    }

    pub fn subscriber(&self) -> impl tracing::Subscriber + Send + Sync {
        let writer = self.clone();
        tracing_subscriber::fmt()
            .with_writer(move || writer.clone())
            .with_ansi(false)
            .finish()
    }
}

#[derive(Debug)]
pub struct MemoryResource {
    pub key: String,
    pub ordinal: usize,
    pub data: Vec<u8>,
    pub rows: Option<usize>,
}

#[async_trait]
impl Resource for MemoryResource {
    fn key(&self) -> String {
        self.key.clone()
    }

    fn import_url(&self) -> Result<String> {
        Ok(format!("mem://{}", self.key))
    }

    fn rows(&self) -> Option<usize> {
        self.rows
    }

    async fn reader(&self) -> Result<ResourceReader> {
        Ok(Box::new(std::io::Cursor::new(self.data.clone())))
    }

    async fn mark_for_cleanup(&self) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailMode {
    Never,
    /// Fail before reading anything from the chunk.
    Immediately,
    /// Read the whole chunk, then fail.
    AfterRead,
}

pub struct MemoryStore {
    pub fail: FailMode,
    /// Chunks with a lower ordinal take longer to upload.
    pub staggered: bool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            fail: FailMode::Never,
            staggered: false,
        }
    }

    pub fn failing(fail: FailMode) -> Self {
        Self {
            fail,
            staggered: false,
        }
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn create_from_reader(
        &self,
        mut reader: PipeReader,
        table: &VerifiedTable,
        ordinal: usize,
        file_ext: &str,
        num_rows: oneshot::Receiver<usize>,
    ) -> Result<Arc<dyn Resource>> {
        if self.fail == FailMode::Immediately {
            return Err(Error::Storage(format!("failed to open chunk {}", ordinal)));
        }
        let mut data = Vec::new();
        while let Some(chunk) = reader.read().await? {
            data.extend_from_slice(&chunk);
        }
        if self.fail == FailMode::AfterRead {
            return Err(Error::Storage(format!("failed to finalize chunk {}", ordinal)));
        }
        let rows = num_rows.await.ok();
        if self.staggered {
            tokio::time::sleep(Duration::from_millis(40 / ordinal as u64)).await;
        }
        Ok(Arc::new(MemoryResource {
            key: chunk_key(&table.name, ordinal, file_ext),
            ordinal,
            data,
            rows,
        }))
    }

    fn default_flush_batch_size(&self) -> usize {
        64
    }

    fn can_be_target(&self) -> bool {
        true
    }

    async fn cleanup(&self) -> Result<()> {
        Ok(())
    }

    async fn list_from_continuation_point(
        &self,
        _continuation_key: &str,
        _table: &TableName,
    ) -> Result<Vec<Arc<dyn Resource>>> {
        Ok(Vec::new())
    }
}

/// Source that writes a fixed body, optionally failing afterwards.
pub struct MockSource {
    pub body: &'static [u8],
    pub fail_after_write: bool,
}

pub struct MockConnection {
    body: &'static [u8],
    fail_after_write: bool,
}

#[async_trait]
impl ExportSource for MockSource {
    async fn conn(&self) -> Result<Box<dyn ExportConnection>> {
        Ok(Box::new(MockConnection {
            body: self.body,
            fail_after_write: self.fail_after_write,
        }))
    }

    fn snapshot_id(&self) -> String {
        "snap-1".to_string()
    }
}

#[async_trait]
impl ExportConnection for MockConnection {
    async fn export(&mut self, writer: &mut PipeWriter, _table: &VerifiedTable) -> Result<()> {
        for line in self.body.split_inclusive(|b| *b == b'\n') {
            writer.write(Bytes::from_static(line)).await?;
        }
        if self.fail_after_write {
            return Err(Error::Export("export read failed".to_string()));
        }
        Ok(())
    }

    async fn close(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}
