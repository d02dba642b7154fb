use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::AsyncRead;
use tokio::sync::oneshot;

use crate::pipe::PipeReader;
use crate::{Result, TableName, VerifiedTable};

pub type ResourceReader = Box<dyn AsyncRead + Send + Unpin>;

/// The durable artifact produced from one chunk.
#[async_trait]
pub trait Resource: Send + Sync + fmt::Debug {
    /// Backend-specific location, e.g. the object key.
    fn key(&self) -> String;

    /// URL a loader can use to import this resource independently.
    fn import_url(&self) -> Result<String>;

    /// Rows held by this resource, `None` when the metadata was unavailable.
    fn rows(&self) -> Option<usize>;

    /// Open the stored bytes for reading.
    async fn reader(&self) -> Result<ResourceReader>;

    /// Delete or schedule deletion of the stored bytes.
    async fn mark_for_cleanup(&self) -> Result<()>;
}

/// A backend that turns chunks into durable resources.
#[async_trait]
pub trait Store: Send + Sync {
    /// Consume `reader` fully and persist it as chunk `ordinal` of `table`.
    ///
    /// `num_rows` resolves once the chunk writer has closed; a dropped sender
    /// means the row count is unknown.
    async fn create_from_reader(
        &self,
        reader: PipeReader,
        table: &VerifiedTable,
        ordinal: usize,
        file_ext: &str,
        num_rows: oneshot::Receiver<usize>,
    ) -> Result<Arc<dyn Resource>>;

    /// Recommended chunk size in bytes.
    fn default_flush_batch_size(&self) -> usize;

    /// Whether an importer can load this store's resources.
    fn can_be_target(&self) -> bool;

    /// Best-effort removal of everything this store created.
    async fn cleanup(&self) -> Result<()>;

    /// Resources of `table` whose ordinal is at or after the one encoded in
    /// `continuation_key`, in ordinal order.
    async fn list_from_continuation_point(
        &self,
        continuation_key: &str,
        table: &TableName,
    ) -> Result<Vec<Arc<dyn Resource>>>;
}
