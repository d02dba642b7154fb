use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::compression::Compression;
use crate::coordinator::UploadCoordinator;
use crate::flush::FlushController;
use crate::pipe::pipe;
use crate::source::ExportSource;
use crate::{Error, Resource, Result, Store, VerifiedTable};

const RAW_PIPE_CAPACITY: usize = 16;

/// Tuning for a single table export.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportConfig {
    #[serde(default)]
    pub compression: Compression,

    /// Bytes per chunk; 0 uses the store's default.
    #[serde(default)]
    pub flush_size: usize,

    /// Rows per chunk; 0 disables the row threshold.
    #[serde(default)]
    pub flush_rows: usize,

    /// Chunk uploads allowed in flight at once.
    #[serde(default = "default_upload_concurrency")]
    pub upload_concurrency: usize,
}

fn default_upload_concurrency() -> usize {
    1
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            compression: Compression::None,
            flush_size: 0,
            flush_rows: 0,
            upload_concurrency: default_upload_concurrency(),
        }
    }
}

impl ExportConfig {
    pub fn validate(&self) -> Result<()> {
        if self.upload_concurrency == 0 {
            return Err(Error::Configuration(
                "upload_concurrency must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct ExportResult {
    pub resources: Vec<Arc<dyn Resource>>,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub num_rows: usize,
    /// `None` when the resources were listed rather than exported.
    pub snapshot_id: Option<String>,
}

/// Export one table from `source` into `store` as a sequence of chunks.
///
/// The row producer runs as its own task feeding a pipe; this task splits the
/// stream into chunks and hands them to the upload coordinator. Every failure
/// cancels the rest, and all distinct errors are reported together.
pub async fn export_table(
    config: &ExportConfig,
    source: Arc<dyn ExportSource>,
    store: Arc<dyn Store>,
    table: &VerifiedTable,
    cancel: &CancellationToken,
) -> Result<ExportResult> {
    config.validate()?;
    let start_time = Utc::now();
    let token = cancel.child_token();
    let _cancel_on_return = token.clone().drop_guard();

    let flush_size = match config.flush_size {
        0 => store.default_flush_batch_size(),
        n => n,
    };
    debug!(
        table = %table.name,
        flush_size,
        flush_rows = config.flush_rows,
        compression = %config.compression,
        "starting table export"
    );

    let (mut raw_writer, raw_reader) = pipe(RAW_PIPE_CAPACITY, &token);
    let producer = tokio::spawn({
        let source = source.clone();
        let table = table.clone();
        async move {
            let mut conn = match source.conn().await {
                Ok(conn) => conn,
                Err(err) => {
                    raw_writer.close_with_error(err.clone());
                    return Err(err);
                }
            };
            let exported = match conn.export(&mut raw_writer, &table).await {
                Ok(()) => raw_writer.close(),
                Err(err) => {
                    raw_writer.close_with_error(err.clone());
                    Err(err)
                }
            };
            let closed = conn.close().await;
            match Error::combine_opt(Error::combine_opt(None, exported), closed) {
                Some(err) => Err(err),
                None => Ok(()),
            }
        }
    });

    let mut coordinator = UploadCoordinator::new(
        store,
        table.clone(),
        config.compression,
        config.upload_concurrency,
        token.clone(),
    );
    let mut controller = FlushController::new(flush_size, config.flush_rows);

    let chunked = controller.pipe(raw_reader, &mut coordinator, &table.name).await;
    if chunked.is_err() {
        token.cancel();
    }
    // A failure of the final chunk is only visible here: no later writer
    // request exists to observe it.
    let uploaded = coordinator.wait().await;
    if uploaded.is_err() {
        token.cancel();
    }
    let produced = match producer.await {
        Ok(result) => result,
        Err(join_err) => Err(Error::Export(format!("export task failed: {}", join_err))),
    };

    let errors = [chunked.err(), uploaded.as_ref().err().cloned(), produced.err()];
    if let Some(err) = Error::combine_all(errors.into_iter().flatten()) {
        warn!(table = %table.name, error = %err, "table export failed");
        return Err(err);
    }

    let resources = uploaded?;
    let result = ExportResult {
        num_rows: controller.num_rows(),
        resources,
        start_time,
        end_time: Utc::now(),
        snapshot_id: Some(source.snapshot_id()),
    };
    info!(
        table = %table.name,
        num_rows = result.num_rows,
        num_resources = result.resources.len(),
        "table export complete"
    );
    Ok(result)
}

/// Rebuild the resource list of a table from the chunks a previous run left
/// in `store`, starting at `continuation_key`.
pub async fn resume_table(
    store: &dyn Store,
    table: &VerifiedTable,
    continuation_key: &str,
) -> Result<ExportResult> {
    let start_time = Utc::now();
    let resources = store
        .list_from_continuation_point(continuation_key, &table.name)
        .await?;

    let unknown = resources.iter().filter(|r| r.rows().is_none()).count();
    if unknown > 0 {
        warn!(table = %table.name, unknown, "row count unknown for some resources");
    }
    let num_rows = resources.iter().filter_map(|r| r.rows()).sum();
    info!(
        table = %table.name,
        continuation_key,
        num_resources = resources.len(),
        "resuming from continuation point"
    );

    Ok(ExportResult {
        resources,
        start_time,
        end_time: Utc::now(),
        num_rows,
        snapshot_id: None,
    })
}
