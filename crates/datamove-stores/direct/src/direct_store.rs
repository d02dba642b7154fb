use std::sync::Arc;

use async_trait::async_trait;
use datamove_core::continuation::chunk_key;
use datamove_core::{
    Error, PipeReader, Resource, ResourceReader, Result, Store, TableName, VerifiedTable,
};
use serde::{Deserialize, Serialize};
use sqlx::postgres::{PgPool, PgPoolCopyExt, PgPoolOptions};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

const DEFAULT_FLUSH_SIZE: usize = 1024 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirectCopyConfig {
    /// Connection URL of the target database.
    pub url: String,

    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_max_connections() -> u32 {
    4
}

/// Copies every chunk straight into the target table instead of persisting it.
pub struct DirectCopyStore {
    pool: PgPool,
}

impl DirectCopyStore {
    pub async fn connect(config: DirectCopyConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .connect(&config.url)
            .await
            .map_err(|e| Error::Connection(format!("Failed to connect to target: {}", e)))?;
        info!("direct copy store connected to target");
        Ok(Self::with_pool(pool))
    }

    pub fn with_pool(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn copy_statement(table: &TableName) -> String {
    format!("COPY {} FROM STDIN WITH CSV", table.quoted())
}

#[async_trait]
impl Store for DirectCopyStore {
    async fn create_from_reader(
        &self,
        mut reader: PipeReader,
        table: &VerifiedTable,
        ordinal: usize,
        file_ext: &str,
        _num_rows: oneshot::Receiver<usize>,
    ) -> Result<Arc<dyn Resource>> {
        if file_ext != "csv" {
            return Err(Error::Configuration(format!(
                "direct copy cannot load '{}' chunks",
                file_ext
            )));
        }
        let key = chunk_key(&table.name, ordinal, file_ext);

        let mut copy = self
            .pool
            .copy_in_raw(&copy_statement(&table.name))
            .await
            .map_err(|e| Error::Storage(format!("failed to start copy into {}: {}", table.name, e)))?;

        loop {
            let next = match reader.read().await {
                Ok(next) => next,
                Err(err) => {
                    if let Err(abort_err) = copy.abort(err.to_string()).await {
                        debug!(key = %key, error = %abort_err, "copy abort reported");
                    }
                    return Err(err);
                }
            };
            let Some(data) = next else { break };
            copy.send(data)
                .await
                .map_err(|e| Error::Storage(format!("failed to copy {}: {}", key, e)))?;
        }

        let rows = copy
            .finish()
            .await
            .map_err(|e| Error::Storage(format!("failed to finish copy of {}: {}", key, e)))?;
        debug!(key = %key, rows, "copied chunk into target");

        Ok(Arc::new(DirectCopyResource {
            key,
            rows: rows as usize,
        }))
    }

    fn default_flush_batch_size(&self) -> usize {
        DEFAULT_FLUSH_SIZE
    }

    fn can_be_target(&self) -> bool {
        false
    }

    async fn cleanup(&self) -> Result<()> {
        Ok(())
    }

    async fn list_from_continuation_point(
        &self,
        _continuation_key: &str,
        table: &TableName,
    ) -> Result<Vec<Arc<dyn Resource>>> {
        warn!(table = %table, "continuation requested for direct copy");
        Err(Error::Configuration(
            "direct copy does not support resuming from a continuation point".to_string(),
        ))
    }
}

/// Record of a chunk that was copied into the target.
#[derive(Debug, Clone)]
pub struct DirectCopyResource {
    key: String,
    rows: usize,
}

#[async_trait]
impl Resource for DirectCopyResource {
    fn key(&self) -> String {
        self.key.clone()
    }

    fn import_url(&self) -> Result<String> {
        Err(Error::Configuration(format!(
            "{} was copied directly and has no import URL",
            self.key
        )))
    }

    fn rows(&self) -> Option<usize> {
        Some(self.rows)
    }

    async fn reader(&self) -> Result<ResourceReader> {
        Err(Error::Storage(format!(
            "{} was copied directly and cannot be re-read",
            self.key
        )))
    }

    async fn mark_for_cleanup(&self) -> Result<()> {
        Ok(())
    }
}
