use async_trait::async_trait;
use datamove_core::{
    Error, ExportConnection, ExportSource, PipeWriter, Result, TableName, VerifiedTable,
};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use sqlx::{Connection, PgConnection};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::{db_error, quote_literal};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PostgresSourceConfig {
    /// PostgreSQL connection URL of the source database.
    pub url: String,
}

/// Exports tables from one consistent snapshot.
///
/// A holder connection keeps a repeatable-read transaction open for as long
/// as the source lives; every export connection imports its snapshot.
pub struct PostgresSource {
    url: String,
    snapshot_id: String,
    holder: Mutex<Option<PgConnection>>,
}

impl PostgresSource {
    pub async fn connect(config: PostgresSourceConfig) -> Result<Self> {
        let mut holder = PgConnection::connect(&config.url)
            .await
            .map_err(|e| Error::Connection(format!("Failed to connect to source: {}", e)))?;

        sqlx::query("BEGIN TRANSACTION ISOLATION LEVEL REPEATABLE READ")
            .execute(&mut holder)
            .await
            .map_err(|e| db_error("failed to open snapshot transaction", e))?;
        let snapshot_id: String = sqlx::query_scalar("SELECT pg_export_snapshot()")
            .fetch_one(&mut holder)
            .await
            .map_err(|e| db_error("failed to export snapshot", e))?;

        info!(snapshot_id = %snapshot_id, "source snapshot exported");
        Ok(Self {
            url: config.url,
            snapshot_id,
            holder: Mutex::new(Some(holder)),
        })
    }
}

#[async_trait]
impl ExportSource for PostgresSource {
    async fn conn(&self) -> Result<Box<dyn ExportConnection>> {
        let mut conn = PgConnection::connect(&self.url)
            .await
            .map_err(|e| Error::Connection(format!("Failed to connect to source: {}", e)))?;

        sqlx::query("BEGIN TRANSACTION ISOLATION LEVEL REPEATABLE READ")
            .execute(&mut conn)
            .await
            .map_err(|e| db_error("failed to open export transaction", e))?;
        sqlx::query(&snapshot_statement(&self.snapshot_id))
            .execute(&mut conn)
            .await
            .map_err(|e| db_error("failed to adopt snapshot", e))?;

        debug!(snapshot_id = %self.snapshot_id, "export connection opened");
        Ok(Box::new(PostgresConnection { conn }))
    }

    fn snapshot_id(&self) -> String {
        self.snapshot_id.clone()
    }

    /// End the snapshot transaction. Export connections opened afterwards fail.
    async fn close(&self) -> Result<()> {
        let Some(mut holder) = self.holder.lock().await.take() else {
            return Ok(());
        };
        sqlx::query("ROLLBACK")
            .execute(&mut holder)
            .await
            .map_err(|e| db_error("failed to release snapshot", e))?;
        holder
            .close()
            .await
            .map_err(|e| db_error("failed to close snapshot connection", e))
    }
}

pub struct PostgresConnection {
    conn: PgConnection,
}

fn snapshot_statement(snapshot_id: &str) -> String {
    format!("SET TRANSACTION SNAPSHOT {}", quote_literal(snapshot_id))
}

fn copy_out_statement(table: &TableName) -> String {
    format!("COPY (SELECT * FROM {}) TO STDOUT WITH CSV", table.quoted())
}

#[async_trait]
impl ExportConnection for PostgresConnection {
    async fn export(&mut self, writer: &mut PipeWriter, table: &VerifiedTable) -> Result<()> {
        let mut stream = self
            .conn
            .copy_out_raw(&copy_out_statement(&table.name))
            .await
            .map_err(|e| db_error("failed to start export", e))?;

        let mut bytes = 0usize;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| db_error("export read failed", e))?;
            bytes += chunk.len();
            writer.write(chunk).await?;
        }
        debug!(table = %table.name, bytes, "export stream finished");
        Ok(())
    }

    async fn close(self: Box<Self>) -> Result<()> {
        let mut conn = self.conn;
        sqlx::query("COMMIT")
            .execute(&mut conn)
            .await
            .map_err(|e| db_error("failed to end export transaction", e))?;
        conn.close()
            .await
            .map_err(|e| db_error("failed to close export connection", e))
    }
}
