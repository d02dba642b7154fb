use std::io::Read;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use datamove_core::{
    Error, ImportResult, Importer, Resource, Result, TableName, VerifiedTable,
};
use flate2::read::GzDecoder;
use sqlx::postgres::{PgPool, PgPoolCopyExt};
use sqlx::Row;
use tokio::io::AsyncReadExt;
use tracing::{debug, info};

use crate::{db_error, quote_literal};

const GZIP_SUFFIX: &str = ".tar.gz";
const COPY_SEND_SIZE: usize = 64 * 1024;

fn is_gzip(resource: &dyn Resource) -> bool {
    resource.key().ends_with(GZIP_SUFFIX)
}

fn import_into_statement(table: &TableName, urls: &[String], gzip: bool) -> String {
    let urls: Vec<_> = urls.iter().map(|u| quote_literal(u)).collect();
    let mut stmt = format!("IMPORT INTO {} CSV DATA ({})", table.quoted(), urls.join(", "));
    if gzip {
        stmt.push_str(" WITH decompress = 'gzip'");
    }
    stmt
}

/// Loads resources with a single bulk `IMPORT INTO` pointing at their URLs.
pub struct ImportIntoImporter {
    pool: PgPool,
}

impl ImportIntoImporter {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl Importer for ImportIntoImporter {
    async fn import(
        &self,
        table: &VerifiedTable,
        resources: &[Arc<dyn Resource>],
    ) -> Result<ImportResult> {
        let start_time = Utc::now();
        if resources.is_empty() {
            debug!(table = %table.name, "nothing to import");
            return Ok(ImportResult {
                start_time,
                end_time: Utc::now(),
                num_rows: Some(0),
            });
        }

        let urls = resources
            .iter()
            .map(|r| r.import_url())
            .collect::<Result<Vec<_>>>()?;
        let gzip = resources.iter().any(|r| is_gzip(r.as_ref()));
        let stmt = import_into_statement(&table.name, &urls, gzip);

        let row = sqlx::query(&stmt)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| db_error(&format!("failed to import {}", table.name), e))?;
        let num_rows = row
            .and_then(|row| row.try_get::<i64, _>("rows").ok())
            .map(|rows| rows as u64);

        info!(table = %table.name, resources = resources.len(), num_rows = ?num_rows, "import complete");
        Ok(ImportResult {
            start_time,
            end_time: Utc::now(),
            num_rows,
        })
    }
}

/// Streams each resource through `COPY ... FROM STDIN`, for targets that
/// cannot fetch the resources themselves.
pub struct CopyImporter {
    pool: PgPool,
}

impl CopyImporter {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn copy_resource(&self, table: &TableName, resource: &dyn Resource) -> Result<u64> {
        let mut raw = Vec::new();
        resource.reader().await?.read_to_end(&mut raw).await?;
        let data = if is_gzip(resource) {
            let mut decoded = Vec::new();
            GzDecoder::new(raw.as_slice()).read_to_end(&mut decoded)?;
            decoded
        } else {
            raw
        };

        let key = resource.key();
        let mut copy = self
            .pool
            .copy_in_raw(&format!("COPY {} FROM STDIN WITH CSV", table.quoted()))
            .await
            .map_err(|e| db_error(&format!("failed to start copy of {}", key), e))?;
        for piece in data.chunks(COPY_SEND_SIZE) {
            copy.send(piece)
                .await
                .map_err(|e| Error::Storage(format!("failed to copy {}: {}", key, e)))?;
        }
        copy.finish()
            .await
            .map_err(|e| db_error(&format!("failed to finish copy of {}", key), e))
    }
}

#[async_trait]
impl Importer for CopyImporter {
    async fn import(
        &self,
        table: &VerifiedTable,
        resources: &[Arc<dyn Resource>],
    ) -> Result<ImportResult> {
        let start_time = Utc::now();
        let mut num_rows = 0u64;
        for resource in resources {
            let rows = self.copy_resource(&table.name, resource.as_ref()).await?;
            debug!(table = %table.name, key = %resource.key(), rows, "copied resource");
            num_rows += rows;
        }

        info!(table = %table.name, resources = resources.len(), num_rows, "live copy complete");
        Ok(ImportResult {
            start_time,
            end_time: Utc::now(),
            num_rows: Some(num_rows),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_import_into_statement() {
        let table = TableName::new("public", "inventory");
        let urls = vec![
            "gs://nangs/public.inventory/part_00000001.csv".to_string(),
            "gs://nangs/public.inventory/part_00000002.csv".to_string(),
        ];
        assert_eq!(
            import_into_statement(&table, &urls, false),
            "IMPORT INTO \"public\".\"inventory\" CSV DATA (\
             'gs://nangs/public.inventory/part_00000001.csv', \
             'gs://nangs/public.inventory/part_00000002.csv')"
        );
    }

    #[test]
    fn test_import_into_statement_gzip() {
        let table = TableName::new("public", "inventory");
        let urls = vec!["s3://b/k.tar.gz?AWS_ACCESS_KEY_ID=a'b".to_string()];
        let stmt = import_into_statement(&table, &urls, true);
        assert!(stmt.contains("'s3://b/k.tar.gz?AWS_ACCESS_KEY_ID=a''b'"));
        assert!(stmt.ends_with(" WITH decompress = 'gzip'"));
    }
}
