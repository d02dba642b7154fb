use std::sync::Arc;
use std::time::Instant;

use datamove_core::{
    export_table, resume_table, Error, ExportConfig, ExportResult, ExportSource, Importer,
    Resource, Result, Store, TableName, VerifiedTable,
};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

pub struct MoveOptions {
    pub export: ExportConfig,
    pub continuation_key: Option<String>,
    pub cleanup: bool,
}

#[derive(Debug, Clone)]
pub struct TableOutcome {
    pub table: TableName,
    pub num_rows: usize,
    pub num_resources: usize,
    pub imported_rows: Option<u64>,
}

/// Move every table in order, stopping at the first failing table.
///
/// With `cleanup` set, every resource created along the way is marked for
/// cleanup and the store is cleaned up once the run ends, whatever its result.
pub async fn move_tables(
    opts: &MoveOptions,
    source: Arc<dyn ExportSource>,
    store: Arc<dyn Store>,
    importer: Option<&dyn Importer>,
    tables: &[VerifiedTable],
    cancel: &CancellationToken,
) -> Result<Vec<TableOutcome>> {
    let mut created = Vec::new();
    let result = move_all(opts, source, store.clone(), importer, tables, cancel, &mut created).await;
    if opts.cleanup {
        cleanup(store.as_ref(), &created).await;
    }
    result
}

async fn move_all(
    opts: &MoveOptions,
    source: Arc<dyn ExportSource>,
    store: Arc<dyn Store>,
    importer: Option<&dyn Importer>,
    tables: &[VerifiedTable],
    cancel: &CancellationToken,
    created: &mut Vec<Arc<dyn Resource>>,
) -> Result<Vec<TableOutcome>> {
    info!(
        num_tables = tables.len(),
        snapshot_id = %source.snapshot_id(),
        "starting data movement"
    );

    let mut outcomes = Vec::new();
    for table in tables {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        if !table.row_verifiable {
            error!(
                "table {} does not have matching primary keys, cannot migrate",
                table.name
            );
            continue;
        }

        info!(table = %table.name, "data extraction phase starting");
        let started = Instant::now();
        let exported = extract(opts, source.clone(), store.clone(), table, cancel).await?;
        created.extend(exported.resources.iter().cloned());
        info!(
            table = %table.name,
            duration_ms = (exported.end_time - exported.start_time).num_milliseconds(),
            "data extraction phase complete, starting data movement"
        );

        let imported_rows = match importer {
            Some(importer) if store.can_be_target() => {
                importer.import(table, &exported.resources).await?.num_rows
            }
            None if store.can_be_target() => {
                warn!(table = %table.name, "no target configured, skipping import");
                None
            }
            _ => None,
        };

        info!(
            table = %table.name,
            duration_ms = started.elapsed().as_millis() as u64,
            snapshot_id = exported.snapshot_id.as_deref().unwrap_or(""),
            "data movement for table complete"
        );
        outcomes.push(TableOutcome {
            table: table.name.clone(),
            num_rows: exported.num_rows,
            num_resources: exported.resources.len(),
            imported_rows,
        });
    }

    info!(snapshot_id = %source.snapshot_id(), "data movement completed");
    Ok(outcomes)
}

async fn extract(
    opts: &MoveOptions,
    source: Arc<dyn ExportSource>,
    store: Arc<dyn Store>,
    table: &VerifiedTable,
    cancel: &CancellationToken,
) -> Result<ExportResult> {
    match &opts.continuation_key {
        Some(key) => resume_table(store.as_ref(), table, key).await,
        None => export_table(&opts.export, source, store, table, cancel).await,
    }
}

async fn cleanup(store: &dyn Store, resources: &[Arc<dyn Resource>]) {
    for resource in resources {
        if let Err(err) = resource.mark_for_cleanup().await {
            error!(key = %resource.key(), error = %err, "error cleaning up resource");
        }
    }
    if let Err(err) = store.cleanup().await {
        error!(error = %err, "error cleaning up store");
    }
}
