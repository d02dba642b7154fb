mod run;

use clap::{Args, Parser, Subcommand};
use datamove_config::{AppConfig, BackendConfig, Compression, VerifiedTable, DIRECT_STORE};
use datamove_core::{Importer, Registry, TableName};
use datamove_direct_store::DirectCopyStoreFactory;
use datamove_gcs_store::GcsStoreFactory;
use datamove_local_store::LocalStoreFactory;
use datamove_postgres::{connect_target, CopyImporter, ImportIntoImporter, PostgresSourceFactory};
use datamove_s3_store::S3StoreFactory;
use run::{move_tables, MoveOptions};
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser)]
#[command(name = "datamove")]
#[command(about = "Moves table data from a source database to a target", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Export the configured tables and load them into the target
    Run {
        /// Path to configuration directory
        #[arg(short, long, default_value = "config")]
        config_dir: String,

        #[command(flatten)]
        overrides: Overrides,
    },

    /// Validate configuration files
    Validate {
        /// Path to configuration directory
        #[arg(short, long, default_value = "config")]
        config_dir: String,

        #[command(flatten)]
        overrides: Overrides,
    },
}

/// Command-line settings that take precedence over the configuration files.
#[derive(Args, Debug, Default, Clone)]
struct Overrides {
    /// Stage chunks in this S3 bucket
    #[arg(long)]
    s3_bucket: Option<String>,

    /// Stage chunks in this GCS bucket
    #[arg(long)]
    gcp_bucket: Option<String>,

    /// Stage chunks under this local directory
    #[arg(long)]
    local_path: Option<PathBuf>,

    /// Copy chunks straight into the target
    #[arg(long)]
    direct_copy: bool,

    /// Bytes per chunk (0 uses the store default)
    #[arg(long)]
    flush_size: Option<usize>,

    /// Rows per chunk (0 disables the row limit)
    #[arg(long)]
    flush_rows: Option<usize>,

    /// Chunk compression: none or gzip
    #[arg(long)]
    compression: Option<Compression>,

    /// Chunk uploads in flight at once
    #[arg(long)]
    upload_concurrency: Option<usize>,

    /// Delete every created resource when the run ends
    #[arg(long)]
    cleanup: bool,

    /// Load with COPY instead of IMPORT INTO
    #[arg(long)]
    live: bool,

    /// Resume from this chunk name instead of exporting
    #[arg(long)]
    continuation_key: Option<String>,

    /// Only move these tables (schema.table), repeatable
    #[arg(long = "table")]
    tables: Vec<String>,
}

impl Overrides {
    fn apply(&self, config: &mut AppConfig) -> anyhow::Result<()> {
        if self.direct_copy {
            let target = config.target.as_ref().ok_or_else(|| {
                anyhow::anyhow!("--direct-copy requires a target database (target.url)")
            })?;
            config.store = Some(BackendConfig::new(
                DIRECT_STORE,
                json!({ "url": target.url, "max_connections": target.max_connections }),
            ));
        } else if let Some(bucket) = &self.gcp_bucket {
            select_store(config, "gcs", "bucket", json!(bucket));
        } else if let Some(bucket) = &self.s3_bucket {
            select_store(config, "s3", "bucket", json!(bucket));
        } else if let Some(path) = &self.local_path {
            select_store(config, "local", "base_dir", json!(path));
        }

        if let Some(flush_size) = self.flush_size {
            config.export.flush_size = flush_size;
        }
        if let Some(flush_rows) = self.flush_rows {
            config.export.flush_rows = flush_rows;
        }
        if let Some(compression) = self.compression {
            config.export.compression = compression;
        }
        if let Some(concurrency) = self.upload_concurrency {
            config.export.upload_concurrency = concurrency;
        }
        config.cleanup |= self.cleanup;
        config.live |= self.live;
        if self.continuation_key.is_some() {
            config.continuation_key = self.continuation_key.clone();
        }

        if !self.tables.is_empty() {
            let mut selected = Vec::new();
            for name in &self.tables {
                let name: TableName = name.parse()?;
                let table = config
                    .tables
                    .iter()
                    .find(|t| t.name == name)
                    .cloned()
                    .unwrap_or_else(|| VerifiedTable::new(name));
                selected.push(table);
            }
            config.tables = selected;
        }
        Ok(())
    }
}

/// Point the store at `backend_type`, keeping its other settings when the
/// configured store is already of that type.
fn select_store(config: &mut AppConfig, backend_type: &str, key: &str, value: Value) {
    let mut store = match config.store.take() {
        Some(store) if store.backend_type == backend_type => store,
        _ => BackendConfig::new(backend_type, json!({})),
    };
    if !store.config.is_object() {
        store.config = json!({});
    }
    if let Some(map) = store.config.as_object_mut() {
        map.insert(key.to_string(), value);
    }
    config.store = Some(store);
}

fn init_tracing(config: &AppConfig) -> anyhow::Result<()> {
    let level = match config.logging.level.as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    if config.logging.json {
        let subscriber = FmtSubscriber::builder().with_max_level(level).json().finish();
        tracing::subscriber::set_global_default(subscriber)?;
    } else {
        let subscriber = FmtSubscriber::builder().with_max_level(level).finish();
        tracing::subscriber::set_global_default(subscriber)?;
    }
    Ok(())
}

fn registry() -> Registry {
    let mut registry = Registry::new();
    registry.register_store(Arc::new(LocalStoreFactory));
    registry.register_store(Arc::new(S3StoreFactory));
    registry.register_store(Arc::new(GcsStoreFactory));
    registry.register_store(Arc::new(DirectCopyStoreFactory));
    registry.register_source(Arc::new(PostgresSourceFactory));
    registry
}

fn load_config(config_dir: &str, overrides: &Overrides) -> anyhow::Result<AppConfig> {
    let mut config = AppConfig::load(config_dir)?;
    overrides.apply(&mut config)?;
    Ok(config)
}

async fn run(config: AppConfig) -> anyhow::Result<()> {
    config.validate()?;
    let store_config = config
        .store
        .clone()
        .ok_or_else(|| anyhow::anyhow!("no data store configured"))?;

    let registry = registry();
    info!("Available stores: {:?}", registry.list_stores());
    info!("Available sources: {:?}", registry.list_sources());

    let store = registry
        .create_store(&store_config.backend_type, store_config.config.clone())
        .await?;
    info!(
        store = %store_config.backend_type,
        flush_size = config.export.flush_size,
        "initial config"
    );

    let importer: Option<Box<dyn Importer>> = match &config.target {
        Some(target) if store.can_be_target() => {
            let pool = connect_target(&target.url, target.max_connections).await?;
            if config.live {
                Some(Box::new(CopyImporter::new(pool)))
            } else {
                Some(Box::new(ImportIntoImporter::new(pool)))
            }
        }
        _ => None,
    };

    info!("establishing snapshot");
    let source = registry
        .create_source(&config.source.backend_type, config.source.config.clone())
        .await?;

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("interrupted, cancelling data movement");
                cancel.cancel();
            }
        }
    });

    if config.tables.is_empty() {
        warn!("no tables configured");
    }
    let opts = MoveOptions {
        export: config.export.clone(),
        continuation_key: config.continuation_key.clone(),
        cleanup: config.cleanup,
    };
    let result = move_tables(
        &opts,
        source.clone(),
        store,
        importer.as_deref(),
        &config.tables,
        &cancel,
    )
    .await;

    if let Err(err) = source.close().await {
        error!(error = %err, "failed to release source snapshot");
    }
    for outcome in result? {
        info!(
            table = %outcome.table,
            num_rows = outcome.num_rows,
            num_resources = outcome.num_resources,
            imported_rows = ?outcome.imported_rows,
            "table moved"
        );
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            config_dir,
            overrides,
        } => {
            let config = load_config(&config_dir, &overrides)?;
            init_tracing(&config)?;
            info!("Starting datamove with config directory: {}", config_dir);
            run(config).await?;
        }

        Commands::Validate {
            config_dir,
            overrides,
        } => {
            let config = load_config(&config_dir, &overrides)?;
            config.validate()?;

            println!("✓ Configuration is valid");
            println!("  source: {}", config.source.backend_type);
            if let Some(store) = &config.store {
                println!("  store:  {}", store.backend_type);
            }
            println!(
                "  export: compression={} flush_size={} flush_rows={} upload_concurrency={}",
                config.export.compression,
                config.export.flush_size,
                config.export.flush_rows,
                config.export.upload_concurrency
            );
            println!("  tables: {}", config.tables.len());
            for table in &config.tables {
                let marker = if table.row_verifiable { "✓" } else { "✗ (no matching primary key)" };
                println!("    {} {}", table.name, marker);
            }
        }
    }

    Ok(())
}
