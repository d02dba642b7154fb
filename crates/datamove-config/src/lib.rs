use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::Path;

pub use datamove_core::{Compression, ExportConfig, VerifiedTable};
use datamove_core::Error;

/// Store type whose resources are copied straight into the target.
pub const DIRECT_STORE: &str = "direct";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub source: BackendConfig,

    /// Where chunks go; there is no usable default.
    #[serde(default)]
    pub store: Option<BackendConfig>,

    /// Database the exported tables are loaded into.
    #[serde(default)]
    pub target: Option<TargetConfig>,

    #[serde(default)]
    pub export: ExportConfig,

    #[serde(default)]
    pub tables: Vec<VerifiedTable>,

    /// Delete every created resource when the run ends.
    #[serde(default)]
    pub cleanup: bool,

    /// Stream resources into the target with COPY instead of IMPORT INTO.
    #[serde(default)]
    pub live: bool,

    /// Chunk name to resume from instead of exporting.
    #[serde(default)]
    pub continuation_key: Option<String>,

    pub logging: LoggingConfig,
}

/// A pluggable backend, selected by `type` and configured by `config`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendConfig {
    #[serde(rename = "type")]
    pub backend_type: String,

    #[serde(default)]
    pub config: Value,
}

impl BackendConfig {
    pub fn new(backend_type: impl Into<String>, config: Value) -> Self {
        Self {
            backend_type: backend_type.into(),
            config,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetConfig {
    /// PostgreSQL-wire connection URL
    pub url: String,

    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_max_connections() -> u32 {
    4
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// JSON formatted logs
    pub json: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            source: BackendConfig::new("postgres", Value::Object(Default::default())),
            store: None,
            target: None,
            export: ExportConfig::default(),
            tables: Vec::new(),
            cleanup: false,
            live: false,
            continuation_key: None,
            logging: LoggingConfig {
                level: "info".to_string(),
                json: false,
            },
        }
    }
}

impl AppConfig {
    pub fn load(config_dir: impl AsRef<Path>) -> anyhow::Result<Self> {
        let config_dir = config_dir.as_ref();
        let s = config::Config::builder()
            .add_source(config::Config::try_from(&Self::default())?)
            .add_source(
                config::File::with_name(&config_dir.join("default.yaml").to_string_lossy())
                    .required(false),
            )
            // Machine-specific overrides, kept out of version control
            .add_source(
                config::File::with_name(&config_dir.join("local.yaml").to_string_lossy())
                    .required(false),
            )
            // DATAMOVE_EXPORT__FLUSH_SIZE=1048576
            .add_source(
                config::Environment::with_prefix("DATAMOVE")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config = s.try_deserialize()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    pub fn to_file(&self, path: impl AsRef<Path>) -> anyhow::Result<()> {
        let content = serde_yaml::to_string(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Check the settings that would otherwise only fail midway through a run.
    pub fn validate(&self) -> datamove_core::Result<()> {
        let store = self.store.as_ref().ok_or_else(|| {
            Error::Configuration(
                "no data store configured; choose s3, gcs, local or direct copy".to_string(),
            )
        })?;
        if store.backend_type == DIRECT_STORE && self.export.compression != Compression::None {
            return Err(Error::Configuration(
                "compression cannot be used with direct copy".to_string(),
            ));
        }
        if store.backend_type == DIRECT_STORE && self.continuation_key.is_some() {
            return Err(Error::Configuration(
                "direct copy cannot resume from a continuation key".to_string(),
            ));
        }
        self.export.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn with_store(backend_type: &str) -> AppConfig {
        AppConfig {
            store: Some(BackendConfig::new(backend_type, json!({}))),
            ..AppConfig::default()
        }
    }

    #[test]
    fn test_missing_store_is_fatal() {
        let err = AppConfig::default().validate().unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
        assert!(err.to_string().contains("no data store configured"));
    }

    #[test]
    fn test_direct_copy_rejects_compression() {
        let mut config = with_store(DIRECT_STORE);
        assert!(config.validate().is_ok());

        config.export.compression = Compression::Gzip;
        assert!(config.validate().is_err());

        let mut config = with_store("s3");
        config.export.compression = Compression::Gzip;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_upload_concurrency_rejected() {
        let mut config = with_store("local");
        config.export.upload_concurrency = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_from_directory() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("default.yaml"),
            r#"
source:
  type: postgres
  config:
    url: postgres://localhost/source
store:
  type: gcs
  config:
    bucket: nangs
export:
  compression: gzip
  flush_rows: 1000
tables:
  - name: { schema: public, table: inventory }
  - name: { schema: public, table: audit_log }
    row_verifiable: false
logging:
  level: debug
  json: false
"#,
        )
        .unwrap();
        std::fs::write(dir.path().join("local.yaml"), "cleanup: true\n").unwrap();

        let config = AppConfig::load(dir.path()).unwrap();
        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.export.compression, Compression::Gzip);
        assert_eq!(config.export.flush_rows, 1000);
        assert_eq!(config.export.upload_concurrency, 1);
        assert!(config.cleanup);
        assert_eq!(config.tables.len(), 2);
        assert!(config.tables[0].row_verifiable);
        assert!(!config.tables[1].row_verifiable);

        let store = config.store.unwrap();
        assert_eq!(store.backend_type, "gcs");
        assert_eq!(store.config["bucket"], "nangs");
    }

    #[test]
    fn test_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("datamove.yaml");

        let mut config = with_store("local");
        config.continuation_key = Some("part_00000004.csv".to_string());
        config.to_file(&path).unwrap();

        let loaded = AppConfig::from_file(&path).unwrap();
        assert_eq!(loaded.store, config.store);
        assert_eq!(loaded.continuation_key.as_deref(), Some("part_00000004.csv"));
    }
}
