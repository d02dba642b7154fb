use std::sync::Arc;

use async_trait::async_trait;
use datamove_core::{ExportSource, Result, SourceFactory};
use serde_json::Value;

use crate::{PostgresSource, PostgresSourceConfig};

pub struct PostgresSourceFactory;

#[async_trait]
impl SourceFactory for PostgresSourceFactory {
    fn name(&self) -> &str {
        "postgres"
    }

    async fn create(&self, config: Value) -> Result<Arc<dyn ExportSource>> {
        let config: PostgresSourceConfig = serde_json::from_value(config)?;
        Ok(Arc::new(PostgresSource::connect(config).await?))
    }
}
