use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::{ExportSource, Result, Store};

/// Builds a store from its configuration section.
#[async_trait]
pub trait StoreFactory: Send + Sync {
    /// Type identifier used in configuration, e.g. `s3`.
    fn name(&self) -> &str;

    async fn create(&self, config: Value) -> Result<Arc<dyn Store>>;
}

/// Builds an export source from its configuration section.
#[async_trait]
pub trait SourceFactory: Send + Sync {
    fn name(&self) -> &str;

    async fn create(&self, config: Value) -> Result<Arc<dyn ExportSource>>;
}
