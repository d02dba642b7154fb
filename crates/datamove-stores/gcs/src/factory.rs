use std::sync::Arc;

use async_trait::async_trait;
use datamove_core::{Result, Store, StoreFactory};
use serde_json::Value;

use crate::{GcsStore, GcsStoreConfig};

pub struct GcsStoreFactory;

#[async_trait]
impl StoreFactory for GcsStoreFactory {
    fn name(&self) -> &str {
        "gcs"
    }

    async fn create(&self, config: Value) -> Result<Arc<dyn Store>> {
        let config: GcsStoreConfig = serde_json::from_value(config)?;
        Ok(Arc::new(GcsStore::new(config).await?))
    }
}
