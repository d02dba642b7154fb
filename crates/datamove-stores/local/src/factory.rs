use std::sync::Arc;

use async_trait::async_trait;
use datamove_core::{Result, Store, StoreFactory};
use serde_json::Value;

use crate::{LocalStore, LocalStoreConfig};

pub struct LocalStoreFactory;

#[async_trait]
impl StoreFactory for LocalStoreFactory {
    fn name(&self) -> &str {
        "local"
    }

    async fn create(&self, config: Value) -> Result<Arc<dyn Store>> {
        let config: LocalStoreConfig = serde_json::from_value(config)?;
        Ok(Arc::new(LocalStore::new(config).await?))
    }
}
