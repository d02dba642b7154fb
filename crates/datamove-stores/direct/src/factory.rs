use std::sync::Arc;

use async_trait::async_trait;
use datamove_core::{Result, Store, StoreFactory};
use serde_json::Value;

use crate::{DirectCopyConfig, DirectCopyStore};

pub struct DirectCopyStoreFactory;

#[async_trait]
impl StoreFactory for DirectCopyStoreFactory {
    fn name(&self) -> &str {
        "direct"
    }

    async fn create(&self, config: Value) -> Result<Arc<dyn Store>> {
        let config: DirectCopyConfig = serde_json::from_value(config)?;
        Ok(Arc::new(DirectCopyStore::connect(config).await?))
    }
}
