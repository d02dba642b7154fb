use std::sync::Arc;

use async_trait::async_trait;
use datamove_core::{Result, Store, StoreFactory};
use serde_json::Value;

use crate::{S3Store, S3StoreConfig};

pub struct S3StoreFactory;

#[async_trait]
impl StoreFactory for S3StoreFactory {
    fn name(&self) -> &str {
        "s3"
    }

    async fn create(&self, config: Value) -> Result<Arc<dyn Store>> {
        let config: S3StoreConfig = serde_json::from_value(config)?;
        Ok(Arc::new(S3Store::new(config).await?))
    }
}
