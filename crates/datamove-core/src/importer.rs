use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::{Resource, Result, VerifiedTable};

#[derive(Debug, Clone)]
pub struct ImportResult {
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub num_rows: Option<u64>,
}

/// Loads exported resources into the target database.
#[async_trait]
pub trait Importer: Send + Sync {
    /// `resources` must be complete and in ordinal order.
    async fn import(
        &self,
        table: &VerifiedTable,
        resources: &[Arc<dyn Resource>],
    ) -> Result<ImportResult>;
}
