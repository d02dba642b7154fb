use async_trait::async_trait;

use crate::pipe::PipeWriter;
use crate::{Result, VerifiedTable};

/// A database that can stream tables out as delimited data from one
/// consistent snapshot.
#[async_trait]
pub trait ExportSource: Send + Sync {
    /// Open a connection reading at the source's snapshot.
    async fn conn(&self) -> Result<Box<dyn ExportConnection>>;

    /// Opaque identifier of the consistent read point.
    fn snapshot_id(&self) -> String;

    /// Release the snapshot once every table has been exported.
    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

#[async_trait]
pub trait ExportConnection: Send {
    /// Write every row of `table` to `writer` as CSV records.
    ///
    /// The caller owns closing `writer`; this only writes.
    async fn export(&mut self, writer: &mut PipeWriter, table: &VerifiedTable) -> Result<()>;

    async fn close(self: Box<Self>) -> Result<()>;
}
