mod error;
mod table;
mod factory;
mod registry;

pub mod compression;
pub mod continuation;
pub mod coordinator;
pub mod export;
pub mod flush;
pub mod importer;
pub mod pipe;
pub mod source;
pub mod store;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use compression::{ChunkWriter, Compression};
pub use continuation::{ListedChunk, ObjectAttrs};
pub use error::{Error, Result};
pub use export::{export_table, resume_table, ExportConfig, ExportResult};
pub use factory::{SourceFactory, StoreFactory};
pub use importer::{ImportResult, Importer};
pub use pipe::{pipe, PipeCloser, PipeReader, PipeWriter};
pub use registry::Registry;
pub use source::{ExportConnection, ExportSource};
pub use store::{Resource, ResourceReader, Store};
pub use table::{TableName, VerifiedTable};
