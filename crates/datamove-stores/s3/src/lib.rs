mod s3_store;
mod factory;

pub use s3_store::{S3Resource, S3Store, S3StoreConfig};
pub use factory::S3StoreFactory;
