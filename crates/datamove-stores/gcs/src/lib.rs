mod client;
mod gcs_store;
mod factory;

pub use client::{GcsClient, HttpGcsClient};
pub use gcs_store::{GcsResource, GcsStore, GcsStoreConfig};
pub use factory::GcsStoreFactory;
