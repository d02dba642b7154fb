mod local_store;
mod factory;

pub use local_store::{LocalResource, LocalStore, LocalStoreConfig};
pub use factory::LocalStoreFactory;
