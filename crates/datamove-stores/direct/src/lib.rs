mod direct_store;
mod factory;

pub use direct_store::{DirectCopyConfig, DirectCopyResource, DirectCopyStore};
pub use factory::DirectCopyStoreFactory;
