use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;

use crate::{Error, ExportSource, Result, SourceFactory, Store, StoreFactory};

/// Registry of the store and source backends known to a binary.
pub struct Registry {
    store_factories: HashMap<String, Arc<dyn StoreFactory>>,
    source_factories: HashMap<String, Arc<dyn SourceFactory>>,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            store_factories: HashMap::new(),
            source_factories: HashMap::new(),
        }
    }

    pub fn register_store(&mut self, factory: Arc<dyn StoreFactory>) {
        let name = factory.name().to_string();
        self.store_factories.insert(name, factory);
    }

    pub fn register_source(&mut self, factory: Arc<dyn SourceFactory>) {
        let name = factory.name().to_string();
        self.source_factories.insert(name, factory);
    }

    pub fn get_store_factory(&self, name: &str) -> Result<Arc<dyn StoreFactory>> {
        self.store_factories
            .get(name)
            .cloned()
            .ok_or_else(|| Error::Configuration(format!("Store factory '{}' not found", name)))
    }

    pub fn get_source_factory(&self, name: &str) -> Result<Arc<dyn SourceFactory>> {
        self.source_factories
            .get(name)
            .cloned()
            .ok_or_else(|| Error::Configuration(format!("Source factory '{}' not found", name)))
    }

    /// Look up the factory for `name` and build a store from `config`.
    pub async fn create_store(&self, name: &str, config: Value) -> Result<Arc<dyn Store>> {
        self.get_store_factory(name)?.create(config).await
    }

    pub async fn create_source(&self, name: &str, config: Value) -> Result<Arc<dyn ExportSource>> {
        self.get_source_factory(name)?.create(config).await
    }

    /// Registered store types, sorted.
    pub fn list_stores(&self) -> Vec<String> {
        let mut names: Vec<_> = self.store_factories.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn list_sources(&self) -> Vec<String> {
        let mut names: Vec<_> = self.source_factories.keys().cloned().collect();
        names.sort();
        names
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}
