//! In-memory metadata store

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::RwLock;

use crate::errors::OrchestratorError;
use crate::store::MetadataStore;

type Collections = HashMap<String, BTreeMap<String, Value>>;

#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    data: Arc<RwLock<Collections>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MetadataStore for MemoryStore {
    async fn load(&self, collection: &str, id: &str) -> Result<Option<Value>, OrchestratorError> {
        let data = self.data.read().await;
        Ok(data.get(collection).and_then(|c| c.get(id)).cloned())
    }

    async fn save(&self, collection: &str, id: &str, value: Value) -> Result<(), OrchestratorError> {
        let mut data = self.data.write().await;
        data.entry(collection.to_string())
            .or_default()
            .insert(id.to_string(), value);
        Ok(())
    }

    async fn remove(&self, collection: &str, id: &str) -> Result<bool, OrchestratorError> {
        let mut data = self.data.write().await;
        Ok(data
            .get_mut(collection)
            .map(|c| c.remove(id).is_some())
            .unwrap_or(false))
    }

    async fn list(&self, collection: &str) -> Result<Vec<Value>, OrchestratorError> {
        let data = self.data.read().await;
        Ok(data
            .get(collection)
            .map(|c| c.values().cloned().collect())
            .unwrap_or_default())
    }
}
