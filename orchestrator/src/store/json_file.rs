//! JSON file backed metadata store
//!
//! Each collection lives in `<state_dir>/<collection>.json` as an object keyed
//! by record id. Collections are cached after first read and rewritten
//! atomically on every change.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::debug;

use crate::errors::OrchestratorError;
use crate::filesys::dir::Dir;
use crate::filesys::file::File;
use crate::store::MetadataStore;

type Collection = BTreeMap<String, Value>;

pub struct JsonFileStore {
    dir: Dir,
    cache: Mutex<HashMap<String, Collection>>,
}

impl JsonFileStore {
    pub fn new(dir: Dir) -> Self {
        Self {
            dir,
            cache: Mutex::new(HashMap::new()),
        }
    }

    fn collection_file(&self, collection: &str) -> File {
        self.dir.file(&format!("{}.json", collection))
    }

    async fn read_collection(&self, collection: &str) -> Result<Collection, OrchestratorError> {
        let file = self.collection_file(collection);
        if !file.exists().await {
            return Ok(Collection::new());
        }
        file.read_json().await.map_err(|e| {
            OrchestratorError::StorageError(format!(
                "failed to read collection {} from {}: {}",
                collection,
                file.path().display(),
                e
            ))
        })
    }

    async fn with_collection<R>(
        &self,
        collection: &str,
        persist: bool,
        f: impl FnOnce(&mut Collection) -> R,
    ) -> Result<R, OrchestratorError> {
        let mut cache = self.cache.lock().await;
        if !cache.contains_key(collection) {
            let loaded = self.read_collection(collection).await?;
            debug!("Loaded {} {} records", loaded.len(), collection);
            cache.insert(collection.to_string(), loaded);
        }
        let entries = cache
            .get_mut(collection)
            .ok_or_else(|| OrchestratorError::Internal(format!("collection {} not cached", collection)))?;
        if !persist {
            return Ok(f(entries));
        }
        // the cache only takes the change once it is on disk
        let mut staged = entries.clone();
        let result = f(&mut staged);
        self.collection_file(collection).write_json(&staged).await?;
        *entries = staged;
        Ok(result)
    }
}

#[async_trait]
impl MetadataStore for JsonFileStore {
    async fn load(&self, collection: &str, id: &str) -> Result<Option<Value>, OrchestratorError> {
        self.with_collection(collection, false, |c| c.get(id).cloned())
            .await
    }

    async fn save(&self, collection: &str, id: &str, value: Value) -> Result<(), OrchestratorError> {
        self.with_collection(collection, true, |c| {
            c.insert(id.to_string(), value);
        })
        .await
    }

    async fn remove(&self, collection: &str, id: &str) -> Result<bool, OrchestratorError> {
        self.with_collection(collection, true, |c| c.remove(id).is_some())
            .await
    }

    async fn list(&self, collection: &str) -> Result<Vec<Value>, OrchestratorError> {
        self.with_collection(collection, false, |c| c.values().cloned().collect())
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_records_survive_reopen() {
        let temp = tempfile::tempdir().unwrap();
        let dir = Dir::new(temp.path());

        let store = JsonFileStore::new(dir.clone());
        store
            .save("apps", "a1", json!({"id": "a1", "name": "blog"}))
            .await
            .unwrap();
        store
            .save("apps", "a2", json!({"id": "a2", "name": "shop"}))
            .await
            .unwrap();
        assert!(store.remove("apps", "a2").await.unwrap());

        let reopened = JsonFileStore::new(dir);
        let listed = reopened.list("apps").await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0]["name"], "blog");
        assert!(reopened.load("apps", "a2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_failed_write_leaves_cache_untouched() {
        let temp = tempfile::tempdir().unwrap();
        // a regular file where the state directory should be
        let blocker = temp.path().join("state");
        std::fs::write(&blocker, b"").unwrap();
        let store = JsonFileStore::new(Dir::new(&blocker));

        assert!(store.list("apps").await.unwrap().is_empty());
        assert!(store
            .save("apps", "a1", json!({"id": "a1"}))
            .await
            .is_err());
        assert!(store.load("apps", "a1").await.unwrap().is_none());
        assert!(store.list("apps").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_missing_collection_is_empty() {
        let temp = tempfile::tempdir().unwrap();
        let store = JsonFileStore::new(Dir::new(temp.path()));
        assert!(store.list("hosts").await.unwrap().is_empty());
        assert!(!store.remove("hosts", "h1").await.unwrap());
    }
}
