//! Metadata store
//!
//! Records are persisted as JSON documents grouped by collection. The
//! [`MetadataStore`] trait is the storage seam; [`Repository`] layers typed
//! access and serialized read-modify-write on top of it.

pub mod json_file;
pub mod memory;

use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::Mutex;

use crate::errors::OrchestratorError;

pub use json_file::JsonFileStore;
pub use memory::MemoryStore;

/// Untyped document storage keyed by collection and id
#[async_trait]
pub trait MetadataStore: Send + Sync {
    async fn load(&self, collection: &str, id: &str) -> Result<Option<Value>, OrchestratorError>;

    async fn save(&self, collection: &str, id: &str, value: Value) -> Result<(), OrchestratorError>;

    /// Returns whether a document was removed
    async fn remove(&self, collection: &str, id: &str) -> Result<bool, OrchestratorError>;

    async fn list(&self, collection: &str) -> Result<Vec<Value>, OrchestratorError>;
}

/// A persisted record type
pub trait Record: Serialize + DeserializeOwned + Send + Sync + 'static {
    const COLLECTION: &'static str;

    fn id(&self) -> &str;
}

/// Typed access to one collection
pub struct Repository<T: Record> {
    store: Arc<dyn MetadataStore>,
    write_lock: Arc<Mutex<()>>,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Record> Clone for Repository<T> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            write_lock: self.write_lock.clone(),
            _marker: PhantomData,
        }
    }
}

impl<T: Record> Repository<T> {
    pub fn new(store: Arc<dyn MetadataStore>) -> Self {
        Self {
            store,
            write_lock: Arc::new(Mutex::new(())),
            _marker: PhantomData,
        }
    }

    pub async fn find(&self, id: &str) -> Result<Option<T>, OrchestratorError> {
        match self.store.load(T::COLLECTION, id).await? {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    /// Like [`find`](Self::find) but a missing record is an error
    pub async fn get(&self, id: &str) -> Result<T, OrchestratorError> {
        self.find(id).await?.ok_or_else(|| {
            OrchestratorError::NotFound(format!("{} record {}", T::COLLECTION, id))
        })
    }

    pub async fn put(&self, record: &T) -> Result<(), OrchestratorError> {
        let _guard = self.write_lock.lock().await;
        self.save(record).await
    }

    /// Read-modify-write under the collection's write lock. Nothing is
    /// persisted when the closure fails.
    pub async fn update<F>(&self, id: &str, f: F) -> Result<T, OrchestratorError>
    where
        F: FnOnce(&mut T) -> Result<(), OrchestratorError> + Send,
    {
        let _guard = self.write_lock.lock().await;
        let mut record = self.get(id).await?;
        f(&mut record)?;
        self.save(&record).await?;
        Ok(record)
    }

    pub async fn delete(&self, id: &str) -> Result<bool, OrchestratorError> {
        let _guard = self.write_lock.lock().await;
        self.store.remove(T::COLLECTION, id).await
    }

    pub async fn list(&self) -> Result<Vec<T>, OrchestratorError> {
        self.store
            .list(T::COLLECTION)
            .await?
            .into_iter()
            .map(|value| serde_json::from_value(value).map_err(OrchestratorError::from))
            .collect()
    }

    async fn save(&self, record: &T) -> Result<(), OrchestratorError> {
        let value = serde_json::to_value(record)?;
        self.store.save(T::COLLECTION, record.id(), value).await
    }
}
