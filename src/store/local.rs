use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};

use super::storage::collection_id;
use super::{
    ImageRecord, RecordFilter, RecordPayload, ScoredRecord, StoreError, VectorIndex,
    VectorStorage, VectorStore,
};

/// Single-collection store held in memory, optionally persisted to one file.
///
/// An existing file is reused as it is: a different collection id or
/// dimensionality in its header is logged, not rejected. Every operation
/// runs on the blocking pool since persisting rewrites the whole file.
pub struct LocalStore {
    inner: Arc<Inner>,
}

struct Inner {
    collection: String,
    dimensions: usize,
    storage: Option<VectorStorage>,
    /// `None` until the collection is created or loaded.
    index: Mutex<Option<VectorIndex>>,
}

impl Inner {
    fn lock(&self) -> Result<MutexGuard<'_, Option<VectorIndex>>, StoreError> {
        self.index
            .lock()
            .map_err(|e| StoreError::Backend(format!("Lock poisoned: {}", e)))
    }

    fn persist(&self, index: &VectorIndex) -> Result<(), StoreError> {
        if let Some(storage) = &self.storage {
            storage.save(index, &collection_id(&self.collection))?;
        }
        Ok(())
    }

    fn missing(&self) -> StoreError {
        StoreError::MissingCollection(self.collection.clone())
    }

    fn load(&self, storage: &VectorStorage) -> Result<VectorIndex, StoreError> {
        let stored = storage.load()?;
        if stored.collection_id != collection_id(&self.collection) {
            log::warn!(
                "{} was written for another collection, reusing it as {}",
                storage.path().display(),
                self.collection
            );
        }
        if stored.index.dimensions() != self.dimensions {
            log::warn!(
                "collection {} holds {}-dimensional vectors, configured for {}",
                self.collection,
                stored.index.dimensions(),
                self.dimensions
            );
        }
        log::info!(
            "loaded collection {} ({} vectors) from {}",
            self.collection,
            stored.index.len(),
            storage.path().display()
        );
        Ok(stored.index)
    }
}

impl LocalStore {
    fn with_storage(collection: &str, dimensions: usize, storage: Option<VectorStorage>) -> Self {
        Self {
            inner: Arc::new(Inner {
                collection: collection.to_string(),
                dimensions,
                storage,
                index: Mutex::new(None),
            }),
        }
    }

    pub fn open(path: PathBuf, collection: &str, dimensions: usize) -> Self {
        Self::with_storage(collection, dimensions, Some(VectorStorage::new(path)))
    }

    pub fn in_memory(collection: &str, dimensions: usize) -> Self {
        Self::with_storage(collection, dimensions, None)
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&Inner) -> Result<T, StoreError> + Send + 'static,
        T: Send + 'static,
    {
        let inner = self.inner.clone();
        tokio::task::spawn_blocking(move || f(&inner))
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?
    }
}

#[async_trait]
impl VectorStore for LocalStore {
    async fn ensure_collection(&self) -> Result<(), StoreError> {
        self.blocking(|inner| {
            let mut guard = inner.lock()?;
            if guard.is_some() {
                return Ok(());
            }

            let index = match &inner.storage {
                Some(storage) if storage.exists() => inner.load(storage)?,
                _ => {
                    let index = VectorIndex::new(inner.dimensions);
                    inner.persist(&index)?;
                    log::info!("created collection {}", inner.collection);
                    index
                }
            };

            *guard = Some(index);
            Ok(())
        })
        .await
    }

    async fn upsert(&self, records: Vec<ImageRecord>) -> Result<(), StoreError> {
        self.blocking(move |inner| {
            let mut guard = inner.lock()?;
            let index = guard.as_mut().ok_or_else(|| inner.missing())?;

            let mut first_error = None;
            for record in records {
                let id = record.id.clone();
                if let Err(e) = index.insert(record) {
                    log::warn!("rejected vector {id}: {e}");
                    first_error.get_or_insert(e);
                }
            }

            inner.persist(index)?;
            match first_error {
                Some(e) => Err(e.into()),
                None => Ok(()),
            }
        })
        .await
    }

    async fn search(
        &self,
        vector: Vec<f32>,
        filter: &RecordFilter,
        limit: usize,
    ) -> Result<Vec<ScoredRecord>, StoreError> {
        let filter = filter.clone();
        self.blocking(move |inner| {
            let guard = inner.lock()?;
            let index = guard.as_ref().ok_or_else(|| inner.missing())?;
            Ok(index.search(&vector, &filter, limit)?)
        })
        .await
    }

    async fn get(&self, id: &str) -> Result<Option<RecordPayload>, StoreError> {
        let id = id.to_string();
        self.blocking(move |inner| {
            let guard = inner.lock()?;
            let index = guard.as_ref().ok_or_else(|| inner.missing())?;
            Ok(index.get(&id).map(|entry| entry.payload.clone()))
        })
        .await
    }

    async fn count(&self) -> Result<u64, StoreError> {
        self.blocking(|inner| {
            let guard = inner.lock()?;
            let index = guard.as_ref().ok_or_else(|| inner.missing())?;
            Ok(index.len() as u64)
        })
        .await
    }

    async fn delete_collection(&self) -> Result<(), StoreError> {
        self.blocking(|inner| {
            let mut guard = inner.lock()?;
            *guard = None;
            if let Some(storage) = &inner.storage {
                storage.delete()?;
            }
            log::info!("deleted collection {}", inner.collection);
            Ok(())
        })
        .await
    }
}
