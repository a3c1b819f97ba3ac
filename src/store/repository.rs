//! Generic JSON-backed repository with an in-memory cache.
//!
//! Each collection lives in one JSON file (an object keyed by record id).
//! The first touch loads and validates every record; validation errors on
//! load are fatal. Mutations validate the record, update the cache, and
//! rewrite the whole file. The write lock doubles as the in-process
//! serialisation queue for concurrent mutations.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use tokio::sync::RwLock;
use tracing::debug;

use super::records::Record;
use super::StoreError;

pub struct Repository<T: Record> {
    path: PathBuf,
    cache: RwLock<Option<HashMap<String, T>>>,
}

impl<T: Record> Repository<T> {
    pub fn new(data_dir: &Path) -> Self {
        Self {
            path: data_dir.join(format!("{}.json", T::COLLECTION)),
            cache: RwLock::new(None),
        }
    }

    pub fn collection(&self) -> &'static str {
        T::COLLECTION
    }

    async fn ensure_loaded(&self) -> Result<(), StoreError> {
        if self.cache.read().await.is_some() {
            return Ok(());
        }
        let mut guard = self.cache.write().await;
        if guard.is_some() {
            return Ok(());
        }

        let mut records: HashMap<String, T> = HashMap::new();
        if self.path.exists() {
            let content = tokio::fs::read_to_string(&self.path)
                .await
                .map_err(|e| StoreError::Io {
                    collection: T::COLLECTION,
                    source: e,
                })?;
            if !content.trim().is_empty() {
                records = serde_json::from_str(&content).map_err(|e| StoreError::Corrupt {
                    collection: T::COLLECTION,
                    message: e.to_string(),
                })?;
            }
            for (id, record) in &records {
                record.validate()?;
                if record.id() != id {
                    return Err(StoreError::Corrupt {
                        collection: T::COLLECTION,
                        message: format!("key {id} does not match record id {}", record.id()),
                    });
                }
            }
            debug!(
                collection = T::COLLECTION,
                count = records.len(),
                "loaded collection"
            );
        }

        *guard = Some(records);
        Ok(())
    }

    async fn persist(&self, records: &HashMap<String, T>) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| StoreError::Io {
                    collection: T::COLLECTION,
                    source: e,
                })?;
        }
        let content = serde_json::to_string_pretty(records).map_err(|e| StoreError::Corrupt {
            collection: T::COLLECTION,
            message: e.to_string(),
        })?;
        tokio::fs::write(&self.path, content)
            .await
            .map_err(|e| StoreError::Io {
                collection: T::COLLECTION,
                source: e,
            })
    }

    pub async fn get(&self, id: &str) -> Result<Option<T>, StoreError> {
        self.ensure_loaded().await?;
        let guard = self.cache.read().await;
        Ok(guard.as_ref().and_then(|map| map.get(id).cloned()))
    }

    pub async fn exists(&self, id: &str) -> Result<bool, StoreError> {
        self.ensure_loaded().await?;
        let guard = self.cache.read().await;
        Ok(guard.as_ref().is_some_and(|map| map.contains_key(id)))
    }

    pub async fn count(&self) -> Result<usize, StoreError> {
        self.ensure_loaded().await?;
        let guard = self.cache.read().await;
        Ok(guard.as_ref().map_or(0, HashMap::len))
    }

    pub async fn list(&self, filter: impl Fn(&T) -> bool) -> Result<Vec<T>, StoreError> {
        self.ensure_loaded().await?;
        let guard = self.cache.read().await;
        Ok(guard
            .as_ref()
            .map(|map| map.values().filter(|r| filter(r)).cloned().collect())
            .unwrap_or_default())
    }

    pub async fn list_all(&self) -> Result<Vec<T>, StoreError> {
        self.list(|_| true).await
    }

    pub async fn create(&self, record: T) -> Result<T, StoreError> {
        record.validate()?;
        self.ensure_loaded().await?;
        let mut guard = self.cache.write().await;
        let map = guard.as_mut().ok_or(StoreError::NotLoaded(T::COLLECTION))?;
        if map.contains_key(record.id()) {
            return Err(StoreError::Conflict {
                collection: T::COLLECTION,
                id: record.id().to_string(),
            });
        }
        map.insert(record.id().to_string(), record.clone());
        self.persist(map).await?;
        Ok(record)
    }

    /// Mutate one record in place. The mutated record is re-validated before
    /// the write-through; an invalid mutation leaves the cache untouched.
    pub async fn update_with(
        &self,
        id: &str,
        mutate: impl FnOnce(&mut T) -> Result<(), StoreError>,
    ) -> Result<T, StoreError> {
        self.ensure_loaded().await?;
        let mut guard = self.cache.write().await;
        let map = guard.as_mut().ok_or(StoreError::NotLoaded(T::COLLECTION))?;
        let current = map.get(id).ok_or_else(|| StoreError::NotFound {
            collection: T::COLLECTION,
            id: id.to_string(),
        })?;

        let mut updated = current.clone();
        mutate(&mut updated)?;
        updated.validate()?;

        map.insert(id.to_string(), updated.clone());
        self.persist(map).await?;
        Ok(updated)
    }

    /// Insert or replace. Used by singleton collections (identity).
    pub async fn upsert(&self, record: T) -> Result<T, StoreError> {
        record.validate()?;
        self.ensure_loaded().await?;
        let mut guard = self.cache.write().await;
        let map = guard.as_mut().ok_or(StoreError::NotLoaded(T::COLLECTION))?;
        map.insert(record.id().to_string(), record.clone());
        self.persist(map).await?;
        Ok(record)
    }

    /// Hard delete. Observations use soft delete instead; see
    /// `StoreContext::soft_delete_observation`.
    pub async fn delete(&self, id: &str) -> Result<(), StoreError> {
        self.ensure_loaded().await?;
        let mut guard = self.cache.write().await;
        let map = guard.as_mut().ok_or(StoreError::NotLoaded(T::COLLECTION))?;
        if map.remove(id).is_none() {
            return Err(StoreError::NotFound {
                collection: T::COLLECTION,
                id: id.to_string(),
            });
        }
        self.persist(map).await
    }
}

#[cfg(test)]
mod tests {
    use super::super::records::{Experience, Observation, ObservationSource, ObservationType};
    use super::*;
    use std::path::PathBuf;

    fn temp_dir() -> PathBuf {
        let dir = std::env::temp_dir().join(format!("noema_test_{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[tokio::test]
    async fn create_then_reload_round_trips() {
        let dir = temp_dir();
        let repo: Repository<Experience> = Repository::new(&dir);
        let exp = Experience::new("Wait for network idle after submitting forms", vec![], 0.7);
        let id = exp.id.clone();
        repo.create(exp).await.unwrap();

        // a fresh repository simulates a process restart
        let reloaded: Repository<Experience> = Repository::new(&dir);
        let found = reloaded.get(&id).await.unwrap().unwrap();
        assert_eq!(found.statement, "Wait for network idle after submitting forms");
    }

    #[tokio::test]
    async fn invalid_record_is_rejected() {
        let dir = temp_dir();
        let repo: Repository<Experience> = Repository::new(&dir);
        let long = Experience::new(
            (0..50).map(|i| format!("w{i}")).collect::<Vec<_>>().join(" "),
            vec![],
            0.7,
        );
        assert!(matches!(
            repo.create(long).await,
            Err(StoreError::Validation { .. })
        ));
        assert_eq!(repo.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn corrupt_file_is_fatal_on_load() {
        let dir = temp_dir();
        std::fs::write(dir.join("experiences.json"), "{not json").unwrap();
        let repo: Repository<Experience> = Repository::new(&dir);
        assert!(matches!(
            repo.count().await,
            Err(StoreError::Corrupt { .. })
        ));
    }

    #[tokio::test]
    async fn duplicate_create_conflicts() {
        let dir = temp_dir();
        let repo: Repository<Observation> = Repository::new(&dir);
        let obs = Observation::new(
            ObservationType::Text,
            "login page shows a lock icon",
            ObservationSource {
                sensor: "text".into(),
                ..Default::default()
            },
        );
        repo.create(obs.clone()).await.unwrap();
        assert!(matches!(
            repo.create(obs).await,
            Err(StoreError::Conflict { .. })
        ));
    }
}
