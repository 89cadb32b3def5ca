//! Query store seam.
use chrono::Utc;
use dashmap::DashMap;
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// Worth retrying: timeouts, dropped connections, lock conflicts.
    #[error("transient store error: {0}")]
    Transient(String),

    #[error("store error: {0}")]
    Fatal(String),
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Transient(_))
    }
}

/// What an upsert did to the stored document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    Updated,

    /// An identical document was already stored under the key.
    Unchanged,
}

/// Keyed document store, one collection per record type.
///
/// `upsert` must be idempotent: the same `(collection, key, doc)` twice leaves one document.
pub trait QueryStore: Send + Sync {
    /// Identity of the stored data. Two stores with the same id see the same documents.
    fn store_id(&self) -> &str;

    fn ensure_collection(&self, collection: &str) -> Result<(), StoreError>;

    fn upsert(&self, collection: &str, key: &str, doc: &Value) -> Result<UpsertOutcome, StoreError>;

    fn count(&self, collection: &str) -> Result<u64, StoreError>;

    fn get(&self, collection: &str, key: &str) -> Result<Option<Value>, StoreError>;
}

static MEMORY_STORE_COUNT: AtomicU64 = AtomicU64::new(0);

/// In process store. Its documents go away with it, so every instance has its own id.
///
/// Failures can be injected per key with `fail_next`, which the loader tests use to exercise
/// retries and incomplete batches.
#[derive(Debug)]
pub struct MemoryStore {
    id: String,
    collections: DashMap<String, DashMap<String, Value>>,
    failures: DashMap<String, (u32, StoreError)>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        let id = format!(
            "memory:{}:{}:{}",
            std::process::id(),
            Utc::now().timestamp_nanos_opt().unwrap_or_default(),
            MEMORY_STORE_COUNT.fetch_add(1, Ordering::Relaxed)
        );

        Self {
            id,
            collections: DashMap::new(),
            failures: DashMap::new(),
        }
    }

    /// Make the next `times` upserts of `key` fail with `error`.
    pub fn fail_next(&self, key: &str, times: u32, error: StoreError) {
        self.failures.insert(key.to_string(), (times, error));
    }

    fn take_failure(&self, key: &str) -> Option<StoreError> {
        let mut entry = self.failures.get_mut(key)?;
        let (times, error) = entry.value_mut();

        if *times == 0 {
            return None;
        }

        *times -= 1;
        Some(error.clone())
    }
}

impl QueryStore for MemoryStore {
    fn store_id(&self) -> &str {
        &self.id
    }

    fn ensure_collection(&self, collection: &str) -> Result<(), StoreError> {
        self.collections.entry(collection.to_string()).or_default();
        Ok(())
    }

    fn upsert(&self, collection: &str, key: &str, doc: &Value) -> Result<UpsertOutcome, StoreError> {
        if let Some(e) = self.take_failure(key) {
            return Err(e);
        }

        let docs = self
            .collections
            .get(collection)
            .ok_or_else(|| StoreError::Fatal(format!("unknown collection: {}", collection)))?;

        let outcome = match docs.insert(key.to_string(), doc.clone()) {
            None => UpsertOutcome::Inserted,
            Some(old) if old == *doc => UpsertOutcome::Unchanged,
            Some(_) => UpsertOutcome::Updated,
        };

        Ok(outcome)
    }

    fn count(&self, collection: &str) -> Result<u64, StoreError> {
        Ok(self
            .collections
            .get(collection)
            .map(|docs| docs.len() as u64)
            .unwrap_or_default())
    }

    fn get(&self, collection: &str, key: &str) -> Result<Option<Value>, StoreError> {
        Ok(self
            .collections
            .get(collection)
            .and_then(|docs| docs.get(key).map(|doc| doc.value().clone())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_memory_store_upsert() {
        let store = MemoryStore::new();
        assert!(store.upsert("trade", "k", &json!({})).is_err());

        store.ensure_collection("trade").unwrap();

        let doc = json!({"price": 0.5});
        assert_eq!(store.upsert("trade", "k", &doc), Ok(UpsertOutcome::Inserted));
        assert_eq!(store.upsert("trade", "k", &doc), Ok(UpsertOutcome::Unchanged));
        assert_eq!(
            store.upsert("trade", "k", &json!({"price": 0.6})),
            Ok(UpsertOutcome::Updated)
        );

        assert_eq!(store.count("trade"), Ok(1));
        assert_eq!(store.get("trade", "k"), Ok(Some(json!({"price": 0.6}))));
        assert_eq!(store.count("book"), Ok(0));
    }

    #[test]
    fn test_injected_failures_run_out() {
        let store = MemoryStore::new();
        store.ensure_collection("trade").unwrap();
        store.fail_next("k", 1, StoreError::Transient("timeout".to_string()));

        assert!(store.upsert("trade", "k", &json!({})).is_err());
        assert_eq!(store.upsert("trade", "k", &json!({})), Ok(UpsertOutcome::Inserted));
    }

    #[test]
    fn test_memory_stores_are_distinct() {
        let a = MemoryStore::new();
        let b = MemoryStore::default();

        assert!(a.store_id().starts_with("memory:"));
        assert_ne!(a.store_id(), b.store_id());
    }
}
