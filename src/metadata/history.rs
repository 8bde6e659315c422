use std::sync::{Arc, Mutex, PoisonError};

use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

use super::analytics::matches_search;
use super::normalize::GenerationRecord;
use crate::store::{SharedKvStore, StoreError};

pub const HISTORY_STORAGE_KEY: &str = "metadataCards";
pub const HISTORY_MAX_ENTRIES: usize = 500;

#[derive(Debug, Error)]
pub enum HistoryError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("failed to serialize history record: {0}")]
    Serialize(#[source] serde_json::Error),
    #[error("history worker failed: {0}")]
    Worker(String),
}

/// Bounded, append-only list of generation records. Appends go through one
/// writer lock so concurrent pipelines cannot drop each other's entries.
/// Clones share the lock.
#[derive(Clone)]
pub struct HistoryStore {
    store: SharedKvStore,
    write_lock: Arc<Mutex<()>>,
}

impl HistoryStore {
    pub fn new(store: SharedKvStore) -> Self {
        Self {
            store,
            write_lock: Arc::new(Mutex::new(())),
        }
    }

    /// [`HistoryStore::save_record`] on the blocking pool, for async callers.
    pub async fn append(&self, record: GenerationRecord) -> Result<(), HistoryError> {
        let history = self.clone();
        tokio::task::spawn_blocking(move || history.save_record(&record))
            .await
            .unwrap_or_else(|error| Err(HistoryError::Worker(error.to_string())))
    }

    pub fn save_record(&self, record: &GenerationRecord) -> Result<(), HistoryError> {
        let entry = serde_json::to_value(record).map_err(HistoryError::Serialize)?;
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);

        let mut entries = self.load_raw()?;
        entries.push(entry);
        if entries.len() > HISTORY_MAX_ENTRIES {
            let overflow = entries.len() - HISTORY_MAX_ENTRIES;
            entries.drain(..overflow);
        }
        self.store
            .set(HISTORY_STORAGE_KEY, &Value::Array(entries))?;
        debug!(id = %record.id, "saved generation record");
        Ok(())
    }

    /// Records in insertion order, oldest first.
    pub fn list(&self) -> Result<Vec<GenerationRecord>, HistoryError> {
        let entries = self.load_raw()?;
        Ok(entries
            .into_iter()
            .filter_map(|entry| match serde_json::from_value::<GenerationRecord>(entry) {
                Ok(record) => Some(record),
                Err(error) => {
                    warn!(error = %error, "skipping unreadable history entry");
                    None
                }
            })
            .collect())
    }

    pub fn search(&self, term: &str) -> Result<Vec<GenerationRecord>, HistoryError> {
        let records = self.list()?;
        if term.trim().is_empty() {
            return Ok(records);
        }
        Ok(records
            .into_iter()
            .filter(|record| matches_search(record, term))
            .collect())
    }

    pub fn clear(&self) -> Result<(), HistoryError> {
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        self.store
            .set(HISTORY_STORAGE_KEY, &Value::Array(Vec::new()))?;
        Ok(())
    }

    fn load_raw(&self) -> Result<Vec<Value>, HistoryError> {
        match self.store.get(HISTORY_STORAGE_KEY)? {
            Some(Value::Array(entries)) => Ok(entries),
            _ => Ok(Vec::new()),
        }
    }
}
