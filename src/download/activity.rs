use std::sync::{Arc, Mutex, PoisonError};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{error, info, warn};

use crate::store::{SharedKvStore, StoreError};

pub const ACTIVITY_STORAGE_KEY: &str = "logs";
pub const ACTIVITY_MAX_ENTRIES: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogKind {
    Info,
    Success,
    Warn,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivityEntry {
    pub message: String,
    #[serde(rename = "type")]
    pub kind: LogKind,
    /// Epoch milliseconds.
    pub timestamp: i64,
}

/// User-facing status messages, mirrored to tracing and kept as a bounded
/// persisted list. Appends run on the blocking pool; clones share the
/// writer lock.
#[derive(Clone)]
pub struct ActivityLog {
    store: SharedKvStore,
    write_lock: Arc<Mutex<()>>,
}

impl ActivityLog {
    pub fn new(store: SharedKvStore) -> Self {
        Self {
            store,
            write_lock: Arc::new(Mutex::new(())),
        }
    }

    /// Never fails; a store error is only traced.
    pub async fn record(&self, kind: LogKind, message: impl Into<String>) {
        let message = message.into();
        match kind {
            LogKind::Info | LogKind::Success => info!(kind = ?kind, "{message}"),
            LogKind::Warn => warn!("{message}"),
            LogKind::Error => error!("{message}"),
        }
        let entry = ActivityEntry {
            message,
            kind,
            timestamp: Utc::now().timestamp_millis(),
        };
        let log = self.clone();
        match tokio::task::spawn_blocking(move || log.append(&entry)).await {
            Ok(Ok(())) => {}
            Ok(Err(error)) => warn!(error = %error, "activity log append failed"),
            Err(error) => warn!(error = %error, "activity log worker failed"),
        }
    }

    pub async fn info(&self, message: impl Into<String>) {
        self.record(LogKind::Info, message).await;
    }

    pub async fn success(&self, message: impl Into<String>) {
        self.record(LogKind::Success, message).await;
    }

    pub async fn warn(&self, message: impl Into<String>) {
        self.record(LogKind::Warn, message).await;
    }

    pub async fn error(&self, message: impl Into<String>) {
        self.record(LogKind::Error, message).await;
    }

    /// Oldest first.
    pub fn entries(&self) -> Result<Vec<ActivityEntry>, StoreError> {
        Ok(self
            .load_raw()?
            .into_iter()
            .filter_map(|entry| serde_json::from_value(entry).ok())
            .collect())
    }

    pub fn clear(&self) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        self.store.remove(ACTIVITY_STORAGE_KEY)
    }

    fn append(&self, entry: &ActivityEntry) -> Result<(), StoreError> {
        let value = serde_json::to_value(entry).map_err(|error| StoreError::Encode {
            key: ACTIVITY_STORAGE_KEY.to_string(),
            message: error.to_string(),
        })?;
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut entries = self.load_raw()?;
        entries.push(value);
        if entries.len() > ACTIVITY_MAX_ENTRIES {
            let overflow = entries.len() - ACTIVITY_MAX_ENTRIES;
            entries.drain(..overflow);
        }
        self.store.set(ACTIVITY_STORAGE_KEY, &Value::Array(entries))
    }

    fn load_raw(&self) -> Result<Vec<Value>, StoreError> {
        match self.store.get(ACTIVITY_STORAGE_KEY)? {
            Some(Value::Array(entries)) => Ok(entries),
            _ => Ok(Vec::new()),
        }
    }
}
