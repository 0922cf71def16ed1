//! Persistence of checker state in a key-value blob store.
//!
//! Store failures never reach callers: a state that cannot be read is treated as
//! "no prior state" and a state that cannot be written is logged and dropped.

mod sqlite;

pub use sqlite::*;

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::errors::CheckError;
use crate::models::CheckState;

/// Fixed key under which the checker state is stored.
pub const STATE_KEY: &str = "build-sentinel.check-state";

/// String blob storage shared by every checker instance in the process.
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn read(&self, key: &str) -> Result<Option<String>, CheckError>;

    async fn write(&self, key: &str, value: &str) -> Result<(), CheckError>;

    async fn remove(&self, key: &str) -> Result<(), CheckError>;
}

/// Load the persisted state, falling back to the default state.
pub async fn load_state(store: &dyn StateStore) -> CheckState {
    let raw = match store.read(STATE_KEY).await {
        Ok(Some(raw)) => raw,
        Ok(None) => return CheckState::default(),
        Err(err) => {
            tracing::warn!("Failed to read persisted check state: {}", err);
            return CheckState::default();
        }
    };

    match serde_json::from_str(&raw) {
        Ok(state) => state,
        Err(err) => {
            tracing::warn!("Discarding corrupted check state: {}", err);
            CheckState::default()
        }
    }
}

/// Persist the state; failures are logged and swallowed.
pub async fn save_state(store: &dyn StateStore, state: &CheckState) {
    let raw = match serde_json::to_string(state) {
        Ok(raw) => raw,
        Err(err) => {
            tracing::warn!("Failed to serialize check state: {}", err);
            return;
        }
    };
    if let Err(err) = store.write(STATE_KEY, &raw).await {
        tracing::warn!("Failed to persist check state: {}", err);
    }
}

/// Remove the persisted state; failures are logged and swallowed.
pub async fn clear_state(store: &dyn StateStore) {
    if let Err(err) = store.remove(STATE_KEY).await {
        tracing::warn!("Failed to clear persisted check state: {}", err);
    }
}

/// In-process store for headless runtimes and tests.
#[derive(Default)]
pub struct MemoryStateStore {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, String>>, CheckError> {
        self.entries
            .lock()
            .map_err(|_| CheckError::Persistence("memory store poisoned".to_string()))
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn read(&self, key: &str) -> Result<Option<String>, CheckError> {
        Ok(self.entries()?.get(key).cloned())
    }

    async fn write(&self, key: &str, value: &str) -> Result<(), CheckError> {
        self.entries()?.insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), CheckError> {
        self.entries()?.remove(key);
        Ok(())
    }
}
