//! Shared Run State
//!
//! A run-scoped key-value store visible to every step of a run. Values are
//! JSON so steps can store composite data without agreeing on Rust types.
//!
//! The store outlives the run: the [`RunHandle`](crate::execution::RunHandle)
//! keeps a reference so the last written values stay inspectable after a
//! timeout, cancellation or step failure.
//!
//! Multi-field updates go through [`SharedState::scoped_edit`] or
//! [`SharedState::edit`], which hold one key exclusively for the duration of
//! the edit and only write back on commit. Other keys stay readable and
//! writable while an edit is open, including from the step holding it.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::ops::{Deref, DerefMut};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use log::{debug, info};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Errors raised by state access.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("state key '{key}' could not be decoded: {source}")]
    Decode {
        key: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("value for state key '{key}' could not be encoded: {source}")]
    Encode {
        key: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("state snapshot I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("state snapshot is malformed: {0}")]
    Snapshot(#[from] serde_json::Error),
}

/// Milliseconds since the store was created at which it was last written.
#[derive(Debug)]
struct WriteClock {
    origin: Instant,
    last_write_ms: AtomicU64,
}

impl WriteClock {
    fn new() -> Self {
        Self {
            origin: Instant::now(),
            last_write_ms: AtomicU64::new(0),
        }
    }

    fn touch(&self) {
        let ms = self.origin.elapsed().as_millis() as u64;
        self.last_write_ms.fetch_max(ms, Ordering::Relaxed);
    }

    fn last_write(&self) -> Instant {
        self.origin + Duration::from_millis(self.last_write_ms.load(Ordering::Relaxed))
    }
}

type Values = Arc<StdMutex<HashMap<String, Value>>>;

/// The value map is only ever locked for a single read or write, never
/// across an await, so a poisoned lock still holds consistent data.
fn lock_values(
    values: &StdMutex<HashMap<String, Value>>,
) -> MutexGuard<'_, HashMap<String, Value>> {
    values.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Handle to a run's key-value store. Cloning shares the same store.
#[derive(Clone, Debug)]
pub struct SharedState {
    values: Values,
    /// One edit lock per key that has been edited
    edit_locks: Arc<StdMutex<HashMap<String, Arc<Mutex<()>>>>>,
    clock: Arc<WriteClock>,
}

impl SharedState {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::from_map(HashMap::new())
    }

    /// Creates a store seeded with initial values.
    pub fn from_map<I>(initial: I) -> Self
    where
        I: IntoIterator<Item = (String, Value)>,
    {
        Self {
            values: Arc::new(StdMutex::new(initial.into_iter().collect())),
            edit_locks: Arc::new(StdMutex::new(HashMap::new())),
            clock: Arc::new(WriteClock::new()),
        }
    }

    fn values(&self) -> MutexGuard<'_, HashMap<String, Value>> {
        lock_values(&self.values)
    }

    fn edit_lock(&self, key: &str) -> Arc<Mutex<()>> {
        let mut locks = self.edit_locks.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(locks.entry(key.to_string()).or_default())
    }

    /// Returns a copy of the value stored under `key`.
    pub async fn get(&self, key: &str) -> Option<Value> {
        self.values().get(key).cloned()
    }

    /// Returns the value under `key` decoded as `T`, or `default` if the key
    /// is absent.
    pub async fn get_or<T: DeserializeOwned>(&self, key: &str, default: T) -> Result<T, StateError> {
        match self.get(key).await {
            None => Ok(default),
            Some(value) => serde_json::from_value(value).map_err(|source| StateError::Decode {
                key: key.to_string(),
                source,
            }),
        }
    }

    /// Stores `value` under `key`, replacing any previous value.
    pub async fn set<T: Serialize>(&self, key: &str, value: T) -> Result<(), StateError> {
        let value = serde_json::to_value(value).map_err(|source| StateError::Encode {
            key: key.to_string(),
            source,
        })?;

        self.values().insert(key.to_string(), value);
        self.clock.touch();
        debug!("State key '{}' written", key);
        Ok(())
    }

    /// Removes `key`, returning its previous value.
    pub async fn remove(&self, key: &str) -> Option<Value> {
        let removed = self.values().remove(key);
        if removed.is_some() {
            self.clock.touch();
        }
        removed
    }

    pub async fn contains(&self, key: &str) -> bool {
        self.values().contains_key(key)
    }

    /// Returns all keys in sorted order.
    pub async fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.values().keys().cloned().collect();
        keys.sort();
        keys
    }

    pub async fn len(&self) -> usize {
        self.values().len()
    }

    pub async fn is_empty(&self) -> bool {
        self.values().is_empty()
    }

    /// Acquires `key` exclusively and returns an editable copy of its value
    /// (`Value::Null` if absent).
    ///
    /// Changes are written back only by [`ScopedEdit::commit`]. Dropping the
    /// edit on any other path, including `?` returns and panics, discards
    /// them. A second edit of the same key waits until this one is released;
    /// plain reads and writes of any key never wait on an edit.
    pub async fn scoped_edit(&self, key: &str) -> ScopedEdit {
        let lock = self.edit_lock(key).lock_owned().await;
        let value = self.values().get(key).cloned().unwrap_or(Value::Null);

        ScopedEdit {
            _lock: lock,
            values: Arc::clone(&self.values),
            key: key.to_string(),
            value,
            clock: Arc::clone(&self.clock),
        }
    }

    /// Runs `f` on an editable copy of the value under `key`, committing the
    /// result if `f` returns `Ok` and discarding it otherwise.
    pub async fn edit<T, E, F>(&self, key: &str, f: F) -> Result<T, E>
    where
        F: FnOnce(&mut Value) -> Result<T, E>,
    {
        let mut edit = self.scoped_edit(key).await;
        let result = f(&mut *edit)?;
        edit.commit();
        Ok(result)
    }

    /// Instant of the most recent write, or of store creation if nothing has
    /// been written yet.
    pub fn last_write(&self) -> Instant {
        self.clock.last_write()
    }

    /// Takes a point-in-time copy of every value.
    pub async fn snapshot(&self) -> StateSnapshot {
        let values = self
            .values()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        StateSnapshot {
            values,
            taken_at: Utc::now(),
        }
    }
}

impl Default for SharedState {
    fn default() -> Self {
        Self::new()
    }
}

/// Exclusive, scoped edit of one state key. See [`SharedState::scoped_edit`].
pub struct ScopedEdit {
    _lock: OwnedMutexGuard<()>,
    values: Values,
    key: String,
    value: Value,
    clock: Arc<WriteClock>,
}

impl ScopedEdit {
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Writes the edited value back and releases the key.
    pub fn commit(self) {
        let ScopedEdit {
            _lock,
            values,
            key,
            value,
            clock,
        } = self;

        debug!("State key '{}' committed", key);
        lock_values(&values).insert(key, value);
        clock.touch();
    }

    /// Releases the key without writing.
    pub fn discard(self) {
        debug!("State key '{}' edit discarded", self.key);
    }
}

impl Deref for ScopedEdit {
    type Target = Value;

    fn deref(&self) -> &Value {
        &self.value
    }
}

impl DerefMut for ScopedEdit {
    fn deref_mut(&mut self) -> &mut Value {
        &mut self.value
    }
}

/// Point-in-time copy of a run's state, serializable for inspection.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct StateSnapshot {
    /// Values keyed by state key
    pub values: BTreeMap<String, Value>,

    /// When the snapshot was taken
    pub taken_at: DateTime<Utc>,
}

impl StateSnapshot {
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    /// Saves the snapshot as pretty-printed JSON.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), StateError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }

        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)?;

        info!("Saved run state to {}", path.display());
        Ok(())
    }

    /// Loads a snapshot written by [`StateSnapshot::save`].
    pub fn load(path: impl AsRef<Path>) -> Result<Self, StateError> {
        let content = fs::read_to_string(path.as_ref())?;
        Ok(serde_json::from_str(&content)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_get_missing_is_none() {
        let state = SharedState::new();
        assert!(state.get("missing").await.is_none());
        assert!(state.is_empty().await);
    }

    #[tokio::test]
    async fn test_set_then_get() {
        let state = SharedState::new();
        state.set("passage", "two cars").await.unwrap();

        assert_eq!(state.get("passage").await, Some(json!("two cars")));
        assert!(state.contains("passage").await);
    }

    #[tokio::test]
    async fn test_get_or_default_and_decode() {
        let state = SharedState::new();
        assert_eq!(state.get_or("retries", 0u32).await.unwrap(), 0);

        state.set("retries", 2).await.unwrap();
        assert_eq!(state.get_or("retries", 0u32).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_get_or_type_mismatch() {
        let state = SharedState::new();
        state.set("retries", "many").await.unwrap();

        let err = state.get_or("retries", 0u32).await.unwrap_err();
        assert!(matches!(err, StateError::Decode { ref key, .. } if key == "retries"));
    }

    #[tokio::test]
    async fn test_from_map_seeds_values() {
        let state = SharedState::from_map(vec![("a".to_string(), json!(1))]);
        assert_eq!(state.get("a").await, Some(json!(1)));
        assert_eq!(state.keys().await, vec!["a".to_string()]);
    }

    #[tokio::test]
    async fn test_remove() {
        let state = SharedState::new();
        state.set("k", 1).await.unwrap();

        assert_eq!(state.remove("k").await, Some(json!(1)));
        assert_eq!(state.remove("k").await, None);
        assert_eq!(state.len().await, 0);
    }

    #[tokio::test]
    async fn test_scoped_edit_commit() {
        let state = SharedState::new();
        state.set("doc", json!({"a": 1})).await.unwrap();

        let mut edit = state.scoped_edit("doc").await;
        edit["b"] = json!(2);
        edit.commit();

        assert_eq!(state.get("doc").await, Some(json!({"a": 1, "b": 2})));
    }

    #[tokio::test]
    async fn test_scoped_edit_drop_discards() {
        let state = SharedState::new();
        state.set("doc", json!({"a": 1})).await.unwrap();

        {
            let mut edit = state.scoped_edit("doc").await;
            edit["b"] = json!(2);
        }

        assert_eq!(state.get("doc").await, Some(json!({"a": 1})));
    }

    #[tokio::test]
    async fn test_scoped_edit_absent_key_starts_null() {
        let state = SharedState::new();
        let edit = state.scoped_edit("new").await;
        assert!(edit.is_null());
        assert_eq!(edit.key(), "new");
        edit.discard();
        assert!(!state.contains("new").await);
    }

    #[tokio::test]
    async fn test_other_keys_usable_during_edit() {
        let state = SharedState::new();
        state.set("counter", 4).await.unwrap();

        let mut doc = state.scoped_edit("doc").await;
        let counter: u32 = state.get_or("counter", 0).await.unwrap();
        state.set("counter", counter + 1).await.unwrap();
        *doc = json!({"seen": counter});
        doc.commit();

        assert_eq!(state.get("doc").await, Some(json!({"seen": 4})));
        assert_eq!(state.get("counter").await, Some(json!(5)));
    }

    #[tokio::test]
    async fn test_same_key_edits_wait_for_each_other() {
        let state = SharedState::new();
        let first = state.scoped_edit("doc").await;

        let blocked =
            tokio::time::timeout(Duration::from_millis(50), state.scoped_edit("doc")).await;
        assert!(blocked.is_err());

        first.discard();
        let second =
            tokio::time::timeout(Duration::from_millis(50), state.scoped_edit("doc")).await;
        assert!(second.is_ok());
    }

    #[tokio::test]
    async fn test_edit_commits_on_ok() {
        let state = SharedState::new();
        let n: Result<u64, ()> = state
            .edit("counter", |v| {
                let next = v.as_u64().unwrap_or(0) + 1;
                *v = json!(next);
                Ok(next)
            })
            .await;

        assert_eq!(n, Ok(1));
        assert_eq!(state.get("counter").await, Some(json!(1)));
    }

    #[tokio::test]
    async fn test_edit_discards_on_err() {
        let state = SharedState::new();
        state.set("counter", 5).await.unwrap();

        let result: Result<(), &str> = state
            .edit("counter", |v| {
                *v = json!(100);
                Err("abort")
            })
            .await;

        assert_eq!(result, Err("abort"));
        assert_eq!(state.get("counter").await, Some(json!(5)));
    }

    #[tokio::test]
    async fn test_clones_share_store() {
        let state = SharedState::new();
        let other = state.clone();
        other.set("x", true).await.unwrap();
        assert_eq!(state.get("x").await, Some(json!(true)));
    }

    #[tokio::test]
    async fn test_last_write_advances() {
        let state = SharedState::new();
        let before = state.last_write();
        tokio::time::sleep(Duration::from_millis(20)).await;
        state.set("x", 1).await.unwrap();
        assert!(state.last_write() > before);
    }

    #[tokio::test]
    async fn test_snapshot_save_and_load() {
        let temp_dir = tempdir().unwrap();
        let path = temp_dir.path().join("state").join("run.json");

        let state = SharedState::new();
        state.set("retries", 2).await.unwrap();
        let snapshot = state.snapshot().await;
        snapshot.save(&path).unwrap();

        assert!(path.exists());
        let loaded = StateSnapshot::load(&path).unwrap();
        assert_eq!(loaded.get("retries"), Some(&json!(2)));
        assert_eq!(loaded, snapshot);
    }

    #[test]
    fn test_snapshot_load_nonexistent() {
        let result = StateSnapshot::load("/nonexistent/path/state.json");
        assert!(matches!(result, Err(StateError::Io(_))));
    }
}
