//! Durable storage for the trade limiter's penalty ledger
//!
//! The on-disk format is a single JSON document:
//!
//! ```json
//! {
//!   "stopLossHistory": {"PEPE": "2024-03-01T12:00:00Z"},
//!   "consecutiveStops": {"PEPE": 2},
//!   "lastTradeOutcomes": {"PEPE": "stop_loss"},
//!   "lastUpdated": "2024-03-01T12:00:00Z"
//! }
//! ```
//!
//! Saves go through [`PersistenceWorker`] so the evaluation loop never waits
//! on the filesystem. Only the newest snapshot is written.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::error::GuardResult;
use crate::sync;

// =============================================================================
// Data Model
// =============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedLimiterState {
    #[serde(default)]
    pub stop_loss_history: BTreeMap<String, DateTime<Utc>>,
    #[serde(default)]
    pub consecutive_stops: BTreeMap<String, u32>,
    /// Exit reason strings, e.g. `"stop_loss"`
    #[serde(default)]
    pub last_trade_outcomes: BTreeMap<String, String>,
    #[serde(default)]
    pub last_updated: Option<DateTime<Utc>>,
}

impl PersistedLimiterState {
    pub fn is_empty(&self) -> bool {
        self.stop_loss_history.is_empty()
            && self.consecutive_stops.is_empty()
            && self.last_trade_outcomes.is_empty()
    }
}

// =============================================================================
// Stores
// =============================================================================

pub trait LimiterStore: Send + Sync {
    /// `Ok(None)` when nothing has been saved yet
    fn load(&self) -> GuardResult<Option<PersistedLimiterState>>;

    fn save(&self, state: &PersistedLimiterState) -> GuardResult<()>;
}

/// JSON file store with write-to-temp-then-rename saves
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

impl LimiterStore for JsonFileStore {
    fn load(&self) -> GuardResult<Option<PersistedLimiterState>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let contents = fs::read_to_string(&self.path)?;
        let state = serde_json::from_str(&contents)?;
        Ok(Some(state))
    }

    fn save(&self, state: &PersistedLimiterState) -> GuardResult<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let json = serde_json::to_string_pretty(state)?;
        let tmp = self.temp_path();
        fs::write(&tmp, json)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

/// In-memory store, used when no state file is configured
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<Option<PersistedLimiterState>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> Option<PersistedLimiterState> {
        sync::lock(&self.state).clone()
    }
}

impl LimiterStore for MemoryStore {
    fn load(&self) -> GuardResult<Option<PersistedLimiterState>> {
        Ok(self.snapshot())
    }

    fn save(&self, state: &PersistedLimiterState) -> GuardResult<()> {
        *sync::lock(&self.state) = Some(state.clone());
        Ok(())
    }
}

/// Build the store named by the limiter config
pub fn store_for(state_file: Option<&Path>) -> Arc<dyn LimiterStore> {
    match state_file {
        Some(path) => Arc::new(JsonFileStore::new(path)),
        None => Arc::new(MemoryStore::new()),
    }
}

// =============================================================================
// Background writer
// =============================================================================

/// Non-blocking handle used by the limiter to hand off snapshots
#[derive(Debug, Clone)]
pub struct StateSender {
    tx: Arc<watch::Sender<Option<PersistedLimiterState>>>,
}

impl StateSender {
    /// Replace the pending snapshot. Never blocks and never fails.
    pub fn submit(&self, state: PersistedLimiterState) {
        self.tx.send_replace(Some(state));
    }
}

/// Writes the latest submitted snapshot whenever it changes.
///
/// The worker exits after every [`StateSender`] is dropped, writing any
/// snapshot still pending first.
pub struct PersistenceWorker {
    rx: watch::Receiver<Option<PersistedLimiterState>>,
    store: Arc<dyn LimiterStore>,
}

impl PersistenceWorker {
    pub fn new(store: Arc<dyn LimiterStore>) -> (StateSender, Self) {
        let (tx, rx) = watch::channel(None);
        (StateSender { tx: Arc::new(tx) }, Self { rx, store })
    }

    pub async fn run(mut self) {
        let mut saves = 0usize;
        while self.rx.changed().await.is_ok() {
            let Some(state) = self.rx.borrow_and_update().clone() else {
                continue;
            };
            let store = Arc::clone(&self.store);
            match tokio::task::spawn_blocking(move || store.save(&state)).await {
                Ok(Ok(())) => {
                    saves += 1;
                    debug!("Limiter state saved");
                }
                Ok(Err(e)) => warn!("Failed to save limiter state: {}", e),
                Err(e) => warn!("Limiter state save task failed: {}", e),
            }
        }
        info!("Persistence worker stopped after {} saves", saves);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn temp_file(name: &str) -> PathBuf {
        std::env::temp_dir()
            .join(format!("crypto_guard_store_{}", std::process::id()))
            .join(name)
    }

    fn sample_state() -> PersistedLimiterState {
        let ts = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        let mut state = PersistedLimiterState::default();
        state.stop_loss_history.insert("PEPE".to_string(), ts);
        state.consecutive_stops.insert("PEPE".to_string(), 2);
        state
            .last_trade_outcomes
            .insert("PEPE".to_string(), "stop_loss".to_string());
        state.last_updated = Some(ts);
        state
    }

    #[test]
    fn test_camel_case_document() {
        let json = serde_json::to_value(sample_state()).unwrap();
        assert_eq!(json["consecutiveStops"]["PEPE"], 2);
        assert_eq!(json["lastTradeOutcomes"]["PEPE"], "stop_loss");
        assert_eq!(json["stopLossHistory"]["PEPE"], "2024-03-01T12:00:00Z");
        assert!(json.get("lastUpdated").is_some());
    }

    #[test]
    fn test_missing_keys_load_as_empty() {
        let state: PersistedLimiterState = serde_json::from_str("{}").unwrap();
        assert!(state.is_empty());
        assert!(state.last_updated.is_none());
    }

    #[test]
    fn test_file_store_creates_dirs_and_reloads() {
        let path = temp_file("nested/limiter.json");
        let _ = fs::remove_file(&path);
        let store = JsonFileStore::new(&path);
        assert!(store.load().unwrap().is_none());

        store.save(&sample_state()).unwrap();
        assert!(!store.temp_path().exists());
        assert_eq!(store.load().unwrap(), Some(sample_state()));

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn test_corrupt_file_is_an_error() {
        let path = temp_file("corrupt.json");
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, "{not json").unwrap();
        assert!(JsonFileStore::new(&path).load().is_err());
        let _ = fs::remove_file(&path);
    }

    #[tokio::test]
    async fn test_worker_writes_latest_snapshot_before_exit() {
        let store = Arc::new(MemoryStore::new());
        let (sender, worker) = PersistenceWorker::new(store.clone());
        let handle = tokio::spawn(worker.run());

        sender.submit(PersistedLimiterState::default());
        sender.submit(sample_state());
        drop(sender);

        handle.await.unwrap();
        assert_eq!(store.snapshot(), Some(sample_state()));
    }
}
