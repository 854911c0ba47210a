//! Persisted slots - the key-value store the application state is externalized to.
//!
//! This module provides:
//! - The [`KeyValueStore`] seam (read / write / remove / subscribe-to-change)
//! - An in-memory store with multi-tab handles, used by tests and embedders
//! - A file-backed store with one JSON file per slot

use crate::error::{ChatError, ChatResult};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tempfile::NamedTempFile;
use tokio::sync::broadcast;
use tracing::{debug, warn};

// ============================================
// Slot names
// ============================================

pub const CONVERSATIONS_SLOT: &str = "nepex-conversations";
pub const SETTINGS_SLOT: &str = "nepex-settings";
pub const USERS_SLOT: &str = "nepex-users";
pub const LOGS_SLOT: &str = "nepex-logs";
pub const MAINTENANCE_SLOT: &str = "maintenanceMode";
pub const ADMIN_SESSION_SLOT: &str = "isAdmin";
pub const ONBOARDING_SLOT: &str = "onboardingComplete";
pub const API_KEY_SLOT: &str = "nepex-api-key";

const CHANGE_FEED_CAPACITY: usize = 64;

// ============================================
// Store interface
// ============================================

/// A change made by another handle ("tab") on the same backing store. Events carry
/// no payload; subscribers re-read the slots they care about.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StorageEvent {
    /// The slot was written or removed.
    Changed(String),
    /// The subscriber fell behind and some changes were dropped.
    Missed,
}

impl StorageEvent {
    /// Whether a subscriber watching `key` should re-read it.
    pub fn affects(&self, key: &str) -> bool {
        match self {
            StorageEvent::Changed(changed) => changed == key,
            StorageEvent::Missed => true,
        }
    }
}

#[derive(Clone)]
struct Published {
    key: String,
    origin: u64,
}

pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;

    /// Fully overwrites the slot.
    fn set(&self, key: &str, value: &str) -> ChatResult<()>;

    fn remove(&self, key: &str) -> ChatResult<()>;

    /// Changes made through other handles on the same backing store.
    fn subscribe(&self) -> StorageSubscription;
}

/// Read a JSON slot. Missing and unparseable slots both come back as `None`.
pub fn read_json<T: DeserializeOwned>(store: &dyn KeyValueStore, key: &str) -> Option<T> {
    let raw = store.get(key)?;
    match serde_json::from_str(&raw) {
        Ok(value) => Some(value),
        Err(err) => {
            warn!(slot = key, error = %err, "corrupt slot, falling back to default");
            None
        }
    }
}

/// Serialize and write a slot. Failures are logged; in-memory state stays authoritative.
pub fn write_json<T: Serialize + ?Sized>(store: &dyn KeyValueStore, key: &str, value: &T) {
    let result = serde_json::to_string(value)
        .map_err(ChatError::from)
        .and_then(|raw| store.set(key, &raw));
    if let Err(err) = result {
        warn!(slot = key, error = %err, "failed to persist slot");
    }
}

pub fn read_flag(store: &dyn KeyValueStore, key: &str) -> bool {
    store.get(key).as_deref() == Some("true")
}

pub fn write_flag(store: &dyn KeyValueStore, key: &str, value: bool) {
    if let Err(err) = store.set(key, if value { "true" } else { "false" }) {
        warn!(slot = key, error = %err, "failed to persist flag");
    }
}

pub fn remove_slot(store: &dyn KeyValueStore, key: &str) {
    if let Err(err) = store.remove(key) {
        warn!(slot = key, error = %err, "failed to remove slot");
    }
}

// ============================================
// Change feed shared by all handles of one backing store
// ============================================

struct ChangeFeed {
    sender: broadcast::Sender<Published>,
    next_tab: AtomicU64,
}

impl ChangeFeed {
    fn new() -> Arc<Self> {
        let (sender, _) = broadcast::channel(CHANGE_FEED_CAPACITY);
        Arc::new(Self {
            sender,
            next_tab: AtomicU64::new(1),
        })
    }

    fn open_tab(&self) -> u64 {
        self.next_tab.fetch_add(1, Ordering::Relaxed)
    }

    fn publish(&self, origin: u64, key: &str) {
        // No subscribers is fine.
        let _ = self.sender.send(Published {
            key: key.to_string(),
            origin,
        });
    }

    fn subscribe(&self, tab: u64) -> StorageSubscription {
        StorageSubscription {
            receiver: self.sender.subscribe(),
            tab,
        }
    }
}

/// Receives slot changes written by other handles; the handle's own writes are skipped.
pub struct StorageSubscription {
    receiver: broadcast::Receiver<Published>,
    tab: u64,
}

impl StorageSubscription {
    /// Waits for the next foreign change. `None` once every handle is gone.
    pub async fn next(&mut self) -> Option<StorageEvent> {
        loop {
            match self.receiver.recv().await {
                Ok(event) if event.origin == self.tab => continue,
                Ok(event) => return Some(StorageEvent::Changed(event.key)),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "storage change feed lagged");
                    return Some(StorageEvent::Missed);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Non-blocking variant of [`next`](Self::next).
    pub fn try_next(&mut self) -> Option<StorageEvent> {
        loop {
            match self.receiver.try_recv() {
                Ok(event) if event.origin == self.tab => continue,
                Ok(event) => return Some(StorageEvent::Changed(event.key)),
                Err(broadcast::error::TryRecvError::Lagged(skipped)) => {
                    warn!(skipped, "storage change feed lagged");
                    return Some(StorageEvent::Missed);
                }
                Err(_) => return None,
            }
        }
    }
}

// ============================================
// In-memory backend
// ============================================

/// Shared in-memory slots. Each [`open_tab`](Self::open_tab) handle behaves like a
/// separate browser tab over the same storage.
#[derive(Clone)]
pub struct MemoryStorage {
    slots: Arc<Mutex<HashMap<String, String>>>,
    feed: Arc<ChangeFeed>,
    tab: u64,
}

impl MemoryStorage {
    pub fn new() -> Self {
        let feed = ChangeFeed::new();
        let tab = feed.open_tab();
        Self {
            slots: Arc::new(Mutex::new(HashMap::new())),
            feed,
            tab,
        }
    }

    pub fn open_tab(&self) -> Self {
        Self {
            slots: self.slots.clone(),
            feed: self.feed.clone(),
            tab: self.feed.open_tab(),
        }
    }

    pub fn keys(&self) -> Vec<String> {
        let slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        slots.keys().cloned().collect()
    }
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl KeyValueStore for MemoryStorage {
    fn get(&self, key: &str) -> Option<String> {
        let slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        slots.get(key).cloned()
    }

    fn set(&self, key: &str, value: &str) -> ChatResult<()> {
        {
            let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
            slots.insert(key.to_string(), value.to_string());
        }
        self.feed.publish(self.tab, key);
        Ok(())
    }

    fn remove(&self, key: &str) -> ChatResult<()> {
        let removed = {
            let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
            slots.remove(key).is_some()
        };
        if removed {
            self.feed.publish(self.tab, key);
        }
        Ok(())
    }

    fn subscribe(&self) -> StorageSubscription {
        self.feed.subscribe(self.tab)
    }
}

// ============================================
// File backend
// ============================================

/// One `<slot>.json` file per slot under a data directory.
#[derive(Clone)]
pub struct FileStorage {
    root: PathBuf,
    feed: Arc<ChangeFeed>,
    tab: u64,
}

impl FileStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let feed = ChangeFeed::new();
        let tab = feed.open_tab();
        Self {
            root: root.into(),
            feed,
            tab,
        }
    }

    /// Platform data directory, or `./cache` when none is available.
    pub fn default_root() -> PathBuf {
        if let Some(data_dir) = dirs::data_local_dir() {
            return data_dir.join("nepex");
        }
        PathBuf::from("cache")
    }

    pub fn open_tab(&self) -> Self {
        Self {
            root: self.root.clone(),
            feed: self.feed.clone(),
            tab: self.feed.open_tab(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn slot_path(&self, key: &str) -> PathBuf {
        self.root.join(format!("{}.json", sanitize_key(key)))
    }
}

impl KeyValueStore for FileStorage {
    fn get(&self, key: &str) -> Option<String> {
        fs::read_to_string(self.slot_path(key)).ok()
    }

    /// Writes a sibling temp file and renames it over the slot, so a crash mid-write
    /// leaves the previous contents intact.
    fn set(&self, key: &str, value: &str) -> ChatResult<()> {
        fs::create_dir_all(&self.root)?;
        let mut staged = NamedTempFile::new_in(&self.root)?;
        staged.write_all(value.as_bytes())?;
        staged.as_file().sync_all()?;
        staged.persist(self.slot_path(key)).map_err(|err| err.error)?;
        debug!(slot = key, bytes = value.len(), "slot written");
        self.feed.publish(self.tab, key);
        Ok(())
    }

    fn remove(&self, key: &str) -> ChatResult<()> {
        let path = self.slot_path(key);
        if path.exists() {
            fs::remove_file(path)?;
            self.feed.publish(self.tab, key);
        }
        Ok(())
    }

    fn subscribe(&self) -> StorageSubscription {
        self.feed.subscribe(self.tab)
    }
}

/// Sanitize a slot name for filesystem use
fn sanitize_key(key: &str) -> String {
    key.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .take(64)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_key() {
        assert_eq!(sanitize_key("nepex-settings"), "nepex-settings");
        assert_eq!(sanitize_key("user:preferences"), "user_preferences");
        assert_eq!(sanitize_key("../escape"), "___escape");
    }

    #[test]
    fn own_writes_are_not_echoed() {
        let tab_a = MemoryStorage::new();
        let tab_b = tab_a.open_tab();
        let mut feed_a = tab_a.subscribe();
        let mut feed_b = tab_b.subscribe();

        tab_a.set(SETTINGS_SLOT, "{}").unwrap();

        assert!(feed_a.try_next().is_none());
        let event = feed_b.try_next().expect("tab b sees tab a's write");
        assert_eq!(event, StorageEvent::Changed(SETTINGS_SLOT.to_string()));
    }

    #[test]
    fn a_lagging_subscriber_is_told_to_resync() {
        let tab_a = MemoryStorage::new();
        let tab_b = tab_a.open_tab();
        let mut feed_b = tab_b.subscribe();

        for i in 0..CHANGE_FEED_CAPACITY + 10 {
            tab_a.set(CONVERSATIONS_SLOT, &i.to_string()).unwrap();
        }

        let event = feed_b.try_next().expect("lag is reported");
        assert_eq!(event, StorageEvent::Missed);
        assert!(event.affects(SETTINGS_SLOT));
        assert!(!StorageEvent::Changed(CONVERSATIONS_SLOT.into()).affects(SETTINGS_SLOT));
    }

    #[test]
    fn corrupt_json_reads_as_absent() {
        let store = MemoryStorage::new();
        store.set(USERS_SLOT, "{not json").unwrap();
        let users: Option<Vec<String>> = read_json(&store, USERS_SLOT);
        assert!(users.is_none());
    }

    #[test]
    fn flags_are_boolean_strings() {
        let store = MemoryStorage::new();
        assert!(!read_flag(&store, MAINTENANCE_SLOT));
        write_flag(&store, MAINTENANCE_SLOT, true);
        assert_eq!(store.get(MAINTENANCE_SLOT).as_deref(), Some("true"));
        assert!(read_flag(&store, MAINTENANCE_SLOT));
    }
}
