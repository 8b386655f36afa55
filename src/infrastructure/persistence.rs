//! Persisted key-value slots.
//!
//! The paired sensor and the last successful sync time survive restarts.
//! Both live in an injected [`KeyValueStore`] so tests can run against memory.

use crate::domain::models::SensorIdentity;
use anyhow::Context;
use chrono::{DateTime, TimeZone, Utc};
use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::debug;

pub const PAIRED_ADDRESS_KEY: &str = "paired_cosinuss_one_addr";
pub const PAIRED_NAME_KEY: &str = "paired_cosinuss_one_name";
pub const LAST_SYNC_TIME_KEY: &str = "last_cosinuss_sync_time";

pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;
    fn set(&self, key: &str, value: &str) -> anyhow::Result<()>;
    fn remove(&self, key: &str) -> anyhow::Result<()>;
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    values: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, String>> {
        self.values.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Option<String> {
        self.lock().get(key).cloned()
    }

    fn set(&self, key: &str, value: &str) -> anyhow::Result<()> {
        self.lock().insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> anyhow::Result<()> {
        self.lock().remove(key);
        Ok(())
    }
}

/// A flat JSON object on disk, rewritten on every change.
pub struct JsonFileStore {
    path: PathBuf,
    values: Mutex<HashMap<String, String>>,
}

impl JsonFileStore {
    /// Open (or create) the store at `path`. An unreadable file starts empty.
    pub fn open(path: PathBuf) -> anyhow::Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let values = fs::read_to_string(&path)
            .ok()
            .and_then(|contents| serde_json::from_str(&contents).ok())
            .unwrap_or_default();
        Ok(Self {
            path,
            values: Mutex::new(values),
        })
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, String>> {
        self.values.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self, values: &HashMap<String, String>) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(values)?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, json).with_context(|| format!("Failed to write {}", tmp.display()))?;
        fs::rename(&tmp, &self.path)
            .with_context(|| format!("Failed to replace {}", self.path.display()))?;
        Ok(())
    }
}

impl KeyValueStore for JsonFileStore {
    fn get(&self, key: &str) -> Option<String> {
        self.lock().get(key).cloned()
    }

    fn set(&self, key: &str, value: &str) -> anyhow::Result<()> {
        let mut values = self.lock();
        values.insert(key.to_string(), value.to_string());
        self.write(&values)
    }

    fn remove(&self, key: &str) -> anyhow::Result<()> {
        let mut values = self.lock();
        if values.remove(key).is_some() {
            self.write(&values)?;
        }
        Ok(())
    }
}

/// Single slot holding the paired sensor.
#[derive(Clone)]
pub struct PairingStore {
    store: Arc<dyn KeyValueStore>,
}

impl PairingStore {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    pub fn save(&self, identity: &SensorIdentity) -> anyhow::Result<()> {
        debug!(address = %identity.address, "Persisting paired sensor");
        self.store.set(PAIRED_ADDRESS_KEY, &identity.address)?;
        match &identity.name {
            Some(name) => self.store.set(PAIRED_NAME_KEY, name)?,
            None => self.store.remove(PAIRED_NAME_KEY)?,
        }
        Ok(())
    }

    pub fn load(&self) -> Option<SensorIdentity> {
        let address = self.store.get(PAIRED_ADDRESS_KEY)?;
        Some(SensorIdentity::new(address, self.store.get(PAIRED_NAME_KEY)))
    }

    pub fn clear(&self) -> anyhow::Result<()> {
        self.store.remove(PAIRED_ADDRESS_KEY)?;
        self.store.remove(PAIRED_NAME_KEY)?;
        Ok(())
    }
}

pub fn load_last_sync_time(store: &dyn KeyValueStore) -> Option<DateTime<Utc>> {
    let millis = store.get(LAST_SYNC_TIME_KEY)?.parse::<i64>().ok()?;
    Utc.timestamp_millis_opt(millis).single()
}

pub fn save_last_sync_time(store: &dyn KeyValueStore, time: DateTime<Utc>) -> anyhow::Result<()> {
    store.set(LAST_SYNC_TIME_KEY, &time.timestamp_millis().to_string())
}
