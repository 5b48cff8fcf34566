//! Durable key/value settings backed by a single JSON file.
//!
//! Every key written through [`ConfigStore::set`] stays dirty until the
//! whole mapping has been written back successfully. Load and save
//! failures are logged and reported as `false`; the agent keeps running on
//! whatever is in memory.
//!
//! # Usage
//!
//! ```no_run
//! use serde_json::json;
//! use wifi_agent_esp32::config::{ConfigStore, PersistPolicy};
//!
//! let mut store = ConfigStore::open("config.json", PersistPolicy::Immediate);
//! store.set("disable_debug", json!(true));
//! assert_eq!(store.get("disable_debug"), Some(&json!(true)));
//! ```

use log::{debug, error, info, warn};
use serde_json::{Map, Value};
use std::collections::HashSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// When a [`ConfigStore::set`] reaches the backing file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PersistPolicy {
    /// Write the file on every `set`.
    #[default]
    Immediate,
    /// Keep changes in memory until [`ConfigStore::flush`] (or shutdown).
    /// For flash parts with limited write endurance.
    Deferred,
}

impl std::str::FromStr for PersistPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "immediate" => Ok(Self::Immediate),
            "deferred" => Ok(Self::Deferred),
            other => Err(format!("unknown persist policy: {}", other)),
        }
    }
}

/// Settings store with dirty tracking.
#[derive(Debug)]
pub struct ConfigStore {
    path: PathBuf,
    settings: Map<String, Value>,
    dirty: HashSet<String>,
    policy: PersistPolicy,
}

impl ConfigStore {
    /// Create an empty store backed by `path`. Nothing is read yet.
    pub fn new(path: impl Into<PathBuf>, policy: PersistPolicy) -> Self {
        Self {
            path: path.into(),
            settings: Map::new(),
            dirty: HashSet::new(),
            policy,
        }
    }

    /// Create a store and load it from `path`.
    ///
    /// A missing or corrupt file leaves the store empty.
    pub fn open(path: impl Into<PathBuf>, policy: PersistPolicy) -> Self {
        let mut store = Self::new(path, policy);
        if !store.load() {
            warn!("Starting with empty configuration");
        }
        store
    }

    /// Backing file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Persistence policy in effect.
    pub fn policy(&self) -> PersistPolicy {
        self.policy
    }

    /// Read and parse the backing file, replacing the in-memory settings.
    ///
    /// Returns `false` (with the store left empty) if the file is missing
    /// or does not hold a JSON object.
    pub fn load(&mut self) -> bool {
        self.settings.clear();
        self.dirty.clear();

        let text = match fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!("No config file found at {:?}", self.path);
                return false;
            }
            Err(e) => {
                warn!("Failed to read config file {:?}: {}", self.path, e);
                return false;
            }
        };

        match serde_json::from_str::<Value>(&text) {
            Ok(Value::Object(settings)) => {
                info!("Loaded {} settings from {:?}", settings.len(), self.path);
                self.settings = settings;
                true
            }
            Ok(other) => {
                error!(
                    "Config file {:?} holds a {} instead of an object",
                    self.path,
                    json_kind(&other)
                );
                false
            }
            Err(e) => {
                error!("Failed to parse config file {:?}: {}", self.path, e);
                false
            }
        }
    }

    /// Look up a setting.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.settings.get(key)
    }

    /// Insert or overwrite a setting and mark it dirty.
    ///
    /// Under [`PersistPolicy::Immediate`] the store is saved right away; a
    /// failed save keeps the key dirty for a later retry.
    pub fn set(&mut self, key: impl Into<String>, value: Value) {
        let key = key.into();
        debug!("Setting '{}' updated", key);
        self.settings.insert(key.clone(), value);
        self.dirty.insert(key);

        if self.policy == PersistPolicy::Immediate {
            self.save();
        }
    }

    /// True if some key has not been persisted yet.
    pub fn is_dirty(&self) -> bool {
        !self.dirty.is_empty()
    }

    /// Write the whole mapping to the backing file.
    ///
    /// Does nothing and returns `true` when no key is dirty. On failure the
    /// dirty flags are kept so a later call can retry.
    pub fn save(&mut self) -> bool {
        if !self.is_dirty() {
            return true;
        }

        match self.write_file() {
            Ok(()) => {
                self.dirty.clear();
                info!("Configuration saved to {:?}", self.path);
                true
            }
            Err(e) => {
                error!("Failed to save configuration to {:?}: {}", self.path, e);
                false
            }
        }
    }

    /// Persist pending changes. Same as [`save`](Self::save); named for
    /// callers using [`PersistPolicy::Deferred`].
    pub fn flush(&mut self) -> bool {
        self.save()
    }

    fn write_file(&self) -> io::Result<()> {
        let text = serde_json::to_string(&self.settings)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

        // Flat filesystems such as SPIFFS have no directories to create.
        match fs::write(&self.path, &text) {
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                if let Some(parent) = self.path.parent() {
                    fs::create_dir_all(parent)?;
                }
                fs::write(&self.path, &text)?;
            }
            result => result?,
        }

        // Read back to catch silent flash write failures
        let read_back = fs::read_to_string(&self.path)?;
        if read_back != text {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!(
                    "verification failed: wrote {} bytes, read {} bytes",
                    text.len(),
                    read_back.len()
                ),
            ));
        }
        Ok(())
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn store_in(dir: &tempfile::TempDir, policy: PersistPolicy) -> ConfigStore {
        ConfigStore::new(dir.path().join("config.json"), policy)
    }

    #[test]
    fn test_set_save_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = store_in(&dir, PersistPolicy::Deferred);
        let aps = json!({"Home": {"ssid": "Home", "password": "secret123", "hidden": false}});
        store.set("known_aps", aps.clone());
        store.set("disable_debug", json!(true));
        assert!(store.save());

        let mut reloaded = store_in(&dir, PersistPolicy::Deferred);
        assert!(reloaded.load());
        assert_eq!(reloaded.get("known_aps"), Some(&aps));
        assert_eq!(reloaded.get("disable_debug"), Some(&json!(true)));
        assert!(!reloaded.is_dirty());
    }

    #[test]
    fn test_missing_file_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = store_in(&dir, PersistPolicy::Immediate);
        assert!(!store.load());
        assert_eq!(store.get("anything"), None);
    }

    #[test]
    fn test_corrupt_file_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("config.json"), "{not json").unwrap();
        let mut store = store_in(&dir, PersistPolicy::Immediate);
        assert!(!store.load());
        assert!(!store.is_dirty());
        assert_eq!(store.get("known_aps"), None);
    }

    #[test]
    fn test_non_object_file_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("config.json"), "[1, 2, 3]").unwrap();
        let mut store = store_in(&dir, PersistPolicy::Immediate);
        assert!(!store.load());
    }

    #[test]
    fn test_save_without_changes_does_not_write() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let mut store = store_in(&dir, PersistPolicy::Deferred);

        store.set("a", json!(1));
        assert!(store.save());
        assert!(path.exists());

        // A second save with nothing dirty must not touch the file
        fs::remove_file(&path).unwrap();
        assert!(store.save());
        assert!(!path.exists());
    }

    #[test]
    fn test_immediate_policy_persists_on_set() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = store_in(&dir, PersistPolicy::Immediate);
        store.set("ap_config", json!({"essid": "X"}));
        assert!(!store.is_dirty());

        let mut reloaded = store_in(&dir, PersistPolicy::Immediate);
        assert!(reloaded.load());
        assert_eq!(reloaded.get("ap_config"), Some(&json!({"essid": "X"})));
    }

    #[test]
    fn test_deferred_policy_waits_for_flush() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = store_in(&dir, PersistPolicy::Deferred);
        store.set("a", json!("b"));
        assert!(store.is_dirty());
        assert!(!store.path().exists());

        assert!(store.flush());
        assert!(!store.is_dirty());
        assert!(store.path().exists());
    }

    #[test]
    fn test_failed_save_keeps_dirty_flags() {
        let dir = tempfile::tempdir().unwrap();
        // A directory in place of the file makes the write fail
        let path = dir.path().join("config.json");
        fs::create_dir(&path).unwrap();

        let mut store = ConfigStore::new(&path, PersistPolicy::Deferred);
        store.set("a", json!(1));
        assert!(!store.save());
        assert!(store.is_dirty());

        fs::remove_dir(&path).unwrap();
        assert!(store.save());
        assert!(!store.is_dirty());
    }

    #[test]
    fn test_save_creates_missing_parent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agent").join("config.json");
        let mut store = ConfigStore::new(&path, PersistPolicy::Immediate);
        store.set("a", json!(1));
        assert!(!store.is_dirty());
        assert!(path.exists());
    }

    #[test]
    fn test_persist_policy_from_str() {
        assert_eq!("immediate".parse(), Ok(PersistPolicy::Immediate));
        assert_eq!(" Deferred ".parse(), Ok(PersistPolicy::Deferred));
        assert!("sometimes".parse::<PersistPolicy>().is_err());
    }
}
