//! Server store
//!
//! Saved server definitions, keyed by name. `save` and `remove` only touch the
//! in-memory copy; nothing is durable until `synchronize`.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::controller::convert;
use crate::server::Server;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Cannot read {}: {reason}", .path.display())]
    Read { path: PathBuf, reason: String },

    #[error("Cannot write {}: {reason}", .path.display())]
    Write { path: PathBuf, reason: String },

    #[error("{0} cannot be saved")]
    NotSaveable(String),
}

pub trait ServerStore: Send + Sync {
    /// Every well-formed saved server. Malformed records are skipped.
    fn load(&self) -> Result<Vec<Server>, StoreError>;

    /// Insert or replace the record named `server.name()`
    fn save(&self, server: &Server) -> Result<(), StoreError>;

    fn remove(&self, name: &str) -> Result<(), StoreError>;

    fn contains(&self, name: &str) -> bool;

    /// Flush pending changes
    fn synchronize(&self) -> Result<(), StoreError>;
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// In-memory store, for tests and throwaway sessions
#[derive(Default)]
pub struct MemoryServerStore {
    records: Mutex<BTreeMap<String, plist::Dictionary>>,
}

impl MemoryServerStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn decode_all(records: &BTreeMap<String, plist::Dictionary>) -> Vec<Server> {
    records
        .iter()
        .filter_map(|(key, record)| {
            let server = convert::server_from_properties(record);
            if server.is_none() {
                log::warn!("Skipping incomplete server record {:?}", key);
            }
            server
        })
        .collect()
}

impl ServerStore for MemoryServerStore {
    fn load(&self) -> Result<Vec<Server>, StoreError> {
        Ok(decode_all(&lock(&self.records)))
    }

    fn save(&self, server: &Server) -> Result<(), StoreError> {
        if !server.is_saveable() {
            return Err(StoreError::NotSaveable(server.name().to_string()));
        }
        lock(&self.records).insert(server.name().to_string(), convert::properties_from_server(server));
        Ok(())
    }

    fn remove(&self, name: &str) -> Result<(), StoreError> {
        lock(&self.records).remove(name);
        Ok(())
    }

    fn contains(&self, name: &str) -> bool {
        lock(&self.records).contains_key(name)
    }

    fn synchronize(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

#[derive(Default)]
struct PlistState {
    records: BTreeMap<String, plist::Dictionary>,
    loaded: bool,
    dirty: bool,
}

/// Store backed by one plist file holding a dictionary of records
pub struct PlistServerStore {
    path: PathBuf,
    state: Mutex<PlistState>,
}

impl PlistServerStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            state: Mutex::new(PlistState::default()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read(&self) -> Result<BTreeMap<String, plist::Dictionary>, StoreError> {
        if !self.path.exists() {
            return Ok(BTreeMap::new());
        }
        let value = plist::Value::from_file(&self.path).map_err(|e| StoreError::Read {
            path: self.path.clone(),
            reason: e.to_string(),
        })?;
        let Some(dict) = value.into_dictionary() else {
            return Err(StoreError::Read {
                path: self.path.clone(),
                reason: "top level is not a dictionary".into(),
            });
        };

        let mut records = BTreeMap::new();
        for (key, value) in dict {
            match value.into_dictionary() {
                Some(record) => {
                    records.insert(key, record);
                }
                None => log::warn!("Skipping non-dictionary record {:?} in {}", key, self.path.display()),
            }
        }
        Ok(records)
    }

    /// Load from disk once; later calls work on the cached copy
    fn state(&self) -> Result<MutexGuard<'_, PlistState>, StoreError> {
        let mut state = lock(&self.state);
        if !state.loaded {
            state.records = self.read()?;
            state.loaded = true;
        }
        Ok(state)
    }

    fn write(&self, records: &BTreeMap<String, plist::Dictionary>) -> Result<(), StoreError> {
        let err = |reason: String| StoreError::Write {
            path: self.path.clone(),
            reason,
        };
        let dir = self
            .path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        std::fs::create_dir_all(dir).map_err(|e| err(e.to_string()))?;

        let dict: plist::Dictionary = records
            .iter()
            .map(|(k, v)| (k.clone(), plist::Value::Dictionary(v.clone())))
            .collect();
        let temp = tempfile::NamedTempFile::new_in(dir).map_err(|e| err(e.to_string()))?;
        plist::Value::Dictionary(dict)
            .to_writer_xml(temp.as_file())
            .map_err(|e| err(e.to_string()))?;
        temp.persist(&self.path).map_err(|e| err(e.error.to_string()))?;
        Ok(())
    }
}

impl ServerStore for PlistServerStore {
    fn load(&self) -> Result<Vec<Server>, StoreError> {
        // Re-read so edits made by another instance are picked up
        let mut state = lock(&self.state);
        if !state.dirty {
            state.records = self.read()?;
            state.loaded = true;
        }
        Ok(decode_all(&state.records))
    }

    fn save(&self, server: &Server) -> Result<(), StoreError> {
        if !server.is_saveable() {
            return Err(StoreError::NotSaveable(server.name().to_string()));
        }
        let mut state = self.state()?;
        state
            .records
            .insert(server.name().to_string(), convert::properties_from_server(server));
        state.dirty = true;
        Ok(())
    }

    fn remove(&self, name: &str) -> Result<(), StoreError> {
        let mut state = self.state()?;
        if state.records.remove(name).is_some() {
            state.dirty = true;
        }
        Ok(())
    }

    fn contains(&self, name: &str) -> bool {
        match self.state() {
            Ok(state) => state.records.contains_key(name),
            Err(e) => {
                log::warn!("{}", e);
                false
            }
        }
    }

    fn synchronize(&self) -> Result<(), StoreError> {
        let mut state = self.state()?;
        if !state.dirty {
            return Ok(());
        }
        self.write(&state.records)?;
        state.dirty = false;
        log::debug!("Saved {} servers to {}", state.records.len(), self.path.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::{ServerSettings, Startup};

    fn server(name: &str) -> Server {
        Server::with_settings(
            name,
            "org.postgresql.preferences",
            ServerSettings::new("postgres", "/usr/local/bin", "/data", "/tmp/pg.log", "5432", Startup::AtLogin),
        )
    }

    #[test]
    fn test_memory_store() {
        let store = MemoryServerStore::new();
        store.save(&server("pg1")).unwrap();
        store.save(&server("pg2")).unwrap();
        store.remove("pg1").unwrap();
        let servers = store.load().unwrap();
        assert_eq!(servers.len(), 1);
        assert_eq!(servers[0].name(), "pg2");
        assert!(store.contains("pg2"));
    }

    #[test]
    fn test_plist_store_requires_synchronize() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("prefs/store.plist");
        let store = PlistServerStore::new(&path);
        store.save(&server("pg1")).unwrap();
        assert!(!path.exists());
        store.synchronize().unwrap();

        let reopened = PlistServerStore::new(&path);
        let servers = reopened.load().unwrap();
        assert_eq!(servers.len(), 1);
        assert_eq!(servers[0].settings(), server("pg1").settings());
        assert_eq!(servers[0].settings().startup, Startup::AtLogin);
    }

    #[test]
    fn test_external_server_not_saveable() {
        let store = MemoryServerStore::new();
        let mut s = server("pg1");
        s.set_external(true);
        assert!(matches!(store.save(&s), Err(StoreError::NotSaveable(_))));
    }

    #[test]
    fn test_incomplete_records_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.plist");
        std::fs::write(
            &path,
            r#"<?xml version="1.0" encoding="UTF-8"?>
<plist version="1.0">
<dict>
    <key>broken</key>
    <dict><key>name</key><string>broken</string></dict>
    <key>pg1</key>
    <dict>
        <key>name</key><string>pg1</string>
        <key>domain</key><string>org.postgresql.preferences</string>
        <key>username</key><string>postgres</string>
        <key>binDirectory</key><string>/usr/local/bin</string>
        <key>dataDirectory</key><string>/data</string>
        <key>logFile</key><string>/tmp/pg.log</string>
        <key>port</key><string>5432</string>
        <key>startup</key><integer>1</integer>
    </dict>
</dict>
</plist>
"#,
        )
        .unwrap();
        let servers = PlistServerStore::new(&path).load().unwrap();
        assert_eq!(servers.len(), 1);
        assert_eq!(servers[0].settings().startup, Startup::AtBoot);
    }
}
