// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 VPN Engine Contributors

//! Durable key/value settings
//!
//! A flat string map persisted as TOML. The engine stores the last protocol
//! that produced a healthy tunnel here so the next automatic session tries it
//! first.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Key holding the long protocol name of the last successful connection
pub const SUCCESS_CONNECTION_PROTOCOL: &str = "successConnectionProtocol";

#[derive(Debug, Clone)]
pub struct SettingsStore {
    path: Option<PathBuf>,
    values: Arc<Mutex<BTreeMap<String, String>>>,
}

impl SettingsStore {
    /// Open (or lazily create) a file-backed store
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let values = if path.exists() {
            let content = std::fs::read_to_string(&path)?;
            toml::from_str::<BTreeMap<String, String>>(&content)?
        } else {
            debug!("Settings file {} does not exist yet", path.display());
            BTreeMap::new()
        };

        Ok(Self {
            path: Some(path),
            values: Arc::new(Mutex::new(values)),
        })
    }

    /// Store that never touches the disk
    pub fn in_memory() -> Self {
        Self {
            path: None,
            values: Arc::new(Mutex::new(BTreeMap::new())),
        }
    }

    /// Default location: `<config_dir>/vpn-engine/settings.toml`
    pub fn default_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| Error::Config("Could not determine config directory".to_string()))?;
        Ok(config_dir.join("vpn-engine").join("settings.toml"))
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.lock().ok()?.get(key).cloned()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    pub fn set(&self, key: &str, value: impl Into<String>) -> Result<()> {
        let snapshot = {
            let mut values = self.lock()?;
            values.insert(key.to_string(), value.into());
            values.clone()
        };
        self.persist(&snapshot)
    }

    pub fn remove(&self, key: &str) -> Result<()> {
        let snapshot = {
            let mut values = self.lock()?;
            if values.remove(key).is_none() {
                return Ok(());
            }
            values.clone()
        };
        self.persist(&snapshot)
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, BTreeMap<String, String>>> {
        self.values
            .lock()
            .map_err(|_| Error::Settings("settings lock poisoned".to_string()))
    }

    fn persist(&self, values: &BTreeMap<String, String>) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(values)?;
        let tmp = path.with_extension("toml.tmp");
        std::fs::write(&tmp, content)?;
        if let Err(e) = std::fs::rename(&tmp, path) {
            warn!("Failed to replace settings file {}: {}", path.display(), e);
            let _ = std::fs::remove_file(&tmp);
            return Err(e.into());
        }
        Ok(())
    }
}
