//! Enabled-state persistence.
//!
//! The registry is authoritative while the process runs; the store only
//! remembers explicit enable/disable decisions across restarts. Overrides
//! for plugins that have vanished are kept, so a plugin that disappears
//! and later returns keeps its setting.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::warn;

/// Persisted enable/disable overrides, keyed by plugin id.
#[derive(Debug)]
pub struct StateStore {
    path: PathBuf,
    overrides: HashMap<String, bool>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StateFile {
    #[serde(default)]
    plugins: HashMap<String, bool>,
}

impl StateStore {
    /// Load the store from `path`.
    ///
    /// A missing file starts empty. An unreadable or corrupt file logs a
    /// warning and also starts empty, so a bad state file never blocks
    /// the registry.
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let overrides = match load_json::<StateFile>(&path) {
            Ok(Some(file)) => file.plugins,
            Ok(None) => HashMap::new(),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Failed to load plugin state, starting empty");
                HashMap::new()
            }
        };
        Self { path, overrides }
    }

    /// The recorded enabled state for a plugin, if one was ever set.
    pub fn enabled_override(&self, id: &str) -> Option<bool> {
        self.overrides.get(id).copied()
    }

    /// Record an explicit enabled state for a plugin.
    pub fn set(&mut self, id: impl Into<String>, enabled: bool) {
        self.overrides.insert(id.into(), enabled);
    }

    /// Persist the overrides to disk.
    pub fn save(&self) -> io::Result<()> {
        let file = StateFile {
            plugins: self.overrides.clone(),
        };
        atomic_write_json(&self.path, &file)
    }

    /// Number of recorded overrides.
    pub fn len(&self) -> usize {
        self.overrides.len()
    }

    pub fn is_empty(&self) -> bool {
        self.overrides.is_empty()
    }
}

/// Write JSON to a `.tmp` sibling, then rename over the target. Partial
/// writes never clobber an existing state file.
fn atomic_write_json<T: Serialize>(path: &Path, data: &T) -> io::Result<()> {
    let json = serde_json::to_string_pretty(data).map_err(io::Error::other)?;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, json.as_bytes())?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

/// `Ok(None)` if the file doesn't exist, `Err` on IO or parse failures.
fn load_json<T: serde::de::DeserializeOwned>(path: &Path) -> io::Result<Option<T>> {
    if !path.exists() {
        return Ok(None);
    }
    let data = std::fs::read_to_string(path)?;
    let value =
        serde_json::from_str(&data).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    Ok(Some(value))
}
