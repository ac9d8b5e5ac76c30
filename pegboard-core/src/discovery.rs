//! Plugin discovery: scanning a source for executable plugin files.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::Utc;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::error::RegistryError;
use crate::metadata::{self, PluginMetadata};
use crate::plugin::Plugin;
use crate::schedule::{self, Schedule};

/// A source of plugins.
///
/// The registry rebuilds itself from whatever the source reports on each
/// refresh, so a scan must be a complete snapshot: a plugin missing from
/// the result is treated as removed. A source that cannot produce a
/// snapshot returns [`RegistryError::SourceUnavailable`] and the registry
/// is left untouched.
#[async_trait]
pub trait PluginSource: Send + Sync {
    /// Human-readable description of the source, for logs and errors.
    fn describe(&self) -> String;

    /// Enumerate every plugin the source currently offers.
    async fn scan(&self) -> Result<Vec<DiscoveredPlugin>, RegistryError>;
}

/// One plugin found by a scan, before reconciliation with the registry.
#[derive(Debug, Clone, PartialEq)]
pub struct DiscoveredPlugin {
    pub id: String,
    pub name: String,
    pub path: PathBuf,
    pub schedule: Schedule,
    pub metadata: PluginMetadata,
    pub content_hash: String,
}

impl DiscoveredPlugin {
    /// Promote a discovery into a registry record.
    pub(crate) fn into_plugin(self, enabled: bool) -> Plugin {
        Plugin {
            id: self.id,
            name: self.name,
            enabled,
            path: self.path,
            schedule: self.schedule,
            metadata: self.metadata,
            content_hash: self.content_hash,
            discovered_at: Utc::now(),
            last_run: None,
        }
    }
}

/// Discovers plugins from a directory tree on disk.
///
/// Every executable file under the root is a plugin. Hidden files and
/// directories are skipped, as are files without the executable bit on
/// Unix. Symlinks are followed.
#[derive(Debug, Clone)]
pub struct DirectorySource {
    root: PathBuf,
}

impl DirectorySource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

#[async_trait]
impl PluginSource for DirectorySource {
    fn describe(&self) -> String {
        format!("directory {}", self.root.display())
    }

    async fn scan(&self) -> Result<Vec<DiscoveredPlugin>, RegistryError> {
        let root = self.root.clone();
        // Directory walking and hashing are blocking work.
        tokio::task::spawn_blocking(move || scan_directory(&root))
            .await
            .map_err(|e| RegistryError::SourceUnavailable {
                reason: format!("scan task failed: {e}"),
            })?
    }
}

fn scan_directory(root: &Path) -> Result<Vec<DiscoveredPlugin>, RegistryError> {
    if !root.is_dir() {
        return Err(RegistryError::SourceUnavailable {
            reason: format!("{} is not a directory", root.display()),
        });
    }

    let mut discovered = Vec::new();
    for entry in WalkDir::new(root)
        .follow_links(true)
        .into_iter()
        .filter_entry(|e| e.depth() == 0 || !is_hidden(e.file_name()))
        .filter_map(|e| e.ok())
    {
        if !entry.file_type().is_file() {
            continue;
        }
        if !is_executable(entry.path()) {
            debug!(path = %entry.path().display(), "Skipping non-executable file");
            continue;
        }
        let Ok(rel) = entry.path().strip_prefix(root) else {
            continue;
        };
        if let Some(plugin) = read_discovered(entry.path(), plugin_id(rel)) {
            discovered.push(plugin);
        }
    }

    discovered.sort_by(|a, b| a.id.cmp(&b.id));
    Ok(discovered)
}

fn read_discovered(path: &Path, id: String) -> Option<DiscoveredPlugin> {
    let bytes = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Failed to read plugin file");
            return None;
        }
    };

    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    let content_hash = format!("{:x}", hasher.finalize());

    let file_name = path.file_name()?.to_string_lossy();
    let (stem_name, mut schedule) = schedule::from_filename(&file_name);

    let meta = metadata::parse_metadata(&String::from_utf8_lossy(&bytes));
    if let Some(expression) = meta.schedule.as_deref() {
        match schedule::cron_schedule(expression) {
            Ok(_) => {
                schedule = Schedule::Cron {
                    expression: expression.to_string(),
                };
            }
            Err(e) => {
                warn!(plugin = %id, error = %e, "Ignoring invalid schedule tag");
            }
        }
    }

    let name = meta.title.clone().unwrap_or(stem_name);

    Some(DiscoveredPlugin {
        id,
        name,
        path: path.to_path_buf(),
        schedule,
        metadata: meta,
        content_hash,
    })
}

/// Relative path as a stable id, `/`-separated on every platform.
fn plugin_id(rel: &Path) -> String {
    rel.iter()
        .map(|part| part.to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

fn is_hidden(name: &std::ffi::OsStr) -> bool {
    name.to_string_lossy().starts_with('.')
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path)
        .map(|m| m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(_path: &Path) -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn write_plugin(dir: &Path, rel: &str, content: &str) -> PathBuf {
        let path = dir.join(rel);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(&path, content).unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        }
        path
    }

    #[tokio::test]
    async fn test_scan_missing_directory_is_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let source = DirectorySource::new(dir.path().join("nope"));
        let err = source.scan().await.unwrap_err();
        assert!(matches!(err, RegistryError::SourceUnavailable { .. }));
    }

    #[tokio::test]
    async fn test_scan_finds_executable_files() {
        let dir = tempfile::tempdir().unwrap();
        write_plugin(dir.path(), "stocks.1m.py", "#!/usr/bin/env python3\n");
        write_plugin(dir.path(), "notes.sh", "#!/bin/sh\necho notes\n");

        let source = DirectorySource::new(dir.path());
        let found = source.scan().await.unwrap();
        let ids: Vec<_> = found.iter().map(|p| p.id.as_str()).collect();
        assert_eq!(ids, vec!["notes.sh", "stocks.1m.py"]);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_scan_skips_non_executable_files() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        write_plugin(dir.path(), "runnable.sh", "#!/bin/sh\n");
        let plain = dir.path().join("README.md");
        std::fs::write(&plain, "docs").unwrap();
        std::fs::set_permissions(&plain, std::fs::Permissions::from_mode(0o644)).unwrap();

        let source = DirectorySource::new(dir.path());
        let found = source.scan().await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, "runnable.sh");
    }

    #[tokio::test]
    async fn test_scan_skips_hidden_files_and_directories() {
        let dir = tempfile::tempdir().unwrap();
        write_plugin(dir.path(), "visible.sh", "#!/bin/sh\n");
        write_plugin(dir.path(), ".hidden.sh", "#!/bin/sh\n");
        write_plugin(dir.path(), ".git/hook.sh", "#!/bin/sh\n");

        let source = DirectorySource::new(dir.path());
        let found = source.scan().await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, "visible.sh");
    }

    #[tokio::test]
    async fn test_scan_subdirectory_ids_use_forward_slashes() {
        let dir = tempfile::tempdir().unwrap();
        write_plugin(dir.path(), "net/ping.30s.sh", "#!/bin/sh\n");

        let source = DirectorySource::new(dir.path());
        let found = source.scan().await.unwrap();
        assert_eq!(found[0].id, "net/ping.30s.sh");
        assert_eq!(
            found[0].schedule,
            Schedule::Every {
                interval: Duration::from_secs(30)
            }
        );
    }

    #[tokio::test]
    async fn test_scan_reads_title_and_cron_override() {
        let dir = tempfile::tempdir().unwrap();
        write_plugin(
            dir.path(),
            "report.1h.sh",
            "#!/bin/sh\n# <pegboard.title>Daily report</pegboard.title>\n# <pegboard.schedule>0 0 9 * * * *</pegboard.schedule>\n",
        );

        let source = DirectorySource::new(dir.path());
        let found = source.scan().await.unwrap();
        assert_eq!(found[0].name, "Daily report");
        assert_eq!(
            found[0].schedule,
            Schedule::Cron {
                expression: "0 0 9 * * * *".into()
            }
        );
    }

    #[tokio::test]
    async fn test_scan_invalid_cron_tag_keeps_filename_schedule() {
        let dir = tempfile::tempdir().unwrap();
        write_plugin(
            dir.path(),
            "report.1h.sh",
            "#!/bin/sh\n# <pegboard.schedule>not a cron</pegboard.schedule>\n",
        );

        let source = DirectorySource::new(dir.path());
        let found = source.scan().await.unwrap();
        assert_eq!(
            found[0].schedule,
            Schedule::Every {
                interval: Duration::from_secs(3_600)
            }
        );
    }

    #[tokio::test]
    async fn test_scan_hashes_content() {
        let dir = tempfile::tempdir().unwrap();
        write_plugin(dir.path(), "a.sh", "#!/bin/sh\necho a\n");
        write_plugin(dir.path(), "b.sh", "#!/bin/sh\necho b\n");

        let source = DirectorySource::new(dir.path());
        let found = source.scan().await.unwrap();
        assert_eq!(found[0].content_hash.len(), 64);
        assert_ne!(found[0].content_hash, found[1].content_hash);
    }

    #[test]
    fn test_into_plugin_carries_discovery_fields() {
        let discovered = DiscoveredPlugin {
            id: "stocks.1m.py".into(),
            name: "stocks".into(),
            path: PathBuf::from("/plugins/stocks.1m.py"),
            schedule: Schedule::Manual,
            metadata: PluginMetadata::default(),
            content_hash: "abc".into(),
        };
        let plugin = discovered.clone().into_plugin(true);
        assert_eq!(plugin.id, discovered.id);
        assert_eq!(plugin.path, discovered.path);
        assert!(plugin.enabled);
        assert!(plugin.last_run.is_none());
    }
}
