//! Core plugin types: registry records and run outcomes.

use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::metadata::PluginMetadata;
use crate::schedule::Schedule;

/// A plugin known to the registry: one executable file under a plugin source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plugin {
    /// Stable identifier: the file path relative to the plugin directory,
    /// `/`-separated on every platform.
    pub id: String,
    /// Display name, from the filename stem or a `title` metadata tag.
    pub name: String,
    /// Whether the scheduler runs this plugin. Disabled plugins stay in the
    /// registry and can still be run on demand.
    pub enabled: bool,
    /// Absolute path of the plugin file.
    pub path: PathBuf,
    /// When and how the plugin runs.
    pub schedule: Schedule,
    /// Metadata parsed from the plugin header.
    pub metadata: PluginMetadata,
    /// SHA-256 of the file contents at the last scan.
    pub content_hash: String,
    /// When this id first appeared in the registry.
    pub discovered_at: DateTime<Utc>,
    /// Outcome of the most recent run, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_run: Option<RunRecord>,
}

/// Outcome of a single plugin run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    /// When the run started.
    pub started_at: DateTime<Utc>,
    /// Wall-clock duration of the run in milliseconds.
    pub duration_ms: u64,
    /// Whether the run succeeded.
    pub status: RunStatus,
    /// Process exit code, if the process ran to completion.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    /// Captured stdout, truncated to the configured limit.
    pub stdout: String,
    /// Captured stderr, truncated to the configured limit.
    pub stderr: String,
    /// Why the process could not run or was cut short, when it was.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RunRecord {
    pub fn is_success(&self) -> bool {
        self.status == RunStatus::Success
    }
}

/// Whether a run succeeded or failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Success,
    Failure,
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RunStatus::Success => "success",
            RunStatus::Failure => "failure",
        };
        write!(f, "{s}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn sample_plugin() -> Plugin {
        Plugin {
            id: "stocks.1m.py".into(),
            name: "stocks".into(),
            enabled: true,
            path: PathBuf::from("/plugins/stocks.1m.py"),
            schedule: Schedule::Every {
                interval: Duration::from_secs(60),
            },
            metadata: PluginMetadata::default(),
            content_hash: "deadbeef".into(),
            discovered_at: Utc::now(),
            last_run: None,
        }
    }

    #[test]
    fn test_run_status_display() {
        assert_eq!(RunStatus::Success.to_string(), "success");
        assert_eq!(RunStatus::Failure.to_string(), "failure");
    }

    #[test]
    fn test_plugin_serialization_roundtrip() {
        let plugin = sample_plugin();
        let json = serde_json::to_string(&plugin).unwrap();
        let restored: Plugin = serde_json::from_str(&json).unwrap();
        assert_eq!(restored, plugin);
    }

    #[test]
    fn test_plugin_without_last_run_omits_field() {
        let plugin = sample_plugin();
        let json = serde_json::to_string(&plugin).unwrap();
        assert!(!json.contains("last_run"));
    }

    #[test]
    fn test_run_record_is_success() {
        let record = RunRecord {
            started_at: Utc::now(),
            duration_ms: 12,
            status: RunStatus::Success,
            exit_code: Some(0),
            stdout: "ok".into(),
            stderr: String::new(),
            error: None,
        };
        assert!(record.is_success());
    }
}
