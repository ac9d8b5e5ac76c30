//! Configuration for Pegboard.
//!
//! Uses `figment` for layered configuration: defaults -> config file ->
//! environment -> explicit overrides. Configuration is loaded from
//! `~/.config/pegboard/config.toml` and/or `.pegboard/config.toml` in the
//! workspace directory; environment variables use the `PEGBOARD_` prefix
//! (e.g. `PEGBOARD_RUN_TIMEOUT_SECS=120`).

use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Top-level configuration for the plugin manager and daemon.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PegboardConfig {
    /// Directory scanned for plugin files.
    #[serde(default = "default_plugin_dir")]
    pub plugin_dir: PathBuf,
    /// Where enabled/disabled overrides are persisted. Defaults to the
    /// platform data directory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_path: Option<PathBuf>,
    /// Whether plugins discovered for the first time start enabled.
    #[serde(default)]
    pub enable_new_plugins: bool,
    /// Per-run timeout for non-streamable plugins, in seconds.
    #[serde(default = "default_run_timeout_secs")]
    pub run_timeout_secs: u64,
    /// Cap on captured stdout/stderr per run, in bytes.
    #[serde(default = "default_max_output_bytes")]
    pub max_output_bytes: usize,
    /// How often the daemon rescans the plugin directory, in seconds.
    /// `0` disables periodic rescans.
    #[serde(
        default = "default_refresh_interval_secs",
        skip_serializing_if = "Option::is_none"
    )]
    pub refresh_interval_secs: Option<u64>,
    /// Directory for JSON log files. Defaults to the platform data
    /// directory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_dir: Option<PathBuf>,
}

impl Default for PegboardConfig {
    fn default() -> Self {
        Self {
            plugin_dir: default_plugin_dir(),
            state_path: None,
            enable_new_plugins: false,
            run_timeout_secs: default_run_timeout_secs(),
            max_output_bytes: default_max_output_bytes(),
            refresh_interval_secs: default_refresh_interval_secs(),
            log_dir: None,
        }
    }
}

impl PegboardConfig {
    /// Per-run timeout as a `Duration`.
    pub fn run_timeout(&self) -> Duration {
        Duration::from_secs(self.run_timeout_secs)
    }

    /// Periodic rescan interval, if enabled.
    pub fn refresh_interval(&self) -> Option<Duration> {
        match self.refresh_interval_secs {
            Some(0) | None => None,
            Some(secs) => Some(Duration::from_secs(secs)),
        }
    }

    /// The state file path, explicit or platform default.
    pub fn resolved_state_path(&self) -> PathBuf {
        self.state_path.clone().unwrap_or_else(default_state_path)
    }

    /// The log directory, explicit or platform default.
    pub fn resolved_log_dir(&self) -> PathBuf {
        self.log_dir.clone().unwrap_or_else(default_log_dir)
    }

    /// Reject values the manager cannot work with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.run_timeout_secs == 0 {
            return Err(ConfigError::Invalid {
                message: "run_timeout_secs must be greater than zero".into(),
            });
        }
        if self.max_output_bytes == 0 {
            return Err(ConfigError::Invalid {
                message: "max_output_bytes must be greater than zero".into(),
            });
        }
        Ok(())
    }
}

/// Load configuration with layered precedence (highest wins):
///
/// 1. Explicit overrides (passed as argument)
/// 2. Environment variables (prefixed with `PEGBOARD_`)
/// 3. Workspace-local config (`.pegboard/config.toml`)
/// 4. User config (`~/.config/pegboard/config.toml`)
/// 5. Built-in defaults
pub fn load_config(
    workspace: Option<&Path>,
    overrides: Option<&PegboardConfig>,
) -> Result<PegboardConfig, ConfigError> {
    let mut figment = Figment::from(Serialized::defaults(PegboardConfig::default()));

    // User-level config
    if let Some(dirs) = project_dirs() {
        let user_config = dirs.config_dir().join("config.toml");
        if user_config.exists() {
            figment = figment.merge(Toml::file(&user_config));
        }
    }

    // Workspace-level config
    if let Some(ws) = workspace {
        let ws_config = ws.join(".pegboard").join("config.toml");
        if ws_config.exists() {
            figment = figment.merge(Toml::file(&ws_config));
        }
    }

    // Environment variables (PEGBOARD_PLUGIN_DIR, PEGBOARD_RUN_TIMEOUT_SECS, ...)
    figment = figment.merge(Env::prefixed("PEGBOARD_").split("__"));

    // Explicit overrides
    if let Some(overrides) = overrides {
        figment = figment.merge(Serialized::defaults(overrides));
    }

    let config: PegboardConfig = figment.extract().map_err(|e| ConfigError::ParseError {
        message: e.to_string(),
    })?;
    config.validate()?;
    Ok(config)
}

fn project_dirs() -> Option<directories::ProjectDirs> {
    directories::ProjectDirs::from("dev", "pegboard", "pegboard")
}

fn default_plugin_dir() -> PathBuf {
    project_dirs()
        .map(|dirs| dirs.config_dir().join("plugins"))
        .unwrap_or_else(|| PathBuf::from(".pegboard/plugins"))
}

fn default_state_path() -> PathBuf {
    project_dirs()
        .map(|dirs| dirs.data_dir().join("state.json"))
        .unwrap_or_else(|| PathBuf::from(".pegboard/state.json"))
}

fn default_log_dir() -> PathBuf {
    project_dirs()
        .map(|dirs| dirs.data_dir().join("logs"))
        .unwrap_or_else(|| PathBuf::from(".pegboard/logs"))
}

fn default_run_timeout_secs() -> u64 {
    60
}

fn default_max_output_bytes() -> usize {
    64 * 1024
}

fn default_refresh_interval_secs() -> Option<u64> {
    Some(300)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = PegboardConfig::default();
        assert!(!config.enable_new_plugins);
        assert_eq!(config.run_timeout_secs, 60);
        assert_eq!(config.max_output_bytes, 64 * 1024);
        assert_eq!(config.refresh_interval_secs, Some(300));
        assert!(config.state_path.is_none());
    }

    #[test]
    fn test_refresh_interval_zero_disables() {
        let mut config = PegboardConfig::default();
        assert_eq!(config.refresh_interval(), Some(Duration::from_secs(300)));

        config.refresh_interval_secs = Some(0);
        assert_eq!(config.refresh_interval(), None);

        config.refresh_interval_secs = None;
        assert_eq!(config.refresh_interval(), None);
    }

    #[test]
    fn test_run_timeout_helper() {
        let config = PegboardConfig {
            run_timeout_secs: 90,
            ..Default::default()
        };
        assert_eq!(config.run_timeout(), Duration::from_secs(90));
    }

    #[test]
    fn test_validate_rejects_zero_timeout() {
        let config = PegboardConfig {
            run_timeout_secs: 0,
            ..Default::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("run_timeout_secs"));
    }

    #[test]
    fn test_validate_rejects_zero_output_cap() {
        let config = PegboardConfig {
            max_output_bytes: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_resolved_state_path_prefers_explicit() {
        let config = PegboardConfig {
            state_path: Some(PathBuf::from("/tmp/custom-state.json")),
            ..Default::default()
        };
        assert_eq!(
            config.resolved_state_path(),
            PathBuf::from("/tmp/custom-state.json")
        );
    }

    #[test]
    fn test_load_config_reads_workspace_file() {
        let ws = tempfile::tempdir().unwrap();
        let config_dir = ws.path().join(".pegboard");
        std::fs::create_dir_all(&config_dir).unwrap();
        std::fs::write(
            config_dir.join("config.toml"),
            "plugin_dir = \"/srv/plugins\"\nrun_timeout_secs = 15\nenable_new_plugins = true\n",
        )
        .unwrap();

        let config = load_config(Some(ws.path()), None).unwrap();
        assert_eq!(config.plugin_dir, PathBuf::from("/srv/plugins"));
        assert_eq!(config.run_timeout_secs, 15);
        assert!(config.enable_new_plugins);
    }

    #[test]
    fn test_load_config_explicit_overrides_win() {
        let ws = tempfile::tempdir().unwrap();
        let config_dir = ws.path().join(".pegboard");
        std::fs::create_dir_all(&config_dir).unwrap();
        std::fs::write(config_dir.join("config.toml"), "run_timeout_secs = 15\n").unwrap();

        let overrides = PegboardConfig {
            run_timeout_secs: 240,
            ..Default::default()
        };
        let config = load_config(Some(ws.path()), Some(&overrides)).unwrap();
        assert_eq!(config.run_timeout_secs, 240);
    }

    #[test]
    fn test_load_config_rejects_invalid_values() {
        let ws = tempfile::tempdir().unwrap();
        let config_dir = ws.path().join(".pegboard");
        std::fs::create_dir_all(&config_dir).unwrap();
        std::fs::write(config_dir.join("config.toml"), "run_timeout_secs = 0\n").unwrap();

        let err = load_config(Some(ws.path()), None).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { .. }));
    }
}
