//! The plugin manager: registry, lifecycle, and execution entry points.
//!
//! `PluginManager` owns the registry and serializes every mutation to it.
//! Callers hold it behind an `Arc` and share that handle; there is no
//! global instance. Reads return clones of registry records, so a caller
//! never observes a half-applied refresh.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use tokio::sync::{RwLock, broadcast};
use tracing::{debug, info, warn};

use crate::config::PegboardConfig;
use crate::discovery::{DirectorySource, DiscoveredPlugin, PluginSource};
use crate::error::RegistryError;
use crate::plugin::{Plugin, RunRecord};
use crate::runner::PluginRunner;
use crate::store::StateStore;

/// Events emitted by the manager to observers such as the scheduler.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum PluginEvent {
    /// A plugin appeared in a refresh.
    Added { id: String },
    /// A plugin disappeared in a refresh.
    Removed { id: String },
    /// A plugin's file, schedule, or metadata changed in a refresh.
    Updated { id: String },
    /// A plugin was enabled.
    Enabled { id: String },
    /// A plugin was disabled.
    Disabled { id: String },
    /// A run finished and its record was stored.
    RunFinished { id: String, success: bool },
}

/// What a refresh changed, by plugin id.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefreshReport {
    pub added: Vec<String>,
    pub removed: Vec<String>,
    pub updated: Vec<String>,
}

impl RefreshReport {
    pub fn is_unchanged(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.updated.is_empty()
    }
}

/// Result of a refresh request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefreshOutcome {
    /// The scan was applied to the registry.
    Applied(RefreshReport),
    /// A newer refresh finished first; this scan was discarded.
    Superseded,
}

/// Owns the plugin registry and coordinates discovery, state, and runs.
pub struct PluginManager {
    source: Box<dyn PluginSource>,
    runner: PluginRunner,
    default_enabled: bool,
    inner: RwLock<Inner>,
    events: broadcast::Sender<PluginEvent>,
    refresh_claims: AtomicU64,
}

struct Inner {
    plugins: BTreeMap<String, Plugin>,
    store: StateStore,
    last_applied_refresh: u64,
}

impl PluginManager {
    /// Create a manager over an injected plugin source.
    ///
    /// The registry starts empty; call [`refresh`](Self::refresh) to
    /// populate it.
    pub fn new(config: &PegboardConfig, source: Box<dyn PluginSource>) -> Self {
        let store = StateStore::load(config.resolved_state_path());
        let runner = PluginRunner::new(
            config.plugin_dir.clone(),
            config.run_timeout(),
            config.max_output_bytes,
        );
        let (events, _) = broadcast::channel(256);

        Self {
            source,
            runner,
            default_enabled: config.enable_new_plugins,
            inner: RwLock::new(Inner {
                plugins: BTreeMap::new(),
                store,
                last_applied_refresh: 0,
            }),
            events,
            refresh_claims: AtomicU64::new(0),
        }
    }

    /// Create a manager scanning the configured plugin directory.
    pub fn from_config(config: &PegboardConfig) -> Self {
        let source = Box::new(DirectorySource::new(config.plugin_dir.clone()));
        Self::new(config, source)
    }

    /// All plugins, in stable id order.
    pub async fn list(&self) -> Vec<Plugin> {
        self.inner.read().await.plugins.values().cloned().collect()
    }

    /// Look up one plugin by id.
    pub async fn find(&self, id: &str) -> Result<Plugin, RegistryError> {
        self.inner
            .read()
            .await
            .plugins
            .get(id)
            .cloned()
            .ok_or_else(|| RegistryError::NotFound { id: id.to_string() })
    }

    /// Number of plugins in the registry.
    pub async fn len(&self) -> usize {
        self.inner.read().await.plugins.len()
    }

    /// Whether the registry is empty.
    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.plugins.is_empty()
    }

    /// Enable a plugin.
    ///
    /// Returns whether the call changed anything: enabling an already
    /// enabled plugin is a quiet success, an unknown id is an error.
    pub async fn enable(&self, id: &str) -> Result<bool, RegistryError> {
        self.set_enabled(id, true).await
    }

    /// Disable a plugin. Same contract as [`enable`](Self::enable).
    pub async fn disable(&self, id: &str) -> Result<bool, RegistryError> {
        self.set_enabled(id, false).await
    }

    async fn set_enabled(&self, id: &str, enabled: bool) -> Result<bool, RegistryError> {
        let changed = {
            let mut inner = self.inner.write().await;
            let plugin = inner
                .plugins
                .get_mut(id)
                .ok_or_else(|| RegistryError::NotFound { id: id.to_string() })?;
            let changed = plugin.enabled != enabled;
            plugin.enabled = enabled;

            // Record the override even when nothing changed, so an explicit
            // decision sticks across restarts regardless of config defaults.
            inner.store.set(id, enabled);
            if let Err(e) = inner.store.save() {
                warn!(error = %e, "Failed to persist plugin state");
            }
            changed
        };

        if changed {
            info!(plugin = %id, enabled, "Plugin toggled");
            self.emit(if enabled {
                PluginEvent::Enabled { id: id.to_string() }
            } else {
                PluginEvent::Disabled { id: id.to_string() }
            });
        }
        Ok(changed)
    }

    /// Rescan the source and reconcile the registry with what it reports.
    ///
    /// Scanning happens without holding the registry lock. Plugins that
    /// survive keep their in-memory enabled state and last run; new ones
    /// get their persisted override or the configured default; missing
    /// ones are dropped. When refreshes race, the scan that finishes last
    /// wins and earlier results are discarded as
    /// [`RefreshOutcome::Superseded`]. A failed scan leaves the registry
    /// untouched.
    pub async fn refresh(&self) -> Result<RefreshOutcome, RegistryError> {
        let claim = self.refresh_claims.fetch_add(1, Ordering::SeqCst) + 1;
        debug!(source = %self.source.describe(), claim, "Scanning for plugins");

        let discovered = self.source.scan().await?;

        let (report, events) = {
            let mut inner = self.inner.write().await;
            if inner.last_applied_refresh > claim {
                debug!(claim, "Refresh superseded by a newer scan");
                return Ok(RefreshOutcome::Superseded);
            }
            inner.last_applied_refresh = claim;
            self.reconcile(&mut inner, discovered)
        };

        if !report.is_unchanged() {
            info!(
                added = report.added.len(),
                removed = report.removed.len(),
                updated = report.updated.len(),
                "Plugin registry refreshed"
            );
        }
        for event in events {
            self.emit(event);
        }
        Ok(RefreshOutcome::Applied(report))
    }

    /// Run a plugin now and store the outcome on its registry entry.
    ///
    /// On-demand runs work on disabled plugins too; only the scheduler
    /// restricts itself to enabled ones. The registry lock is not held
    /// while the plugin process runs.
    pub async fn run(&self, id: &str) -> Result<RunRecord, RegistryError> {
        let plugin = self.find(id).await?;
        let record = self.runner.run(&plugin).await;

        {
            let mut inner = self.inner.write().await;
            // The plugin may have been removed by a refresh while it ran.
            if let Some(entry) = inner.plugins.get_mut(id) {
                entry.last_run = Some(record.clone());
            }
        }

        self.emit(PluginEvent::RunFinished {
            id: id.to_string(),
            success: record.is_success(),
        });
        Ok(record)
    }

    /// Subscribe to manager events.
    pub fn subscribe(&self) -> broadcast::Receiver<PluginEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: PluginEvent) {
        // Send only fails when there are no receivers, which is normal
        // for one-shot invocations.
        let _ = self.events.send(event);
    }

    fn reconcile(
        &self,
        inner: &mut Inner,
        discovered: Vec<DiscoveredPlugin>,
    ) -> (RefreshReport, Vec<PluginEvent>) {
        let mut next = BTreeMap::new();
        let mut report = RefreshReport::default();

        for entry in discovered {
            if next.contains_key(&entry.id) {
                warn!(plugin = %entry.id, "Duplicate id from source, keeping the first");
                continue;
            }
            match inner.plugins.remove(&entry.id) {
                Some(mut existing) => {
                    let changed = existing.name != entry.name
                        || existing.path != entry.path
                        || existing.schedule != entry.schedule
                        || existing.metadata != entry.metadata
                        || existing.content_hash != entry.content_hash;
                    existing.name = entry.name;
                    existing.path = entry.path;
                    existing.schedule = entry.schedule;
                    existing.metadata = entry.metadata;
                    existing.content_hash = entry.content_hash;
                    if changed {
                        report.updated.push(existing.id.clone());
                    }
                    next.insert(existing.id.clone(), existing);
                }
                None => {
                    let enabled = inner
                        .store
                        .enabled_override(&entry.id)
                        .unwrap_or(self.default_enabled);
                    report.added.push(entry.id.clone());
                    next.insert(entry.id.clone(), entry.into_plugin(enabled));
                }
            }
        }

        report.removed = inner.plugins.keys().cloned().collect();
        report.added.sort();
        report.updated.sort();
        inner.plugins = next;

        let mut events = Vec::new();
        for id in &report.added {
            events.push(PluginEvent::Added { id: id.clone() });
        }
        for id in &report.updated {
            events.push(PluginEvent::Updated { id: id.clone() });
        }
        for id in &report.removed {
            events.push(PluginEvent::Removed { id: id.clone() });
        }
        (report, events)
    }
}
