//! Background scheduling of enabled plugins.
//!
//! The scheduler spawns one tokio task per enabled, schedulable plugin:
//! interval plugins tick on their filename interval, cron plugins sleep
//! until the next occurrence, and streamable plugins are kept running and
//! restarted when they exit. Manager events drive the task lifecycle:
//! enabling a plugin starts its task, disabling or removing it cancels
//! the task, and an update restarts it so schedule changes take effect.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{Mutex, broadcast};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::manager::{PluginEvent, PluginManager, RefreshOutcome};
use crate::plugin::Plugin;
use crate::schedule::Schedule;

const MAX_BACKOFF_SECS: u64 = 60;

/// Drives enabled plugins according to their schedules.
pub struct PluginScheduler {
    set: TaskSet,
    refresh_interval: Option<Duration>,
    aux: Mutex<Vec<JoinHandle<()>>>,
}

/// Task bookkeeping, shared between the scheduler and its event loop.
#[derive(Clone)]
struct TaskSet {
    manager: Arc<PluginManager>,
    tasks: Arc<Mutex<HashMap<String, PluginTask>>>,
    shutdown: CancellationToken,
}

struct PluginTask {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl PluginScheduler {
    pub fn new(manager: Arc<PluginManager>) -> Self {
        Self {
            set: TaskSet {
                manager,
                tasks: Arc::new(Mutex::new(HashMap::new())),
                shutdown: CancellationToken::new(),
            },
            refresh_interval: None,
            aux: Mutex::new(Vec::new()),
        }
    }

    /// Also rescan the plugin source on a fixed period.
    pub fn with_refresh_interval(mut self, interval: Option<Duration>) -> Self {
        self.refresh_interval = interval;
        self
    }

    /// Spawn tasks for every enabled plugin and start reacting to
    /// manager events.
    pub async fn start(&self) {
        // Subscribe before the initial listing so a mutation landing in
        // between shows up either in the listing or as a buffered event.
        let events = self.set.manager.subscribe();

        let mut started = 0;
        for plugin in self.set.manager.list().await {
            if plugin.enabled && plugin.schedule.is_scheduled() {
                self.set.start_task(plugin).await;
                started += 1;
            }
        }
        info!(tasks = started, "Plugin scheduler started");

        self.spawn_event_loop(events).await;
        if let Some(period) = self.refresh_interval {
            self.spawn_periodic_refresh(period).await;
        }
    }

    /// Ids of plugins that currently have a scheduled task, in order.
    pub async fn active_tasks(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.set.tasks.lock().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Cancel every task and wait for them to finish.
    pub async fn shutdown(&self) {
        info!("Shutting down plugin scheduler");
        self.set.shutdown.cancel();

        let tasks: Vec<PluginTask> = {
            let mut map = self.set.tasks.lock().await;
            map.drain().map(|(_, task)| task).collect()
        };
        for task in tasks {
            let _ = task.handle.await;
        }
        for handle in self.aux.lock().await.drain(..) {
            let _ = handle.await;
        }
        info!("Plugin scheduler stopped");
    }

    async fn spawn_event_loop(&self, mut events: broadcast::Receiver<PluginEvent>) {
        let set = self.set.clone();
        let shutdown = self.set.shutdown.clone();

        let event_loop = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    event = events.recv() => match event {
                        Ok(event) => set.handle_event(event).await,
                        Err(broadcast::error::RecvError::Lagged(missed)) => {
                            warn!(missed, "Scheduler lagged behind manager events");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
        });
        self.aux.lock().await.push(event_loop);
    }

    async fn spawn_periodic_refresh(&self, period: Duration) {
        let manager = Arc::clone(&self.set.manager);
        let shutdown = self.set.shutdown.clone();

        let refresher = tokio::spawn(async move {
            let start = tokio::time::Instant::now() + period;
            let mut ticker = tokio::time::interval_at(start, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => match manager.refresh().await {
                        Ok(RefreshOutcome::Applied(report)) if !report.is_unchanged() => {
                            debug!(
                                added = report.added.len(),
                                removed = report.removed.len(),
                                updated = report.updated.len(),
                                "Periodic rescan applied"
                            );
                        }
                        Ok(_) => {}
                        Err(e) => warn!(error = %e, "Periodic rescan failed"),
                    },
                }
            }
        });
        self.aux.lock().await.push(refresher);
    }
}

impl TaskSet {
    async fn handle_event(&self, event: PluginEvent) {
        match event {
            PluginEvent::Added { id }
            | PluginEvent::Enabled { id }
            | PluginEvent::Updated { id } => {
                match self.manager.find(&id).await {
                    Ok(plugin) if plugin.enabled && plugin.schedule.is_scheduled() => {
                        self.restart_task(plugin).await;
                    }
                    // Manual, disabled, or already removed again.
                    Ok(_) | Err(_) => self.stop_task(&id).await,
                }
            }
            PluginEvent::Removed { id } | PluginEvent::Disabled { id } => {
                self.stop_task(&id).await;
            }
            PluginEvent::RunFinished { .. } => {}
        }
    }

    async fn start_task(&self, plugin: Plugin) {
        let cancel = self.shutdown.child_token();
        debug!(plugin = %plugin.id, schedule = %plugin.schedule, "Scheduling plugin task");
        let handle = tokio::spawn(drive_plugin(
            Arc::clone(&self.manager),
            plugin.clone(),
            cancel.clone(),
        ));

        let mut tasks = self.tasks.lock().await;
        if let Some(previous) = tasks.insert(plugin.id, PluginTask { cancel, handle }) {
            previous.cancel.cancel();
        }
    }

    async fn restart_task(&self, plugin: Plugin) {
        self.stop_task(&plugin.id).await;
        self.start_task(plugin).await;
    }

    async fn stop_task(&self, id: &str) {
        let task = self.tasks.lock().await.remove(id);
        if let Some(task) = task {
            task.cancel.cancel();
            if let Err(e) = task.handle.await {
                if !e.is_cancelled() {
                    warn!(plugin = %id, error = %e, "Plugin task ended abnormally");
                }
            }
            debug!(plugin = %id, "Stopped plugin task");
        }
    }
}

/// Drive one plugin according to its schedule until cancelled.
async fn drive_plugin(manager: Arc<PluginManager>, plugin: Plugin, cancel: CancellationToken) {
    match plugin.schedule.clone() {
        Schedule::Every { interval } => run_interval(manager, plugin, interval, cancel).await,
        Schedule::Cron { expression } => run_cron(manager, plugin, expression, cancel).await,
        Schedule::Streamable => run_streamable(manager, plugin, cancel).await,
        Schedule::Manual => {}
    }
}

async fn run_interval(
    manager: Arc<PluginManager>,
    plugin: Plugin,
    interval: Duration,
    cancel: CancellationToken,
) {
    // The first tick fires immediately, so a freshly enabled plugin runs
    // right away.
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut failures: u32 = 0;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }
        match run_once(&manager, &plugin.id, &cancel).await {
            Some(true) => failures = 0,
            Some(false) => {
                failures += 1;
                if !pause(&cancel, backoff_delay(failures)).await {
                    break;
                }
            }
            None => break,
        }
    }
}

async fn run_cron(
    manager: Arc<PluginManager>,
    plugin: Plugin,
    expression: String,
    cancel: CancellationToken,
) {
    let schedule = match crate::schedule::cron_schedule(&expression) {
        Ok(schedule) => schedule,
        Err(e) => {
            warn!(plugin = %plugin.id, error = %e, "Cron schedule does not parse, leaving plugin idle");
            return;
        }
    };
    let mut failures: u32 = 0;

    loop {
        let now = Utc::now();
        let Some(next) = schedule.after(&now).next() else {
            debug!(plugin = %plugin.id, "Cron schedule has no future occurrences");
            break;
        };
        let wait = (next - now).to_std().unwrap_or(Duration::ZERO);
        if !pause(&cancel, wait).await {
            break;
        }
        match run_once(&manager, &plugin.id, &cancel).await {
            Some(true) => failures = 0,
            Some(false) => {
                failures += 1;
                if !pause(&cancel, backoff_delay(failures)).await {
                    break;
                }
            }
            None => break,
        }
    }
}

async fn run_streamable(manager: Arc<PluginManager>, plugin: Plugin, cancel: CancellationToken) {
    let mut failures: u32 = 0;

    loop {
        match run_once(&manager, &plugin.id, &cancel).await {
            Some(true) => failures = 0,
            Some(false) => failures += 1,
            None => break,
        }
        let delay = backoff_delay(failures);
        debug!(plugin = %plugin.id, delay_secs = delay.as_secs(), "Restarting streamable plugin");
        if !pause(&cancel, delay).await {
            break;
        }
    }
}

/// Run the plugin once. `None` means the task should stop: the run was
/// cancelled or the plugin is gone from the registry.
async fn run_once(manager: &PluginManager, id: &str, cancel: &CancellationToken) -> Option<bool> {
    tokio::select! {
        _ = cancel.cancelled() => None,
        result = manager.run(id) => match result {
            Ok(record) => Some(record.is_success()),
            Err(e) => {
                debug!(plugin = %id, error = %e, "Scheduled run skipped");
                None
            }
        },
    }
}

/// Sleep unless cancelled first. Returns `false` when cancelled.
async fn pause(cancel: &CancellationToken, delay: Duration) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(delay) => true,
    }
}

/// Exponential backoff: 2^n seconds, capped at 60.
fn backoff_delay(failures: u32) -> Duration {
    let secs = 2_u64.pow(failures.min(6)).min(MAX_BACKOFF_SECS);
    Duration::from_secs(secs)
}
