//! CLI subcommand handlers.

use std::path::Path;
use std::sync::Arc;

use pegboard_core::{
    PegboardConfig, Plugin, PluginManager, PluginScheduler, RefreshOutcome, RunRecord,
};

use crate::Commands;
use crate::ConfigAction;

/// Handle a CLI subcommand.
pub async fn handle_command(
    command: Commands,
    config: &PegboardConfig,
    workspace: &Path,
) -> anyhow::Result<()> {
    match command {
        Commands::List { json } => handle_list(config, json).await,
        Commands::Info { id } => handle_info(config, &id).await,
        Commands::Enable { id } => handle_toggle(config, &id, true).await,
        Commands::Disable { id } => handle_toggle(config, &id, false).await,
        Commands::Refresh => handle_refresh(config).await,
        Commands::Run { id, json } => handle_run(config, &id, json).await,
        Commands::Serve => handle_serve(config).await,
        Commands::Config { action } => handle_config(action, config, workspace),
    }
}

/// Build a manager over the configured plugin directory and populate it.
async fn registry(config: &PegboardConfig) -> anyhow::Result<PluginManager> {
    let mgr = PluginManager::from_config(config);
    mgr.refresh()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to scan plugins: {}", e))?;
    Ok(mgr)
}

async fn handle_list(config: &PegboardConfig, json: bool) -> anyhow::Result<()> {
    let mgr = registry(config).await?;
    let plugins = mgr.list().await;

    if json {
        println!("{}", serde_json::to_string_pretty(&plugins)?);
        return Ok(());
    }

    if plugins.is_empty() {
        println!("No plugins found in: {}", config.plugin_dir.display());
        println!("Place executable plugin files in that directory.");
        return Ok(());
    }

    println!("Plugins ({}):", plugins.len());
    for plugin in &plugins {
        let state = if plugin.enabled { "enabled" } else { "disabled" };
        println!(
            "  {} [{}] schedule=\"{}\" name=\"{}\"",
            plugin.id, state, plugin.schedule, plugin.name
        );
    }
    Ok(())
}

async fn handle_info(config: &PegboardConfig, id: &str) -> anyhow::Result<()> {
    let mgr = registry(config).await?;
    match mgr.find(id).await {
        Ok(plugin) => {
            print_plugin(&plugin);
            Ok(())
        }
        Err(_) => anyhow::bail!("Plugin '{}' not found", id),
    }
}

async fn handle_toggle(config: &PegboardConfig, id: &str, enable: bool) -> anyhow::Result<()> {
    let mgr = registry(config).await?;
    let result = if enable {
        mgr.enable(id).await
    } else {
        mgr.disable(id).await
    };
    let verb = if enable { "enabled" } else { "disabled" };

    match result {
        Ok(true) => {
            println!("Plugin '{}' {}.", id, verb);
            Ok(())
        }
        Ok(false) => {
            println!("Plugin '{}' is already {}.", id, verb);
            Ok(())
        }
        Err(_) => anyhow::bail!("Plugin '{}' not found", id),
    }
}

async fn handle_refresh(config: &PegboardConfig) -> anyhow::Result<()> {
    let mgr = PluginManager::from_config(config);
    match mgr.refresh().await {
        Ok(RefreshOutcome::Applied(report)) => {
            println!("Scanned: {}", config.plugin_dir.display());
            println!("  Added: {}", report.added.len());
            println!("  Removed: {}", report.removed.len());
            println!("  Updated: {}", report.updated.len());
            println!("  Total: {}", mgr.len().await);
            Ok(())
        }
        // A lone refresh is never superseded.
        Ok(RefreshOutcome::Superseded) => Ok(()),
        Err(e) => anyhow::bail!("Failed to scan plugins: {}", e),
    }
}

async fn handle_run(config: &PegboardConfig, id: &str, json: bool) -> anyhow::Result<()> {
    let mgr = registry(config).await?;
    let record = match mgr.run(id).await {
        Ok(record) => record,
        Err(_) => anyhow::bail!("Plugin '{}' not found", id),
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&record)?);
        return Ok(());
    }

    if !record.stdout.is_empty() {
        print!("{}", record.stdout);
    }
    if !record.stderr.is_empty() {
        eprint!("{}", record.stderr);
    }
    if record.is_success() {
        Ok(())
    } else if let Some(error) = &record.error {
        anyhow::bail!("Plugin run failed: {}", error)
    } else {
        anyhow::bail!("Plugin exited with code {}", exit_code_label(&record))
    }
}

async fn handle_serve(config: &PegboardConfig) -> anyhow::Result<()> {
    let mgr = Arc::new(registry(config).await?);
    let enabled = mgr.list().await.iter().filter(|p| p.enabled).count();
    println!(
        "Serving {} plugins ({} enabled) from {}. Press Ctrl-C to stop.",
        mgr.len().await,
        enabled,
        config.plugin_dir.display()
    );

    let scheduler =
        PluginScheduler::new(Arc::clone(&mgr)).with_refresh_interval(config.refresh_interval());
    scheduler.start().await;

    tokio::signal::ctrl_c().await?;
    println!("\nShutting down...");
    scheduler.shutdown().await;
    Ok(())
}

fn handle_config(
    action: ConfigAction,
    config: &PegboardConfig,
    workspace: &Path,
) -> anyhow::Result<()> {
    match action {
        ConfigAction::Init => {
            let config_dir = workspace.join(".pegboard");
            std::fs::create_dir_all(&config_dir)?;

            let config_path = config_dir.join("config.toml");
            if config_path.exists() {
                println!(
                    "Configuration file already exists at: {}",
                    config_path.display()
                );
                return Ok(());
            }

            let default_config = PegboardConfig::default();
            let toml_str = toml::to_string_pretty(&default_config)?;
            std::fs::write(&config_path, &toml_str)?;
            println!(
                "Created default configuration at: {}",
                config_path.display()
            );
            Ok(())
        }
        ConfigAction::Show => {
            let toml_str = toml::to_string_pretty(config)?;
            println!("{}", toml_str);
            Ok(())
        }
    }
}

fn print_plugin(plugin: &Plugin) {
    let state = if plugin.enabled { "enabled" } else { "disabled" };
    println!("Plugin: {}", plugin.id);
    println!("  Name: {}", plugin.name);
    println!("  Path: {}", plugin.path.display());
    println!("  Status: {}", state);
    println!("  Schedule: {}", plugin.schedule);
    if let Some(version) = &plugin.metadata.version {
        println!("  Version: {}", version);
    }
    if let Some(author) = &plugin.metadata.author {
        println!("  Author: {}", author);
    }
    if let Some(desc) = &plugin.metadata.desc {
        println!("  About: {}", desc);
    }
    if !plugin.metadata.environment.is_empty() {
        let pairs: Vec<String> = plugin
            .metadata
            .environment
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();
        println!("  Environment: {}", pairs.join(", "));
    }
    match &plugin.last_run {
        Some(run) => {
            let status = if run.is_success() { "success" } else { "failure" };
            let when = run.started_at.format("%Y-%m-%d %H:%M:%S UTC");
            println!("  Last run: {} at {} ({} ms)", status, when, run.duration_ms);
        }
        None => println!("  Last run: never"),
    }
}

fn exit_code_label(record: &RunRecord) -> String {
    record
        .exit_code
        .map(|code| code.to_string())
        .unwrap_or_else(|| "unknown".into())
}
