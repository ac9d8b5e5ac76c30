//! Pegboard CLI — manage, run, and schedule executable script plugins.

mod commands;

use clap::Parser;
use std::path::PathBuf;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Pegboard: plugin discovery, scheduling, and execution
#[derive(Parser, Debug)]
#[command(name = "pegboard", version, about, long_about = None)]
struct Cli {
    /// Workspace directory searched for `.pegboard/config.toml`
    #[arg(short, long, default_value = ".")]
    workspace: PathBuf,

    /// Plugin directory, overriding the configured one
    #[arg(short, long)]
    plugin_dir: Option<PathBuf>,

    /// Increase verbosity (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Suppress non-essential output
    #[arg(short, long)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// List discovered plugins
    List {
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show details of one plugin
    Info {
        /// Plugin id (path relative to the plugin directory)
        id: String,
    },
    /// Enable a plugin
    Enable {
        /// Plugin id
        id: String,
    },
    /// Disable a plugin
    Disable {
        /// Plugin id
        id: String,
    },
    /// Rescan the plugin directory and reconcile the registry
    Refresh,
    /// Run a plugin once and print its output
    Run {
        /// Plugin id
        id: String,
        /// Print the full run record as JSON
        #[arg(long)]
        json: bool,
    },
    /// Run enabled plugins on their schedules until interrupted
    Serve,
    /// Manage configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(clap::Subcommand, Debug)]
enum ConfigAction {
    /// Create a default workspace configuration file
    Init,
    /// Show the merged configuration
    Show,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    // Resolve workspace
    let workspace = cli
        .workspace
        .canonicalize()
        .unwrap_or_else(|_| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")));

    // Load configuration and apply CLI overrides
    let mut config = pegboard_core::load_config(Some(&workspace), None)
        .map_err(|e| anyhow::anyhow!("Configuration error: {}", e))?;
    if let Some(plugin_dir) = &cli.plugin_dir {
        config.plugin_dir = plugin_dir.clone();
    }

    // Set up tracing: human-readable stderr + JSON file logging
    let filter = match cli.verbose {
        0 if cli.quiet => "error",
        0 => "info",
        1 => "debug",
        _ => "trace",
    };

    // Human-readable layer for stderr (always active)
    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_filter(EnvFilter::new(filter));

    // JSON file layer for structured logging
    let log_dir = config.resolved_log_dir();
    let _ = std::fs::create_dir_all(&log_dir);
    let file_appender = tracing_appender::rolling::daily(&log_dir, "pegboard.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);
    let json_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_writer(non_blocking)
        .with_filter(EnvFilter::new("debug"));

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(json_layer)
        .init();

    commands::handle_command(cli.command, &config, &workspace).await
}
