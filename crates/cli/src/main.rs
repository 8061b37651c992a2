mod config_commands;
mod history_commands;

use std::path::{Path, PathBuf};

use {
    anyhow::Context,
    clap::{Parser, Subcommand},
    relay_config::RelayConfig,
    tracing::{debug, info},
    tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt},
};

#[derive(Parser)]
#[command(name = "relay", about = "Relay: Telegram to Discord channel forwarder", version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Output logs as JSON instead of human-readable.
    #[arg(long, global = true, default_value_t = false)]
    json_logs: bool,

    /// Config file (overrides discovery in ./ and ~/.config/relay/).
    #[arg(long, global = true, env = "RELAY_CONFIG")]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate the configuration file and report errors/warnings.
    Check {
        /// Also show informational diagnostics and the routing table.
        #[arg(long)]
        verbose: bool,
    },
    /// Inspect the forwarding history.
    History {
        /// Print JSON instead of a table.
        #[arg(long)]
        json: bool,
        #[command(subcommand)]
        action: history_commands::HistoryAction,
    },
}

fn init_telemetry(cli: &Cli) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));

    let registry = tracing_subscriber::registry().with(filter);

    if cli.json_logs {
        registry
            .with(
                fmt::layer()
                    .json()
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_writer(std::io::stderr),
            )
            .init();
    } else {
        registry
            .with(
                fmt::layer()
                    .with_target(false)
                    .with_thread_ids(false)
                    .with_writer(std::io::stderr)
                    .with_ansi(true),
            )
            .init();
    }
}

fn load(path: Option<&Path>) -> anyhow::Result<RelayConfig> {
    match path {
        Some(path) => relay_config::load_config(path)
            .with_context(|| format!("loading {}", path.display())),
        None => {
            let (path, config) = relay_config::discover_and_load()?;
            debug!(path = %path.display(), "config loaded");
            Ok(config)
        },
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    init_telemetry(&cli);

    info!(version = env!("CARGO_PKG_VERSION"), "relay starting");

    match cli.command {
        Commands::Check { verbose } => config_commands::check(cli.config.as_deref(), verbose),
        Commands::History { json, action } => {
            let config = load(cli.config.as_deref())?;
            history_commands::handle_history(&config, action, json).await
        },
    }
}
