//! stockchat CLI, the main entry point.
//!
//! Commands:
//! - `serve`    Start the HTTP API server
//! - `chat`     Run one chat turn in the terminal
//! - `tools`    List the tools offered to the model
//! - `migrate`  Create the database schema
//! - `config`   Print the effective configuration

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use stockchat_config::{AppConfig, LoggingConfig};

mod commands;

#[derive(Parser)]
#[command(
    name = "stockchat",
    about = "Stock analysis chat backend",
    version,
    author
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to the config file (defaults to ~/.stockchat/config.toml)
    #[arg(short, long, global = true, env = "STOCKCHAT_CONFIG")]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP API server
    Serve {
        /// Override the bind address
        #[arg(long)]
        host: Option<String>,

        /// Override the port
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Send one message and stream the answer to stdout
    Chat {
        #[arg(short, long)]
        message: String,

        /// Continue an existing conversation
        #[arg(long)]
        conversation: Option<String>,
    },

    /// List available tools
    Tools,

    /// Connect to the database and create the schema
    Migrate,

    /// Print the effective configuration (secrets redacted)
    Config,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let config = AppConfig::load(cli.config.as_deref()).map_err(|e| format!("Failed to load config: {e}"))?;
    init_tracing(&config.logging, cli.verbose);
    tracing::debug!(environment = %config.environment, database = %config.database.url, "Configuration loaded");

    match cli.command {
        Commands::Serve { host, port } => commands::serve::run(config, host, port).await?,
        Commands::Chat { message, conversation } => commands::chat::run(config, message, conversation).await?,
        Commands::Tools => commands::tools::run(&config)?,
        Commands::Migrate => commands::migrate::run(&config).await?,
        Commands::Config => commands::config_cmd::show(&config)?,
    }

    Ok(())
}

/// `--verbose` wins, then `RUST_LOG`, then the configured level.
fn init_tracing(logging: &LoggingConfig, verbose: bool) {
    let filter = if verbose {
        tracing_subscriber::EnvFilter::new("debug")
    } else {
        tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&logging.level))
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if logging.format == "json" {
        builder.json().with_current_span(false).init();
    } else {
        builder.with_target(false).init();
    }
}
