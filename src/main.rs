//! pushrelay - SimplePush notification relay
//!
//! Main entry point for the pushrelay CLI.

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use pushrelay::config::{validate_config, validate_config_result, RelayConfig};
use pushrelay::logging;
use pushrelay::server::PushServer;
use std::path::{Path, PathBuf};
use std::process;

/// pushrelay - push notification relay for user agents
#[derive(Parser, Debug)]
#[command(name = "pushrelay")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Log filter used when RUST_LOG is unset (e.g. info, debug, pushrelay=trace)
    #[arg(long, global = true, default_value = logging::DEFAULT_FILTER)]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the push server
    Serve {
        /// Path to config file (default: ~/.config/pushrelay/config.yaml)
        #[arg(short, long, env = "PUSHRELAY_CONFIG")]
        config: Option<PathBuf>,

        /// Interface to bind, overriding the config file
        #[arg(long)]
        host: Option<String>,

        /// Port to bind, overriding the config file
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Write a default configuration file
    Init {
        /// Where to write it (default: ~/.config/pushrelay/config.yaml)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Overwrite an existing file
        #[arg(short, long)]
        force: bool,
    },

    /// Validate a configuration file and print the effective settings
    Check {
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if let Err(e) = logging::init(&cli.log_level) {
        eprintln!("Failed to initialize logging: {}", e);
    }

    if let Err(e) = run(cli).await {
        eprintln!("Error: {:#}", e);
        process::exit(1);
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Serve { config, host, port } => {
            let mut config = load_config(config.as_deref())?;
            if let Some(host) = host {
                config.host = host;
            }
            if let Some(port) = port {
                config.port = port;
            }
            validate_config_result(&config)?;

            let server = PushServer::new(config).context("Failed to create push server")?;
            server.run().await?;
        }

        Commands::Init { config, force } => {
            let path = config.unwrap_or_else(RelayConfig::default_path);
            if path.exists() && !force {
                bail!(
                    "Config file already exists: {} (use --force to overwrite)",
                    path.display()
                );
            }
            RelayConfig::new()
                .save(&path)
                .with_context(|| format!("Failed to write {}", path.display()))?;
            println!("Wrote default configuration to {}", path.display());
            println!("Set 'password' before exposing the server.");
        }

        Commands::Check { config } => {
            let config = load_config(config.as_deref())?;
            match validate_config(&config) {
                Ok(()) => {
                    println!("Configuration is valid\n");
                    print!("{}", serde_yaml::to_string(&config)?);
                }
                Err(errors) => {
                    eprintln!("Configuration has {} problem(s):", errors.len());
                    for error in &errors {
                        eprintln!("  - {}", error);
                    }
                    bail!("Invalid configuration");
                }
            }
        }
    }

    Ok(())
}

/// Explicit paths must exist; the default path falls back to built-in defaults
fn load_config(path: Option<&Path>) -> anyhow::Result<RelayConfig> {
    if let Some(path) = path {
        return RelayConfig::load(path)
            .with_context(|| format!("Failed to load {}", path.display()));
    }

    let default = RelayConfig::default_path();
    if default.exists() {
        Ok(RelayConfig::load(&default)?)
    } else {
        tracing::info!(path = %default.display(), "No config file, using defaults");
        Ok(RelayConfig::new())
    }
}
