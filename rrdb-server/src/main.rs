//! rrdb-server: TCP/UDP front end for the rrdb time-series engine.
//!
//! Serves the text protocol described in [`rrdb::statement`] on a TCP port
//! (one statement per connection) and a UDP port (fire-and-forget short
//! commands), flushing the data directory periodically and on Ctrl-C.

mod config;
mod server;
mod tasks;
mod tcp;
mod udp;

use std::path::PathBuf;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use crate::config::Config;

/// rrdb-server: round-robin time-series database server.
#[derive(Parser)]
#[command(name = "rrdb-server", version, about)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Data directory (overrides `storage.path`).
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Log filter such as `info` or `rrdb=debug` (overrides `log.level`).
    #[arg(long)]
    log_level: Option<String>,

    /// Validate the configuration, print the effective values and exit.
    #[arg(long)]
    check_config: bool,
}

fn main() {
    let cli = Cli::parse();

    let config = match load_config(&cli) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("rrdb-server: {e}");
            std::process::exit(2);
        }
    };

    if cli.check_config {
        match config.to_toml() {
            Ok(text) => print!("{text}"),
            Err(e) => {
                eprintln!("rrdb-server: {e}");
                std::process::exit(2);
            }
        }
        return;
    }

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log.level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            tracing::error!("failed to start the async runtime: {e}");
            std::process::exit(1);
        }
    };

    if let Err(e) = runtime.block_on(server::run(config)) {
        tracing::error!("server failed: {e}");
        std::process::exit(1);
    }
}

/// Loads the config file and applies command-line overrides.
fn load_config(cli: &Cli) -> Result<Config, config::ConfigError> {
    let mut config = Config::load(cli.config.as_deref())?;
    if let Some(data_dir) = &cli.data_dir {
        config.storage.path.clone_from(data_dir);
    }
    if let Some(level) = &cli.log_level {
        config.log.level.clone_from(level);
    }
    config.validate()?;
    Ok(config)
}
