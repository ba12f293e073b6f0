//! CLI command dispatch and execution

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use loopwatch_core::config::{ConfigOverrides, LwConfig, resolve_config};

mod config_cmd;
mod serve;

pub use config_cmd::ConfigArgs;
pub use serve::ServeArgs;

/// lw-daemon - Supervise a worker loop and stream it to WebSocket observers
#[derive(Parser, Debug)]
#[command(
    name = "lw-daemon",
    version,
    about = "Supervise a worker loop and stream it to WebSocket observers",
    long_about = "Runs a long-lived worker process and a per-message chat assistant, \
                  broadcasting their output to every connected WebSocket observer"
)]
pub struct Cli {
    /// Path to configuration file (replaces repo and global discovery)
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the observer hub and supervisors until interrupted
    Serve(ServeArgs),

    /// Show the effective configuration
    Config(ConfigArgs),
}

impl Cli {
    /// Execute the CLI command
    pub async fn execute(self) -> Result<()> {
        match self.command {
            Commands::Serve(args) => {
                let overrides = ConfigOverrides {
                    config_path: self.config,
                    worker_command: args.worker_command.clone(),
                    bind: args.bind.clone(),
                };
                let config = load_config(&overrides)?;
                serve::execute(args, config).await
            }
            Commands::Config(args) => {
                let overrides = ConfigOverrides {
                    config_path: self.config,
                    ..Default::default()
                };
                let config = load_config(&overrides)?;
                config_cmd::execute(&args, &config)
            }
        }
    }
}

fn load_config(overrides: &ConfigOverrides) -> Result<LwConfig> {
    let home_dir =
        loopwatch_core::home::get_home_dir().context("Failed to determine home directory")?;
    let current_dir = std::env::current_dir().context("Failed to determine current directory")?;
    resolve_config(overrides, &current_dir, &home_dir).context("Failed to resolve configuration")
}
