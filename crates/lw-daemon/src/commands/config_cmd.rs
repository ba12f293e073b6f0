//! Config command implementation

use anyhow::{Context, Result};
use clap::Args;
use loopwatch_core::config::LwConfig;

/// Show effective configuration
#[derive(Args, Debug)]
pub struct ConfigArgs {
    /// Output as JSON instead of TOML
    #[arg(long)]
    pub json: bool,
}

/// Execute the config command
pub fn execute(args: &ConfigArgs, config: &LwConfig) -> Result<()> {
    print!("{}", render(config, args.json)?);
    Ok(())
}

/// Render the merged configuration in the requested format.
fn render(config: &LwConfig, json: bool) -> Result<String> {
    if json {
        let mut out =
            serde_json::to_string_pretty(config).context("Failed to encode config as JSON")?;
        out.push('\n');
        Ok(out)
    } else {
        toml::to_string_pretty(config).context("Failed to encode config as TOML")
    }
}
