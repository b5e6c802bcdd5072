//! Config Command
//!
//! Manage ultra configuration.
//!
//! Usage:
//!   ultra config show [--json]
//!   ultra config path
//!   ultra config init [-g] [--force]

use crate::cli::ui::Output;
use crate::config::{Config, ConfigLoader};
use crate::types::Result;

/// Show the merged effective configuration
pub fn show(config: &Config, as_json: bool) -> Result<()> {
    println!("{}", ConfigLoader::render(config, as_json)?);
    Ok(())
}

/// Show configuration paths
pub fn path() -> Result<()> {
    let out = Output::new();
    out.header("Configuration paths");

    match ConfigLoader::global_config_path() {
        Some(global) => {
            let exists = if global.exists() { "✓" } else { "✗" };
            out.field("Global", format!("{} {}", exists, global.display()));
        }
        None => out.field("Global", "(not available)"),
    }

    let project = ConfigLoader::project_config_path();
    let exists = if project.exists() { "✓" } else { "✗" };
    out.field("Project", format!("{} {}", exists, project.display()));
    Ok(())
}

pub fn init(global: bool, force: bool) -> Result<()> {
    let path = ConfigLoader::init(global, force)?;
    Output::new().success(&format!("Configuration at {}", path.display()));
    Ok(())
}
