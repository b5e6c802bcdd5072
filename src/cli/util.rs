//! CLI Common Utilities
//!
//! Shared initialization for CLI command handlers.

use std::path::Path;

use tokio::runtime::Runtime;

use crate::config::{Config, ConfigLoader};
use crate::orchestrator::Orchestrator;
use crate::types::Result;

/// Load configuration: an explicit `--config` file replaces the global and
/// project layers
pub fn load_config(path: Option<&Path>) -> Result<Config> {
    match path {
        Some(path) => ConfigLoader::load_from_file(path),
        None => ConfigLoader::load(),
    }
}

/// Runtime plus orchestrator, the context every network command needs
pub struct CommandContext {
    pub runtime: Runtime,
    pub orchestrator: Orchestrator,
}

impl CommandContext {
    pub fn load(config: &Config) -> Result<Self> {
        let runtime = Runtime::new()?;
        // Adapters resolve keys and build on the shared pool; no I/O yet
        let orchestrator = {
            let _guard = runtime.enter();
            Orchestrator::from_config(config)?
        };
        Ok(Self {
            runtime,
            orchestrator,
        })
    }
}
