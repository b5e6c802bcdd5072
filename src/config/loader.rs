//! Configuration Loader (Figment-based)
//!
//! Loads and merges configuration from multiple sources using Figment:
//! 1. Built-in defaults (Serialized)
//! 2. Global config (platform config dir, e.g. ~/.config/ultra/config.toml)
//! 3. Project config (.ultra/config.toml)
//! 4. Environment variables (ULTRA_* prefix, `__` separates sections)

use directories::ProjectDirs;
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use super::types::Config;
use crate::types::{Result, UltraError};

/// Configuration loader
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load configuration with full resolution chain:
    /// defaults → global → project → env vars
    pub fn load() -> Result<Config> {
        Self::load_layers(
            Self::global_config_path().as_deref(),
            &Self::project_config_path(),
        )
    }

    /// Load from explicit global/project paths (missing files are skipped)
    pub fn load_layers(global: Option<&Path>, project: &Path) -> Result<Config> {
        let mut figment = Figment::new().merge(Serialized::defaults(Config::default()));

        if let Some(global_path) = global
            && global_path.exists()
        {
            debug!("Loading global config from: {}", global_path.display());
            figment = figment.merge(Toml::file(global_path));
        }

        if project.exists() {
            debug!("Loading project config from: {}", project.display());
            figment = figment.merge(Toml::file(project));
        }

        // ULTRA_TIMEOUTS__STAGE=30 -> timeouts.stage
        figment = figment.merge(Env::prefixed("ULTRA_").split("__").lowercase(true));

        Self::extract(figment)
    }

    /// Load configuration from a specific file only
    pub fn load_from_file(path: &Path) -> Result<Config> {
        if !path.exists() {
            return Err(UltraError::Config(format!(
                "Config file not found: {}",
                path.display()
            )));
        }
        let figment = Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Toml::file(path));
        Self::extract(figment)
    }

    fn extract(figment: Figment) -> Result<Config> {
        let config: Config = figment
            .extract()
            .map_err(|e| UltraError::Config(format!("Configuration error: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    // =========================================================================
    // Path Management
    // =========================================================================

    /// Platform config directory for ultra
    pub fn global_dir() -> Option<PathBuf> {
        ProjectDirs::from("", "", "ultra").map(|dirs| dirs.config_dir().to_path_buf())
    }

    pub fn global_config_path() -> Option<PathBuf> {
        Self::global_dir().map(|dir| dir.join("config.toml"))
    }

    pub fn project_dir() -> PathBuf {
        PathBuf::from(".ultra")
    }

    pub fn project_config_path() -> PathBuf {
        Self::project_dir().join("config.toml")
    }

    // =========================================================================
    // Config Commands
    // =========================================================================

    /// Effective configuration rendered as TOML or JSON
    pub fn render(config: &Config, as_json: bool) -> Result<String> {
        if as_json {
            Ok(serde_json::to_string_pretty(config)?)
        } else {
            toml::to_string_pretty(config).map_err(|e| UltraError::Config(e.to_string()))
        }
    }

    /// Write the starter config; existing files are kept unless `force`
    pub fn init(global: bool, force: bool) -> Result<PathBuf> {
        let path = if global {
            Self::global_config_path().ok_or_else(|| {
                UltraError::Config("Cannot determine global config directory".to_string())
            })?
        } else {
            Self::project_config_path()
        };
        Self::write_default(&path, force)?;
        Ok(path)
    }

    pub fn write_default(path: &Path, force: bool) -> Result<bool> {
        if path.exists() && !force {
            info!("Config exists: {}", path.display());
            return Ok(false);
        }
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, Self::default_config())?;
        info!("Created config: {}", path.display());
        Ok(true)
    }

    // =========================================================================
    // Internal
    // =========================================================================

    fn default_config() -> &'static str {
        r#"# ultra configuration
# Project settings in .ultra/config.toml override the global file.
# API keys are read from OPENAI_API_KEY, ANTHROPIC_API_KEY and GEMINI_API_KEY
# unless api_key / api_key_env is set per provider.

version = "1.0"

[providers.openai]
kind = "openai"

[providers.anthropic]
kind = "anthropic"

[providers.google]
kind = "google"

[providers.ollama]
kind = "ollama"
api_base = "http://localhost:11434"

[fallback_chains]
openai = ["anthropic", "google", "ollama"]
anthropic = ["openai", "google", "ollama"]
google = ["openai", "anthropic", "ollama"]

[circuit_breaker]
failure_threshold = 5
recovery_timeout_secs = 60

[retry]
max_attempts = 2

[timeouts]
transport = 45
stage = 120
pipeline = 600

[pipeline]
fallback_during_fanout = false
max_models = 8
"#
    }
}
