/// Application preferences
/// Stores user defaults in ~/.config/sqlbackup-cli/config.toml

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct AppConfig {
    /// Backup configuration used when `run` is given no `--config`
    pub default_config: Option<String>,
    /// Local directory receiving staging directories and archives
    pub output_dir: Option<String>,
}

impl AppConfig {
    /// Get config file path
    pub fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .context("Failed to get config directory")?
            .join("sqlbackup-cli");

        Ok(config_dir.join("config.toml"))
    }

    /// Load preferences from the default location
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    /// Load preferences from a specific file, defaulting when it is absent
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path)
            .context("Failed to read preferences file")?;

        let config: Self = toml::from_str(&contents)
            .context("Failed to parse preferences file")?;

        Ok(config)
    }

    /// Save preferences to the default location
    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .context("Failed to create config directory")?;
        }

        let contents = toml::to_string_pretty(self)
            .context("Failed to serialize preferences")?;

        fs::write(path, contents)
            .context("Failed to write preferences file")?;

        Ok(())
    }

    /// Set and save the default backup configuration path
    pub fn set_default_config(&mut self, path: &Path) -> Result<()> {
        let absolute = fs::canonicalize(path)
            .with_context(|| format!("Configuration file not found: {}", path.display()))?;
        self.default_config = Some(absolute.to_string_lossy().to_string());
        self.save()
    }
}
