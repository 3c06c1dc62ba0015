use std::fs;
use std::path::PathBuf;

use tracing::{debug, info};

use crate::domain::{AppConfig, DomainError};
use crate::ports::ConfigStore;

const APP_DIR: &str = "Termitas";

/// TOML-based configuration store with OS-specific paths.
pub struct TomlConfigStore {
    config_dir: PathBuf,
    data_dir: PathBuf,
}

impl TomlConfigStore {
    /// Create a new TomlConfigStore.
    /// Uses OS-specific application directories.
    pub fn new() -> Result<Self, DomainError> {
        let config_dir = Self::get_config_dir()?;
        let data_dir = Self::get_data_dir().unwrap_or_else(|| config_dir.clone());
        Self::with_dirs(config_dir, data_dir)
    }

    /// Keep configuration, models and logs under a single directory.
    pub fn with_data_dir(dir: impl Into<PathBuf>) -> Result<Self, DomainError> {
        let dir = dir.into();
        Self::with_dirs(dir.clone(), dir)
    }

    fn with_dirs(config_dir: PathBuf, data_dir: PathBuf) -> Result<Self, DomainError> {
        fs::create_dir_all(&config_dir)?;
        fs::create_dir_all(&data_dir)?;

        info!(config_dir = ?config_dir, data_dir = ?data_dir, "ConfigStore initialized");

        Ok(Self {
            config_dir,
            data_dir,
        })
    }

    /// Get the OS-specific configuration directory.
    /// - macOS: ~/Library/Application Support/Termitas/
    /// - Windows: %APPDATA%\Termitas\
    /// - Linux: ~/.config/Termitas/
    fn get_config_dir() -> Result<PathBuf, DomainError> {
        #[cfg(target_os = "macos")]
        {
            dirs::data_dir()
                .map(|p| p.join(APP_DIR))
                .ok_or_else(|| DomainError::Config("Could not find application data directory".to_string()))
        }

        #[cfg(not(target_os = "macos"))]
        {
            dirs::config_dir()
                .map(|p| p.join(APP_DIR))
                .ok_or_else(|| DomainError::Config("Could not find application config directory".to_string()))
        }
    }

    /// Get the OS-specific directory for large data (models, logs).
    /// - macOS: ~/Library/Application Support/Termitas/
    /// - Windows: %LOCALAPPDATA%\Termitas\
    /// - Linux: ~/.local/share/Termitas/
    fn get_data_dir() -> Option<PathBuf> {
        #[cfg(target_os = "windows")]
        {
            dirs::data_local_dir().map(|p| p.join(APP_DIR))
        }

        #[cfg(not(target_os = "windows"))]
        {
            dirs::data_dir().map(|p| p.join(APP_DIR))
        }
    }
}

impl ConfigStore for TomlConfigStore {
    fn load(&self) -> Result<AppConfig, DomainError> {
        let config_path = self.config_path();

        if config_path.exists() {
            debug!(path = ?config_path, "Loading configuration");
            let content = fs::read_to_string(&config_path)?;
            let config: AppConfig = toml::from_str(&content)?;
            info!(path = ?config_path, "Configuration loaded");
            Ok(config)
        } else {
            info!(path = ?config_path, "Configuration file not found, creating default");
            let config = AppConfig::new();
            self.save(&config)?;
            Ok(config)
        }
    }

    fn save(&self, config: &AppConfig) -> Result<(), DomainError> {
        let config_path = self.config_path();

        if let Some(parent) = config_path.parent() {
            fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(config)?;
        fs::write(&config_path, content)?;

        info!(path = ?config_path, "Configuration saved");
        Ok(())
    }

    fn config_path(&self) -> PathBuf {
        self.config_dir.join("config.toml")
    }

    fn data_dir(&self) -> PathBuf {
        self.data_dir.clone()
    }

    fn logs_dir(&self) -> PathBuf {
        self.data_dir.join("logs")
    }
}
