use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::ConfigError;
use crate::models::{ApiType, SampleFormat};

/// Defaults the command-line tools fall back to when an option is omitted.
/// The library itself never reads this.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestraConfig {
    /// Backend tag such as "alsa" or "dummy"; automatic selection when unset
    pub preferred_api: Option<String>,
    pub sample_rate: u32,
    pub buffer_frames: u32,
    pub number_of_buffers: u32,
    pub format: SampleFormat,
    pub channels: u32,
    pub minimize_latency: bool,
    pub log_level: Option<String>,
}

impl Default for OrchestraConfig {
    fn default() -> Self {
        Self {
            preferred_api: None,
            sample_rate: 48000,
            buffer_frames: 256,
            number_of_buffers: 4,
            format: SampleFormat::Float32,
            channels: 2,
            minimize_latency: false,
            log_level: None,
        }
    }
}

impl OrchestraConfig {
    /// Check values that would make every stream request fail
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.sample_rate == 0 {
            return Err(invalid("sample_rate", self.sample_rate));
        }
        if self.channels == 0 {
            return Err(invalid("channels", self.channels));
        }
        if let Some(api) = &self.preferred_api {
            if api.parse::<ApiType>().is_err() {
                return Err(invalid("preferred_api", api));
            }
        }
        Ok(())
    }

    pub fn preferred_api_type(&self) -> Option<ApiType> {
        self.preferred_api.as_deref().and_then(|tag| tag.parse().ok())
    }
}

fn invalid(field: &str, value: impl ToString) -> ConfigError {
    ConfigError::InvalidValue {
        field: field.to_string(),
        value: value.to_string(),
    }
}

/// Loads and saves `~/.config/orchestra/config.toml`
pub struct ConfigManager {
    config: OrchestraConfig,
    config_path: PathBuf,
}

impl ConfigManager {
    /// Open the per-user configuration. A missing file yields defaults; a
    /// malformed one is reported so the tools can warn before falling back.
    pub fn new() -> Result<Self, ConfigError> {
        let config_path = Self::get_config_path()?;
        Self::with_path(config_path)
    }

    pub fn with_path(config_path: PathBuf) -> Result<Self, ConfigError> {
        let config = Self::load_config(&config_path)?;
        config.validate()?;
        Ok(Self {
            config,
            config_path,
        })
    }

    pub fn get_config(&self) -> &OrchestraConfig {
        &self.config
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    pub fn update_config<F>(&mut self, updater: F) -> Result<(), ConfigError>
    where
        F: FnOnce(&mut OrchestraConfig),
    {
        let mut updated = self.config.clone();
        updater(&mut updated);
        updated.validate()?;
        self.config = updated;
        self.save_config()
    }

    pub fn set_preferred_api(&mut self, api: Option<ApiType>) -> Result<(), ConfigError> {
        self.config.preferred_api = api.map(|api| api.as_str().to_string());
        self.save_config()
    }

    pub fn reset_to_defaults(&mut self) -> Result<(), ConfigError> {
        self.config = OrchestraConfig::default();
        self.save_config()
    }

    fn get_config_path() -> Result<PathBuf, ConfigError> {
        let config_dir = dirs::home_dir()
            .ok_or(ConfigError::ConfigDirNotFound)?
            .join(".config")
            .join("orchestra");
        Ok(config_dir.join("config.toml"))
    }

    fn load_config(path: &Path) -> Result<OrchestraConfig, ConfigError> {
        if !path.exists() {
            return Ok(OrchestraConfig::default());
        }

        let config_content = std::fs::read_to_string(path)?;
        let config: OrchestraConfig = toml::from_str(&config_content)?;
        Ok(config)
    }

    fn save_config(&self) -> Result<(), ConfigError> {
        if let Some(parent) = self.config_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let config_content = toml::to_string_pretty(&self.config)?;
        std::fs::write(&self.config_path, config_content)?;
        Ok(())
    }
}
