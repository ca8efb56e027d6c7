//! Runtime configuration
//!
//! Configuration is read from a YAML file (by default `<config dir>/flowbook/config.yaml`)
//! and may be overridden from the environment.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use typed_builder::TypedBuilder;

use crate::interpolation::MissingValue;

pub const DEFAULT_API_URL: &str = "http://127.0.0.1:5000/";
pub const API_URL_ENV: &str = "FLOWBOOK_API_URL";

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config file: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TypedBuilder)]
#[serde(default, rename_all = "snake_case")]
pub struct RuntimeConfig {
    /// Base URL of the remote API. Paths are resolved relative to it.
    #[builder(default = DEFAULT_API_URL.to_string(), setter(into))]
    pub api_base_url: String,

    /// Interval between status checks for polled research jobs
    #[builder(default = 15)]
    pub poll_interval_secs: u64,

    #[builder(default, setter(strip_option, into))]
    pub data_dir: Option<PathBuf>,

    /// Stop the run after a checkpoint block until it is explicitly resumed
    #[builder(default = true)]
    pub pause_at_checkpoints: bool,

    /// Separator used when a list of values is written to a scalar variable
    #[builder(default = ", ".to_string(), setter(into))]
    pub value_delimiter: String,

    /// Recipient for check-in and completion notifications
    #[builder(default, setter(strip_option, into))]
    pub notify_email: Option<String>,

    /// How prompt-like blocks render references to variables without a value
    #[builder(default)]
    pub missing_value: MissingValue,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl RuntimeConfig {
    pub async fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = tokio::fs::read_to_string(path.as_ref()).await?;
        Self::from_yaml(&content)
    }

    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(content)?)
    }

    /// Load from the default location, falling back to defaults when no file exists,
    /// then apply environment overrides.
    pub async fn load_default() -> Result<Self, ConfigError> {
        let config = match Self::default_path() {
            Some(path) if path.is_file() => {
                tracing::debug!("Loading config from {path}", path = path.display());
                Self::load(&path).await?
            }
            _ => Self::default(),
        };
        Ok(config.with_env_overrides())
    }

    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("flowbook").join("config.yaml"))
    }

    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(url) = std::env::var(API_URL_ENV) {
            if !url.trim().is_empty() {
                self.api_base_url = url;
            }
        }
        self
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs.max(1))
    }

    /// Directory holding persisted workflows, variables and job records
    pub fn data_dir(&self) -> PathBuf {
        self.data_dir
            .clone()
            .or_else(|| dirs::data_dir().map(|dir| dir.join("flowbook")))
            .unwrap_or_else(|| PathBuf::from(".flowbook"))
    }
}
