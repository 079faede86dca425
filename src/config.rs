//! Application configuration loaded from a JSON file.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Overrides the config file location.
pub const CONFIG_ENV: &str = "MPVRC_CONFIG";

const LOG_LEVELS: &[&str] = &["off", "error", "warn", "info", "debug", "trace"];

#[derive(Error, Debug)]
pub enum ConfigError {
  #[error("Failed to read config {path}: {source}")]
  Read {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },
  #[error("Failed to parse config {path}: {source}")]
  Parse {
    path: PathBuf,
    #[source]
    source: serde_json::Error,
  },
  #[error("Invalid config: {0}")]
  Invalid(String),
}

/// Application configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AppConfig {
  /// Custom MPV executable path (None = auto-detect).
  pub mpv_path: Option<String>,

  /// Additional MPV command-line arguments.
  pub mpv_args: Vec<String>,

  /// IPC endpoint MPV is told to serve.
  pub mpv_endpoint: String,

  /// Endpoint claimed by the primary instance.
  pub instance_endpoint: String,

  pub connect_timeout_ms: u64,

  /// How long a second launch waits on a busy instance endpoint.
  pub instance_wait_ms: u64,

  /// Default log level when `RUST_LOG` is unset.
  pub log_level: String,
}

#[cfg(windows)]
fn default_mpv_endpoint() -> String {
  r"\\.\pipe\mpvsocket".to_string()
}

#[cfg(not(windows))]
fn default_mpv_endpoint() -> String {
  std::env::temp_dir()
    .join("mpvsocket")
    .to_string_lossy()
    .into_owned()
}

#[cfg(windows)]
fn default_instance_endpoint() -> String {
  r"\\.\pipe\mpvrc-unique".to_string()
}

#[cfg(not(windows))]
fn default_instance_endpoint() -> String {
  std::env::temp_dir()
    .join("mpvrc-unique.sock")
    .to_string_lossy()
    .into_owned()
}

impl Default for AppConfig {
  fn default() -> Self {
    Self {
      mpv_path: None,
      mpv_args: Vec::new(),
      mpv_endpoint: default_mpv_endpoint(),
      instance_endpoint: default_instance_endpoint(),
      connect_timeout_ms: 500,
      instance_wait_ms: 50,
      log_level: "info".to_string(),
    }
  }
}

impl AppConfig {
  /// Load from `$MPVRC_CONFIG` or the user config directory.
  pub fn load() -> Result<Self, ConfigError> {
    match config_path() {
      Some(path) => Self::load_from(&path),
      None => Ok(Self::default()),
    }
  }

  /// Load from `path`. A missing file yields the defaults.
  pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
    let contents = match std::fs::read_to_string(path) {
      Ok(contents) => contents,
      Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
      Err(e) => {
        return Err(ConfigError::Read {
          path: path.to_path_buf(),
          source: e,
        })
      }
    };

    let config: Self = serde_json::from_str(&contents).map_err(|e| ConfigError::Parse {
      path: path.to_path_buf(),
      source: e,
    })?;
    config.validate()?;
    Ok(config)
  }

  /// Validate configuration values.
  pub fn validate(&self) -> Result<(), ConfigError> {
    if self.mpv_endpoint.trim().is_empty() {
      return Err(ConfigError::Invalid("MPV endpoint cannot be empty".to_string()));
    }
    if self.instance_endpoint.trim().is_empty() {
      return Err(ConfigError::Invalid(
        "Instance endpoint cannot be empty".to_string(),
      ));
    }
    if self.connect_timeout_ms == 0 {
      return Err(ConfigError::Invalid(
        "Connect timeout must be at least 1 ms".to_string(),
      ));
    }
    if !LOG_LEVELS.contains(&self.log_level.to_ascii_lowercase().as_str()) {
      return Err(ConfigError::Invalid(format!(
        "Unknown log level \"{}\"",
        self.log_level
      )));
    }
    Ok(())
  }

  /// Configured MPV binary, if any.
  pub fn mpv_path(&self) -> Option<PathBuf> {
    self
      .mpv_path
      .as_ref()
      .filter(|s| !s.is_empty())
      .map(PathBuf::from)
  }

  pub fn connect_timeout(&self) -> Duration {
    Duration::from_millis(self.connect_timeout_ms)
  }

  pub fn instance_wait(&self) -> Duration {
    Duration::from_millis(self.instance_wait_ms)
  }
}

/// Location of the config file.
pub fn config_path() -> Option<PathBuf> {
  if let Some(path) = std::env::var_os(CONFIG_ENV).filter(|p| !p.is_empty()) {
    return Some(PathBuf::from(path));
  }
  dirs::config_dir().map(|dir| dir.join("mpvrc").join("config.json"))
}
