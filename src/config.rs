use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

use crate::cache::Generation;
use crate::error::{Error, Result};

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  /// Origin the app is served from; relative URLs resolve against it
  pub origin: Url,
  /// Generation name prefix (e.g. "pee-meter" gives "pee-meter-v1")
  #[serde(default = "default_cache_prefix")]
  pub cache_prefix: String,
  /// Version tag; bump it to roll both generations on the next activation
  pub version: String,
  /// Relative asset URLs cached at install time
  #[serde(default)]
  pub precache: Vec<String>,
  /// Path segment that marks API requests
  #[serde(default = "default_api_marker")]
  pub api_marker: String,
  /// Precached document served to HTML requests while offline
  #[serde(default = "default_offline_document")]
  pub offline_document: String,
  /// SQLite database for both generations (default: $XDG_DATA_HOME/offgrid/cache.db)
  pub database: Option<PathBuf>,
  #[serde(default = "default_request_timeout_secs")]
  pub request_timeout_secs: u64,
  #[serde(default)]
  pub log: LogConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LogConfig {
  /// Default filter directive, overridden by RUST_LOG
  #[serde(default = "default_log_level")]
  pub level: String,
  /// Directory for a daily log file; stderr when unset
  pub directory: Option<PathBuf>,
}

impl Default for LogConfig {
  fn default() -> Self {
    Self {
      level: default_log_level(),
      directory: None,
    }
  }
}

fn default_cache_prefix() -> String {
  "offgrid".to_string()
}

fn default_api_marker() -> String {
  "/api/".to_string()
}

fn default_offline_document() -> String {
  "./index.html".to_string()
}

fn default_request_timeout_secs() -> u64 {
  30
}

fn default_log_level() -> String {
  "info".to_string()
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./offgrid.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/offgrid/config.yaml
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(Error::Config(format!(
          "config file not found: {}",
          p.display()
        )));
      }
    } else {
      Self::find_config_file()
    };

    match path {
      Some(p) => Self::load_from_path(&p),
      None => Err(Error::Config(
        "no configuration file found. Create one at ~/.config/offgrid/config.yaml\n\
         See offgrid.example.yaml for the format."
          .to_string(),
      )),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("offgrid.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("offgrid").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path).map_err(|e| {
      Error::Config(format!("failed to read config file {}: {}", path.display(), e))
    })?;

    Self::from_yaml(&contents)
      .map_err(|e| Error::Config(format!("{} ({})", e, path.display())))
  }

  pub fn from_yaml(contents: &str) -> Result<Self> {
    let config: Config = serde_yaml::from_str(contents)
      .map_err(|e| Error::Config(format!("failed to parse config: {}", e)))?;
    config.validate()?;
    Ok(config)
  }

  fn validate(&self) -> Result<()> {
    if !matches!(self.origin.scheme(), "http" | "https") {
      return Err(Error::Config(format!(
        "origin must be http or https, got {}",
        self.origin
      )));
    }
    if self.version.trim().is_empty() {
      return Err(Error::Config("version must not be empty".to_string()));
    }
    if self.api_marker.is_empty() {
      return Err(Error::Config("api_marker must not be empty".to_string()));
    }
    // Surface bad manifest entries now rather than at install
    self.manifest()?;
    self.offline_document_url()?;
    Ok(())
  }

  pub fn precache_generation(&self) -> Generation {
    Generation::precache(&self.cache_prefix, &self.version)
  }

  pub fn runtime_generation(&self) -> Generation {
    Generation::runtime(&self.cache_prefix, &self.version)
  }

  /// Resolve a possibly relative URL against the origin.
  pub fn resolve(&self, url: &str) -> Result<Url> {
    self.origin.join(url).map_err(|e| Error::InvalidUrl {
      url: url.to_string(),
      reason: e.to_string(),
    })
  }

  /// The precache manifest as absolute URLs, in order.
  pub fn manifest(&self) -> Result<Vec<Url>> {
    self.precache.iter().map(|u| self.resolve(u)).collect()
  }

  pub fn offline_document_url(&self) -> Result<Url> {
    self.resolve(&self.offline_document)
  }

  pub fn request_timeout(&self) -> Duration {
    Duration::from_secs(self.request_timeout_secs)
  }

  /// Database path, falling back to the per-user data directory.
  pub fn database_path(&self) -> Result<PathBuf> {
    if let Some(path) = &self.database {
      return Ok(path.clone());
    }

    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| Error::Config("could not determine data directory".to_string()))?;

    Ok(data_dir.join("offgrid").join("cache.db"))
  }
}
