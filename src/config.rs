use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use url::Url;

/// Environment variable overriding `upstream`.
const UPSTREAM_ENV: &str = "SIGNAGE_RELAY_UPSTREAM";

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
  /// Origin of the display app and its API, e.g. `http://127.0.0.1:3000`
  pub upstream: String,
  /// Address the local intermediary listens on
  pub listen: String,
  /// Version tag embedded in partition names. Changing it triggers install
  /// and activation on the next start.
  pub version: String,
  pub partition_prefix: String,
  /// Requests whose path starts with this are treated as API requests
  pub api_prefix: String,
  /// Cached pages offered to offline navigations, tried in order
  pub navigation_fallbacks: Vec<String>,
  /// Pre-warmed into the static partition at install
  pub static_assets: Vec<String>,
  /// Re-fetched by CACHE_UPDATE
  pub api_endpoints: Vec<String>,
  pub sync: SyncConfig,
  pub storage: StorageConfig,
  pub log: LogConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
  /// Background sync tag this worker answers to
  pub tag: String,
  /// Endpoint refreshed when the tag fires
  pub endpoint: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
  /// SQLite file (defaults to the user data directory)
  pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct LogConfig {
  /// Directory for daily log files; stderr only when unset
  pub dir: Option<PathBuf>,
}

impl Default for Config {
  fn default() -> Self {
    Self {
      upstream: "http://127.0.0.1:3000".to_string(),
      listen: "127.0.0.1:8080".to_string(),
      version: "v1.0.0".to_string(),
      partition_prefix: "mosque".to_string(),
      api_prefix: "/api/".to_string(),
      navigation_fallbacks: strings(&["/display", "/"]),
      static_assets: strings(&[
        "/",
        "/display",
        "/admin",
        "/preview",
        "/static/css/main.chunk.css",
        "/static/js/main.chunk.js",
        "/static/js/bundle.js",
        "/manifest.json",
        "/icon-192x192.png",
        "/icon-512x512.png",
        "/icon-192x192.svg",
        "/icon-512x512.svg",
      ]),
      api_endpoints: strings(&[
        "/api/prayer-times",
        "/api/settings",
        "/api/announcements",
        "/api/quran-verses",
        "/api/financial-reports",
        "/api/weather",
        "/api/weather-forecast",
        "/api/disaster-warnings",
      ]),
      sync: SyncConfig::default(),
      storage: StorageConfig::default(),
      log: LogConfig::default(),
    }
  }
}

impl Default for SyncConfig {
  fn default() -> Self {
    Self {
      tag: "sync-prayer-times".to_string(),
      endpoint: "/api/prayer-times".to_string(),
    }
  }
}

fn strings(items: &[&str]) -> Vec<String> {
  items.iter().map(|s| s.to_string()).collect()
}

impl Config {
  /// Load configuration.
  ///
  /// Search order:
  /// 1. Explicit path if provided (must exist)
  /// 2. ./signage-relay.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/signage-relay/config.yaml
  ///
  /// Falls back to built-in defaults when no file is found. The upstream can
  /// be overridden with SIGNAGE_RELAY_UPSTREAM.
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    let config = match path {
      Some(p) => Self::load_from_path(&p)?,
      None => Self::default(),
    };

    Ok(config.with_env_overrides())
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("signage-relay.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("signage-relay").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::from_yaml(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  fn from_yaml(contents: &str) -> Result<Self> {
    let config: Config = serde_yaml::from_str(contents)?;
    Ok(config)
  }

  fn with_env_overrides(mut self) -> Self {
    if let Ok(upstream) = std::env::var(UPSTREAM_ENV) {
      self.upstream = upstream;
    }
    self
  }

  /// Parsed upstream origin.
  pub fn upstream_url(&self) -> Result<Url> {
    Url::parse(&self.upstream).map_err(|e| eyre!("Invalid upstream URL {}: {}", self.upstream, e))
  }
}
