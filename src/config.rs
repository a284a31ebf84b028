use chrono::Duration;
use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::model::DEFAULT_ALBUM_SIZE;

/// Longest accepted cache max age: one year.
const MAX_AGE_MINS: i64 = 60 * 24 * 365;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  pub remote: RemoteConfig,
  /// Owner id used when a command does not name one
  pub user_id: Option<String>,
  #[serde(default)]
  pub cache: CacheConfig,
  #[serde(default)]
  pub album: AlbumConfig,
  #[serde(default)]
  pub sync: SyncConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RemoteConfig {
  /// Project base url, e.g. https://abc.supabase.co
  pub url: String,
  /// Public API key; falls back to STICKERSYNC_ANON_KEY
  pub anon_key: Option<String>,
  #[serde(default = "default_timeout_secs")]
  pub timeout_secs: u64,
}

fn default_timeout_secs() -> u64 {
  15
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
  /// Database file; defaults to the platform data directory
  pub path: Option<PathBuf>,
  #[serde(default = "default_entity_max_age")]
  pub entity_max_age_mins: i64,
  #[serde(default = "default_profile_max_age")]
  pub profile_max_age_mins: i64,
  #[serde(default = "default_connections_max_age")]
  pub connections_max_age_mins: i64,
}

fn default_entity_max_age() -> i64 {
  30
}

fn default_profile_max_age() -> i64 {
  15
}

fn default_connections_max_age() -> i64 {
  15
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      path: None,
      entity_max_age_mins: default_entity_max_age(),
      profile_max_age_mins: default_profile_max_age(),
      connections_max_age_mins: default_connections_max_age(),
    }
  }
}

impl CacheConfig {
  pub fn entity_max_age(&self) -> Duration {
    Duration::minutes(self.entity_max_age_mins)
  }

  pub fn profile_max_age(&self) -> Duration {
    Duration::minutes(self.profile_max_age_mins)
  }

  pub fn connections_max_age(&self) -> Duration {
    Duration::minutes(self.connections_max_age_mins)
  }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AlbumConfig {
  #[serde(default = "default_album_size")]
  pub size: u32,
}

fn default_album_size() -> u32 {
  DEFAULT_ALBUM_SIZE
}

impl Default for AlbumConfig {
  fn default() -> Self {
    Self {
      size: default_album_size(),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SyncConfig {
  /// How often queued writes are retried while online
  #[serde(default = "default_sync_interval")]
  pub interval_secs: u64,
  /// How often reachability of the remote endpoint is checked
  #[serde(default = "default_probe_interval")]
  pub probe_interval_secs: u64,
}

fn default_sync_interval() -> u64 {
  60
}

fn default_probe_interval() -> u64 {
  15
}

impl Default for SyncConfig {
  fn default() -> Self {
    Self {
      interval_secs: default_sync_interval(),
      probe_interval_secs: default_probe_interval(),
    }
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./stickersync.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/stickersync/config.yaml
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

    match path {
      Some(p) => Self::load_from_path(&p),
      None => Err(eyre!(
        "No configuration file found. Create one at ~/.config/stickersync/config.yaml"
      )),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("stickersync.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("stickersync").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::parse(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  pub fn parse(contents: &str) -> Result<Self> {
    let config: Config = serde_yaml::from_str(contents).map_err(|e| eyre!("{}", e))?;
    config.validate()?;
    Ok(config)
  }

  fn validate(&self) -> Result<()> {
    if self.album.size == 0 {
      return Err(eyre!("album.size must be at least 1"));
    }
    if self.sync.interval_secs == 0 {
      return Err(eyre!("sync.interval_secs must be at least 1"));
    }
    if self.sync.probe_interval_secs == 0 {
      return Err(eyre!("sync.probe_interval_secs must be at least 1"));
    }

    let max_ages = [
      ("cache.entity_max_age_mins", self.cache.entity_max_age_mins),
      ("cache.profile_max_age_mins", self.cache.profile_max_age_mins),
      ("cache.connections_max_age_mins", self.cache.connections_max_age_mins),
    ];
    for (name, mins) in max_ages {
      if !(0..=MAX_AGE_MINS).contains(&mins) {
        return Err(eyre!("{} must be between 0 and {}", name, MAX_AGE_MINS));
      }
    }
    Ok(())
  }

  /// Get the user session token from the environment, if signed in.
  pub fn get_access_token() -> Option<String> {
    std::env::var("STICKERSYNC_ACCESS_TOKEN").ok()
  }

  /// Get the public API key from the environment.
  pub fn get_anon_key() -> Result<String> {
    std::env::var("STICKERSYNC_ANON_KEY").map_err(|_| {
      eyre!("API key not found. Set remote.anon_key or the STICKERSYNC_ANON_KEY environment variable.")
    })
  }
}
