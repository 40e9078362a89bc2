use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::github::catalog::ManifestEntry;

/// Bounds applied to `cache.ttl_minutes`.
pub const MIN_TTL_MINUTES: u32 = 1;
pub const MAX_TTL_MINUTES: u32 = 60;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
  #[serde(default)]
  pub github: GithubConfig,
  #[serde(default)]
  pub cache: CacheConfig,
  #[serde(default)]
  pub sync: SyncConfig,
  /// Inline repository manifest
  #[serde(default)]
  pub repositories: Vec<ManifestEntry>,
  /// Path to a YAML repository manifest (takes precedence over `repositories`)
  pub manifest: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GithubConfig {
  #[serde(default = "default_owner")]
  pub owner: String,
  #[serde(default = "default_api_url")]
  pub api_url: String,
  /// Repository fetched first and shown in anonymous mode
  #[serde(default = "default_repo")]
  pub default_repo: String,
}

impl Default for GithubConfig {
  fn default() -> Self {
    Self {
      owner: default_owner(),
      api_url: default_api_url(),
      default_repo: default_repo(),
    }
  }
}

fn default_owner() -> String {
  "modelearth".to_string()
}

fn default_api_url() -> String {
  "https://api.github.com".to_string()
}

fn default_repo() -> String {
  "projects".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
  #[serde(default = "default_true")]
  pub enabled: bool,
  #[serde(default = "default_ttl_minutes")]
  pub ttl_minutes: u32,
  /// Periodic background refresh (only ever with a credential)
  #[serde(default = "default_true")]
  pub auto_refresh: bool,
  /// SQLite path (default: $XDG_DATA_HOME/issue-sync/cache.db)
  pub path: Option<PathBuf>,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      enabled: true,
      ttl_minutes: default_ttl_minutes(),
      auto_refresh: true,
      path: None,
    }
  }
}

impl CacheConfig {
  /// TTL clamped to the supported range.
  pub fn ttl(&self) -> chrono::Duration {
    let minutes = self.ttl_minutes.clamp(MIN_TTL_MINUTES, MAX_TTL_MINUTES);
    chrono::Duration::minutes(minutes as i64)
  }
}

fn default_true() -> bool {
  true
}

fn default_ttl_minutes() -> u32 {
  10
}

#[derive(Debug, Clone, Deserialize)]
pub struct SyncConfig {
  #[serde(default = "default_per_page")]
  pub per_page: u32,
  /// Pages in flight per repository walk
  #[serde(default = "default_four")]
  pub page_window: usize,
  #[serde(default = "default_four")]
  pub page_concurrency: usize,
  #[serde(default = "default_repo_concurrency")]
  pub repo_concurrency: usize,
  #[serde(default = "default_four")]
  pub count_concurrency: usize,
  /// Issues per presentation page
  #[serde(default = "default_page_size")]
  pub page_size: usize,
  /// List every repository of the owner instead of the known catalog
  #[serde(default)]
  pub discover_all: bool,
  #[serde(default = "default_search_debounce_ms")]
  pub search_debounce_ms: u64,
}

impl Default for SyncConfig {
  fn default() -> Self {
    Self {
      per_page: default_per_page(),
      page_window: default_four(),
      page_concurrency: default_four(),
      repo_concurrency: default_repo_concurrency(),
      count_concurrency: default_four(),
      page_size: default_page_size(),
      discover_all: false,
      search_debounce_ms: default_search_debounce_ms(),
    }
  }
}

fn default_per_page() -> u32 {
  100
}

fn default_four() -> usize {
  4
}

fn default_repo_concurrency() -> usize {
  3
}

fn default_page_size() -> usize {
  10
}

fn default_search_debounce_ms() -> u64 {
  300
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./issue-sync.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/issue-sync/config.yaml
  ///
  /// Every field has a default, so no file at all is fine.
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
      None => Ok(Self::default()),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("issue-sync.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("issue-sync").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::parse(&contents).map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  pub fn parse(contents: &str) -> Result<Self> {
    let config: Config = serde_yaml::from_str(contents).map_err(|e| eyre!("{}", e))?;
    Ok(config)
  }

  /// Get the API token from environment variables.
  ///
  /// Checks ISSUE_SYNC_TOKEN first, then GITHUB_TOKEN as fallback. `None`
  /// means anonymous mode.
  pub fn api_token() -> Option<String> {
    std::env::var("ISSUE_SYNC_TOKEN")
      .or_else(|_| std::env::var("GITHUB_TOKEN"))
      .ok()
      .filter(|t| !t.trim().is_empty())
  }

  /// Directory for logs and the default cache database.
  pub fn data_dir() -> Result<PathBuf> {
    dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .map(|d| d.join("issue-sync"))
      .ok_or_else(|| eyre!("Could not determine data directory"))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_defaults_without_file() {
    let config = Config::parse("{}").unwrap();
    assert_eq!(config.github.owner, "modelearth");
    assert_eq!(config.github.default_repo, "projects");
    assert_eq!(config.github.api_url, "https://api.github.com");
    assert!(config.cache.enabled);
    assert_eq!(config.cache.ttl(), chrono::Duration::minutes(10));
    assert_eq!(config.sync.per_page, 100);
    assert_eq!(config.sync.repo_concurrency, 3);
    assert_eq!(config.sync.page_size, 10);
    assert!(!config.sync.discover_all);
    assert!(config.repositories.is_empty());
  }

  #[test]
  fn test_ttl_is_clamped() {
    let config = Config::parse("cache:\n  ttl_minutes: 600\n").unwrap();
    assert_eq!(config.cache.ttl(), chrono::Duration::minutes(60));
    let config = Config::parse("cache:\n  ttl_minutes: 0\n").unwrap();
    assert_eq!(config.cache.ttl(), chrono::Duration::minutes(1));
  }

  #[test]
  fn test_full_file() {
    let yaml = r#"
github:
  owner: someone
  default_repo: main-repo
sync:
  discover_all: true
  page_window: 2
repositories:
  - name: main-repo
    display_name: Main
  - name: other
"#;
    let config = Config::parse(yaml).unwrap();
    assert_eq!(config.github.owner, "someone");
    assert_eq!(config.github.api_url, "https://api.github.com");
    assert!(config.sync.discover_all);
    assert_eq!(config.sync.page_window, 2);
    assert_eq!(config.sync.page_concurrency, 4);
    assert_eq!(config.repositories.len(), 2);
    assert_eq!(config.repositories[0].display_name.as_deref(), Some("Main"));
  }

  #[test]
  fn test_missing_explicit_path_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    assert!(Config::load(Some(&dir.path().join("nope.yaml"))).is_err());

    let path = dir.path().join("issue-sync.yaml");
    std::fs::write(&path, "github:\n  owner: x\n").unwrap();
    assert_eq!(Config::load(Some(&path)).unwrap().github.owner, "x");
  }
}
