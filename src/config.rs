use chrono::Duration;
use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::cache::RefreshPolicy;
use crate::category::{Vocabulary, DEFAULT_ALL, DEFAULT_REGIONS, DEFAULT_SENTINEL};

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
  #[serde(default)]
  pub cache: CacheConfig,
  #[serde(default)]
  pub intercept: InterceptConfig,
  #[serde(default)]
  pub vocabulary: VocabularyConfig,
  /// Keys kept warm by the refresh scheduler
  #[serde(default)]
  pub resources: Vec<ResourceConfig>,
  #[serde(default)]
  pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
  /// When false, nothing is persisted and every read goes to the network
  pub enabled: bool,
  /// SQLite database path (defaults to the platform data directory)
  pub path: Option<PathBuf>,
  pub ttl_ms: u64,
  /// Minimum staleness before a stale read schedules a refresh
  pub background_window_ms: u64,
  pub refresh_interval_ms: u64,
  pub privileged_refresh_interval_ms: u64,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      enabled: true,
      path: None,
      ttl_ms: 600_000,
      background_window_ms: 0,
      refresh_interval_ms: 300_000,
      privileged_refresh_interval_ms: 60_000,
    }
  }
}

impl CacheConfig {
  pub fn refresh_interval(&self) -> std::time::Duration {
    std::time::Duration::from_millis(self.refresh_interval_ms)
  }

  pub fn privileged_refresh_interval(&self) -> std::time::Duration {
    std::time::Duration::from_millis(self.privileged_refresh_interval_ms)
  }
}

impl From<&CacheConfig> for RefreshPolicy {
  fn from(config: &CacheConfig) -> Self {
    RefreshPolicy::new(millis(config.ttl_ms))
      .with_background_window(millis(config.background_window_ms))
  }
}

fn millis(ms: u64) -> Duration {
  Duration::milliseconds(i64::try_from(ms).unwrap_or(i64::MAX))
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct InterceptConfig {
  /// Requests whose path contains this fragment are served from cache
  pub path_fragment: String,
  /// Query parameter that forces a refresh
  pub refresh_param: String,
}

impl Default for InterceptConfig {
  fn default() -> Self {
    Self {
      path_fragment: "/api/jobs".to_string(),
      refresh_param: "refresh".to_string(),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct VocabularyConfig {
  /// Record field holding the categories
  pub field: String,
  pub id_field: String,
  pub members: Vec<String>,
  pub sentinel: String,
  pub all: String,
  /// Alternate spelling -> member
  pub aliases: BTreeMap<String, String>,
}

impl Default for VocabularyConfig {
  fn default() -> Self {
    Self {
      field: "region".to_string(),
      id_field: "id".to_string(),
      members: DEFAULT_REGIONS.iter().map(|m| m.to_string()).collect(),
      sentinel: DEFAULT_SENTINEL.to_string(),
      all: DEFAULT_ALL.to_string(),
      aliases: BTreeMap::new(),
    }
  }
}

impl VocabularyConfig {
  pub fn build(&self) -> Result<Vocabulary> {
    let mut vocabulary = Vocabulary::new(&self.members, &self.sentinel, &self.all)?;
    for (alias, member) in &self.aliases {
      vocabulary = vocabulary.with_alias(alias, member)?;
    }
    Ok(vocabulary)
  }
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct ResourceConfig {
  /// Name used on the command line
  pub key: String,
  pub url: String,
  /// Refreshed on the short cadence and never served stale
  #[serde(default)]
  pub privileged: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
  pub level: String,
  /// Write daily-rotated log files here instead of stderr
  pub directory: Option<PathBuf>,
}

impl Default for LoggingConfig {
  fn default() -> Self {
    Self {
      level: "info".to_string(),
      directory: None,
    }
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./hubcache.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/hubcache/config.yaml
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
        "No configuration file found. Create one at ~/.config/hubcache/config.yaml\n\
                 See hubcache.example.yaml for the format."
      )),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("hubcache.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("hubcache").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    let config: Config = serde_yaml::from_str(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))?;

    config
      .validate()
      .map_err(|e| eyre!("Invalid config file {}: {}", path.display(), e))?;
    Ok(config)
  }

  /// Reject values that would stall the scheduler.
  pub fn validate(&self) -> Result<()> {
    if self.cache.refresh_interval_ms == 0 {
      return Err(eyre!("cache.refresh_interval_ms must be greater than zero"));
    }
    if self.cache.privileged_refresh_interval_ms == 0 {
      return Err(eyre!(
        "cache.privileged_refresh_interval_ms must be greater than zero"
      ));
    }
    Ok(())
  }

  pub fn resource(&self, key: &str) -> Result<&ResourceConfig> {
    self
      .resources
      .iter()
      .find(|r| r.key == key)
      .ok_or_else(|| eyre!("Unknown resource '{}'", key))
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::io::Write;

  fn write_config(contents: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(contents.as_bytes()).unwrap();
    file
  }

  #[test]
  fn test_empty_file_uses_defaults() {
    let file = write_config("{}\n");
    let config = Config::load(Some(file.path())).unwrap();

    assert!(config.cache.enabled);
    assert_eq!(config.cache.ttl_ms, 600_000);
    assert_eq!(config.intercept.path_fragment, "/api/jobs");
    assert_eq!(config.vocabulary.members.len(), 7);
    assert!(config.resources.is_empty());
    assert_eq!(config.logging.level, "info");
  }

  #[test]
  fn test_full_config() {
    let file = write_config(
      r#"
cache:
  enabled: false
  ttl_ms: 1000
  background_window_ms: 250
  refresh_interval_ms: 5000
intercept:
  path_fragment: /api/books
vocabulary:
  members: [North, South]
  aliases:
    Northern: North
resources:
  - key: books
    url: https://hub.test/api/books
  - key: admin
    url: https://hub.test/api/books?all=1
    privileged: true
logging:
  level: debug
  directory: /tmp/hubcache-logs
"#,
    );
    let config = Config::load(Some(file.path())).unwrap();

    assert!(!config.cache.enabled);
    assert_eq!(config.cache.refresh_interval(), std::time::Duration::from_secs(5));
    assert_eq!(config.cache.privileged_refresh_interval_ms, 60_000);
    assert_eq!(config.intercept.refresh_param, "refresh");
    assert_eq!(config.resources.len(), 2);
    assert!(config.resource("admin").unwrap().privileged);
    assert!(!config.resource("books").unwrap().privileged);
    assert!(config.resource("missing").is_err());
    assert_eq!(
      config.logging.directory.as_deref(),
      Some(Path::new("/tmp/hubcache-logs"))
    );

    let policy = RefreshPolicy::from(&config.cache);
    assert_eq!(policy.ttl, Duration::milliseconds(1000));
    assert_eq!(policy.background_window, Duration::milliseconds(250));
    assert!(!policy.privileged_bypass);

    let vocabulary = config.vocabulary.build().unwrap();
    assert_eq!(vocabulary.members(), &["North", "South"]);
    assert_eq!(vocabulary.resolve("northern"), Some("North"));
  }

  #[test]
  fn test_bad_alias_rejected() {
    let config = VocabularyConfig {
      aliases: BTreeMap::from([("Mars".to_string(), "Jupiter".to_string())]),
      ..Default::default()
    };
    assert!(config.build().is_err());
  }

  #[test]
  fn test_missing_explicit_path() {
    let dir = tempfile::tempdir().unwrap();
    let err = Config::load(Some(&dir.path().join("nope.yaml"))).unwrap_err();
    assert!(err.to_string().contains("Config file not found"));
  }

  #[test]
  fn test_zero_interval_rejected() {
    let file = write_config("cache:\n  privileged_refresh_interval_ms: 0\n");
    let err = Config::load(Some(file.path())).unwrap_err();
    assert!(err.to_string().contains("privileged_refresh_interval_ms"));

    let file = write_config("cache:\n  refresh_interval_ms: 0\n");
    assert!(Config::load(Some(file.path())).is_err());
  }

  #[test]
  fn test_huge_ttl_loads() {
    let file = write_config("cache:\n  ttl_ms: 9000000000000000\n");
    let config = Config::load(Some(file.path())).unwrap();
    let policy = RefreshPolicy::from(&config.cache);
    assert_eq!(policy.ttl, Duration::milliseconds(9_000_000_000_000_000));
  }

  #[test]
  fn test_invalid_yaml() {
    let file = write_config("cache: [not, a, map]\n");
    let err = Config::load(Some(file.path())).unwrap_err();
    assert!(err.to_string().contains("Failed to parse config file"));
  }
}
