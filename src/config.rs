use color_eyre::{eyre::eyre, Result};
use serde::{Deserialize, Deserializer};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::orchestrator::{LoadOptions, DEFAULT_LOAD_TIMEOUT};
use crate::polling::{
  PollingConfig, DEFAULT_FAST_WINDOW, DEFAULT_LONG_INTERVAL, DEFAULT_SHORT_INTERVAL,
};
use crate::session::{SessionConfig, DEFAULT_DEBOUNCE, DEFAULT_SAFETY_TIMEOUT};

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
  pub sync: SyncSection,
  pub polling: PollingSection,
  pub session: SessionSection,
  pub logging: LoggingSection,
  pub simulation: SimulationSection,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SyncSection {
  #[serde(rename = "load_timeout_ms", deserialize_with = "deserialize_millis")]
  pub load_timeout: Duration,
  /// TTL for aggregate data; None keeps entries fresh until overwritten
  #[serde(rename = "default_ttl_ms", deserialize_with = "deserialize_opt_millis")]
  pub default_ttl: Option<Duration>,
}

impl Default for SyncSection {
  fn default() -> Self {
    Self {
      load_timeout: DEFAULT_LOAD_TIMEOUT,
      default_ttl: Some(Duration::from_secs(300)),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PollingSection {
  #[serde(rename = "short_interval_ms", deserialize_with = "deserialize_millis")]
  pub short_interval: Duration,
  #[serde(rename = "long_interval_ms", deserialize_with = "deserialize_millis")]
  pub long_interval: Duration,
  #[serde(rename = "fast_window_ms", deserialize_with = "deserialize_millis")]
  pub fast_window: Duration,
}

impl Default for PollingSection {
  fn default() -> Self {
    Self {
      short_interval: DEFAULT_SHORT_INTERVAL,
      long_interval: DEFAULT_LONG_INTERVAL,
      fast_window: DEFAULT_FAST_WINDOW,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionSection {
  #[serde(rename = "debounce_ms", deserialize_with = "deserialize_millis")]
  pub debounce: Duration,
  #[serde(rename = "safety_timeout_ms", deserialize_with = "deserialize_millis")]
  pub safety_timeout: Duration,
}

impl Default for SessionSection {
  fn default() -> Self {
    Self {
      debounce: DEFAULT_DEBOUNCE,
      safety_timeout: DEFAULT_SAFETY_TIMEOUT,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingSection {
  /// Default filter directive; RUST_LOG takes precedence
  pub level: String,
  /// Also write a daily-rolling log file under the data directory
  pub file: bool,
}

impl Default for LoggingSection {
  fn default() -> Self {
    Self {
      level: "info".to_string(),
      file: false,
    }
  }
}

/// Fixtures and fault injection for the simulated gateway.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SimulationSection {
  #[serde(rename = "latency_ms", deserialize_with = "deserialize_millis")]
  pub latency: Duration,
  /// Every Nth fetch fails with a server error; 0 disables
  pub fail_every: u32,
  /// Resource path to JSON body
  pub resources: BTreeMap<String, serde_json::Value>,
}

impl Default for SimulationSection {
  fn default() -> Self {
    Self {
      latency: Duration::from_millis(300),
      fail_every: 0,
      resources: BTreeMap::new(),
    }
  }
}

fn deserialize_millis<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
  D: Deserializer<'de>,
{
  let ms = u64::deserialize(deserializer)?;
  Ok(Duration::from_millis(ms))
}

fn deserialize_opt_millis<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
where
  D: Deserializer<'de>,
{
  let ms: Option<u64> = Option::deserialize(deserializer)?;
  Ok(ms.map(Duration::from_millis))
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided (must exist)
  /// 2. ./kibble.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/kibble/config.yaml
  ///
  /// Without a file every setting takes its default.
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
      None => {
        tracing::debug!("no config file found, using defaults");
        Ok(Self::default())
      }
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    let local = PathBuf::from("kibble.yaml");
    if local.exists() {
      return Some(local);
    }

    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("kibble").join("config.yaml");
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

  fn parse(contents: &str) -> std::result::Result<Self, serde_yaml::Error> {
    // An empty file deserializes as unit, not an empty mapping
    if contents.trim().is_empty() {
      return Ok(Self::default());
    }
    serde_yaml::from_str(contents)
  }

  pub fn polling_config(&self) -> PollingConfig {
    PollingConfig {
      short_interval: self.polling.short_interval,
      long_interval: self.polling.long_interval,
      fast_window: self.polling.fast_window,
    }
  }

  pub fn session_config(&self) -> SessionConfig {
    SessionConfig {
      debounce: self.session.debounce,
      safety_timeout: self.session.safety_timeout,
    }
  }

  /// Load options for aggregate resources.
  pub fn load_options(&self) -> LoadOptions {
    LoadOptions::default()
      .with_timeout(self.sync.load_timeout)
      .with_ttl(self.sync.default_ttl)
  }
}
