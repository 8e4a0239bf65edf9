use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

use crate::cache::{Generation, Manifest};
use crate::db::{Collection, Store};

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
  /// Origin of the application server
  pub origin: String,
  /// Tag of the cache generation; bump it whenever the manifest changes
  pub cache_version: String,
  pub schema_version: u32,
  pub manifest: ManifestConfig,
  /// Reference datasets refreshed by `refresh`
  pub datasets: Vec<String>,
  pub capability_timeout_ms: u64,
  pub probe_interval_ms: u64,
  pub fetch_timeout_ms: u64,
  /// Location grant of this host, for platforms without a permission prompt
  pub location_granted: bool,
  /// Directory of the database (defaults to the platform data directory)
  pub data_dir: Option<PathBuf>,
  pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ManifestConfig {
  pub static_assets: Vec<String>,
  pub pages: Vec<String>,
  pub external_assets: Vec<String>,
  /// Hosts whose resources are intercepted (case-insensitive)
  #[serde(deserialize_with = "deserialize_lowercase_set")]
  pub allowed_hosts: BTreeSet<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
  /// Directive used when RUST_LOG is unset
  pub filter: Option<String>,
  /// Also write daily log files here
  pub directory: Option<PathBuf>,
}

fn deserialize_lowercase_set<'de, D>(deserializer: D) -> Result<BTreeSet<String>, D::Error>
where
  D: serde::Deserializer<'de>,
{
  let v: Vec<String> = Vec::deserialize(deserializer)?;
  Ok(v.into_iter().map(|s| s.to_lowercase()).collect())
}

impl Default for Config {
  fn default() -> Self {
    Self {
      origin: "http://localhost:5000".to_string(),
      cache_version: "v4".to_string(),
      schema_version: 1,
      manifest: ManifestConfig::default(),
      datasets: Collection::REFERENCE
        .iter()
        .map(|c| c.name().to_string())
        .collect(),
      capability_timeout_ms: 10_000,
      probe_interval_ms: 30_000,
      fetch_timeout_ms: 15_000,
      location_granted: false,
      data_dir: None,
      logging: LoggingConfig::default(),
    }
  }
}

impl Default for ManifestConfig {
  fn default() -> Self {
    let manifest = Manifest::default();
    Self {
      static_assets: manifest.static_assets,
      pages: manifest.pages,
      external_assets: manifest.external_assets,
      allowed_hosts: [
        "fonts.googleapis.com",
        "fonts.gstatic.com",
        "cdnjs.cloudflare.com",
        "cdn.jsdelivr.net",
        "unpkg.com",
      ]
      .into_iter()
      .map(String::from)
      .collect(),
    }
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./aqua-offline.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/aqua-offline/config.yaml
  ///
  /// Without a file the built-in defaults apply. `AQUA_OFFLINE_ORIGIN`
  /// overrides the origin either way.
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

    let mut config = match path {
      Some(p) => Self::load_from_path(&p)?,
      None => Config::default(),
    };
    if let Ok(origin) = std::env::var("AQUA_OFFLINE_ORIGIN") {
      config.origin = origin;
    }
    config.validate()?;
    Ok(config)
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("aqua-offline.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("aqua-offline").join("config.yaml");
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

    Ok(config)
  }

  fn validate(&self) -> Result<()> {
    self.origin_url()?;
    self.dataset_collections()?;
    self.generation()?;
    if self.probe_interval_ms == 0 {
      return Err(eyre!("probe_interval_ms must be greater than zero"));
    }
    if self.fetch_timeout_ms == 0 {
      return Err(eyre!("fetch_timeout_ms must be greater than zero"));
    }
    Ok(())
  }

  pub fn origin_url(&self) -> Result<Url> {
    Url::parse(&self.origin).map_err(|e| eyre!("Invalid origin {:?}: {}", self.origin, e))
  }

  pub fn generation(&self) -> Result<Generation> {
    Ok(Generation::new(self.cache_version.clone())?)
  }

  pub fn manifest(&self) -> Manifest {
    Manifest {
      static_assets: self.manifest.static_assets.clone(),
      pages: self.manifest.pages.clone(),
      external_assets: self.manifest.external_assets.clone(),
    }
  }

  pub fn allowed_hosts(&self) -> Vec<String> {
    self.manifest.allowed_hosts.iter().cloned().collect()
  }

  pub fn dataset_collections(&self) -> Result<Vec<Collection>> {
    self
      .datasets
      .iter()
      .map(|name| match Collection::from_name(name) {
        Some(c) if c.is_reference() => Ok(c),
        _ => Err(eyre!("Unknown dataset: {}", name)),
      })
      .collect()
  }

  pub fn database_path(&self) -> Result<PathBuf> {
    match &self.data_dir {
      Some(dir) => Ok(dir.join("offline.db")),
      None => Ok(Store::default_path()?),
    }
  }

  pub fn capability_timeout(&self) -> Duration {
    Duration::from_millis(self.capability_timeout_ms)
  }

  pub fn probe_interval(&self) -> Duration {
    Duration::from_millis(self.probe_interval_ms)
  }

  pub fn fetch_timeout(&self) -> Duration {
    Duration::from_millis(self.fetch_timeout_ms)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::io::Write;

  #[test]
  fn test_defaults_are_valid() {
    let config = Config::default();
    config.validate().unwrap();
    assert_eq!(config.dataset_collections().unwrap(), Collection::REFERENCE);
    assert_eq!(config.generation().unwrap().to_string(), "v4");
  }

  #[test]
  fn test_partial_file_keeps_defaults() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(
      file,
      "origin: https://aqua.example.org\ncache_version: v5\nmanifest:\n  allowed_hosts: [UNPKG.com]\n"
    )
    .unwrap();

    let config = Config::load(Some(file.path())).unwrap();
    assert_eq!(config.cache_version, "v5");
    assert_eq!(config.allowed_hosts(), vec!["unpkg.com"]);
    assert!(!config.manifest.static_assets.is_empty());
    assert_eq!(config.schema_version, 1);
  }

  #[test]
  fn test_rejects_unknown_dataset() {
    let config = Config {
      datasets: vec!["predictions".into()],
      ..Config::default()
    };
    assert!(config.validate().is_err());
  }

  #[test]
  fn test_rejects_version_with_separator() {
    let config = Config {
      cache_version: "v5-beta".into(),
      ..Config::default()
    };
    assert!(config.validate().is_err());
  }

  #[test]
  fn test_rejects_zero_probe_interval() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "probe_interval_ms: 0").unwrap();
    assert!(Config::load(Some(file.path())).is_err());
  }

  #[test]
  fn test_rejects_zero_fetch_timeout() {
    let config = Config {
      fetch_timeout_ms: 0,
      ..Config::default()
    };
    assert!(config.validate().is_err());
  }

  #[test]
  fn test_missing_explicit_file_is_an_error() {
    assert!(Config::load(Some(Path::new("/nonexistent/aqua-offline.yaml"))).is_err());
  }
}
