//! Configuration loading and management
//!
//! The chassis reads one YAML file, `<config-dir>/cfg.yml`, and looks values up by dotted
//! key (`appkernel.mongo.host`). A missing or mistyped value always resolves to the caller's
//! default.

use anyhow::Result;
use clap::Parser;
use serde::de::DeserializeOwned;
use serde_yaml::Value;
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

use crate::core::error::ConfigError;
use crate::core::query::PageSettings;

/// File name looked up inside the config directory
pub const CONFIG_FILE: &str = "cfg.yml";

/// Directory holding `appkernel.pem` / `appkernel.pub`, relative to the config directory
pub const KEY_DIR: &str = "keys";

/// YAML configuration tree with dotted-key lookup
#[derive(Debug, Clone, Default)]
pub struct Config {
    root: Value,
}

impl Config {
    /// A configuration with no values; every lookup yields its default
    pub fn empty() -> Self {
        Self::default()
    }

    /// Load configuration from a YAML string
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let root: Value = serde_yaml::from_str(yaml)?;
        Ok(Self { root })
    }

    /// Load configuration from a YAML file
    pub fn from_yaml_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&content)
    }

    /// Load `cfg.yml` from the config directory
    ///
    /// A missing file is not an error: the chassis runs on defaults.
    pub fn load(config_dir: &Path) -> Result<Self, ConfigError> {
        let path = config_dir.join(CONFIG_FILE);
        if !path.exists() {
            tracing::warn!(path = %path.display(), "no configuration file; using defaults");
            return Ok(Self::empty());
        }
        let config = Self::from_yaml_file(&path).map_err(|e| ConfigError::ParseError {
            file: Some(path.display().to_string()),
            message: e.to_string(),
        })?;
        tracing::info!(path = %path.display(), "configuration loaded");
        Ok(config)
    }

    fn node(&self, dotted: &str) -> Option<&Value> {
        dotted
            .split('.')
            .try_fold(&self.root, |node, segment| match node {
                Value::Mapping(map) => map.get(segment),
                _ => None,
            })
            .filter(|node| !node.is_null())
    }

    pub fn contains(&self, dotted: &str) -> bool {
        self.node(dotted).is_some()
    }

    /// Value at the dotted key, if present and of the requested type
    pub fn get_opt<T: DeserializeOwned>(&self, dotted: &str) -> Option<T> {
        let node = self.node(dotted)?.clone();
        match serde_yaml::from_value(node) {
            Ok(value) => Some(value),
            Err(e) => {
                tracing::warn!(key = dotted, error = %e, "ignoring mistyped configuration value");
                None
            }
        }
    }

    /// Value at the dotted key, or `default`
    pub fn get<T: DeserializeOwned>(&self, dotted: &str, default: T) -> T {
        self.get_opt(dotted).unwrap_or(default)
    }
}

/// Connection parameters of the document store
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MongoSettings {
    pub host: String,
    pub port: u16,
    pub db: String,
}

impl MongoSettings {
    pub fn uri(&self) -> String {
        if self.host.starts_with("mongodb://") || self.host.starts_with("mongodb+srv://") {
            self.host.clone()
        } else {
            format!("mongodb://{}:{}", self.host, self.port)
        }
    }
}

/// Log file parameters; reported at start-up, files are not rotated by the chassis
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggingSettings {
    pub file_name: String,
    pub max_size: u64,
    pub backup_count: u32,
}

/// Typed view of the well-known `appkernel.*` keys
#[derive(Debug, Clone)]
pub struct ChassisSettings {
    pub address: String,
    /// URL prefix of every generated route, without trailing slash
    pub base_url: String,
    pub security_enabled: bool,
    pub token_lifetime_secs: i64,
    pub hateoas: bool,
    pub page: PageSettings,
    pub languages: Vec<String>,
    pub mongo: MongoSettings,
    pub logging: LoggingSettings,
    pub development: bool,
}

impl Default for ChassisSettings {
    fn default() -> Self {
        Self::from_config(&Config::empty(), false)
    }
}

impl ChassisSettings {
    pub fn from_config(config: &Config, development: bool) -> Self {
        let defaults = PageSettings::default();
        let base_url: String = config.get("appkernel.server.base_url", String::new());
        Self {
            address: config.get("appkernel.server.address", "0.0.0.0:5000".to_string()),
            base_url: normalize_base_url(&base_url),
            security_enabled: config.get("appkernel.security.enabled", false),
            token_lifetime_secs: config.get("appkernel.security.token_lifetime_secs", 3600),
            hateoas: config.get("appkernel.hateoas", true),
            page: PageSettings {
                default_size: config.get("appkernel.page_size.default", defaults.default_size),
                max_size: config.get("appkernel.page_size.max", defaults.max_size),
            },
            languages: config.get(
                "appkernel.i18n.languages",
                vec!["en-US".to_string()],
            ),
            mongo: MongoSettings {
                host: config.get("appkernel.mongo.host", "localhost".to_string()),
                port: config.get("appkernel.mongo.port", 27017),
                db: config.get("appkernel.mongo.db", "appkernel".to_string()),
            },
            logging: LoggingSettings {
                file_name: config.get("appkernel.logging.file_name", "app.log".to_string()),
                max_size: config.get("appkernel.logging.max_size", 5_242_880),
                backup_count: config.get("appkernel.logging.backup_count", 3),
            },
            development,
        }
    }
}

/// `"/api/"` and `"api"` both become `"/api"`; empty stays empty
fn normalize_base_url(raw: &str) -> String {
    let trimmed = raw.trim().trim_matches('/');
    if trimmed.is_empty() {
        String::new()
    } else {
        format!("/{}", trimmed)
    }
}

/// Command line flags of a chassis process
#[derive(Debug, Clone, Default, Parser)]
#[command(name = "appkernel", about = "Run an appkernel service")]
pub struct ChassisOptions {
    /// Directory holding cfg.yml and the keys/ folder
    #[arg(short = 'c', long = "config-dir", env = "APPKERNEL_CONFIG_DIR")]
    pub config_dir: Option<PathBuf>,

    /// Working directory of the process
    #[arg(short = 'w', long = "working-dir")]
    pub working_dir: Option<PathBuf>,

    /// Development mode: verbose logging
    #[arg(short = 'd', long = "development")]
    pub development: bool,
}

impl ChassisOptions {
    /// Config directory, falling back to the executable's directory
    pub fn config_dir(&self) -> PathBuf {
        self.config_dir.clone().unwrap_or_else(executable_dir)
    }

    pub fn working_dir(&self) -> PathBuf {
        self.working_dir.clone().unwrap_or_else(executable_dir)
    }

    pub fn key_dir(&self) -> PathBuf {
        self.config_dir().join(KEY_DIR)
    }
}

fn executable_dir() -> PathBuf {
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(Path::to_path_buf))
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Install the global fmt subscriber; `RUST_LOG` wins over the mode default
pub fn init_logging(development: bool) {
    let fallback = if development { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));
    if tracing_subscriber::fmt()
        .with_env_filter(filter)
        .try_init()
        .is_err()
    {
        tracing::debug!("a global subscriber is already installed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const YAML: &str = r#"
appkernel:
  mongo:
    host: db.local
    db: shop
  i18n:
    languages: [en-US, de-DE]
  server:
    base_url: /api/
  page_size:
    max: 20
  logging:
    max_size: not-a-number
"#;

    #[test]
    fn test_dotted_lookup_and_defaults() {
        let config = Config::from_yaml_str(YAML).unwrap();
        assert_eq!(config.get("appkernel.mongo.host", String::new()), "db.local");
        assert_eq!(config.get("appkernel.mongo.port", 27017u16), 27017);
        assert!(config.contains("appkernel.i18n"));
        assert!(!config.contains("appkernel.missing.section"));
        assert_eq!(config.get_opt::<String>("appkernel.nope"), None);
    }

    #[test]
    fn test_mistyped_value_falls_back_to_default() {
        let config = Config::from_yaml_str(YAML).unwrap();
        assert_eq!(config.get("appkernel.logging.max_size", 42u64), 42);
    }

    #[test]
    fn test_settings_from_config() {
        let config = Config::from_yaml_str(YAML).unwrap();
        let settings = ChassisSettings::from_config(&config, true);
        assert_eq!(settings.base_url, "/api");
        assert_eq!(settings.languages, vec!["en-US", "de-DE"]);
        assert_eq!(settings.page.max_size, 20);
        assert_eq!(settings.page.default_size, PageSettings::default().default_size);
        assert_eq!(settings.mongo.uri(), "mongodb://db.local:27017");
        assert_eq!(settings.mongo.db, "shop");
        assert!(!settings.security_enabled);
        assert!(settings.development);
    }

    #[test]
    fn test_load_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load(dir.path()).unwrap();
        assert!(!config.contains("appkernel"));
    }

    #[test]
    fn test_load_reports_parse_errors() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(CONFIG_FILE), "appkernel: [unclosed").unwrap();
        let err = Config::load(dir.path()).unwrap_err();
        assert!(matches!(err, ConfigError::ParseError { .. }));
    }

    #[test]
    fn test_cli_flags() {
        let options =
            ChassisOptions::try_parse_from(["svc", "-c", "/etc/svc", "-d"]).unwrap();
        assert_eq!(options.config_dir(), PathBuf::from("/etc/svc"));
        assert_eq!(options.key_dir(), PathBuf::from("/etc/svc/keys"));
        assert!(options.development);
        assert!(options.working_dir.is_none());
    }
}
