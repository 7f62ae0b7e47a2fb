//! Appliance configuration with environment variable priority
//!
//! Configuration is resolved in this order (first found wins):
//! 1. Environment variables (HUBFLY_*)
//! 2. Config file (hubfly.toml)
//! 3. Default values

use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

/// Environment variable prefix
const ENV_PREFIX: &str = "HUBFLY";

const DEFAULT_BASE_DIR: &str = "/etc/nginx/hubfly";
const DEFAULT_DATA_DIR: &str = "/var/lib/hubfly";
const DEFAULT_WEBROOT: &str = "/var/www/hubfly";
const DEFAULT_STATIC_DIR: &str = "/var/www/hubfly/static";
const DEFAULT_CERT_ROOT: &str = "/etc/letsencrypt/live";
const DEFAULT_PORT_RANGE: (u16, u16) = (30000, 30100);
const DEFAULT_ISSUE_TIMEOUT_SECS: u64 = 45;
const DEFAULT_HISTORY_DEPTH: usize = 5;
const DEFAULT_RECONCILE_INTERVAL_SECS: u64 = 60;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },

    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("Failed to create directory {path:?}: {source}")]
    Layout {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Appliance configuration (parsed from TOML, can be overridden by env)
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct ServerConfig {
    /// Root of generated proxy configuration (live, staging, history, templates)
    pub base_dir: Option<String>,

    /// Where site and stream records are kept
    pub data_dir: Option<String>,

    /// Directory served for ACME HTTP-01 challenges
    pub webroot: Option<String>,

    /// Directory holding the 502/504 error page
    pub static_dir: Option<String>,

    /// Parent of per-domain certificate directories
    pub cert_root: Option<String>,

    /// Previous versions kept per artifact
    pub history_depth: Option<usize>,

    /// Seconds between drift checks in watch mode
    pub reconcile_interval_secs: Option<u64>,

    pub engine: Option<EngineConfig>,

    pub acme: Option<AcmeConfig>,

    pub streams: Option<StreamsConfig>,
}

/// Proxy engine binary settings
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct EngineConfig {
    pub binary: Option<String>,

    /// Main-context lines written before `events {}` in validation configs
    pub preamble: Option<Vec<String>>,
}

/// Certificate authority client settings
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct AcmeConfig {
    pub binary: Option<String>,

    /// Contact address registered with the certificate authority
    pub email: Option<String>,

    pub issue_timeout_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct StreamsConfig {
    /// Inclusive range used for auto-assigned listen ports
    pub port_range: Option<(u16, u16)>,
}

/// Directory layout under `base_dir`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layout {
    pub base_dir: PathBuf,
    pub sites_dir: PathBuf,
    pub streams_dir: PathBuf,
    pub staging_dir: PathBuf,
    pub history_dir: PathBuf,
    pub templates_dir: PathBuf,
    pub cache_dir: PathBuf,
}

impl Layout {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        let base_dir = base_dir.into();
        Self {
            sites_dir: base_dir.join("sites"),
            streams_dir: base_dir.join("streams"),
            staging_dir: base_dir.join("staging"),
            history_dir: base_dir.join("history"),
            templates_dir: base_dir.join("templates"),
            cache_dir: base_dir.join("cache"),
            base_dir,
        }
    }

    /// Create every directory the pipeline writes into
    pub fn ensure_dirs(&self) -> Result<(), ConfigError> {
        let dirs = [
            self.sites_dir.clone(),
            self.streams_dir.clone(),
            self.staging_dir.join("sites"),
            self.staging_dir.join("streams"),
            self.history_dir.join("sites"),
            self.history_dir.join("streams"),
            self.templates_dir.clone(),
        ];
        for path in dirs {
            std::fs::create_dir_all(&path).map_err(|source| ConfigError::Layout {
                path: path.clone(),
                source,
            })?;
        }
        Ok(())
    }
}

/// Fully resolved configuration
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub layout: Layout,
    pub data_dir: PathBuf,
    pub webroot: PathBuf,
    pub static_dir: PathBuf,
    pub cert_root: PathBuf,
    pub engine_binary: String,
    pub engine_preamble: Vec<String>,
    pub acme_binary: String,
    pub acme_email: String,
    pub issue_timeout: Duration,
    pub stream_port_range: (u16, u16),
    pub history_depth: usize,
    pub reconcile_interval: Duration,
}

impl ResolvedConfig {
    /// Self-contained configuration with every path under `root`
    ///
    /// Used for dry runs and tests; nothing here is read from the environment.
    pub fn rooted_at(root: &Path) -> Self {
        Self {
            layout: Layout::new(root.join("conf")),
            data_dir: root.join("data"),
            webroot: root.join("www"),
            static_dir: root.join("www").join("static"),
            cert_root: root.join("certs"),
            engine_binary: "nginx".to_string(),
            engine_preamble: Vec::new(),
            acme_binary: "certbot".to_string(),
            acme_email: String::new(),
            issue_timeout: Duration::from_secs(DEFAULT_ISSUE_TIMEOUT_SECS),
            stream_port_range: DEFAULT_PORT_RANGE,
            history_depth: DEFAULT_HISTORY_DEPTH,
            reconcile_interval: Duration::from_secs(DEFAULT_RECONCILE_INTERVAL_SECS),
        }
    }
}

/// Get environment variable with prefix
fn get_env(name: &str) -> Option<String> {
    env::var(format!("{}_{}", ENV_PREFIX, name)).ok()
}

fn get_env_parsed<T: std::str::FromStr>(name: &str) -> Option<T> {
    get_env(name).and_then(|v| v.parse().ok())
}

fn expand(path: String) -> PathBuf {
    PathBuf::from(shellexpand::tilde(&path).into_owned())
}

impl ServerConfig {
    /// Load configuration from a TOML file
    ///
    /// A missing file yields the defaults; an unreadable or malformed one is an error.
    pub fn load(path: &str) -> Result<Self, ConfigError> {
        if !Path::new(path).exists() {
            tracing::debug!("No config file at {}, using defaults", path);
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_string(),
            source,
        })?;
        let config = toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_string(),
            source,
        })?;
        tracing::info!("Loaded config from {}", path);
        Ok(config)
    }

    /// Resolve configuration from environment variables first, then config file
    pub fn resolve(self) -> Result<ResolvedConfig, ConfigError> {
        // Base dir: ENV > config > default
        let base_dir = get_env("BASE_DIR")
            .or(self.base_dir)
            .unwrap_or_else(|| DEFAULT_BASE_DIR.to_string());

        let data_dir = get_env("DATA_DIR")
            .or(self.data_dir)
            .unwrap_or_else(|| DEFAULT_DATA_DIR.to_string());

        let webroot = get_env("WEBROOT")
            .or(self.webroot)
            .unwrap_or_else(|| DEFAULT_WEBROOT.to_string());

        let static_dir = get_env("STATIC_DIR")
            .or(self.static_dir)
            .unwrap_or_else(|| DEFAULT_STATIC_DIR.to_string());

        let cert_root = get_env("CERT_ROOT")
            .or(self.cert_root)
            .unwrap_or_else(|| DEFAULT_CERT_ROOT.to_string());

        let engine = self.engine.unwrap_or_default();
        let engine_binary = get_env("ENGINE_BINARY")
            .or(engine.binary)
            .unwrap_or_else(|| "nginx".to_string());
        let engine_preamble = engine.preamble.unwrap_or_default();

        let acme = self.acme.unwrap_or_default();
        let acme_binary = get_env("ACME_BINARY")
            .or(acme.binary)
            .unwrap_or_else(|| "certbot".to_string());
        // Contact: ENV > config > empty (certbot then registers without email)
        let acme_email = get_env("ACME_EMAIL").or(acme.email).unwrap_or_default();
        let issue_timeout_secs = get_env_parsed("ACME_ISSUE_TIMEOUT_SECS")
            .or(acme.issue_timeout_secs)
            .unwrap_or(DEFAULT_ISSUE_TIMEOUT_SECS);
        if issue_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "acme.issue_timeout_secs must be greater than zero".to_string(),
            ));
        }

        // Stream port range: ENV > config > default 30000-30100
        let configured_range = self.streams.and_then(|s| s.port_range);
        let port_start = get_env_parsed("STREAM_PORT_START")
            .or(configured_range.map(|r| r.0))
            .unwrap_or(DEFAULT_PORT_RANGE.0);
        let port_end = get_env_parsed("STREAM_PORT_END")
            .or(configured_range.map(|r| r.1))
            .unwrap_or(DEFAULT_PORT_RANGE.1);
        if port_start == 0 || port_start > port_end {
            return Err(ConfigError::Invalid(format!(
                "stream port range {}-{} is empty",
                port_start, port_end
            )));
        }

        let history_depth = get_env_parsed("HISTORY_DEPTH")
            .or(self.history_depth)
            .unwrap_or(DEFAULT_HISTORY_DEPTH);

        let reconcile_interval_secs = get_env_parsed("RECONCILE_INTERVAL_SECS")
            .or(self.reconcile_interval_secs)
            .unwrap_or(DEFAULT_RECONCILE_INTERVAL_SECS)
            .max(1);

        Ok(ResolvedConfig {
            layout: Layout::new(expand(base_dir)),
            data_dir: expand(data_dir),
            webroot: expand(webroot),
            static_dir: expand(static_dir),
            cert_root: expand(cert_root),
            engine_binary,
            engine_preamble,
            acme_binary,
            acme_email,
            issue_timeout: Duration::from_secs(issue_timeout_secs),
            stream_port_range: (port_start, port_end),
            history_depth,
            reconcile_interval: Duration::from_secs(reconcile_interval_secs),
        })
    }

    /// Load config file and resolve with environment variable overrides
    pub fn load_and_resolve(path: &str) -> Result<ResolvedConfig, ConfigError> {
        Self::load(path)?.resolve()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_prefix() {
        assert_eq!(ENV_PREFIX, "HUBFLY");
    }

    #[test]
    fn test_default_config() {
        let config = ServerConfig::default();
        assert!(config.base_dir.is_none());
        assert!(config.engine.is_none());
        assert!(config.streams.is_none());
    }

    #[test]
    fn test_parse_file() {
        let config: ServerConfig = toml::from_str(
            r#"
            base_dir = "/tmp/hubfly"
            history_depth = 3

            [acme]
            email = "ops@example.com"
            issue_timeout_secs = 30

            [streams]
            port_range = [31000, 31010]
            "#,
        )
        .unwrap();
        assert_eq!(config.base_dir.as_deref(), Some("/tmp/hubfly"));
        assert_eq!(config.history_depth, Some(3));
        assert_eq!(
            config.acme.and_then(|a| a.issue_timeout_secs),
            Some(30)
        );
        assert_eq!(
            config.streams.and_then(|s| s.port_range),
            Some((31000, 31010))
        );
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let config = ServerConfig::load("/nonexistent/hubfly.toml").unwrap();
        assert!(config.base_dir.is_none());
    }

    #[test]
    fn test_malformed_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hubfly.toml");
        std::fs::write(&path, "history_depth = \"many\"").unwrap();
        let err = ServerConfig::load(path.to_str().unwrap()).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn test_layout_paths() {
        let layout = Layout::new("/etc/nginx/hubfly");
        assert_eq!(layout.sites_dir, PathBuf::from("/etc/nginx/hubfly/sites"));
        assert_eq!(layout.streams_dir, PathBuf::from("/etc/nginx/hubfly/streams"));
        assert_eq!(
            layout.templates_dir,
            PathBuf::from("/etc/nginx/hubfly/templates")
        );
    }

    #[test]
    fn test_ensure_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let config = ResolvedConfig::rooted_at(dir.path());
        config.layout.ensure_dirs().unwrap();
        assert!(config.layout.staging_dir.join("streams").is_dir());
        assert!(config.layout.history_dir.join("sites").is_dir());
    }
}
