//! Server configuration.
//!
//! Values come from a TOML file; command-line flags and their environment
//! variables take precedence.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context};
use clap::{Parser, ValueEnum};
use serde::Deserialize;

use coffer_api::RateLimitSettings;

/// Configuration file used when `--config` is not given.
pub const DEFAULT_CONFIG_PATH: &str = "config/coffer.toml";

#[derive(Debug, Parser)]
#[command(name = "coffer-server")]
#[command(about = "Coffer - secrets, approvals, dynamic secrets, KMIP and SSH server")]
#[command(version)]
pub struct Cli {
    /// Configuration file path
    #[arg(short, long, env = "COFFER_CONFIG")]
    pub config: Option<PathBuf>,

    /// Enable development mode (in-memory storage, generated keys, bootstrap admin)
    #[arg(long, env = "COFFER_DEV_MODE")]
    pub dev: bool,

    /// Server bind address
    #[arg(long, env = "COFFER_BIND_ADDRESS")]
    pub bind: Option<String>,

    /// Directory holding the SQLite databases
    #[arg(long, env = "COFFER_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    /// HS256 secret used to sign access tokens
    #[arg(long, env = "COFFER_JWT_SECRET", hide_env_values = true)]
    pub jwt_secret: Option<String>,

    /// Base64-encoded 256-bit root key sealing stored secrets
    #[arg(long, env = "COFFER_ROOT_KEY", hide_env_values = true)]
    pub root_key: Option<String>,

    /// Log output format
    #[arg(long, value_enum, env = "COFFER_LOG_FORMAT")]
    pub log_format: Option<LogFormat>,
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable lines.
    #[default]
    Text,
    /// One JSON object per line.
    Json,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    pub bind: String,
    /// Origins allowed by CORS; empty disables the CORS layer.
    pub cors_origins: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:8080".into(),
            cors_origins: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StorageConfig {
    pub data_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AuthConfig {
    pub jwt_secret: Option<String>,
    pub jwt_issuer: String,
    pub jwt_audience: String,
    /// Lifetime of the admin token minted in dev mode.
    pub dev_token_ttl: String,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            jwt_secret: None,
            jwt_issuer: "coffer".into(),
            jwt_audience: "coffer-api".into(),
            dev_token_ttl: "24h".into(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SecurityConfig {
    pub root_key: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DynamicConfig {
    /// Live leases allowed per dynamic secret.
    pub max_leases: Option<usize>,
    /// How often expired leases are revoked.
    pub reaper_interval: String,
}

impl Default for DynamicConfig {
    fn default() -> Self {
        Self {
            max_leases: None,
            reaper_interval: "30s".into(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LoggingConfig {
    pub format: LogFormat,
    /// `EnvFilter` directives used when `RUST_LOG` is unset.
    pub filter: Option<String>,
}

/// Full server configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub auth: AuthConfig,
    pub security: SecurityConfig,
    pub rate_limits: RateLimitSettings,
    pub dynamic: DynamicConfig,
    pub logging: LoggingConfig,
}

impl Config {
    /// Loads `path`, or the default file when it exists.
    ///
    /// An explicit path that cannot be read is an error; a missing default
    /// file yields the built-in defaults.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let (path, explicit) = match path {
            Some(p) => (p.to_path_buf(), true),
            None => (PathBuf::from(DEFAULT_CONFIG_PATH), false),
        };
        if !explicit && !path.exists() {
            return Ok(Self::default());
        }

        let raw = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        Self::parse(&raw).with_context(|| format!("invalid config file {}", path.display()))
    }

    /// Parses a TOML document.
    pub fn parse(raw: &str) -> anyhow::Result<Self> {
        let config: Self = toml::from_str(raw)?;
        config.reaper_interval()?;
        config.dev_token_ttl()?;
        Ok(config)
    }

    /// Applies command-line overrides.
    pub fn apply(&mut self, cli: &Cli) {
        if let Some(bind) = &cli.bind {
            self.server.bind = bind.clone();
        }
        if let Some(dir) = &cli.data_dir {
            self.storage.data_dir = dir.clone();
        }
        if let Some(secret) = &cli.jwt_secret {
            self.auth.jwt_secret = Some(secret.clone());
        }
        if let Some(key) = &cli.root_key {
            self.security.root_key = Some(key.clone());
        }
        if let Some(format) = cli.log_format {
            self.logging.format = format;
        }
    }

    pub fn reaper_interval(&self) -> anyhow::Result<Duration> {
        parse_duration("dynamic.reaper_interval", &self.dynamic.reaper_interval)
    }

    pub fn dev_token_ttl(&self) -> anyhow::Result<Duration> {
        parse_duration("auth.dev_token_ttl", &self.auth.dev_token_ttl)
    }
}

fn parse_duration(field: &str, value: &str) -> anyhow::Result<Duration> {
    let duration = humantime::parse_duration(value)
        .with_context(|| format!("{} is not a duration: '{}'", field, value))?;
    if duration.is_zero() {
        bail!("{} must be positive", field);
    }
    Ok(duration)
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::parse("").unwrap();
        assert_eq!(config.server.bind, "0.0.0.0:8080");
        assert_eq!(config.rate_limits, RateLimitSettings::default());
        assert_eq!(config.reaper_interval().unwrap(), Duration::from_secs(30));
        assert_eq!(config.logging.format, LogFormat::Text);
    }

    #[test]
    fn test_parse_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("coffer.toml");
        std::fs::write(
            &path,
            r#"
[server]
bind = "127.0.0.1:9000"
cors_origins = ["https://app.coffer.test"]

[storage]
data_dir = "/var/lib/coffer"

[rate_limits]
trust_proxy = true

[rate_limits.secrets]
max_requests = 5
window_secs = 10

[dynamic]
max_leases = 3
reaper_interval = "5m"

[logging]
format = "json"
"#,
        )
        .unwrap();

        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.server.bind, "127.0.0.1:9000");
        assert_eq!(config.server.cors_origins.len(), 1);
        assert_eq!(config.storage.data_dir, PathBuf::from("/var/lib/coffer"));
        assert_eq!(config.rate_limits.secrets.max_requests, 5);
        assert_eq!(config.rate_limits.read, RateLimitSettings::default().read);
        assert!(config.rate_limits.trust_proxy);
        assert_eq!(config.dynamic.max_leases, Some(3));
        assert_eq!(config.reaper_interval().unwrap(), Duration::from_secs(300));
        assert_eq!(config.logging.format, LogFormat::Json);
    }

    #[test]
    fn test_shipped_config_matches_defaults() {
        let config = Config::parse(include_str!("../../../../config/coffer.toml")).unwrap();
        let defaults = Config::default();
        assert_eq!(config.server.bind, defaults.server.bind);
        assert_eq!(config.rate_limits, defaults.rate_limits);
        assert_eq!(config.reaper_interval().unwrap(), Duration::from_secs(30));
        assert!(!config.rate_limits.trust_proxy);
        assert!(config.auth.jwt_secret.is_none());
    }

    #[test]
    fn test_rejects_bad_values() {
        assert!(Config::parse("[server]\nport = 1").is_err());
        assert!(Config::parse("[dynamic]\nreaper_interval = \"soon\"").is_err());
        assert!(Config::parse("[dynamic]\nreaper_interval = \"0s\"").is_err());
    }

    #[test]
    fn test_explicit_missing_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        assert!(Config::load(Some(&dir.path().join("missing.toml"))).is_err());
    }

    #[test]
    fn test_cli_overrides() {
        let cli = Cli::parse_from([
            "coffer-server",
            "--bind",
            "127.0.0.1:1234",
            "--data-dir",
            "/tmp/coffer",
            "--log-format",
            "json",
        ]);
        let mut config = Config::default();
        config.apply(&cli);
        assert_eq!(config.server.bind, "127.0.0.1:1234");
        assert_eq!(config.storage.data_dir, PathBuf::from("/tmp/coffer"));
        assert_eq!(config.logging.format, LogFormat::Json);
        assert!(config.auth.jwt_secret.is_none());
    }
}
