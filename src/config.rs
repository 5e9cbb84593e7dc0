use std::str::FromStr;
use std::sync::LazyLock;
use std::{env, fs, path::Path};

use anyhow::Context as _;
use regex::Regex;
use serde::Deserialize;

pub const DEFAULT_MOCK_ENV_VAR: &str = "SNAPSHOT_MOCK_URL";
pub const DEFAULT_SNAPSHOT_DIR: &str = "./snapshots";
pub const DEFAULT_PROXY_PORT: u16 = 8080;
pub const DEFAULT_STARTUP_TIME_MS: u64 = 2000;
pub const DEFAULT_REPLAY_TIMEOUT_MS: u64 = 5000;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub service: ServiceConfig,
    pub database: DatabaseConfig,
    #[serde(default)]
    pub recording: RecordingConfig,
    #[serde(default)]
    pub replay: ReplayConfig,
    #[serde(default)]
    pub logging: Option<LoggingConfig>,
}

impl Config {
    pub fn from_path(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let toml =
            fs::read_to_string(path).with_context(|| format!("read config {}", path.display()))?;
        Self::from_toml_str(&toml)
    }

    pub fn from_toml_str(toml: &str) -> anyhow::Result<Self> {
        toml.parse()
    }

    /// Connection string for replay, honoring the test-database override.
    pub fn replay_connection_string(&self) -> &str {
        let test_db = self.replay.test_database.connection_string.trim();
        if test_db.is_empty() {
            &self.database.connection_string
        } else {
            test_db
        }
    }

    fn apply_defaults(&mut self) {
        if self.recording.snapshot_dir.trim().is_empty() {
            self.recording.snapshot_dir = DEFAULT_SNAPSHOT_DIR.to_owned();
        }
        if self.recording.proxy_port == 0 {
            self.recording.proxy_port = DEFAULT_PROXY_PORT;
        }
        if self.replay.timeout_ms == 0 {
            self.replay.timeout_ms = DEFAULT_REPLAY_TIMEOUT_MS;
        }
        if self.service.startup_time_ms == 0 {
            self.service.startup_time_ms = DEFAULT_STARTUP_TIME_MS;
        }
        if self.service.mock_env_var.trim().is_empty() {
            self.service.mock_env_var = DEFAULT_MOCK_ENV_VAR.to_owned();
        }
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.service.name.trim().is_empty() {
            anyhow::bail!("`service.name` is required");
        }
        if self.service.base_url.trim().is_empty() {
            anyhow::bail!("`service.base_url` is required");
        }
        if self.database.connection_string.trim().is_empty() {
            anyhow::bail!("`database.connection_string` is required");
        }
        Ok(())
    }

    fn expand_env(&mut self) {
        for value in [
            &mut self.service.name,
            &mut self.service.base_url,
            &mut self.service.command,
            &mut self.service.mock_env_var,
            &mut self.database.connection_string,
            &mut self.recording.snapshot_dir,
            &mut self.recording.proxy_auth_token,
            &mut self.replay.test_database.connection_string,
        ] {
            *value = expand_env_refs(value);
        }
        for list in [
            &mut self.database.tables,
            &mut self.database.namespaces,
            &mut self.recording.ignore_headers,
            &mut self.recording.ignore_fields,
            &mut self.recording.redact_fields,
        ] {
            for value in list.iter_mut() {
                *value = expand_env_refs(value);
            }
        }
    }
}

impl FromStr for Config {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut config: Config = toml::from_str(s).context("parse config TOML")?;
        config.expand_env();
        config.validate()?;
        config.apply_defaults();
        Ok(config)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    pub name: String,
    pub base_url: String,
    #[serde(default)]
    pub command: String,
    #[serde(default)]
    pub startup_time_ms: u64,
    #[serde(default)]
    pub mock_env_var: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    #[serde(rename = "type")]
    pub db_type: DatabaseType,
    pub connection_string: String,
    #[serde(default)]
    pub tables: Vec<String>,
    #[serde(default)]
    pub namespaces: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatabaseType {
    Postgres,
    Mysql,
    Sqlite,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RecordingConfig {
    #[serde(default)]
    pub proxy_port: u16,
    #[serde(default)]
    pub outgoing_proxy_port: u16,
    #[serde(default)]
    pub snapshot_dir: String,
    #[serde(default)]
    pub format: SnapshotFormat,
    #[serde(default)]
    pub ignore_headers: Vec<String>,
    #[serde(default)]
    pub ignore_fields: Vec<String>,
    #[serde(default)]
    pub redact_fields: Vec<String>,
    #[serde(default)]
    pub proxy_auth_token: String,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SnapshotFormat {
    #[default]
    Json,
    #[serde(alias = "yml")]
    Yaml,
}

impl SnapshotFormat {
    pub fn extension(self) -> &'static str {
        match self {
            Self::Json => "json",
            Self::Yaml => "yaml",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default)]
    pub requests_per_second: f64,
    #[serde(default)]
    pub max_concurrent: usize,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ReplayConfig {
    #[serde(default)]
    pub test_database: TestDatabaseConfig,
    #[serde(default)]
    pub strict_mode: bool,
    #[serde(default)]
    pub timeout_ms: u64,
    #[serde(default)]
    pub parallel: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TestDatabaseConfig {
    #[serde(default)]
    pub connection_string: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default)]
    pub level: Option<String>,
    #[serde(default)]
    pub format: Option<LogFormat>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    Pretty,
}

static ENV_REF_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}|\$([A-Za-z_][A-Za-z0-9_]*)")
        .expect("env reference pattern is valid")
});

/// Substitutes `${NAME}` and `$NAME` environment references in a string.
/// Unset variables substitute the empty string.
fn expand_env_refs(value: &str) -> String {
    ENV_REF_PATTERN
        .replace_all(value, |caps: &regex::Captures<'_>| {
            let name = caps
                .get(1)
                .or_else(|| caps.get(2))
                .map(|m| m.as_str())
                .unwrap_or_default();
            env::var(name).unwrap_or_default()
        })
        .into_owned()
}
