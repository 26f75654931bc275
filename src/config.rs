//! Configuration loader and validator for the ingestion forwarder.
use reqwest::Url;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::model::{DataFormat, IngestionTarget, ReportLevel};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
    #[error("Missing configuration value: {0}")]
    Missing(&'static str),
    #[error("Missing credential: {0}")]
    MissingCredential(&'static str),
    #[error("Invalid URL for {field}: {reason}")]
    InvalidUrl { field: &'static str, reason: String },
    #[error("HTTP client setup failed: {0}")]
    Client(#[from] reqwest::Error),
}

/// Root configuration struct mirroring the YAML schema.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Config {
    pub ingestion: Ingestion,
    #[serde(default)]
    pub pipeline: Pipeline,
    #[serde(default)]
    pub credentials: CredentialSource,
}

/// Ingestion endpoint and destination table.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Ingestion {
    /// Engine (query) URI of the cluster; the `ingest-` data management host
    /// does not serve the `/v1/rest/ingest` route.
    pub endpoint: String,
    pub database: String,
    pub table: String,
    #[serde(default)]
    pub format: DataFormat,
    #[serde(default)]
    pub mapping: Option<String>,
    #[serde(default = "default_true")]
    pub flush_immediately: bool,
    #[serde(default)]
    pub report_level: ReportLevel,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_authority_host")]
    pub authority_host: String,
}

/// Per-batch submission settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Pipeline {
    #[serde(default = "default_concurrency_limit")]
    pub concurrency_limit: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_base_backoff_ms")]
    pub base_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    /// Batch deadline; 0 disables it.
    #[serde(default)]
    pub deadline_ms: u64,
}

impl Default for Pipeline {
    fn default() -> Self {
        Self {
            concurrency_limit: default_concurrency_limit(),
            max_retries: default_max_retries(),
            base_backoff_ms: default_base_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            deadline_ms: 0,
        }
    }
}

/// Where the ingestion and source credentials are read from.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum CredentialSource {
    #[default]
    Env,
    File { path: PathBuf },
}

fn default_true() -> bool {
    true
}

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_authority_host() -> String {
    "https://login.microsoftonline.com".to_string()
}

fn default_concurrency_limit() -> usize {
    8
}

fn default_max_retries() -> u32 {
    3
}

fn default_base_backoff_ms() -> u64 {
    200
}

fn default_max_backoff_ms() -> u64 {
    5_000
}

impl Config {
    /// Build a configuration from environment variables only.
    pub fn from_env() -> Result<Config, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Config, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let required = |name: &'static str| {
            lookup(name)
                .filter(|v| !v.trim().is_empty())
                .ok_or(ConfigError::Missing(name))
        };
        let mut cfg = Config {
            ingestion: Ingestion {
                endpoint: required("IngestionUri")?,
                database: required("TargetDatabase")?,
                table: required("TargetTable")?,
                format: DataFormat::default(),
                mapping: None,
                flush_immediately: true,
                report_level: ReportLevel::default(),
                request_timeout_secs: default_request_timeout_secs(),
                authority_host: default_authority_host(),
            },
            pipeline: Pipeline::default(),
            credentials: CredentialSource::Env,
        };
        cfg.apply_overrides(lookup)?;
        validate(&cfg)?;
        Ok(cfg)
    }

    /// Apply environment overrides on top of file-provided values.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let set = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());
        if let Some(v) = set("IngestionUri") {
            self.ingestion.endpoint = v;
        }
        if let Some(v) = set("TargetDatabase") {
            self.ingestion.database = v;
        }
        if let Some(v) = set("TargetTable") {
            self.ingestion.table = v;
        }
        if let Some(v) = set("IngestionMapping") {
            self.ingestion.mapping = Some(v);
        }
        if let Some(v) = set("ConcurrencyLimit") {
            self.pipeline.concurrency_limit = v
                .trim()
                .parse()
                .map_err(|_| ConfigError::Invalid("ConcurrencyLimit must be a positive integer"))?;
        }
        if let Some(v) = set("MaxRetries") {
            self.pipeline.max_retries = v
                .trim()
                .parse()
                .map_err(|_| ConfigError::Invalid("MaxRetries must be a non-negative integer"))?;
        }
        Ok(())
    }

    pub fn target(&self) -> IngestionTarget {
        IngestionTarget {
            database: self.ingestion.database.clone(),
            table: self.ingestion.table.clone(),
            format: self.ingestion.format,
            mapping: self.ingestion.mapping.clone(),
        }
    }

    pub fn endpoint_url(&self) -> Result<Url, ConfigError> {
        Url::parse(&self.ingestion.endpoint).map_err(|e| ConfigError::InvalidUrl {
            field: "ingestion.endpoint",
            reason: e.to_string(),
        })
    }

    pub fn deadline(&self) -> Option<Duration> {
        match self.pipeline.deadline_ms {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        }
    }
}

/// Load configuration from a YAML file, apply environment overrides and validate it.
/// - If `path` is None, uses `forwarder.yaml` in the current working directory.
pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
    let path = path.unwrap_or_else(|| Path::new("forwarder.yaml"));
    let content = fs::read_to_string(path)?;
    let mut cfg: Config = serde_yaml::from_str(&content)?;
    cfg.apply_overrides(|name| std::env::var(name).ok())?;
    validate(&cfg)?;
    Ok(cfg)
}

/// Validate a configuration instance.
pub fn validate(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.ingestion.endpoint.trim().is_empty() {
        return Err(ConfigError::Invalid("ingestion.endpoint must be non-empty"));
    }
    let endpoint = cfg.endpoint_url()?;
    if !matches!(endpoint.scheme(), "http" | "https") {
        return Err(ConfigError::Invalid("ingestion.endpoint must be an http(s) URL"));
    }
    Url::parse(&cfg.ingestion.authority_host).map_err(|e| ConfigError::InvalidUrl {
        field: "ingestion.authority_host",
        reason: e.to_string(),
    })?;
    if cfg.ingestion.database.trim().is_empty() {
        return Err(ConfigError::Invalid("ingestion.database must be non-empty"));
    }
    if cfg.ingestion.table.trim().is_empty() {
        return Err(ConfigError::Invalid("ingestion.table must be non-empty"));
    }
    if cfg.ingestion.mapping.as_deref().is_some_and(|m| m.trim().is_empty()) {
        return Err(ConfigError::Invalid("ingestion.mapping must be non-empty when set"));
    }
    if cfg.ingestion.request_timeout_secs == 0 {
        return Err(ConfigError::Invalid("ingestion.request_timeout_secs must be > 0"));
    }

    if cfg.pipeline.concurrency_limit == 0 {
        return Err(ConfigError::Invalid("pipeline.concurrency_limit must be >= 1"));
    }
    if cfg.pipeline.max_retries > 10 {
        return Err(ConfigError::Invalid("pipeline.max_retries must be <= 10"));
    }
    if cfg.pipeline.base_backoff_ms > cfg.pipeline.max_backoff_ms {
        return Err(ConfigError::Invalid(
            "pipeline.base_backoff_ms must not exceed pipeline.max_backoff_ms",
        ));
    }

    if let CredentialSource::File { path } = &cfg.credentials {
        if path.as_os_str().is_empty() {
            return Err(ConfigError::Invalid("credentials.path must be non-empty"));
        }
    }

    Ok(())
}

/// Returns an example YAML configuration.
pub fn example() -> &'static str {
    r#"ingestion:
  endpoint: "https://mycluster.westeurope.kusto.windows.net"
  database: "myDB"
  table: "myTable"
  format: json
  mapping: "myTable_json_mapping"
  flush_immediately: true
  report_level: failures_only

pipeline:
  concurrency_limit: 8
  max_retries: 3
  base_backoff_ms: 200
  max_backoff_ms: 5000

credentials:
  source: env
"#
}
