use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::providers::gitlab::RetryPolicy;
use crate::sync::{SyncSettings, DEFAULT_PAGE_SIZE};
use crate::telemetry::OtlpSettings;

/// Configuration file structure for citrace.
///
/// Every value can also be set from the command line or the environment,
/// which take precedence over the file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Config {
    #[serde(default)]
    pub gitlab: GitLabConfig,

    /// Where spans are shipped
    #[serde(default)]
    pub exporter: ExporterConfig,

    #[serde(default)]
    pub sync: SyncConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct GitLabConfig {
    /// GitLab personal access token
    pub token: Option<String>,

    /// GitLab instance base URL
    #[serde(default = "default_gitlab_base_url")]
    pub base_url: String,

    /// Numeric ids or paths (e.g. 'group/project') of the projects to sync
    #[serde(default)]
    pub project_ids: Vec<String>,

    /// Maximum API calls per second, 0 disables pacing
    #[serde(default = "default_rate_limit")]
    pub rate_limit: u32,

    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ExporterConfig {
    /// OTLP/HTTP collector base URL
    #[serde(default = "default_endpoint")]
    pub endpoint: String,

    /// Extra headers sent with every export request
    #[serde(default)]
    pub headers: BTreeMap<String, String>,

    #[serde(default = "default_service_name")]
    pub service_name: String,

    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    #[serde(default = "default_flush_interval_secs")]
    pub flush_interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct SyncConfig {
    /// Directory holding one cache file per project
    pub cache_dir: Option<PathBuf>,

    /// Seconds to sleep between sweeps
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,

    /// How far back to list pipelines once a project has been synced
    #[serde(default = "default_lookback_days")]
    pub lookback_days: i64,

    /// How far back to list pipelines for a project never synced before
    #[serde(default = "default_max_retention_days")]
    pub max_retention_days: i64,

    #[serde(default = "default_per_page")]
    pub per_page: u32,

    /// Pipelines processed in parallel
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
}

impl Default for GitLabConfig {
    fn default() -> Self {
        Self {
            token: None,
            base_url: default_gitlab_base_url(),
            project_ids: Vec::new(),
            rate_limit: default_rate_limit(),
            max_retries: default_max_retries(),
        }
    }
}

impl Default for ExporterConfig {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            headers: BTreeMap::new(),
            service_name: default_service_name(),
            batch_size: default_batch_size(),
            flush_interval_secs: default_flush_interval_secs(),
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            cache_dir: None,
            interval_secs: default_interval_secs(),
            lookback_days: default_lookback_days(),
            max_retention_days: default_max_retention_days(),
            per_page: default_per_page(),
            concurrency: default_concurrency(),
        }
    }
}

/// Upper bound for listing windows, far beyond GitLab's pipeline retention.
const MAX_WINDOW_DAYS: i64 = 3650;

fn default_gitlab_base_url() -> String {
    "https://gitlab.com".to_string()
}

fn default_rate_limit() -> u32 {
    1
}

fn default_max_retries() -> u32 {
    5
}

fn default_endpoint() -> String {
    "https://api.honeycomb.io".to_string()
}

fn default_service_name() -> String {
    "citrace".to_string()
}

fn default_batch_size() -> usize {
    512
}

fn default_flush_interval_secs() -> u64 {
    5
}

fn default_interval_secs() -> u64 {
    900
}

fn default_lookback_days() -> i64 {
    14
}

fn default_max_retention_days() -> i64 {
    60
}

fn default_per_page() -> u32 {
    DEFAULT_PAGE_SIZE
}

fn default_concurrency() -> usize {
    8
}

impl Config {
    /// Load configuration from a file.
    ///
    /// Searches for configuration files in this order:
    /// 1. Specified path
    /// 2. ./citrace.toml
    /// 3. ./citrace.json
    /// 4. ./citrace.yaml
    /// 5. ./citrace.yml
    ///
    /// Returns default configuration if no file is found.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        if let Some(path) = path {
            return Self::load_from_path(path);
        }

        let candidates = ["citrace.toml", "citrace.json", "citrace.yaml", "citrace.yml"];

        for candidate in &candidates {
            let path = Path::new(candidate);
            if path.exists() {
                return Self::load_from_path(path);
            }
        }

        Ok(Self::default())
    }

    /// Load configuration from a specific file path.
    fn load_from_path(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let extension = path.extension().and_then(|ext| ext.to_str()).unwrap_or("");

        match extension {
            "toml" => toml::from_str(&contents)
                .with_context(|| format!("Failed to parse TOML config: {}", path.display())),
            "json" => serde_json::from_str(&contents)
                .with_context(|| format!("Failed to parse JSON config: {}", path.display())),
            "yaml" | "yml" => serde_yaml::from_str(&contents)
                .with_context(|| format!("Failed to parse YAML config: {}", path.display())),
            _ => toml::from_str(&contents)
                .or_else(|_| serde_json::from_str(&contents))
                .or_else(|_| serde_yaml::from_str(&contents))
                .with_context(|| format!("Failed to parse config file: {}", path.display())),
        }
    }

    /// Checks the values a sync cannot run without.
    pub fn validate(&self) -> Result<()> {
        if self.gitlab.project_ids.is_empty() {
            bail!("no GitLab project configured (set GITLAB_PROJECT_IDS or gitlab.project-ids)");
        }
        if !(1..=100).contains(&self.sync.per_page) {
            bail!("sync.per-page must be between 1 and 100, got {}", self.sync.per_page);
        }
        if self.sync.concurrency == 0 {
            bail!("sync.concurrency must be greater than 0");
        }
        for (key, days) in [
            ("lookback-days", self.sync.lookback_days),
            ("max-retention-days", self.sync.max_retention_days),
        ] {
            if !(1..=MAX_WINDOW_DAYS).contains(&days) {
                bail!("sync.{key} must be between 1 and {MAX_WINDOW_DAYS}, got {days}");
            }
        }
        Ok(())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.gitlab.max_retries,
            ..RetryPolicy::default()
        }
    }

    pub fn otlp_settings(&self) -> OtlpSettings {
        OtlpSettings {
            endpoint: self.exporter.endpoint.clone(),
            headers: self.exporter.headers.clone(),
            service_name: self.exporter.service_name.clone(),
            batch_size: self.exporter.batch_size,
            flush_interval: Duration::from_secs(self.exporter.flush_interval_secs),
        }
    }

    pub fn sync_settings(&self) -> Result<SyncSettings> {
        Ok(SyncSettings {
            project_ids: self.gitlab.project_ids.clone(),
            cache_dir: self.sync.cache_dir()?,
            interval: Duration::from_secs(self.sync.interval_secs),
            lookback: window(self.sync.lookback_days)?,
            max_retention: window(self.sync.max_retention_days)?,
            per_page: self.sync.per_page,
            concurrency: self.sync.concurrency,
        })
    }
}

fn window(days: i64) -> Result<chrono::Duration> {
    chrono::Duration::try_days(days)
        .filter(|window| *window <= chrono::Duration::days(MAX_WINDOW_DAYS))
        .with_context(|| format!("listing window of {days} days is out of range"))
}

impl SyncConfig {
    /// Configured cache directory, or `<user cache dir>/citrace`.
    pub fn cache_dir(&self) -> Result<PathBuf> {
        match &self.cache_dir {
            Some(dir) => Ok(dir.clone()),
            None => dirs::cache_dir()
                .map(|dir| dir.join("citrace"))
                .context("Could not determine cache directory"),
        }
    }
}

/// Parses `key=value` pairs separated by commas, as used by
/// `OTEL_EXPORTER_OTLP_HEADERS`.
pub fn parse_headers(raw: &str) -> Result<BTreeMap<String, String>> {
    let mut headers = BTreeMap::new();

    for pair in raw.split(',').map(str::trim).filter(|pair| !pair.is_empty()) {
        let Some((key, value)) = pair.split_once('=') else {
            bail!("invalid header {pair:?}, expected key=value");
        };
        let key = key.trim();
        if key.is_empty() {
            bail!("invalid header {pair:?}, empty key");
        }
        headers.insert(key.to_string(), value.trim().to_string());
    }

    Ok(headers)
}
