//! Configuration loading from TOML files

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use commentline_core::RetryPolicy;
use commentline_pipeline::PipelineConfig;
use serde::Deserialize;

/// Default blob container when `AZURE_BLOB_CONTAINER` is unset
pub const DEFAULT_CONTAINER: &str = "youtube-comments";

/// Global configuration for commentline
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub youtube: YouTubeConfig,
    pub classifier: ClassifierConfig,
    pub store: StoreConfig,
    pub pipeline: PipelineSection,
    pub http: HttpConfig,
    pub state: StateConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct YouTubeConfig {
    #[serde(deserialize_with = "deserialize_env_var")]
    pub api_key: Option<String>,
    pub base_url: String,
    pub include_replies: bool,
    /// Quota units available per UTC day
    pub daily_quota: u64,
}

impl Default for YouTubeConfig {
    fn default() -> Self {
        Self {
            api_key: std::env::var("YOUTUBE_API_KEY").ok(),
            base_url: commentline_youtube::DEFAULT_BASE_URL.to_string(),
            include_replies: false,
            daily_quota: 10_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClassifierConfig {
    #[serde(deserialize_with = "deserialize_env_var")]
    pub api_key: Option<String>,
    pub base_url: String,
    pub model: String,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            api_key: std::env::var("OPENAI_API_KEY").ok(),
            base_url: commentline_openai::DEFAULT_BASE_URL.to_string(),
            model: commentline_openai::DEFAULT_MODEL.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    Fs,
    Azure,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub backend: Backend,
    /// Root directory for the `fs` backend
    pub dir: PathBuf,
    #[serde(deserialize_with = "deserialize_env_var")]
    pub connection_string: Option<String>,
    pub container: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: Backend::Fs,
            dir: PathBuf::from("./data"),
            connection_string: std::env::var("AZURE_STORAGE_CONNECTION_STRING").ok(),
            container: std::env::var("AZURE_BLOB_CONTAINER")
                .unwrap_or_else(|_| DEFAULT_CONTAINER.to_string()),
        }
    }
}

/// `[pipeline]`: the tunables of [`PipelineConfig`]
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PipelineSection {
    pub batch_size: usize,
    pub max_in_flight: usize,
    pub requests_per_second: f64,
    pub burst: u32,
    pub annotate_workers: usize,
    pub write_workers: usize,
    pub fetch_queue: usize,
    pub max_pages_in_flight: usize,
    pub max_batch_retries: u32,
    pub max_comments: Option<usize>,
    pub write_summary: bool,
}

impl Default for PipelineSection {
    fn default() -> Self {
        let d = PipelineConfig::default();
        Self {
            batch_size: d.batch_size,
            max_in_flight: d.max_in_flight,
            requests_per_second: d.requests_per_second,
            burst: d.burst,
            annotate_workers: d.annotate_workers,
            write_workers: d.write_workers,
            fetch_queue: d.fetch_queue,
            max_pages_in_flight: d.max_pages_in_flight,
            max_batch_retries: d.max_batch_retries,
            max_comments: d.max_comments,
            write_summary: d.write_summary,
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    /// Per-request timeout in seconds
    pub timeout: u64,
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_secs: u64,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout: 30,
            max_retries: 5,
            base_delay_ms: 1000,
            max_delay_secs: 60,
        }
    }
}

impl HttpConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout.max(1))
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            base_delay: Duration::from_millis(self.base_delay_ms),
            max_delay: Duration::from_secs(self.max_delay_secs),
            jitter: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct StateConfig {
    /// Checkpoints and the quota ledger; defaults to the user data directory
    pub dir: Option<PathBuf>,
}

/// Deserialize a string that may contain environment variable reference like ${VAR}
fn deserialize_env_var<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let opt: Option<String> = Option::deserialize(deserializer)?;
    Ok(opt.and_then(|s| expand_env_var(&s)))
}

/// Expand ${VAR} to environment variable value
fn expand_env_var(s: &str) -> Option<String> {
    if let Some(var_name) = s.strip_prefix("${").and_then(|s| s.strip_suffix('}')) {
        std::env::var(var_name).ok()
    } else {
        Some(s.to_string())
    }
}

impl Config {
    /// Load configuration from `path`, or from the default locations.
    ///
    /// Search order:
    /// 1. `path` (`--config`)
    /// 2. ./commentline.toml (current directory)
    /// 3. ~/.config/commentline/config.toml
    ///
    /// If no config file found, returns default config.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        if let Some(path) = path {
            return Self::from_file(path);
        }

        let local_config = PathBuf::from("commentline.toml");
        if local_config.exists() {
            return Self::from_file(&local_config);
        }

        if let Some(dirs) = directories::ProjectDirs::from("", "", "commentline") {
            let user_config = dirs.config_dir().join("config.toml");
            if user_config.exists() {
                return Self::from_file(&user_config);
            }
        }

        log::debug!("No config file found, using defaults");
        Ok(Self::default())
    }

    /// Load configuration from a specific file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        log::info!("Loaded config from {}", path.display());
        Ok(config)
    }

    /// Directory for checkpoints and the quota ledger
    pub fn state_dir(&self) -> PathBuf {
        if let Some(dir) = &self.state.dir {
            return dir.clone();
        }
        directories::ProjectDirs::from("", "", "commentline")
            .map(|d| d.data_local_dir().join("state"))
            .unwrap_or_else(|| PathBuf::from(".commentline/state"))
    }

    pub fn pipeline_config(&self) -> PipelineConfig {
        let p = &self.pipeline;
        PipelineConfig {
            batch_size: p.batch_size,
            max_in_flight: p.max_in_flight,
            requests_per_second: p.requests_per_second,
            burst: p.burst,
            annotate_workers: p.annotate_workers,
            write_workers: p.write_workers,
            fetch_queue: p.fetch_queue,
            max_pages_in_flight: p.max_pages_in_flight,
            max_batch_retries: p.max_batch_retries,
            retry: self.http.retry_policy(),
            max_comments: p.max_comments,
            write_summary: p.write_summary,
        }
    }
}
