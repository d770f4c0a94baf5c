//! Configuration types and loading for repolens.
//!
//! Settings come from an optional TOML or JSON file (picked by extension),
//! then secrets and the data directory may be overridden from the
//! environment. Every section has working defaults so an empty file is a
//! valid configuration.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

pub const ENV_DATA_DIR: &str = "REPOLENS_DATA_DIR";
pub const ENV_QUALITY_GATE_TOKEN: &str = "REPOLENS_QUALITY_GATE_TOKEN";
pub const ENV_CLASSIFIER_API_KEY: &str = "REPOLENS_CLASSIFIER_API_KEY";
pub const ENV_GITHUB_TOKEN: &str = "GITHUB_TOKEN";

pub fn expand_path(raw: impl AsRef<str>) -> PathBuf {
    let s = raw.as_ref();
    match (s.strip_prefix("~/"), std::env::var_os("HOME")) {
        (Some(stripped), Some(home)) => PathBuf::from(home).join(stripped),
        _ => PathBuf::from(s),
    }
}

fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .map(|d| d.join("repolens"))
        .unwrap_or_else(|| expand_path("~/.repolens"))
}

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RepolensConfig {
    /// Root for the sled database
    pub data_dir: PathBuf,
    pub mirror: MirrorConfig,
    pub quality_gate: QualityGateConfig,
    pub scanner: ScannerConfig,
    pub poll: PollConfig,
    pub classifier: ClassifierConfig,
    pub github: GithubConfig,
    pub pipeline: PipelineConfig,
}

impl Default for RepolensConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            mirror: MirrorConfig::default(),
            quality_gate: QualityGateConfig::default(),
            scanner: ScannerConfig::default(),
            poll: PollConfig::default(),
            classifier: ClassifierConfig::default(),
            github: GithubConfig::default(),
            pipeline: PipelineConfig::default(),
        }
    }
}

/// Where working copies live and where they are cloned from.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MirrorConfig {
    pub root: PathBuf,
    /// Prefix for `{clone_base_url}/{full_name}.git`
    pub clone_base_url: String,
}

impl Default for MirrorConfig {
    fn default() -> Self {
        Self {
            root: std::env::temp_dir().join("repolens").join("repositories"),
            clone_base_url: "https://github.com".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QualityGateConfig {
    /// Base URL including the `/api` prefix
    pub host_url: String,
    pub token: Option<String>,
    /// Engine id under which lint issues are imported
    pub lint_engine_id: String,
}

impl Default for QualityGateConfig {
    fn default() -> Self {
        Self {
            host_url: "http://localhost:9000/api".to_string(),
            token: None,
            lint_engine_id: "pmd".to_string(),
        }
    }
}

impl QualityGateConfig {
    /// Host URL as handed to the scanner (without the `/api` suffix).
    pub fn scanner_host_url(&self) -> &str {
        let trimmed = self.host_url.trim_end_matches('/');
        trimmed.strip_suffix("/api").unwrap_or(trimmed)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScannerConfig {
    pub scanner_cmd: String,
    /// Lint tool; `None` skips the lint pass
    pub lint_cmd: Option<String>,
    pub lint_ruleset: String,
    /// Language label the lint tool covers
    pub lint_language: String,
    /// File extensions (without dot) owned by the lint tool
    pub lint_extensions: Vec<String>,
    pub reports_dir: PathBuf,
    /// Extra `-D` style arguments appended to the scanner command
    pub extra_args: Vec<String>,
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            scanner_cmd: "sonar-scanner".to_string(),
            lint_cmd: Some("pmd".to_string()),
            lint_ruleset: "rulesets/java/quickstart.xml".to_string(),
            lint_language: "java".to_string(),
            lint_extensions: vec!["java".to_string()],
            reports_dir: std::env::temp_dir().join("repolens").join("lint"),
            extra_args: Vec::new(),
        }
    }
}

/// Bounds for the quality-gate polling loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PollConfig {
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub max_attempts: u32,
    pub timeout_ms: u64,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            initial_backoff_ms: 2_000,
            max_backoff_ms: 30_000,
            max_attempts: 60,
            timeout_ms: 15 * 60 * 1_000,
        }
    }
}

impl PollConfig {
    pub fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms.max(self.initial_backoff_ms))
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassifierConfig {
    /// Base URL of an OpenAI-compatible API
    pub api_url: String,
    pub api_key: Option<String>,
    pub model: String,
    pub max_tokens: u32,
    pub temperature: f32,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            api_url: "https://api.openai.com/v1".to_string(),
            api_key: None,
            model: "gpt-4o-mini".to_string(),
            max_tokens: 500,
            temperature: 0.3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GithubConfig {
    pub api_url: String,
    pub token: Option<String>,
    /// Upper bound on pages fetched per listing (100 items per page)
    pub max_pages: u32,
}

impl Default for GithubConfig {
    fn default() -> Self {
        Self {
            api_url: "https://api.github.com".to_string(),
            token: None,
            max_pages: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub repository_timeout_secs: u64,
    /// 1 = sequential
    pub parallelism: usize,
    pub freshness_window_days: i64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            repository_timeout_secs: 30 * 60,
            parallelism: 1,
            freshness_window_days: 90,
        }
    }
}

impl PipelineConfig {
    pub fn repository_timeout(&self) -> Duration {
        Duration::from_secs(self.repository_timeout_secs)
    }
}

impl RepolensConfig {
    pub fn with_data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.data_dir = dir.into();
        self
    }

    pub fn with_quality_gate(mut self, host_url: impl Into<String>, token: Option<String>) -> Self {
        self.quality_gate.host_url = host_url.into();
        self.quality_gate.token = token;
        self
    }

    pub fn with_poll(mut self, poll: PollConfig) -> Self {
        self.poll = poll;
        self
    }

    pub fn with_parallelism(mut self, parallelism: usize) -> Self {
        self.pipeline.parallelism = parallelism.max(1);
        self
    }

    /// Apply environment overrides for the data dir and secrets.
    pub fn apply_env(mut self) -> Self {
        if let Some(dir) = std::env::var(ENV_DATA_DIR)
            .ok()
            .filter(|d| !d.trim().is_empty())
        {
            self.data_dir = expand_path(dir);
        }
        if let Ok(token) = std::env::var(ENV_QUALITY_GATE_TOKEN) {
            self.quality_gate.token = Some(token);
        }
        if let Ok(key) = std::env::var(ENV_CLASSIFIER_API_KEY) {
            self.classifier.api_key = Some(key);
        }
        if let Ok(token) = std::env::var(ENV_GITHUB_TOKEN) {
            self.github.token = Some(token);
        }
        self
    }
}

/// Load a config file; a missing file yields `Ok(None)`.
pub fn load_config(path: &Path) -> Result<Option<RepolensConfig>> {
    if !path.exists() {
        return Ok(None);
    }
    let data = fs::read_to_string(path)
        .with_context(|| format!("failed to read config {}", path.display()))?;

    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_ascii_lowercase();

    let mut cfg: RepolensConfig = match ext.as_str() {
        "toml" => toml::from_str(&data)
            .with_context(|| format!("failed to parse toml config {}", path.display()))?,
        _ => serde_json::from_str(&data)
            .with_context(|| format!("failed to parse json config {}", path.display()))?,
    };
    cfg.data_dir = expand_path(cfg.data_dir.to_string_lossy());
    cfg.mirror.root = expand_path(cfg.mirror.root.to_string_lossy());
    cfg.scanner.reports_dir = expand_path(cfg.scanner.reports_dir.to_string_lossy());
    Ok(Some(cfg))
}
