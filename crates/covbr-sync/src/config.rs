use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::FixedOffset;
use covbr_adapters::SourceFormat;
use covbr_core::timestamp::parse_utc_offset;
use covbr_core::DEFAULT_READ_ME;
use covbr_storage::{BackoffPolicy, HttpClientConfig};
use serde::Deserialize;
use tokio::fs;

#[derive(Debug, Clone, Deserialize)]
pub struct SourceRegistry {
    pub sources: Vec<SourceConfig>,
}

impl SourceRegistry {
    pub async fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn from_yaml(text: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(text)?)
    }

    /// The enabled source registered under `source_id`.
    pub fn enabled_source(&self, source_id: &str) -> Result<&SourceConfig> {
        let source = self
            .sources
            .iter()
            .find(|s| s.source_id == source_id)
            .with_context(|| format!("no source registered as {source_id:?}"))?;
        if !source.enabled {
            bail!("source {source_id:?} is disabled in the registry");
        }
        Ok(source)
    }
}

fn default_utc_offset() -> String {
    "-03:00".to_string()
}

fn default_read_me() -> String {
    DEFAULT_READ_ME.to_string()
}

fn default_detail_concurrency() -> usize {
    1
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    pub source_id: String,
    pub display_name: String,
    pub enabled: bool,
    pub format: SourceFormat,
    pub url: String,
    #[serde(default)]
    pub feed_url: Option<String>,
    #[serde(default = "default_utc_offset")]
    pub utc_offset: String,
    #[serde(default = "default_read_me")]
    pub read_me: String,
    #[serde(default)]
    pub topic_keywords: Vec<String>,
    #[serde(default = "default_detail_concurrency")]
    pub max_detail_concurrency: usize,
}

impl SourceConfig {
    pub fn local_offset(&self) -> Result<FixedOffset> {
        parse_utc_offset(&self.utc_offset).with_context(|| {
            format!(
                "source {} has an invalid utc_offset {:?}",
                self.source_id, self.utc_offset
            )
        })
    }

    /// Feed sources fall back to `url` when no separate feed endpoint is configured.
    pub fn feed_url(&self) -> &str {
        self.feed_url.as_deref().unwrap_or(&self.url)
    }
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub workspace_root: PathBuf,
    pub source_id: String,
    pub data_dir: PathBuf,
    pub diagnostics_dir: PathBuf,
    pub reports_dir: PathBuf,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub max_retries: usize,
}

impl SyncConfig {
    pub fn from_env() -> Self {
        let data_dir = std::env::var("COVBR_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./data"));
        Self {
            workspace_root: std::env::var("COVBR_WORKSPACE_ROOT")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(".")),
            source_id: std::env::var("COVBR_SOURCE").unwrap_or_else(|_| "ms-dashboard".to_string()),
            diagnostics_dir: std::env::var("COVBR_DIAGNOSTICS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| data_dir.join("diagnostics")),
            data_dir,
            reports_dir: std::env::var("COVBR_REPORTS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./reports")),
            user_agent: std::env::var("COVBR_USER_AGENT")
                .unwrap_or_else(|_| "covbr-bot/0.1".to_string()),
            http_timeout_secs: std::env::var("COVBR_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(120),
            max_retries: std::env::var("COVBR_MAX_RETRIES")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(3),
        }
    }

    /// Config rooted in one directory; used by tests and offline tooling.
    pub fn rooted_at(root: impl Into<PathBuf>, source_id: impl Into<String>) -> Self {
        let root = root.into();
        Self {
            data_dir: root.join("data"),
            diagnostics_dir: root.join("data").join("diagnostics"),
            reports_dir: root.join("reports"),
            workspace_root: root,
            source_id: source_id.into(),
            user_agent: "covbr-bot/0.1".to_string(),
            http_timeout_secs: 120,
            max_retries: 3,
        }
    }

    pub fn registry_path(&self) -> PathBuf {
        self.workspace_root.join("sources.yaml")
    }

    pub fn raw_dir(&self) -> PathBuf {
        self.data_dir.join("raw")
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            backoff: BackoffPolicy {
                max_retries: self.max_retries,
                ..BackoffPolicy::default()
            },
            ..HttpClientConfig::default()
        }
    }
}
