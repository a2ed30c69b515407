//! Configuration loading.
//!
//! Two files configure kbsync:
//!
//! - the application config (TOML, `--app-config`), covering paths, chunking,
//!   the embedding and chat backends, retrieval and the HTTP server;
//! - the scheduler config (JSON, `schedule --config`), covering the
//!   periodic and daily triggers, the file watcher and the log file.
//!
//! Every field has a default except `paths.knowledge_base`.

use anyhow::{bail, Context, Result};
use chrono::NaiveTime;
use serde::Deserialize;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub paths: PathsConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub chat: ChatConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct PathsConfig {
    /// Root directory of the documents to index.
    pub knowledge_base: PathBuf,
    #[serde(default = "default_vector_store")]
    pub vector_store: PathBuf,
    #[serde(default = "default_manifest")]
    pub manifest: PathBuf,
    #[serde(default)]
    pub exclude_globs: Vec<String>,
    #[serde(default)]
    pub follow_symlinks: bool,
}

fn default_vector_store() -> PathBuf {
    PathBuf::from("data/vector_store")
}
fn default_manifest() -> PathBuf {
    PathBuf::from("data/update_manifest.json")
}

impl PathsConfig {
    /// Lock file guarding update cycles: `<vector_store>.lock`.
    pub fn lock_file(&self) -> PathBuf {
        let mut name = OsString::from(self.vector_store.as_os_str());
        name.push(".lock");
        PathBuf::from(name)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "default_chunk_overlap")]
    pub chunk_overlap: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            chunk_overlap: default_chunk_overlap(),
        }
    }
}

fn default_chunk_size() -> usize {
    1000
}
fn default_chunk_overlap() -> usize {
    200
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    /// Base URL for `ollama` or an OpenAI-compatible endpoint.
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
            dims: None,
            url: None,
            batch_size: default_batch_size(),
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_provider() -> String {
    "disabled".to_string()
}
fn default_batch_size() -> usize {
    64
}
fn default_max_retries() -> u32 {
    5
}
fn default_timeout_secs() -> u64 {
    30
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChatConfig {
    /// `ollama` or `openai` (any OpenAI-compatible chat endpoint).
    #[serde(default = "default_chat_provider")]
    pub provider: String,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_chat_model")]
    pub model: String,
    /// Fine-tuned variant served by the same backend, selectable per request.
    #[serde(default)]
    pub adapter_model: Option<String>,
    /// Answer with the adapter model unless a request says otherwise.
    #[serde(default)]
    pub use_adapter: bool,
    #[serde(default)]
    pub temperature: f32,
    #[serde(default = "default_chat_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_chat_retries")]
    pub max_retries: u32,
    /// Generations allowed to run at once; further requests queue.
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            provider: default_chat_provider(),
            url: None,
            model: default_chat_model(),
            adapter_model: None,
            use_adapter: false,
            temperature: 0.0,
            timeout_secs: default_chat_timeout_secs(),
            max_retries: default_chat_retries(),
            max_concurrency: default_max_concurrency(),
        }
    }
}

fn default_chat_provider() -> String {
    "ollama".to_string()
}
fn default_chat_model() -> String {
    "qwen3:4b".to_string()
}
fn default_chat_timeout_secs() -> u64 {
    120
}
fn default_chat_retries() -> u32 {
    2
}
fn default_max_concurrency() -> usize {
    2
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_top_k")]
    pub top_k: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: default_top_k(),
        }
    }
}

fn default_top_k() -> usize {
    5
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:8000".to_string()
}

/// Parse and validate the application config at `path`.
pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate_config(&config)?;
    Ok(config)
}

pub fn validate_config(config: &Config) -> Result<()> {
    // Validate paths
    if !config.paths.knowledge_base.is_dir() {
        bail!(
            "paths.knowledge_base is not a directory: {}",
            config.paths.knowledge_base.display()
        );
    }

    // Validate chunking
    if config.chunking.chunk_size == 0 {
        bail!("chunking.chunk_size must be > 0");
    }
    if config.chunking.chunk_overlap >= config.chunking.chunk_size {
        bail!("chunking.chunk_overlap must be smaller than chunking.chunk_size");
    }

    // Validate retrieval
    if config.retrieval.top_k == 0 {
        bail!("retrieval.top_k must be >= 1");
    }

    // Validate embedding
    match config.embedding.provider.as_str() {
        "disabled" | "openai" | "ollama" | "local" => {}
        other => bail!(
            "Unknown embedding provider: '{}'. Must be disabled, openai, ollama, or local.",
            other
        ),
    }
    if config.embedding.is_enabled()
        && config.embedding.provider != "local"
        && config.embedding.model.is_none()
    {
        bail!(
            "embedding.model must be specified when provider is '{}'",
            config.embedding.provider
        );
    }
    if config.embedding.batch_size == 0 {
        bail!("embedding.batch_size must be > 0");
    }

    // Validate chat
    match config.chat.provider.as_str() {
        "ollama" | "openai" => {}
        other => bail!(
            "Unknown chat provider: '{}'. Must be ollama or openai.",
            other
        ),
    }
    if config.chat.use_adapter && config.chat.adapter_model.is_none() {
        bail!("chat.use_adapter requires chat.adapter_model");
    }
    if config.chat.max_concurrency == 0 {
        bail!("chat.max_concurrency must be >= 1");
    }

    Ok(())
}

// ============ Scheduler config ============

/// One year.
const MAX_INTERVAL_HOURS: f64 = 8760.0;
const MAX_DEBOUNCE: Duration = Duration::from_secs(24 * 3600);

/// Scheduler settings, read from JSON. Missing sections and fields take
/// their defaults individually.
#[derive(Debug, Deserialize, Clone, Default, PartialEq)]
#[serde(default)]
pub struct SchedulerConfig {
    pub scheduled_update: ScheduledUpdateConfig,
    pub file_watch: FileWatchConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct ScheduledUpdateConfig {
    pub enabled: bool,
    /// Period of the interval trigger; `0` disables it.
    pub interval_hours: f64,
    /// Local wall-clock time (`HH:MM`) of the daily trigger; empty or absent disables it.
    pub time: Option<String>,
}

impl Default for ScheduledUpdateConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_hours: 6.0,
            time: Some("02:00".to_string()),
        }
    }
}

impl ScheduledUpdateConfig {
    pub fn interval(&self) -> Option<Duration> {
        if self.interval_hours > 0.0 {
            Duration::try_from_secs_f64(self.interval_hours * 3600.0).ok()
        } else {
            None
        }
    }

    pub fn daily_time(&self) -> Result<Option<NaiveTime>> {
        match self.time.as_deref().map(str::trim) {
            None | Some("") => Ok(None),
            Some(text) => NaiveTime::parse_from_str(text, "%H:%M")
                .map(Some)
                .with_context(|| {
                    format!("scheduled_update.time must be HH:MM, got '{}'", text)
                }),
        }
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct FileWatchConfig {
    pub enabled: bool,
    pub debounce_seconds: f64,
}

impl Default for FileWatchConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            debounce_seconds: 30.0,
        }
    }
}

impl FileWatchConfig {
    pub fn debounce(&self) -> Duration {
        Duration::try_from_secs_f64(self.debounce_seconds.max(0.0)).unwrap_or(MAX_DEBOUNCE)
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    pub enabled: bool,
    pub log_file: PathBuf,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            log_file: PathBuf::from("update_scheduler.log"),
        }
    }
}

impl SchedulerConfig {
    /// Read scheduler settings from `path`, or the defaults when `path` is `None`.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read scheduler config: {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse scheduler config: {}", path.display()))
    }

    pub fn validate(&self) -> Result<()> {
        let hours = self.scheduled_update.interval_hours;
        if !(0.0..=MAX_INTERVAL_HOURS).contains(&hours) {
            bail!(
                "scheduled_update.interval_hours must be between 0 and {}, got {}",
                MAX_INTERVAL_HOURS,
                hours
            );
        }
        self.scheduled_update.daily_time()?;
        let debounce = self.file_watch.debounce_seconds;
        if !(0.0..=MAX_DEBOUNCE.as_secs_f64()).contains(&debounce) {
            bail!(
                "file_watch.debounce_seconds must be between 0 and {}, got {}",
                MAX_DEBOUNCE.as_secs(),
                debounce
            );
        }
        Ok(())
    }
}
