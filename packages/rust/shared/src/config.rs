//! Application configuration for coursesmith.
//!
//! User config lives at `~/.coursesmith/coursesmith.toml`.
//! CLI flags override config file values, which override defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{CourseError, Result};
use crate::types::GenerationProfile;

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "coursesmith.toml";

/// Default config directory name under the user's home.
const CONFIG_DIR_NAME: &str = ".coursesmith";

// ---------------------------------------------------------------------------
// Config structs (matching coursesmith.toml schema)
// ---------------------------------------------------------------------------

/// Top-level application config, deserialized from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Global defaults.
    #[serde(default)]
    pub defaults: DefaultsConfig,

    /// Model backend settings.
    #[serde(default)]
    pub openai: OpenAiConfig,

    /// Stage execution settings.
    #[serde(default)]
    pub generation: GenerationConfig,

    /// Intake validation policy.
    #[serde(default)]
    pub intake: IntakeConfig,

    /// Reference material ingestion limits.
    #[serde(default)]
    pub ingest: IngestConfig,
}

/// `[defaults]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefaultsConfig {
    /// Directory holding the run database.
    #[serde(default = "default_data_dir")]
    pub data_dir: String,

    /// Pipeline profile used when `new` is not given one.
    #[serde(default)]
    pub profile: GenerationProfile,
}

impl Default for DefaultsConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            profile: GenerationProfile::default(),
        }
    }
}

fn default_data_dir() -> String {
    "~/.coursesmith/runs".into()
}

/// `[openai]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenAiConfig {
    /// Name of the env var holding the API key (never store the key itself).
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,

    /// Model used by the course assistant.
    #[serde(default = "default_model")]
    pub model: String,

    /// Base URL of the Assistants API.
    #[serde(default = "default_base_url")]
    pub base_url: Url,
}

impl Default for OpenAiConfig {
    fn default() -> Self {
        Self {
            api_key_env: default_api_key_env(),
            model: default_model(),
            base_url: default_base_url(),
        }
    }
}

fn default_api_key_env() -> String {
    "OPENAI_API_KEY".into()
}
fn default_model() -> String {
    "gpt-4o-mini".into()
}
fn default_base_url() -> Url {
    Url::parse("https://api.openai.com/v1/").expect("valid default base url")
}

/// `[generation]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationConfig {
    /// Interval between run status polls.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Upper bound on a single stage wait. `0` disables the limit.
    #[serde(default = "default_stage_timeout_secs")]
    pub stage_timeout_secs: u64,

    /// Polls allowed while waiting for a document index to become ready.
    #[serde(default = "default_index_max_polls")]
    pub index_max_polls: u32,

    /// Relative word-count deviation above which a lesson is flagged.
    #[serde(default = "default_word_count_tolerance")]
    pub word_count_tolerance: f64,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            stage_timeout_secs: default_stage_timeout_secs(),
            index_max_polls: default_index_max_polls(),
            word_count_tolerance: default_word_count_tolerance(),
        }
    }
}

fn default_poll_interval_ms() -> u64 {
    1_000
}
fn default_stage_timeout_secs() -> u64 {
    600
}
fn default_index_max_polls() -> u32 {
    120
}
fn default_word_count_tolerance() -> f64 {
    0.2
}

/// `[intake]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntakeConfig {
    /// Require main content or at least one reference file.
    #[serde(default = "default_true")]
    pub require_source_material: bool,
}

impl Default for IntakeConfig {
    fn default() -> Self {
        Self {
            require_source_material: true,
        }
    }
}

fn default_true() -> bool {
    true
}

/// `[ingest]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestConfig {
    /// Cap on concatenated reference text.
    #[serde(default = "default_max_chars")]
    pub max_chars: usize,

    /// Lines captured for a located table of contents, heading included.
    #[serde(default = "default_toc_excerpt_lines")]
    pub toc_excerpt_lines: usize,

    /// Leading lines kept as the content preview.
    #[serde(default = "default_preview_lines")]
    pub preview_lines: usize,

    /// Character cap applied to the preview after the line cut.
    #[serde(default = "default_preview_max_chars")]
    pub preview_max_chars: usize,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            max_chars: default_max_chars(),
            toc_excerpt_lines: default_toc_excerpt_lines(),
            preview_lines: default_preview_lines(),
            preview_max_chars: default_preview_max_chars(),
        }
    }
}

fn default_max_chars() -> usize {
    200_000
}
fn default_toc_excerpt_lines() -> usize {
    20
}
fn default_preview_lines() -> usize {
    250
}
fn default_preview_max_chars() -> usize {
    12_000
}

// ---------------------------------------------------------------------------
// Generation settings (runtime, merged from config + CLI flags)
// ---------------------------------------------------------------------------

/// Runtime stage-execution settings, merged from config file + CLI flags.
#[derive(Debug, Clone)]
pub struct GenerationSettings {
    /// Pipeline profile for new runs.
    pub profile: GenerationProfile,
    /// Fixed interval between status polls.
    pub poll_interval: Duration,
    /// Maximum wait for one stage, if bounded.
    pub stage_timeout: Option<Duration>,
    /// Maximum polls while an index builds.
    pub index_max_polls: u32,
    /// Word-count deviation threshold for lesson details.
    pub word_count_tolerance: f64,
    /// Whether intake requires main content or reference files.
    pub require_source_material: bool,
}

impl Default for GenerationSettings {
    fn default() -> Self {
        Self::from(&AppConfig::default())
    }
}

impl From<&AppConfig> for GenerationSettings {
    fn from(config: &AppConfig) -> Self {
        let timeout = config.generation.stage_timeout_secs;
        Self {
            profile: config.defaults.profile,
            poll_interval: Duration::from_millis(config.generation.poll_interval_ms),
            stage_timeout: (timeout > 0).then(|| Duration::from_secs(timeout)),
            index_max_polls: config.generation.index_max_polls,
            word_count_tolerance: config.generation.word_count_tolerance,
            require_source_material: config.intake.require_source_material,
        }
    }
}

// ---------------------------------------------------------------------------
// Config loading
// ---------------------------------------------------------------------------

/// Get the path to the config directory (`~/.coursesmith/`).
pub fn config_dir() -> Result<PathBuf> {
    let home = dirs::home_dir()
        .ok_or_else(|| CourseError::config("could not determine home directory"))?;
    Ok(home.join(CONFIG_DIR_NAME))
}

/// Get the path to the config file (`~/.coursesmith/coursesmith.toml`).
pub fn config_file_path() -> Result<PathBuf> {
    Ok(config_dir()?.join(CONFIG_FILE_NAME))
}

/// Load the application config from disk. Returns defaults if the file does not exist.
pub fn load_config() -> Result<AppConfig> {
    let path = config_file_path()?;

    if !path.exists() {
        tracing::debug!(?path, "config file not found, using defaults");
        return Ok(AppConfig::default());
    }

    load_config_from(&path)
}

/// Load the application config from a specific file path.
pub fn load_config_from(path: &Path) -> Result<AppConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| CourseError::io(path, e))?;

    toml::from_str(&content)
        .map_err(|e| CourseError::config(format!("failed to parse {}: {e}", path.display())))
}

/// Create the config directory and write a default config file.
/// Returns the path to the created file.
pub fn init_config() -> Result<PathBuf> {
    let dir = config_dir()?;
    std::fs::create_dir_all(&dir).map_err(|e| CourseError::io(&dir, e))?;

    let path = dir.join(CONFIG_FILE_NAME);
    let config = AppConfig::default();
    let content =
        toml::to_string_pretty(&config).map_err(|e| CourseError::config(e.to_string()))?;

    std::fs::write(&path, content).map_err(|e| CourseError::io(&path, e))?;
    tracing::info!(?path, "created default config file");

    Ok(path)
}

/// Read the model credential from the configured env var.
pub fn resolve_api_key(config: &AppConfig) -> Result<String> {
    let var_name = &config.openai.api_key_env;
    match std::env::var(var_name) {
        Ok(val) if !val.is_empty() => Ok(val),
        _ => Err(CourseError::config(format!(
            "OpenAI API key not found. Set the {var_name} environment variable."
        ))),
    }
}
