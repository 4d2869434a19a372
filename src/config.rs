//! TOML configuration.
//!
//! ```toml
//! [db]
//! path = "./data/mkb.sqlite"
//!
//! [conflict]
//! top_k = 3
//! search_floor = 0.70
//! similar_threshold = 0.95
//! supplement_threshold = 0.70
//!
//! [embedding]
//! provider = "openai"            # disabled | openai | ollama
//! model = "text-embedding-3-small"
//! dims = 1536
//!
//! [generation]
//! provider = "openai"            # disabled | openai | ollama
//! model = "gpt-4o-mini"
//!
//! [drafting]
//! enforce_grounding = true
//!
//! [retry]
//! max_attempts = 5
//! batch_size = 50
//! ```
//!
//! Every section except `[db]` is optional.

use anyhow::{bail, Context, Result};
use manual_kb_core::params::{EngineParams, DEFAULT_INSTRUCTIONS};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub conflict: ConflictConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub generation: GenerationConfig,
    #[serde(default)]
    pub drafting: DraftingConfig,
    #[serde(default)]
    pub retry: RetryConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ConflictConfig {
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    #[serde(default = "default_search_floor")]
    pub search_floor: f64,
    #[serde(default = "default_similar_threshold")]
    pub similar_threshold: f64,
    #[serde(default = "default_supplement_threshold")]
    pub supplement_threshold: f64,
}

impl Default for ConflictConfig {
    fn default() -> Self {
        Self {
            top_k: default_top_k(),
            search_floor: default_search_floor(),
            similar_threshold: default_similar_threshold(),
            supplement_threshold: default_supplement_threshold(),
        }
    }
}

fn default_top_k() -> usize {
    3
}
fn default_search_floor() -> f64 {
    0.70
}
fn default_similar_threshold() -> f64 {
    0.95
}
fn default_supplement_threshold() -> f64 {
    0.70
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    /// Base URL for Ollama (default `http://localhost:11434`).
    #[serde(default)]
    pub url: Option<String>,
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
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct GenerationConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    /// Base URL for Ollama, or an OpenAI-compatible endpoint.
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_generation_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
            url: None,
            temperature: default_temperature(),
            max_retries: default_max_retries(),
            timeout_secs: default_generation_timeout_secs(),
        }
    }
}

impl GenerationConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

fn default_provider() -> String {
    "disabled".to_string()
}
fn default_max_retries() -> u32 {
    5
}
fn default_timeout_secs() -> u64 {
    30
}
fn default_generation_timeout_secs() -> u64 {
    120
}
fn default_temperature() -> f32 {
    0.0
}

#[derive(Debug, Deserialize, Clone)]
pub struct DraftingConfig {
    #[serde(default = "default_true")]
    pub enforce_grounding: bool,
    /// Replaces the built-in drafting instructions.
    #[serde(default)]
    pub instructions: Option<String>,
}

impl Default for DraftingConfig {
    fn default() -> Self {
        Self {
            enforce_grounding: true,
            instructions: None,
        }
    }
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_retry_batch")]
    pub batch_size: usize,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            batch_size: default_retry_batch(),
        }
    }
}

fn default_max_attempts() -> u32 {
    5
}
fn default_retry_batch() -> usize {
    50
}

impl Config {
    /// Engine tuning derived from the `[conflict]`, `[drafting]` and
    /// `[retry]` sections.
    pub fn engine_params(&self) -> EngineParams {
        EngineParams {
            top_k: self.conflict.top_k,
            search_floor: self.conflict.search_floor,
            similar_threshold: self.conflict.similar_threshold,
            supplement_threshold: self.conflict.supplement_threshold,
            instructions: self
                .drafting
                .instructions
                .clone()
                .unwrap_or_else(|| DEFAULT_INSTRUCTIONS.to_string()),
            retry_max_attempts: self.retry.max_attempts,
        }
    }
}

fn check_provider(section: &str, provider: &str) -> Result<()> {
    match provider {
        "disabled" | "openai" | "ollama" => Ok(()),
        other => bail!(
            "Unknown {} provider: '{}'. Must be disabled, openai, or ollama.",
            section,
            other
        ),
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;

    // Validate conflict thresholds
    let c = &config.conflict;
    if c.top_k == 0 {
        bail!("conflict.top_k must be >= 1");
    }
    for (name, value) in [
        ("search_floor", c.search_floor),
        ("similar_threshold", c.similar_threshold),
        ("supplement_threshold", c.supplement_threshold),
    ] {
        if !(0.0..=1.0).contains(&value) {
            bail!("conflict.{} must be in [0.0, 1.0]", name);
        }
    }
    if c.supplement_threshold > c.similar_threshold {
        bail!("conflict.supplement_threshold must not exceed conflict.similar_threshold");
    }

    // Validate embedding
    check_provider("embedding", &config.embedding.provider)?;
    if config.embedding.is_enabled() {
        if config.embedding.dims.is_none() || config.embedding.dims == Some(0) {
            bail!(
                "embedding.dims must be > 0 when provider is '{}'",
                config.embedding.provider
            );
        }
        if config.embedding.model.is_none() {
            bail!(
                "embedding.model must be specified when provider is '{}'",
                config.embedding.provider
            );
        }
    }

    // Validate generation
    check_provider("generation", &config.generation.provider)?;
    if config.generation.is_enabled() && config.generation.model.is_none() {
        bail!(
            "generation.model must be specified when provider is '{}'",
            config.generation.provider
        );
    }
    if !(0.0..=2.0).contains(&config.generation.temperature) {
        bail!("generation.temperature must be in [0.0, 2.0]");
    }

    // Validate retry
    if config.retry.max_attempts == 0 {
        bail!("retry.max_attempts must be >= 1");
    }
    if config.retry.batch_size == 0 {
        bail!("retry.batch_size must be >= 1");
    }

    Ok(config)
}
