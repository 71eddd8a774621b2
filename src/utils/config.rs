use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::utils::errors::{Result, TranslateError};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub model: ModelConfig,
    pub run: RunOptions,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    pub name: String,
    pub api_key_env: String,
    pub endpoint: String,
    pub request_timeout_secs: u64,
}

/// Per-run knobs. Defaults mirror the config file; callers may clone
/// and override individual fields for a single run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunOptions {
    pub source_lang: String,
    pub target_lang: String,
    pub max_concurrency: usize,
    pub batch_size: usize,
    pub max_chars_per_request: usize,
    pub temperature: f32,
    /// Candidates requested for structurally risky strings; clamped by
    /// the rerank layer.
    pub candidate_count: u32,
    pub max_retries: u32,
    pub adaptive_concurrency: bool,
    pub session_term_memory: bool,
    pub translation_memory: bool,
    pub prompt_cache: bool,
    pub refine_pass: bool,
    pub batch_timeout_secs: u64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            model: ModelConfig::default(),
            run: RunOptions::default(),
        }
    }
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            name: "gemini-2.5-flash".to_string(),
            api_key_env: "MODTRANS_API_KEY".to_string(),
            endpoint: "https://generativelanguage.googleapis.com/v1beta".to_string(),
            request_timeout_secs: 240,
        }
    }
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            source_lang: "english".to_string(),
            target_lang: "korean".to_string(),
            max_concurrency: 4,
            batch_size: 20,
            max_chars_per_request: 9000,
            temperature: 0.2,
            candidate_count: 3,
            max_retries: 4,
            adaptive_concurrency: true,
            session_term_memory: true,
            translation_memory: true,
            prompt_cache: true,
            refine_pass: false,
            batch_timeout_secs: 300,
        }
    }
}

impl AppConfig {
    /// Missing file falls back to defaults; a malformed file is an error.
    pub fn load_or_default(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            tracing::info!(path = %path.display(), "config file not found, using defaults");
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)?;
        let config: AppConfig = toml::from_str(&raw)
            .map_err(|e| TranslateError::Config(format!("{}: {e}", path.display())))?;
        Ok(config)
    }
}
