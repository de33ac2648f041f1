//! LLM integration for taskforce.
//!
//! Supports:
//! - **Anthropic**: Messages API
//! - **OpenAI**: chat completions (and compatible endpoints)
//! - **Gemini**: generateContent
//! - **Scripted**: deterministic replay for tests and dry runs
//!
//! Every backend implements [`LlmProvider`] over the same canonical
//! conversation types, so sessions never know which one they talk to.

pub mod anthropic;
pub mod gemini;
pub mod openai;
pub mod provider;
pub mod scripted;

pub use anthropic::AnthropicProvider;
pub use gemini::GeminiProvider;
pub use openai::OpenAiProvider;
pub use provider::*;
pub use scripted::{ScriptStep, ScriptedProvider};

use std::str::FromStr;
use std::sync::Arc;

use secrecy::{ExposeSecret, SecretString};

use crate::config::{env_opt, env_or};
use crate::error::{ConfigError, LlmError};

/// Supported LLM backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LlmBackend {
    Anthropic,
    OpenAi,
    Gemini,
    Scripted,
}

impl LlmBackend {
    /// Environment variable holding this backend's API key.
    pub fn api_key_env(&self) -> Option<&'static str> {
        match self {
            Self::Anthropic => Some("ANTHROPIC_API_KEY"),
            Self::OpenAi => Some("OPENAI_API_KEY"),
            Self::Gemini => Some("GEMINI_API_KEY"),
            Self::Scripted => None,
        }
    }

    /// Model used when none is configured.
    pub fn default_model(&self) -> &'static str {
        match self {
            Self::Anthropic => "claude-sonnet-4-20250514",
            Self::OpenAi => "gpt-4o",
            Self::Gemini => "gemini-2.0-flash",
            Self::Scripted => "scripted",
        }
    }
}

impl FromStr for LlmBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "anthropic" | "claude" => Ok(Self::Anthropic),
            "openai" => Ok(Self::OpenAi),
            "gemini" | "google" => Ok(Self::Gemini),
            "scripted" | "dry-run" => Ok(Self::Scripted),
            other => Err(format!(
                "unknown backend '{other}' (expected anthropic, openai, gemini or scripted)"
            )),
        }
    }
}

impl std::fmt::Display for LlmBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Anthropic => "anthropic",
            Self::OpenAi => "openai",
            Self::Gemini => "gemini",
            Self::Scripted => "scripted",
        };
        write!(f, "{s}")
    }
}

/// Configuration for creating an LLM provider.
#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub backend: LlmBackend,
    pub api_key: SecretString,
    pub model: String,
    /// Output token limit per call.
    pub max_tokens: u32,
    /// Override of the backend's API base URL.
    pub base_url: Option<String>,
}

impl LlmConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let backend: LlmBackend = env_or("TASKFORCE_LLM_BACKEND", LlmBackend::Anthropic)?;

        let api_key = match backend.api_key_env() {
            Some(var) => env_opt(var).ok_or_else(|| ConfigError::MissingEnvVar(var.to_string()))?,
            None => String::new(),
        };

        Ok(Self {
            backend,
            api_key: SecretString::from(api_key),
            model: env_opt("TASKFORCE_MODEL").unwrap_or_else(|| backend.default_model().to_string()),
            max_tokens: env_or("TASKFORCE_MAX_TOKENS", 4096)?,
            base_url: env_opt("TASKFORCE_LLM_BASE_URL"),
        })
    }
}

/// Create an LLM provider from configuration.
pub fn create_provider(config: &LlmConfig) -> Result<Arc<dyn LlmProvider>, LlmError> {
    if config.backend != LlmBackend::Scripted && config.api_key.expose_secret().is_empty() {
        return Err(LlmError::AuthFailed {
            provider: config.backend.to_string(),
        });
    }

    let provider: Arc<dyn LlmProvider> = match config.backend {
        LlmBackend::Anthropic => {
            let p = AnthropicProvider::new(config.api_key.clone(), &config.model, config.max_tokens);
            Arc::new(match &config.base_url {
                Some(url) => p.with_base_url(url),
                None => p,
            })
        }
        LlmBackend::OpenAi => {
            let p = OpenAiProvider::new(config.api_key.clone(), &config.model, config.max_tokens);
            Arc::new(match &config.base_url {
                Some(url) => p.with_base_url(url),
                None => p,
            })
        }
        LlmBackend::Gemini => {
            let p = GeminiProvider::new(config.api_key.clone(), &config.model, config.max_tokens);
            Arc::new(match &config.base_url {
                Some(url) => p.with_base_url(url),
                None => p,
            })
        }
        LlmBackend::Scripted => Arc::new(ScriptedProvider::new(Vec::new())),
    };

    tracing::info!(
        "Using {} (model: {})",
        config.backend,
        provider.model_name()
    );
    Ok(provider)
}
