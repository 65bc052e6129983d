//! Configuration management for the story runtime.
//!
//! All knobs come from environment variables with secure, workable defaults;
//! `RuntimeConfig::from_env` is the single place they are read.

use serde::{Deserialize, Serialize};
use std::env;
use thiserror::Error;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {reason}")]
    InvalidValue { key: String, reason: String },
}

/// Main runtime configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// SQLite database path, or `:memory:` for tests.
    pub database_url: String,
    /// API key for the chat-completions endpoint; empty means fake mode.
    #[serde(skip_serializing)]
    pub llm_api_key: String,
    /// Base URL of the chat-completions provider.
    pub llm_base_url: String,
    /// Model identifier sent with every request.
    pub llm_model: String,
    /// Confidence at or above which a mapped choice is accepted directly.
    pub mapping_confidence_high: f64,
    /// Confidence at or above which a rejected mapping downgrades to
    /// LOW_CONF instead of NO_MATCH.
    pub mapping_confidence_low: f64,
    /// Free-input length clamp, in characters.
    pub input_max_chars: usize,
    /// Language the narration prompts ask for.
    pub narration_language: String,
    /// Default forced-fallback threshold when the pack does not set one.
    pub fallback_guard_default_max_consecutive: u32,
    /// Author token; gates debug endpoints when set.
    #[serde(skip_serializing)]
    pub author_api_token: Option<String>,
    /// Player token; gates play endpoints when set.
    #[serde(skip_serializing)]
    pub player_api_token: Option<String>,
    /// External reference of the implicit user when no identity is supplied.
    pub default_user_external_ref: String,
    /// HMAC secret for optional Bearer JWT identities.
    #[serde(skip_serializing)]
    pub jwt_secret: Option<String>,
    /// HTTP bind address.
    pub bind_address: String,
    /// HTTP port.
    pub port: u16,
    /// Allowed CORS origins.
    pub cors_origins: Vec<String>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            database_url: "./fabula.db".to_string(),
            llm_api_key: String::new(),
            llm_base_url: "https://api.openai.com/v1".to_string(),
            llm_model: "gpt-4o-mini".to_string(),
            mapping_confidence_high: 0.75,
            mapping_confidence_low: 0.45,
            input_max_chars: 280,
            narration_language: "English".to_string(),
            fallback_guard_default_max_consecutive: 3,
            author_api_token: None,
            player_api_token: None,
            default_user_external_ref: "demo-player".to_string(),
            jwt_secret: None,
            bind_address: "127.0.0.1".to_string(),
            port: 8000,
            cors_origins: vec![
                "http://localhost:3000".to_string(),
                "http://localhost:3001".to_string(),
            ],
        }
    }
}

impl RuntimeConfig {
    /// Load configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let config = Self {
            database_url: env_string("DATABASE_URL", &defaults.database_url),
            llm_api_key: env_string("LLM_API_KEY", ""),
            llm_base_url: env_string("LLM_BASE_URL", &defaults.llm_base_url),
            llm_model: env_string("LLM_MODEL", &defaults.llm_model),
            mapping_confidence_high: env_parse(
                "STORY_MAPPING_CONFIDENCE_HIGH",
                defaults.mapping_confidence_high,
            )?,
            mapping_confidence_low: env_parse(
                "STORY_MAPPING_CONFIDENCE_LOW",
                defaults.mapping_confidence_low,
            )?,
            input_max_chars: env_parse("STORY_INPUT_MAX_CHARS", defaults.input_max_chars)?,
            narration_language: env_string("STORY_NARRATION_LANGUAGE", &defaults.narration_language),
            fallback_guard_default_max_consecutive: env_parse(
                "STORY_FALLBACK_GUARD_DEFAULT_MAX_CONSECUTIVE",
                defaults.fallback_guard_default_max_consecutive,
            )?,
            author_api_token: env_optional("AUTHOR_API_TOKEN"),
            player_api_token: env_optional("PLAYER_API_TOKEN"),
            default_user_external_ref: env_string(
                "DEFAULT_USER_EXTERNAL_REF",
                &defaults.default_user_external_ref,
            ),
            jwt_secret: env_optional("JWT_SECRET"),
            bind_address: env_string("BIND_ADDRESS", &defaults.bind_address),
            port: env_parse("PORT", defaults.port)?,
            cors_origins: env_list("CORS_ORIGINS", &defaults.cors_origins),
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.database_url.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                key: "DATABASE_URL".to_string(),
                reason: "must not be empty".to_string(),
            });
        }
        for (key, value) in [
            ("STORY_MAPPING_CONFIDENCE_HIGH", self.mapping_confidence_high),
            ("STORY_MAPPING_CONFIDENCE_LOW", self.mapping_confidence_low),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(ConfigError::InvalidValue {
                    key: key.to_string(),
                    reason: format!("{value} is outside [0,1]"),
                });
            }
        }
        if self.input_max_chars == 0 {
            return Err(ConfigError::InvalidValue {
                key: "STORY_INPUT_MAX_CHARS".to_string(),
                reason: "must be positive".to_string(),
            });
        }
        Ok(())
    }

    /// Normalized `(high, low)` confidence thresholds; low never exceeds high.
    pub fn confidence_thresholds(&self) -> (f64, f64) {
        let high = self.mapping_confidence_high.clamp(0.0, 1.0);
        let low = self.mapping_confidence_low.clamp(0.0, 1.0);
        if low > high {
            (low, high)
        } else {
            (high, low)
        }
    }

    /// Whether real model calls are configured.
    pub fn llm_real_mode(&self) -> bool {
        !self.llm_api_key.trim().is_empty()
    }
}

fn env_string(key: &str, default: &str) -> String {
    match env::var(key) {
        Ok(value) if !value.trim().is_empty() => value,
        _ => default.to_string(),
    }
}

fn env_optional(key: &str) -> Option<String> {
    match env::var(key) {
        Ok(value) if !value.trim().is_empty() => Some(value),
        _ => None,
    }
}

fn env_list(key: &str, default: &[String]) -> Vec<String> {
    match env::var(key) {
        Ok(value) if !value.trim().is_empty() => value
            .split(',')
            .map(|item| item.trim().to_string())
            .filter(|item| !item.is_empty())
            .collect(),
        _ => default.to_vec(),
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> Result<T, ConfigError> {
    match env::var(key) {
        Ok(value) if !value.trim().is_empty() => {
            value.trim().parse().map_err(|_| ConfigError::InvalidValue {
                key: key.to_string(),
                reason: format!("cannot parse {value:?}"),
            })
        }
        _ => Ok(default),
    }
}
