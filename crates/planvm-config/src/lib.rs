//! Environment configuration.
//!
//! All settings come from environment variables; the process reads them once
//! at startup and the resulting [`Config`] is immutable afterwards.
//! `MODEL_CONFIGS` may carry a JSON object overriding endpoint options per
//! model name.

use std::collections::HashMap;
use std::env;

use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Which wire protocol a provider speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provider {
    OpenAi,
    Ollama,
}

impl Provider {
    fn parse(raw: &str) -> Result<Self, ConfigError> {
        match raw.to_ascii_lowercase().as_str() {
            "openai" => Ok(Provider::OpenAi),
            "ollama" => Ok(Provider::Ollama),
            other => Err(ConfigError::Invalid(format!(
                "unknown LLM provider '{}'",
                other
            ))),
        }
    }
}

/// One resolved model endpoint.
#[derive(Debug, Clone)]
pub struct ModelEndpoint {
    pub provider: Provider,
    pub model: String,
    pub base_url: String,
    pub api_key: Option<String>,
    pub temperature: f32,
}

/// Per-model overrides accepted in `MODEL_CONFIGS`.
#[derive(Debug, Clone, Default, Deserialize)]
struct ModelOverride {
    #[serde(default)]
    base_url: Option<String>,
    #[serde(default)]
    api_key: Option<String>,
    #[serde(default)]
    temperature: Option<f32>,
}

/// Storage backend selection, derived from `DATABASE_URI`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreBackend {
    /// Filesystem store rooted at `PLANVM_STORE_ROOT`.
    Filesystem(String),
    /// Postgres store at the given URI.
    Postgres(String),
}

/// Full engine configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Standard model used by `llm_generate`.
    pub standard: ModelEndpoint,
    /// Reasoning model used for plan generation and conditional jumps.
    pub reasoning: ModelEndpoint,
    /// Evaluation model, reserved for external plan evaluators.
    pub evaluation: ModelEndpoint,
    pub store: StoreBackend,
    pub autoflow_base_url: String,
    pub autoflow_api_key: Option<String>,
    pub kb_id: Option<String>,
    pub cors_origins: Vec<String>,
    pub max_recovery_attempts: u32,
    pub max_validation_retries: u32,
    pub tool_call_timeout_secs: u64,
}

const DEFAULT_STORE_ROOT: &str = "/tmp/planvm/tasks";
const DEFAULT_AUTOFLOW_BASE_URL: &str = "https://tidb.ai";

impl Config {
    /// Read configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Read configuration from an arbitrary key lookup (tests inject maps).
    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let overrides: HashMap<String, ModelOverride> = match get("MODEL_CONFIGS") {
            Some(raw) => serde_json::from_str(&raw)
                .map_err(|e| ConfigError::Invalid(format!("MODEL_CONFIGS is not valid JSON: {}", e)))?,
            None => HashMap::new(),
        };

        let default_provider = get("LLM_PROVIDER").unwrap_or_else(|| "openai".to_string());
        let default_model = get("LLM_MODEL").unwrap_or_else(|| "gpt-4o-mini".to_string());

        let standard = resolve_endpoint(&get, &overrides, &default_provider, &default_model)?;
        let reasoning = resolve_named_endpoint(
            &get,
            &overrides,
            "REASON_LLM_PROVIDER",
            "REASON_LLM_MODEL",
            &default_provider,
            &default_model,
        )?;
        let evaluation = resolve_named_endpoint(
            &get,
            &overrides,
            "EVALUATION_LLM_PROVIDER",
            "EVALUATION_LLM_MODEL",
            &default_provider,
            &default_model,
        )?;

        let store = match get("DATABASE_URI") {
            Some(uri) if !uri.trim().is_empty() => StoreBackend::Postgres(uri),
            _ => StoreBackend::Filesystem(
                get("PLANVM_STORE_ROOT").unwrap_or_else(|| DEFAULT_STORE_ROOT.to_string()),
            ),
        };

        let cors_origins = get("BACKEND_CORS_ORIGINS")
            .map(|raw| {
                raw.split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect()
            })
            .unwrap_or_default();

        let config = Self {
            standard,
            reasoning,
            evaluation,
            store,
            autoflow_base_url: get("AUTOFLOW_BASE_URL")
                .unwrap_or_else(|| DEFAULT_AUTOFLOW_BASE_URL.to_string()),
            autoflow_api_key: get("AUTOFLOW_API_KEY"),
            kb_id: get("KB_ID"),
            cors_origins,
            max_recovery_attempts: parse_number(&get, "MAX_RECOVERY_ATTEMPTS", 3)?,
            max_validation_retries: parse_number(&get, "MAX_VALIDATION_RETRIES", 2)?,
            tool_call_timeout_secs: parse_number(&get, "TOOL_CALL_TIMEOUT_SECONDS", 300)?,
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.tool_call_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "TOOL_CALL_TIMEOUT_SECONDS must be > 0".to_string(),
            ));
        }
        for endpoint in [&self.standard, &self.reasoning, &self.evaluation] {
            if endpoint.model.trim().is_empty() {
                return Err(ConfigError::Invalid("model name must not be empty".to_string()));
            }
            if endpoint.provider == Provider::OpenAi && endpoint.api_key.is_none() {
                return Err(ConfigError::Invalid(format!(
                    "OPENAI_API_KEY is required for model '{}'",
                    endpoint.model
                )));
            }
        }
        Ok(())
    }
}

fn parse_number<T: std::str::FromStr>(
    get: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
) -> Result<T, ConfigError> {
    match get(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid(format!("{} must be a number, got '{}'", key, raw))),
        None => Ok(default),
    }
}

fn resolve_named_endpoint(
    get: &impl Fn(&str) -> Option<String>,
    overrides: &HashMap<String, ModelOverride>,
    provider_key: &str,
    model_key: &str,
    default_provider: &str,
    default_model: &str,
) -> Result<ModelEndpoint, ConfigError> {
    let provider = get(provider_key).unwrap_or_else(|| default_provider.to_string());
    let model = get(model_key).unwrap_or_else(|| default_model.to_string());
    resolve_endpoint(get, overrides, &provider, &model)
}

fn resolve_endpoint(
    get: &impl Fn(&str) -> Option<String>,
    overrides: &HashMap<String, ModelOverride>,
    provider_raw: &str,
    model: &str,
) -> Result<ModelEndpoint, ConfigError> {
    let provider = Provider::parse(provider_raw)?;
    let (base_url, api_key) = match provider {
        Provider::OpenAi => (
            get("OPENAI_BASE_URL").unwrap_or_else(|| "https://api.openai.com/v1".to_string()),
            get("OPENAI_API_KEY"),
        ),
        Provider::Ollama => (
            get("OLLAMA_BASE_URL").unwrap_or_else(|| "http://localhost:11434".to_string()),
            None,
        ),
    };
    let mut endpoint = ModelEndpoint {
        provider,
        model: model.to_string(),
        base_url,
        api_key,
        temperature: 0.2,
    };
    if let Some(overridden) = overrides.get(model) {
        if let Some(base_url) = &overridden.base_url {
            endpoint.base_url = base_url.clone();
        }
        if let Some(api_key) = &overridden.api_key {
            endpoint.api_key = Some(api_key.clone());
        }
        if let Some(temperature) = overridden.temperature {
            endpoint.temperature = temperature;
        }
    }
    Ok(endpoint)
}

impl ModelEndpoint {
    /// Chat-completions URL for this endpoint.
    pub fn chat_url(&self) -> String {
        let base = self.base_url.trim_end_matches('/');
        match self.provider {
            Provider::OpenAi => format!("{}/chat/completions", base),
            Provider::Ollama => format!("{}/v1/chat/completions", base),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lookup<'a>(pairs: &'a [(&'a str, &'a str)]) -> impl Fn(&str) -> Option<String> + 'a {
        move |key| {
            pairs
                .iter()
                .find(|(k, _)| *k == key)
                .map(|(_, v)| v.to_string())
        }
    }

    #[test]
    fn test_defaults_fall_back_to_filesystem_store() {
        let config = Config::from_lookup(lookup(&[
            ("LLM_PROVIDER", "ollama"),
            ("LLM_MODEL", "llama3"),
        ]))
        .unwrap();
        assert_eq!(
            config.store,
            StoreBackend::Filesystem(DEFAULT_STORE_ROOT.to_string())
        );
        assert_eq!(config.max_recovery_attempts, 3);
        assert_eq!(config.max_validation_retries, 2);
        assert_eq!(config.tool_call_timeout_secs, 300);
    }

    #[test]
    fn test_database_uri_selects_postgres() {
        let config = Config::from_lookup(lookup(&[
            ("LLM_PROVIDER", "ollama"),
            ("LLM_MODEL", "llama3"),
            ("DATABASE_URI", "postgres://localhost/planvm"),
        ]))
        .unwrap();
        assert_eq!(
            config.store,
            StoreBackend::Postgres("postgres://localhost/planvm".to_string())
        );
    }

    #[test]
    fn test_openai_requires_api_key() {
        let err = Config::from_lookup(lookup(&[
            ("LLM_PROVIDER", "openai"),
            ("LLM_MODEL", "gpt-4o-mini"),
        ]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(msg) if msg.contains("OPENAI_API_KEY")));
    }

    #[test]
    fn test_reasoning_model_falls_back_to_standard() {
        let config = Config::from_lookup(lookup(&[
            ("LLM_PROVIDER", "ollama"),
            ("LLM_MODEL", "llama3"),
            ("REASON_LLM_MODEL", "deepseek-r1"),
        ]))
        .unwrap();
        assert_eq!(config.standard.model, "llama3");
        assert_eq!(config.reasoning.model, "deepseek-r1");
        assert_eq!(config.evaluation.model, "llama3");
    }

    #[test]
    fn test_model_configs_override_endpoint() {
        let config = Config::from_lookup(lookup(&[
            ("LLM_PROVIDER", "ollama"),
            ("LLM_MODEL", "llama3"),
            (
                "MODEL_CONFIGS",
                r#"{"llama3": {"base_url": "http://gpu-box:11434", "temperature": 0.7}}"#,
            ),
        ]))
        .unwrap();
        assert_eq!(config.standard.base_url, "http://gpu-box:11434");
        assert_eq!(config.standard.temperature, 0.7);
    }

    #[test]
    fn test_invalid_number_is_rejected() {
        let err = Config::from_lookup(lookup(&[
            ("LLM_PROVIDER", "ollama"),
            ("LLM_MODEL", "llama3"),
            ("MAX_RECOVERY_ATTEMPTS", "many"),
        ]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(msg) if msg.contains("MAX_RECOVERY_ATTEMPTS")));
    }

    #[test]
    fn test_cors_origins_split_on_commas() {
        let config = Config::from_lookup(lookup(&[
            ("LLM_PROVIDER", "ollama"),
            ("LLM_MODEL", "llama3"),
            (
                "BACKEND_CORS_ORIGINS",
                "http://localhost:3000, https://app.example.com",
            ),
        ]))
        .unwrap();
        assert_eq!(
            config.cors_origins,
            vec!["http://localhost:3000", "https://app.example.com"]
        );
    }
}
