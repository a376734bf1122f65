use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{OwlError, Result};

/// Top-level owl configuration (`owl.toml`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub executor: ExecutorConfig,
    #[serde(default)]
    pub sandbox: SandboxConfig,
    /// Provider collaborators keyed by the name nodes refer to.
    #[serde(default)]
    pub providers: HashMap<String, ModelConfig>,
    #[serde(default)]
    pub log: LogConfig,
}

/// How the executor schedules nodes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// One node at a time, in topological order.
    #[default]
    Sequential,
    /// Independent nodes of the same level run concurrently.
    Parallel,
}

/// What happens when a node writes a field already present in the context.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverwritePolicy {
    /// The later node in topological order replaces the value.
    #[default]
    LastWriterWins,
    /// Abort the run with `FieldCollision`.
    Reject,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutorConfig {
    #[serde(default)]
    pub mode: ExecutionMode,
    #[serde(default)]
    pub overwrite: OverwritePolicy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxConfig {
    /// Wall-clock budget for a snippet unless the node sets its own.
    #[serde(default = "default_sandbox_timeout")]
    pub timeout_ms: u64,
    /// Longest string a snippet may build.
    #[serde(default = "default_max_string_len")]
    pub max_string_len: usize,
    /// Largest list or mapping a snippet may build.
    #[serde(default = "default_max_collection_len")]
    pub max_collection_len: usize,
    /// Bytes a snippet may allocate over one run.
    #[serde(default = "default_max_alloc_bytes")]
    pub max_alloc_bytes: usize,
}

fn default_sandbox_timeout() -> u64 { 5_000 }
fn default_max_string_len() -> usize { 1_000_000 }
fn default_max_collection_len() -> usize { 100_000 }
fn default_max_alloc_bytes() -> usize { 256 * 1024 * 1024 }

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_sandbox_timeout(),
            max_string_len: default_max_string_len(),
            max_collection_len: default_max_collection_len(),
            max_alloc_bytes: default_max_alloc_bytes(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    /// Fallback model when a node does not name one.
    #[serde(default)]
    pub model_id: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default)]
    pub retry: Option<RetryConfig>,
}

fn default_provider() -> String { "openai".to_string() }
fn default_max_tokens() -> u32 { 1024 }
fn default_temperature() -> f32 { 0.0 }

impl ModelConfig {
    pub fn new(provider: impl Into<String>, model_id: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            model_id: model_id.into(),
            api_key: None,
            base_url: None,
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
            retry: None,
        }
    }
}

/// Retry configuration for provider requests.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff")]
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_backoff_ms: default_initial_backoff(),
            max_backoff_ms: default_max_backoff(),
        }
    }
}

fn default_max_retries() -> u32 { 3 }
fn default_initial_backoff() -> u64 { 500 }
fn default_max_backoff() -> u64 { 10_000 }

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LogConfig {
    /// `tracing` filter directive, e.g. `owl=debug`. `RUST_LOG` wins when set.
    #[serde(default)]
    pub filter: Option<String>,
}

impl AppConfig {
    /// Load config from a TOML file, with env var expansion.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| OwlError::ConfigNotFound(path.display().to_string()))?;
        Self::from_toml(&content)
    }

    /// Parse config text, expanding `${ENV_VAR}` references first.
    pub fn from_toml(content: &str) -> Result<Self> {
        let expanded = expand_env_vars(content);
        toml::from_str(&expanded).map_err(|e| OwlError::Config(e.to_string()))
    }
}

/// Expand `${ENV_VAR}` patterns in a string.
pub fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '$' && chars.peek() == Some(&'{') {
            chars.next(); // consume '{'
            let mut var_name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_name.push(c);
            }
            match std::env::var(&var_name) {
                Ok(val) => result.push_str(&val),
                Err(_) => {
                    // Keep original if env var not set
                    result.push_str(&format!("${{{}}}", var_name));
                }
            }
        } else {
            result.push(c);
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expand_env_vars() {
        std::env::set_var("TEST_OWL_VAR", "hello");
        let result = expand_env_vars("key = \"${TEST_OWL_VAR}\"");
        assert_eq!(result, "key = \"hello\"");
        std::env::remove_var("TEST_OWL_VAR");
    }

    #[test]
    fn test_expand_env_vars_missing() {
        let result = expand_env_vars("key = \"${NONEXISTENT_OWL_VAR}\"");
        assert_eq!(result, "key = \"${NONEXISTENT_OWL_VAR}\"");
    }

    #[test]
    fn test_defaults_from_empty_toml() {
        let config = AppConfig::from_toml("").unwrap();
        assert_eq!(config.executor.mode, ExecutionMode::Sequential);
        assert_eq!(config.executor.overwrite, OverwritePolicy::LastWriterWins);
        assert_eq!(config.sandbox.timeout_ms, 5_000);
        assert_eq!(config.sandbox.max_collection_len, 100_000);
        assert!(config.providers.is_empty());
        assert!(config.log.filter.is_none());
    }

    #[test]
    fn test_provider_sections() {
        let toml_str = r#"
[executor]
mode = "parallel"
overwrite = "reject"

[providers.openai]
provider = "openai"
model_id = "gpt-4o-mini"
api_key = "sk-test"

[providers.claude]
provider = "anthropic"
max_tokens = 2048

[providers.claude.retry]
max_retries = 5
"#;
        let config = AppConfig::from_toml(toml_str).unwrap();
        assert_eq!(config.executor.mode, ExecutionMode::Parallel);
        assert_eq!(config.executor.overwrite, OverwritePolicy::Reject);

        let openai = &config.providers["openai"];
        assert_eq!(openai.model_id, "gpt-4o-mini");
        assert_eq!(openai.api_key.as_deref(), Some("sk-test"));
        assert_eq!(openai.max_tokens, 1024);

        let claude = &config.providers["claude"];
        assert_eq!(claude.provider, "anthropic");
        assert_eq!(claude.max_tokens, 2048);
        let retry = claude.retry.as_ref().unwrap();
        assert_eq!(retry.max_retries, 5);
        assert_eq!(retry.initial_backoff_ms, 500);
    }

    #[test]
    fn test_invalid_mode_is_config_error() {
        let err = AppConfig::from_toml("[executor]\nmode = \"distributed\"\n").unwrap_err();
        assert!(matches!(err, OwlError::Config(_)));
    }

    #[test]
    fn test_missing_file() {
        let err = AppConfig::load(Path::new("/nonexistent/owl.toml")).unwrap_err();
        assert!(matches!(err, OwlError::ConfigNotFound(_)));
    }
}
