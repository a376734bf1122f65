pub mod chat;
pub mod providers;
pub mod retry;

use owl_core::config::ModelConfig;
use owl_core::error::{OwlError, Result};
use owl_core::traits::LlmClient;

pub use chat::ChatProvider;
pub use providers::{AnthropicClient, GeminiClient, OpenAiClient};
pub use retry::RetryingClient;

/// Providers that speak the OpenAI chat completions protocol.
const OPENAI_COMPATIBLE: &[&str] = &[
    "openai", "ollama", "groq", "openrouter", "together", "deepseek", "mistral", "compatible",
];

/// Create an LLM client based on the provider name.
pub fn create_client(config: &ModelConfig) -> Result<Box<dyn LlmClient>> {
    match config.provider.as_str() {
        "anthropic" | "claude" => Ok(Box::new(AnthropicClient::new())),
        "gemini" | "google" => Ok(Box::new(GeminiClient::new())),
        p if OPENAI_COMPATIBLE.contains(&p) => Ok(Box::new(OpenAiClient::new())),
        other => Err(OwlError::UnsupportedProvider(other.to_string())),
    }
}

/// Create a client wrapped in `RetryingClient` when the config asks for retries.
pub fn build_client(config: &ModelConfig) -> Result<Box<dyn LlmClient>> {
    let client = create_client(config)?;
    Ok(match &config.retry {
        Some(retry) => Box::new(RetryingClient::new(client, vec![], retry.clone())),
        None => client,
    })
}

/// Build the chat provider registered under `name`.
pub fn chat_provider(name: &str, config: &ModelConfig) -> Result<ChatProvider> {
    Ok(ChatProvider::new(name, config.clone(), build_client(config)?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_providers_resolve() {
        for provider in ["anthropic", "claude", "gemini", "openai", "ollama", "groq"] {
            assert!(
                create_client(&ModelConfig::new(provider, "m")).is_ok(),
                "{} should resolve",
                provider
            );
        }
    }

    #[test]
    fn unknown_provider_is_rejected() {
        let err = create_client(&ModelConfig::new("carrier-pigeon", "m")).err().unwrap();
        assert!(matches!(err, OwlError::UnsupportedProvider(ref p) if p == "carrier-pigeon"));
    }

    #[test]
    fn chat_provider_keeps_registered_name() {
        use owl_core::traits::Provider;
        let provider = chat_provider("translator", &ModelConfig::new("openai", "m")).unwrap();
        assert_eq!(provider.name(), "translator");
        assert_eq!(provider.config().provider, "openai");
    }
}
