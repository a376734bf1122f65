use std::time::Duration;

use futures::future::BoxFuture;
use tracing::{info, warn};

use owl_core::config::{ModelConfig, RetryConfig};
use owl_core::error::{OwlError, Result};
use owl_core::traits::LlmClient;
use owl_core::types::ChatMessage;

/// An LLM client that retries failed requests and falls back to alternative providers.
pub struct RetryingClient {
    primary: Box<dyn LlmClient>,
    fallbacks: Vec<(ModelConfig, Box<dyn LlmClient>)>,
    retry_config: RetryConfig,
}

impl RetryingClient {
    pub fn new(
        primary: Box<dyn LlmClient>,
        fallbacks: Vec<(ModelConfig, Box<dyn LlmClient>)>,
        retry_config: RetryConfig,
    ) -> Self {
        Self {
            primary,
            fallbacks,
            retry_config,
        }
    }
}

fn is_retryable(e: &OwlError) -> bool {
    match e {
        OwlError::LlmRequest(msg) => {
            msg.contains("429")
                || msg.contains("500")
                || msg.contains("502")
                || msg.contains("503")
                || msg.contains("timeout")
                || msg.contains("connection")
        }
        _ => false,
    }
}

fn calculate_backoff(attempt: u32, config: &RetryConfig) -> Duration {
    let ms = config
        .initial_backoff_ms
        .saturating_mul(2u64.saturating_pow(attempt))
        .min(config.max_backoff_ms);
    // Add jitter: 0.8x to 1.2x
    let jitter = 0.8 + rand::random::<f64>() * 0.4;
    Duration::from_millis((ms as f64 * jitter) as u64)
}

impl LlmClient for RetryingClient {
    fn generate(
        &self,
        config: &ModelConfig,
        messages: Vec<ChatMessage>,
    ) -> BoxFuture<'_, Result<String>> {
        let config = config.clone();

        Box::pin(async move {
            let max_retries = self.retry_config.max_retries;

            // Try primary with retries
            let mut last_err = None;
            for attempt in 0..=max_retries {
                match self.primary.generate(&config, messages.clone()).await {
                    Ok(text) => return Ok(text),
                    Err(e) => {
                        if is_retryable(&e) && attempt < max_retries {
                            let backoff = calculate_backoff(attempt, &self.retry_config);
                            warn!(
                                attempt = attempt + 1,
                                max_retries,
                                backoff_ms = backoff.as_millis() as u64,
                                error = %e,
                                "Retrying LLM request"
                            );
                            tokio::time::sleep(backoff).await;
                            last_err = Some(e);
                            continue;
                        }
                        last_err = Some(e);
                        break;
                    }
                }
            }

            // Primary exhausted, try fallbacks
            if !self.fallbacks.is_empty() {
                info!("Primary LLM exhausted, trying fallback models");
            }
            for (fb_config, fb_client) in &self.fallbacks {
                match fb_client.generate(fb_config, messages.clone()).await {
                    Ok(text) => {
                        info!(
                            model = %fb_config.model_id,
                            provider = %fb_config.provider,
                            "Fell back to alternative model"
                        );
                        return Ok(text);
                    }
                    Err(e) => {
                        warn!(
                            model = %fb_config.model_id,
                            error = %e,
                            "Fallback model also failed"
                        );
                    }
                }
            }

            Err(last_err.unwrap_or_else(|| OwlError::LlmRequest("All providers failed".into())))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use owl_test_utils::MockLlmClient;

    fn fast_retry(max_retries: u32) -> RetryConfig {
        RetryConfig {
            max_retries,
            initial_backoff_ms: 1,
            max_backoff_ms: 2,
        }
    }

    #[test]
    fn backoff_is_capped() {
        let config = RetryConfig {
            max_retries: 10,
            initial_backoff_ms: 500,
            max_backoff_ms: 1_000,
        };
        let backoff = calculate_backoff(8, &config);
        assert!(backoff <= Duration::from_millis(1_200));
        assert!(backoff >= Duration::from_millis(800));
    }

    #[test]
    fn only_transient_errors_retry() {
        assert!(is_retryable(&OwlError::LlmRequest("HTTP 429 Too Many Requests".into())));
        assert!(is_retryable(&OwlError::LlmRequest("connection reset".into())));
        assert!(!is_retryable(&OwlError::LlmRequest("HTTP 401 Unauthorized".into())));
        assert!(!is_retryable(&OwlError::LlmParse("bad json".into())));
    }

    #[tokio::test]
    async fn retries_transient_failures() {
        let mock = MockLlmClient::new()
            .with_error(OwlError::LlmRequest("HTTP 503".into()))
            .with_response("ok");
        let calls = mock.calls();
        let client = RetryingClient::new(Box::new(mock), vec![], fast_retry(2));

        let text = client
            .generate(&ModelConfig::new("openai", "m"), vec![ChatMessage::user("hi")])
            .await
            .unwrap();
        assert_eq!(text, "ok");
        assert_eq!(calls.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn permanent_failure_falls_back() {
        let primary = MockLlmClient::new().with_error(OwlError::LlmRequest("HTTP 401".into()));
        let fallback = MockLlmClient::new().with_response("from fallback");
        let client = RetryingClient::new(
            Box::new(primary),
            vec![(
                ModelConfig::new("anthropic", "backup"),
                Box::new(fallback) as Box<dyn LlmClient>,
            )],
            fast_retry(3),
        );

        let text = client
            .generate(&ModelConfig::new("openai", "m"), vec![ChatMessage::user("hi")])
            .await
            .unwrap();
        assert_eq!(text, "from fallback");
    }

    #[tokio::test]
    async fn exhausted_returns_last_error() {
        let primary = MockLlmClient::new()
            .with_error(OwlError::LlmRequest("HTTP 500".into()))
            .with_error(OwlError::LlmRequest("HTTP 502".into()));
        let client = RetryingClient::new(Box::new(primary), vec![], fast_retry(1));

        let err = client
            .generate(&ModelConfig::new("openai", "m"), vec![ChatMessage::user("hi")])
            .await
            .unwrap_err();
        assert!(matches!(err, OwlError::LlmRequest(ref msg) if msg.contains("502")));
    }
}
