use futures::future::BoxFuture;
use serde_json::Value;
use tracing::debug;

use owl_core::config::ModelConfig;
use owl_core::error::{OwlError, Result};
use owl_core::traits::{LlmClient, Provider};
use owl_core::types::{ChatMessage, FieldMap, Role};

/// Input field holding a full conversation as `[{role, content}, ...]`.
pub const MESSAGES_FIELD: &str = "messages";
/// Optional input field holding a system prompt.
pub const SYSTEM_FIELD: &str = "system";
/// Output field carrying the model's reply.
pub const CONTENT_FIELD: &str = "content";

/// Adapts an `LlmClient` to the provider contract used by provider nodes.
///
/// Inputs become a conversation: an explicit `messages` list when present,
/// preceded by `system` when given; every other input is rendered into one
/// user message as `**name**: value` lines. The reply is returned as
/// `{"content": text}`.
pub struct ChatProvider {
    name: String,
    config: ModelConfig,
    client: Box<dyn LlmClient>,
}

impl ChatProvider {
    pub fn new(name: impl Into<String>, config: ModelConfig, client: Box<dyn LlmClient>) -> Self {
        Self {
            name: name.into(),
            config,
            client,
        }
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }
}

fn render_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Turn a node's inputs into the conversation sent to the model.
pub fn build_messages(inputs: &FieldMap) -> Result<Vec<ChatMessage>> {
    let mut messages = Vec::new();

    if let Some(system) = inputs.get(SYSTEM_FIELD) {
        messages.push(ChatMessage::system(render_value(system)));
    }

    if let Some(history) = inputs.get(MESSAGES_FIELD) {
        let history: Vec<ChatMessage> = serde_json::from_value(history.clone())
            .map_err(|e| OwlError::LlmRequest(format!("invalid '{}' input: {}", MESSAGES_FIELD, e)))?;
        messages.extend(history);
    }

    let prompt: Vec<String> = inputs
        .iter()
        .filter(|(k, _)| k.as_str() != SYSTEM_FIELD && k.as_str() != MESSAGES_FIELD)
        .map(|(k, v)| format!("**{}**: {}", k, render_value(v)))
        .collect();
    if !prompt.is_empty() {
        messages.push(ChatMessage::user(prompt.join("\n")));
    }

    if messages.iter().all(|m| m.role == Role::System) {
        return Err(OwlError::LlmRequest(
            "provider node inputs produced no user message".into(),
        ));
    }
    Ok(messages)
}

impl Provider for ChatProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn call(&self, model: &str, inputs: FieldMap) -> BoxFuture<'_, Result<FieldMap>> {
        let mut config = self.config.clone();
        if !model.is_empty() {
            config.model_id = model.to_string();
        }

        Box::pin(async move {
            let messages = build_messages(&inputs)?;
            debug!(
                provider = %self.name,
                model = %config.model_id,
                messages = messages.len(),
                "Calling language model"
            );
            let text = self.client.generate(&config, messages).await?;

            let mut outputs = FieldMap::new();
            outputs.insert(CONTENT_FIELD.to_string(), Value::String(text));
            Ok(outputs)
        })
    }
}
