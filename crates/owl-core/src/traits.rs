use futures::future::BoxFuture;

use crate::config::ModelConfig;
use crate::error::Result;
use crate::types::{ChatMessage, FieldMap};

/// Provider collaborator backing `provider` nodes.
///
/// Implementations own any retry or timeout policy; nodes call them once.
pub trait Provider: Send + Sync + 'static {
    /// Provider key used by nodes to select this provider.
    fn name(&self) -> &str;

    /// Run `model` on the node's validated inputs and return its outputs.
    fn call(&self, model: &str, inputs: FieldMap) -> BoxFuture<'_, Result<FieldMap>>;
}

/// LLM client: one request, one complete text response.
pub trait LlmClient: Send + Sync + 'static {
    fn generate(
        &self,
        config: &ModelConfig,
        messages: Vec<ChatMessage>,
    ) -> BoxFuture<'_, Result<String>>;
}
