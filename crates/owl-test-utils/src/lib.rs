//! Mocks and fixtures shared by the owl test suites.

use std::collections::VecDeque;
use std::io::Write;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use serde_json::Value;

use owl_core::config::ModelConfig;
use owl_core::error::{OwlError, Result};
use owl_core::traits::{LlmClient, Provider};
use owl_core::types::{ChatMessage, FieldMap};

/// The sentence used by the hello-world workflow and its expected translation.
pub const HELLO: &str = "Hello world!";
pub const BONJOUR: &str = "Bonjour le monde!";

/// Deterministic stand-in for a translation model.
pub fn fake_translate(text: &str) -> String {
    if text == HELLO {
        BONJOUR.to_string()
    } else {
        format!("[fr] {}", text)
    }
}

/// Write `content` to a temporary file that lives as long as the handle.
pub fn temp_file(content: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().expect("create temp file");
    file.write_all(content.as_bytes()).expect("write temp file");
    file
}

// ── LLM client mock ─────────────────────────────────────────────

/// An `LlmClient` that replays queued responses and records every request.
pub struct MockLlmClient {
    responses: Mutex<VecDeque<Result<String>>>,
    calls: Arc<Mutex<Vec<Vec<ChatMessage>>>>,
    configs: Arc<Mutex<Vec<ModelConfig>>>,
}

impl MockLlmClient {
    pub fn new() -> Self {
        Self {
            responses: Mutex::new(VecDeque::new()),
            calls: Arc::new(Mutex::new(Vec::new())),
            configs: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn with_response(self, text: impl Into<String>) -> Self {
        self.responses.lock().unwrap().push_back(Ok(text.into()));
        self
    }

    pub fn with_error(self, error: OwlError) -> Self {
        self.responses.lock().unwrap().push_back(Err(error));
        self
    }

    /// Messages of every request, in call order.
    pub fn calls(&self) -> Arc<Mutex<Vec<Vec<ChatMessage>>>> {
        Arc::clone(&self.calls)
    }

    /// Model configs of every request, in call order.
    pub fn configs(&self) -> Arc<Mutex<Vec<ModelConfig>>> {
        Arc::clone(&self.configs)
    }
}

impl Default for MockLlmClient {
    fn default() -> Self {
        Self::new()
    }
}

impl LlmClient for MockLlmClient {
    fn generate(
        &self,
        config: &ModelConfig,
        messages: Vec<ChatMessage>,
    ) -> BoxFuture<'_, Result<String>> {
        self.calls.lock().unwrap().push(messages);
        self.configs.lock().unwrap().push(config.clone());
        let next = self
            .responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(OwlError::LlmRequest("mock has no more responses".into())));
        Box::pin(async move { next })
    }
}

// ── Provider mocks ──────────────────────────────────────────────

type Handler = Box<dyn Fn(&str, &FieldMap) -> Result<FieldMap> + Send + Sync>;

/// A `Provider` driven by a closure, recording `(model, inputs)` per call.
pub struct MockProvider {
    name: String,
    handler: Handler,
    delay: Option<Duration>,
    calls: Arc<Mutex<Vec<(String, FieldMap)>>>,
}

impl MockProvider {
    pub fn new<F>(name: impl Into<String>, handler: F) -> Self
    where
        F: Fn(&str, &FieldMap) -> Result<FieldMap> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            handler: Box::new(handler),
            delay: None,
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Always returns the same outputs.
    pub fn constant(name: impl Into<String>, outputs: FieldMap) -> Self {
        Self::new(name, move |_, _| Ok(outputs.clone()))
    }

    /// Returns its inputs unchanged.
    pub fn echo(name: impl Into<String>) -> Self {
        Self::new(name, |_, inputs| Ok(inputs.clone()))
    }

    /// Translates the `text` input, answering with a single `content` value
    /// like a chat provider would.
    pub fn translator(name: impl Into<String>) -> Self {
        Self::new(name, |_, inputs| {
            let text = inputs
                .get("text")
                .and_then(Value::as_str)
                .ok_or_else(|| OwlError::LlmRequest("missing text".into()))?;
            let mut out = FieldMap::new();
            out.insert("content".into(), Value::String(fake_translate(text)));
            Ok(out)
        })
    }

    /// Sleep before answering.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> Arc<Mutex<Vec<(String, FieldMap)>>> {
        Arc::clone(&self.calls)
    }
}

impl Provider for MockProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn call(&self, model: &str, inputs: FieldMap) -> BoxFuture<'_, Result<FieldMap>> {
        self.calls
            .lock()
            .unwrap()
            .push((model.to_string(), inputs.clone()));
        let result = (self.handler)(model, &inputs);
        let delay = self.delay;
        Box::pin(async move {
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            result
        })
    }
}

/// A `Provider` that always fails with `LlmRequest(message)`.
pub struct FailingProvider {
    name: String,
    message: String,
}

impl FailingProvider {
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
        }
    }
}

impl Provider for FailingProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn call(&self, _model: &str, _inputs: FieldMap) -> BoxFuture<'_, Result<FieldMap>> {
        let message = self.message.clone();
        Box::pin(async move { Err(OwlError::LlmRequest(message)) })
    }
}
