#![allow(dead_code)]

use std::sync::Arc;

use serde_json::{json, Value};

use owl_core::schema::TypeSchema;
use owl_core::types::{field_map, TypeTag};
use owl_engine::{Node, NodeEnv, ProviderRegistry};
use owl_sandbox::Sandbox;
use owl_test_utils::MockProvider;

/// Provider node translating `text` into `translated_text` via "openai".
pub fn translate_node() -> Node {
    Node::provider(
        "translate_text",
        "openai",
        "gpt-4o-mini",
        TypeSchema::of([("text", TypeTag::String)]),
        TypeSchema::of([("translated_text", TypeTag::String)]),
    )
    .unwrap()
}

/// Pure node counting the words of `translated_text`.
pub fn count_words_node() -> Node {
    Node::pure(
        "count_words",
        TypeSchema::of([("translated_text", TypeTag::String)]),
        TypeSchema::of([("word_count", TypeTag::Integer)]),
        |inputs| {
            let text = inputs["translated_text"]
                .as_str()
                .ok_or_else(|| anyhow::anyhow!("translated_text is not a string"))?;
            Ok(field_map([("word_count", json!(text.split_whitespace().count()))]))
        },
    )
    .unwrap()
}

/// Provider node translating `text` into `translation` via "openai".
pub fn translation_node() -> Node {
    Node::provider(
        "translate_text",
        "openai",
        "gpt-4o-mini",
        TypeSchema::of([("text", TypeTag::String)]),
        TypeSchema::of([("translation", TypeTag::String)]),
    )
    .unwrap()
}

/// Pure node counting the words of the initial `text`.
pub fn count_text_words_node() -> Node {
    Node::pure(
        "count_words",
        TypeSchema::of([("text", TypeTag::String)]),
        TypeSchema::of([("word_count", TypeTag::Integer)]),
        |inputs| {
            let text = inputs["text"]
                .as_str()
                .ok_or_else(|| anyhow::anyhow!("text is not a string"))?;
            Ok(field_map([("word_count", json!(text.split_whitespace().count()))]))
        },
    )
    .unwrap()
}

/// Pure node copying `input` to `output` after mapping it with `f`.
pub fn map_node(
    id: &str,
    input: &'static str,
    output: &'static str,
    f: fn(&Value) -> Value,
) -> Node {
    Node::pure(
        id,
        TypeSchema::of([(input, TypeTag::String)]),
        TypeSchema::of([(output, TypeTag::String)]),
        move |inputs| Ok(field_map([(output, f(&inputs[input]))])),
    )
    .unwrap()
}

pub fn env_with(provider: MockProvider) -> NodeEnv {
    let mut providers = ProviderRegistry::new();
    providers.register(provider);
    NodeEnv::new(providers, Sandbox::default())
}

/// Environment whose "openai" provider is the deterministic translator.
pub fn translator_env() -> NodeEnv {
    env_with(MockProvider::translator("openai"))
}

pub fn shared(node: Node) -> Arc<Node> {
    Arc::new(node)
}
