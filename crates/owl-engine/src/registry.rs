use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use tracing::debug;

use owl_core::error::{OwlError, Result};
use owl_core::traits::Provider;

use crate::node::Node;

/// Declared nodes, keyed by id.
///
/// Replaces decorator-style registration: callers build a `Node` and hand it
/// over explicitly. Registered nodes are shared, so the same node can be
/// added to several workflows.
#[derive(Default)]
pub struct NodeRegistry {
    nodes: BTreeMap<String, Arc<Node>>,
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a node under its id.
    pub fn register(&mut self, node: Node) -> Result<Arc<Node>> {
        if self.nodes.contains_key(node.id()) {
            return Err(OwlError::AlreadyRegistered(node.id().to_string()));
        }
        let node = Arc::new(node);
        debug!(node = %node.id(), kind = %node.kind(), "Registered node");
        self.nodes.insert(node.id().to_string(), Arc::clone(&node));
        Ok(node)
    }

    pub fn get(&self, id: &str) -> Option<Arc<Node>> {
        self.nodes.get(id).cloned()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.nodes.contains_key(id)
    }

    /// Registered ids in name order.
    pub fn names(&self) -> Vec<&str> {
        self.nodes.keys().map(|s| s.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

/// Provider collaborators, keyed by the provider key nodes refer to.
#[derive(Default)]
pub struct ProviderRegistry {
    providers: HashMap<String, Arc<dyn Provider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a provider under its own name, replacing any previous one.
    pub fn register(&mut self, provider: impl Provider) {
        let name = provider.name().to_string();
        self.providers.insert(name, Arc::new(provider));
    }

    /// Register a provider under an explicit key.
    pub fn register_as(&mut self, key: impl Into<String>, provider: Arc<dyn Provider>) {
        self.providers.insert(key.into(), provider);
    }

    pub fn get(&self, key: &str) -> Option<Arc<dyn Provider>> {
        self.providers.get(key).cloned()
    }

    /// Like `get`, but a missing key is an error.
    pub fn require(&self, key: &str) -> Result<Arc<dyn Provider>> {
        self.get(key)
            .ok_or_else(|| OwlError::ProviderNotFound(key.to_string()))
    }

    pub fn contains(&self, key: &str) -> bool {
        self.providers.contains_key(key)
    }

    /// Registered keys, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.providers.keys().map(|s| s.as_str()).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.providers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use owl_core::schema::TypeSchema;
    use owl_core::types::{FieldMap, TypeTag};
    use owl_test_utils::MockProvider;

    fn noop(id: &str) -> Node {
        Node::pure(
            id,
            TypeSchema::new(),
            TypeSchema::of([("ok", TypeTag::Boolean)]),
            |_| Ok(FieldMap::new()),
        )
        .unwrap()
    }

    #[test]
    fn test_register_and_get() {
        let mut registry = NodeRegistry::new();
        let node = registry.register(noop("count_words")).unwrap();
        assert_eq!(node.id(), "count_words");
        assert!(registry.contains("count_words"));
        assert!(Arc::ptr_eq(&node, &registry.get("count_words").unwrap()));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_duplicate_registration() {
        let mut registry = NodeRegistry::new();
        registry.register(noop("a")).unwrap();
        let err = registry.register(noop("a")).unwrap_err();
        assert!(matches!(err, OwlError::AlreadyRegistered(ref id) if id == "a"));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_names_sorted() {
        let mut registry = NodeRegistry::new();
        registry.register(noop("b")).unwrap();
        registry.register(noop("a")).unwrap();
        assert_eq!(registry.names(), vec!["a", "b"]);
    }

    #[test]
    fn test_provider_lookup() {
        let mut providers = ProviderRegistry::new();
        providers.register(MockProvider::echo("openai"));
        providers.register_as("backup", Arc::new(MockProvider::echo("other")));

        assert_eq!(providers.names(), vec!["backup", "openai"]);
        assert!(providers.get("openai").is_some());
        let err = providers.require("gemini").err().unwrap();
        assert!(matches!(err, OwlError::ProviderNotFound(ref k) if k == "gemini"));
    }
}
