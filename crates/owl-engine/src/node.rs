use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use owl_core::error::{
    ExecutionFault, NodeConnectionError, NodeExecutionError, SchemaMutationError,
};
use owl_core::schema::TypeSchema;
use owl_core::types::FieldMap;
use owl_sandbox::Sandbox;

use crate::registry::ProviderRegistry;

/// In-process computation backing a `pure` node.
pub type PureFn = Arc<dyn Fn(&FieldMap) -> anyhow::Result<FieldMap> + Send + Sync>;

/// What kind of work a node performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    Pure,
    Provider,
    Sandboxed,
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pure => write!(f, "pure"),
            Self::Provider => write!(f, "provider"),
            Self::Sandboxed => write!(f, "sandboxed"),
        }
    }
}

/// How a node turns validated inputs into outputs.
#[derive(Clone)]
pub enum Strategy {
    Pure(PureFn),
    /// Call `model` on the provider registered under `provider`.
    Provider { provider: String, model: String },
    /// Run a snippet in the sandbox.
    Sandboxed { source: String },
}

impl Strategy {
    pub fn kind(&self) -> NodeKind {
        match self {
            Self::Pure(_) => NodeKind::Pure,
            Self::Provider { .. } => NodeKind::Provider,
            Self::Sandboxed { .. } => NodeKind::Sandboxed,
        }
    }
}

impl fmt::Debug for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pure(_) => f.write_str("Pure(..)"),
            Self::Provider { provider, model } => f
                .debug_struct("Provider")
                .field("provider", provider)
                .field("model", model)
                .finish(),
            Self::Sandboxed { source } => f
                .debug_struct("Sandboxed")
                .field("source_len", &source.len())
                .finish(),
        }
    }
}

/// Collaborators a node may need while executing.
#[derive(Clone, Default)]
pub struct NodeEnv {
    pub providers: Arc<ProviderRegistry>,
    pub sandbox: Arc<Sandbox>,
}

impl NodeEnv {
    pub fn new(providers: ProviderRegistry, sandbox: Sandbox) -> Self {
        Self {
            providers: Arc::new(providers),
            sandbox: Arc::new(sandbox),
        }
    }
}

/// A unit of work with typed inputs and outputs.
///
/// Nodes are shared read-only between workflows through `Arc<Node>`. Once a
/// node has been added to a workflow its schemas are frozen.
#[derive(Debug)]
pub struct Node {
    id: String,
    input_schema: TypeSchema,
    output_schema: TypeSchema,
    strategy: Strategy,
    /// Budget for sandboxed nodes; the sandbox default applies when unset.
    timeout: Option<Duration>,
    attached: AtomicBool,
}

/// Why `name` cannot be used as a node id or workflow name, if it can't.
pub(crate) fn name_violation(name: &str) -> Option<String> {
    if name.is_empty() {
        return Some("must not be empty".to_string());
    }
    name.chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | ':' | '-')))
        .map(|c| format!("character {:?} is not allowed", c))
}

/// Node ids are non-empty and limited to `[A-Za-z0-9_.:-]`.
pub fn validate_id(id: &str) -> Result<(), NodeConnectionError> {
    match name_violation(id) {
        Some(reason) => Err(NodeConnectionError::InvalidId {
            id: id.to_string(),
            reason,
        }),
        None => Ok(()),
    }
}

impl Node {
    pub fn new(
        id: impl Into<String>,
        input_schema: TypeSchema,
        output_schema: TypeSchema,
        strategy: Strategy,
    ) -> Result<Self, NodeConnectionError> {
        let id = id.into();
        validate_id(&id)?;
        Ok(Self {
            id,
            input_schema,
            output_schema,
            strategy,
            timeout: None,
            attached: AtomicBool::new(false),
        })
    }

    /// A node backed by an in-process closure.
    pub fn pure<F>(
        id: impl Into<String>,
        input_schema: TypeSchema,
        output_schema: TypeSchema,
        f: F,
    ) -> Result<Self, NodeConnectionError>
    where
        F: Fn(&FieldMap) -> anyhow::Result<FieldMap> + Send + Sync + 'static,
    {
        Self::new(id, input_schema, output_schema, Strategy::Pure(Arc::new(f)))
    }

    /// A node that calls `model` on the provider registered as `provider`.
    pub fn provider(
        id: impl Into<String>,
        provider: impl Into<String>,
        model: impl Into<String>,
        input_schema: TypeSchema,
        output_schema: TypeSchema,
    ) -> Result<Self, NodeConnectionError> {
        Self::new(
            id,
            input_schema,
            output_schema,
            Strategy::Provider {
                provider: provider.into(),
                model: model.into(),
            },
        )
    }

    /// A node that runs `source` in the sandbox with its inputs bound as variables.
    pub fn sandboxed(
        id: impl Into<String>,
        source: impl Into<String>,
        input_schema: TypeSchema,
        output_schema: TypeSchema,
    ) -> Result<Self, NodeConnectionError> {
        Self::new(
            id,
            input_schema,
            output_schema,
            Strategy::Sandboxed {
                source: source.into(),
            },
        )
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// An unattached copy under a new id, sharing schemas and strategy.
    pub fn clone_as(&self, id: impl Into<String>) -> Result<Self, NodeConnectionError> {
        let mut node = Self::new(
            id,
            self.input_schema.clone(),
            self.output_schema.clone(),
            self.strategy.clone(),
        )?;
        node.timeout = self.timeout;
        Ok(node)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> NodeKind {
        self.strategy.kind()
    }

    pub fn strategy(&self) -> &Strategy {
        &self.strategy
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub fn input_schema(&self) -> &TypeSchema {
        &self.input_schema
    }

    pub fn output_schema(&self) -> &TypeSchema {
        &self.output_schema
    }

    pub fn input_schema_mut(&mut self) -> Result<&mut TypeSchema, SchemaMutationError> {
        self.ensure_detached()?;
        Ok(&mut self.input_schema)
    }

    pub fn output_schema_mut(&mut self) -> Result<&mut TypeSchema, SchemaMutationError> {
        self.ensure_detached()?;
        Ok(&mut self.output_schema)
    }

    pub fn is_attached(&self) -> bool {
        self.attached.load(Ordering::Acquire)
    }

    pub(crate) fn mark_attached(&self) {
        self.attached.store(true, Ordering::Release);
    }

    fn ensure_detached(&self) -> Result<(), SchemaMutationError> {
        if self.is_attached() {
            Err(SchemaMutationError::Attached {
                node: self.id.clone(),
            })
        } else {
            Ok(())
        }
    }

    /// Run the node on inputs that already passed input validation.
    ///
    /// The returned mapping still has to be validated against the output
    /// schema by the caller.
    pub async fn execute(
        &self,
        inputs: FieldMap,
        env: &NodeEnv,
    ) -> Result<FieldMap, NodeExecutionError> {
        let result = match &self.strategy {
            Strategy::Pure(f) => run_pure(f, &inputs),
            Strategy::Provider { provider, model } => {
                self.call_provider(provider, model, inputs, env).await
            }
            Strategy::Sandboxed { source } => env
                .sandbox
                .execute(source, &inputs, self.timeout)
                .await
                .map(|namespace| self.project(namespace))
                .map_err(ExecutionFault::from),
        };
        result.map_err(|cause| NodeExecutionError::new(self.id.clone(), cause))
    }

    async fn call_provider(
        &self,
        key: &str,
        model: &str,
        inputs: FieldMap,
        env: &NodeEnv,
    ) -> Result<FieldMap, ExecutionFault> {
        let provider = env
            .providers
            .get(key)
            .ok_or_else(|| ExecutionFault::Provider(format!("unknown provider '{}'", key)))?;

        debug!(node = %self.id, provider = key, model, "Calling provider");
        let outputs = provider
            .call(model, inputs)
            .await
            .map_err(|e| ExecutionFault::Provider(e.to_string()))?;
        Ok(self.rebind_single(outputs))
    }

    /// A provider answering with one value feeds a single-field output
    /// schema under that field's name.
    fn rebind_single(&self, mut outputs: FieldMap) -> FieldMap {
        let fields = self.output_schema.field_names();
        if outputs.len() != 1 || fields.len() != 1 || outputs.contains_key(fields[0]) {
            return outputs;
        }
        let target = fields[0].to_string();
        match outputs.pop_first() {
            Some((_, value)) => {
                let mut rebound = FieldMap::new();
                rebound.insert(target, value);
                rebound
            }
            None => outputs,
        }
    }

    /// Keep only the namespace entries the output schema declares.
    fn project(&self, mut namespace: FieldMap) -> FieldMap {
        namespace.retain(|name, _| self.output_schema.contains(name));
        namespace
    }
}

fn run_pure(f: &PureFn, inputs: &FieldMap) -> Result<FieldMap, ExecutionFault> {
    match catch_unwind(AssertUnwindSafe(|| f(inputs))) {
        Ok(Ok(outputs)) => Ok(outputs),
        Ok(Err(e)) => Err(ExecutionFault::Computation(format!("{:#}", e))),
        Err(panic) => Err(ExecutionFault::Computation(format!(
            "panicked: {}",
            panic_message(panic.as_ref())
        ))),
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use owl_core::error::SandboxFault;
    use owl_core::types::{field_map, TypeTag};
    use owl_test_utils::{FailingProvider, MockProvider, BONJOUR, HELLO};
    use serde_json::json;

    fn text_in() -> TypeSchema {
        TypeSchema::of([("text", TypeTag::String)])
    }

    fn env_with(providers: ProviderRegistry) -> NodeEnv {
        NodeEnv::new(providers, Sandbox::default())
    }

    #[test]
    fn test_id_validation() {
        assert!(validate_id("translate_text").is_ok());
        assert!(validate_id("ns:step-1.v2").is_ok());
        assert!(matches!(
            validate_id(""),
            Err(NodeConnectionError::InvalidId { .. })
        ));
        assert!(matches!(
            validate_id("two words"),
            Err(NodeConnectionError::InvalidId { .. })
        ));
        assert!(validate_id("a(b)").is_err());
    }

    #[test]
    fn test_node_kind() {
        let node = Node::sandboxed("s", "y = 1", TypeSchema::new(), TypeSchema::new()).unwrap();
        assert_eq!(node.kind(), NodeKind::Sandboxed);
        assert_eq!(node.kind().to_string(), "sandboxed");
    }

    #[test]
    fn test_schema_frozen_after_attach() {
        let mut node = Node::pure("n", text_in(), TypeSchema::new(), |_| Ok(FieldMap::new()))
            .unwrap();
        node.input_schema_mut()
            .unwrap()
            .add_field("lang", TypeTag::String, false, None)
            .unwrap();
        assert!(node.input_schema().contains("lang"));

        node.mark_attached();
        let err = node.output_schema_mut().unwrap_err();
        assert_eq!(err, SchemaMutationError::Attached { node: "n".into() });
    }

    #[test]
    fn test_clone_as_is_detached() {
        let node = Node::provider("a", "openai", "m", text_in(), TypeSchema::new())
            .unwrap()
            .with_timeout(Duration::from_millis(10));
        node.mark_attached();
        let copy = node.clone_as("b").unwrap();
        assert_eq!(copy.id(), "b");
        assert!(!copy.is_attached());
        assert_eq!(copy.input_schema(), node.input_schema());
        assert_eq!(copy.timeout(), Some(Duration::from_millis(10)));
        assert!(node.clone_as("bad id").is_err());
    }

    #[tokio::test]
    async fn test_pure_error_becomes_computation_fault() {
        let node = Node::pure("boom", TypeSchema::new(), TypeSchema::new(), |_| {
            anyhow::bail!("division by zero")
        })
        .unwrap();
        let err = node
            .execute(FieldMap::new(), &NodeEnv::default())
            .await
            .unwrap_err();
        assert_eq!(err.node, "boom");
        assert_eq!(
            err.cause,
            ExecutionFault::Computation("division by zero".into())
        );
    }

    #[tokio::test]
    async fn test_pure_panic_is_caught() {
        let node = Node::pure("panics", TypeSchema::new(), TypeSchema::new(), |_| {
            panic!("unreachable state")
        })
        .unwrap();
        let err = node
            .execute(FieldMap::new(), &NodeEnv::default())
            .await
            .unwrap_err();
        assert!(matches!(err.cause, ExecutionFault::Computation(ref m) if m.contains("unreachable state")));
    }

    #[tokio::test]
    async fn test_provider_single_value_is_rebound() {
        let mut providers = ProviderRegistry::new();
        providers.register(MockProvider::translator("openai"));
        let node = Node::provider(
            "translate_text",
            "openai",
            "gpt-4o-mini",
            text_in(),
            TypeSchema::of([("translated_text", TypeTag::String)]),
        )
        .unwrap();

        let out = node
            .execute(field_map([("text", json!(HELLO))]), &env_with(providers))
            .await
            .unwrap();
        assert_eq!(out, field_map([("translated_text", json!(BONJOUR))]));
    }

    #[tokio::test]
    async fn test_provider_multi_value_passes_through() {
        let mut providers = ProviderRegistry::new();
        providers.register(MockProvider::constant(
            "p",
            field_map([("a", json!(1)), ("b", json!(2))]),
        ));
        let node = Node::provider(
            "n",
            "p",
            "m",
            TypeSchema::new(),
            TypeSchema::of([("a", TypeTag::Integer)]),
        )
        .unwrap();
        let out = node.execute(FieldMap::new(), &env_with(providers)).await.unwrap();
        assert_eq!(out.len(), 2);
    }

    #[tokio::test]
    async fn test_provider_failures() {
        let mut providers = ProviderRegistry::new();
        providers.register(FailingProvider::new("down", "HTTP 503"));
        let env = env_with(providers);

        let node = Node::provider("n", "down", "m", TypeSchema::new(), TypeSchema::new()).unwrap();
        let err = node.execute(FieldMap::new(), &env).await.unwrap_err();
        assert!(matches!(err.cause, ExecutionFault::Provider(ref m) if m.contains("HTTP 503")));

        let node =
            Node::provider("n", "missing", "m", TypeSchema::new(), TypeSchema::new()).unwrap();
        let err = node.execute(FieldMap::new(), &env).await.unwrap_err();
        assert!(matches!(err.cause, ExecutionFault::Provider(ref m) if m.contains("missing")));
    }

    #[tokio::test]
    async fn test_sandboxed_output_is_projected() {
        let node = Node::sandboxed(
            "inc",
            "tmp = x * 2\ny = tmp + 1",
            TypeSchema::of([("x", TypeTag::Integer)]),
            TypeSchema::of([("y", TypeTag::Integer)]),
        )
        .unwrap();
        let out = node
            .execute(field_map([("x", json!(5))]), &NodeEnv::default())
            .await
            .unwrap();
        assert_eq!(out, field_map([("y", json!(11))]));
    }

    #[tokio::test]
    async fn test_sandboxed_fault_is_wrapped() {
        let node = Node::sandboxed("evil", "import os", TypeSchema::new(), TypeSchema::new())
            .unwrap();
        let err = node
            .execute(FieldMap::new(), &NodeEnv::default())
            .await
            .unwrap_err();
        assert!(matches!(
            err.cause,
            ExecutionFault::Sandbox(SandboxFault::SecurityViolation(_))
        ));
    }
}
