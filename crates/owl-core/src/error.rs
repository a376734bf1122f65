use std::fmt;

use thiserror::Error;

use crate::types::TypeTag;

/// A value mapping did not match a `TypeSchema`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchemaValidationError {
    #[error("missing required field '{field}'")]
    MissingField { field: String },

    #[error("field '{field}' expected {expected}, got {found}")]
    TypeMismatch {
        field: String,
        expected: TypeTag,
        found: String,
    },

    #[error("unexpected field '{field}'")]
    UnexpectedField { field: String },
}

/// A `TypeSchema` could not be changed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchemaMutationError {
    #[error("schema of node '{node}' is attached to a workflow and can no longer change")]
    Attached { node: String },

    #[error("field '{field}' is already declared")]
    DuplicateField { field: String },

    #[error("field '{field}' is not declared")]
    UnknownField { field: String },

    #[error("default for field '{field}' expected {expected}, got {found}")]
    InvalidDefault {
        field: String,
        expected: TypeTag,
        found: String,
    },
}

/// Structural problems detected while building or finalizing a workflow.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NodeConnectionError {
    #[error("invalid node id '{id}': {reason}")]
    InvalidId { id: String, reason: String },

    #[error("invalid workflow name '{name}': {reason}")]
    InvalidName { name: String, reason: String },

    #[error("node '{id}' already exists in workflow")]
    DuplicateId { id: String },

    #[error("node '{id}' is not part of the workflow")]
    UnknownNode { id: String },

    #[error("node '{id}' cannot be connected to itself")]
    SelfLoop { id: String },

    #[error("edge {from} -> {to} already exists")]
    DuplicateEdge { from: String, to: String },

    #[error("edge {from} -> {to} would close a cycle")]
    CycleDetected { from: String, to: String },

    #[error("orphan nodes detected: {}", .ids.join(", "))]
    OrphanNode { ids: Vec<String> },
}

/// Failure modes of a sandboxed snippet.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SandboxFault {
    #[error("snippet timed out after {budget_ms}ms")]
    TimedOut { budget_ms: u64 },

    #[error("security violation: {0}")]
    SecurityViolation(String),

    #[error("snippet faulted: {0}")]
    Faulted(String),
}

/// The underlying cause of a failed node execution.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExecutionFault {
    #[error(transparent)]
    Sandbox(#[from] SandboxFault),

    #[error("provider failed: {0}")]
    Provider(String),

    #[error("computation failed: {0}")]
    Computation(String),
}

/// The only error kind a node raises to its caller.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("node '{node}' failed{}: {cause}", upstream_suffix(.upstream))]
pub struct NodeExecutionError {
    pub node: String,
    /// Ancestors that fed the failing node, in execution order.
    pub upstream: Vec<String>,
    #[source]
    pub cause: ExecutionFault,
}

fn upstream_suffix(upstream: &[String]) -> String {
    if upstream.is_empty() {
        String::new()
    } else {
        format!(" (upstream: {})", upstream.join(" -> "))
    }
}

impl NodeExecutionError {
    pub fn new(node: impl Into<String>, cause: impl Into<ExecutionFault>) -> Self {
        Self {
            node: node.into(),
            upstream: Vec::new(),
            cause: cause.into(),
        }
    }

    pub fn with_upstream(mut self, upstream: Vec<String>) -> Self {
        self.upstream = upstream;
        self
    }

    /// True when the failure came from a sandbox running out of time.
    pub fn is_timeout(&self) -> bool {
        matches!(
            self.cause,
            ExecutionFault::Sandbox(SandboxFault::TimedOut { .. })
        )
    }
}

/// Which side of a node a validation failure happened on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationPhase {
    Input,
    Output,
}

impl fmt::Display for ValidationPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Input => write!(f, "input"),
            Self::Output => write!(f, "output"),
        }
    }
}

/// A node's inputs or outputs did not match its schema during a run.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{phase} validation for node '{node}' failed: {source}")]
pub struct NodeValidationError {
    pub node: String,
    pub phase: ValidationPhase,
    pub source: SchemaValidationError,
}

#[derive(Debug, Error)]
pub enum OwlError {
    // Schema errors
    #[error("Schema validation failed: {0}")]
    SchemaValidation(#[from] SchemaValidationError),

    #[error("Schema mutation rejected: {0}")]
    SchemaMutation(#[from] SchemaMutationError),

    // Graph errors
    #[error("Node connection error: {0}")]
    NodeConnection(#[from] NodeConnectionError),

    // Run errors
    #[error("Node validation error: {0}")]
    NodeValidation(#[from] NodeValidationError),

    #[error("Node execution error: {0}")]
    NodeExecution(#[from] NodeExecutionError),

    #[error("Field '{field}' written by '{node}' was already written by '{previous}'")]
    FieldCollision {
        field: String,
        node: String,
        previous: String,
    },

    // Registry errors
    #[error("Node already registered: {0}")]
    AlreadyRegistered(String),

    #[error("Provider not found: {0}")]
    ProviderNotFound(String),

    // LLM errors
    #[error("LLM request failed: {0}")]
    LlmRequest(String),

    #[error("LLM response parse error: {0}")]
    LlmParse(String),

    #[error("LLM provider not supported: {0}")]
    UnsupportedProvider(String),

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, OwlError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn execution_error_lists_upstream_chain() {
        let err = NodeExecutionError::new("count", ExecutionFault::Computation("boom".into()))
            .with_upstream(vec!["load".into(), "translate".into()]);
        assert_eq!(
            err.to_string(),
            "node 'count' failed (upstream: load -> translate): computation failed: boom"
        );
    }

    #[test]
    fn execution_error_without_upstream() {
        let err = NodeExecutionError::new("solo", SandboxFault::TimedOut { budget_ms: 50 });
        assert_eq!(
            err.to_string(),
            "node 'solo' failed: snippet timed out after 50ms"
        );
        assert!(err.is_timeout());
    }

    #[test]
    fn validation_error_names_phase() {
        let err = NodeValidationError {
            node: "n1".into(),
            phase: ValidationPhase::Output,
            source: SchemaValidationError::MissingField {
                field: "word_count".into(),
            },
        };
        assert_eq!(
            err.to_string(),
            "output validation for node 'n1' failed: missing required field 'word_count'"
        );
    }

    #[test]
    fn orphan_error_lists_ids() {
        let err = NodeConnectionError::OrphanNode {
            ids: vec!["a".into(), "b".into()],
        };
        assert_eq!(err.to_string(), "orphan nodes detected: a, b");
    }
}
