//! Workflows declared in TOML.
//!
//! ```toml
//! name = "translate_and_count"
//!
//! [[nodes]]
//! id = "translate_text"
//! kind = "provider"
//! provider = "openai"
//! model = "gpt-4o-mini"
//! inputs = { text = "string" }
//! outputs = { translated_text = "string" }
//!
//! [[nodes]]
//! id = "count_words"
//! kind = "sandboxed"
//! timeout_ms = 1000
//! source = "word_count = len(translated_text.split())"
//! inputs = { translated_text = "string" }
//! outputs = { word_count = "integer" }
//!
//! [[edges]]
//! from = "translate_text"
//! to = "count_words"
//! ```
//!
//! A field is either a bare type name (required) or a table
//! `{ type = "...", required = false, default = ... }`. Nodes of kind
//! `registered` reuse a node from a `NodeRegistry` by its `node` id.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use owl_core::error::{OwlError, Result};
use owl_core::schema::TypeSchema;
use owl_core::types::TypeTag;

use crate::graph::Workflow;
use crate::node::Node;
use crate::registry::NodeRegistry;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDef {
    pub name: String,
    #[serde(default)]
    pub nodes: Vec<NodeDef>,
    #[serde(default)]
    pub edges: Vec<EdgeDef>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeDefKind {
    Provider,
    Sandboxed,
    Registered,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeDef {
    pub id: String,
    pub kind: NodeDefKind,
    /// May stand alone without edges.
    #[serde(default)]
    pub entry: bool,
    #[serde(default)]
    pub inputs: BTreeMap<String, FieldDef>,
    #[serde(default)]
    pub outputs: BTreeMap<String, FieldDef>,

    // provider
    #[serde(default)]
    pub provider: Option<String>,
    #[serde(default)]
    pub model: Option<String>,

    // sandboxed
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,

    // registered
    #[serde(default)]
    pub node: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldDef {
    Tag(String),
    Detailed {
        #[serde(rename = "type")]
        tag: String,
        /// Defaults to `true` unless a default value is given.
        #[serde(default)]
        required: Option<bool>,
        #[serde(default)]
        default: Option<Value>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EdgeDef {
    pub from: String,
    pub to: String,
}

impl WorkflowDef {
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| OwlError::Config(e.to_string()))
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| OwlError::ConfigNotFound(path.display().to_string()))?;
        Self::from_toml(&content)
    }

    /// Build the workflow. Structural errors surface exactly as they would
    /// from the builder calls.
    pub fn compile(&self, registry: &NodeRegistry) -> Result<Workflow> {
        let mut workflow = Workflow::new(&self.name)?;
        for def in &self.nodes {
            let node = def.build(registry)?;
            if def.entry {
                workflow.add_entry_node(node)?;
            } else {
                workflow.add_node(node)?;
            }
        }
        for edge in &self.edges {
            workflow.connect(&edge.from, &edge.to)?;
        }
        Ok(workflow)
    }
}

impl NodeDef {
    fn build(&self, registry: &NodeRegistry) -> Result<Arc<Node>> {
        let node = match self.kind {
            NodeDefKind::Provider => Node::provider(
                &self.id,
                self.require(&self.provider, "provider")?,
                self.model.clone().unwrap_or_default(),
                self.schema(&self.inputs, "inputs")?,
                self.schema(&self.outputs, "outputs")?,
            )?,
            NodeDefKind::Sandboxed => {
                let node = Node::sandboxed(
                    &self.id,
                    self.require(&self.source, "source")?,
                    self.schema(&self.inputs, "inputs")?,
                    self.schema(&self.outputs, "outputs")?,
                )?;
                match self.timeout_ms {
                    Some(ms) => node.with_timeout(Duration::from_millis(ms)),
                    None => node,
                }
            }
            NodeDefKind::Registered => {
                let name = self.require(&self.node, "node")?;
                let shared = registry.get(&name).ok_or_else(|| {
                    OwlError::Config(format!(
                        "node '{}' refers to unregistered node '{}'",
                        self.id, name
                    ))
                })?;
                if shared.id() == self.id {
                    return Ok(shared);
                }
                shared.clone_as(&self.id)?
            }
        };
        Ok(Arc::new(node))
    }

    fn require(&self, value: &Option<String>, key: &str) -> Result<String> {
        value.clone().ok_or_else(|| {
            OwlError::Config(format!(
                "{} node '{}' is missing '{}'",
                kind_name(self.kind),
                self.id,
                key
            ))
        })
    }

    fn schema(&self, fields: &BTreeMap<String, FieldDef>, side: &str) -> Result<TypeSchema> {
        let mut schema = TypeSchema::new();
        for (name, field) in fields {
            let (tag, required, default) = match field {
                FieldDef::Tag(tag) => (tag, true, None),
                FieldDef::Detailed {
                    tag,
                    required,
                    default,
                } => (tag, required.unwrap_or(default.is_none()), default.clone()),
            };
            let tag: TypeTag = tag.parse().map_err(|e| {
                OwlError::Config(format!("node '{}' {} '{}': {}", self.id, side, name, e))
            })?;
            schema.add_field(name.clone(), tag, required, default)?;
        }
        Ok(schema)
    }
}

fn kind_name(kind: NodeDefKind) -> &'static str {
    match kind {
        NodeDefKind::Provider => "provider",
        NodeDefKind::Sandboxed => "sandboxed",
        NodeDefKind::Registered => "registered",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::NodeKind;
    use owl_core::error::NodeConnectionError;
    use owl_core::types::FieldMap;

    const TRANSLATE: &str = r#"
name = "translate_and_count"

[[nodes]]
id = "translate_text"
kind = "provider"
provider = "openai"
model = "gpt-4o-mini"
inputs = { text = "string" }
outputs = { translated_text = "string" }

[[nodes]]
id = "count_words"
kind = "sandboxed"
timeout_ms = 250
source = "word_count = len(translated_text.split())"
inputs = { translated_text = "string", limit = { type = "int", default = 10 } }
outputs = { word_count = "integer" }

[[edges]]
from = "translate_text"
to = "count_words"
"#;

    #[test]
    fn test_compile_translate_workflow() {
        let def = WorkflowDef::from_toml(TRANSLATE).unwrap();
        let wf = def.compile(&NodeRegistry::new()).unwrap();
        assert_eq!(wf.name(), "translate_and_count");
        assert_eq!(wf.topological_order(), vec!["translate_text", "count_words"]);

        let count = wf.node("count_words").unwrap();
        assert_eq!(count.kind(), NodeKind::Sandboxed);
        assert_eq!(count.timeout(), Some(Duration::from_millis(250)));
        assert!(!count.input_schema().is_required("limit"));
        assert_eq!(count.input_schema().tag_of("limit"), Some(TypeTag::Integer));
        assert!(wf.validate().is_ok());
    }

    #[test]
    fn test_missing_provider_key() {
        let def = WorkflowDef::from_toml(
            "name = \"w\"\n[[nodes]]\nid = \"p\"\nkind = \"provider\"\nentry = true\n",
        )
        .unwrap();
        let err = def.compile(&NodeRegistry::new()).unwrap_err();
        assert!(matches!(err, OwlError::Config(ref m) if m.contains("missing 'provider'")));
    }

    #[test]
    fn test_unknown_field_type() {
        let def = WorkflowDef::from_toml(
            "name = \"w\"\n[[nodes]]\nid = \"s\"\nkind = \"sandboxed\"\nsource = \"x = 1\"\noutputs = { x = \"tuple\" }\n",
        )
        .unwrap();
        let err = def.compile(&NodeRegistry::new()).unwrap_err();
        assert!(matches!(err, OwlError::Config(ref m) if m.contains("tuple")));
    }

    #[test]
    fn test_invalid_workflow_name() {
        let def = WorkflowDef::from_toml("name = \"daily report\"\n").unwrap();
        let err = def.compile(&NodeRegistry::new()).unwrap_err();
        assert!(matches!(
            err,
            OwlError::NodeConnection(NodeConnectionError::InvalidName { .. })
        ));
    }

    #[test]
    fn test_cycle_in_definition() {
        let def = WorkflowDef::from_toml(
            r#"
name = "loop"
[[nodes]]
id = "a"
kind = "sandboxed"
source = "pass"
[[nodes]]
id = "b"
kind = "sandboxed"
source = "pass"
[[edges]]
from = "a"
to = "b"
[[edges]]
from = "b"
to = "a"
"#,
        )
        .unwrap();
        let err = def.compile(&NodeRegistry::new()).unwrap_err();
        assert!(matches!(
            err,
            OwlError::NodeConnection(NodeConnectionError::CycleDetected { .. })
        ));
    }

    #[test]
    fn test_registered_nodes_are_shared_or_cloned() {
        let mut registry = NodeRegistry::new();
        let shared = registry
            .register(
                Node::pure("noop", TypeSchema::new(), TypeSchema::new(), |_| {
                    Ok(FieldMap::new())
                })
                .unwrap(),
            )
            .unwrap();

        let def = WorkflowDef::from_toml(
            r#"
name = "reuse"
[[nodes]]
id = "noop"
kind = "registered"
node = "noop"
[[nodes]]
id = "noop_again"
kind = "registered"
node = "noop"
[[edges]]
from = "noop"
to = "noop_again"
"#,
        )
        .unwrap();
        let wf = def.compile(&registry).unwrap();
        assert!(Arc::ptr_eq(wf.node("noop").unwrap(), &shared));
        assert!(shared.is_attached());
        assert!(!Arc::ptr_eq(wf.node("noop_again").unwrap(), &shared));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        std::io::Write::write_all(&mut file, TRANSLATE.as_bytes()).unwrap();
        let def = WorkflowDef::load(file.path()).unwrap();
        assert_eq!(def.nodes.len(), 2);
        assert_eq!(def.edges[0], EdgeDef { from: "translate_text".into(), to: "count_words".into() });

        let err = WorkflowDef::load(Path::new("/nonexistent/flow.toml")).unwrap_err();
        assert!(matches!(err, OwlError::ConfigNotFound(_)));
    }
}
