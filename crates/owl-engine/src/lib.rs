//! Workflow engine: typed nodes wired into a DAG and run in topological order.
//!
//! A `Workflow` holds `Node`s and the `Edge`s between them. The `Executor`
//! validates the graph, then threads an `ExecutionContext` through the nodes,
//! validating each node's inputs before it runs and its outputs before they
//! are merged.

pub mod context;
pub mod definition;
pub mod executor;
pub mod graph;
pub mod node;
pub mod registry;
pub mod render;

pub use context::{ExecutionContext, INPUT_WRITER};
pub use definition::WorkflowDef;
pub use executor::Executor;
pub use graph::{Edge, Workflow};
pub use node::{Node, NodeEnv, NodeKind, PureFn, Strategy};
pub use registry::{NodeRegistry, ProviderRegistry};
pub use render::{parse_rendering, pretty_print, Rendering};

impl Workflow {
    /// See [`render::pretty_print`].
    pub fn pretty_print(&self) -> String {
        render::pretty_print(self)
    }
}
