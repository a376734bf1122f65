use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::{Arc, OnceLock};

use tracing::debug;

use owl_core::error::NodeConnectionError;

use crate::node::{name_violation, Node};

/// A dependency: `target` runs after `source` and may read its outputs.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Edge {
    pub source: String,
    pub target: String,
}

impl Edge {
    pub fn new(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
        }
    }
}

/// A named DAG of nodes.
///
/// Structural mistakes (unknown endpoints, self-loops, duplicate edges and
/// cycles) are rejected by the mutating call and leave the workflow as it
/// was. The orphan check needs the finished graph, so it runs in `validate`.
#[derive(Debug)]
pub struct Workflow {
    name: String,
    nodes: Vec<Arc<Node>>,
    index: HashMap<String, usize>,
    edges: Vec<Edge>,
    entries: HashSet<String>,
    /// Topological order computed by the last successful `validate`.
    validated: OnceLock<Vec<String>>,
}

impl Workflow {
    /// Workflow names follow the node id rules, so renderings stay
    /// parseable.
    pub fn new(name: impl Into<String>) -> Result<Self, NodeConnectionError> {
        let name = name.into();
        if let Some(reason) = name_violation(&name) {
            return Err(NodeConnectionError::InvalidName { name, reason });
        }
        Ok(Self {
            name,
            nodes: Vec::new(),
            index: HashMap::new(),
            edges: Vec::new(),
            entries: HashSet::new(),
            validated: OnceLock::new(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Add a node. Its schemas are frozen from now on.
    pub fn add_node(
        &mut self,
        node: impl Into<Arc<Node>>,
    ) -> Result<&mut Self, NodeConnectionError> {
        let node = node.into();
        if self.index.contains_key(node.id()) {
            return Err(NodeConnectionError::DuplicateId {
                id: node.id().to_string(),
            });
        }
        node.mark_attached();
        self.index.insert(node.id().to_string(), self.nodes.len());
        self.nodes.push(node);
        self.invalidate();
        Ok(self)
    }

    /// Add a node that may stand alone without any edge.
    pub fn add_entry_node(
        &mut self,
        node: impl Into<Arc<Node>>,
    ) -> Result<&mut Self, NodeConnectionError> {
        let node = node.into();
        let id = node.id().to_string();
        self.add_node(node)?;
        self.entries.insert(id);
        Ok(self)
    }

    /// Declare that `target` depends on `source`.
    pub fn connect(&mut self, source: &str, target: &str) -> Result<&mut Self, NodeConnectionError> {
        for id in [source, target] {
            if !self.index.contains_key(id) {
                return Err(NodeConnectionError::UnknownNode { id: id.to_string() });
            }
        }
        if source == target {
            return Err(NodeConnectionError::SelfLoop {
                id: source.to_string(),
            });
        }
        if self
            .edges
            .iter()
            .any(|e| e.source == source && e.target == target)
        {
            return Err(NodeConnectionError::DuplicateEdge {
                from: source.to_string(),
                to: target.to_string(),
            });
        }
        if self.reaches(target, source) {
            return Err(NodeConnectionError::CycleDetected {
                from: source.to_string(),
                to: target.to_string(),
            });
        }

        debug!(workflow = %self.name, source, target, "Connected nodes");
        self.edges.push(Edge::new(source, target));
        self.invalidate();
        Ok(self)
    }

    fn invalidate(&mut self) {
        self.validated = OnceLock::new();
    }

    /// Whether `to` is reachable from `from` over existing edges.
    fn reaches(&self, from: &str, to: &str) -> bool {
        let mut stack = vec![from];
        let mut seen = HashSet::new();
        while let Some(id) = stack.pop() {
            if id == to {
                return true;
            }
            if seen.insert(id) {
                stack.extend(self.successors(id));
            }
        }
        false
    }

    /// Direct dependents of `id`, in edge insertion order.
    pub fn successors<'a>(&'a self, id: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.edges
            .iter()
            .filter(move |e| e.source == id)
            .map(|e| e.target.as_str())
    }

    /// Direct dependencies of `id`, in edge insertion order.
    pub fn predecessors<'a>(&'a self, id: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.edges
            .iter()
            .filter(move |e| e.target == id)
            .map(|e| e.source.as_str())
    }

    pub fn node(&self, id: &str) -> Option<&Arc<Node>> {
        self.index.get(id).map(|&i| &self.nodes[i])
    }

    /// Nodes in insertion order.
    pub fn nodes(&self) -> &[Arc<Node>] {
        &self.nodes
    }

    /// Edges in insertion order.
    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }

    pub fn is_entry(&self, id: &str) -> bool {
        self.entries.contains(id)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Kahn's algorithm; among ready nodes the earliest inserted goes first.
    pub fn topological_order(&self) -> Vec<&str> {
        let mut in_degree = vec![0usize; self.nodes.len()];
        for edge in &self.edges {
            in_degree[self.index[&edge.target]] += 1;
        }

        let mut ready: BTreeSet<usize> = in_degree
            .iter()
            .enumerate()
            .filter(|(_, d)| **d == 0)
            .map(|(i, _)| i)
            .collect();
        let mut order = Vec::with_capacity(self.nodes.len());

        while let Some(i) = ready.pop_first() {
            let id = self.nodes[i].id();
            order.push(id);
            for next in self.successors(id) {
                let j = self.index[next];
                in_degree[j] -= 1;
                if in_degree[j] == 0 {
                    ready.insert(j);
                }
            }
        }
        order
    }

    /// Nodes grouped by longest distance from a root. Nodes in one level
    /// have no path between them; each level keeps topological order.
    pub fn levels(&self) -> Vec<Vec<&str>> {
        let mut depth: HashMap<&str, usize> = HashMap::new();
        let mut levels: Vec<Vec<&str>> = Vec::new();
        for id in self.topological_order() {
            let d = self
                .predecessors(id)
                .filter_map(|p| depth.get(p))
                .map(|d| d + 1)
                .max()
                .unwrap_or(0);
            depth.insert(id, d);
            if levels.len() <= d {
                levels.resize_with(d + 1, Vec::new);
            }
            levels[d].push(id);
        }
        levels
    }

    /// Every ancestor of `id`, in topological order.
    pub fn upstream_of(&self, id: &str) -> Vec<String> {
        let mut ancestors = HashSet::new();
        let mut stack: Vec<&str> = self.predecessors(id).collect();
        while let Some(p) = stack.pop() {
            if ancestors.insert(p) {
                stack.extend(self.predecessors(p));
            }
        }
        self.topological_order()
            .into_iter()
            .filter(|n| ancestors.contains(n))
            .map(str::to_string)
            .collect()
    }

    /// Nodes with no edge that were not added as entry nodes.
    pub fn orphans(&self) -> Vec<&str> {
        let mut connected = HashSet::new();
        for edge in &self.edges {
            connected.insert(edge.source.as_str());
            connected.insert(edge.target.as_str());
        }
        self.nodes
            .iter()
            .map(|n| n.id())
            .filter(|id| !connected.contains(id) && !self.entries.contains(*id))
            .collect()
    }

    /// Finalize the structure and return the execution order.
    ///
    /// The result is cached until the next mutation.
    pub fn validate(&self) -> Result<&[String], NodeConnectionError> {
        if let Some(order) = self.validated.get() {
            return Ok(order);
        }

        let orphans = self.orphans();
        if !orphans.is_empty() {
            return Err(NodeConnectionError::OrphanNode {
                ids: orphans.into_iter().map(str::to_string).collect(),
            });
        }

        let order: Vec<String> = self
            .topological_order()
            .into_iter()
            .map(str::to_string)
            .collect();
        debug!(workflow = %self.name, nodes = order.len(), "Workflow validated");
        Ok(self.validated.get_or_init(|| order))
    }

    pub fn is_validated(&self) -> bool {
        self.validated.get().is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use owl_core::schema::TypeSchema;
    use owl_core::types::FieldMap;

    fn node(id: &str) -> Node {
        Node::pure(id, TypeSchema::new(), TypeSchema::new(), |_| Ok(FieldMap::new())).unwrap()
    }

    fn workflow(ids: &[&str]) -> Workflow {
        let mut wf = Workflow::new("test").unwrap();
        for id in ids {
            wf.add_node(node(id)).unwrap();
        }
        wf
    }

    fn position(order: &[&str], id: &str) -> usize {
        order.iter().position(|n| *n == id).unwrap()
    }

    #[test]
    fn test_workflow_name_rules() {
        assert_eq!(Workflow::new("translate.v2:fr-en").unwrap().name(), "translate.v2:fr-en");
        for bad in ["", "two words", "line\nbreak", "tab\tbed"] {
            assert!(
                matches!(Workflow::new(bad), Err(NodeConnectionError::InvalidName { .. })),
                "{:?} should be rejected",
                bad
            );
        }
    }

    #[test]
    fn test_duplicate_id() {
        let mut wf = workflow(&["a"]);
        let err = wf.add_node(node("a")).unwrap_err();
        assert_eq!(err, NodeConnectionError::DuplicateId { id: "a".into() });
        assert_eq!(wf.len(), 1);
    }

    #[test]
    fn test_connect_errors() {
        let mut wf = workflow(&["a", "b"]);
        assert_eq!(
            wf.connect("a", "zz").unwrap_err(),
            NodeConnectionError::UnknownNode { id: "zz".into() }
        );
        assert_eq!(
            wf.connect("a", "a").unwrap_err(),
            NodeConnectionError::SelfLoop { id: "a".into() }
        );
        wf.connect("a", "b").unwrap();
        assert!(matches!(
            wf.connect("a", "b").unwrap_err(),
            NodeConnectionError::DuplicateEdge { .. }
        ));
    }

    #[test]
    fn test_cycle_rejected_atomically() {
        let mut wf = workflow(&["a", "b", "c"]);
        wf.connect("a", "b").unwrap().connect("b", "c").unwrap();
        let err = wf.connect("c", "a").unwrap_err();
        assert_eq!(
            err,
            NodeConnectionError::CycleDetected {
                from: "c".into(),
                to: "a".into()
            }
        );
        assert_eq!(wf.edges().len(), 2);
        assert_eq!(wf.topological_order(), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_topological_order_valid_and_stable() {
        let mut wf = workflow(&["d", "b", "a", "c"]);
        wf.connect("a", "c").unwrap();
        wf.connect("b", "c").unwrap();
        wf.connect("d", "a").unwrap();

        let order = wf.topological_order();
        for edge in wf.edges() {
            assert!(position(&order, &edge.source) < position(&order, &edge.target));
        }
        assert_eq!(order, vec!["d", "b", "a", "c"]);
        for _ in 0..10 {
            assert_eq!(wf.topological_order(), order);
        }
    }

    #[test]
    fn test_orphans_reported_in_insertion_order() {
        let mut wf = workflow(&["x", "a", "b", "y"]);
        wf.connect("a", "b").unwrap();
        assert_eq!(
            wf.validate().unwrap_err(),
            NodeConnectionError::OrphanNode {
                ids: vec!["x".into(), "y".into()]
            }
        );
    }

    #[test]
    fn test_entry_node_exempt_from_orphan_check() {
        let mut wf = Workflow::new("solo").unwrap();
        wf.add_entry_node(node("only")).unwrap();
        assert_eq!(wf.validate().unwrap(), ["only".to_string()]);
    }

    #[test]
    fn test_validation_cache_reset_on_mutation() {
        let mut wf = workflow(&["a", "b"]);
        wf.connect("a", "b").unwrap();
        wf.validate().unwrap();
        assert!(wf.is_validated());
        wf.add_node(node("c")).unwrap();
        assert!(!wf.is_validated());
        assert!(wf.validate().is_err());
    }

    #[test]
    fn test_levels_use_longest_path() {
        let mut wf = workflow(&["src", "left", "right", "join"]);
        wf.connect("src", "left").unwrap();
        wf.connect("src", "right").unwrap();
        wf.connect("left", "join").unwrap();
        wf.connect("src", "join").unwrap();
        assert_eq!(
            wf.levels(),
            vec![vec!["src"], vec!["left", "right"], vec!["join"]]
        );
    }

    #[test]
    fn test_upstream_of() {
        let mut wf = workflow(&["a", "b", "c", "d"]);
        wf.connect("a", "b").unwrap();
        wf.connect("b", "d").unwrap();
        wf.connect("c", "d").unwrap();
        assert_eq!(wf.upstream_of("d"), vec!["a", "b", "c"]);
        assert!(wf.upstream_of("a").is_empty());
    }

    #[test]
    fn test_add_node_marks_attached() {
        let shared = Arc::new(node("shared"));
        let mut wf = Workflow::new("w").unwrap();
        wf.add_entry_node(Arc::clone(&shared)).unwrap();
        assert!(shared.is_attached());
    }
}
