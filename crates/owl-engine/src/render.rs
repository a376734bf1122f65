//! Text rendering of a workflow and its inverse.
//!
//! ```text
//! workflow: translate_and_count
//! load
//! ├── translate_text
//! │   └── count_words
//! └── summarize
//!     └── count_words (see above)
//! ```
//!
//! Every root (a node without dependencies) starts a tree. A node reached
//! again after its subtree was printed is marked instead of expanded, so each
//! edge appears exactly once and the rendering can be parsed back.

use std::collections::HashSet;

use owl_core::error::{OwlError, Result};

use crate::graph::Workflow;

const HEADER: &str = "workflow: ";
const BRANCH: &str = "├── ";
const LAST_BRANCH: &str = "└── ";
const PIPE: &str = "│   ";
const SPACE: &str = "    ";
const SEEN: &str = " (see above)";

/// Render the workflow as an ASCII tree. Read-only; does not validate.
pub fn pretty_print(workflow: &Workflow) -> String {
    let mut out = format!("{}{}\n", HEADER, workflow.name());
    let mut expanded = HashSet::new();

    for id in workflow.topological_order() {
        if workflow.predecessors(id).next().is_none() {
            out.push_str(id);
            out.push('\n');
            expanded.insert(id.to_string());
            render_children(workflow, id, "", &mut expanded, &mut out);
        }
    }
    out
}

fn render_children(
    workflow: &Workflow,
    id: &str,
    prefix: &str,
    expanded: &mut HashSet<String>,
    out: &mut String,
) {
    let children: Vec<&str> = workflow.successors(id).collect();
    for (i, child) in children.iter().enumerate() {
        let last = i + 1 == children.len();
        out.push_str(prefix);
        out.push_str(if last { LAST_BRANCH } else { BRANCH });
        out.push_str(child);

        if !expanded.insert(child.to_string()) {
            out.push_str(SEEN);
            out.push('\n');
            continue;
        }
        out.push('\n');
        let nested = format!("{}{}", prefix, if last { SPACE } else { PIPE });
        render_children(workflow, child, &nested, expanded, out);
    }
}

/// Structure recovered from a `pretty_print` rendering.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Rendering {
    pub name: String,
    /// Node ids in order of first appearance.
    pub nodes: Vec<String>,
    /// `(source, target)` pairs in rendering order.
    pub edges: Vec<(String, String)>,
}

/// Parse the output of `pretty_print`.
pub fn parse_rendering(text: &str) -> Result<Rendering> {
    let mut lines = text.lines();
    let name = lines
        .next()
        .and_then(|l| l.strip_prefix(HEADER))
        .ok_or_else(|| OwlError::Config(format!("rendering must start with '{}'", HEADER)))?;

    let mut rendering = Rendering {
        name: name.to_string(),
        ..Default::default()
    };
    let mut seen_nodes = HashSet::new();
    // Node ids along the current path, indexed by depth.
    let mut path: Vec<String> = Vec::new();

    for (n, line) in lines.enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let (depth, label) = split_prefix(line);
        let id = label.strip_suffix(SEEN).unwrap_or(label);
        if id.is_empty() || id.contains(char::is_whitespace) {
            return Err(OwlError::Config(format!(
                "line {}: malformed node label '{}'",
                n + 2,
                label
            )));
        }

        if depth > 0 {
            let parent = path.get(depth - 1).ok_or_else(|| {
                OwlError::Config(format!("line {}: '{}' has no parent", n + 2, id))
            })?;
            rendering.edges.push((parent.clone(), id.to_string()));
        }
        path.truncate(depth);
        path.push(id.to_string());

        if seen_nodes.insert(id.to_string()) {
            rendering.nodes.push(id.to_string());
        }
    }
    Ok(rendering)
}

/// Depth of a line and the label after its tree prefix.
fn split_prefix(line: &str) -> (usize, &str) {
    let mut rest = line;
    let mut depth = 0;
    while let Some(r) = rest.strip_prefix(PIPE).or_else(|| rest.strip_prefix(SPACE)) {
        rest = r;
        depth += 1;
    }
    match rest
        .strip_prefix(BRANCH)
        .or_else(|| rest.strip_prefix(LAST_BRANCH))
    {
        Some(label) => (depth + 1, label),
        None => (0, rest),
    }
}
