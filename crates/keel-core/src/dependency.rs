//! Dependency graph boundary.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;

use crate::{CommitId, Result, Source};

/// One repository at one version in a dependency graph.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyNode {
    /// Reference as written by the depending build definition.
    pub reference: String,
    pub version: String,
    /// Indices of the nodes this one depends on.
    pub dependencies: Vec<usize>,
}

/// A problem detected while resolving dependencies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "problem", rename_all = "snake_case")]
pub enum DependencyProblem {
    /// The same reference is required at two different versions.
    MultipleVersions {
        reference: String,
        first: String,
        second: String,
    },
    /// A reference could not be resolved.
    Missing { reference: String },
}

impl fmt::Display for DependencyProblem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DependencyProblem::MultipleVersions {
                reference,
                first,
                second,
            } => write!(
                f,
                "Dependency `{reference}` is required at multiple versions: `{first}` and `{second}`."
            ),
            DependencyProblem::Missing { reference } => {
                write!(f, "Dependency `{reference}` could not be resolved.")
            }
        }
    }
}

/// Resolved dependency graph of one commit; node 0 is the root.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DependencyGraph {
    pub nodes: Vec<DependencyNode>,
    pub problems: Vec<DependencyProblem>,
}

impl DependencyGraph {
    pub fn problems(&self) -> &[DependencyProblem] {
        &self.problems
    }

    /// Visit every node reachable from the root once, depth first.
    pub fn traverse<F: FnMut(&DependencyNode)>(&self, mut visitor: F) {
        if self.nodes.is_empty() {
            return;
        }
        let mut seen = HashSet::new();
        let mut stack = vec![0usize];
        while let Some(idx) = stack.pop() {
            if !seen.insert(idx) {
                continue;
            }
            let Some(node) = self.nodes.get(idx) else {
                continue;
            };
            visitor(node);
            stack.extend(node.dependencies.iter().rev().copied());
        }
    }
}

#[async_trait]
pub trait DependencyGraphService: Send + Sync {
    /// Resolve the dependency graph of `commit`.
    async fn dependency_graph(&self, source: &Source, commit: &CommitId)
    -> Result<DependencyGraph>;

    /// Re-scan repositories that depend on `source` after it published a release.
    async fn rescan_dependents(&self, source: &Source, tag: &str) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(reference: &str, deps: Vec<usize>) -> DependencyNode {
        DependencyNode {
            reference: reference.to_string(),
            version: "1.0.0".to_string(),
            dependencies: deps,
        }
    }

    #[test]
    fn test_traverse_visits_each_node_once() {
        let graph = DependencyGraph {
            nodes: vec![
                node("root", vec![1, 2]),
                node("a", vec![2]),
                node("b", vec![]),
                node("unreachable", vec![]),
            ],
            problems: vec![],
        };
        let mut visited = Vec::new();
        graph.traverse(|n| visited.push(n.reference.clone()));
        assert_eq!(visited, vec!["root", "a", "b"]);
    }

    #[test]
    fn test_multiple_versions_message_names_both() {
        let problem = DependencyProblem::MultipleVersions {
            reference: "acme/lib".to_string(),
            first: "1.2.0".to_string(),
            second: "2.0.0".to_string(),
        };
        let msg = problem.to_string();
        assert!(msg.contains("acme/lib"));
        assert!(msg.contains("1.2.0"));
        assert!(msg.contains("2.0.0"));
    }
}
