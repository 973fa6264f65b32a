//! Dependency resolution over sprint and phase DAGs.
//!
//! Edges are declared as `(dependency, dependent)` pairs. A cycle is a
//! configuration fault detected before any execution starts.

use std::collections::{HashMap, HashSet};

use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use thiserror::Error;

/// Configuration faults in a declared dependency graph.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GraphError {
    #[error("dependency cycle involving {node:?}")]
    Cycle { node: String },

    #[error("{node:?} depends on unknown node {dependency:?}")]
    UnknownDependency { node: String, dependency: String },

    #[error("duplicate node id {node:?}")]
    DuplicateNode { node: String },
}

/// A validated DAG with a fixed topological order.
#[derive(Debug, Clone)]
pub struct DependencyGraph {
    order: Vec<String>,
    dependencies: HashMap<String, Vec<String>>,
    dependents: HashMap<String, Vec<String>>,
}

impl DependencyGraph {
    /// Build and validate a graph from node ids and `(dependency,
    /// dependent)` edges. Kahn-style ordering via petgraph's toposort;
    /// any cycle refuses the whole configuration.
    pub fn build(nodes: &[String], edges: &[(String, String)]) -> Result<Self, GraphError> {
        let mut graph: DiGraph<String, ()> = DiGraph::new();
        let mut indices: HashMap<String, NodeIndex> = HashMap::new();

        for node in nodes {
            if indices.contains_key(node) {
                return Err(GraphError::DuplicateNode { node: node.clone() });
            }
            let idx = graph.add_node(node.clone());
            indices.insert(node.clone(), idx);
        }

        let mut dependencies: HashMap<String, Vec<String>> =
            nodes.iter().map(|n| (n.clone(), Vec::new())).collect();
        let mut dependents: HashMap<String, Vec<String>> =
            nodes.iter().map(|n| (n.clone(), Vec::new())).collect();

        for (dep, node) in edges {
            let &dep_idx = indices.get(dep).ok_or_else(|| GraphError::UnknownDependency {
                node: node.clone(),
                dependency: dep.clone(),
            })?;
            let &node_idx = indices.get(node).ok_or_else(|| GraphError::UnknownDependency {
                node: dep.clone(),
                dependency: node.clone(),
            })?;
            graph.add_edge(dep_idx, node_idx, ());
            dependencies.get_mut(node).unwrap().push(dep.clone());
            dependents.get_mut(dep).unwrap().push(node.clone());
        }

        let order = toposort(&graph, None)
            .map_err(|cycle| GraphError::Cycle {
                node: graph[cycle.node_id()].clone(),
            })?
            .into_iter()
            .map(|idx| graph[idx].clone())
            .collect();

        Ok(Self {
            order,
            dependencies,
            dependents,
        })
    }

    /// Node ids in an order where every dependency precedes its dependents.
    pub fn order(&self) -> &[String] {
        &self.order
    }

    /// Direct dependencies of `node`.
    pub fn dependencies_of(&self, node: &str) -> &[String] {
        self.dependencies.get(node).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Direct dependents of `node`.
    pub fn dependents_of(&self, node: &str) -> &[String] {
        self.dependents.get(node).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Every node reachable downstream of `node`, in topological order.
    /// Used to mark dependents blocked after a failure.
    pub fn transitive_dependents(&self, node: &str) -> Vec<String> {
        let mut reached: HashSet<&str> = HashSet::new();
        let mut stack: Vec<&str> = self.dependents_of(node).iter().map(String::as_str).collect();
        while let Some(next) = stack.pop() {
            if reached.insert(next) {
                stack.extend(self.dependents_of(next).iter().map(String::as_str));
            }
        }
        self.order
            .iter()
            .filter(|n| reached.contains(n.as_str()))
            .cloned()
            .collect()
    }

    /// Nodes whose dependencies are all in `done` and which are not yet
    /// in `done` or `started`.
    pub fn ready(&self, done: &HashSet<String>, started: &HashSet<String>) -> Vec<String> {
        self.order
            .iter()
            .filter(|n| !done.contains(*n) && !started.contains(*n))
            .filter(|n| self.dependencies_of(n).iter().all(|d| done.contains(d)))
            .cloned()
            .collect()
    }

    /// Number of nodes.
    pub fn len(&self) -> usize {
        self.order.len()
    }

    /// Whether the graph has no nodes.
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}
