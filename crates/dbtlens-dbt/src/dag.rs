//! Dependency graph (DAG) construction and traversal
//!
//! Builds forward and reverse dependency graphs for selection, staleness
//! propagation and impact analysis.

use std::collections::{BTreeMap, BTreeSet, HashSet, VecDeque};
use crate::project::Project;

/// Node identifier (model name, macro name, or canonical source name)
pub type NodeId = String;

/// Kind of node in the graph
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeType {
    Model,
    Macro,
    Source,
}

/// Dependency graph with forward and reverse edges
#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    /// Forward edges: node -> list of nodes it depends on (parents)
    parents: BTreeMap<NodeId, Vec<NodeId>>,

    /// Reverse edges: node -> list of nodes that depend on it (children)
    children: BTreeMap<NodeId, Vec<NodeId>>,

    /// All nodes in the graph with their kind
    nodes: BTreeMap<NodeId, NodeType>,
}

impl DependencyGraph {
    /// Build a dependency graph from a project snapshot
    pub fn from_project(project: &Project) -> Self {
        let mut graph = Self::default();

        // Models first so a macro or source sharing a model's name never shadows it
        for name in project.models.keys() {
            graph.add_node(name, NodeType::Model);
        }
        for name in project.sources.keys() {
            graph.add_node(name, NodeType::Source);
        }
        for name in project.macros.keys() {
            graph.add_node(name, NodeType::Macro);
        }

        for (name, model) in &project.models {
            let deps = &model.depends_on;
            for dep in &deps.models {
                graph.add_edge(dep, name, NodeType::Model);
            }
            for dep in &deps.sources {
                graph.add_edge(dep, name, NodeType::Source);
            }
            for dep in &deps.macros {
                graph.add_edge(dep, name, NodeType::Macro);
            }
        }

        tracing::debug!(
            nodes = graph.nodes.len(),
            edges = graph.parents.values().map(Vec::len).sum::<usize>(),
            "built dependency graph"
        );

        graph
    }

    fn add_node(&mut self, id: &str, node_type: NodeType) {
        self.nodes.entry(id.to_string()).or_insert(node_type);
    }

    /// Record that `child` depends on `parent`
    fn add_edge(&mut self, parent: &str, child: &str, parent_type: NodeType) {
        self.add_node(parent, parent_type);

        let parents = self.parents.entry(child.to_string()).or_default();
        if !parents.iter().any(|p| p == parent) {
            parents.push(parent.to_string());
            self.children
                .entry(parent.to_string())
                .or_default()
                .push(child.to_string());
        }
    }

    /// Get all nodes in the graph
    pub fn all_nodes(&self) -> Vec<&NodeId> {
        self.nodes.keys().collect()
    }

    /// Whether the node exists
    pub fn contains(&self, node_id: &str) -> bool {
        self.nodes.contains_key(node_id)
    }

    /// Kind of a node, if present
    pub fn node_type(&self, node_id: &str) -> Option<NodeType> {
        self.nodes.get(node_id).copied()
    }

    /// Get immediate parents (dependencies) of a node
    pub fn parents(&self, node_id: &str) -> Vec<&NodeId> {
        self.parents
            .get(node_id)
            .map(|deps| deps.iter().collect())
            .unwrap_or_default()
    }

    /// Get immediate children (dependents) of a node
    pub fn children(&self, node_id: &str) -> Vec<&NodeId> {
        self.children
            .get(node_id)
            .map(|deps| deps.iter().collect())
            .unwrap_or_default()
    }

    /// Get all downstream nodes (transitive closure of children)
    ///
    /// This is the "blast radius" - all models affected if this node changes.
    pub fn downstream(&self, node_id: &str) -> Vec<NodeId> {
        Self::closure(&self.children, node_id)
    }

    /// Get all upstream nodes (transitive closure of parents)
    pub fn upstream(&self, node_id: &str) -> Vec<NodeId> {
        Self::closure(&self.parents, node_id)
    }

    /// BFS over one edge direction, excluding the start node
    fn closure(edges: &BTreeMap<NodeId, Vec<NodeId>>, node_id: &str) -> Vec<NodeId> {
        let mut visited: HashSet<&str> = HashSet::new();
        let mut queue: VecDeque<&str> = VecDeque::new();
        let mut result = Vec::new();

        visited.insert(node_id);
        if let Some(next) = edges.get(node_id) {
            queue.extend(next.iter().map(String::as_str));
        }

        while let Some(current) = queue.pop_front() {
            if !visited.insert(current) {
                continue;
            }
            result.push(current.to_string());

            if let Some(next) = edges.get(current) {
                queue.extend(next.iter().map(String::as_str).filter(|n| !visited.contains(n)));
            }
        }

        result
    }

    /// Check if there's a path from source to target
    pub fn has_path(&self, source: &str, target: &str) -> bool {
        self.downstream(source).iter().any(|n| n == target)
    }

    /// Get topological sort of all nodes (parents before children)
    ///
    /// Returns `None` when the graph has a cycle.
    pub fn topological_sort(&self) -> Option<Vec<NodeId>> {
        let mut in_degree: BTreeMap<&str, usize> = self
            .nodes
            .keys()
            .map(|node| (node.as_str(), self.parents.get(node).map_or(0, Vec::len)))
            .collect();

        let mut queue: VecDeque<&str> = in_degree
            .iter()
            .filter(|(_, &degree)| degree == 0)
            .map(|(&node, _)| node)
            .collect();

        let mut result = Vec::with_capacity(self.nodes.len());

        // Kahn's algorithm
        while let Some(node) = queue.pop_front() {
            result.push(node.to_string());

            for child in self.children.get(node).into_iter().flatten() {
                if let Some(degree) = in_degree.get_mut(child.as_str()) {
                    *degree -= 1;
                    if *degree == 0 {
                        queue.push_back(child.as_str());
                    }
                }
            }
        }

        (result.len() == self.nodes.len()).then_some(result)
    }

    /// Model nodes only, from a list of node ids
    pub fn only_models<'a>(&self, ids: impl IntoIterator<Item = &'a NodeId>) -> BTreeSet<NodeId> {
        ids.into_iter()
            .filter(|id| self.node_type(id) == Some(NodeType::Model))
            .cloned()
            .collect()
    }
}
