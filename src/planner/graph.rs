//! Dependency graph construction and ordering.
//!
//! An edge `A -> B` means A must be applied before B. Edges come from
//! explicit `depends_on` lists, from interpolation references, and from
//! recorded dependencies on resources that are being deleted (a dependent
//! is processed before the resource it depended on goes away).

use petgraph::Direction;
use petgraph::algo::{tarjan_scc, toposort};
use petgraph::dot::{Config, Dot};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::{Dfs, EdgeRef};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use tracing::debug;

use crate::error::{ConfigError, GraphError, Result};
use crate::model::{Resource, ResourceId};
use crate::state::ResourceState;

/// Why an edge exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EdgeKind {
    /// Declared in `depends_on`.
    Explicit,
    /// Inferred from an interpolation reference.
    Implicit,
    /// Recorded dependency on a resource being deleted.
    Teardown,
}

impl fmt::Display for EdgeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Explicit => write!(f, "explicit"),
            Self::Implicit => write!(f, "implicit"),
            Self::Teardown => write!(f, "teardown"),
        }
    }
}

/// An acyclic dependency graph with precomputed levels.
#[derive(Debug)]
pub struct DependencyGraph {
    graph: DiGraph<ResourceId, EdgeKind>,
    index: BTreeMap<ResourceId, NodeIndex>,
    levels: Vec<Vec<ResourceId>>,
}

/// Builds dependency graphs.
#[derive(Debug, Default)]
pub struct GraphBuilder;

impl GraphBuilder {
    /// Creates a new builder.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Builds the graph for a desired resource set.
    ///
    /// Stored resources that are no longer declared become nodes too, so that
    /// their deletion is ordered after every resource that depended on them.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::DuplicateResource` or `ConfigError::UnknownReference`
    /// for malformed input, and `GraphError::Cycle` if dependencies are circular.
    pub fn build(
        &self,
        desired: &[Resource],
        current: &BTreeMap<ResourceId, ResourceState>,
    ) -> Result<DependencyGraph> {
        let mut graph = DiGraph::new();
        let mut index = BTreeMap::new();

        for resource in desired {
            if index.contains_key(&resource.id) {
                return Err(ConfigError::DuplicateResource {
                    id: resource.id.to_string(),
                }
                .into());
            }
            index.insert(resource.id.clone(), graph.add_node(resource.id.clone()));
        }

        let deleted: BTreeSet<&ResourceId> = current.keys().filter(|id| !index.contains_key(*id)).collect();
        for id in &deleted {
            index.insert((*id).clone(), graph.add_node((*id).clone()));
        }

        for resource in desired {
            let to = index[&resource.id];

            for dep in &resource.depends_on {
                let from = Self::declared_node(&index, &deleted, resource, dep)?;
                graph.update_edge(from, to, EdgeKind::Explicit);
            }

            for dep in resource.implicit_dependencies() {
                let from = Self::declared_node(&index, &deleted, resource, &dep)?;
                if graph.find_edge(from, to).is_none() {
                    graph.add_edge(from, to, EdgeKind::Implicit);
                }
            }
        }

        for (id, state) in current {
            let from = index[id];
            for dep in state.dependencies.iter().filter(|d| deleted.contains(d)) {
                let to = index[dep];
                if graph.find_edge(from, to).is_none() {
                    graph.add_edge(from, to, EdgeKind::Teardown);
                }
            }
        }

        check_cycles(&graph)?;
        let levels = compute_levels(&graph)?;

        debug!(
            "Built dependency graph: {} nodes, {} edges, {} levels",
            graph.node_count(),
            graph.edge_count(),
            levels.len()
        );

        Ok(DependencyGraph { graph, index, levels })
    }

    /// Resolves a dependency to a node, rejecting undeclared targets.
    fn declared_node(
        index: &BTreeMap<ResourceId, NodeIndex>,
        deleted: &BTreeSet<&ResourceId>,
        resource: &Resource,
        dep: &ResourceId,
    ) -> Result<NodeIndex> {
        match index.get(dep) {
            Some(node) if !deleted.contains(dep) => Ok(*node),
            _ => Err(ConfigError::UnknownReference {
                resource: resource.id.to_string(),
                reference: dep.to_string(),
            }
            .into()),
        }
    }
}

/// Fails with every resource that participates in a cycle.
fn check_cycles(graph: &DiGraph<ResourceId, EdgeKind>) -> Result<()> {
    let mut members: Vec<String> = tarjan_scc(graph)
        .into_iter()
        .filter(|scc| scc.len() > 1 || graph.find_edge(scc[0], scc[0]).is_some())
        .flatten()
        .map(|node| graph[node].to_string())
        .collect();

    if members.is_empty() {
        return Ok(());
    }

    members.sort();
    Err(GraphError::Cycle { members }.into())
}

/// Groups nodes by longest-path depth from a root.
fn compute_levels(graph: &DiGraph<ResourceId, EdgeKind>) -> Result<Vec<Vec<ResourceId>>> {
    let order = toposort(graph, None).map_err(|cycle| GraphError::Cycle {
        members: vec![graph[cycle.node_id()].to_string()],
    })?;

    let mut depth = vec![0usize; graph.node_count()];
    for node in order {
        let level = graph
            .neighbors_directed(node, Direction::Incoming)
            .map(|pred| depth[pred.index()] + 1)
            .max()
            .unwrap_or(0);
        depth[node.index()] = level;
    }

    let level_count = depth.iter().max().map_or(0, |max| max + 1);
    let mut levels = vec![Vec::new(); level_count];
    for node in graph.node_indices() {
        levels[depth[node.index()]].push(graph[node].clone());
    }
    for level in &mut levels {
        level.sort();
    }

    Ok(levels)
}

impl DependencyGraph {
    /// Returns resources grouped by dependency level, each level sorted.
    #[must_use]
    pub fn levels(&self) -> &[Vec<ResourceId>] {
        &self.levels
    }

    /// Returns the number of nodes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    /// Returns true if the graph has no nodes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    /// Returns true if the resource is a node.
    #[must_use]
    pub fn contains(&self, id: &ResourceId) -> bool {
        self.index.contains_key(id)
    }

    /// Returns the direct prerequisites of a resource.
    #[must_use]
    pub fn dependencies(&self, id: &ResourceId) -> Vec<(ResourceId, EdgeKind)> {
        let Some(&node) = self.index.get(id) else {
            return Vec::new();
        };

        let mut deps: Vec<(ResourceId, EdgeKind)> = self
            .graph
            .edges_directed(node, Direction::Incoming)
            .map(|edge| (self.graph[edge.source()].clone(), *edge.weight()))
            .collect();
        deps.sort_by(|a, b| a.0.cmp(&b.0));
        deps
    }

    /// Returns every resource reachable from `id`, excluding `id` itself.
    #[must_use]
    pub fn descendants(&self, id: &ResourceId) -> BTreeSet<ResourceId> {
        let Some(&start) = self.index.get(id) else {
            return BTreeSet::new();
        };

        let mut found = BTreeSet::new();
        let mut dfs = Dfs::new(&self.graph, start);
        while let Some(node) = dfs.next(&self.graph) {
            if node != start {
                found.insert(self.graph[node].clone());
            }
        }
        found
    }

    /// Returns every edge as `(from, to, kind)`, sorted.
    #[must_use]
    pub fn edges(&self) -> Vec<(ResourceId, ResourceId, EdgeKind)> {
        let mut edges: Vec<_> = self
            .graph
            .edge_references()
            .map(|edge| {
                (
                    self.graph[edge.source()].clone(),
                    self.graph[edge.target()].clone(),
                    *edge.weight(),
                )
            })
            .collect();
        edges.sort_by(|a, b| (&a.0, &a.1).cmp(&(&b.0, &b.1)));
        edges
    }

    /// Renders the graph in Graphviz DOT format.
    #[must_use]
    pub fn to_dot(&self) -> String {
        format!("{}", Dot::with_config(&self.graph, &[Config::EdgeNoLabel]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ConvergeError;

    fn id(name: &str) -> ResourceId {
        ResourceId::new("svc", name)
    }

    fn res(name: &str) -> Resource {
        Resource::new(id(name))
    }

    fn build(desired: &[Resource]) -> Result<DependencyGraph> {
        GraphBuilder::new().build(desired, &BTreeMap::new())
    }

    fn names(level: &[ResourceId]) -> Vec<&str> {
        level.iter().map(|id| id.name.as_str()).collect()
    }

    #[test]
    fn test_levels_follow_longest_path() {
        // a -> b -> c, a -> c, d independent
        let graph = build(&[
            res("c").with_dependency(id("b")).with_dependency(id("a")),
            res("b").with_dependency(id("a")),
            res("a"),
            res("d"),
        ])
        .expect("acyclic");

        let levels = graph.levels();
        assert_eq!(levels.len(), 3);
        assert_eq!(names(&levels[0]), vec!["a", "d"]);
        assert_eq!(names(&levels[1]), vec!["b"]);
        assert_eq!(names(&levels[2]), vec!["c"]);
    }

    #[test]
    fn test_implicit_edges_from_references() {
        let graph = build(&[
            res("web").with_attribute("upstream", "${svc.db.host}:5432"),
            res("db"),
        ])
        .expect("acyclic");

        assert_eq!(graph.dependencies(&id("web")), vec![(id("db"), EdgeKind::Implicit)]);
        assert_eq!(names(&graph.levels()[0]), vec!["db"]);
    }

    #[test]
    fn test_explicit_edge_wins_over_implicit() {
        let graph = build(&[
            res("web")
                .with_attribute("upstream", "${svc.db.host}")
                .with_dependency(id("db")),
            res("db"),
        ])
        .expect("acyclic");

        assert_eq!(graph.edges().len(), 1);
        assert_eq!(graph.dependencies(&id("web")), vec![(id("db"), EdgeKind::Explicit)]);
    }

    #[test]
    fn test_cycle_names_every_member() {
        let err = build(&[
            res("a").with_dependency(id("c")),
            res("b").with_dependency(id("a")),
            res("c").with_dependency(id("b")),
            res("d").with_dependency(id("a")),
        ])
        .expect_err("cycle");

        match err {
            ConvergeError::Graph(GraphError::Cycle { members }) => {
                assert_eq!(members, vec!["svc.a", "svc.b", "svc.c"]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_self_reference_is_cycle() {
        let err = build(&[res("a").with_attribute("name", "${svc.a.uid}")]).expect_err("self cycle");
        assert!(matches!(err, ConvergeError::Graph(GraphError::Cycle { ref members }) if members == &["svc.a"]));
    }

    #[test]
    fn test_unknown_reference() {
        let err = build(&[res("a").with_dependency(id("ghost"))]).expect_err("unknown");
        assert!(matches!(err, ConvergeError::Config(ConfigError::UnknownReference { .. })));
    }

    #[test]
    fn test_duplicate_resource() {
        let err = build(&[res("a"), res("a")]).expect_err("duplicate");
        assert!(matches!(err, ConvergeError::Config(ConfigError::DuplicateResource { .. })));
    }

    #[test]
    fn test_descendants_are_transitive() {
        let graph = build(&[
            res("a"),
            res("b").with_dependency(id("a")),
            res("c").with_dependency(id("b")),
            res("d"),
        ])
        .expect("acyclic");

        assert_eq!(graph.descendants(&id("a")), BTreeSet::from([id("b"), id("c")]));
        assert!(graph.descendants(&id("d")).is_empty());
    }

    #[test]
    fn test_teardown_orders_dependents_before_deletion() {
        let db = ResourceState::new(id("db"), BTreeMap::new());
        let web = ResourceState::new(id("web"), BTreeMap::new()).with_dependencies(vec![id("db")]);
        let current = BTreeMap::from([(db.id.clone(), db), (web.id.clone(), web)]);

        // web stays declared but drops its dependency; db is deleted
        let graph = GraphBuilder::new()
            .build(&[res("web")], &current)
            .expect("acyclic");

        assert_eq!(graph.dependencies(&id("db")), vec![(id("web"), EdgeKind::Teardown)]);
        assert_eq!(names(&graph.levels()[0]), vec!["web"]);
        assert_eq!(names(&graph.levels()[1]), vec!["db"]);
    }

    #[test]
    fn test_dot_output() {
        let graph = build(&[res("a"), res("b").with_dependency(id("a"))]).expect("acyclic");
        let dot = graph.to_dot();
        assert!(dot.starts_with("digraph"));
        assert!(dot.contains("svc.a"));
    }
}
