//! Task graph: cycle detection, upstream/downstream closures and the ready set.
//!
//! Uses `petgraph` to model task dependencies as a directed graph with an edge
//! from each dependency to its dependent. Cycle detection is a depth-first
//! traversal that keeps an explicit recursion-stack set, so the offending path
//! can be reported.

use std::collections::{HashMap, HashSet};

use nuoc_types::definition::TaskDefinition;
use nuoc_types::task::{Task, TaskStatus};
use petgraph::Direction;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::{Bfs, Reversed};

use super::definition::DefinitionError;

/// Dependency graph of the tasks of one job.
#[derive(Debug)]
pub struct TaskGraph {
    graph: DiGraph<String, ()>,
    index: HashMap<String, NodeIndex>,
}

impl TaskGraph {
    /// Build a graph from `(name, depends_on)` pairs.
    ///
    /// Fails on a dependency that names no node. Does not reject cycles; use
    /// [`TaskGraph::find_cycle`] for that.
    pub fn build<'a, I>(nodes: I) -> Result<Self, DefinitionError>
    where
        I: IntoIterator<Item = (&'a str, &'a [String])>,
    {
        let nodes: Vec<(&str, &[String])> = nodes.into_iter().collect();
        let mut graph = DiGraph::<String, ()>::new();
        let mut index = HashMap::new();
        for (name, _) in &nodes {
            index.insert(name.to_string(), graph.add_node(name.to_string()));
        }

        for (name, deps) in &nodes {
            let to = index[*name];
            for dep in *deps {
                let from = index.get(dep.as_str()).ok_or_else(|| {
                    DefinitionError::UnknownDependency(format!(
                        "task '{name}' depends on unknown task '{dep}'"
                    ))
                })?;
                graph.add_edge(*from, to, ());
            }
        }

        Ok(Self { graph, index })
    }

    pub fn from_definitions(tasks: &[TaskDefinition]) -> Result<Self, DefinitionError> {
        Self::build(tasks.iter().map(|t| (t.name.as_str(), t.depends_on.as_slice())))
    }

    pub fn from_tasks(tasks: &[Task]) -> Result<Self, DefinitionError> {
        Self::build(tasks.iter().map(|t| (t.name.as_str(), t.depends_on.as_slice())))
    }

    /// Returns the first cycle found as a path that starts and ends on the
    /// same task, e.g. `["a", "b", "a"]`.
    pub fn find_cycle(&self) -> Option<Vec<String>> {
        let mut visited = HashSet::new();
        let mut on_stack = HashSet::new();
        let mut path = Vec::new();

        for node in self.graph.node_indices() {
            if !visited.contains(&node) {
                if let Some(cycle) = self.visit(node, &mut visited, &mut on_stack, &mut path) {
                    return Some(cycle);
                }
            }
        }
        None
    }

    fn visit(
        &self,
        node: NodeIndex,
        visited: &mut HashSet<NodeIndex>,
        on_stack: &mut HashSet<NodeIndex>,
        path: &mut Vec<NodeIndex>,
    ) -> Option<Vec<String>> {
        visited.insert(node);
        on_stack.insert(node);
        path.push(node);

        for next in self.graph.neighbors_directed(node, Direction::Outgoing) {
            if on_stack.contains(&next) {
                let start = path.iter().position(|n| *n == next).unwrap_or(0);
                let mut cycle: Vec<String> =
                    path[start..].iter().map(|n| self.graph[*n].clone()).collect();
                cycle.push(self.graph[next].clone());
                return Some(cycle);
            }
            if !visited.contains(&next) {
                if let Some(cycle) = self.visit(next, visited, on_stack, path) {
                    return Some(cycle);
                }
            }
        }

        on_stack.remove(&node);
        path.pop();
        None
    }

    /// `name` plus every task that transitively depends on it.
    pub fn downstream_inclusive(&self, name: &str) -> HashSet<String> {
        let Some(&start) = self.index.get(name) else {
            return HashSet::new();
        };
        let mut found = HashSet::new();
        let mut bfs = Bfs::new(&self.graph, start);
        while let Some(node) = bfs.next(&self.graph) {
            found.insert(self.graph[node].clone());
        }
        found
    }

    /// Every task `name` transitively depends on (excluding `name`).
    pub fn upstream(&self, name: &str) -> HashSet<String> {
        let Some(&start) = self.index.get(name) else {
            return HashSet::new();
        };
        let reversed = Reversed(&self.graph);
        let mut found = HashSet::new();
        let mut bfs = Bfs::new(reversed, start);
        while let Some(node) = bfs.next(reversed) {
            if node != start {
                found.insert(self.graph[node].clone());
            }
        }
        found
    }
}

/// Pending tasks whose dependencies are all completed or skipped, ordered by
/// priority (highest first) with the name as tie-break.
pub fn ready_set(tasks: &[Task]) -> Vec<&Task> {
    let status: HashMap<&str, TaskStatus> =
        tasks.iter().map(|t| (t.name.as_str(), t.status)).collect();

    let mut ready: Vec<&Task> = tasks
        .iter()
        .filter(|t| t.status == TaskStatus::Pending)
        .filter(|t| {
            t.depends_on
                .iter()
                .all(|dep| status.get(dep.as_str()).is_some_and(|s| s.is_settled()))
        })
        .collect();
    ready.sort_by(|a, b| b.priority.cmp(&a.priority).then_with(|| a.name.cmp(&b.name)));
    ready
}
