//! # Resource graph
//!
//! Dependency graph of a bundle's resources, rebuilt on every pass.
//!
//! Nodes are added in declaration order so a node's index is its position in
//! the bundle. Edges point from a dependency to its dependent.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};

use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;

use crate::error::ReconcileError;
use crate::types::Resource;

/// Node colour during cycle detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mark {
    Unvisited,
    InProgress,
    Done,
}

/// Validated dependency graph over borrowed resources.
#[derive(Debug)]
pub struct ResourceGraph<'a> {
    resources: &'a [Resource],
    graph: DiGraph<usize, ()>,
    order: Vec<usize>,
}

impl<'a> ResourceGraph<'a> {
    /// Build and validate the graph.
    ///
    /// # Errors
    ///
    /// * `DuplicateName` when two resources share a name
    /// * `UnknownDependency` when `dependsOn` names a missing resource
    /// * `Cycle` naming one member of a dependency cycle
    pub fn build(resources: &'a [Resource]) -> Result<Self, ReconcileError> {
        let mut graph = DiGraph::with_capacity(resources.len(), resources.len());
        let mut index_of: HashMap<&str, NodeIndex> = HashMap::with_capacity(resources.len());

        for (i, resource) in resources.iter().enumerate() {
            if index_of.contains_key(resource.name.as_str()) {
                return Err(ReconcileError::DuplicateName {
                    name: resource.name.clone(),
                });
            }
            index_of.insert(resource.name.as_str(), graph.add_node(i));
        }

        for (i, resource) in resources.iter().enumerate() {
            let to = NodeIndex::new(i);
            for dependency in &resource.depends_on {
                let from = index_of.get(dependency.as_str()).copied().ok_or_else(|| {
                    ReconcileError::UnknownDependency {
                        resource: resource.name.clone(),
                        dependency: dependency.clone(),
                    }
                })?;
                graph.update_edge(from, to, ());
            }
        }

        let mut built = Self {
            resources,
            graph,
            order: Vec::new(),
        };
        if let Some(member) = built.find_cycle() {
            return Err(ReconcileError::Cycle {
                name: resources[member].name.clone(),
            });
        }
        built.order = built.topological_order();
        Ok(built)
    }

    /// Three-colour DFS. Returns the node that closed a cycle, if any.
    fn find_cycle(&self) -> Option<usize> {
        let mut marks = vec![Mark::Unvisited; self.graph.node_count()];
        (0..self.graph.node_count()).find_map(|start| {
            if marks[start] == Mark::Unvisited {
                self.visit(start, &mut marks)
            } else {
                None
            }
        })
    }

    /// Depth-first walk from `start` with an explicit stack of
    /// (node, dependents, next dependent to look at).
    fn visit(&self, start: usize, marks: &mut [Mark]) -> Option<usize> {
        marks[start] = Mark::InProgress;
        let mut stack = vec![(start, self.dependents(start), 0)];
        loop {
            let (node, dependents, cursor) = stack.last_mut()?;
            let Some(&next) = dependents.get(*cursor) else {
                marks[*node] = Mark::Done;
                stack.pop();
                continue;
            };
            *cursor += 1;
            match marks[next] {
                Mark::InProgress => return Some(next),
                Mark::Unvisited => {
                    marks[next] = Mark::InProgress;
                    stack.push((next, self.dependents(next), 0));
                }
                Mark::Done => {}
            }
        }
    }

    /// Kahn's algorithm; among ready nodes the earliest declared goes first.
    fn topological_order(&self) -> Vec<usize> {
        let mut pending: Vec<usize> = (0..self.len()).map(|i| self.dependencies(i).len()).collect();
        let mut ready: BinaryHeap<Reverse<usize>> = pending
            .iter()
            .enumerate()
            .filter(|(_, count)| **count == 0)
            .map(|(i, _)| Reverse(i))
            .collect();

        let mut order = Vec::with_capacity(self.len());
        while let Some(Reverse(node)) = ready.pop() {
            order.push(node);
            for dependent in self.dependents(node) {
                pending[dependent] -= 1;
                if pending[dependent] == 0 {
                    ready.push(Reverse(dependent));
                }
            }
        }
        order
    }

    /// Node indices in topological order.
    pub fn order(&self) -> &[usize] {
        &self.order
    }

    pub fn resource(&self, node: usize) -> &'a Resource {
        &self.resources[node]
    }

    /// Direct dependencies of `node`, in declaration order.
    pub fn dependencies(&self, node: usize) -> Vec<usize> {
        self.neighbors(node, Direction::Incoming)
    }

    /// Direct dependents of `node`, in declaration order.
    pub fn dependents(&self, node: usize) -> Vec<usize> {
        self.neighbors(node, Direction::Outgoing)
    }

    fn neighbors(&self, node: usize, direction: Direction) -> Vec<usize> {
        let mut result: Vec<usize> = self
            .graph
            .neighbors_directed(NodeIndex::new(node), direction)
            .map(|n| self.graph[n])
            .collect();
        result.sort_unstable();
        result
    }

    pub fn len(&self) -> usize {
        self.resources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    /// Resource names in topological order.
    pub fn ordered_names(&self) -> Vec<&'a str> {
        self.order
            .iter()
            .map(|&i| self.resources[i].name.as_str())
            .collect()
    }
}
