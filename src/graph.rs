//! Task graph construction and data-dependency resolution
//!
//! Uses petgraph to keep a DAG of tasks where an edge runs from the task
//! producing a file to every task consuming it (as an input or a scanned
//! dependency). The graph grows while a build runs, as tasks spawn tasks.

use petgraph::algo::{is_cyclic_directed, toposort};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;

use crate::error::{BobError, Result};
use crate::project::{Task, TaskId};

/// A node in the task graph
#[derive(Debug, Clone)]
pub struct TaskNode {
    pub id: TaskId,
    pub name: String,
}

/// The task data-dependency graph
#[derive(Debug, Default)]
pub struct TaskGraph {
    graph: DiGraph<TaskNode, ()>,
    id_to_index: HashMap<TaskId, NodeIndex>,
    producers: HashMap<PathBuf, Vec<NodeIndex>>,
    consumers: HashMap<PathBuf, Vec<NodeIndex>>,
}

impl TaskGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a graph from already registered (and scanned) tasks
    pub fn from_tasks<'a>(tasks: impl IntoIterator<Item = &'a Task>) -> Result<Self> {
        let mut graph = Self::new();
        for task in tasks {
            graph.add_task(task);
        }
        graph.check_acyclic()?;
        Ok(graph)
    }

    /// Add a task and link it to the tasks already present.
    ///
    /// Tasks without an arena id are ignored.
    pub fn add_task(&mut self, task: &Task) {
        let Some(id) = task.id() else {
            return;
        };
        if self.id_to_index.contains_key(&id) {
            return;
        }

        let idx = self.graph.add_node(TaskNode {
            id,
            name: task.name.clone(),
        });
        self.id_to_index.insert(id, idx);

        let consumed: HashSet<&PathBuf> = task.inputs.iter().chain(task.dependencies()).collect();

        for path in &consumed {
            if let Some(producers) = self.producers.get(*path) {
                for &producer in producers {
                    if producer != idx {
                        self.graph.update_edge(producer, idx, ());
                    }
                }
            }
        }

        for path in &task.outputs {
            if let Some(consumers) = self.consumers.get(path) {
                for &consumer in consumers {
                    if consumer != idx {
                        self.graph.update_edge(idx, consumer, ());
                    }
                }
            }
        }

        for path in consumed {
            self.consumers.entry(path.clone()).or_default().push(idx);
        }
        for path in &task.outputs {
            self.producers.entry(path.clone()).or_default().push(idx);
        }
    }

    /// Link scanned dependencies of an already added task to their producers
    pub fn add_dependencies<'a>(&mut self, id: TaskId, deps: impl IntoIterator<Item = &'a PathBuf>) {
        let Some(&idx) = self.id_to_index.get(&id) else {
            return;
        };

        for path in deps {
            let consumers = self.consumers.entry(path.clone()).or_default();
            if consumers.contains(&idx) {
                continue;
            }
            consumers.push(idx);

            if let Some(producers) = self.producers.get(path) {
                for &producer in producers {
                    if producer != idx {
                        self.graph.update_edge(producer, idx, ());
                    }
                }
            }
        }
    }

    /// Fail with a readable cycle description if the graph has one
    pub fn check_acyclic(&self) -> Result<()> {
        if is_cyclic_directed(&self.graph) {
            return Err(BobError::CyclicDependency {
                cycle: self.find_cycle_description(),
            });
        }
        Ok(())
    }

    /// All tasks in an order where producers precede consumers
    pub fn ordered(&self) -> Result<Vec<&TaskNode>> {
        let sorted = toposort(&self.graph, None).map_err(|_| BobError::CyclicDependency {
            cycle: self.find_cycle_description(),
        })?;

        Ok(sorted.into_iter().map(|idx| &self.graph[idx]).collect())
    }

    /// Tasks producing files this task consumes
    pub fn producers(&self, id: TaskId) -> Vec<TaskId> {
        self.neighbors(id, Direction::Incoming)
    }

    /// Tasks consuming files this task produces
    pub fn consumers(&self, id: TaskId) -> Vec<TaskId> {
        self.neighbors(id, Direction::Outgoing)
    }

    fn neighbors(&self, id: TaskId, direction: Direction) -> Vec<TaskId> {
        let Some(&idx) = self.id_to_index.get(&id) else {
            return Vec::new();
        };
        let mut ids: Vec<TaskId> = self
            .graph
            .neighbors_directed(idx, direction)
            .map(|n| self.graph[n].id)
            .collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    /// `(producer, consumer)` pairs
    pub fn edges(&self) -> Vec<(TaskId, TaskId)> {
        let mut edges: Vec<_> = self
            .graph
            .raw_edges()
            .iter()
            .map(|e| (self.graph[e.source()].id, self.graph[e.target()].id))
            .collect();
        edges.sort();
        edges
    }

    pub fn node(&self, id: TaskId) -> Option<&TaskNode> {
        self.id_to_index.get(&id).map(|&idx| &self.graph[idx])
    }

    /// Find a human-readable description of a cycle
    fn find_cycle_description(&self) -> String {
        let mut starts: Vec<_> = self.id_to_index.iter().collect();
        starts.sort_by_key(|(id, _)| **id);

        for (_, &idx) in starts {
            let mut visited = HashSet::new();
            let mut path = vec![self.label(idx)];

            if self.dfs_find_cycle(idx, idx, &mut visited, &mut path) {
                return path.join(" -> ");
            }
        }

        "Unknown cycle".to_string()
    }

    fn dfs_find_cycle(
        &self,
        current: NodeIndex,
        target: NodeIndex,
        visited: &mut HashSet<NodeIndex>,
        path: &mut Vec<String>,
    ) -> bool {
        for neighbor in self.graph.neighbors(current) {
            if neighbor == target {
                path.push(self.label(target));
                return true;
            }

            if visited.insert(neighbor) {
                path.push(self.label(neighbor));
                if self.dfs_find_cycle(neighbor, target, visited, path) {
                    return true;
                }
                path.pop();
            }
        }

        false
    }

    fn label(&self, idx: NodeIndex) -> String {
        let node = &self.graph[idx];
        format!("{}{}", node.name, node.id)
    }
}
