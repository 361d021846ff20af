//! Dependency graph construction and ordering.
//!
//! Explicit `depends_on` declarations are unioned with one synthesized edge
//! per network-sharing service onto its sharing target, so the scheduler
//! needs a single ordering algorithm and no namespace special cases.

use crate::{Error, Manifest, NetworkMode, Result};
use std::collections::{BTreeSet, HashMap};

/// Directed acyclic graph over the manifest's service names.
///
/// Immutable after construction; derived once per deployment.
#[derive(Debug, Clone)]
pub struct DependencyGraph {
    /// Node names in declaration order.
    nodes: Vec<String>,
    index: HashMap<String, usize>,
    /// Dependencies of each node (edges pointing at what must start first).
    deps: Vec<Vec<usize>>,
    /// Reverse edges, for finding dependents.
    dependents: Vec<Vec<usize>>,
}

impl DependencyGraph {
    /// Build the graph from a validated manifest.
    ///
    /// Every `network_mode: service:X` declaration contributes an implicit
    /// dependency on `X`: a member cannot start before the namespace it
    /// joins exists.
    pub fn from_manifest(manifest: &Manifest) -> Self {
        let nodes: Vec<String> = manifest.names().map(str::to_string).collect();
        let index: HashMap<String, usize> = nodes
            .iter()
            .enumerate()
            .map(|(i, n)| (n.clone(), i))
            .collect();

        let mut deps: Vec<Vec<usize>> = vec![Vec::new(); nodes.len()];
        for (i, spec) in manifest.services().enumerate() {
            for dep in &spec.depends_on {
                let j = index[dep];
                if !deps[i].contains(&j) {
                    deps[i].push(j);
                }
            }
            if let NetworkMode::Service(target) = &spec.network_mode {
                let j = index[target];
                if !deps[i].contains(&j) {
                    deps[i].push(j);
                }
            }
        }

        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); nodes.len()];
        for (i, ds) in deps.iter().enumerate() {
            for &j in ds {
                dependents[j].push(i);
            }
        }

        Self {
            nodes,
            index,
            deps,
            dependents,
        }
    }

    /// All node names in declaration order.
    pub fn nodes(&self) -> impl Iterator<Item = &str> {
        self.nodes.iter().map(String::as_str)
    }

    /// Direct dependencies of a service.
    pub fn dependencies_of(&self, name: &str) -> Vec<&str> {
        self.index
            .get(name)
            .map(|&i| self.deps[i].iter().map(|&j| self.nodes[j].as_str()).collect())
            .unwrap_or_default()
    }

    /// Services that directly depend on the given one.
    pub fn dependents_of(&self, name: &str) -> Vec<&str> {
        self.index
            .get(name)
            .map(|&i| {
                self.dependents[i]
                    .iter()
                    .map(|&j| self.nodes[j].as_str())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Every service reachable by following dependent edges from `name`.
    ///
    /// Used to contain a failure to its own branch of the graph.
    pub fn transitive_dependents(&self, name: &str) -> Vec<String> {
        let Some(&start) = self.index.get(name) else {
            return Vec::new();
        };
        let mut seen = vec![false; self.nodes.len()];
        let mut stack = vec![start];
        let mut out = Vec::new();
        while let Some(i) = stack.pop() {
            for &j in &self.dependents[i] {
                if !seen[j] {
                    seen[j] = true;
                    out.push(self.nodes[j].clone());
                    stack.push(j);
                }
            }
        }
        out
    }

    /// Produce the default start sequence: a topological order with ties
    /// broken by declaration order. The reverse is the default stop order.
    pub fn topological_order(&self) -> Result<Vec<String>> {
        let mut in_degree: Vec<usize> = self.deps.iter().map(Vec::len).collect();

        // BTreeSet over declaration indices keeps tie-breaking deterministic.
        let mut ready: BTreeSet<usize> = in_degree
            .iter()
            .enumerate()
            .filter(|&(_, &d)| d == 0)
            .map(|(i, _)| i)
            .collect();

        let mut order = Vec::with_capacity(self.nodes.len());
        while let Some(i) = ready.pop_first() {
            order.push(self.nodes[i].clone());
            for &j in &self.dependents[i] {
                in_degree[j] -= 1;
                if in_degree[j] == 0 {
                    ready.insert(j);
                }
            }
        }

        if order.len() != self.nodes.len() {
            return Err(Error::CyclicDependency { cycle: self.find_cycle() });
        }
        Ok(order)
    }

    /// Locate one dependency cycle for error reporting.
    ///
    /// Depth-first traversal with an in-progress marker; the returned path
    /// starts and ends at the same service.
    fn find_cycle(&self) -> Vec<String> {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            White,
            InProgress,
            Done,
        }

        fn visit(
            graph: &DependencyGraph,
            node: usize,
            marks: &mut Vec<Mark>,
            path: &mut Vec<usize>,
        ) -> Option<Vec<usize>> {
            marks[node] = Mark::InProgress;
            path.push(node);
            for &dep in &graph.deps[node] {
                match marks[dep] {
                    Mark::InProgress => {
                        let from = path.iter().position(|&n| n == dep).unwrap_or(0);
                        let mut cycle: Vec<usize> = path[from..].to_vec();
                        cycle.push(dep);
                        return Some(cycle);
                    }
                    Mark::White => {
                        if let Some(cycle) = visit(graph, dep, marks, path) {
                            return Some(cycle);
                        }
                    }
                    Mark::Done => {}
                }
            }
            path.pop();
            marks[node] = Mark::Done;
            None
        }

        let mut marks = vec![Mark::White; self.nodes.len()];
        for start in 0..self.nodes.len() {
            if marks[start] == Mark::White {
                let mut path = Vec::new();
                if let Some(cycle) = visit(self, start, &mut marks, &mut path) {
                    return cycle.into_iter().map(|i| self.nodes[i].clone()).collect();
                }
            }
        }
        Vec::new()
    }
}
