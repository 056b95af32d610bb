//! Dependency graph construction and topological ordering.
//!
//! The graph uses an arena representation: module names map to dense
//! integer ids (sorted by name, so iteration is deterministic), and edges
//! live in plain adjacency vectors.  Ordering is Kahn's algorithm with a
//! sorted ready set — among modules whose dependencies are all satisfied,
//! the lexicographically smallest name activates first.  Cycles are
//! recovered with a DFS and reported in full.

use std::collections::{BTreeSet, HashMap};

use maestro_manifest::ModuleManifest;

use crate::error::{MissingRef, ResolveError, Result};

// ---------------------------------------------------------------------------
// Graph
// ---------------------------------------------------------------------------

/// Directed dependency graph over a set of module manifests.
///
/// Immutable once built; manifest changes require a fresh build.
#[derive(Debug)]
pub struct DependencyGraph {
    /// Node id → module name, sorted so id order is name order.
    names: Vec<String>,

    /// Edges node → the nodes it depends on (its prerequisites).
    dependencies: Vec<Vec<usize>>,

    /// Reverse edges node → the nodes depending on it.
    dependents: Vec<Vec<usize>>,
}

impl DependencyGraph {
    /// Build the graph for a manifest set.
    ///
    /// # Errors
    ///
    /// [`ResolveError::MissingDependency`] naming every module that
    /// references a dependency no manifest in the set satisfies.
    pub fn build(manifests: &[ModuleManifest]) -> Result<Self> {
        let mut names: Vec<String> = manifests.iter().map(|m| m.name.clone()).collect();
        names.sort_unstable();

        let index: HashMap<&str, usize> = names
            .iter()
            .enumerate()
            .map(|(i, name)| (name.as_str(), i))
            .collect();

        // Collect every dangling reference before failing: the caller gets
        // the complete picture in one error.
        let mut missing: Vec<MissingRef> = Vec::new();
        let mut dependencies = vec![Vec::new(); names.len()];
        let mut dependents = vec![Vec::new(); names.len()];

        for manifest in manifests {
            let from = index[manifest.name.as_str()];
            let mut seen = BTreeSet::new();
            for dep in &manifest.depends.modules {
                match index.get(dep.as_str()) {
                    Some(&to) => {
                        // Duplicate declarations collapse to one edge.
                        if seen.insert(to) {
                            dependencies[from].push(to);
                            dependents[to].push(from);
                        }
                    }
                    None => missing.push(MissingRef {
                        module: manifest.name.clone(),
                        requires: dep.clone(),
                    }),
                }
            }
        }

        if !missing.is_empty() {
            missing.sort_by(|a, b| (&a.module, &a.requires).cmp(&(&b.module, &b.requires)));
            return Err(ResolveError::MissingDependency {
                references: missing,
            });
        }

        for edges in dependencies.iter_mut().chain(dependents.iter_mut()) {
            edges.sort_unstable();
        }

        tracing::debug!(modules = names.len(), "dependency graph built");
        Ok(Self {
            names,
            dependencies,
            dependents,
        })
    }

    /// Number of modules in the graph.
    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// Compute a valid activation order via Kahn's algorithm.
    ///
    /// # Errors
    ///
    /// [`ResolveError::Cycle`] with the full cycle when no topological
    /// order exists.
    pub fn activation_order(&self) -> Result<ActivationOrder> {
        let n = self.names.len();
        let mut indegree: Vec<usize> = self.dependencies.iter().map(Vec::len).collect();

        // Sorted ready set: ties break by name because ids are name-ordered.
        let mut ready: BTreeSet<usize> = (0..n).filter(|&i| indegree[i] == 0).collect();
        let mut order: Vec<usize> = Vec::with_capacity(n);

        while let Some(&node) = ready.iter().next() {
            ready.remove(&node);
            order.push(node);

            for &dependent in &self.dependents[node] {
                indegree[dependent] -= 1;
                if indegree[dependent] == 0 {
                    ready.insert(dependent);
                }
            }
        }

        if order.len() < n {
            let members = self
                .find_cycle()
                .expect("unsorted nodes remain, a cycle must exist");
            return Err(ResolveError::Cycle {
                members: members.into_iter().map(|i| self.names[i].clone()).collect(),
            });
        }

        let order: Vec<String> = order.into_iter().map(|i| self.names[i].clone()).collect();

        let dependencies = self
            .names
            .iter()
            .enumerate()
            .map(|(i, name)| (name.clone(), self.resolve_names(&self.dependencies[i])))
            .collect();
        let dependents = self
            .names
            .iter()
            .enumerate()
            .map(|(i, name)| (name.clone(), self.resolve_names(&self.dependents[i])))
            .collect();

        tracing::debug!(order = ?order, "activation order resolved");
        Ok(ActivationOrder {
            order,
            dependencies,
            dependents,
        })
    }

    // -- Internal helpers ---------------------------------------------------

    fn resolve_names(&self, ids: &[usize]) -> Vec<String> {
        ids.iter().map(|&i| self.names[i].clone()).collect()
    }

    /// Locate one cycle by DFS over dependency edges, returning its nodes
    /// in dependency order, rotated so the smallest name leads.
    fn find_cycle(&self) -> Option<Vec<usize>> {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            White,
            Gray,
            Black,
        }

        let mut marks = vec![Mark::White; self.names.len()];
        let mut stack = Vec::new();

        fn dfs(
            graph: &DependencyGraph,
            node: usize,
            marks: &mut [Mark],
            stack: &mut Vec<usize>,
        ) -> Option<Vec<usize>> {
            marks[node] = Mark::Gray;
            stack.push(node);

            for &dep in &graph.dependencies[node] {
                match marks[dep] {
                    Mark::Gray => {
                        // Back edge: the cycle is the stack from `dep` down.
                        let start = stack.iter().position(|&n| n == dep)?;
                        return Some(stack[start..].to_vec());
                    }
                    Mark::White => {
                        if let Some(cycle) = dfs(graph, dep, marks, stack) {
                            return Some(cycle);
                        }
                    }
                    Mark::Black => {}
                }
            }

            stack.pop();
            marks[node] = Mark::Black;
            None
        }

        for start in 0..self.names.len() {
            if marks[start] == Mark::White
                && let Some(mut cycle) = dfs(self, start, &mut marks, &mut stack)
            {
                // Deterministic reporting: rotate the smallest id first.
                let min_pos = cycle
                    .iter()
                    .enumerate()
                    .min_by_key(|&(_, &id)| id)
                    .map(|(pos, _)| pos)
                    .unwrap_or(0);
                cycle.rotate_left(min_pos);
                return Some(cycle);
            }
        }
        None
    }
}

// ---------------------------------------------------------------------------
// Activation order
// ---------------------------------------------------------------------------

/// A valid activation order plus the adjacency the orchestrator needs to
/// schedule it as a dataflow.
#[derive(Debug, Clone)]
pub struct ActivationOrder {
    order: Vec<String>,
    dependencies: HashMap<String, Vec<String>>,
    dependents: HashMap<String, Vec<String>>,
}

impl ActivationOrder {
    /// Module names in activation order.
    pub fn modules(&self) -> &[String] {
        &self.order
    }

    /// Direct prerequisites of a module, sorted by name.
    pub fn dependencies_of(&self, name: &str) -> &[String] {
        self.dependencies.get(name).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Direct dependents of a module, sorted by name.
    pub fn dependents_of(&self, name: &str) -> &[String] {
        self.dependents.get(name).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.dependencies.contains_key(name)
    }
}

/// Resolve a manifest set straight to an activation order.
pub fn resolve(manifests: &[ModuleManifest]) -> Result<ActivationOrder> {
    DependencyGraph::build(manifests)?.activation_order()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
