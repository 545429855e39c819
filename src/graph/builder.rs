//! Dependency graph construction and ordering.

use std::collections::{btree_set, BTreeSet, HashMap, VecDeque};
use tracing::debug;

use crate::deployment::ResourceNode;
use crate::error::GraphError;

/// Dependency graph over logical resource names.
///
/// Edges run from a producer to each consumer of its outputs. Indices follow
/// declaration order, which is also the tie-break for every ordering.
#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    names: Vec<String>,
    index: HashMap<String, usize>,
    /// consumer -> producers
    dependencies: Vec<BTreeSet<usize>>,
    /// producer -> consumers
    dependents: Vec<BTreeSet<usize>>,
}

impl DependencyGraph {
    /// Builds the graph of a set of declared resources.
    ///
    /// # Errors
    ///
    /// Returns `DuplicateResource`, `UnknownDependency` for a reference to an
    /// undeclared name, or `CyclicDependency` naming one cycle.
    pub fn build(nodes: &[ResourceNode]) -> Result<Self, GraphError> {
        let graph = Self::assemble(
            nodes.iter().map(|node| (node.name.clone(), node.dependencies())),
            true,
        )?;

        if let Some(cycle) = graph.find_cycle() {
            let rendered = cycle
                .iter()
                .map(|&i| graph.names[i].as_str())
                .collect::<Vec<_>>()
                .join(" -> ");
            return Err(GraphError::CyclicDependency { cycle: rendered });
        }

        debug!("Built dependency graph with {} nodes", graph.len());
        Ok(graph)
    }

    /// Builds a graph from recorded edges, dropping names that are not part
    /// of the edge set. Used for snapshots, whose recorded dependencies may
    /// point at resources that are already gone.
    #[must_use]
    pub fn from_edges<I>(edges: I) -> Self
    where
        I: IntoIterator<Item = (String, BTreeSet<String>)>,
    {
        // Lenient assembly cannot fail.
        Self::assemble(edges, false).unwrap_or_default()
    }

    fn assemble<I>(edges: I, strict: bool) -> Result<Self, GraphError>
    where
        I: IntoIterator<Item = (String, BTreeSet<String>)>,
    {
        let mut graph = Self::default();
        let mut declared = Vec::new();

        for (name, deps) in edges {
            if graph.index.contains_key(&name) {
                if strict {
                    return Err(GraphError::DuplicateResource { name });
                }
                continue;
            }
            graph.index.insert(name.clone(), graph.names.len());
            graph.names.push(name);
            declared.push(deps);
        }

        graph.dependencies = vec![BTreeSet::new(); graph.names.len()];
        graph.dependents = vec![BTreeSet::new(); graph.names.len()];

        for (consumer, deps) in declared.into_iter().enumerate() {
            for dep in deps {
                match graph.index.get(&dep) {
                    Some(&producer) => {
                        graph.dependencies[consumer].insert(producer);
                        graph.dependents[producer].insert(consumer);
                    }
                    None if strict => {
                        return Err(GraphError::UnknownDependency {
                            resource: graph.names[consumer].clone(),
                            dependency: dep,
                        });
                    }
                    None => debug!(
                        "Dropping edge {} -> {dep}: not in graph",
                        graph.names[consumer]
                    ),
                }
            }
        }

        Ok(graph)
    }

    /// Number of nodes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.names.len()
    }

    /// Returns true if the graph has no nodes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// Returns true if the graph has a node of that name.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    /// Node names in declaration order.
    #[must_use]
    pub fn names(&self) -> &[String] {
        &self.names
    }

    /// Resources `name` depends on.
    #[must_use]
    pub fn dependencies(&self, name: &str) -> Vec<&str> {
        self.neighbours(name, &self.dependencies)
    }

    /// Resources that depend on `name`.
    #[must_use]
    pub fn dependents(&self, name: &str) -> Vec<&str> {
        self.neighbours(name, &self.dependents)
    }

    fn neighbours<'a>(&'a self, name: &str, adjacency: &[BTreeSet<usize>]) -> Vec<&'a str> {
        self.index
            .get(name)
            .map(|&i| {
                adjacency[i]
                    .iter()
                    .map(|&j| self.names[j].as_str())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Every resource that transitively depends on `name`.
    #[must_use]
    pub fn transitive_dependents(&self, name: &str) -> BTreeSet<String> {
        let mut found = BTreeSet::new();
        let Some(&start) = self.index.get(name) else {
            return found;
        };

        let mut queue = VecDeque::from([start]);
        while let Some(current) = queue.pop_front() {
            for &next in &self.dependents[current] {
                if found.insert(self.names[next].clone()) {
                    queue.push_back(next);
                }
            }
        }
        found
    }

    /// Names ordered so every producer precedes its consumers.
    ///
    /// Among nodes that are ready at the same time, declaration order wins.
    /// Nodes on a cycle (only possible through [`Self::from_edges`]) are
    /// appended at the end in declaration order.
    #[must_use]
    pub fn topological_order(&self) -> Vec<String> {
        let mut order = self.kahn();
        if order.len() < self.len() {
            let placed: BTreeSet<usize> = order.iter().copied().collect();
            order.extend((0..self.len()).filter(|i| !placed.contains(i)));
        }
        order.into_iter().map(|i| self.names[i].clone()).collect()
    }

    /// Names ordered so every consumer precedes its producers: the order in
    /// which resources can be deleted.
    #[must_use]
    pub fn reverse_topological_order(&self) -> Vec<String> {
        let mut order = self.topological_order();
        order.reverse();
        order
    }

    fn kahn(&self) -> Vec<usize> {
        let mut in_degree: Vec<usize> = self.dependencies.iter().map(BTreeSet::len).collect();
        let mut ready: BTreeSet<usize> = (0..self.len()).filter(|&i| in_degree[i] == 0).collect();
        let mut order = Vec::with_capacity(self.len());

        while let Some(current) = ready.pop_first() {
            order.push(current);
            for &next in &self.dependents[current] {
                in_degree[next] -= 1;
                if in_degree[next] == 0 {
                    ready.insert(next);
                }
            }
        }
        order
    }

    /// Finds one cycle, as a path that starts and ends on the same node.
    ///
    /// Depth first, with an explicit stack so long chains cannot exhaust
    /// the thread's stack.
    fn find_cycle(&self) -> Option<Vec<usize>> {
        #[derive(Clone, Copy, PartialEq, Eq)]
        enum Mark {
            Unvisited,
            OnStack,
            Done,
        }

        let mut marks = vec![Mark::Unvisited; self.len()];
        // The current path, each node with its dependencies not yet explored.
        let mut path: Vec<(usize, btree_set::Iter<'_, usize>)> = Vec::new();

        for root in 0..self.len() {
            if marks[root] != Mark::Unvisited {
                continue;
            }
            marks[root] = Mark::OnStack;
            path.push((root, self.dependencies[root].iter()));

            while let Some((node, pending)) = path.last_mut() {
                let node = *node;
                match pending.next().copied() {
                    Some(dep) => match marks[dep] {
                        Mark::OnStack => {
                            let start = path.iter().position(|&(n, _)| n == dep)?;
                            let mut cycle: Vec<usize> =
                                path[start..].iter().map(|&(n, _)| n).collect();
                            cycle.push(dep);
                            return Some(cycle);
                        }
                        Mark::Unvisited => {
                            marks[dep] = Mark::OnStack;
                            path.push((dep, self.dependencies[dep].iter()));
                        }
                        Mark::Done => {}
                    },
                    None => {
                        marks[node] = Mark::Done;
                        path.pop();
                    }
                }
            }
        }
        None
    }
}
