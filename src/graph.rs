//! The dependency DAG of a query: every transitive prerequisite, labelled
//! by fingerprint, with storedness attached from the cache.
//!
//! The graph is value-only. Nodes carry the spec they were expanded from so
//! the scheduler can build SQL, but edges are fingerprint pairs; nothing in
//! here holds a live reference to a parent query object.

use smallvec::SmallVec;
use std::collections::BTreeSet;

use crate::error::{Error, Result};
use crate::fingerprint::QueryId;
use crate::spec::QuerySpec;
use crate::{FxIndexMap, FxIndexSet};

/// One node of the DAG.
#[derive(Clone, Debug)]
pub struct Node {
    pub spec: QuerySpec,
    /// Direct prerequisites, in declaration order.
    pub deps: FxIndexSet<QueryId>,
    /// Whether the cache holds a materialised result for this node.
    pub stored: bool,
}

/// The transitive dependency closure of a single root spec.
#[derive(Clone, Debug)]
pub struct DepGraph {
    root: QueryId,
    nodes: FxIndexMap<QueryId, Node>,
}

impl DepGraph {
    /// Expand the full closure of `root`. Every node's spec is validated as
    /// it is first reached, so a malformed nested spec surfaces before any
    /// state is created.
    pub fn build(root: &QuerySpec) -> Result<Self> {
        let mut graph = DepGraph {
            root: root.fingerprint(),
            nodes: FxIndexMap::default(),
        };
        let mut path = FxIndexSet::default();
        expand(root, &mut graph.nodes, &mut path)?;
        Ok(graph)
    }

    pub fn root(&self) -> &QueryId {
        &self.root
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn contains(&self, id: &QueryId) -> bool {
        self.nodes.contains_key(id)
    }

    pub fn node(&self, id: &QueryId) -> Option<&Node> {
        self.nodes.get(id)
    }

    pub fn ids(&self) -> impl Iterator<Item = &QueryId> {
        self.nodes.keys()
    }

    /// Attach cache knowledge to a node. Called once per node between
    /// expansion and scheduling.
    pub fn mark_stored(&mut self, id: &QueryId) {
        if let Some(node) = self.nodes.get_mut(id) {
            node.stored = true;
        }
    }

    /// The subgraph of work that must still happen: reachable from the
    /// root without passing through a stored node. A stored node cuts its
    /// whole branch — its own prerequisites are already accounted for by
    /// the materialised result.
    pub fn unstored(&self) -> DepGraph {
        let mut kept = FxIndexMap::default();
        let mut stack = Vec::new();
        if let Some(root) = self.nodes.get(&self.root) {
            if !root.stored {
                stack.push(self.root.clone());
            }
        }
        while let Some(id) = stack.pop() {
            if kept.contains_key(&id) {
                continue;
            }
            let node = &self.nodes[&id];
            let mut live_deps = FxIndexSet::default();
            for dep in &node.deps {
                if !self.nodes[dep].stored {
                    live_deps.insert(dep.clone());
                    stack.push(dep.clone());
                }
            }
            kept.insert(
                id,
                Node {
                    spec: node.spec.clone(),
                    deps: live_deps,
                    stored: false,
                },
            );
        }
        DepGraph {
            root: self.root.clone(),
            nodes: kept,
        }
    }

    /// A linear extension of the DAG, leaves first. Ties are broken by
    /// fingerprint ordering so the schedule (and its logs) is reproducible
    /// for a given set of inputs.
    pub fn topological_order(&self) -> Result<Vec<QueryId>> {
        let mut indegree: FxIndexMap<&QueryId, usize> =
            self.nodes.keys().map(|id| (id, 0)).collect();
        // Most nodes have one or two dependents; keep those edge lists off
        // the heap.
        let mut dependents: FxIndexMap<&QueryId, SmallVec<[&QueryId; 4]>> =
            FxIndexMap::default();
        for (id, node) in &self.nodes {
            for dep in &node.deps {
                *indegree.get_mut(id).expect("node present") += 1;
                dependents.entry(dep).or_default().push(id);
            }
        }

        let mut ready: BTreeSet<&QueryId> = indegree
            .iter()
            .filter(|(_, n)| **n == 0)
            .map(|(id, _)| *id)
            .collect();
        let mut order = Vec::with_capacity(self.nodes.len());
        while let Some(&id) = ready.iter().next() {
            ready.remove(id);
            order.push(id.clone());
            for parent in dependents.get(id).into_iter().flatten() {
                let n = indegree.get_mut(*parent).expect("node present");
                *n -= 1;
                if *n == 0 {
                    ready.insert(*parent);
                }
            }
        }

        if order.len() != self.nodes.len() {
            // Some node never reached in-degree zero; report one of them.
            let blocked = self
                .nodes
                .keys()
                .find(|id| !order.contains(*id))
                .expect("at least one unordered node");
            return Err(Error::CycleDetected(blocked.clone()));
        }
        Ok(order)
    }

    #[cfg(test)]
    pub(crate) fn from_parts(root: QueryId, nodes: FxIndexMap<QueryId, Node>) -> Self {
        DepGraph { root, nodes }
    }
}

fn expand(
    spec: &QuerySpec,
    nodes: &mut FxIndexMap<QueryId, Node>,
    path: &mut FxIndexSet<QueryId>,
) -> Result<()> {
    let id = spec.fingerprint();
    if path.contains(&id) {
        return Err(Error::CycleDetected(id));
    }
    if nodes.contains_key(&id) {
        return Ok(());
    }
    spec.validate()?;
    path.insert(id.clone());
    let deps = spec.dependencies()?;
    let mut dep_ids = FxIndexSet::default();
    for dep in &deps {
        dep_ids.insert(dep.fingerprint());
        expand(dep, nodes, path)?;
    }
    path.shift_remove(&id);
    nodes.insert(
        id,
        Node {
            spec: spec.clone(),
            deps: dep_ids,
            stored: false,
        },
    );
    Ok(())
}
