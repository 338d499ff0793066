//! Cairn graph: target objects of one reconcile cycle and their
//! must-apply-before edges.
//!
//! Nodes live in an arena keyed by [`ObjectKey`]; edges reference keys, never
//! node handles, so a node can be marked absent and re-added freely. The graph
//! stays acyclic at all times: an edge that would close a cycle is rejected
//! and leaves the graph untouched.

#![forbid(unsafe_code)]

use std::cmp::Reverse;
use std::collections::BinaryHeap;

use cairn_core::{CairnError, ObjectKey};
use rustc_hash::{FxHashMap, FxHashSet};
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use smallvec::SmallVec;
use thiserror::Error;
use tracing::trace;

type Adjacency = FxHashMap<ObjectKey, SmallVec<[ObjectKey; 4]>>;

/// What the executor decided to do with a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Action {
    Create,
    Update,
    Delete,
    NoOp,
}

/// Opaque per-node instructions transformers pass to the executor.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodeHints {
    /// Leave the live object as it is: neither create nor rewrite it.
    pub adopt_only: bool,
}

#[derive(Debug, Clone)]
pub struct Node {
    key: ObjectKey,
    desired: Option<Json>,
    hints: NodeHints,
    seq: usize,
    action: Option<Action>,
}

impl Node {
    pub fn key(&self) -> &ObjectKey { &self.key }
    /// Desired representation; `None` means "ensure absent".
    pub fn desired(&self) -> Option<&Json> { self.desired.as_ref() }
    pub fn hints(&self) -> &NodeHints { &self.hints }
    /// Resolved by the executor only, after the graph is sealed.
    pub fn action(&self) -> Option<Action> { self.action }
    pub fn is_absent(&self) -> bool { self.desired.is_none() }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum GraphError {
    #[error("edge {from} -> {to} would close a cycle")]
    Cycle { from: ObjectKey, to: ObjectKey },
    #[error("edge references unknown node {0}")]
    UnknownNode(ObjectKey),
}

impl From<GraphError> for CairnError {
    fn from(err: GraphError) -> Self {
        CairnError::Validation(err.to_string())
    }
}

/// Mutable graph handed through the transformer pipeline.
#[derive(Debug, Clone, Default)]
pub struct Graph {
    nodes: FxHashMap<ObjectKey, Node>,
    order: Vec<ObjectKey>,
    succ: Adjacency,
    pred: Adjacency,
}

impl Graph {
    pub fn new() -> Self { Self::default() }

    pub fn len(&self) -> usize { self.nodes.len() }
    pub fn is_empty(&self) -> bool { self.nodes.is_empty() }
    pub fn contains(&self, key: &ObjectKey) -> bool { self.nodes.contains_key(key) }
    pub fn node(&self, key: &ObjectKey) -> Option<&Node> { self.nodes.get(key) }

    /// Nodes in insertion order.
    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.order.iter().filter_map(|k| self.nodes.get(k))
    }

    pub fn keys(&self) -> impl Iterator<Item = &ObjectKey> { self.order.iter() }

    pub fn edge_count(&self) -> usize { self.succ.values().map(|v| v.len()).sum() }

    /// Insert a node, or replace the desired representation of an existing one
    /// (last writer wins). Hints and edges of an existing node are kept.
    pub fn add_or_update_node(&mut self, key: ObjectKey, desired: Option<Json>) -> &mut Node {
        let seq = self.order.len();
        let order = &mut self.order;
        let node = self.nodes.entry(key.clone()).or_insert_with(|| {
            order.push(key.clone());
            Node { key, desired: None, hints: NodeHints::default(), seq, action: None }
        });
        node.desired = desired;
        node
    }

    /// Mark a node absent, inserting it when unknown. Its edges stay and are
    /// honoured in reverse when the executor orders deletions.
    pub fn remove_node(&mut self, key: ObjectKey) -> &mut Node {
        self.add_or_update_node(key, None)
    }

    pub fn set_hints(&mut self, key: &ObjectKey, hints: NodeHints) -> Result<(), GraphError> {
        let node = self.nodes.get_mut(key).ok_or_else(|| GraphError::UnknownNode(key.clone()))?;
        node.hints = hints;
        Ok(())
    }

    /// Record "`from` must be applied before `to`". Duplicate edges are a no-op.
    pub fn add_edge(&mut self, from: &ObjectKey, to: &ObjectKey) -> Result<(), GraphError> {
        for k in [from, to] {
            if !self.nodes.contains_key(k) {
                return Err(GraphError::UnknownNode(k.clone()));
            }
        }
        if from == to || self.reaches(to, from) {
            return Err(GraphError::Cycle { from: from.clone(), to: to.clone() });
        }
        let out = self.succ.entry(from.clone()).or_default();
        if out.contains(to) {
            return Ok(());
        }
        out.push(to.clone());
        self.pred.entry(to.clone()).or_default().push(from.clone());
        trace!(%from, %to, "edge added");
        Ok(())
    }

    pub fn successors(&self, key: &ObjectKey) -> &[ObjectKey] {
        self.succ.get(key).map(|v| v.as_slice()).unwrap_or(&[])
    }

    pub fn predecessors(&self, key: &ObjectKey) -> &[ObjectKey] {
        self.pred.get(key).map(|v| v.as_slice()).unwrap_or(&[])
    }

    fn reaches(&self, start: &ObjectKey, target: &ObjectKey) -> bool {
        let mut seen: FxHashSet<&ObjectKey> = FxHashSet::default();
        let mut stack = vec![start];
        while let Some(k) = stack.pop() {
            if k == target {
                return true;
            }
            if !seen.insert(k) {
                continue;
            }
            stack.extend(self.successors(k).iter());
        }
        false
    }

    /// Lazily yield keys so that every edge source precedes its target. Ties
    /// are broken by insertion order.
    pub fn topological_order(&self) -> TopoOrder<'_> {
        TopoOrder::new(&self.nodes, &self.order, &self.succ, &self.pred)
    }

    /// Freeze the graph for the executor. No node or edge can be added after
    /// this; only action tags can be resolved.
    pub fn seal(self) -> Result<SealedGraph, GraphError> {
        let order = self
            .topological_order()
            .map(|r| r.map(|k| k.clone()))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(SealedGraph { nodes: self.nodes, order, succ: self.succ, pred: self.pred })
    }
}

/// Kahn's algorithm over a min-heap of insertion sequence numbers.
pub struct TopoOrder<'a> {
    nodes: &'a FxHashMap<ObjectKey, Node>,
    order: &'a [ObjectKey],
    succ: &'a Adjacency,
    indegree: FxHashMap<&'a ObjectKey, usize>,
    ready: BinaryHeap<Reverse<usize>>,
    emitted: usize,
    failed: bool,
}

impl<'a> TopoOrder<'a> {
    fn new(nodes: &'a FxHashMap<ObjectKey, Node>, order: &'a [ObjectKey], succ: &'a Adjacency, pred: &'a Adjacency) -> Self {
        let mut indegree = FxHashMap::default();
        let mut ready = BinaryHeap::new();
        for (seq, key) in order.iter().enumerate() {
            let n = pred.get(key).map(|p| p.len()).unwrap_or(0);
            if n == 0 {
                ready.push(Reverse(seq));
            }
            indegree.insert(key, n);
        }
        Self { nodes, order, succ, indegree, ready, emitted: 0, failed: false }
    }
}

impl<'a> Iterator for TopoOrder<'a> {
    type Item = Result<&'a ObjectKey, GraphError>;

    fn next(&mut self) -> Option<Self::Item> {
        let order: &'a [ObjectKey] = self.order;
        let succ: &'a Adjacency = self.succ;
        if let Some(Reverse(seq)) = self.ready.pop() {
            let key = &order[seq];
            for s in succ.get(key).map(|v| v.as_slice()).unwrap_or(&[]) {
                if let Some(d) = self.indegree.get_mut(s) {
                    *d -= 1;
                    if *d == 0 {
                        self.ready.push(Reverse(self.nodes[s].seq));
                    }
                }
            }
            self.indegree.remove(key);
            self.emitted += 1;
            return Some(Ok(key));
        }
        if self.failed || self.emitted == self.order.len() {
            return None;
        }
        self.failed = true;
        // Whatever is left sits on a cycle; name one of its edges.
        let stuck = order.iter().find(|k| self.indegree.contains_key(k))?;
        let from = order
            .iter()
            .find(|k| self.indegree.contains_key(k) && succ.get(*k).map(|s| s.contains(stuck)).unwrap_or(false))
            .unwrap_or(stuck);
        Some(Err(GraphError::Cycle { from: from.clone(), to: stuck.clone() }))
    }
}

/// A finished graph with a fixed topological order.
#[derive(Debug, Clone)]
pub struct SealedGraph {
    nodes: FxHashMap<ObjectKey, Node>,
    order: Vec<ObjectKey>,
    succ: Adjacency,
    pred: Adjacency,
}

impl SealedGraph {
    pub fn len(&self) -> usize { self.nodes.len() }
    pub fn is_empty(&self) -> bool { self.nodes.is_empty() }

    /// Creation order: every edge source before its target.
    pub fn order(&self) -> &[ObjectKey] { &self.order }

    pub fn node(&self, key: &ObjectKey) -> Option<&Node> { self.nodes.get(key) }

    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.order.iter().filter_map(|k| self.nodes.get(k))
    }

    pub fn set_action(&mut self, key: &ObjectKey, action: Action) -> Result<(), GraphError> {
        let node = self.nodes.get_mut(key).ok_or_else(|| GraphError::UnknownNode(key.clone()))?;
        node.action = Some(action);
        Ok(())
    }

    pub fn successors(&self, key: &ObjectKey) -> &[ObjectKey] {
        self.succ.get(key).map(|v| v.as_slice()).unwrap_or(&[])
    }

    pub fn predecessors(&self, key: &ObjectKey) -> &[ObjectKey] {
        self.pred.get(key).map(|v| v.as_slice()).unwrap_or(&[])
    }

    /// Every node reachable from `key` along edges, `key` excluded.
    pub fn descendants(&self, key: &ObjectKey) -> FxHashSet<ObjectKey> {
        walk(key, |k| self.successors(k))
    }

    /// Every node that reaches `key` along edges, `key` excluded.
    pub fn ancestors(&self, key: &ObjectKey) -> FxHashSet<ObjectKey> {
        walk(key, |k| self.predecessors(k))
    }
}

fn walk<'a>(start: &'a ObjectKey, next: impl Fn(&'a ObjectKey) -> &'a [ObjectKey]) -> FxHashSet<ObjectKey> {
    let mut out = FxHashSet::default();
    let mut stack: Vec<&ObjectKey> = next(start).iter().collect();
    while let Some(k) = stack.pop() {
        if out.insert(k.clone()) {
            stack.extend(next(k).iter());
        }
    }
    out
}
