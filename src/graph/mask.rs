// Copyright (C) 2025 Jeremy J. Carroll. See LICENSE for details.

//! Per-branch mutable overlays on the read-only ancestry graph.
//!
//! Each search branch owns a [`GraphMask`] (which candidate edges are still
//! worth trying) and a [`TreeState`] (the partial solution tree), both plain
//! bit/index arrays keyed by the graph's stable ids. Nothing here is ever
//! shared between branches or workers; independent searches each carry their
//! own copies over the one shared graph.

use super::{AncestryGraph, EdgeId, NodeId};

/// Enabled/disabled bits over the graph's edges, private to one branch.
#[derive(Debug, Clone)]
pub struct GraphMask {
    edge_enabled: Vec<bool>,
}

impl GraphMask {
    /// A mask with every edge enabled.
    pub fn new(graph: &AncestryGraph) -> Self {
        Self {
            edge_enabled: vec![true; graph.num_edges()],
        }
    }

    pub fn is_enabled(&self, e: EdgeId) -> bool {
        self.edge_enabled[e.index()]
    }

    pub fn disable(&mut self, e: EdgeId) {
        self.edge_enabled[e.index()] = false;
    }

    pub fn enable(&mut self, e: EdgeId) {
        self.edge_enabled[e.index()] = true;
    }
}

/// A partial solution tree: an in-arborescence over a subset of the graph,
/// rooted at the graph root.
///
/// Stored arena-style as membership bits plus a parent edge and an ordered
/// child list per node, so attach/detach are O(degree) and no per-branch
/// deep clone of the graph is ever needed. Child order is insertion order
/// and is preserved across a detach/re-attach pair; the frequency
/// propagation sums children in this order, which keeps incremental and
/// from-scratch recomputation bit-for-bit identical.
#[derive(Debug, Clone)]
pub struct TreeState {
    node_in: Vec<bool>,
    edge_in: Vec<bool>,
    parent_edge: Vec<Option<EdgeId>>,
    children: Vec<Vec<NodeId>>,
    num_edges: usize,
}

impl TreeState {
    /// The tree containing only the root.
    pub fn new(graph: &AncestryGraph) -> Self {
        let n = graph.num_nodes();
        let mut node_in = vec![false; n];
        node_in[graph.root().index()] = true;
        Self {
            node_in,
            edge_in: vec![false; graph.num_edges()],
            parent_edge: vec![None; n],
            children: vec![Vec::new(); n],
            num_edges: 0,
        }
    }

    pub fn contains_node(&self, v: NodeId) -> bool {
        self.node_in[v.index()]
    }

    pub fn contains_edge(&self, e: EdgeId) -> bool {
        self.edge_in[e.index()]
    }

    /// The unique in-edge of `v` within the tree, if any.
    pub fn parent_edge(&self, v: NodeId) -> Option<EdgeId> {
        self.parent_edge[v.index()]
    }

    /// The tree parent of `v`, if any.
    pub fn parent(&self, graph: &AncestryGraph, v: NodeId) -> Option<NodeId> {
        self.parent_edge[v.index()].map(|e| graph.source(e))
    }

    /// Children of `v` in attachment order.
    pub fn children(&self, v: NodeId) -> &[NodeId] {
        &self.children[v.index()]
    }

    /// Number of edges (equivalently, non-root nodes).
    pub fn edge_count(&self) -> usize {
        self.num_edges
    }

    /// Attach `e`, bringing its target into the tree.
    ///
    /// # Panics
    ///
    /// Panics unless the source is in the tree and the target is not.
    pub fn attach(&mut self, graph: &AncestryGraph, e: EdgeId) {
        let s = graph.source(e);
        let t = graph.target(e);
        assert!(self.contains_node(s), "attach source must be in the tree");
        assert!(!self.contains_node(t), "attach target already in the tree");

        self.edge_in[e.index()] = true;
        self.node_in[t.index()] = true;
        self.parent_edge[t.index()] = Some(e);
        self.children[s.index()].push(t);
        self.num_edges += 1;
    }

    /// Detach `e`, removing its (leaf) target from the tree.
    ///
    /// Attach/detach pairs nest strictly during search, so the target must
    /// be the most recently attached child of the edge source; popping it
    /// restores the exact sibling order that held before the matching
    /// `attach`.
    ///
    /// # Panics
    ///
    /// Panics if `e` is not in the tree, its target still has children, or
    /// its target is not the last-attached child of the source.
    pub fn detach(&mut self, graph: &AncestryGraph, e: EdgeId) {
        let s = graph.source(e);
        let t = graph.target(e);
        assert!(self.contains_edge(e), "detach of an edge not in the tree");
        assert!(
            self.children[t.index()].is_empty(),
            "detach target must be a leaf"
        );

        self.edge_in[e.index()] = false;
        self.node_in[t.index()] = false;
        self.parent_edge[t.index()] = None;
        let popped = self.children[s.index()].pop();
        assert_eq!(popped, Some(t), "detach must undo the most recent attach");
        self.num_edges -= 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::statetree::StateTree;
    use crate::tensor::RealTensor;

    fn permissive_graph(n: usize) -> AncestryGraph {
        let lb = RealTensor::new(2, 1, n);
        let mut ub = RealTensor::new(2, 1, n);
        for c in 0..n {
            for i in 0..2 {
                ub.set(i, 0, c, 1.0);
            }
        }
        AncestryGraph::new(vec![StateTree::linear(2); n], lb, ub)
    }

    fn edge_between(g: &AncestryGraph, s: NodeId, t: NodeId) -> EdgeId {
        *g.out_edges(s)
            .iter()
            .find(|&&e| g.target(e) == t)
            .expect("edge exists")
    }

    #[test]
    fn test_attach_detach_roundtrip() {
        let g = permissive_graph(3);
        let a = g.node(0, 1).unwrap();
        let b = g.node(1, 1).unwrap();
        let c = g.node(2, 1).unwrap();
        let ra = edge_between(&g, g.root(), a);
        let rb = edge_between(&g, g.root(), b);
        let rc = edge_between(&g, g.root(), c);

        let mut t = TreeState::new(&g);
        t.attach(&g, ra);
        t.attach(&g, rb);
        t.attach(&g, rc);
        assert_eq!(t.children(g.root()), &[a, b, c]);
        assert_eq!(t.edge_count(), 3);

        // LIFO detach/re-attach restores the sibling order exactly.
        t.detach(&g, rc);
        t.detach(&g, rb);
        assert_eq!(t.children(g.root()), &[a]);
        t.attach(&g, rb);
        t.attach(&g, rc);
        assert_eq!(t.children(g.root()), &[a, b, c]);
        assert_eq!(t.parent(&g, c), Some(g.root()));
        assert_eq!(t.parent(&g, g.root()), None);
    }

    #[test]
    #[should_panic(expected = "attach source must be in the tree")]
    fn test_attach_detached_source_panics() {
        let g = permissive_graph(2);
        let a = g.node(0, 1).unwrap();
        let b = g.node(1, 1).unwrap();
        let ab = edge_between(&g, a, b);
        let mut t = TreeState::new(&g);
        t.attach(&g, ab);
    }

    #[test]
    fn test_mask_toggles() {
        let g = permissive_graph(2);
        let e = g.out_edges(g.root())[0];
        let mut m = GraphMask::new(&g);
        assert!(m.is_enabled(e));
        m.disable(e);
        assert!(!m.is_enabled(e));
        m.enable(e);
        assert!(m.is_enabled(e));
    }
}
