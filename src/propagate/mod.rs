// Copyright (C) 2025 Jeremy J. Carroll. See LICENSE for details.

//! Incremental frequency-consistency propagation.
//!
//! This is the numerical heart of the search. Given a partial tree and its
//! working point-estimate tensor `Fhat`, [`Propagator::update`] recomputes
//! `Fhat` bottom-up from one node to the root and reports whether every
//! touched entry stayed inside the measurement bounds, at cost proportional
//! to the ancestor chain rather than the tree size. [`Propagator::check`]
//! wraps a provisional attach in change tracking and a rollback, so probing
//! a candidate edge leaves both the tree and the tensor exactly as they
//! were.
//!
//! For a non-root node `(c,i)` and sample `p`:
//!
//! ```text
//! Fhat(i,p,c) = max(F_lb(i,p,c), children_sum − descendant_reserved)
//! ```
//!
//! where `children_sum` is the cumulative frequency already attached beneath
//! the node and `descendant_reserved` is the Fhat mass already assigned to
//! placed proper-descendant states of the same character. The value is
//! rejected if it exceeds `F_ub(i,p,c)`. At the root, each character's
//! absence frequency is one minus the mass of its placed states, rejected
//! outside `[0,1]`, and the total claimed by the root's children may not
//! exceed one. All comparisons use the graph's fixed tolerance.

use crate::graph::{AncestryGraph, EdgeId, NodeId, TreeState};
use crate::tensor::RealTensor;

/// Pluggable consistency-propagation strategy.
///
/// The enumeration engine is generic over this trait; the one concrete
/// strategy is [`NoisyPropagator`], which certifies consistency against
/// interval bounds on noisy frequency measurements.
pub trait Propagator {
    /// The working tensor for the tree that contains only the root.
    fn baseline(&self, graph: &AncestryGraph) -> RealTensor;

    /// Recompute `fhat` from `v` up to the root. Returns false as soon as a
    /// recomputed entry violates its bounds; `fhat` is left mid-update in
    /// that case, so callers that probe must track changes and roll back.
    fn update(
        &self,
        graph: &AncestryGraph,
        tree: &TreeState,
        v: NodeId,
        fhat: &mut RealTensor,
    ) -> bool;

    /// Whether attaching `e` keeps the tree consistent. Provisionally
    /// attaches the edge, runs a tracked [`update`](Self::update) from its
    /// target, then rolls the tensor back and detaches; `tree` and `fhat`
    /// are exactly as before on return.
    fn check(
        &self,
        graph: &AncestryGraph,
        tree: &mut TreeState,
        fhat: &mut RealTensor,
        e: EdgeId,
    ) -> bool {
        let target = graph.target(e);
        tree.attach(graph, e);
        fhat.set_track_changes(true);
        let ok = self.update(graph, tree, target, fhat);
        fhat.set_track_changes(false);
        fhat.roll_back();
        tree.detach(graph, e);
        ok
    }

    /// Recompute the whole tensor from scratch, bottom-up over the entire
    /// tree. Returns `None` if the tree is inconsistent. Matches the
    /// incrementally maintained tensor bit-for-bit for any tree built
    /// through accepted [`update`](Self::update) calls.
    fn recompute(&self, graph: &AncestryGraph, tree: &TreeState) -> Option<RealTensor>;
}

/// Consistency propagation against noisy, interval-bounded measurements.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoisyPropagator;

impl NoisyPropagator {
    /// Recompute one non-root node for all samples. Sets the values before
    /// testing them; a probing caller rolls the writes back on rejection.
    fn update_node(
        &self,
        graph: &AncestryGraph,
        tree: &TreeState,
        v: NodeId,
        c: usize,
        i: usize,
        fhat: &mut RealTensor,
    ) -> bool {
        let descendants = graph.state_tree(c).descendants(i);
        for p in 0..graph.num_samples() {
            let mut children_sum = 0.0;
            for &child in tree.children(v) {
                let (d, j) = graph
                    .char_state(child)
                    .expect("tree children are never the root");
                children_sum += fhat.cum_freq(p, d, graph.state_tree(d).descendants(j));
            }

            let mut reserved = 0.0;
            for &j in descendants {
                if j == i {
                    continue;
                }
                let node = graph.node(c, j).expect("descendant states are present");
                if tree.contains_node(node) {
                    reserved += fhat.value(j, p, c);
                }
            }

            let lb = graph.f_lb().value(i, p, c);
            let ub = graph.f_ub().value(i, p, c);
            let value = lb.max(children_sum - reserved);
            fhat.set(i, p, c, value);
            if graph.tol_less(value, lb) || graph.tol_less(ub, value) {
                return false;
            }
        }
        true
    }

    /// Recompute the root row: per-character absence frequencies and the
    /// total mass claimed by the root's children.
    fn update_root(&self, graph: &AncestryGraph, tree: &TreeState, fhat: &mut RealTensor) -> bool {
        let root = graph.root();
        for p in 0..graph.num_samples() {
            let mut children_sum = 0.0;
            for &child in tree.children(root) {
                let (d, j) = graph
                    .char_state(child)
                    .expect("tree children are never the root");
                children_sum += fhat.cum_freq(p, d, graph.state_tree(d).descendants(j));
            }
            if graph.tol_less(1.0, children_sum) {
                return false;
            }

            for c in 0..graph.num_characters() {
                let mut placed_sum = 0.0;
                for i in 1..graph.num_states() {
                    if let Some(node) = graph.node(c, i) {
                        if tree.contains_node(node) {
                            placed_sum += fhat.value(i, p, c);
                        }
                    }
                }
                let absent = 1.0 - placed_sum;
                if graph.tol_less(absent, 0.0) || graph.tol_less(1.0, absent) {
                    return false;
                }
                fhat.set(0, p, c, absent);
            }
        }
        true
    }

    fn recompute_subtree(
        &self,
        graph: &AncestryGraph,
        tree: &TreeState,
        v: NodeId,
        fhat: &mut RealTensor,
    ) -> bool {
        for &child in tree.children(v) {
            if !self.recompute_subtree(graph, tree, child, fhat) {
                return false;
            }
        }
        match graph.char_state(v) {
            None => self.update_root(graph, tree, fhat),
            Some((c, i)) => self.update_node(graph, tree, v, c, i, fhat),
        }
    }
}

impl Propagator for NoisyPropagator {
    fn baseline(&self, graph: &AncestryGraph) -> RealTensor {
        let mut fhat = graph.f_lb().clone();
        // Nothing is placed yet, so every character is fully absent.
        for p in 0..graph.num_samples() {
            for c in 0..graph.num_characters() {
                fhat.set(0, p, c, 1.0);
            }
        }
        fhat
    }

    fn update(
        &self,
        graph: &AncestryGraph,
        tree: &TreeState,
        v: NodeId,
        fhat: &mut RealTensor,
    ) -> bool {
        assert!(tree.contains_node(v), "update starts inside the tree");
        let mut v = v;
        while let Some((c, i)) = graph.char_state(v) {
            if !self.update_node(graph, tree, v, c, i, fhat) {
                return false;
            }
            v = tree
                .parent(graph, v)
                .expect("non-root tree nodes have a parent");
        }
        self.update_root(graph, tree, fhat)
    }

    fn recompute(&self, graph: &AncestryGraph, tree: &TreeState) -> Option<RealTensor> {
        let mut fhat = graph.f_lb().clone();
        if self.recompute_subtree(graph, tree, graph.root(), &mut fhat) {
            Some(fhat)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::statetree::StateTree;

    fn binary_graph(lb: &[(usize, usize, usize, f64)], ub_default: f64, m: usize, n: usize) -> AncestryGraph {
        let mut f_lb = RealTensor::new(2, m, n);
        let mut f_ub = RealTensor::new(2, m, n);
        for p in 0..m {
            for c in 0..n {
                f_ub.set(1, p, c, ub_default);
            }
        }
        for &(i, p, c, v) in lb {
            f_lb.set(i, p, c, v);
            if f_ub.value(i, p, c) < v {
                f_ub.set(i, p, c, v);
            }
        }
        AncestryGraph::new(vec![StateTree::linear(2); n], f_lb, f_ub)
    }

    fn edge_between(g: &AncestryGraph, s: NodeId, t: NodeId) -> EdgeId {
        *g.out_edges(s)
            .iter()
            .find(|&&e| g.target(e) == t)
            .expect("edge exists")
    }

    #[test]
    fn test_check_leaves_state_untouched() {
        let g = binary_graph(&[], 1.0, 2, 2);
        let prop = NoisyPropagator;
        let mut tree = TreeState::new(&g);
        let mut fhat = prop.baseline(&g);
        let before = fhat.clone();

        let a = g.node(0, 1).unwrap();
        let ra = edge_between(&g, g.root(), a);
        assert!(prop.check(&g, &mut tree, &mut fhat, ra));
        assert_eq!(fhat, before);
        assert!(!tree.contains_node(a));
        assert_eq!(tree.edge_count(), 0);
    }

    #[test]
    fn test_commit_then_undo_restores_fhat() {
        let g = binary_graph(&[(1, 0, 0, 0.6), (1, 0, 1, 0.3)], 1.0, 1, 2);
        let prop = NoisyPropagator;
        let mut tree = TreeState::new(&g);
        let mut fhat = prop.baseline(&g);

        let a = g.node(0, 1).unwrap();
        let b = g.node(1, 1).unwrap();
        let ra = edge_between(&g, g.root(), a);
        let ab = edge_between(&g, a, b);

        tree.attach(&g, ra);
        assert!(prop.update(&g, &tree, a, &mut fhat));
        let committed = fhat.clone();

        // Commit a further edge, then undo it; Fhat must come back exactly.
        tree.attach(&g, ab);
        assert!(prop.update(&g, &tree, b, &mut fhat));
        tree.detach(&g, ab);
        assert!(prop.update(&g, &tree, a, &mut fhat));
        assert_eq!(fhat, committed);
    }

    #[test]
    fn test_incremental_matches_recompute() {
        let g = binary_graph(
            &[(1, 0, 0, 0.7), (1, 0, 1, 0.4), (1, 0, 2, 0.2)],
            1.0,
            1,
            3,
        );
        let prop = NoisyPropagator;
        let mut tree = TreeState::new(&g);
        let mut fhat = prop.baseline(&g);

        let a = g.node(0, 1).unwrap();
        let b = g.node(1, 1).unwrap();
        let c = g.node(2, 1).unwrap();
        for e in [
            edge_between(&g, g.root(), a),
            edge_between(&g, a, b),
            edge_between(&g, b, c),
        ] {
            tree.attach(&g, e);
            assert!(prop.update(&g, &tree, g.target(e), &mut fhat));
        }

        let scratch = prop.recompute(&g, &tree).expect("tree is consistent");
        assert_eq!(fhat, scratch);
    }

    #[test]
    fn test_children_overflow_rejected() {
        // Both mutations forced to 0.6 in the one sample; they fit under the
        // root singly but not side by side.
        let g = binary_graph(&[(1, 0, 0, 0.6), (1, 0, 1, 0.6)], 1.0, 1, 2);
        let prop = NoisyPropagator;
        let mut tree = TreeState::new(&g);
        let mut fhat = prop.baseline(&g);

        let a = g.node(0, 1).unwrap();
        let b = g.node(1, 1).unwrap();
        let ra = edge_between(&g, g.root(), a);
        let rb = edge_between(&g, g.root(), b);

        tree.attach(&g, ra);
        assert!(prop.update(&g, &tree, a, &mut fhat));
        assert!(!prop.check(&g, &mut tree, &mut fhat, rb));
    }

    #[test]
    fn test_upper_bound_rejected() {
        // A is capped at 0.5; its two would-be children need 0.3 each, so
        // either child alone fits but the pair pushes A past its bound.
        let mut f_lb = RealTensor::new(2, 1, 3);
        let mut f_ub = RealTensor::new(2, 1, 3);
        f_ub.set(1, 0, 0, 0.5);
        for c in [1, 2] {
            f_lb.set(1, 0, c, 0.3);
            f_ub.set(1, 0, c, 1.0);
        }
        let g = AncestryGraph::new(vec![StateTree::linear(2); 3], f_lb, f_ub);
        let prop = NoisyPropagator;
        let mut tree = TreeState::new(&g);
        let mut fhat = prop.baseline(&g);

        let a = g.node(0, 1).unwrap();
        let b = g.node(1, 1).unwrap();
        let c = g.node(2, 1).unwrap();

        tree.attach(&g, edge_between(&g, g.root(), a));
        assert!(prop.update(&g, &tree, a, &mut fhat));
        tree.attach(&g, edge_between(&g, a, b));
        assert!(prop.update(&g, &tree, b, &mut fhat));
        assert!(!prop.check(&g, &mut tree, &mut fhat, edge_between(&g, a, c)));
    }
}
