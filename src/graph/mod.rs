// Copyright (C) 2025 Jeremy J. Carroll. See LICENSE for details.

//! The ancestry graph: which character-states may precede which.
//!
//! Nodes are `(character, state)` pairs with state ≥ 1, plus one shared root
//! standing for state 0 of every character at once. Edges are permitted
//! either by state-tree adjacency (within one character) or, across
//! characters, when no sample's frequency bounds rule out the source
//! preceding the target: for every sample, the cumulative upper bound of the
//! source must not be strictly below the cumulative lower bound of the
//! target, up to a fixed numeric tolerance.
//!
//! The graph is built once per run and is read-only afterwards. Everything
//! mutable during search lives in the per-branch [`GraphMask`] and
//! [`TreeState`] overlays, keyed by the stable [`NodeId`]/[`EdgeId`] indices
//! handed out here.

pub mod mask;

pub use mask::{GraphMask, TreeState};

use std::collections::BTreeSet;

use crate::statetree::StateTree;
use crate::tensor::RealTensor;

/// Default comparison tolerance for the frequency bound tests.
pub const DEFAULT_TOLERANCE: f64 = 1e-4;

/// Stable index of a node in the ancestry graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId(usize);

impl NodeId {
    /// The underlying index, usable for per-node side arrays.
    pub fn index(self) -> usize {
        self.0
    }

    /// Rebuild an id from an index obtained via [`index`](Self::index).
    /// Only meaningful against the graph that issued it.
    pub fn from_index(i: usize) -> Self {
        Self(i)
    }
}

/// Stable index of an edge in the ancestry graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EdgeId(usize);

impl EdgeId {
    /// The underlying index, usable for per-edge side arrays.
    pub fn index(self) -> usize {
        self.0
    }
}

#[derive(Debug, Clone, Copy)]
struct Edge {
    source: NodeId,
    target: NodeId,
}

/// Read-only ancestry graph over character-states.
#[derive(Debug)]
pub struct AncestryGraph {
    state_trees: Vec<StateTree>,
    f_lb: RealTensor,
    f_ub: RealTensor,
    tolerance: f64,

    /// `(character, state)` per node; `None` for the root.
    char_states: Vec<Option<(usize, usize)>>,
    /// `node_of[c][i]`; state 0 of every character maps to the root.
    node_of: Vec<Vec<Option<NodeId>>>,
    edges: Vec<Edge>,
    out_edges: Vec<Vec<EdgeId>>,
}

impl AncestryGraph {
    /// Build the graph with the default tolerance.
    pub fn new(state_trees: Vec<StateTree>, f_lb: RealTensor, f_ub: RealTensor) -> Self {
        Self::build(state_trees, f_lb, f_ub, DEFAULT_TOLERANCE, None)
    }

    /// Build the site-aware variant with the default tolerance.
    ///
    /// The last character is treated as a synthetic "site" character whose
    /// states mark the anatomical site of each sample. `sample_to_site[p]`
    /// gives the site of sample `p`. Additional edge filters apply: the root
    /// gains no edge into the site character, a mutation private to one site
    /// may not precede that site's indicator state, and bidirectional pairs
    /// against the site character are dropped.
    pub fn with_sites(
        state_trees: Vec<StateTree>,
        f_lb: RealTensor,
        f_ub: RealTensor,
        sample_to_site: &[usize],
    ) -> Self {
        Self::build(
            state_trees,
            f_lb,
            f_ub,
            DEFAULT_TOLERANCE,
            Some(sample_to_site),
        )
    }

    /// Build the graph with an explicit tolerance.
    ///
    /// # Panics
    ///
    /// Panics on malformed shapes: tensor dimensions disagreeing with the
    /// state-tree list, bounds outside `[0,1]`, or `F_lb > F_ub` anywhere.
    pub fn build(
        state_trees: Vec<StateTree>,
        f_lb: RealTensor,
        f_ub: RealTensor,
        tolerance: f64,
        sample_to_site: Option<&[usize]>,
    ) -> Self {
        let n = state_trees.len();
        let k = f_lb.num_states();
        let m = f_lb.num_samples();

        assert!(n >= 1, "need at least one character");
        assert_eq!(f_lb.num_characters(), n, "F_lb character count mismatch");
        assert_eq!(f_ub.num_characters(), n, "F_ub character count mismatch");
        assert_eq!(f_ub.num_states(), k, "F_ub state count mismatch");
        assert_eq!(f_ub.num_samples(), m, "F_ub sample count mismatch");
        for (c, s) in state_trees.iter().enumerate() {
            assert_eq!(s.num_states(), k, "state tree {} has wrong state count", c);
        }
        for i in 0..k {
            for p in 0..m {
                for c in 0..n {
                    let lb = f_lb.value(i, p, c);
                    let ub = f_ub.value(i, p, c);
                    assert!(
                        (0.0..=1.0).contains(&lb) && (0.0..=1.0).contains(&ub),
                        "frequency bound out of [0,1] at ({},{},{})",
                        i,
                        p,
                        c
                    );
                    assert!(lb <= ub, "F_lb > F_ub at ({},{},{})", i, p, c);
                }
            }
        }
        if let Some(sites) = sample_to_site {
            assert_eq!(sites.len(), m, "sample-to-site partition length mismatch");
        }

        let mut graph = Self {
            state_trees,
            f_lb,
            f_ub,
            tolerance,
            char_states: Vec::new(),
            node_of: vec![vec![None; k]; n],
            edges: Vec::new(),
            out_edges: Vec::new(),
        };
        graph.add_nodes();
        graph.add_edges(sample_to_site);
        graph
    }

    fn add_nodes(&mut self) {
        let n = self.num_characters();
        let k = self.num_states();

        // The shared root stands for state 0 of every character.
        let root = NodeId(0);
        self.char_states.push(None);
        for c in 0..n {
            self.node_of[c][0] = Some(root);
        }

        for c in 0..n {
            for i in 1..k {
                if !self.state_trees[c].is_present(i) {
                    continue;
                }
                let v = NodeId(self.char_states.len());
                self.char_states.push(Some((c, i)));
                self.node_of[c][i] = Some(v);
            }
        }
        self.out_edges = vec![Vec::new(); self.char_states.len()];
    }

    fn add_edge(&mut self, source: NodeId, target: NodeId) {
        let e = EdgeId(self.edges.len());
        self.edges.push(Edge { source, target });
        self.out_edges[source.index()].push(e);
    }

    fn add_edges(&mut self, sample_to_site: Option<&[usize]>) {
        let n = self.num_characters();
        let k = self.num_states();
        let m = self.num_samples();

        // Sites whose samples carry each mutation character; only used in
        // the site-aware variant, where the site character is the last one.
        let site_descendants: Vec<BTreeSet<usize>> = match sample_to_site {
            Some(sites) => (0..n)
                .map(|c| {
                    let mut d = BTreeSet::new();
                    if c + 1 < n {
                        for p in 0..m {
                            if self.f_lb.value(1, p, c) != 0.0 {
                                d.insert(sites[p]);
                            }
                        }
                    }
                    d
                })
                .collect(),
            None => Vec::new(),
        };
        let site_char = if sample_to_site.is_some() {
            Some(n - 1)
        } else {
            None
        };

        // (a) state-tree adjacency within one character; state 0 is the root.
        for c in 0..n {
            for i in 0..k {
                let Some(v_ci) = self.node_of[c][i] else {
                    continue;
                };
                for j in 1..k {
                    if i == j {
                        continue;
                    }
                    let Some(v_cj) = self.node_of[c][j] else {
                        continue;
                    };
                    // No direct root edge into the site character.
                    if site_char == Some(c) && i == 0 {
                        continue;
                    }
                    if self.state_trees[c].is_parent(i, j) {
                        self.add_edge(v_ci, v_cj);
                    }
                }
            }
        }

        // (b) cross-character edges permitted by the frequency bounds.
        for c in 0..n {
            for d in 0..n {
                if c == d {
                    continue;
                }
                for i in 1..k {
                    let Some(v_ci) = self.node_of[c][i] else {
                        continue;
                    };
                    for j in 1..k {
                        let Some(v_dj) = self.node_of[d][j] else {
                            continue;
                        };

                        if let Some(sc) = site_char {
                            // A mutation private to one site set may not
                            // precede a mutation of a different site set
                            // unless the latter includes the primary site.
                            if site_descendants[c] != site_descendants[d]
                                && c != sc
                                && d != sc
                                && !site_descendants[d].contains(&0)
                            {
                                continue;
                            }
                            // Drop the backward member of bidirectional
                            // pairs against the site character.
                            if d == sc
                                && site_descendants[c]
                                    .iter()
                                    .copied()
                                    .eq(self.state_trees[sc].descendants(j).iter().copied())
                            {
                                continue;
                            }
                        }

                        let mut ok = true;
                        for p in 0..m {
                            let ub_ci = self.cum_upper(p, c, i);
                            let lb_dj = self.cum_lower(p, d, j);
                            if self.tol_less(ub_ci, lb_dj) {
                                ok = false;
                                break;
                            }
                        }
                        if ok {
                            self.add_edge(v_ci, v_dj);
                        }
                    }
                }
            }
        }
    }

    /// The shared root node.
    pub fn root(&self) -> NodeId {
        NodeId(0)
    }

    pub fn num_nodes(&self) -> usize {
        self.char_states.len()
    }

    pub fn num_edges(&self) -> usize {
        self.edges.len()
    }

    pub fn num_characters(&self) -> usize {
        self.state_trees.len()
    }

    pub fn num_states(&self) -> usize {
        self.f_lb.num_states()
    }

    pub fn num_samples(&self) -> usize {
        self.f_lb.num_samples()
    }

    /// Node for `(character, state)`. State 0 maps to the root; `None` for
    /// absent states.
    pub fn node(&self, character: usize, state: usize) -> Option<NodeId> {
        self.node_of[character][state]
    }

    /// The `(character, state)` pair of a node; `None` for the root.
    pub fn char_state(&self, v: NodeId) -> Option<(usize, usize)> {
        self.char_states[v.index()]
    }

    pub fn source(&self, e: EdgeId) -> NodeId {
        self.edges[e.index()].source
    }

    pub fn target(&self, e: EdgeId) -> NodeId {
        self.edges[e.index()].target
    }

    pub fn out_edges(&self, v: NodeId) -> &[EdgeId] {
        &self.out_edges[v.index()]
    }

    pub fn state_tree(&self, character: usize) -> &StateTree {
        &self.state_trees[character]
    }

    pub fn f_lb(&self) -> &RealTensor {
        &self.f_lb
    }

    pub fn f_ub(&self) -> &RealTensor {
        &self.f_ub
    }

    pub fn tolerance(&self) -> f64 {
        self.tolerance
    }

    /// `a < b` beyond the tolerance.
    pub fn tol_less(&self, a: f64, b: f64) -> bool {
        a + self.tolerance < b
    }

    /// Cumulative lower bound of `(c, i)` in sample `p`.
    pub fn cum_lower(&self, p: usize, c: usize, i: usize) -> f64 {
        self.f_lb.cum_freq(p, c, self.state_trees[c].descendants(i))
    }

    /// Cumulative upper bound of `(c, i)` in sample `p`.
    pub fn cum_upper(&self, p: usize, c: usize, i: usize) -> f64 {
        self.f_ub.cum_freq(p, c, self.state_trees[c].descendants(i))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn binary_trees(n: usize) -> Vec<StateTree> {
        vec![StateTree::linear(2); n]
    }

    /// Two mutations with a forced ancestor relation: A present in both
    /// samples, B only in the second.
    fn forced_chain() -> AncestryGraph {
        let mut f = RealTensor::new(2, 2, 2);
        f.set(1, 0, 0, 1.0); // A, sample 0
        f.set(1, 1, 0, 1.0); // A, sample 1
        f.set(1, 1, 1, 1.0); // B, sample 1
        AncestryGraph::new(binary_trees(2), f.clone(), f)
    }

    #[test]
    fn test_node_layout() {
        let g = forced_chain();
        assert_eq!(g.num_nodes(), 3);
        assert_eq!(g.node(0, 0), Some(g.root()));
        assert_eq!(g.node(1, 0), Some(g.root()));
        assert_eq!(g.char_state(g.root()), None);
        let a = g.node(0, 1).unwrap();
        let b = g.node(1, 1).unwrap();
        assert_eq!(g.char_state(a), Some((0, 1)));
        assert_eq!(g.char_state(b), Some((1, 1)));
    }

    #[test]
    fn test_forced_chain_edges() {
        let g = forced_chain();
        let a = g.node(0, 1).unwrap();
        let b = g.node(1, 1).unwrap();

        // Root reaches both mutations via their state trees.
        let root_targets: Vec<_> = g
            .out_edges(g.root())
            .iter()
            .map(|&e| g.target(e))
            .collect();
        assert!(root_targets.contains(&a));
        assert!(root_targets.contains(&b));

        // A may precede B, but not the other way around: in sample 0 the
        // upper bound of B (0) is below the lower bound of A (1).
        assert!(g.out_edges(a).iter().any(|&e| g.target(e) == b));
        assert!(!g.out_edges(b).iter().any(|&e| g.target(e) == a));
    }

    #[test]
    fn test_tolerance_saves_near_ties() {
        let mut lb = RealTensor::new(2, 1, 2);
        let mut ub = RealTensor::new(2, 1, 2);
        // Upper bound of A sits a hair under the lower bound of B; the
        // tolerance must still permit A -> B.
        lb.set(1, 0, 0, 0.0);
        ub.set(1, 0, 0, 0.49995);
        lb.set(1, 0, 1, 0.5);
        ub.set(1, 0, 1, 0.5);
        let g = AncestryGraph::new(binary_trees(2), lb, ub);
        let a = g.node(0, 1).unwrap();
        let b = g.node(1, 1).unwrap();
        assert!(g.out_edges(a).iter().any(|&e| g.target(e) == b));
    }

    #[test]
    fn test_site_variant_blocks_root_edge() {
        // Two characters: one mutation plus the trailing site character.
        let mut lb = RealTensor::new(2, 1, 2);
        let mut ub = RealTensor::new(2, 1, 2);
        for c in 0..2 {
            lb.set(1, 0, c, 0.5);
            ub.set(1, 0, c, 1.0);
        }
        let g = AncestryGraph::with_sites(binary_trees(2), lb, ub, &[0]);
        let site = g.node(1, 1).unwrap();
        assert!(!g.out_edges(g.root()).iter().any(|&e| g.target(e) == site));
    }

    #[test]
    #[should_panic(expected = "F_lb > F_ub")]
    fn test_inverted_bounds_panic() {
        let mut lb = RealTensor::new(2, 1, 1);
        let ub = RealTensor::new(2, 1, 1);
        lb.set(1, 0, 0, 0.5);
        AncestryGraph::new(binary_trees(1), lb, ub);
    }
}
