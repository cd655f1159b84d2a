// Copyright (C) 2025 Jeremy J. Carroll. See LICENSE for details.

//! Found solutions and the deduplicated set that accumulates them.
//!
//! A [`Solution`] is identified purely by its sorted edge set over the
//! ancestry graph; everything else (the induced tree, the implied frequency
//! tensor, per-node usage values) is reconstructible on demand, so the set
//! stays cheap even when enumeration reports thousands of trees.

use std::collections::BTreeSet;

use crate::graph::{AncestryGraph, EdgeId, TreeState};
use crate::propagate::Propagator;
use crate::tensor::RealTensor;

/// One enumerated tree, identified by its edge set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Solution {
    /// Sorted ascending; an in-arborescence rooted at the graph root.
    edges: Vec<EdgeId>,
}

impl Solution {
    /// Build from an edge set; the edges are sorted so that equal trees
    /// compare equal regardless of discovery order.
    pub fn new(mut edges: Vec<EdgeId>) -> Self {
        edges.sort_unstable();
        Self { edges }
    }

    /// The parent edge of every non-root node, sorted ascending.
    pub fn edges(&self) -> &[EdgeId] {
        &self.edges
    }

    pub fn num_edges(&self) -> usize {
        self.edges.len()
    }

    /// Re-induce the tree over the graph.
    ///
    /// # Panics
    ///
    /// Panics if the edge set is not an arborescence rooted at the graph
    /// root, which cannot happen for solutions produced by enumeration.
    pub fn tree(&self, graph: &AncestryGraph) -> TreeState {
        let mut tree = TreeState::new(graph);
        let mut remaining = self.edges.clone();
        while !remaining.is_empty() {
            let before = remaining.len();
            remaining.retain(|&e| {
                if tree.contains_node(graph.source(e)) {
                    tree.attach(graph, e);
                    false
                } else {
                    true
                }
            });
            assert!(
                remaining.len() < before,
                "edge set is not connected to the root"
            );
        }
        tree
    }

    /// The frequency tensor implied by this tree, recomputed from scratch.
    ///
    /// # Panics
    ///
    /// Panics if the tree fails propagation, which cannot happen for
    /// solutions produced by enumeration.
    pub fn frequencies<P: Propagator>(&self, graph: &AncestryGraph, prop: &P) -> RealTensor {
        let tree = self.tree(graph);
        match prop.recompute(graph, &tree) {
            Some(fhat) => fhat,
            None => panic!("recorded solution failed propagation"),
        }
    }

    /// Per-sample, per-node usage: the cumulative frequency of a node minus
    /// the cumulative frequencies of its tree children, i.e. the mixture
    /// proportion attributed to the clone introduced at that node. Indexed
    /// `[sample][node]`; zero for nodes outside the tree.
    pub fn usage(&self, graph: &AncestryGraph, fhat: &RealTensor) -> Vec<Vec<f64>> {
        let tree = self.tree(graph);
        let cum = |p: usize, v| match graph.char_state(v) {
            None => 1.0,
            Some((c, i)) => fhat.cum_freq(p, c, graph.state_tree(c).descendants(i)),
        };

        let mut usage = vec![vec![0.0; graph.num_nodes()]; graph.num_samples()];
        for p in 0..graph.num_samples() {
            for v in (0..graph.num_nodes()).map(crate::graph::NodeId::from_index) {
                if !tree.contains_node(v) {
                    continue;
                }
                let children: f64 = tree.children(v).iter().map(|&d| cum(p, d)).sum();
                usage[p][v.index()] = cum(p, v) - children;
            }
        }
        usage
    }
}

/// Insertion-ordered, deduplicated collection of solutions.
#[derive(Debug, Default)]
pub struct SolutionSet {
    solutions: Vec<Solution>,
    seen: BTreeSet<Vec<EdgeId>>,
}

impl SolutionSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a solution; returns false if an equal tree was already
    /// present.
    pub fn insert(&mut self, solution: Solution) -> bool {
        if self.seen.insert(solution.edges.clone()) {
            self.solutions.push(solution);
            true
        } else {
            false
        }
    }

    pub fn len(&self) -> usize {
        self.solutions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.solutions.is_empty()
    }

    pub fn get(&self, i: usize) -> &Solution {
        &self.solutions[i]
    }

    pub fn iter(&self) -> impl Iterator<Item = &Solution> {
        self.solutions.iter()
    }
}
