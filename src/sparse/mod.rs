// Copyright (C) 2025 Jeremy J. Carroll. See LICENSE for details.

//! Sparse frequency refinement for an already-found solution.
//!
//! The canonical propagation of a solution tree spreads frequency mass
//! greedily. For downstream interpretation a sparser mixture decomposition
//! is often preferable: one that explains the same measurements while
//! attributing nonzero usage to as few clones as possible. This module
//! formulates that as a continuous program over the placed frequency
//! variables and hands it to an external LP oracle behind the [`LpOracle`]
//! trait; the crate never links a solver itself.
//!
//! An oracle failure is recoverable: the refiner logs it and falls back to
//! the canonical bottom-up recomputation, which is always available for a
//! validated solution.

use thiserror::Error;

use crate::graph::{AncestryGraph, NodeId};
use crate::propagate::Propagator;
use crate::solution::Solution;
use crate::tensor::RealTensor;

/// Failure reported by, or detected in the answer of, the external oracle.
#[derive(Debug, Error)]
pub enum RefineError {
    /// Should not occur for a validated solution, but floating-point drift
    /// between the propagation tolerance and the oracle's can cause it.
    #[error("oracle reported the program infeasible")]
    Infeasible,
    #[error("oracle failed: {0}")]
    Oracle(String),
    #[error("oracle returned {got} values for {expected} variables")]
    ShapeMismatch { expected: usize, got: usize },
}

/// One frequency variable `f(state, sample, character)` of the program.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FreqVar {
    pub state: usize,
    pub sample: usize,
    pub character: usize,
}

/// Usage of one tree node in one sample as an affine expression over the
/// frequency variables: `constant + Σ coeff · f[var]`.
#[derive(Debug, Clone)]
pub struct UsageExpr {
    pub sample: usize,
    pub node: NodeId,
    pub constant: f64,
    /// `(variable index, coefficient)` pairs.
    pub terms: Vec<(usize, f64)>,
}

/// The continuous program: minimize the number of nonzero usages.
///
/// The intended relaxation is `minimize Σ z − w·Σ u` subject to
/// `z[p][v] ≥ u[p][v]`, `z ≥ 0`, `u[p][v]` equal to its [`UsageExpr`], and
/// every variable inside its bounds; `w` is [`usage_weight`]. The oracle is
/// free to solve the relaxation or the exact counting form, as long as the
/// returned frequencies respect the bounds.
///
/// [`usage_weight`]: Self::usage_weight
#[derive(Debug)]
pub struct SparseProgram {
    variables: Vec<FreqVar>,
    bounds: Vec<(f64, f64)>,
    usages: Vec<UsageExpr>,
    usage_weight: f64,
}

impl SparseProgram {
    /// Formulate the program for one solution tree.
    pub fn new(graph: &AncestryGraph, solution: &Solution) -> Self {
        let tree = solution.tree(graph);
        let m = graph.num_samples();

        let mut variables = Vec::new();
        let mut bounds = Vec::new();
        let mut var_of = vec![vec![None; m]; graph.num_nodes()];
        for v in (1..graph.num_nodes()).map(NodeId::from_index) {
            if !tree.contains_node(v) {
                continue;
            }
            let (c, i) = graph.char_state(v).expect("non-root node");
            for p in 0..m {
                var_of[v.index()][p] = Some(variables.len());
                variables.push(FreqVar {
                    state: i,
                    sample: p,
                    character: c,
                });
                bounds.push((graph.f_lb().value(i, p, c), graph.f_ub().value(i, p, c)));
            }
        }

        // Cumulative frequency of a placed node as variable terms: the sum
        // over its placed descendant states of the same character.
        let cum_terms = |v: NodeId, p: usize| -> Vec<usize> {
            let (c, i) = graph.char_state(v).expect("non-root node");
            graph
                .state_tree(c)
                .descendants(i)
                .iter()
                .filter_map(|&j| graph.node(c, j))
                .filter_map(|w| var_of[w.index()][p])
                .collect()
        };

        let mut usages = Vec::new();
        for v in (0..graph.num_nodes()).map(NodeId::from_index) {
            if !tree.contains_node(v) {
                continue;
            }
            for p in 0..m {
                let mut terms: Vec<(usize, f64)> = Vec::new();
                let constant = match graph.char_state(v) {
                    None => 1.0,
                    Some(_) => {
                        for var in cum_terms(v, p) {
                            terms.push((var, 1.0));
                        }
                        0.0
                    }
                };
                for &child in tree.children(v) {
                    for var in cum_terms(child, p) {
                        terms.push((var, -1.0));
                    }
                }
                usages.push(UsageExpr {
                    sample: p,
                    node: v,
                    constant,
                    terms,
                });
            }
        }

        let num_nodes = tree.edge_count() + 1;
        Self {
            variables,
            bounds,
            usages,
            usage_weight: 1.0 / (num_nodes as f64 * m as f64),
        }
    }

    pub fn variables(&self) -> &[FreqVar] {
        &self.variables
    }

    /// `(lower, upper)` per variable, parallel to [`variables`](Self::variables).
    pub fn bounds(&self) -> &[(f64, f64)] {
        &self.bounds
    }

    pub fn usages(&self) -> &[UsageExpr] {
        &self.usages
    }

    /// Weight of the usage reward term in the relaxed objective.
    pub fn usage_weight(&self) -> f64 {
        self.usage_weight
    }
}

/// Answer of the external oracle: one value per program variable, in
/// program order.
#[derive(Debug, Clone)]
pub struct LpSolution {
    pub values: Vec<f64>,
}

/// External LP/ILP solver, treated as a black box.
pub trait LpOracle {
    fn solve(&self, program: &SparseProgram) -> Result<LpSolution, RefineError>;
}

/// Recompute a solution's frequency tensor through the sparse program,
/// falling back to canonical propagation when the oracle cannot help.
pub struct SparseRefiner<O> {
    oracle: O,
}

impl<O: LpOracle> SparseRefiner<O> {
    pub fn new(oracle: O) -> Self {
        Self { oracle }
    }

    /// The refined tensor for `solution`, or the canonical one if the
    /// oracle fails. Never an error: a validated solution always has the
    /// canonical decomposition.
    pub fn refine<P: Propagator>(
        &self,
        graph: &AncestryGraph,
        solution: &Solution,
        prop: &P,
    ) -> RealTensor {
        let program = SparseProgram::new(graph, solution);
        match self.oracle.solve(&program).and_then(|s| {
            if s.values.len() == program.variables.len() {
                Ok(s)
            } else {
                Err(RefineError::ShapeMismatch {
                    expected: program.variables.len(),
                    got: s.values.len(),
                })
            }
        }) {
            Ok(lp) => Self::assemble(graph, &program, &lp),
            Err(e) => {
                log::warn!("sparse refinement unavailable, using canonical tensor: {}", e);
                solution.frequencies(graph, prop)
            }
        }
    }

    /// Write the oracle's frequencies into a tensor and re-derive the root
    /// row from the placed mass.
    fn assemble(graph: &AncestryGraph, program: &SparseProgram, lp: &LpSolution) -> RealTensor {
        let mut fhat = graph.f_lb().clone();
        for (var, &value) in program.variables.iter().zip(lp.values.iter()) {
            fhat.set(var.state, var.sample, var.character, value);
        }
        for p in 0..graph.num_samples() {
            for c in 0..graph.num_characters() {
                let placed: f64 = program
                    .variables
                    .iter()
                    .zip(lp.values.iter())
                    .filter(|(v, _)| v.character == c && v.sample == p)
                    .map(|(_, &value)| value)
                    .sum();
                fhat.set(0, p, c, 1.0 - placed);
            }
        }
        fhat
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::EdgeId;
    use crate::propagate::NoisyPropagator;
    use crate::statetree::StateTree;

    struct FixedOracle(Result<Vec<f64>, RefineError>);

    impl LpOracle for FixedOracle {
        fn solve(&self, _program: &SparseProgram) -> Result<LpSolution, RefineError> {
            match &self.0 {
                Ok(v) => Ok(LpSolution { values: v.clone() }),
                Err(RefineError::Infeasible) => Err(RefineError::Infeasible),
                Err(e) => Err(RefineError::Oracle(e.to_string())),
            }
        }
    }

    fn chain_solution() -> (AncestryGraph, Solution) {
        let mut lb = RealTensor::new(2, 1, 2);
        let mut ub = RealTensor::new(2, 1, 2);
        lb.set(1, 0, 0, 0.5);
        ub.set(1, 0, 0, 0.9);
        lb.set(1, 0, 1, 0.2);
        ub.set(1, 0, 1, 0.4);
        let g = AncestryGraph::new(vec![StateTree::linear(2); 2], lb, ub);
        let a = g.node(0, 1).unwrap();
        let b = g.node(1, 1).unwrap();
        let ra = *g
            .out_edges(g.root())
            .iter()
            .find(|&&e| g.target(e) == a)
            .unwrap();
        let ab = *g.out_edges(a).iter().find(|&&e| g.target(e) == b).unwrap();
        let edges: Vec<EdgeId> = vec![ra, ab];
        (g, Solution::new(edges))
    }

    #[test]
    fn test_program_shape() {
        let (g, s) = chain_solution();
        let prog = SparseProgram::new(&g, &s);
        assert_eq!(prog.variables().len(), 2);
        assert_eq!(prog.bounds()[0], (0.5, 0.9));
        // One usage row per (sample, tree node): root, A, B.
        assert_eq!(prog.usages().len(), 3);

        let root_usage = prog
            .usages()
            .iter()
            .find(|u| u.node == g.root())
            .unwrap();
        assert_eq!(root_usage.constant, 1.0);
        assert_eq!(root_usage.terms.len(), 1); // minus cum of its one child
        assert_eq!(root_usage.terms[0].1, -1.0);
    }

    #[test]
    fn test_refine_uses_oracle_values() {
        let (g, s) = chain_solution();
        let refiner = SparseRefiner::new(FixedOracle(Ok(vec![0.7, 0.3])));
        let fhat = refiner.refine(&g, &s, &NoisyPropagator);
        assert_eq!(fhat.value(1, 0, 0), 0.7);
        assert_eq!(fhat.value(1, 0, 1), 0.3);
        assert!((fhat.value(0, 0, 0) - 0.3).abs() < 1e-12);
        assert!((fhat.value(0, 0, 1) - 0.7).abs() < 1e-12);
    }

    #[test]
    fn test_refine_falls_back_on_infeasible() {
        let (g, s) = chain_solution();
        let refiner = SparseRefiner::new(FixedOracle(Err(RefineError::Infeasible)));
        let fhat = refiner.refine(&g, &s, &NoisyPropagator);
        assert_eq!(fhat, s.frequencies(&g, &NoisyPropagator));
    }

    #[test]
    fn test_refine_falls_back_on_shape_mismatch() {
        let (g, s) = chain_solution();
        let refiner = SparseRefiner::new(FixedOracle(Ok(vec![0.7])));
        let fhat = refiner.refine(&g, &s, &NoisyPropagator);
        assert_eq!(fhat, s.frequencies(&g, &NoisyPropagator));
    }
}
