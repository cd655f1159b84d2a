// Copyright (C) 2025 Jeremy J. Carroll. See LICENSE for details.

//! Branch-and-bound enumeration of consistent solution trees.
//!
//! The engine grows an arborescence over the ancestry graph one edge at a
//! time, keeping a frontier of candidate edges that have already passed the
//! consistency oracle. Committing an edge updates `Fhat` in place; undoing
//! it detaches the node and re-propagates from the edge source, which
//! restores `Fhat` exactly. Each branch owns its private [`GraphMask`],
//! [`TreeState`] and working tensor over the one shared read-only graph, so
//! branches and workers never contend on search state; the only shared
//! structures are the solution set behind a mutex and a handful of atomic
//! counters.
//!
//! A completion-size bound prunes branches whose optimistically reachable
//! node set can no longer meet the required minimum tree size. Stop
//! conditions (solution count limit, wall-clock deadline) are checked
//! cooperatively at the top of every `grow` call and unwind all branches
//! without further work; solutions recorded before the trip are retained.
//!
//! Monoclonal-origin mode restricts every solution to a single child of the
//! root. The engine then splits the search by first edge (or by second edge
//! under the fixed-trunk option) and may run the splits on a bounded worker
//! pool; exploration order within each split is deliberately randomized.

pub mod stats;

pub use stats::{SearchOutcome, SearchStats, StopReason};

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rayon::prelude::*;

use crate::graph::{AncestryGraph, EdgeId, GraphMask, NodeId, TreeState};
use crate::propagate::{NoisyPropagator, Propagator};
use crate::solution::{Solution, SolutionSet};
use crate::tensor::RealTensor;

/// Knobs for one enumeration run.
#[derive(Debug, Clone)]
pub struct EnumerationConfig {
    /// Stop after this many distinct solutions; `None` for unlimited.
    pub limit: Option<usize>,
    /// Wall-clock budget for the whole run; `None` for unlimited.
    pub deadline: Option<Duration>,
    /// Upper bound on simultaneously running workers.
    pub num_workers: usize,
    /// Solutions with fewer edges than this are discarded, and branches
    /// that provably cannot reach it are pruned.
    pub min_tree_size: usize,
    /// Restrict solutions to a single child of the root.
    pub monoclonal: bool,
    /// Additionally fix the first edge and split the search on the second.
    /// Only meaningful together with `monoclonal`.
    pub fix_trunk: bool,
    /// Characters that must appear, fully placed, in every reported
    /// solution.
    pub required_characters: Vec<usize>,
    /// Seed for the randomized exploration order of monoclonal mode.
    pub shuffle_seed: u64,
}

impl Default for EnumerationConfig {
    fn default() -> Self {
        Self {
            limit: None,
            deadline: None,
            num_workers: 1,
            min_tree_size: 0,
            monoclonal: false,
            fix_trunk: false,
            required_characters: Vec::new(),
            shuffle_seed: 0,
        }
    }
}

/// State shared by all workers of one run: the accumulating solution set,
/// progress counters, and the stop conditions.
struct SharedState {
    solutions: Mutex<SolutionSet>,
    found: AtomicUsize,
    grow_calls: AtomicU64,
    pruned: AtomicU64,
    limit: Option<usize>,
    deadline: Option<Instant>,
}

impl SharedState {
    fn new(config: &EnumerationConfig) -> Self {
        Self {
            solutions: Mutex::new(SolutionSet::new()),
            found: AtomicUsize::new(0),
            grow_calls: AtomicU64::new(0),
            pruned: AtomicU64::new(0),
            limit: config.limit,
            deadline: config.deadline.map(|d| Instant::now() + d),
        }
    }

    /// Whether a global stop condition has fired.
    fn stopped(&self) -> bool {
        if let Some(limit) = self.limit {
            if self.found.load(Ordering::Relaxed) >= limit {
                return true;
            }
        }
        if let Some(deadline) = self.deadline {
            if Instant::now() >= deadline {
                return true;
            }
        }
        false
    }

    /// Record a solution; returns true once the count limit is reached.
    ///
    /// The limit is re-checked under the lock: a worker may pass the
    /// cooperative stop check while another worker records the final
    /// solution, and must not push the set past the limit.
    fn record(&self, solution: Solution) -> bool {
        let mut set = self.solutions.lock().expect("solution set lock poisoned");
        if let Some(limit) = self.limit {
            if self.found.load(Ordering::Relaxed) >= limit {
                return true;
            }
        }
        if set.insert(solution) {
            let n = self.found.fetch_add(1, Ordering::Relaxed) + 1;
            log::debug!("recorded solution {}", n);
        }
        drop(set);
        matches!(self.limit, Some(l) if self.found.load(Ordering::Relaxed) >= l)
    }
}

/// One enumeration run over a shared ancestry graph.
pub struct Enumeration<'a, P = NoisyPropagator> {
    graph: &'a AncestryGraph,
    config: EnumerationConfig,
    propagator: P,
}

impl<'a> Enumeration<'a, NoisyPropagator> {
    pub fn new(graph: &'a AncestryGraph, config: EnumerationConfig) -> Self {
        Self::with_propagator(graph, config, NoisyPropagator)
    }
}

impl<'a, P: Propagator + Sync> Enumeration<'a, P> {
    /// Run with a custom consistency-propagation strategy.
    pub fn with_propagator(graph: &'a AncestryGraph, config: EnumerationConfig, propagator: P) -> Self {
        assert!(
            !config.fix_trunk || config.monoclonal,
            "fixed-trunk splitting requires monoclonal origin"
        );
        Self {
            graph,
            config,
            propagator,
        }
    }

    /// Enumerate until exhaustion or a stop condition fires.
    pub fn run(&self) -> SearchOutcome {
        let shared = SharedState::new(&self.config);

        if self.config.monoclonal {
            self.run_split(&shared);
        } else {
            let mut worker = Worker::new(self.graph, &self.propagator, &self.config, &shared, 0);
            worker.search();
        }

        let solutions = match shared.solutions.into_inner() {
            Ok(set) => set,
            Err(poisoned) => poisoned.into_inner(),
        };
        let found = shared.found.load(Ordering::Relaxed);
        let stop_reason = if matches!(shared.limit, Some(l) if found >= l) {
            StopReason::LimitReached
        } else if matches!(shared.deadline, Some(d) if Instant::now() >= d) {
            StopReason::DeadlineExpired
        } else {
            StopReason::Exhausted
        };
        let stats = SearchStats {
            grow_calls: shared.grow_calls.load(Ordering::Relaxed),
            pruned_branches: shared.pruned.load(Ordering::Relaxed),
            solutions_found: found as u64,
            stop_reason,
        };
        log::info!(
            "enumeration finished: {} solutions, {} grow calls, {} pruned ({})",
            stats.solutions_found,
            stats.grow_calls,
            stats.pruned_branches,
            stats.stop_reason
        );
        SearchOutcome { solutions, stats }
    }

    /// Monoclonal mode: split the search into one independent sub-search
    /// per admissible first edge (or second edge under the fixed-trunk
    /// option) and run the splits on a bounded pool.
    fn run_split(&self, shared: &SharedState) {
        let root = self.graph.root();
        let mut seeds: Vec<Vec<EdgeId>> = if self.config.fix_trunk {
            match self.graph.out_edges(root).first() {
                Some(&trunk) => self
                    .graph
                    .out_edges(self.graph.target(trunk))
                    .iter()
                    .map(|&e| vec![trunk, e])
                    .collect(),
                None => Vec::new(),
            }
        } else {
            self.graph.out_edges(root).iter().map(|&e| vec![e]).collect()
        };

        let mut rng = StdRng::seed_from_u64(self.config.shuffle_seed);
        seeds.shuffle(&mut rng);

        let run_seed = |idx: usize| {
            let mut worker =
                Worker::new(self.graph, &self.propagator, &self.config, shared, idx as u64 + 1);
            worker.run_seeded(&seeds, idx);
        };

        if self.config.num_workers > 1 {
            let pool = rayon::ThreadPoolBuilder::new()
                .num_threads(self.config.num_workers)
                .build();
            match pool {
                Ok(pool) => pool.install(|| {
                    (0..seeds.len()).into_par_iter().for_each(run_seed);
                }),
                Err(e) => {
                    log::warn!("worker pool unavailable, searching sequentially: {}", e);
                    (0..seeds.len()).for_each(run_seed);
                }
            }
        } else {
            (0..seeds.len()).for_each(run_seed);
        }
    }
}

/// One depth-first sub-search with private tree, mask and working tensor.
struct Worker<'a, P> {
    graph: &'a AncestryGraph,
    prop: &'a P,
    config: &'a EnumerationConfig,
    shared: &'a SharedState,
    tree: TreeState,
    mask: GraphMask,
    fhat: RealTensor,
    rng: StdRng,
}

impl<'a, P: Propagator> Worker<'a, P> {
    fn new(
        graph: &'a AncestryGraph,
        prop: &'a P,
        config: &'a EnumerationConfig,
        shared: &'a SharedState,
        rng_stream: u64,
    ) -> Self {
        Self {
            graph,
            prop,
            config,
            shared,
            tree: TreeState::new(graph),
            mask: GraphMask::new(graph),
            fhat: prop.baseline(graph),
            rng: StdRng::seed_from_u64(config.shuffle_seed.wrapping_add(rng_stream)),
        }
    }

    /// Commit the seed path for split `idx`, mask out the splits owned by
    /// earlier workers (and, for monoclonal origin, every other root edge),
    /// then search.
    fn run_seeded(&mut self, seeds: &[Vec<EdgeId>], idx: usize) {
        let path = &seeds[idx];
        for earlier in &seeds[..idx] {
            if let Some(&e) = earlier.last() {
                self.mask.disable(e);
            }
        }
        for &e in self.graph.out_edges(self.graph.root()) {
            if e != path[0] {
                self.mask.disable(e);
            }
        }
        for &e in path {
            if !self.admissible(e) {
                return;
            }
            self.tree.attach(self.graph, e);
            if !self
                .prop
                .update(self.graph, &self.tree, self.graph.target(e), &mut self.fhat)
            {
                // The seed itself is inconsistent; nothing to search.
                return;
            }
        }
        self.search();
    }

    fn search(&mut self) {
        let mut frontier = self.initial_frontier();
        self.order_frontier(&mut frontier);
        self.grow(&mut frontier);
    }

    /// Candidate edges out of the current tree that pass every admission
    /// test. Used once per worker; afterwards the frontier is maintained
    /// incrementally by [`extend_frontier`](Self::extend_frontier).
    fn initial_frontier(&mut self) -> Vec<EdgeId> {
        let mut frontier = Vec::new();
        for v in (0..self.graph.num_nodes()).map(NodeId::from_index) {
            if !self.tree.contains_node(v) {
                continue;
            }
            for &f in self.graph.out_edges(v) {
                if self.admissible(f)
                    && self.prop.check(self.graph, &mut self.tree, &mut self.fhat, f)
                {
                    frontier.push(f);
                }
            }
        }
        frontier
    }

    /// Structural admission: the edge is still enabled, its target is new,
    /// and the target state's predecessor is the first same-character node
    /// on the path from the attach point to the root.
    fn admissible(&self, f: EdgeId) -> bool {
        if !self.mask.is_enabled(f) {
            return false;
        }
        let w = self.graph.target(f);
        if self.tree.contains_node(w) {
            return false;
        }
        let (d, j) = self
            .graph
            .char_state(w)
            .expect("edge targets are never the root");
        let pi = self
            .graph
            .state_tree(d)
            .parent(j)
            .expect("non-root states have a parent state");
        let anc = self
            .graph
            .node(d, pi)
            .expect("parent states are present");
        self.is_first_ancestor(d, anc, self.graph.source(f))
    }

    /// Whether `anc` is the first node of `character` (or the root, when
    /// `anc` is the root) on the walk from `from` up to the root.
    fn is_first_ancestor(&self, character: usize, anc: NodeId, from: NodeId) -> bool {
        let mut v = from;
        loop {
            if v == anc {
                return true;
            }
            match self.graph.char_state(v) {
                None => return false,
                Some((c, _)) if c == character => return false,
                Some(_) => {}
            }
            v = self
                .tree
                .parent(self.graph, v)
                .expect("walk stays inside the tree");
        }
    }

    /// The frontier for the tree extended by an edge into `target`: the
    /// surviving old candidates re-validated against the updated tensor,
    /// plus the admissible out-edges of `target`.
    fn extend_frontier(&mut self, old: &[EdgeId], target: NodeId) -> Vec<EdgeId> {
        let mut next = Vec::with_capacity(old.len());
        for &f in old {
            if self.graph.target(f) == target {
                continue;
            }
            if self.prop.check(self.graph, &mut self.tree, &mut self.fhat, f) {
                next.push(f);
            }
        }
        for &f in self.graph.out_edges(target) {
            if self.admissible(f) && self.prop.check(self.graph, &mut self.tree, &mut self.fhat, f) {
                next.push(f);
            }
        }
        next
    }

    /// Exploration order. Candidates are popped from the back, so the sort
    /// puts the most constrained target (highest cumulative lower bound in
    /// any sample) last. Monoclonal mode shuffles instead, so that the
    /// independent splits diversify.
    fn order_frontier(&mut self, frontier: &mut Vec<EdgeId>) {
        if self.config.monoclonal {
            frontier.shuffle(&mut self.rng);
            return;
        }
        let key = |e: EdgeId| {
            let (c, i) = self
                .graph
                .char_state(self.graph.target(e))
                .expect("edge targets are never the root");
            (0..self.graph.num_samples())
                .map(|p| self.graph.cum_lower(p, c, i))
                .fold(0.0, f64::max)
        };
        frontier.sort_by(|&a, &b| {
            key(a)
                .partial_cmp(&key(b))
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.cmp(&b))
        });
    }

    /// Depth-first extension of the current tree. Returns true when a stop
    /// condition fired, which abandons the branch without restoring it.
    fn grow(&mut self, frontier: &mut Vec<EdgeId>) -> bool {
        self.shared.grow_calls.fetch_add(1, Ordering::Relaxed);
        if self.shared.stopped() {
            return true;
        }
        if frontier.is_empty() {
            return self.finalize();
        }
        if self.prune(frontier) {
            self.shared.pruned.fetch_add(1, Ordering::Relaxed);
            return false;
        }

        let mut tried = Vec::new();
        while let Some(e) = frontier.pop() {
            let source = self.graph.source(e);
            let target = self.graph.target(e);

            self.tree.attach(self.graph, e);
            let ok = self.prop.update(self.graph, &self.tree, target, &mut self.fhat);
            debug_assert!(ok, "frontier edges were pre-validated");

            let mut next = self.extend_frontier(frontier, target);
            self.order_frontier(&mut next);
            if self.grow(&mut next) {
                return true;
            }

            self.mask.disable(e);
            self.tree.detach(self.graph, e);
            let ok = self.prop.update(self.graph, &self.tree, source, &mut self.fhat);
            debug_assert!(ok, "undo re-propagates a previously consistent state");
            tried.push(e);
        }

        // Restore the frontier for the caller, in its original order.
        for e in tried.into_iter().rev() {
            self.mask.enable(e);
            frontier.push(e);
        }
        false
    }

    /// Necessary-condition bound: over the optimistic graph (tree edges,
    /// frontier edges, and every edge not yet ruled out for this branch),
    /// every committed or required character must remain completable, and
    /// enough nodes must remain reachable to meet the minimum size.
    fn prune(&self, frontier: &[EdgeId]) -> bool {
        let g = self.graph;
        let n = g.num_characters();
        let k = g.num_states();

        let mut in_frontier = vec![false; g.num_edges()];
        let mut frontier_target = vec![false; g.num_nodes()];
        for &e in frontier {
            in_frontier[e.index()] = true;
            frontier_target[g.target(e).index()] = true;
        }
        // An edge is optimistically usable if it is committed, still a
        // candidate, or attacks a node this branch has not yet fixed an
        // entry point for.
        let allowed = |e: EdgeId| {
            self.tree.contains_edge(e)
                || in_frontier[e.index()]
                || !(self.tree.contains_node(g.source(e)) || frontier_target[g.target(e).index()])
        };

        let mut char_committed = vec![false; n];
        for v in (0..g.num_nodes()).map(NodeId::from_index) {
            if self.tree.contains_node(v) {
                if let Some((c, _)) = g.char_state(v) {
                    char_committed[c] = true;
                }
            }
        }
        for &c in &self.config.required_characters {
            char_committed[c] = true;
        }

        let mut removed = vec![false; g.num_nodes()];
        loop {
            let mut reach = vec![false; g.num_nodes()];
            reach[g.root().index()] = true;
            let mut stack = vec![g.root()];
            while let Some(v) = stack.pop() {
                for &e in g.out_edges(v) {
                    let w = g.target(e);
                    if !allowed(e) || removed[w.index()] || reach[w.index()] {
                        continue;
                    }
                    reach[w.index()] = true;
                    stack.push(w);
                }
            }

            let mut changed = false;
            for c in 0..n {
                let complete = (1..k).all(|i| match g.node(c, i) {
                    Some(v) => reach[v.index()],
                    None => true,
                });
                if complete {
                    continue;
                }
                if char_committed[c] {
                    return true;
                }
                // A character that cannot be fully placed contributes
                // nothing; drop it and re-derive reachability.
                for i in 1..k {
                    if let Some(v) = g.node(c, i) {
                        if reach[v.index()] && !removed[v.index()] {
                            removed[v.index()] = true;
                            changed = true;
                        }
                    }
                }
            }
            if !changed {
                let potential = reach
                    .iter()
                    .zip(removed.iter())
                    .filter(|(&r, &x)| r && !x)
                    .count()
                    - 1;
                return potential < self.config.min_tree_size;
            }
        }
    }

    /// Terminal handling: trim the tree to fully placed characters, apply
    /// the size and allow-list requirements, and record the result. Returns
    /// true once the count limit is reached.
    fn finalize(&self) -> bool {
        let g = self.graph;
        let n = g.num_characters();
        let k = g.num_states();

        let mut keep: Vec<bool> = (0..g.num_nodes())
            .map(|i| self.tree.contains_node(NodeId::from_index(i)))
            .collect();
        loop {
            let mut changed = false;
            for c in 0..n {
                let mut any = false;
                let mut all = true;
                for i in 1..k {
                    if let Some(v) = g.node(c, i) {
                        if keep[v.index()] {
                            any = true;
                        } else {
                            all = false;
                        }
                    }
                }
                if any && !all {
                    if self.config.required_characters.contains(&c) {
                        return false;
                    }
                    for i in 1..k {
                        if let Some(v) = g.node(c, i) {
                            if keep[v.index()] {
                                keep[v.index()] = false;
                                changed = true;
                            }
                        }
                    }
                }
            }
            // Dropping a node orphans its subtree.
            for v in (1..g.num_nodes()).map(NodeId::from_index) {
                if !keep[v.index()] {
                    continue;
                }
                let p = self
                    .tree
                    .parent(g, v)
                    .expect("tree nodes have a parent");
                if !keep[p.index()] {
                    keep[v.index()] = false;
                    changed = true;
                }
            }
            if !changed {
                break;
            }
        }

        for &c in &self.config.required_characters {
            for i in 1..k {
                if let Some(v) = g.node(c, i) {
                    if !keep[v.index()] {
                        return false;
                    }
                }
            }
        }

        let edges: Vec<EdgeId> = (1..g.num_nodes())
            .map(NodeId::from_index)
            .filter(|&v| keep[v.index()])
            .map(|v| {
                self.tree
                    .parent_edge(v)
                    .expect("kept nodes are tree nodes")
            })
            .collect();
        if edges.is_empty() || edges.len() < self.config.min_tree_size {
            return false;
        }
        self.shared.record(Solution::new(edges))
    }
}
