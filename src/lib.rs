// Copyright (C) 2025 Jeremy J. Carroll. See LICENSE for details.

//! Enumeration of mutation trees consistent with noisy frequency data.
//!
//! Given per-character state trees and interval bounds `[F_lb, F_ub]` on
//! clone frequencies measured across multiple samples, the crate decides
//! which rooted trees of character-states could have produced those
//! measurements, and collects all of them.
//!
//! # Architecture
//!
//! The search separates read-only precomputed data from per-branch state:
//!
//! ## Shared, immutable
//!
//! Built once per run and never mutated afterwards:
//! - [`AncestryGraph`] - which character-states may precede which, derived
//!   from the state trees and the frequency bounds
//! - the `F_lb`/`F_ub` bound tensors themselves
//!
//! ## Per branch, mutable
//!
//! Each search branch (and each parallel worker) owns private copies:
//! - [`TreeState`] - the partial solution tree, arena-indexed by graph ids
//! - [`GraphMask`] - candidate edges still worth trying on this branch
//! - `Fhat` - a [`RealTensor`] of working frequency estimates with a
//!   change log replayed in reverse to undo provisional probes
//!
//! # Search Algorithm
//!
//! [`Enumeration`] grows the tree depth-first, one frontier edge at a time.
//! Every candidate is vetted by the consistency oracle
//! ([`NoisyPropagator`]): attaching it must keep every frequency estimate
//! inside its bounds, certified incrementally by re-propagating only the
//! ancestor chain of the new node. Exhausted frontiers yield recorded
//! solutions; a completion-size bound prunes hopeless branches early.
//!
//! # Parallelization
//!
//! Monoclonal-origin mode fixes the root to a single child, which splits
//! the search into independent sub-searches, one per first edge (or per
//! second edge under the fixed-trunk option). Each split runs on a bounded
//! worker pool with its own tree, mask and tensor; workers share only the
//! deduplicated [`SolutionSet`] and the stop-condition counters.
//!
//! # References
//!
//! - El-Kebir, M., Satas, G., Oesper, L., Raphael, B. J. (2016). "Inferring
//!   the mutational history of a tumor using multi-state perfect phylogeny
//!   mixtures." Cell Systems 3(1), 43-53.

pub mod engine;
pub mod graph;
pub mod propagate;
pub mod solution;
pub mod sparse;
pub mod statetree;
pub mod tensor;

// Re-export commonly used types
pub use engine::{Enumeration, EnumerationConfig, SearchOutcome, SearchStats, StopReason};
pub use graph::{AncestryGraph, EdgeId, GraphMask, NodeId, TreeState, DEFAULT_TOLERANCE};
pub use propagate::{NoisyPropagator, Propagator};
pub use solution::{Solution, SolutionSet};
pub use sparse::{LpOracle, LpSolution, RefineError, SparseProgram, SparseRefiner};
pub use statetree::StateTree;
pub use tensor::RealTensor;
