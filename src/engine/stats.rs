// Copyright (C) 2025 Jeremy J. Carroll. See LICENSE for details.

//! Counters and outcome reporting for one enumeration run.

use strum_macros::Display;

use crate::solution::SolutionSet;

/// Why the run stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum StopReason {
    /// Every branch was explored to exhaustion.
    Exhausted,
    /// The solution count limit was hit.
    LimitReached,
    /// The wall-clock deadline expired.
    DeadlineExpired,
}

/// Aggregate counters over all workers of one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SearchStats {
    /// Recursive grow invocations across all branches.
    pub grow_calls: u64,
    /// Branches cut by the completion-size bound before exploration.
    pub pruned_branches: u64,
    /// Terminal trees recorded (distinct solutions after deduplication).
    pub solutions_found: u64,
    pub stop_reason: StopReason,
}

/// Everything a run produces.
#[derive(Debug)]
pub struct SearchOutcome {
    pub solutions: SolutionSet,
    pub stats: SearchStats,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stop_reason_display() {
        assert_eq!(StopReason::Exhausted.to_string(), "Exhausted");
        assert_eq!(StopReason::DeadlineExpired.to_string(), "DeadlineExpired");
    }
}
