// Copyright (C) 2025 Jeremy J. Carroll. See LICENSE for details.

//! Per-character state trees.
//!
//! Each character has a tree over its states `0..k` that encodes the
//! permissible transitions: state 0 is the root and means absence, and a
//! state can only arise from its unique parent state. Not every state has to
//! be present; absent states are skipped during ancestry-graph construction.
//!
//! Construction is a one-shot batch step. A malformed parent vector (state 0
//! not the root, a parent index out of range, a parent that is itself
//! absent) is a caller contract violation and panics.

/// Transition tree over the states of one character.
///
/// Built from a parent vector `pi` where `pi[0] == -1` (root), `pi[i] == -2`
/// marks state `i` absent, and any other value is the parent state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateTree {
    num_states: usize,
    /// `parent[i]` is `Some(pi)` for present non-root states, `None` for the
    /// root and for absent states (disambiguated by `present`).
    parent: Vec<Option<usize>>,
    present: Vec<bool>,
    /// `descendants[i]` is the descendant-state set of `i`, itself included,
    /// sorted ascending. Empty for absent states.
    descendants: Vec<Vec<usize>>,
}

impl StateTree {
    /// Build a state tree from a parent vector.
    pub fn from_parents(pi: &[isize]) -> Self {
        let k = pi.len();
        assert!(k >= 1, "state tree must have at least the root state");
        assert_eq!(pi[0], -1, "state 0 must be the root");

        let mut parent = vec![None; k];
        let mut present = vec![false; k];
        present[0] = true;
        for (i, &p) in pi.iter().enumerate().skip(1) {
            match p {
                -2 => {}
                p => {
                    assert!(
                        (0..k as isize).contains(&p),
                        "parent {} of state {} out of range",
                        p,
                        i
                    );
                    parent[i] = Some(p as usize);
                    present[i] = true;
                }
            }
        }
        for i in 1..k {
            if let Some(p) = parent[i] {
                assert!(present[p], "state {} has absent parent {}", i, p);
            }
        }

        let mut descendants = vec![Vec::new(); k];
        // Walk down from each present state; the inner parent scan is
        // quadratic in k, which stays tiny.
        for i in 0..k {
            if present[i] {
                let mut stack = vec![i];
                while let Some(j) = stack.pop() {
                    descendants[i].push(j);
                    for (l, &pl) in parent.iter().enumerate() {
                        if pl == Some(j) {
                            stack.push(l);
                        }
                    }
                }
                descendants[i].sort_unstable();
            }
        }

        Self {
            num_states: k,
            parent,
            present,
            descendants,
        }
    }

    /// The linear chain `0 → 1 → … → k−1`, the shape used for simple
    /// mutation characters (absent → present for `k == 2`).
    pub fn linear(k: usize) -> Self {
        let pi: Vec<isize> = (0..k as isize).map(|i| i - 1).collect();
        Self::from_parents(&pi)
    }

    /// Number of states, present or not (the `k` dimension).
    pub fn num_states(&self) -> usize {
        self.num_states
    }

    /// Number of present states.
    pub fn num_present(&self) -> usize {
        self.present.iter().filter(|&&b| b).count()
    }

    /// Whether state `i` participates in this character's tree.
    pub fn is_present(&self, i: usize) -> bool {
        assert!(i < self.num_states, "state {} out of range", i);
        self.present[i]
    }

    /// Unique predecessor state of `i`, `None` for the root.
    ///
    /// # Panics
    ///
    /// Panics if `i` is absent.
    pub fn parent(&self, i: usize) -> Option<usize> {
        assert!(self.is_present(i), "state {} is absent", i);
        self.parent[i]
    }

    /// Whether `i` is the parent of `j` in the state tree.
    pub fn is_parent(&self, i: usize, j: usize) -> bool {
        assert!(i < self.num_states && j < self.num_states);
        self.present[j] && self.parent[j] == Some(i)
    }

    /// Whether `i` lies on the path from the root to `j` (inclusive).
    pub fn is_ancestor(&self, i: usize, j: usize) -> bool {
        assert!(self.is_present(i) && self.is_present(j));
        let mut v = j;
        loop {
            if v == i {
                return true;
            }
            match self.parent[v] {
                Some(p) => v = p,
                None => return false,
            }
        }
    }

    /// Descendant-state set of `i`, itself included, sorted ascending.
    pub fn descendants(&self, i: usize) -> &[usize] {
        assert!(self.is_present(i), "state {} is absent", i);
        &self.descendants[i]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_linear_chain() {
        let s = StateTree::linear(3);
        assert_eq!(s.num_states(), 3);
        assert_eq!(s.num_present(), 3);
        assert_eq!(s.parent(0), None);
        assert_eq!(s.parent(1), Some(0));
        assert_eq!(s.parent(2), Some(1));
        assert!(s.is_parent(0, 1));
        assert!(!s.is_parent(0, 2));
        assert!(s.is_ancestor(0, 2));
        assert!(s.is_ancestor(1, 2));
        assert!(!s.is_ancestor(2, 1));
        assert_eq!(s.descendants(0), &[0, 1, 2]);
        assert_eq!(s.descendants(1), &[1, 2]);
        assert_eq!(s.descendants(2), &[2]);
    }

    #[test]
    fn test_branching_with_absent_state() {
        // 0 is root; 1 and 3 are children of 0; 2 is absent.
        let s = StateTree::from_parents(&[-1, 0, -2, 0]);
        assert_eq!(s.num_present(), 3);
        assert!(!s.is_present(2));
        assert_eq!(s.descendants(0), &[0, 1, 3]);
        assert_eq!(s.descendants(1), &[1]);
        assert!(!s.is_parent(1, 3));
    }

    #[test]
    #[should_panic(expected = "state 0 must be the root")]
    fn test_nonroot_zero_panics() {
        StateTree::from_parents(&[0, -1]);
    }

    #[test]
    #[should_panic(expected = "absent parent")]
    fn test_absent_parent_panics() {
        StateTree::from_parents(&[-1, -2, 1]);
    }
}
