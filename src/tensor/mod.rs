// Copyright (C) 2025 Jeremy J. Carroll. See LICENSE for details.

//! Dense 3D frequency tensors with change-log rollback.
//!
//! A [`RealTensor`] stores one `f64` per (state, sample, character) triple.
//! The enumeration engine mutates a working tensor (`Fhat`) while testing
//! candidate edges; with change tracking enabled every overwrite is recorded
//! in an append-only delta log, and [`RealTensor::roll_back`] replays the log
//! in reverse to restore the exact prior contents, so a rejected probe
//! leaves no trace.
//!
//! Out-of-range indices are a caller contract violation and panic.

/// One recorded overwrite: the coordinates and the value they held before.
#[derive(Debug, Clone, Copy)]
struct Delta {
    state: usize,
    sample: usize,
    character: usize,
    value: f64,
}

/// Dense tensor of shape `[states × samples × characters]`.
///
/// Indexing order follows the frequency-matrix convention: `(i, p, c)` is
/// state `i`, sample `p`, character `c`.
#[derive(Debug, Clone)]
pub struct RealTensor {
    num_states: usize,
    num_samples: usize,
    num_characters: usize,
    data: Vec<f64>,
    track_changes: bool,
    deltas: Vec<Delta>,
}

impl RealTensor {
    /// Create a zero-filled tensor of shape `k × m × n`.
    pub fn new(num_states: usize, num_samples: usize, num_characters: usize) -> Self {
        Self {
            num_states,
            num_samples,
            num_characters,
            data: vec![0.0; num_states * num_samples * num_characters],
            track_changes: false,
            deltas: Vec::new(),
        }
    }

    /// Number of states per character (the `k` dimension).
    pub fn num_states(&self) -> usize {
        self.num_states
    }

    /// Number of samples (the `m` dimension).
    pub fn num_samples(&self) -> usize {
        self.num_samples
    }

    /// Number of characters (the `n` dimension).
    pub fn num_characters(&self) -> usize {
        self.num_characters
    }

    fn index(&self, state: usize, sample: usize, character: usize) -> usize {
        assert!(state < self.num_states, "state {} out of range", state);
        assert!(sample < self.num_samples, "sample {} out of range", sample);
        assert!(
            character < self.num_characters,
            "character {} out of range",
            character
        );
        (state * self.num_samples + sample) * self.num_characters + character
    }

    /// Read one entry.
    pub fn value(&self, state: usize, sample: usize, character: usize) -> f64 {
        self.data[self.index(state, sample, character)]
    }

    /// Overwrite one entry.
    ///
    /// When change tracking is on and `val` differs from the stored value,
    /// the old value is appended to the delta log before the overwrite, so a
    /// later [`roll_back`](Self::roll_back) restores it.
    pub fn set(&mut self, state: usize, sample: usize, character: usize, val: f64) {
        let idx = self.index(state, sample, character);
        if self.data[idx] != val {
            if self.track_changes {
                self.deltas.push(Delta {
                    state,
                    sample,
                    character,
                    value: self.data[idx],
                });
            }
            self.data[idx] = val;
        }
    }

    /// Whether overwrites are currently being logged.
    pub fn track_changes(&self) -> bool {
        self.track_changes
    }

    /// Turn the delta log on or off. Turning it off does not clear it.
    pub fn set_track_changes(&mut self, track: bool) {
        self.track_changes = track;
    }

    /// Replay the delta log in reverse, restoring all logged overwrites,
    /// then clear the log.
    ///
    /// Any matched sequence of `set` calls followed by `roll_back` leaves the
    /// tensor bit-for-bit identical to its prior state.
    pub fn roll_back(&mut self) {
        while let Some(d) = self.deltas.pop() {
            let idx = (d.state * self.num_samples + d.sample) * self.num_characters + d.character;
            self.data[idx] = d.value;
        }
    }

    /// Cumulative frequency of a descendant-state set: the sum of this
    /// tensor over `states` for a fixed `(sample, character)`.
    pub fn cum_freq(&self, sample: usize, character: usize, states: &[usize]) -> f64 {
        states
            .iter()
            .map(|&i| self.value(i, sample, character))
            .sum()
    }
}

impl PartialEq for RealTensor {
    fn eq(&self, other: &Self) -> bool {
        self.num_states == other.num_states
            && self.num_samples == other.num_samples
            && self.num_characters == other.num_characters
            && self.data == other.data
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_new_is_zero() {
        let t = RealTensor::new(2, 3, 4);
        assert_eq!(t.num_states(), 2);
        assert_eq!(t.num_samples(), 3);
        assert_eq!(t.num_characters(), 4);
        for i in 0..2 {
            for p in 0..3 {
                for c in 0..4 {
                    assert_eq!(t.value(i, p, c), 0.0);
                }
            }
        }
    }

    #[test]
    fn test_set_and_value() {
        let mut t = RealTensor::new(2, 2, 2);
        t.set(1, 0, 1, 0.25);
        assert_eq!(t.value(1, 0, 1), 0.25);
        assert_eq!(t.value(0, 0, 1), 0.0);
    }

    #[test]
    fn test_roll_back_restores_exactly() {
        let mut t = RealTensor::new(2, 2, 2);
        t.set(0, 0, 0, 0.5);
        t.set(1, 1, 1, 0.75);

        let before = t.clone();
        t.set_track_changes(true);
        t.set(0, 0, 0, 0.1);
        t.set(1, 1, 1, 0.2);
        t.set(0, 0, 0, 0.3); // second overwrite of the same cell
        t.set_track_changes(false);
        t.roll_back();

        assert_eq!(t, before);
    }

    #[test]
    fn test_untracked_set_is_permanent() {
        let mut t = RealTensor::new(1, 1, 1);
        t.set(0, 0, 0, 0.4);
        t.roll_back(); // log is empty, nothing to undo
        assert_eq!(t.value(0, 0, 0), 0.4);
    }

    #[test]
    fn test_set_same_value_records_nothing() {
        let mut t = RealTensor::new(1, 1, 1);
        t.set(0, 0, 0, 0.4);
        t.set_track_changes(true);
        t.set(0, 0, 0, 0.4);
        t.set_track_changes(false);
        t.roll_back();
        assert_eq!(t.value(0, 0, 0), 0.4);
    }

    #[test]
    fn test_cum_freq() {
        let mut t = RealTensor::new(3, 1, 1);
        t.set(0, 0, 0, 0.1);
        t.set(1, 0, 0, 0.2);
        t.set(2, 0, 0, 0.3);
        assert!((t.cum_freq(0, 0, &[1, 2]) - 0.5).abs() < 1e-12);
    }

    #[test]
    #[should_panic(expected = "state 5 out of range")]
    fn test_out_of_range_panics() {
        let t = RealTensor::new(2, 2, 2);
        t.value(5, 0, 0);
    }

    proptest! {
        /// Any tracked sequence of sets followed by roll_back restores the
        /// tensor exactly.
        #[test]
        fn prop_roll_back_is_exact(
            writes in prop::collection::vec(
                (0usize..3, 0usize..2, 0usize..2, 0.0f64..1.0),
                0..32,
            )
        ) {
            let mut t = RealTensor::new(3, 2, 2);
            t.set(1, 0, 0, 0.5);
            t.set(2, 1, 1, 0.25);

            let before = t.clone();
            t.set_track_changes(true);
            for (i, p, c, v) in writes {
                t.set(i, p, c, v);
            }
            t.set_track_changes(false);
            t.roll_back();

            prop_assert!(t == before);
        }
    }
}
