/// Deterministic minimization of failing call sequences
use tracing::debug;

use crate::sequence::{Call, CallSequence};

/// Replays a candidate from the clean post-deployment snapshot and reports
/// whether the failing test case still fails. The worker implements this
/// against its chain; tests substitute predicates.
pub trait ReplayOracle {
    fn still_fails(&mut self, sequence: &CallSequence) -> bool;
}

impl<F: FnMut(&CallSequence) -> bool> ReplayOracle for F {
    fn still_fails(&mut self, sequence: &CallSequence) -> bool {
        self(sequence)
    }
}

pub struct ShrinkOutcome {
    pub witness: CallSequence,
    pub replays_used: usize,
}

/// Applies the legal reductions in order until a fixed point or budget
/// exhaustion: delete one call, canonicalize argument values, merge
/// adjacent same-sender duplicates. Every accepted candidate was
/// re-validated by replay.
pub struct Shrinker {
    budget: usize,
}

impl Shrinker {
    pub fn new(budget: usize) -> Self {
        Self { budget }
    }

    pub fn shrink<S>(
        &self,
        witness: CallSequence,
        oracle: &mut dyn ReplayOracle,
        simplify_call: S,
    ) -> ShrinkOutcome
    where
        S: Fn(&Call) -> Vec<Call>,
    {
        let mut best = witness;
        let mut spent = 0usize;

        loop {
            let mut changed = false;
            changed |= self.delete_pass(&mut best, oracle, &mut spent);
            changed |= self.simplify_pass(&mut best, oracle, &mut spent, &simplify_call);
            changed |= self.merge_pass(&mut best, oracle, &mut spent);
            if !changed || spent >= self.budget {
                break;
            }
        }
        debug!(
            "shrinking finished: {} calls, {} replays",
            best.len(),
            spent
        );
        ShrinkOutcome {
            witness: best,
            replays_used: spent,
        }
    }

    fn try_candidate(
        &self,
        candidate: &CallSequence,
        oracle: &mut dyn ReplayOracle,
        spent: &mut usize,
    ) -> bool {
        if *spent >= self.budget {
            return false;
        }
        *spent += 1;
        oracle.still_fails(candidate)
    }

    fn delete_pass(
        &self,
        best: &mut CallSequence,
        oracle: &mut dyn ReplayOracle,
        spent: &mut usize,
    ) -> bool {
        let mut changed = false;
        let mut index = 0;
        while index < best.calls.len() && best.calls.len() > 1 {
            let mut candidate = best.clone();
            candidate.calls.remove(index);
            if self.try_candidate(&candidate, oracle, spent) {
                *best = candidate;
                changed = true;
                // the call now at `index` is unexamined; stay put
            } else {
                index += 1;
            }
            if *spent >= self.budget {
                break;
            }
        }
        changed
    }

    fn simplify_pass<S>(
        &self,
        best: &mut CallSequence,
        oracle: &mut dyn ReplayOracle,
        spent: &mut usize,
        simplify_call: &S,
    ) -> bool
    where
        S: Fn(&Call) -> Vec<Call>,
    {
        let mut changed = false;
        for index in 0..best.calls.len() {
            for replacement in simplify_call(&best.calls[index]) {
                if replacement == best.calls[index] {
                    continue;
                }
                let mut candidate = best.clone();
                candidate.calls[index] = replacement;
                if self.try_candidate(&candidate, oracle, spent) {
                    *best = candidate;
                    changed = true;
                }
                if *spent >= self.budget {
                    return changed;
                }
            }
        }
        changed
    }

    /// Adjacent calls from the same sender to the same target with the
    /// same payload collapse into one, folding the delays together.
    fn merge_pass(
        &self,
        best: &mut CallSequence,
        oracle: &mut dyn ReplayOracle,
        spent: &mut usize,
    ) -> bool {
        let mut changed = false;
        let mut index = 0;
        while index + 1 < best.calls.len() {
            let (a, b) = (&best.calls[index], &best.calls[index + 1]);
            let mergeable =
                a.sender == b.sender && a.to == b.to && a.data == b.data && a.value == b.value;
            if mergeable {
                let mut candidate = best.clone();
                let removed = candidate.calls.remove(index);
                candidate.calls[index].block_delay =
                    candidate.calls[index].block_delay.saturating_add(removed.block_delay);
                candidate.calls[index].time_delay =
                    candidate.calls[index].time_delay.saturating_add(removed.time_delay);
                if self.try_candidate(&candidate, oracle, spent) {
                    *best = candidate;
                    changed = true;
                    continue;
                }
            }
            index += 1;
            if *spent >= self.budget {
                break;
            }
        }
        changed
    }
}
