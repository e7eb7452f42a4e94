use std::sync::Arc;

use tracing::{debug, error, warn};

use super::{cache::BoundedCache, counters::Counters};
use crate::{
    net::wire::{IntList, ReversedList},
    Identifier, WorkerID,
};

/// The outcome of checking one round trip.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Verdict {
    /// Reversing the derived list gave back the original.
    Valid,
    /// The content differs.
    Mismatch {
        /// The derived list after reversing it back
        restored: Vec<i32>,
        original: Vec<i32>,
    },
    /// The aggregate came back with fewer contributions than expected.
    Incomplete { received: usize, expected: usize },
}

/// Reverses `derived` back and compares it with `original`.
pub fn classify(original: &[i32], derived: &[i32]) -> Verdict {
    let restored = reversed(derived);
    if restored == original {
        Verdict::Valid
    } else {
        Verdict::Mismatch {
            restored,
            original: original.to_vec(),
        }
    }
}

/// The transform the workers are expected to apply.
pub fn reversed(list: &[i32]) -> Vec<i32> {
    list.iter().rev().copied().collect()
}

#[derive(Clone, Debug)]
enum Half {
    Original(Vec<i32>),
    Derived(Vec<i32>),
}

/// Cache key for the pair made by one worker's list for one identifier.
fn pair_key(id: Identifier, worker: WorkerID) -> u64 {
    (u64::from(id) << 32) | u64::from(worker)
}

/// Checks originals against what came back from the workers.
///
/// Originals and derived lists arrive independently and in either order.
/// Whichever half shows up first waits in a `BoundedCache` keyed by
/// identifier and worker; the second half completes the pair. A half whose
/// partner takes too long is eventually evicted and simply never judged.
pub struct RoundTripValidator {
    pending: BoundedCache<Half>,
    expected_count: usize,
    counters: Arc<Counters>,
}

impl RoundTripValidator {
    pub fn new(
        capacity: usize,
        expected_count: usize,
        counters: Arc<Counters>,
    ) -> Self {
        Self {
            pending: BoundedCache::new(capacity),
            expected_count,
            counters,
        }
    }

    /// Offers an original list straight from its producer.
    pub fn offer_original(&self, original: IntList) -> Option<Verdict> {
        let IntList {
            list_id,
            generator_id,
            list,
        } = original;
        let key = pair_key(list_id, generator_id);
        match self.pending.take_or_insert(key, Half::Original(list.clone())) {
            None => None,
            Some(Half::Derived(derived)) => {
                Some(self.judge(list_id, generator_id, &list, &derived))
            }
            Some(Half::Original(_)) => {
                warn!(
                    id = list_id,
                    worker = generator_id,
                    "replacing an original that was received twice"
                );
                let _ = self.pending.put(key, Half::Original(list), true);
                None
            }
        }
    }

    /// Offers a gathered aggregate. An under-filled aggregate is judged
    /// `Incomplete` as a whole and none of its lists are compared.
    pub fn offer_derived(&self, aggregate: ReversedList) -> Vec<Verdict> {
        let ReversedList { list_id, lists, .. } = aggregate;
        if lists.len() < self.expected_count {
            let verdict = Verdict::Incomplete {
                received: lists.len(),
                expected: self.expected_count,
            };
            self.counters.incomplete_aggregates.incr();
            error!(
                id = list_id,
                received = lists.len(),
                expected = self.expected_count,
                "incomplete aggregate"
            );
            return vec![verdict];
        }

        let mut verdicts = Vec::with_capacity(lists.len());
        for derived in lists {
            let key = pair_key(list_id, derived.generator_id);
            let worker = derived.generator_id;
            match self
                .pending
                .take_or_insert(key, Half::Derived(derived.list.clone()))
            {
                None => {}
                Some(Half::Original(original)) => verdicts.push(self.judge(
                    list_id,
                    worker,
                    &original,
                    &derived.list,
                )),
                Some(Half::Derived(_)) => {
                    warn!(
                        id = list_id,
                        worker,
                        "replacing a derived list that was received twice"
                    );
                    let _ = self.pending.put(
                        key,
                        Half::Derived(derived.list),
                        true,
                    );
                }
            }
        }
        verdicts
    }

    fn judge(
        &self,
        id: Identifier,
        worker: WorkerID,
        original: &[i32],
        derived: &[i32],
    ) -> Verdict {
        let verdict = classify(original, derived);
        match &verdict {
            Verdict::Valid => {
                self.counters.valid_pairs.incr();
                debug!(id, worker, len = original.len(), "round trip valid");
            }
            Verdict::Mismatch { restored, original } => {
                self.counters.mismatched_pairs.incr();
                error!(
                    id,
                    worker,
                    ?restored,
                    ?original,
                    "data mismatch: doubly-reversed list differs from the original"
                );
            }
            Verdict::Incomplete { .. } => {}
        }
        verdict
    }

    /// Pairs still waiting for their other half.
    pub fn waiting(&self) -> usize {
        self.pending.len()
    }

    pub fn clear(&self) {
        self.pending.clear();
    }
}
