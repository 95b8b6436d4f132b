//! Signed counter deltas carried by projection tasks.

use serde::{Deserialize, Serialize};

/// Per-metric signed increments for one subject's index document.
///
/// Deltas are **commutative**: applying any permutation of a set of deltas
/// yields the same counters. The pipeline leans on this — tasks for the same
/// subject may be applied in any order, and an occasional double-apply after a
/// crash only ever re-adds a delta, never corrupts absolute state.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CounterDeltas {
    pub download: i64,
    pub like: i64,
    pub comment: i64,
    pub view: i64,
}

impl CounterDeltas {
    pub const ZERO: CounterDeltas = CounterDeltas {
        download: 0,
        like: 0,
        comment: 0,
        view: 0,
    };

    pub fn download(n: i64) -> Self {
        Self {
            download: n,
            ..Self::ZERO
        }
    }

    pub fn like(n: i64) -> Self {
        Self {
            like: n,
            ..Self::ZERO
        }
    }

    pub fn comment(n: i64) -> Self {
        Self {
            comment: n,
            ..Self::ZERO
        }
    }

    pub fn view(n: i64) -> Self {
        Self {
            view: n,
            ..Self::ZERO
        }
    }

    /// Component-wise sum, saturating at the i64 bounds.
    pub fn merge(&self, other: &CounterDeltas) -> CounterDeltas {
        CounterDeltas {
            download: self.download.saturating_add(other.download),
            like: self.like.saturating_add(other.like),
            comment: self.comment.saturating_add(other.comment),
            view: self.view.saturating_add(other.view),
        }
    }

    pub fn is_zero(&self) -> bool {
        *self == Self::ZERO
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn merge_sums_componentwise() {
        let a = CounterDeltas::download(1);
        let b = CounterDeltas {
            download: 1,
            like: 1,
            ..CounterDeltas::ZERO
        };

        let merged = a.merge(&b);
        assert_eq!(merged.download, 2);
        assert_eq!(merged.like, 1);
        assert_eq!(merged.comment, 0);
        assert_eq!(merged.view, 0);
    }

    #[test]
    fn zero_is_identity() {
        let d = CounterDeltas::view(7);
        assert_eq!(d.merge(&CounterDeltas::ZERO), d);
        assert!(CounterDeltas::ZERO.is_zero());
        assert!(!d.is_zero());
    }

    fn small_delta() -> impl Strategy<Value = CounterDeltas> {
        let n = -1_000i64..1_000;
        (n.clone(), n.clone(), n.clone(), n).prop_map(|(download, like, comment, view)| {
            CounterDeltas {
                download,
                like,
                comment,
                view,
            }
        })
    }

    proptest! {
        /// Any application order produces the same accumulated counters.
        #[test]
        fn merge_is_order_independent(mut deltas in proptest::collection::vec(small_delta(), 0..16)) {
            let forward = deltas
                .iter()
                .fold(CounterDeltas::ZERO, |acc, d| acc.merge(d));
            deltas.reverse();
            let backward = deltas
                .iter()
                .fold(CounterDeltas::ZERO, |acc, d| acc.merge(d));

            prop_assert_eq!(forward, backward);
        }

        #[test]
        fn merge_agrees_with_plain_sum(deltas in proptest::collection::vec(small_delta(), 0..16)) {
            let merged = deltas
                .iter()
                .fold(CounterDeltas::ZERO, |acc, d| acc.merge(d));

            prop_assert_eq!(merged.download, deltas.iter().map(|d| d.download).sum::<i64>());
            prop_assert_eq!(merged.view, deltas.iter().map(|d| d.view).sum::<i64>());
        }
    }
}
