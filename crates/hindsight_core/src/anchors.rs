//! Anchor history of the trajectory.
//!
//! Anchors are (time, state, derivative) triples in strictly increasing time
//! order. Every past value the integrator needs is reconstructed from them by
//! cubic Hermite interpolation.

use crate::error::{DdeError, Result};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// A single point of the trajectory together with its derivative.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Anchor {
    pub t: f64,
    pub state: Vec<f64>,
    pub derivative: Vec<f64>,
}

impl Anchor {
    pub fn new(t: f64, state: Vec<f64>, derivative: Vec<f64>) -> Self {
        Self {
            t,
            state,
            derivative,
        }
    }

    pub fn dimension(&self) -> usize {
        self.state.len()
    }
}

/// How a pair of anchors relates to a query time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BracketKind {
    /// The query time coincides with an anchor; both sides are that anchor.
    Exact,
    /// `left.t < t < right.t`.
    Interpolation,
    /// `t` lies after the newest anchor; the pair is the two newest anchors.
    Extrapolation,
}

#[derive(Debug, Clone, Copy)]
pub struct Bracket<'a> {
    pub left: &'a Anchor,
    pub right: &'a Anchor,
    pub kind: BracketKind,
}

impl Bracket<'_> {
    pub fn is_extrapolation(&self) -> bool {
        self.kind == BracketKind::Extrapolation
    }
}

#[derive(Debug, Clone, Default)]
pub struct AnchorStore {
    anchors: VecDeque<Anchor>,
}

impl AnchorStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.anchors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.anchors.is_empty()
    }

    pub fn first(&self) -> Option<&Anchor> {
        self.anchors.front()
    }

    pub fn last(&self) -> Option<&Anchor> {
        self.anchors.back()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Anchor> {
        self.anchors.iter()
    }

    /// Dimension of the stored states, if any anchor exists.
    pub fn dimension(&self) -> Option<usize> {
        self.first().map(Anchor::dimension)
    }

    /// Appends an anchor after the newest one.
    pub fn append(&mut self, anchor: Anchor) -> Result<()> {
        if !anchor.t.is_finite() {
            return Err(DdeError::InvalidConfiguration(format!(
                "anchor time must be finite (got {}).",
                anchor.t
            )));
        }
        if anchor.state.len() != anchor.derivative.len() {
            return Err(DdeError::InvalidConfiguration(format!(
                "anchor state has {} components but derivative has {}.",
                anchor.state.len(),
                anchor.derivative.len()
            )));
        }
        if let Some(dim) = self.dimension() {
            if anchor.dimension() != dim {
                return Err(DdeError::InvalidConfiguration(format!(
                    "anchor dimension mismatch. Expected {}, got {}.",
                    dim,
                    anchor.dimension()
                )));
            }
        }
        if let Some(last) = self.last() {
            if anchor.t <= last.t {
                return Err(DdeError::InvalidConfiguration(format!(
                    "anchor times must be strictly increasing ({} follows {}).",
                    anchor.t, last.t
                )));
            }
        }
        self.anchors.push_back(anchor);
        Ok(())
    }

    /// Finds the anchor pair to reconstruct the trajectory at `t` from.
    pub fn bracket(&self, t: f64) -> Result<Bracket<'_>> {
        let len = self.anchors.len();
        if len < 2 {
            return Err(DdeError::InsufficientHistory(format!(
                "at least two anchors are required, {len} available."
            )));
        }
        let first = &self.anchors[0];
        if t < first.t || t.is_nan() {
            return Err(DdeError::InsufficientHistory(format!(
                "t={t} precedes the oldest anchor at t={}.",
                first.t
            )));
        }

        let idx = self.anchors.partition_point(|anchor| anchor.t < t);
        if idx == len {
            return Ok(Bracket {
                left: &self.anchors[len - 2],
                right: &self.anchors[len - 1],
                kind: BracketKind::Extrapolation,
            });
        }
        let right = &self.anchors[idx];
        if right.t == t {
            return Ok(Bracket {
                left: right,
                right,
                kind: BracketKind::Exact,
            });
        }
        // idx > 0 here, since t >= first.t and first.t != t.
        Ok(Bracket {
            left: &self.anchors[idx - 1],
            right,
            kind: BracketKind::Interpolation,
        })
    }

    /// Drops anchors that are no longer needed to reconstruct times at or
    /// after `horizon`. Returns the number of removed anchors.
    pub fn prune(&mut self, horizon: f64) -> usize {
        let at_or_before = self.anchors.partition_point(|anchor| anchor.t <= horizon);
        let removable = at_or_before
            .saturating_sub(1)
            .min(self.anchors.len().saturating_sub(2));
        self.anchors.drain(..removable);
        removable
    }

    pub fn pop_last(&mut self) -> Option<Anchor> {
        self.anchors.pop_back()
    }

    /// Removes every anchor strictly after `t`.
    pub fn truncate_after(&mut self, t: f64) {
        let keep = self.anchors.partition_point(|anchor| anchor.t <= t);
        self.anchors.truncate(keep);
    }

    pub fn clear(&mut self) {
        self.anchors.clear();
    }

    /// Mutable access for in-place rewriting of auxiliary components.
    /// Callers must not touch anchor times.
    pub(crate) fn anchors_mut(&mut self) -> impl Iterator<Item = &mut Anchor> {
        self.anchors.iter_mut()
    }
}

#[cfg(test)]
mod tests {
    use super::{Anchor, AnchorStore, BracketKind};
    use crate::error::DdeError;

    fn store_with_times(times: &[f64]) -> AnchorStore {
        let mut store = AnchorStore::new();
        for &t in times {
            store
                .append(Anchor::new(t, vec![t], vec![1.0]))
                .expect("append should succeed");
        }
        store
    }

    #[test]
    fn append_rejects_non_increasing_times() {
        let mut store = store_with_times(&[0.0, 1.0]);
        let err = store
            .append(Anchor::new(1.0, vec![0.0], vec![0.0]))
            .expect_err("duplicate time must fail");
        assert!(matches!(err, DdeError::InvalidConfiguration(_)));
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn append_rejects_dimension_mismatch() {
        let mut store = store_with_times(&[0.0]);
        let err = store
            .append(Anchor::new(1.0, vec![0.0, 1.0], vec![0.0, 1.0]))
            .expect_err("dimension mismatch must fail");
        assert!(matches!(err, DdeError::InvalidConfiguration(_)));
    }

    #[test]
    fn bracket_requires_two_anchors() {
        let store = store_with_times(&[0.0]);
        assert!(matches!(
            store.bracket(0.0),
            Err(DdeError::InsufficientHistory(_))
        ));
    }

    #[test]
    fn bracket_classifies_query_times() {
        let store = store_with_times(&[0.0, 1.0, 2.0, 4.0]);

        let inner = store.bracket(2.5).unwrap();
        assert_eq!(inner.kind, BracketKind::Interpolation);
        assert_eq!((inner.left.t, inner.right.t), (2.0, 4.0));

        let exact = store.bracket(1.0).unwrap();
        assert_eq!(exact.kind, BracketKind::Exact);
        assert_eq!((exact.left.t, exact.right.t), (1.0, 1.0));

        let oldest = store.bracket(0.0).unwrap();
        assert_eq!(oldest.kind, BracketKind::Exact);

        let beyond = store.bracket(5.0).unwrap();
        assert!(beyond.is_extrapolation());
        assert_eq!((beyond.left.t, beyond.right.t), (2.0, 4.0));

        assert!(matches!(
            store.bracket(-0.5),
            Err(DdeError::InsufficientHistory(_))
        ));
    }

    #[test]
    fn prune_keeps_an_anchor_at_or_before_the_horizon() {
        let mut store = store_with_times(&[0.0, 1.0, 2.0, 3.0, 4.0]);
        let removed = store.prune(2.5);
        assert_eq!(removed, 2);
        assert_eq!(store.first().unwrap().t, 2.0);
        assert!(store.bracket(2.5).is_ok());

        let removed = store.prune(3.0);
        assert_eq!(removed, 1);
        assert_eq!(store.first().unwrap().t, 3.0);
    }

    #[test]
    fn prune_never_drops_below_two_anchors() {
        let mut store = store_with_times(&[0.0, 1.0, 2.0]);
        store.prune(100.0);
        assert_eq!(store.len(), 2);
        assert_eq!(store.first().unwrap().t, 1.0);
    }

    #[test]
    fn truncate_after_discards_newer_anchors() {
        let mut store = store_with_times(&[0.0, 1.0, 2.0, 3.0]);
        store.truncate_after(1.5);
        assert_eq!(store.len(), 2);
        assert_eq!(store.last().unwrap().t, 1.0);
    }
}
