//! Bounded top-K queue used while scoring candidates; gives f32 keys a total order for BinaryHeap.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use crate::vector::VectorId;

/// A scored candidate. `key` is metric-adjusted so smaller is better.
#[derive(Debug, Clone, Copy)]
pub struct Candidate {
    pub key: f32,
    pub id: VectorId,
}

impl Candidate {
    pub fn new(id: VectorId, key: f32) -> Self {
        Self { key, id }
    }
}

impl PartialEq for Candidate {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Candidate {}

impl PartialOrd for Candidate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

// Worse candidates compare greater: larger key, then larger id on ties.
impl Ord for Candidate {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key
            .partial_cmp(&other.key)
            .unwrap_or(Ordering::Equal)
            .then_with(|| self.id.cmp(&other.id))
    }
}

/// Keeps the best `limit` candidates seen so far; the worst sits on top.
#[derive(Debug)]
pub struct TopK {
    heap: BinaryHeap<Candidate>,
    limit: usize,
}

impl TopK {
    pub fn new(limit: usize) -> Self {
        Self {
            heap: BinaryHeap::with_capacity(limit.saturating_add(1).min(4096)),
            limit,
        }
    }

    /// Offer a candidate, evicting the current worst once over the limit.
    pub fn push(&mut self, candidate: Candidate) {
        if self.limit == 0 {
            return;
        }
        if self.heap.len() == self.limit {
            match self.heap.peek() {
                Some(worst) if candidate >= *worst => return,
                _ => {}
            }
        }
        self.heap.push(candidate);
        if self.heap.len() > self.limit {
            self.heap.pop();
        }
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// Merge another queue into this one.
    pub fn extend(&mut self, other: TopK) {
        for candidate in other.heap {
            self.push(candidate);
        }
    }

    /// Drain into a Vec ordered best-first.
    pub fn into_sorted_vec(self) -> Vec<Candidate> {
        self.heap.into_sorted_vec()
    }
}
