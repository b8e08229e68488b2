//! Brute-force flat index: O(n) k-NN search

use std::collections::{BTreeMap, HashSet};

use crate::distance::Metric;
use crate::error::Result;
use crate::index::{Index, ScoredId};
use crate::ivf::candidate_queue::{Candidate, TopK};
use crate::vector::{Vector, VectorId};

/// A flat (brute-force) index that scores every stored vector.
///
/// Also serves as the pending pool of an IVF index before its first build.
#[derive(Debug, Clone)]
pub struct FlatIndex {
    vectors: BTreeMap<VectorId, Vector>,
    metric: Metric,
    dimension: Option<usize>,
}

impl FlatIndex {
    /// Create a new empty flat index with the given metric.
    pub fn new(metric: Metric) -> Self {
        Self {
            vectors: BTreeMap::new(),
            metric,
            dimension: None,
        }
    }

    /// Iterate over all (id, vector) pairs in ascending id order.
    pub fn iter(&self) -> impl Iterator<Item = (&VectorId, &Vector)> {
        self.vectors.iter()
    }

    /// Ids held by this index, ascending.
    pub fn ids(&self) -> impl Iterator<Item = VectorId> + '_ {
        self.vectors.keys().copied()
    }

    /// Exhaustive search skipping any id in `excluded`.
    pub fn search_excluding(
        &self,
        query: &Vector,
        k: usize,
        excluded: &HashSet<VectorId>,
    ) -> Result<Vec<ScoredId>> {
        if let Some(dim) = self.dimension {
            query.check_dimension(dim)?;
        }
        let mut top = TopK::new(k);
        for (&id, vector) in &self.vectors {
            if excluded.contains(&id) {
                continue;
            }
            let score = self.metric.score(query.as_slice(), vector.as_slice());
            top.push(Candidate::new(id, self.metric.rank_key(score)));
        }
        Ok(self.finish(top))
    }

    fn finish(&self, top: TopK) -> Vec<ScoredId> {
        top.into_sorted_vec()
            .into_iter()
            .map(|c| ScoredId {
                id: c.id,
                score: self.metric.rank_key(c.key),
            })
            .collect()
    }
}

impl Index for FlatIndex {
    fn add(&mut self, id: VectorId, vector: Vector) -> Result<()> {
        match self.dimension {
            Some(dim) => vector.check_dimension(dim)?,
            None => self.dimension = Some(vector.dimension()),
        }
        self.vectors.insert(id, vector);
        Ok(())
    }

    fn get_vector(&self, id: VectorId) -> Option<&Vector> {
        self.vectors.get(&id)
    }

    fn search(&self, query: &Vector, k: usize) -> Result<Vec<ScoredId>> {
        self.search_excluding(query, k, &HashSet::new())
    }

    fn metric(&self) -> Metric {
        self.metric
    }

    fn len(&self) -> usize {
        self.vectors.len()
    }
}
