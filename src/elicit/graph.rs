//! Preference graph: options, holdout/training pair pools, and aggregated edges.

use std::collections::{BTreeMap, BTreeSet, HashSet};

use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::prompts::PromptTemplate;

/// Positional index of an option in the input list.
pub type OptionId = usize;

/// Default share of all pairs reserved for held-out evaluation.
pub const DEFAULT_HOLDOUT_FRACTION: f64 = 0.05;

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum GraphError {
    #[error("need at least 2 options, got {0}")]
    TooFewOptions(usize),
    #[error("option id {id} out of range (n={n})")]
    UnknownOption { id: OptionId, n: usize },
    #[error("a pair needs two distinct options, got ({0}, {0})")]
    SelfPair(OptionId),
    #[error("holdout fraction must be in [0, 1): {0}")]
    InvalidHoldoutFraction(f64),
    #[error("ring lattice degree must be even and < n (degree={degree}, n={n})")]
    InvalidDegree { degree: usize, n: usize },
    #[error("probability must be in [0, 1]: {0}")]
    InvalidProbability(f64),
}

/// One member of the option set. Immutable once the graph is built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreferenceOption {
    pub id: OptionId,
    pub text: String,
}

/// Unordered pair of option ids, stored smaller id first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CanonicalPair {
    lo: OptionId,
    hi: OptionId,
}

impl CanonicalPair {
    pub fn new(a: OptionId, b: OptionId) -> Result<Self, GraphError> {
        match a.cmp(&b) {
            std::cmp::Ordering::Less => Ok(Self { lo: a, hi: b }),
            std::cmp::Ordering::Greater => Ok(Self { lo: b, hi: a }),
            std::cmp::Ordering::Equal => Err(GraphError::SelfPair(a)),
        }
    }

    pub fn lo(&self) -> OptionId {
        self.lo
    }

    pub fn hi(&self) -> OptionId {
        self.hi
    }

    /// Both presentation orders: lower id first, then swapped.
    pub fn orientations(&self) -> [OrientedPair; 2] {
        [
            OrientedPair {
                first: self.lo,
                second: self.hi,
            },
            OrientedPair {
                first: self.hi,
                second: self.lo,
            },
        ]
    }
}

/// A pair as presented to the judge: `first` is shown as option A.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OrientedPair {
    pub first: OptionId,
    pub second: OptionId,
}

impl OrientedPair {
    pub fn canonical(&self) -> Result<CanonicalPair, GraphError> {
        CanonicalPair::new(self.first, self.second)
    }
}

/// Aggregated comparison outcome for one canonical pair.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Edge {
    pub option_a: OptionId,
    pub option_b: OptionId,
    /// Empirical share of valid responses preferring `option_a` (the lower id).
    pub probability_a: f64,
}

impl Edge {
    pub fn new(pair: CanonicalPair, probability_a: f64) -> Result<Self, GraphError> {
        if !(0.0..=1.0).contains(&probability_a) {
            return Err(GraphError::InvalidProbability(probability_a));
        }
        Ok(Self {
            option_a: pair.lo,
            option_b: pair.hi,
            probability_a,
        })
    }

    pub fn pair(&self) -> CanonicalPair {
        CanonicalPair {
            lo: self.option_a.min(self.option_b),
            hi: self.option_a.max(self.option_b),
        }
    }
}

/// Rendered prompts for a list of oriented pairs; `pairs[i]` produced `prompts[i]`.
#[derive(Debug, Clone, Default)]
pub struct PromptBatch {
    pub prompts: Vec<String>,
    pub pairs: Vec<OrientedPair>,
}

/// Options plus everything observed about them so far.
#[derive(Debug, Clone)]
pub struct PreferenceGraph {
    options: Vec<PreferenceOption>,
    holdout: BTreeSet<CanonicalPair>,
    training_pool: BTreeSet<CanonicalPair>,
    edges: BTreeMap<CanonicalPair, Edge>,
}

impl PreferenceGraph {
    /// Build the option set and partition all pairs into holdout and training pools.
    ///
    /// The holdout share is `ceil(holdout_fraction * n(n-1)/2)` pairs, drawn by
    /// shuffling with `rng`; the partition never changes afterwards.
    pub fn new<R: Rng + ?Sized>(
        options: Vec<String>,
        holdout_fraction: f64,
        rng: &mut R,
    ) -> Result<Self, GraphError> {
        let n = options.len();
        if n < 2 {
            return Err(GraphError::TooFewOptions(n));
        }
        if !(0.0..1.0).contains(&holdout_fraction) {
            return Err(GraphError::InvalidHoldoutFraction(holdout_fraction));
        }

        let options: Vec<PreferenceOption> = options
            .into_iter()
            .enumerate()
            .map(|(id, text)| PreferenceOption { id, text })
            .collect();

        let mut all_pairs: Vec<CanonicalPair> = (0..n)
            .flat_map(|i| ((i + 1)..n).map(move |j| CanonicalPair { lo: i, hi: j }))
            .collect();
        all_pairs.shuffle(rng);

        let n_holdout = holdout_size(all_pairs.len(), holdout_fraction);
        let training_pool = all_pairs.split_off(n_holdout).into_iter().collect();
        let holdout = all_pairs.into_iter().collect();

        Ok(Self {
            options,
            holdout,
            training_pool,
            edges: BTreeMap::new(),
        })
    }

    pub fn len(&self) -> usize {
        self.options.len()
    }

    pub fn is_empty(&self) -> bool {
        self.options.is_empty()
    }

    pub fn options(&self) -> &[PreferenceOption] {
        &self.options
    }

    pub fn option(&self, id: OptionId) -> Result<&PreferenceOption, GraphError> {
        self.options.get(id).ok_or(GraphError::UnknownOption {
            id,
            n: self.options.len(),
        })
    }

    pub fn holdout(&self) -> &BTreeSet<CanonicalPair> {
        &self.holdout
    }

    pub fn training_pool(&self) -> &BTreeSet<CanonicalPair> {
        &self.training_pool
    }

    pub fn edges(&self) -> &BTreeMap<CanonicalPair, Edge> {
        &self.edges
    }

    pub fn edge(&self, pair: &CanonicalPair) -> Option<&Edge> {
        self.edges.get(pair)
    }

    /// Number of edges touching each option.
    pub fn degrees(&self) -> Vec<usize> {
        node_degrees(self.options.len(), self.edges.keys())
    }

    /// Ring lattice: for `k = 1..=degree/2` connect every `i` to `(i + k) mod n`.
    ///
    /// Yields `n * degree / 2` distinct pairs in which every option has degree
    /// exactly `degree`. The lattice is fixed by `n` and `degree`; it does not
    /// consult the holdout partition.
    pub fn sample_regular_graph(&self, degree: usize) -> Result<Vec<CanonicalPair>, GraphError> {
        let n = self.options.len();
        if degree % 2 != 0 || degree >= n {
            return Err(GraphError::InvalidDegree { degree, n });
        }

        let mut seen = HashSet::new();
        let mut pairs = Vec::with_capacity(n * degree / 2);
        for k in 1..=degree / 2 {
            for i in 0..n {
                let pair = CanonicalPair::new(i, (i + k) % n)?;
                if seen.insert(pair) {
                    pairs.push(pair);
                }
            }
        }
        Ok(pairs)
    }

    /// Every pair `(i, j)` with `i < j`, in id order.
    pub fn complete_graph(&self) -> Vec<CanonicalPair> {
        let n = self.options.len();
        (0..n)
            .flat_map(|i| ((i + 1)..n).map(move |j| CanonicalPair { lo: i, hi: j }))
            .collect()
    }

    /// Uniform sample without replacement from the training pool.
    pub fn sample_random_edges<R: Rng + ?Sized>(
        &self,
        count: usize,
        rng: &mut R,
    ) -> Vec<CanonicalPair> {
        let candidates: Vec<CanonicalPair> = self.training_pool.iter().copied().collect();
        if count >= candidates.len() {
            return candidates;
        }
        candidates.choose_multiple(rng, count).copied().collect()
    }

    /// Render one prompt per oriented pair, substituting option texts and
    /// the entity name when given.
    pub fn generate_prompts(
        &self,
        pairs: &[OrientedPair],
        template: &PromptTemplate,
        entity: Option<&str>,
    ) -> Result<PromptBatch, GraphError> {
        let mut batch = PromptBatch {
            prompts: Vec::with_capacity(pairs.len()),
            pairs: Vec::with_capacity(pairs.len()),
        };
        for pair in pairs {
            let a = self.option(pair.first)?;
            let b = self.option(pair.second)?;
            batch.prompts.push(template.render(&a.text, &b.text, entity));
            batch.pairs.push(*pair);
        }
        Ok(batch)
    }

    /// Insert or overwrite edges at their canonical keys.
    pub fn add_edges(&mut self, edges: impl IntoIterator<Item = Edge>) -> Result<(), GraphError> {
        let n = self.options.len();
        for edge in edges {
            let pair = CanonicalPair::new(edge.option_a, edge.option_b)?;
            if pair.hi >= n {
                return Err(GraphError::UnknownOption { id: pair.hi, n });
            }
            let edge = Edge::new(pair, edge.probability_a)?;
            self.edges.insert(pair, edge);
        }
        Ok(())
    }
}

/// `ceil(fraction * total)`, tolerant of float error in the product.
fn holdout_size(total: usize, fraction: f64) -> usize {
    let raw = fraction * total as f64;
    ((raw - 1e-9).ceil().max(0.0) as usize).min(total)
}

pub(crate) fn node_degrees<'a>(
    n: usize,
    pairs: impl IntoIterator<Item = &'a CanonicalPair>,
) -> Vec<usize> {
    let mut degree = vec![0usize; n];
    for pair in pairs {
        if pair.hi < n {
            degree[pair.lo] += 1;
            degree[pair.hi] += 1;
        }
    }
    degree
}
