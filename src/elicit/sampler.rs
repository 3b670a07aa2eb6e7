//! Active pair selection.
//!
//! Targets pairs whose fitted means are close (the model is least sure which
//! wins) and whose endpoints have few observations so far.

use std::cmp::Ordering;
use std::collections::BTreeSet;

use rand::seq::SliceRandom;
use rand::Rng;

use crate::thurstonian::Utility;

use super::graph::{node_degrees, CanonicalPair};

/// Pick up to `num_pairs` new candidates to query.
///
/// Candidates already present in `existing` are skipped. The rest are kept
/// when their absolute mean difference is at or below the `percentile_p`-th
/// percentile AND their endpoint degree sum is at or below the
/// `percentile_q`-th percentile. If that leaves fewer than `num_pairs`, the
/// sample is drawn uniformly from all remaining candidates instead.
pub fn select_new_pairs<R: Rng + ?Sized>(
    utilities: &[Utility],
    existing: &BTreeSet<CanonicalPair>,
    candidates: &BTreeSet<CanonicalPair>,
    num_pairs: usize,
    percentile_p: f64,
    percentile_q: f64,
    rng: &mut R,
) -> Vec<CanonicalPair> {
    let remaining: Vec<CanonicalPair> = candidates
        .iter()
        .filter(|p| !existing.contains(p))
        .copied()
        .collect();
    if remaining.is_empty() || num_pairs == 0 {
        return Vec::new();
    }

    let n = existing
        .iter()
        .chain(remaining.iter())
        .map(|p| p.hi() + 1)
        .max()
        .unwrap_or(0)
        .max(utilities.len());
    let degree = node_degrees(n, existing.iter());
    let mean = |id: usize| utilities.get(id).map(|u| u.mean).unwrap_or(0.0);

    let diffs: Vec<f64> = remaining
        .iter()
        .map(|p| (mean(p.lo()) - mean(p.hi())).abs())
        .collect();
    let degree_sums: Vec<f64> = remaining
        .iter()
        .map(|p| (degree[p.lo()] + degree[p.hi()]) as f64)
        .collect();

    let diff_cut = percentile(&diffs, percentile_p);
    let degree_cut = percentile(&degree_sums, percentile_q);

    let filtered: Vec<CanonicalPair> = remaining
        .iter()
        .zip(diffs.iter().zip(degree_sums.iter()))
        .filter(|(_, (d, g))| **d <= diff_cut && **g <= degree_cut)
        .map(|(p, _)| *p)
        .collect();

    let pool = if filtered.len() >= num_pairs {
        &filtered
    } else {
        &remaining
    };
    pool.choose_multiple(rng, num_pairs.min(pool.len()))
        .copied()
        .collect()
}

/// Percentile with linear interpolation between closest ranks.
///
/// `q` is on the 0..=100 scale and clamped into it.
pub fn percentile(values: &[f64], q: f64) -> f64 {
    if values.is_empty() {
        return f64::NAN;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(Ordering::Equal));

    let rank = (q.clamp(0.0, 100.0) / 100.0) * (sorted.len() - 1) as f64;
    let lo = rank.floor() as usize;
    let hi = rank.ceil() as usize;
    let frac = rank - lo as f64;
    sorted[lo] + (sorted[hi] - sorted[lo]) * frac
}
