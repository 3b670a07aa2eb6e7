//! Two-component PCA over utility-mean vectors.

use std::cmp::Ordering;

use nalgebra::{DMatrix, SymmetricEigen};
use serde::Serialize;

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum ProjectionError {
    #[error("need at least 2 vectors to project, got {0}")]
    TooFewRows(usize),
    #[error("vector {row} has length {len}, expected {expected}")]
    Ragged { row: usize, len: usize, expected: usize },
    #[error("vectors are empty")]
    ZeroWidth,
    #[error("anchor row {anchor} out of range ({rows} rows)")]
    AnchorOutOfRange { anchor: usize, rows: usize },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Projection {
    /// `(PC1, PC2)` per input row.
    pub coords: Vec<[f64; 2]>,
    pub explained_variance_ratio: [f64; 2],
}

/// Project `rows` onto their first two principal components.
///
/// Axis signs are fixed so the largest-magnitude coordinate on each axis is
/// positive; with an `anchor`, instead flipped so that row lands at PC1 <= 0
/// and PC2 >= 0.
pub fn project(rows: &[Vec<f64>], anchor: Option<usize>) -> Result<Projection, ProjectionError> {
    let m = rows.len();
    if m < 2 {
        return Err(ProjectionError::TooFewRows(m));
    }
    let d = rows[0].len();
    if d == 0 {
        return Err(ProjectionError::ZeroWidth);
    }
    if let Some((row, r)) = rows.iter().enumerate().find(|(_, r)| r.len() != d) {
        return Err(ProjectionError::Ragged {
            row,
            len: r.len(),
            expected: d,
        });
    }
    if let Some(anchor) = anchor.filter(|&a| a >= m) {
        return Err(ProjectionError::AnchorOutOfRange { anchor, rows: m });
    }

    let means: Vec<f64> = (0..d)
        .map(|j| rows.iter().map(|r| r[j]).sum::<f64>() / m as f64)
        .collect();
    let centered = DMatrix::from_fn(m, d, |i, j| rows[i][j] - means[j]);

    // Eigen-decompose the m x m Gram matrix; rows are usually far fewer
    // than options. Its nonzero spectrum equals the covariance's.
    let gram = &centered * centered.transpose();
    let eig = SymmetricEigen::new(gram);

    let mut order: Vec<usize> = (0..m).collect();
    order.sort_by(|&a, &b| {
        eig.eigenvalues[b]
            .partial_cmp(&eig.eigenvalues[a])
            .unwrap_or(Ordering::Equal)
    });
    let total: f64 = eig.eigenvalues.iter().map(|v| v.max(0.0)).sum();

    let mut axes = [vec![0.0; m], vec![0.0; m]];
    let mut ratio = [0.0; 2];
    for (axis, &k) in order.iter().take(2).enumerate() {
        let lambda = eig.eigenvalues[k].max(0.0);
        let scale = lambda.sqrt();
        for (i, slot) in axes[axis].iter_mut().enumerate() {
            *slot = eig.eigenvectors[(i, k)] * scale;
        }
        ratio[axis] = if total > 0.0 { lambda / total } else { 0.0 };
    }

    match anchor {
        Some(a) => {
            if axes[0][a] > 0.0 {
                flip(&mut axes[0]);
            }
            if axes[1][a] < 0.0 {
                flip(&mut axes[1]);
            }
        }
        None => {
            for axis in axes.iter_mut() {
                let dominant = axis
                    .iter()
                    .copied()
                    .max_by(|x, y| x.abs().partial_cmp(&y.abs()).unwrap_or(Ordering::Equal))
                    .unwrap_or(0.0);
                if dominant < 0.0 {
                    flip(axis);
                }
            }
        }
    }

    Ok(Projection {
        coords: (0..m).map(|i| [axes[0][i], axes[1][i]]).collect(),
        explained_variance_ratio: ratio,
    })
}

fn flip(axis: &mut [f64]) {
    for v in axis.iter_mut() {
        *v = -*v;
    }
}

/// One labelled point in a saved projection.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProjectedPoint {
    pub name: String,
    pub kind: PointKind,
    pub pc1: f64,
    pub pc2: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PointKind {
    Entity,
    Ai,
}

/// Serializable projection of entities and AI models in one shared space.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProjectionReport {
    pub points: Vec<ProjectedPoint>,
    /// Percent of variance on PC1 and PC2.
    pub explained_variance_pct: [f64; 2],
    pub highlight: Option<String>,
}

impl ProjectionReport {
    /// Project entities and AI models together, anchoring on `anchor_entity`
    /// when it is among the entities.
    pub fn build(
        entities: Vec<(String, Vec<f64>)>,
        ais: Vec<(String, Vec<f64>)>,
        anchor_entity: Option<&str>,
        highlight: Option<String>,
    ) -> Result<Self, ProjectionError> {
        let anchor = anchor_entity.and_then(|name| entities.iter().position(|(n, _)| n == name));
        let labelled: Vec<(String, PointKind, Vec<f64>)> = entities
            .into_iter()
            .map(|(n, v)| (n, PointKind::Entity, v))
            .chain(ais.into_iter().map(|(n, v)| (n, PointKind::Ai, v)))
            .collect();
        let rows: Vec<Vec<f64>> = labelled.iter().map(|(_, _, v)| v.clone()).collect();
        let projection = project(&rows, anchor)?;

        let points = labelled
            .into_iter()
            .zip(projection.coords)
            .map(|((name, kind, _), [pc1, pc2])| ProjectedPoint { name, kind, pc1, pc2 })
            .collect();
        let [r1, r2] = projection.explained_variance_ratio;
        Ok(Self {
            points,
            explained_variance_pct: [r1 * 100.0, r2 * 100.0],
            highlight,
        })
    }
}
