//! Pairwise similarity and distance measures between embeddings and centroids.
//!
//! Every measure takes two 2D tensors `A [n, d]` and `B [m, d]` and returns an
//! `[n, m]` matrix whose row order follows `A`. Passing a single-row `B` (for
//! example the origin) yields an `[n, 1]` column.
//!
//! # Measures
//!
//! | Family | Kind | Formula | Scaled |
//! |--------|------|---------|--------|
//! | similarity | `dotproduct` | `A·Bᵀ` | `/ √d` |
//! | similarity | `cosine` | `norm(A)·norm(B)ᵀ` | never |
//! | similarity | `normweight` | `A·norm(B)ᵀ` | `/ √d` |
//! | distance | `l1` | `Σ|a - b|` | `/ d` |
//! | distance | `l2` | `Σ(a - b)²` | `/ d` |
//! | distance | `cosine` | `1 - cos(a, b)` | never |
//!
//! Cosine measures are bounded already, so the scaling policy leaves them
//! alone.

use std::fmt;
use std::str::FromStr;

use candle_core::{Tensor, D};
use serde::{Deserialize, Serialize};

use crate::error::OpenSetError;

/// Guard added to row norms before division.
const NORM_EPS: f64 = 1e-12;

// =============================================================================
// METRIC KINDS
// =============================================================================

/// Similarity measure between embeddings and centroids.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum SimilarityKind {
    /// Raw inner product.
    #[default]
    DotProduct,
    /// Inner product of row-normalized operands.
    Cosine,
    /// Inner product of raw embeddings against row-normalized centroids.
    NormWeight,
}

impl SimilarityKind {
    /// All supported similarity kinds.
    pub const ALL: [SimilarityKind; 3] = [Self::DotProduct, Self::Cosine, Self::NormWeight];

    /// Canonical configuration name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::DotProduct => "dotproduct",
            Self::Cosine => "cosine",
            Self::NormWeight => "normweight",
        }
    }
}

impl FromStr for SimilarityKind {
    type Err = OpenSetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "dotproduct" => Ok(Self::DotProduct),
            "cosine" => Ok(Self::Cosine),
            "normweight" => Ok(Self::NormWeight),
            _ => Err(OpenSetError::UnsupportedMetric {
                family: "similarity",
                name: s.to_string(),
            }),
        }
    }
}

impl TryFrom<String> for SimilarityKind {
    type Error = OpenSetError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<SimilarityKind> for String {
    fn from(kind: SimilarityKind) -> Self {
        kind.as_str().to_string()
    }
}

impl fmt::Display for SimilarityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Distance measure between embeddings and centroids.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum DistanceKind {
    /// Manhattan distance.
    L1,
    /// Squared Euclidean distance.
    #[default]
    L2,
    /// One minus cosine similarity.
    Cosine,
}

impl DistanceKind {
    /// All supported distance kinds.
    pub const ALL: [DistanceKind; 3] = [Self::L1, Self::L2, Self::Cosine];

    /// Canonical configuration name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::L1 => "l1",
            Self::L2 => "l2",
            Self::Cosine => "cosine",
        }
    }
}

impl FromStr for DistanceKind {
    type Err = OpenSetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "l1" => Ok(Self::L1),
            "l2" => Ok(Self::L2),
            "cosine" => Ok(Self::Cosine),
            _ => Err(OpenSetError::UnsupportedMetric {
                family: "distance",
                name: s.to_string(),
            }),
        }
    }
}

impl TryFrom<String> for DistanceKind {
    type Error = OpenSetError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<DistanceKind> for String {
    fn from(kind: DistanceKind) -> Self {
        kind.as_str().to_string()
    }
}

impl fmt::Display for DistanceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// ROW OPERATIONS
// =============================================================================

/// L2-normalize each row of a 2D tensor.
///
/// Zero rows stay zero.
pub fn l2_normalize(tensor: &Tensor) -> candle_core::Result<Tensor> {
    let norm = row_norms(tensor)?;
    tensor.broadcast_div(&(norm + NORM_EPS)?)
}

/// Euclidean norm of each row, keeping the reduced dimension: `[n, d] -> [n, 1]`.
pub fn row_norms(tensor: &Tensor) -> candle_core::Result<Tensor> {
    tensor.sqr()?.sum_keepdim(D::Minus1)?.sqrt()
}

/// Log-sum-exp over the class dimension: `[n, c] -> [n]`.
///
/// Shifted by the row maximum so large scores do not overflow.
pub fn energy(scores: &Tensor) -> candle_core::Result<Tensor> {
    let max = scores.max_keepdim(1)?;
    let shifted = scores.broadcast_sub(&max)?;
    let lse = shifted.exp()?.sum_keepdim(1)?.log()?;
    (lse + max)?.squeeze(1)
}

/// p-norm of each row: `[n, c] -> [n]`.
pub fn pnorm(scores: &Tensor, p: f64) -> candle_core::Result<Tensor> {
    if p == 2.0 {
        scores.sqr()?.sum(1)?.sqrt()
    } else if p == 1.0 {
        scores.abs()?.sum(1)
    } else {
        scores.abs()?.powf(p)?.sum(1)?.powf(1.0 / p)
    }
}

// =============================================================================
// METRIC ENGINE
// =============================================================================

/// Computes pairwise measures under a fixed scaling policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetricEngine {
    scaled: bool,
}

impl MetricEngine {
    /// Create an engine; `scaled` divides dot products by `√d` and
    /// l1/l2 distances by `d`.
    pub fn new(scaled: bool) -> Self {
        Self { scaled }
    }

    /// Whether the scaling policy is active.
    #[inline]
    pub fn scaled(&self) -> bool {
        self.scaled
    }

    /// Inner product `A·Bᵀ`, divided by `√d` when scaled.
    pub fn dot_product(&self, a: &Tensor, b: &Tensor) -> candle_core::Result<Tensor> {
        let dot = a.matmul(&b.t()?)?;
        if self.scaled {
            let d = a.dim(1)?;
            dot.affine(1.0 / (d as f64).sqrt(), 0.0)
        } else {
            Ok(dot)
        }
    }

    /// Similarity matrix `[n, m]` for the requested kind.
    pub fn similarity(
        &self,
        kind: SimilarityKind,
        a: &Tensor,
        b: &Tensor,
    ) -> candle_core::Result<Tensor> {
        match kind {
            SimilarityKind::DotProduct => self.dot_product(a, b),
            SimilarityKind::Cosine => cosine_matrix(a, b),
            SimilarityKind::NormWeight => self.dot_product(a, &l2_normalize(b)?),
        }
    }

    /// Distance matrix `[n, m]` for the requested kind.
    pub fn distance(
        &self,
        kind: DistanceKind,
        a: &Tensor,
        b: &Tensor,
    ) -> candle_core::Result<Tensor> {
        match kind {
            DistanceKind::L1 => {
                let diff = a.unsqueeze(1)?.broadcast_sub(&b.unsqueeze(0)?)?;
                let dist = diff.abs()?.sum(2)?;
                self.per_dimension(dist, a.dim(1)?)
            }
            DistanceKind::L2 => {
                // ||a||² - 2a·b + ||b||², clamped against cancellation below zero
                let a_sq = a.sqr()?.sum_keepdim(1)?;
                let b_sq = b.sqr()?.sum_keepdim(1)?.t()?;
                let cross = a.matmul(&b.t()?)?.affine(2.0, 0.0)?;
                let dist = a_sq.broadcast_sub(&cross)?.broadcast_add(&b_sq)?.relu()?;
                self.per_dimension(dist, a.dim(1)?)
            }
            DistanceKind::Cosine => cosine_matrix(a, b)?.affine(-1.0, 1.0),
        }
    }

    fn per_dimension(&self, dist: Tensor, d: usize) -> candle_core::Result<Tensor> {
        if self.scaled {
            dist.affine(1.0 / d as f64, 0.0)
        } else {
            Ok(dist)
        }
    }
}

fn cosine_matrix(a: &Tensor, b: &Tensor) -> candle_core::Result<Tensor> {
    l2_normalize(a)?.matmul(&l2_normalize(b)?.t()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn matrix(rows: usize, cols: usize, phase: f32) -> Tensor {
        let data: Vec<f32> = (0..rows * cols)
            .map(|i| (i as f32 * 0.37 + phase).sin() * 2.0)
            .collect();
        Tensor::from_slice(&data, (rows, cols), &Device::Cpu).unwrap()
    }

    fn to_rows(t: &Tensor) -> Vec<Vec<f32>> {
        t.to_vec2::<f32>().unwrap()
    }

    #[test]
    fn test_parse_supported_names() {
        assert_eq!("dotproduct".parse::<SimilarityKind>().unwrap(), SimilarityKind::DotProduct);
        assert_eq!("Cosine".parse::<SimilarityKind>().unwrap(), SimilarityKind::Cosine);
        assert_eq!("normweight".parse::<SimilarityKind>().unwrap(), SimilarityKind::NormWeight);
        assert_eq!("l1".parse::<DistanceKind>().unwrap(), DistanceKind::L1);
        assert_eq!(" L2 ".parse::<DistanceKind>().unwrap(), DistanceKind::L2);
        assert_eq!("cosine".parse::<DistanceKind>().unwrap(), DistanceKind::Cosine);
    }

    #[test]
    fn test_parse_unsupported_names() {
        let err = "euclidean".parse::<DistanceKind>().unwrap_err();
        assert!(matches!(
            err,
            OpenSetError::UnsupportedMetric { family: "distance", .. }
        ));
        assert!(err.is_configuration());

        let err = "l2".parse::<SimilarityKind>().unwrap_err();
        assert!(matches!(
            err,
            OpenSetError::UnsupportedMetric { family: "similarity", .. }
        ));
    }

    #[test]
    fn test_names_round_trip_through_display() {
        for kind in SimilarityKind::ALL {
            assert_eq!(kind.to_string().parse::<SimilarityKind>().unwrap(), kind);
        }
        for kind in DistanceKind::ALL {
            assert_eq!(kind.to_string().parse::<DistanceKind>().unwrap(), kind);
        }
    }

    #[test]
    fn test_scaled_dot_product_is_unscaled_over_sqrt_d() {
        let a = matrix(5, 16, 0.0);
        let b = matrix(3, 16, 1.3);
        let scaled = MetricEngine::new(true).dot_product(&a, &b).unwrap();
        let raw = MetricEngine::new(false).dot_product(&a, &b).unwrap();
        let factor = (16.0f32).sqrt();

        for (s_row, r_row) in to_rows(&scaled).iter().zip(to_rows(&raw).iter()) {
            for (s, r) in s_row.iter().zip(r_row.iter()) {
                assert!((s - r / factor).abs() < 1e-4, "{} vs {}", s, r / factor);
            }
        }
    }

    #[test]
    fn test_cosine_similarity_bounded() {
        let a = matrix(6, 8, 0.2);
        let b = matrix(4, 8, 2.1);
        for scaled in [true, false] {
            let sim = MetricEngine::new(scaled)
                .similarity(SimilarityKind::Cosine, &a, &b)
                .unwrap();
            for row in to_rows(&sim) {
                for v in row {
                    assert!((-1.0 - 1e-5..=1.0 + 1e-5).contains(&v), "cosine {} out of range", v);
                }
            }
        }
    }

    #[test]
    fn test_normweight_preserves_embedding_norm_along_centroid() {
        let x = Tensor::from_slice(&[3.0f32, 4.0, 0.0, 12.0], (1, 4), &Device::Cpu).unwrap();
        // Single centroid pointing exactly along x.
        let centroid = l2_normalize(&x).unwrap();
        let sim = MetricEngine::new(false)
            .similarity(SimilarityKind::NormWeight, &x, &centroid)
            .unwrap();
        let value = to_rows(&sim)[0][0];
        assert!((value - 13.0).abs() < 1e-4, "expected ||x|| = 13, got {}", value);
    }

    #[test]
    fn test_normweight_ignores_centroid_magnitude() {
        let a = matrix(3, 5, 0.4);
        let b = matrix(2, 5, 0.9);
        let b_big = b.affine(7.5, 0.0).unwrap();
        let engine = MetricEngine::new(true);
        let s1 = to_rows(&engine.similarity(SimilarityKind::NormWeight, &a, &b).unwrap());
        let s2 = to_rows(&engine.similarity(SimilarityKind::NormWeight, &a, &b_big).unwrap());
        for (r1, r2) in s1.iter().zip(s2.iter()) {
            for (v1, v2) in r1.iter().zip(r2.iter()) {
                assert!((v1 - v2).abs() < 1e-4);
            }
        }
    }

    #[test]
    fn test_energy_monotone_in_single_class_score() {
        let base = [0.5f32, -1.0, 2.0, 0.0];
        let mut previous = f32::NEG_INFINITY;
        for step in 0..10 {
            let mut scores = base;
            scores[1] = -1.0 + step as f32 * 0.75;
            let t = Tensor::from_slice(&scores, (1, 4), &Device::Cpu).unwrap();
            let e = energy(&t).unwrap().to_vec1::<f32>().unwrap()[0];
            assert!(e >= previous, "energy decreased: {} < {}", e, previous);
            previous = e;
        }
    }

    #[test]
    fn test_energy_matches_naive_logsumexp() {
        let scores = [1.0f32, 2.0, 3.0];
        let t = Tensor::from_slice(&scores, (1, 3), &Device::Cpu).unwrap();
        let e = energy(&t).unwrap().to_vec1::<f32>().unwrap()[0];
        let naive = scores.iter().map(|s| s.exp()).sum::<f32>().ln();
        assert!((e - naive).abs() < 1e-5);
    }

    #[test]
    fn test_energy_stable_for_large_scores() {
        let t = Tensor::from_slice(&[1000.0f32, 1000.0], (1, 2), &Device::Cpu).unwrap();
        let e = energy(&t).unwrap().to_vec1::<f32>().unwrap()[0];
        assert!(e.is_finite());
        assert!((e - (1000.0 + 2.0f32.ln())).abs() < 1e-2);
    }

    #[test]
    fn test_pnorm_variants() {
        let t = Tensor::from_slice(&[3.0f32, -4.0], (1, 2), &Device::Cpu).unwrap();
        let two = pnorm(&t, 2.0).unwrap().to_vec1::<f32>().unwrap()[0];
        let one = pnorm(&t, 1.0).unwrap().to_vec1::<f32>().unwrap()[0];
        let three = pnorm(&t, 3.0).unwrap().to_vec1::<f32>().unwrap()[0];
        assert!((two - 5.0).abs() < 1e-5);
        assert!((one - 7.0).abs() < 1e-5);
        assert!((three - 91.0f32.powf(1.0 / 3.0)).abs() < 1e-4);
    }

    #[test]
    fn test_l2_distance_matches_direct_computation() {
        let a = matrix(4, 6, 0.0);
        let b = matrix(3, 6, 0.7);
        let dist = to_rows(&MetricEngine::new(false).distance(DistanceKind::L2, &a, &b).unwrap());
        let a_rows = to_rows(&a);
        let b_rows = to_rows(&b);
        for (i, ar) in a_rows.iter().enumerate() {
            for (j, br) in b_rows.iter().enumerate() {
                let expected: f32 = ar.iter().zip(br.iter()).map(|(x, y)| (x - y).powi(2)).sum();
                assert!((dist[i][j] - expected).abs() < 1e-3, "{} vs {}", dist[i][j], expected);
            }
        }
    }

    #[test]
    fn test_l1_distance_scaled_is_mean_absolute_difference() {
        let a = matrix(2, 4, 0.1);
        let b = matrix(2, 4, 0.5);
        let dist = to_rows(&MetricEngine::new(true).distance(DistanceKind::L1, &a, &b).unwrap());
        let a_rows = to_rows(&a);
        let b_rows = to_rows(&b);
        for (i, ar) in a_rows.iter().enumerate() {
            for (j, br) in b_rows.iter().enumerate() {
                let expected: f32 =
                    ar.iter().zip(br.iter()).map(|(x, y)| (x - y).abs()).sum::<f32>() / 4.0;
                assert!((dist[i][j] - expected).abs() < 1e-4);
            }
        }
    }

    #[test]
    fn test_self_distance_is_zero() {
        let a = matrix(3, 5, 0.3);
        let engine = MetricEngine::new(false);
        for kind in DistanceKind::ALL {
            let dist = to_rows(&engine.distance(kind, &a, &a).unwrap());
            for i in 0..3 {
                assert!(dist[i][i].abs() < 1e-3, "{} self distance {}", kind, dist[i][i]);
            }
        }
    }

    #[test]
    fn test_cosine_distance_range() {
        let a = matrix(5, 7, 0.0);
        let b = matrix(3, 7, 3.0);
        let dist = MetricEngine::new(true).distance(DistanceKind::Cosine, &a, &b).unwrap();
        for row in to_rows(&dist) {
            for v in row {
                assert!((-1e-5..=2.0 + 1e-5).contains(&v));
            }
        }
    }

    #[test]
    fn test_distance_against_single_reference_row() {
        let a = matrix(6, 8, 0.0);
        let origin = Tensor::zeros((1, 8), candle_core::DType::F32, &Device::Cpu).unwrap();
        let engine = MetricEngine::new(false);
        for kind in DistanceKind::ALL {
            let dist = engine.distance(kind, &a, &origin).unwrap();
            assert_eq!(dist.dims(), &[6, 1]);
        }

        // Squared distance to the origin is the squared row norm.
        let dist = to_rows(&engine.distance(DistanceKind::L2, &a, &origin).unwrap());
        let norms = to_rows(&row_norms(&a).unwrap());
        for (d, n) in dist.iter().zip(norms.iter()) {
            assert!((d[0] - n[0] * n[0]).abs() < 1e-3);
        }
    }

    #[test]
    fn test_l2_normalize_zero_row_stays_zero() {
        let t = Tensor::from_slice(&[0.0f32, 0.0, 3.0, 4.0], (2, 2), &Device::Cpu).unwrap();
        let rows = to_rows(&l2_normalize(&t).unwrap());
        assert_eq!(rows[0], vec![0.0, 0.0]);
        assert!((rows[1][0] - 0.6).abs() < 1e-6);
        assert!((rows[1][1] - 0.8).abs() < 1e-6);
    }
}
