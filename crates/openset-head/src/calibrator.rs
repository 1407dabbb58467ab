//! Generative calibration: synthetic pooled features for threshold estimation.
//!
//! The head only relies on the [`GenerativeCalibrator`] capability. The
//! bundled [`GaussianCalibrator`] perturbs the conditioning features with
//! per-channel Gaussian noise drawn from calibration statistics collected
//! upstream.
//!
//! # Statistics file
//!
//! ```json
//! {
//!   "mean": [0.1, 0.3, 0.2],
//!   "std": [0.5, 0.4, 0.6],
//!   "num_samples": 6,
//!   "spread": 2.0,
//!   "seed": 7
//! }
//! ```

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use candle_core::Tensor;
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};

use crate::error::{OpenSetError, OpenSetResult};

/// Produces pooled-feature-shaped samples conditioned on real pooled features.
pub trait GenerativeCalibrator: Send + Sync {
    /// Width of the pooled features consumed and produced.
    fn feature_dim(&self) -> usize;

    /// Generated features `[k, feature_dim]` for conditioning features
    /// `[n, feature_dim]`. `k` need not equal `n`.
    fn sample(&self, pooled: &Tensor) -> candle_core::Result<Tensor>;
}

fn default_spread() -> f32 {
    1.0
}

/// Per-channel feature statistics supplied at construction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationStats {
    /// Per-channel mean of pooled features.
    pub mean: Vec<f32>,

    /// Per-channel standard deviation of pooled features.
    pub std: Vec<f32>,

    /// Rows to generate per call; defaults to the conditioning batch size.
    #[serde(default)]
    pub num_samples: Option<usize>,

    /// Noise multiplier applied on top of `std`.
    #[serde(default = "default_spread")]
    pub spread: f32,

    /// Base seed for the noise generator.
    #[serde(default)]
    pub seed: u64,
}

impl CalibrationStats {
    /// Statistics with unit spread and seed 0.
    pub fn new(mean: Vec<f32>, std: Vec<f32>) -> Self {
        Self {
            mean,
            std,
            num_samples: None,
            spread: default_spread(),
            seed: 0,
        }
    }

    /// Fix the number of generated rows per call.
    #[must_use]
    pub fn with_num_samples(mut self, num_samples: usize) -> Self {
        self.num_samples = Some(num_samples);
        self
    }

    /// Parse statistics from JSON.
    ///
    /// # Errors
    /// `OpenSetError::ConfigError` if parsing fails.
    pub fn from_json_str(json: &str) -> OpenSetResult<Self> {
        serde_json::from_str(json).map_err(|e| {
            OpenSetError::config(format!("Failed to parse calibration statistics: {}", e))
        })
    }

    /// Load statistics from a JSON file.
    ///
    /// # Errors
    /// `OpenSetError::ConfigError` if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> OpenSetResult<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| {
            OpenSetError::config(format!(
                "Failed to read calibration statistics '{}': {}",
                path.display(),
                e
            ))
        })?;
        Self::from_json_str(&contents)
    }

    /// Channel count described by these statistics.
    pub fn feature_dim(&self) -> usize {
        self.mean.len()
    }

    /// Check widths and value ranges.
    ///
    /// # Errors
    /// - `OpenSetError::ConfigError` for empty statistics or negative / non-finite values
    /// - `OpenSetError::DimensionMismatch` if `mean` and `std` widths differ
    pub fn validate(&self) -> OpenSetResult<()> {
        if self.mean.is_empty() {
            return Err(OpenSetError::config("calibration statistics are empty"));
        }
        if self.std.len() != self.mean.len() {
            return Err(OpenSetError::DimensionMismatch {
                context: "calibration std vs mean",
                expected: self.mean.len(),
                actual: self.std.len(),
            });
        }
        if self.std.iter().any(|s| !s.is_finite() || *s < 0.0) {
            return Err(OpenSetError::config(
                "calibration std must be finite and non-negative",
            ));
        }
        if self.mean.iter().any(|m| !m.is_finite()) {
            return Err(OpenSetError::config("calibration mean must be finite"));
        }
        if !self.spread.is_finite() || self.spread < 0.0 {
            return Err(OpenSetError::config(format!(
                "spread must be finite and non-negative, got {}",
                self.spread
            )));
        }
        Ok(())
    }
}

/// Gaussian perturbation sampler over pooled features.
///
/// Row `i` of a sample is conditioning row `i mod n` plus noise with
/// per-channel deviation `std * spread`. Each call advances an internal
/// counter mixed into the seed, so successive calls differ but a fresh
/// calibrator replays the same sequence.
#[derive(Debug)]
pub struct GaussianCalibrator {
    stats: CalibrationStats,
    calls: AtomicU64,
}

impl GaussianCalibrator {
    /// Build from validated statistics.
    ///
    /// # Errors
    /// Propagates [`CalibrationStats::validate`] failures.
    pub fn from_stats(stats: CalibrationStats) -> OpenSetResult<Self> {
        stats.validate()?;
        Ok(Self {
            stats,
            calls: AtomicU64::new(0),
        })
    }

    /// Statistics this calibrator samples from.
    pub fn stats(&self) -> &CalibrationStats {
        &self.stats
    }
}

impl GenerativeCalibrator for GaussianCalibrator {
    fn feature_dim(&self) -> usize {
        self.stats.feature_dim()
    }

    fn sample(&self, pooled: &Tensor) -> candle_core::Result<Tensor> {
        let (n, c) = pooled.dims2()?;
        if c != self.feature_dim() {
            candle_core::bail!(
                "calibrator expects {} channels, conditioning batch has {}",
                self.feature_dim(),
                c
            );
        }
        let device = pooled.device();
        let count = self.stats.num_samples.unwrap_or(n);

        let call = self.calls.fetch_add(1, Ordering::Relaxed);
        let mut rng = StdRng::seed_from_u64(self.stats.seed.wrapping_add(call));
        let normal =
            Normal::new(0.0f32, 1.0).map_err(|e| candle_core::Error::Msg(e.to_string()))?;
        let noise: Vec<f32> = (0..count * c)
            .map(|i| normal.sample(&mut rng) * self.stats.std[i % c] * self.stats.spread)
            .collect();
        let noise = Tensor::from_vec(noise, (count, c), device)?;

        let base = if n == 0 {
            Tensor::from_slice(&self.stats.mean, (1, c), device)?
                .broadcast_as((count, c))?
                .contiguous()?
        } else {
            let rows: Vec<u32> = (0..count).map(|i| (i % n) as u32).collect();
            let index = Tensor::from_vec(rows, count, device)?;
            pooled.index_select(&index, 0)?
        };
        base + noise
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    fn stats(width: usize) -> CalibrationStats {
        CalibrationStats::new(vec![0.5; width], vec![1.0; width])
    }

    #[test]
    fn test_json_parsing_with_defaults() {
        let stats = CalibrationStats::from_json_str(r#"{"mean": [0.0, 1.0], "std": [1.0, 2.0]}"#).unwrap();
        assert_eq!(stats.feature_dim(), 2);
        assert_eq!(stats.num_samples, None);
        assert_eq!(stats.spread, 1.0);
        assert_eq!(stats.seed, 0);
    }

    #[test]
    fn test_invalid_json_is_config_error() {
        let err = CalibrationStats::from_json_str("{not json").unwrap_err();
        assert!(matches!(err, OpenSetError::ConfigError { .. }));
    }

    #[test]
    fn test_validate_rejects_mismatched_widths() {
        let stats = CalibrationStats::new(vec![0.0; 4], vec![1.0; 3]);
        assert!(matches!(
            stats.validate(),
            Err(OpenSetError::DimensionMismatch { expected: 4, actual: 3, .. })
        ));
    }

    #[test]
    fn test_validate_rejects_negative_std() {
        let stats = CalibrationStats::new(vec![0.0; 2], vec![1.0, -0.5]);
        assert!(GaussianCalibrator::from_stats(stats).is_err());
    }

    #[test]
    fn test_sample_count_follows_stats() {
        let calibrator = GaussianCalibrator::from_stats(stats(8).with_num_samples(6)).unwrap();
        let pooled = Tensor::zeros((10, 8), DType::F32, &Device::Cpu).unwrap();
        let generated = calibrator.sample(&pooled).unwrap();
        assert_eq!(generated.dims(), &[6, 8]);
    }

    #[test]
    fn test_sample_count_defaults_to_batch() {
        let calibrator = GaussianCalibrator::from_stats(stats(8)).unwrap();
        let pooled = Tensor::zeros((3, 8), DType::F32, &Device::Cpu).unwrap();
        assert_eq!(calibrator.sample(&pooled).unwrap().dims(), &[3, 8]);
    }

    #[test]
    fn test_zero_spread_returns_conditioning_rows() {
        let mut s = stats(2).with_num_samples(4);
        s.spread = 0.0;
        let calibrator = GaussianCalibrator::from_stats(s).unwrap();
        let pooled = Tensor::from_slice(&[1.0f32, 2.0, 3.0, 4.0], (2, 2), &Device::Cpu).unwrap();
        let rows = calibrator.sample(&pooled).unwrap().to_vec2::<f32>().unwrap();
        assert_eq!(rows, vec![vec![1.0, 2.0], vec![3.0, 4.0], vec![1.0, 2.0], vec![3.0, 4.0]]);
    }

    #[test]
    fn test_same_seed_replays_sequence() {
        let pooled = Tensor::zeros((4, 3), DType::F32, &Device::Cpu).unwrap();
        let a = GaussianCalibrator::from_stats(stats(3)).unwrap();
        let b = GaussianCalibrator::from_stats(stats(3)).unwrap();
        let first_a = a.sample(&pooled).unwrap().to_vec2::<f32>().unwrap();
        let first_b = b.sample(&pooled).unwrap().to_vec2::<f32>().unwrap();
        let second_a = a.sample(&pooled).unwrap().to_vec2::<f32>().unwrap();
        assert_eq!(first_a, first_b);
        assert_ne!(first_a, second_a);
    }

    #[test]
    fn test_wrong_width_is_rejected() {
        let calibrator = GaussianCalibrator::from_stats(stats(3)).unwrap();
        let pooled = Tensor::zeros((2, 5), DType::F32, &Device::Cpu).unwrap();
        assert!(calibrator.sample(&pooled).is_err());
    }

    #[test]
    fn test_empty_batch_uses_stats_mean() {
        let mut s = stats(2).with_num_samples(3);
        s.spread = 0.0;
        let calibrator = GaussianCalibrator::from_stats(s).unwrap();
        let pooled = Tensor::zeros((0, 2), DType::F32, &Device::Cpu).unwrap();
        let rows = calibrator.sample(&pooled).unwrap().to_vec2::<f32>().unwrap();
        assert_eq!(rows, vec![vec![0.5, 0.5]; 3]);
    }
}
