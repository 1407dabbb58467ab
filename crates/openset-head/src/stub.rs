//! Stub backbone and calibrator for development and tests.
//!
//! Both are deterministic: the same input always yields the same output, so
//! record shapes and values can be asserted without loading real weights.

use candle_core::{DType, Device, Tensor};

use crate::backbone::{Backbone, LayerNode};
use crate::calibrator::GenerativeCalibrator;

/// Backbone producing a fixed-shape feature map derived from each image's mean.
#[derive(Debug, Clone)]
pub struct StubBackbone {
    channels: usize,
    spatial: (usize, usize),
    layout: LayerNode,
    declared: Option<usize>,
}

impl StubBackbone {
    /// Stub emitting `[n, channels, spatial.0, spatial.1]`, described as a
    /// single conv leaf of `channels` outputs.
    pub fn new(channels: usize, spatial: (usize, usize)) -> Self {
        Self {
            channels,
            spatial,
            layout: LayerNode::container("stub", vec![LayerNode::conv(channels)]),
            declared: None,
        }
    }

    /// Replace the structural description.
    pub fn with_layout(mut self, layout: LayerNode) -> Self {
        self.layout = layout;
        self
    }

    /// Declare the output width explicitly.
    pub fn with_declared_dim(mut self, dim: usize) -> Self {
        self.declared = Some(dim);
        self
    }

    fn pattern(&self, device: &Device) -> candle_core::Result<Tensor> {
        let (h, w) = self.spatial;
        let data: Vec<f32> = (0..self.channels * h * w)
            .map(|i| (i as f32 * 0.731).sin())
            .collect();
        Tensor::from_vec(data, (1, self.channels, h, w), device)
    }
}

impl Backbone for StubBackbone {
    fn name(&self) -> &str {
        "stub"
    }

    fn forward_t(&self, images: &Tensor, _train: bool) -> candle_core::Result<Tensor> {
        let n = images.dim(0)?;
        let image_mean = images.flatten_from(1)?.mean(1)?.reshape((n, 1, 1, 1))?;
        self.pattern(images.device())?.broadcast_add(&image_mean)
    }

    fn layout(&self) -> LayerNode {
        self.layout.clone()
    }

    fn declared_output_dim(&self) -> Option<usize> {
        self.declared
    }
}

/// Calibrator returning a fixed number of rows built from the conditioning batch.
///
/// Row `i` is `1.5 * pooled[i mod n] + 0.25`; an empty conditioning batch
/// yields zeros.
#[derive(Debug, Clone)]
pub struct StubCalibrator {
    feature_dim: usize,
    num_samples: usize,
}

impl StubCalibrator {
    /// Stub producing `num_samples` rows of width `feature_dim`.
    pub fn new(feature_dim: usize, num_samples: usize) -> Self {
        Self {
            feature_dim,
            num_samples,
        }
    }
}

impl GenerativeCalibrator for StubCalibrator {
    fn feature_dim(&self) -> usize {
        self.feature_dim
    }

    fn sample(&self, pooled: &Tensor) -> candle_core::Result<Tensor> {
        let n = pooled.dim(0)?;
        if n == 0 {
            return Tensor::zeros((self.num_samples, self.feature_dim), DType::F32, pooled.device());
        }
        let rows: Vec<u32> = (0..self.num_samples).map(|i| (i % n) as u32).collect();
        let index = Tensor::from_vec(rows, self.num_samples, pooled.device())?;
        pooled.index_select(&index, 0)?.affine(1.5, 0.25)
    }
}
