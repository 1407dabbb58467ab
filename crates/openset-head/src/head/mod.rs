//! Open-set head: pooling, embedding and centroid-relative metrics.
//!
//! # Forward pass
//!
//! 1. backbone feature map `[n, k, h, w]`
//! 2. global average pool to `gap` `[n, k]`
//! 3. with a calibrator attached: sample generated features from `gap` and
//!    embed them with the shared transform
//! 4. embed `gap`
//! 5. read the centroids (row-normalized when configured)
//! 6. similarities and distances against the centroids; distances of the
//!    generated embeddings to centroids and to the origin
//! 7. assemble the [`MetricRecord`]
//!
//! Every configuration problem (metric names, backbone width, calibrator
//! width, threshold rank) surfaces from [`OpenSetHeadBuilder::build`]. A
//! forward call can only fail on tensor shape errors.

mod record;

pub use record::{MetricRecord, RecordSummary, RECORD_KEYS};

use candle_core::{DType, Device, Module, Tensor, Var, D};
use candle_nn::{Linear, VarBuilder, VarMap};
use tracing::{debug, trace};

use crate::backbone::Backbone;
use crate::calibrator::GenerativeCalibrator;
use crate::centroids::CentroidBank;
use crate::config::HeadConfig;
use crate::embedding::EmbeddingTransform;
use crate::error::{OpenSetError, OpenSetResult};
use crate::metrics::{self, MetricEngine, SimilarityKind};
use crate::probe;

// =============================================================================
// BUILDER
// =============================================================================

/// Assembles an [`OpenSetHead`] from a [`HeadConfig`] and optional parts.
pub struct OpenSetHeadBuilder {
    config: HeadConfig,
    backbone: Option<Box<dyn Backbone>>,
    calibrator: Option<Box<dyn GenerativeCalibrator>>,
    thresholds: Option<Tensor>,
}

impl OpenSetHeadBuilder {
    pub fn new(config: HeadConfig) -> Self {
        Self {
            config,
            backbone: None,
            calibrator: None,
            thresholds: None,
        }
    }

    /// Use this backbone instead of building `config.backbone` from the
    /// catalog. Its parameters are not registered in the head's `VarMap`.
    pub fn with_backbone(mut self, backbone: Box<dyn Backbone>) -> Self {
        self.backbone = Some(backbone);
        self
    }

    /// Attach a generative calibrator, enabling the generated-feature branch.
    pub fn with_calibrator(mut self, calibrator: Box<dyn GenerativeCalibrator>) -> Self {
        self.calibrator = Some(calibrator);
        self
    }

    /// Fixed decision thresholds, returned untouched in every record.
    pub fn with_thresholds(mut self, thresholds: Tensor) -> Self {
        self.thresholds = Some(thresholds);
        self
    }

    /// Build the head on `device`.
    ///
    /// # Errors
    /// - `OpenSetError::ConfigError` for invalid config values, thresholds
    ///   that are not a vector, or an embedding that cannot be built
    /// - `OpenSetError::DimensionProbe` if the backbone width cannot be resolved
    /// - `OpenSetError::DimensionMismatch` if the calibrator width differs from
    ///   the backbone width
    pub fn build(self, device: &Device) -> OpenSetResult<OpenSetHead> {
        let Self {
            config,
            backbone,
            calibrator,
            thresholds,
        } = self;
        config.validate()?;

        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);

        let backbone = match backbone {
            Some(backbone) => backbone,
            None => config
                .backbone
                .build(config.input_channels, vb.pp("backbone"))?,
        };
        let feat_dim = probe::output_dim(backbone.as_ref())?;

        if let Some(calibrator) = &calibrator {
            if calibrator.feature_dim() != feat_dim {
                return Err(OpenSetError::DimensionMismatch {
                    context: "calibrator feature width vs backbone width",
                    expected: feat_dim,
                    actual: calibrator.feature_dim(),
                });
            }
        }

        let thresholds = match thresholds {
            Some(t) if t.rank() != 1 => {
                return Err(OpenSetError::config(format!(
                    "thresholds must be a vector, got shape {:?}",
                    t.dims()
                )));
            }
            Some(t) => Some(t.to_device(device)?),
            None => None,
        };

        let embedding = EmbeddingTransform::new(
            feat_dim,
            config.embed_dim,
            config.embedding,
            vb.pp("embedding"),
        )?;
        let embed_dim = embedding.out_dim();

        let centroids = CentroidBank::new(
            config.num_classes,
            embed_dim,
            config.centroid_init,
            config.norm_centroid,
            &varmap,
            device,
        )?;

        let origin = if calibrator.is_some() {
            Some(Tensor::zeros((1, embed_dim), DType::F32, device)?)
        } else {
            None
        };

        let classifier = if config.classifier {
            Some(candle_nn::linear(
                embed_dim,
                config.num_classes,
                vb.pp("classifier"),
            )?)
        } else {
            None
        };

        debug!(
            backbone = backbone.name(),
            feat_dim,
            embed_dim,
            num_classes = config.num_classes,
            similarity = config.similarity.as_str(),
            distance = config.distance.as_str(),
            scaled = config.scaled,
            calibrated = calibrator.is_some(),
            "Built open-set head"
        );

        Ok(OpenSetHead {
            engine: MetricEngine::new(config.scaled),
            config,
            varmap,
            backbone,
            feat_dim,
            embedding,
            centroids,
            calibrator,
            origin,
            thresholds,
            classifier,
        })
    }
}

// =============================================================================
// HEAD
// =============================================================================

/// Embedding-and-centroid head over a swappable backbone.
///
/// Forward calls take `&self` and never mutate parameters, so concurrent
/// calls are fine as long as no optimizer step runs at the same time.
pub struct OpenSetHead {
    config: HeadConfig,
    varmap: VarMap,
    backbone: Box<dyn Backbone>,
    feat_dim: usize,
    embedding: EmbeddingTransform,
    centroids: CentroidBank,
    engine: MetricEngine,
    calibrator: Option<Box<dyn GenerativeCalibrator>>,
    origin: Option<Tensor>,
    thresholds: Option<Tensor>,
    classifier: Option<Linear>,
}

impl OpenSetHead {
    pub fn builder(config: HeadConfig) -> OpenSetHeadBuilder {
        OpenSetHeadBuilder::new(config)
    }

    /// Catalog backbone, no calibrator, no thresholds.
    pub fn new(config: HeadConfig, device: &Device) -> OpenSetResult<Self> {
        OpenSetHeadBuilder::new(config).build(device)
    }

    /// Eval-mode forward pass.
    pub fn forward(&self, images: &Tensor) -> OpenSetResult<MetricRecord> {
        self.forward_t(images, false)
    }

    /// Forward pass; `train` selects batch statistics in the backbone.
    pub fn forward_t(&self, images: &Tensor, train: bool) -> OpenSetResult<MetricRecord> {
        let fmap = self.backbone.forward_t(images, train)?;
        let (n, channels, _, _) = fmap.dims4()?;
        if channels != self.feat_dim {
            return Err(candle_core::Error::Msg(format!(
                "backbone feature map has {} channels, head was built for {}",
                channels, self.feat_dim
            ))
            .into());
        }
        let gap = fmap.mean(D::Minus1)?.mean(D::Minus1)?;
        trace!(batch = n, channels, "Pooled backbone features");

        let embed_gen = match &self.calibrator {
            Some(calibrator) => {
                let generated = calibrator.sample(&gap)?;
                trace!(generated = generated.dim(0)?, "Sampled generated features");
                Some(self.embedding.forward(&generated)?)
            }
            None => None,
        };
        let embed_fea = self.embedding.forward(&gap)?;
        let centroids = self.centroids.read()?;

        let dotproduct_fea2cen =
            self.engine
                .similarity(SimilarityKind::DotProduct, &embed_fea, &centroids)?;
        let cosine_fea2cen = self
            .engine
            .similarity(SimilarityKind::Cosine, &embed_fea, &centroids)?;
        let normweight_fea2cen =
            self.engine
                .similarity(SimilarityKind::NormWeight, &embed_fea, &centroids)?;
        let sim_fea2cen = match self.config.similarity {
            SimilarityKind::DotProduct => dotproduct_fea2cen.clone(),
            SimilarityKind::Cosine => cosine_fea2cen.clone(),
            SimilarityKind::NormWeight => normweight_fea2cen.clone(),
        };

        let dis_fea2cen = self.distance(&embed_fea, &centroids)?;
        let (dis_gen2cen, dis_gen2ori) = match (&embed_gen, &self.origin) {
            (Some(embed_gen), Some(origin)) => (
                Some(self.distance(embed_gen, &centroids)?),
                Some(self.distance(embed_gen, origin)?),
            ),
            _ => (None, None),
        };

        let energy = metrics::energy(&normweight_fea2cen)?;
        let pnorm = metrics::pnorm(&normweight_fea2cen, self.config.pnorm_p)?;
        let norm_fea = metrics::row_norms(&embed_fea)?;
        let logits = self
            .classifier
            .as_ref()
            .map(|classifier| classifier.forward(&embed_fea))
            .transpose()?;

        Ok(MetricRecord {
            gap,
            embed_fea,
            embed_gen,
            norm_fea,
            sim_fea2cen,
            dotproduct_fea2cen,
            cosine_fea2cen,
            normweight_fea2cen,
            dis_fea2cen,
            dis_gen2cen,
            dis_gen2ori,
            energy,
            pnorm,
            logits,
            thresholds: self.thresholds.clone(),
        })
    }

    fn distance(&self, embeddings: &Tensor, reference: &Tensor) -> candle_core::Result<Tensor> {
        if self.config.norm_embedding_for_distance {
            let normalized = metrics::l2_normalize(embeddings)?;
            self.engine.distance(self.config.distance, &normalized, reference)
        } else {
            self.engine.distance(self.config.distance, embeddings, reference)
        }
    }

    /// Every parameter registered by the head: catalog backbone, embedding,
    /// centroids and classifier.
    pub fn trainable_vars(&self) -> Vec<Var> {
        self.varmap.all_vars()
    }

    pub fn varmap(&self) -> &VarMap {
        &self.varmap
    }

    pub fn config(&self) -> &HeadConfig {
        &self.config
    }

    pub fn backbone(&self) -> &dyn Backbone {
        self.backbone.as_ref()
    }

    /// Width of the pooled backbone features.
    pub fn feat_dim(&self) -> usize {
        self.feat_dim
    }

    /// Width of the embeddings and centroids.
    pub fn embed_dim(&self) -> usize {
        self.embedding.out_dim()
    }

    pub fn centroids(&self) -> &CentroidBank {
        &self.centroids
    }

    pub fn is_calibrated(&self) -> bool {
        self.calibrator.is_some()
    }
}
