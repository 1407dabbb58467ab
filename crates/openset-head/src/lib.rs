//! Open-set recognition head over swappable image backbones.
//!
//! Pools a backbone's feature map, projects it into an embedding space,
//! and measures every embedding against one learnable centroid per known
//! class. The resulting similarities, distances and energy scores are what
//! downstream code uses to decide between a known class and "unknown".
//!
//! # Architecture
//!
//! - **Backbone**: capability trait over catalog networks (`LeNetPlus`,
//!   `LeNetGAP`, `ResNet8/18/34`) or injected feature extractors
//! - **probe**: resolves the backbone's output width
//! - **EmbeddingTransform**: identity, shallow or bottleneck projection
//! - **CentroidBank**: learnable class centroids
//! - **MetricEngine**: dot-product / cosine / normweight similarity and
//!   l1 / l2 / cosine distance, optionally scaled
//! - **GenerativeCalibrator**: optional source of synthetic pooled features
//! - **OpenSetHead**: runs the pipeline and returns a [`MetricRecord`]
//!
//! # Example
//!
//! ```rust,no_run
//! use candle_core::{Device, Tensor};
//! use openset_head::{HeadConfig, OpenSetHead};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = HeadConfig {
//!     embed_dim: Some(64),
//!     ..HeadConfig::new(10)
//! };
//! let head = OpenSetHead::new(config, &Device::Cpu)?;
//! let images = Tensor::rand(0f32, 1f32, (10, 3, 32, 32), &Device::Cpu)?;
//! let record = head.forward(&images)?;
//! assert_eq!(record.embed_fea.dims(), &[10, 64]);
//! assert!(record.embed_gen.is_none());
//! # Ok(())
//! # }
//! ```

pub mod backbone;
pub mod calibrator;
pub mod centroids;
pub mod config;
pub mod embedding;
pub mod error;
pub mod head;
pub mod metrics;
pub mod probe;
pub mod stub;

pub use backbone::{Backbone, BackboneKind, LayerNode};
pub use calibrator::{CalibrationStats, GaussianCalibrator, GenerativeCalibrator};
pub use centroids::{CentroidBank, CentroidInit};
pub use config::HeadConfig;
pub use embedding::{EmbeddingStyle, EmbeddingTransform};
pub use error::{OpenSetError, OpenSetResult};
pub use head::{MetricRecord, OpenSetHead, OpenSetHeadBuilder, RecordSummary, RECORD_KEYS};
pub use metrics::{DistanceKind, MetricEngine, SimilarityKind};
pub use stub::{StubBackbone, StubCalibrator};
