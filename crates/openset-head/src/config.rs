//! Construction surface of the open-set head.
//!
//! # Loading Configuration
//!
//! ```
//! use openset_head::HeadConfig;
//!
//! let config = HeadConfig::default();
//! config.validate().expect("Default config should be valid");
//!
//! let config = HeadConfig::default()
//!     .with_env_overrides()
//!     .expect("Environment overrides should parse");
//! assert!(config.num_classes > 0);
//! ```
//!
//! # TOML Structure
//!
//! ```toml
//! backbone = "ResNet18"
//! num_classes = 10
//! embed_dim = 128
//! embedding = "shallow"
//! distance = "l2"
//! similarity = "dotproduct"
//! scaled = true
//! norm_centroid = false
//! norm_embedding_for_distance = false
//! centroid_init = "normal"
//! classifier = false
//! pnorm_p = 2.0
//! input_channels = 3
//! ```
//!
//! Metric and backbone names go through the same parsers as everywhere else,
//! so an unsupported name fails the load instead of falling back to a default.
//! Unknown keys are rejected for the same reason.

use std::env;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::backbone::BackboneKind;
use crate::centroids::CentroidInit;
use crate::embedding::EmbeddingStyle;
use crate::error::{OpenSetError, OpenSetResult};
use crate::metrics::{DistanceKind, SimilarityKind};

fn default_num_classes() -> usize {
    1000
}

fn default_true() -> bool {
    true
}

fn default_pnorm_p() -> f64 {
    2.0
}

fn default_input_channels() -> usize {
    3
}

/// Open-set head configuration.
///
/// Thresholds and calibration statistics are data rather than configuration
/// and are handed to [`crate::OpenSetHeadBuilder`] directly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HeadConfig {
    /// Registered backbone name.
    #[serde(default)]
    pub backbone: BackboneKind,

    /// Number of known classes (rows of the centroid bank).
    #[serde(default = "default_num_classes")]
    pub num_classes: usize,

    /// Embedding width. `None` keeps the pooled backbone feature as the embedding.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embed_dim: Option<usize>,

    /// Projection shape used when `embed_dim` is set.
    #[serde(default)]
    pub embedding: EmbeddingStyle,

    /// Distance between embeddings and centroids.
    #[serde(default)]
    pub distance: DistanceKind,

    /// Similarity reported as `sim_fea2cen`.
    #[serde(default)]
    pub similarity: SimilarityKind,

    /// Divide dot products by √d and l1/l2 distances by d.
    #[serde(default = "default_true")]
    pub scaled: bool,

    /// Row-normalize centroids before every metric.
    #[serde(default)]
    pub norm_centroid: bool,

    /// Row-normalize embeddings before distances (similarities are unaffected).
    #[serde(default)]
    pub norm_embedding_for_distance: bool,

    /// Initial centroid distribution.
    #[serde(default)]
    pub centroid_init: CentroidInit,

    /// Attach a linear classifier over embeddings producing `logits`.
    #[serde(default)]
    pub classifier: bool,

    /// Exponent of the `pnorm` measure.
    #[serde(default = "default_pnorm_p")]
    pub pnorm_p: f64,

    /// Image channels expected by catalog backbones.
    #[serde(default = "default_input_channels")]
    pub input_channels: usize,
}

impl Default for HeadConfig {
    fn default() -> Self {
        Self {
            backbone: BackboneKind::default(),
            num_classes: default_num_classes(),
            embed_dim: None,
            embedding: EmbeddingStyle::default(),
            distance: DistanceKind::default(),
            similarity: SimilarityKind::default(),
            scaled: true,
            norm_centroid: false,
            norm_embedding_for_distance: false,
            centroid_init: CentroidInit::default(),
            classifier: false,
            pnorm_p: default_pnorm_p(),
            input_channels: default_input_channels(),
        }
    }
}

impl HeadConfig {
    /// Default configuration for `num_classes` classes.
    pub fn new(num_classes: usize) -> Self {
        Self {
            num_classes,
            ..Self::default()
        }
    }

    /// Load configuration from a TOML file.
    ///
    /// # Errors
    /// - `OpenSetError::ConfigError` if the file cannot be read or parsed
    pub fn from_file(path: impl AsRef<Path>) -> OpenSetResult<Self> {
        let path = path.as_ref();

        let contents = std::fs::read_to_string(path).map_err(|e| {
            OpenSetError::config(format!("Failed to read config file '{}': {}", path.display(), e))
        })?;

        toml::from_str(&contents).map_err(|e| {
            OpenSetError::config(format!("Failed to parse TOML in '{}': {}", path.display(), e))
        })
    }

    /// Create configuration from a TOML string.
    ///
    /// # Errors
    /// - `OpenSetError::ConfigError` if TOML parsing fails, including unsupported
    ///   metric or backbone names
    pub fn from_toml_str(toml: &str) -> OpenSetResult<Self> {
        toml::from_str(toml)
            .map_err(|e| OpenSetError::config(format!("Failed to parse TOML: {}", e)))
    }

    /// Serialize configuration to a TOML string.
    ///
    /// # Errors
    /// - `OpenSetError::ConfigError` if serialization fails
    pub fn to_toml_string(&self) -> OpenSetResult<String> {
        toml::to_string_pretty(self)
            .map_err(|e| OpenSetError::config(format!("Failed to serialize to TOML: {}", e)))
    }

    /// Validate numeric ranges.
    ///
    /// # Errors
    /// - `OpenSetError::ConfigError` naming the offending key
    pub fn validate(&self) -> OpenSetResult<()> {
        if self.num_classes == 0 {
            return Err(OpenSetError::config("num_classes must be greater than 0"));
        }
        if self.embed_dim == Some(0) {
            return Err(OpenSetError::config("embed_dim must be greater than 0 when set"));
        }
        if !(self.pnorm_p.is_finite() && self.pnorm_p > 0.0) {
            return Err(OpenSetError::config(format!(
                "pnorm_p must be a positive finite number, got {}",
                self.pnorm_p
            )));
        }
        if self.input_channels == 0 {
            return Err(OpenSetError::config("input_channels must be greater than 0"));
        }
        Ok(())
    }

    /// Apply environment variable overrides. Prefix: `OPENSET_`
    ///
    /// | Variable | Key | Type |
    /// |----------|-----|------|
    /// | `OPENSET_BACKBONE` | `backbone` | catalog name |
    /// | `OPENSET_NUM_CLASSES` | `num_classes` | usize |
    /// | `OPENSET_EMBED_DIM` | `embed_dim` | usize, `none` clears |
    /// | `OPENSET_DISTANCE` | `distance` | l1 / l2 / cosine |
    /// | `OPENSET_SIMILARITY` | `similarity` | dotproduct / cosine / normweight |
    /// | `OPENSET_SCALED` | `scaled` | bool |
    /// | `OPENSET_NORM_CENTROID` | `norm_centroid` | bool |
    ///
    /// Backbone and metric names go through their parsers and fail the
    /// override; numbers and bools that do not parse are ignored.
    ///
    /// # Errors
    /// - `OpenSetError::UnknownBackbone` for an unregistered `OPENSET_BACKBONE`
    /// - `OpenSetError::UnsupportedMetric` for `OPENSET_DISTANCE` or
    ///   `OPENSET_SIMILARITY` outside the supported set
    pub fn with_env_overrides(mut self) -> OpenSetResult<Self> {
        if let Ok(val) = env::var("OPENSET_BACKBONE") {
            self.backbone = val.parse()?;
        }
        if let Ok(val) = env::var("OPENSET_NUM_CLASSES") {
            if let Ok(n) = val.parse::<usize>() {
                self.num_classes = n;
            }
        }
        if let Ok(val) = env::var("OPENSET_EMBED_DIM") {
            if val.trim().eq_ignore_ascii_case("none") {
                self.embed_dim = None;
            } else if let Ok(n) = val.parse::<usize>() {
                self.embed_dim = Some(n);
            }
        }

        if let Ok(val) = env::var("OPENSET_DISTANCE") {
            self.distance = val.parse()?;
        }
        if let Ok(val) = env::var("OPENSET_SIMILARITY") {
            self.similarity = val.parse()?;
        }

        if let Ok(val) = env::var("OPENSET_SCALED") {
            if let Ok(b) = val.parse::<bool>() {
                self.scaled = b;
            }
        }
        if let Ok(val) = env::var("OPENSET_NORM_CENTROID") {
            if let Ok(b) = val.parse::<bool>() {
                self.norm_centroid = b;
            }
        }

        Ok(self)
    }
}
