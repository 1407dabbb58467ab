//! Projection from pooled backbone features into embedding space.
//!
//! One instance serves both the real and the generated path of the head, so
//! both populations land in the same geometry and are compared against the
//! same centroids.

use std::fmt;
use std::str::FromStr;

use candle_core::{Module, Tensor};
use candle_nn::{Linear, PReLU, VarBuilder};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{OpenSetError, OpenSetResult};

/// Hidden width divisor of the bottleneck projection.
pub const BOTTLENECK_REDUCTION: usize = 16;

const SMALL_HIDDEN_WIDTH: usize = 4;

/// Shape of the projection when an embedding width is requested.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmbeddingStyle {
    /// PReLU, then a biased linear map.
    #[default]
    Shallow,
    /// PReLU, bias-free down-projection to `feat_dim / 16`, PReLU, bias-free
    /// linear map to the embedding width.
    Bottleneck,
}

impl EmbeddingStyle {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Shallow => "shallow",
            Self::Bottleneck => "bottleneck",
        }
    }
}

impl FromStr for EmbeddingStyle {
    type Err = OpenSetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "shallow" => Ok(Self::Shallow),
            "bottleneck" => Ok(Self::Bottleneck),
            other => Err(OpenSetError::config(format!(
                "Unknown embedding style '{}' (expected shallow or bottleneck)",
                other
            ))),
        }
    }
}

impl fmt::Display for EmbeddingStyle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

enum Projection {
    Shallow {
        act: PReLU,
        proj: Linear,
    },
    Bottleneck {
        act1: PReLU,
        down: Linear,
        act2: PReLU,
        proj: Linear,
    },
}

impl Projection {
    fn style(&self) -> EmbeddingStyle {
        match self {
            Self::Shallow { .. } => EmbeddingStyle::Shallow,
            Self::Bottleneck { .. } => EmbeddingStyle::Bottleneck,
        }
    }
}

impl Module for Projection {
    fn forward(&self, xs: &Tensor) -> candle_core::Result<Tensor> {
        match self {
            Self::Shallow { act, proj } => proj.forward(&act.forward(xs)?),
            Self::Bottleneck {
                act1,
                down,
                act2,
                proj,
            } => {
                let hidden = down.forward(&act1.forward(xs)?)?;
                proj.forward(&act2.forward(&hidden)?)
            }
        }
    }
}

/// Maps `[n, in_dim]` pooled features to `[n, out_dim]` embeddings.
pub struct EmbeddingTransform {
    in_dim: usize,
    out_dim: usize,
    projection: Option<Projection>,
}

impl EmbeddingTransform {
    /// Pass-through transform; the embedding is the pooled feature itself.
    pub fn identity(dim: usize) -> Self {
        Self {
            in_dim: dim,
            out_dim: dim,
            projection: None,
        }
    }

    /// Build the transform for `embed_dim`, or the identity when it is `None`.
    ///
    /// # Errors
    /// - `OpenSetError::ConfigError` if `embed_dim` is zero or the bottleneck
    ///   hidden width `feat_dim / 16` rounds down to zero
    /// - `OpenSetError::Tensor` if parameter creation fails
    pub fn new(
        feat_dim: usize,
        embed_dim: Option<usize>,
        style: EmbeddingStyle,
        vb: VarBuilder,
    ) -> OpenSetResult<Self> {
        let Some(embed_dim) = embed_dim else {
            debug!(feat_dim, "Embedding transform is identity");
            return Ok(Self::identity(feat_dim));
        };
        if embed_dim == 0 {
            return Err(OpenSetError::config("embed_dim must be greater than 0"));
        }

        let projection = match style {
            EmbeddingStyle::Shallow => Projection::Shallow {
                act: candle_nn::prelu(None, vb.pp("act"))?,
                proj: candle_nn::linear(feat_dim, embed_dim, vb.pp("proj"))?,
            },
            EmbeddingStyle::Bottleneck => {
                let hidden = feat_dim / BOTTLENECK_REDUCTION;
                if hidden == 0 {
                    return Err(OpenSetError::config(format!(
                        "bottleneck embedding needs feat_dim >= {}, backbone gives {}",
                        BOTTLENECK_REDUCTION, feat_dim
                    )));
                }
                if hidden < SMALL_HIDDEN_WIDTH {
                    warn!(feat_dim, hidden, "Bottleneck hidden width is very small");
                }
                Projection::Bottleneck {
                    act1: candle_nn::prelu(None, vb.pp("act1"))?,
                    down: candle_nn::linear_no_bias(feat_dim, hidden, vb.pp("down"))?,
                    act2: candle_nn::prelu(None, vb.pp("act2"))?,
                    proj: candle_nn::linear_no_bias(hidden, embed_dim, vb.pp("proj"))?,
                }
            }
        };

        debug!(feat_dim, embed_dim, style = style.as_str(), "Built embedding transform");
        Ok(Self {
            in_dim: feat_dim,
            out_dim: embed_dim,
            projection: Some(projection),
        })
    }

    #[inline]
    pub fn in_dim(&self) -> usize {
        self.in_dim
    }

    #[inline]
    pub fn out_dim(&self) -> usize {
        self.out_dim
    }

    /// `None` for the identity transform.
    pub fn style(&self) -> Option<EmbeddingStyle> {
        self.projection.as_ref().map(Projection::style)
    }

    pub fn is_identity(&self) -> bool {
        self.projection.is_none()
    }
}

impl Module for EmbeddingTransform {
    fn forward(&self, pooled: &Tensor) -> candle_core::Result<Tensor> {
        match &self.projection {
            Some(projection) => projection.forward(pooled),
            None => Ok(pooled.clone()),
        }
    }
}

impl fmt::Debug for EmbeddingTransform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EmbeddingTransform")
            .field("in_dim", &self.in_dim)
            .field("out_dim", &self.out_dim)
            .field("style", &self.style())
            .finish()
    }
}
