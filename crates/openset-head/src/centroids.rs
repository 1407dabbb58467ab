//! Learnable per-class reference points in embedding space.

use std::fmt;
use std::str::FromStr;

use candle_core::{DType, Device, Tensor};
use candle_nn::{Init, VarBuilder, VarMap};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{OpenSetError, OpenSetResult};
use crate::metrics::{l2_normalize, row_norms};

/// Variable name of the centroid matrix inside the head's `VarMap`.
pub const CENTROIDS_VAR: &str = "centroids";

const SPHERICAL_MAX_NORM: f64 = 1e-5;
const SPHERICAL_RESCALE: f64 = 1e5;

/// Initial distribution of the centroid rows.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CentroidInit {
    /// Standard normal entries.
    #[default]
    Normal,
    /// Uniform entries in [-1, 1], each row clipped to a tiny ball and scaled
    /// back up, leaving rows of norm at most one with random directions.
    Spherical,
}

impl CentroidInit {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Normal => "normal",
            Self::Spherical => "spherical",
        }
    }
}

impl FromStr for CentroidInit {
    type Err = OpenSetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "normal" => Ok(Self::Normal),
            "spherical" => Ok(Self::Spherical),
            other => Err(OpenSetError::config(format!(
                "Unknown centroid init '{}' (expected normal or spherical)",
                other
            ))),
        }
    }
}

impl fmt::Display for CentroidInit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `num_classes` trainable rows of width `dim`.
///
/// The stored parameter is never resized and never normalized in place;
/// [`CentroidBank::read`] applies the normalization policy on the way out.
#[derive(Debug, Clone)]
pub struct CentroidBank {
    centroids: Tensor,
    normalize: bool,
}

impl CentroidBank {
    /// Register the centroid matrix in `varmap` under [`CENTROIDS_VAR`].
    ///
    /// # Errors
    /// - `OpenSetError::ConfigError` for zero classes or zero width
    /// - `OpenSetError::Tensor` if parameter creation fails
    pub fn new(
        num_classes: usize,
        dim: usize,
        init: CentroidInit,
        normalize: bool,
        varmap: &VarMap,
        device: &Device,
    ) -> OpenSetResult<Self> {
        if num_classes == 0 || dim == 0 {
            return Err(OpenSetError::config(format!(
                "centroid bank needs at least one class and one dimension, got {}x{}",
                num_classes, dim
            )));
        }

        let vb = VarBuilder::from_varmap(varmap, DType::F32, device);
        let hint = match init {
            CentroidInit::Normal => Init::Randn {
                mean: 0.0,
                stdev: 1.0,
            },
            CentroidInit::Spherical => Init::Uniform { lo: -1.0, up: 1.0 },
        };
        let centroids = vb.get_with_hints((num_classes, dim), CENTROIDS_VAR, hint)?;

        if init == CentroidInit::Spherical {
            let clipped = renorm_rows(&centroids, SPHERICAL_MAX_NORM)?.affine(SPHERICAL_RESCALE, 0.0)?;
            overwrite_var(varmap, CENTROIDS_VAR, &clipped)?;
        }

        debug!(num_classes, dim, init = init.as_str(), normalize, "Initialized centroid bank");
        Ok(Self {
            centroids,
            normalize,
        })
    }

    /// Centroids as consumed by the metrics, row-normalized when configured.
    pub fn read(&self) -> candle_core::Result<Tensor> {
        if self.normalize {
            l2_normalize(&self.centroids)
        } else {
            Ok(self.centroids.clone())
        }
    }

    /// Stored parameter, unaffected by the normalization policy.
    pub fn raw(&self) -> &Tensor {
        &self.centroids
    }

    pub fn num_classes(&self) -> usize {
        self.centroids.dims()[0]
    }

    pub fn dim(&self) -> usize {
        self.centroids.dims()[1]
    }

    pub fn normalizes(&self) -> bool {
        self.normalize
    }
}

/// Replace the value of a registered variable in place.
fn overwrite_var(varmap: &VarMap, name: &str, value: &Tensor) -> OpenSetResult<()> {
    let vars = varmap
        .data()
        .lock()
        .map_err(|_| OpenSetError::config("variable map lock poisoned"))?;
    let var = vars.get(name).ok_or_else(|| {
        OpenSetError::config(format!("variable '{}' is not registered", name))
    })?;
    var.set(value)?;
    Ok(())
}

/// Scale every row whose L2 norm exceeds `max_norm` back onto that radius.
fn renorm_rows(rows: &Tensor, max_norm: f64) -> candle_core::Result<Tensor> {
    let scale = row_norms(rows)?
        .affine(1.0, 1e-7)?
        .recip()?
        .affine(max_norm, 0.0)?
        .clamp(0f32, 1f32)?;
    rows.broadcast_mul(&scale)
}
