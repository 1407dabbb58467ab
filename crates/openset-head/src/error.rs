//! Error types for open-set head construction and forward passes.
//!
//! Configuration-class failures (bad metric names, unresolvable backbone
//! widths, mismatched feature widths) are raised while the head is being
//! built. Tensor shape failures during a forward pass come straight from
//! candle and are carried through [`OpenSetError::Tensor`] untouched.

use thiserror::Error;

/// Open-set head errors.
#[derive(Debug, Error)]
pub enum OpenSetError {
    /// Configuration value is invalid or could not be parsed.
    #[error("Configuration error: {message}")]
    ConfigError { message: String },

    /// Metric name is not in the supported set for its family.
    #[error("Unsupported {family} metric '{name}'")]
    UnsupportedMetric { family: &'static str, name: String },

    /// Backbone name is not registered in the catalog.
    #[error("Unknown backbone '{0}'")]
    UnknownBackbone(String),

    /// Structural walk could not find a conv, linear or batch-norm leaf.
    #[error("Cannot resolve output dimension of backbone '{backbone}': {reason}")]
    DimensionProbe { backbone: String, reason: String },

    /// Two components that must share a width disagree.
    #[error("Dimension mismatch ({context}): expected {expected}, got {actual}")]
    DimensionMismatch {
        context: &'static str,
        expected: usize,
        actual: usize,
    },

    /// Tensor engine error (shape, dtype, device).
    #[error(transparent)]
    Tensor(#[from] candle_core::Error),

    /// IO error.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl OpenSetError {
    /// Shorthand for a [`OpenSetError::ConfigError`].
    pub fn config(message: impl Into<String>) -> Self {
        Self::ConfigError {
            message: message.into(),
        }
    }

    /// True for errors that can only originate at construction time.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Self::ConfigError { .. }
                | Self::UnsupportedMetric { .. }
                | Self::UnknownBackbone(_)
                | Self::DimensionProbe { .. }
                | Self::DimensionMismatch { .. }
        )
    }
}

/// Result type for open-set head operations.
pub type OpenSetResult<T> = Result<T, OpenSetError>;
