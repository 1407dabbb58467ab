//! Backbone capability interface and the registered backbone catalog.
//!
//! A backbone turns an image batch `[n, c, h, w]` into a spatial feature map
//! `[n, k, h', w']`. The head never looks inside the network; it only needs
//! two things from it:
//!
//! - `forward_t`: the feature map for a batch
//! - the channel count `k`, either declared up front through
//!   [`Backbone::declared_output_dim`] or recovered from the structural
//!   description returned by [`Backbone::layout`] (see [`crate::probe`])
//!
//! # Catalog
//!
//! | Name | Declared width | Resolved by |
//! |------|----------------|-------------|
//! | `LeNetPlus` | 1152 | declaration |
//! | `LeNetGAP` | 2 | declaration |
//! | `ResNet8` | - | structural walk (64) |
//! | `ResNet18` | - | structural walk (512) |
//! | `ResNet34` | - | structural walk (512) |

mod lenet;
mod resnet;

use std::fmt;
use std::str::FromStr;

use candle_core::Tensor;
use candle_nn::VarBuilder;
use serde::{Deserialize, Serialize};

use crate::error::{OpenSetError, OpenSetResult};

pub use lenet::{LeNet, LeNetVariant};
pub use resnet::{ResNet, ResNetConfig};

// =============================================================================
// STRUCTURAL DESCRIPTION
// =============================================================================

/// One node of a backbone's sub-layer tree, in declaration order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LayerNode {
    /// 2D convolution leaf.
    Conv2d { out_channels: usize },
    /// Fully connected leaf.
    Linear { out_features: usize },
    /// 2D batch normalization leaf.
    BatchNorm2d { num_features: usize },
    /// Leaf carrying no width information (activation, pooling, flatten).
    Opaque { kind: &'static str },
    /// Ordered group of sub-layers. May be empty (identity shortcut).
    Container {
        name: String,
        children: Vec<LayerNode>,
    },
}

impl LayerNode {
    /// Convolution leaf.
    pub fn conv(out_channels: usize) -> Self {
        Self::Conv2d { out_channels }
    }

    /// Linear leaf.
    pub fn linear(out_features: usize) -> Self {
        Self::Linear { out_features }
    }

    /// Batch-norm leaf.
    pub fn batch_norm(num_features: usize) -> Self {
        Self::BatchNorm2d { num_features }
    }

    /// Leaf without width information.
    pub fn opaque(kind: &'static str) -> Self {
        Self::Opaque { kind }
    }

    /// Named container.
    pub fn container(name: impl Into<String>, children: Vec<LayerNode>) -> Self {
        Self::Container {
            name: name.into(),
            children,
        }
    }

    /// Children of a container; empty for leaves.
    pub fn children(&self) -> &[LayerNode] {
        match self {
            Self::Container { children, .. } => children,
            _ => &[],
        }
    }

    /// True for a container with no children.
    pub fn is_empty_container(&self) -> bool {
        matches!(self, Self::Container { children, .. } if children.is_empty())
    }

    /// Short label used in probe diagnostics.
    pub fn label(&self) -> String {
        match self {
            Self::Conv2d { out_channels } => format!("Conv2d({})", out_channels),
            Self::Linear { out_features } => format!("Linear({})", out_features),
            Self::BatchNorm2d { num_features } => format!("BatchNorm2d({})", num_features),
            Self::Opaque { kind } => (*kind).to_string(),
            Self::Container { name, children } => format!("{}[{}]", name, children.len()),
        }
    }
}

// =============================================================================
// BACKBONE CAPABILITY
// =============================================================================

/// Feature extractor consumed by the open-set head.
pub trait Backbone: Send + Sync {
    /// Backbone identifier used in logs and diagnostics.
    fn name(&self) -> &str;

    /// Feature map `[n, k, h', w']` for an image batch `[n, c, h, w]`.
    ///
    /// `train` selects batch statistics for normalization layers.
    fn forward_t(&self, images: &Tensor, train: bool) -> candle_core::Result<Tensor>;

    /// Sub-layer tree, root first.
    fn layout(&self) -> LayerNode;

    /// Output channel count when the final stage cannot be read off a leaf.
    fn declared_output_dim(&self) -> Option<usize> {
        None
    }
}

// =============================================================================
// CATALOG
// =============================================================================

/// Registered backbone families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum BackboneKind {
    LeNetPlus,
    LeNetGAP,
    ResNet8,
    ResNet18,
    ResNet34,
}

impl BackboneKind {
    /// All registered backbones.
    pub const ALL: [BackboneKind; 5] = [
        Self::LeNetPlus,
        Self::LeNetGAP,
        Self::ResNet8,
        Self::ResNet18,
        Self::ResNet34,
    ];

    /// Catalog name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::LeNetPlus => "LeNetPlus",
            Self::LeNetGAP => "LeNetGAP",
            Self::ResNet8 => "ResNet8",
            Self::ResNet18 => "ResNet18",
            Self::ResNet34 => "ResNet34",
        }
    }

    /// Construct the backbone, registering its parameters under `vb`.
    pub fn build(self, input_channels: usize, vb: VarBuilder) -> OpenSetResult<Box<dyn Backbone>> {
        let backbone: Box<dyn Backbone> = match self {
            Self::LeNetPlus => Box::new(LeNet::new(LeNetVariant::Plus, input_channels, vb)?),
            Self::LeNetGAP => Box::new(LeNet::new(LeNetVariant::Gap, input_channels, vb)?),
            Self::ResNet8 => Box::new(ResNet::new(
                self.as_str(),
                ResNetConfig::resnet8(input_channels),
                vb,
            )?),
            Self::ResNet18 => Box::new(ResNet::new(
                self.as_str(),
                ResNetConfig::resnet18(input_channels),
                vb,
            )?),
            Self::ResNet34 => Box::new(ResNet::new(
                self.as_str(),
                ResNetConfig::resnet34(input_channels),
                vb,
            )?),
        };
        Ok(backbone)
    }
}

impl Default for BackboneKind {
    fn default() -> Self {
        Self::ResNet18
    }
}

impl FromStr for BackboneKind {
    type Err = OpenSetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim();
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str().eq_ignore_ascii_case(wanted))
            .ok_or_else(|| OpenSetError::UnknownBackbone(s.to_string()))
    }
}

impl TryFrom<String> for BackboneKind {
    type Error = OpenSetError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<BackboneKind> for String {
    fn from(kind: BackboneKind) -> Self {
        kind.as_str().to_string()
    }
}

impl fmt::Display for BackboneKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    #[test]
    fn test_catalog_names_parse_case_insensitively() {
        for kind in BackboneKind::ALL {
            assert_eq!(kind.as_str().parse::<BackboneKind>().unwrap(), kind);
            assert_eq!(kind.as_str().to_lowercase().parse::<BackboneKind>().unwrap(), kind);
        }
    }

    #[test]
    fn test_unknown_backbone() {
        let err = "DenseNet121".parse::<BackboneKind>().unwrap_err();
        assert!(matches!(err, OpenSetError::UnknownBackbone(ref name) if name == "DenseNet121"));
    }

    #[test]
    fn test_resnet8_feature_map_shape() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let backbone = BackboneKind::ResNet8.build(3, vb).unwrap();
        let images = Tensor::rand(0f32, 1f32, (2, 3, 32, 32), &Device::Cpu).unwrap();
        let fmap = backbone.forward_t(&images, false).unwrap();
        assert_eq!(fmap.dims(), &[2, 64, 8, 8]);
        assert_eq!(backbone.declared_output_dim(), None);
    }

    #[test]
    fn test_lenet_feature_map_shapes() {
        let device = Device::Cpu;
        let images = Tensor::rand(0f32, 1f32, (3, 3, 28, 28), &device).unwrap();

        let varmap = VarMap::new();
        let plus = BackboneKind::LeNetPlus
            .build(3, VarBuilder::from_varmap(&varmap, DType::F32, &device))
            .unwrap();
        assert_eq!(plus.forward_t(&images, false).unwrap().dims(), &[3, 1152, 1, 1]);
        assert_eq!(plus.declared_output_dim(), Some(1152));

        let varmap = VarMap::new();
        let gap = BackboneKind::LeNetGAP
            .build(3, VarBuilder::from_varmap(&varmap, DType::F32, &device))
            .unwrap();
        assert_eq!(gap.forward_t(&images, false).unwrap().dims(), &[3, 2, 1, 1]);
        assert_eq!(gap.declared_output_dim(), Some(2));
    }

    #[test]
    fn test_lenet_plus_rejects_wrong_spatial_size() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let plus = BackboneKind::LeNetPlus
            .build(3, VarBuilder::from_varmap(&varmap, DType::F32, &device))
            .unwrap();
        let images = Tensor::rand(0f32, 1f32, (1, 3, 32, 32), &device).unwrap();
        assert!(plus.forward_t(&images, false).is_err());
    }

    #[test]
    fn test_layer_node_helpers() {
        let empty = LayerNode::container("shortcut", vec![]);
        assert!(empty.is_empty_container());
        assert!(empty.children().is_empty());
        assert!(!LayerNode::conv(8).is_empty_container());
        assert_eq!(LayerNode::batch_norm(16).label(), "BatchNorm2d(16)");
    }
}
