//! LeNet++ style backbones for 28x28 inputs.
//!
//! Trunk: three stages of two 5x5 convs (32, 64, 128 channels), each conv
//! followed by a per-channel PReLU, each stage closed by 2x2 max pooling.
//! A 28x28 input leaves a 128x3x3 map. The two variants differ only in the
//! final stage, which is why they declare their width instead of relying on
//! the structural walk.

use candle_core::{Module, Tensor, D};
use candle_nn::{Conv2d, Conv2dConfig, Linear, PReLU, VarBuilder};

use super::{Backbone, LayerNode};

const STAGE_CHANNELS: [usize; 3] = [32, 64, 128];
const FINAL_HW: usize = 3;
const GAP_PROJECTION_DIM: usize = 2;

/// Final stage of a LeNet backbone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeNetVariant {
    /// Flatten the 128x3x3 map into a 1152-channel 1x1 map.
    Plus,
    /// Global average pool, then project to 2 channels.
    Gap,
}

/// LeNet++ trunk with a variant-specific final stage.
pub struct LeNet {
    variant: LeNetVariant,
    convs: Vec<(Conv2d, PReLU)>,
    projection: Option<Linear>,
}

impl LeNet {
    /// Build the backbone; parameters live under `vb`.
    pub fn new(variant: LeNetVariant, input_channels: usize, vb: VarBuilder) -> candle_core::Result<Self> {
        let mut convs = Vec::with_capacity(STAGE_CHANNELS.len() * 2);
        let mut in_c = input_channels;
        for (stage, &out_c) in STAGE_CHANNELS.iter().enumerate() {
            for half in 1..=2 {
                let name = format!("conv{}_{}", stage + 1, half);
                let cfg = Conv2dConfig {
                    padding: 2,
                    ..Default::default()
                };
                let conv = candle_nn::conv2d(in_c, out_c, 5, cfg, vb.pp(&name))?;
                let act = candle_nn::prelu(Some(out_c), vb.pp(format!("prelu{}_{}", stage + 1, half)))?;
                convs.push((conv, act));
                in_c = out_c;
            }
        }

        let projection = match variant {
            LeNetVariant::Plus => None,
            LeNetVariant::Gap => Some(candle_nn::linear(
                in_c,
                GAP_PROJECTION_DIM,
                vb.pp("projection"),
            )?),
        };

        Ok(Self {
            variant,
            convs,
            projection,
        })
    }

    fn trunk_width() -> usize {
        STAGE_CHANNELS[STAGE_CHANNELS.len() - 1]
    }
}

impl Backbone for LeNet {
    fn name(&self) -> &str {
        match self.variant {
            LeNetVariant::Plus => "LeNetPlus",
            LeNetVariant::Gap => "LeNetGAP",
        }
    }

    fn forward_t(&self, images: &Tensor, _train: bool) -> candle_core::Result<Tensor> {
        let mut xs = images.clone();
        for pair in self.convs.chunks(2) {
            for (conv, act) in pair {
                xs = act.forward(&conv.forward(&xs)?)?;
            }
            xs = xs.max_pool2d(2)?;
        }

        let n = xs.dim(0)?;
        match (&self.variant, &self.projection) {
            (LeNetVariant::Gap, Some(projection)) => {
                let pooled = xs.mean(D::Minus1)?.mean(D::Minus1)?;
                projection
                    .forward(&pooled)?
                    .reshape((n, GAP_PROJECTION_DIM, 1, 1))
            }
            _ => xs.reshape((n, Self::trunk_width() * FINAL_HW * FINAL_HW, 1, 1)),
        }
    }

    fn layout(&self) -> LayerNode {
        let mut children = Vec::new();
        for (idx, pair) in self.convs.chunks(2).enumerate() {
            let width = STAGE_CHANNELS[idx];
            for _ in pair {
                children.push(LayerNode::conv(width));
                children.push(LayerNode::opaque("PReLU"));
            }
            children.push(LayerNode::opaque("MaxPool2d"));
        }
        match self.variant {
            LeNetVariant::Plus => children.push(LayerNode::opaque("Flatten")),
            LeNetVariant::Gap => {
                children.push(LayerNode::opaque("AdaptiveAvgPool2d"));
                children.push(LayerNode::linear(GAP_PROJECTION_DIM));
            }
        }
        LayerNode::container(self.name(), children)
    }

    fn declared_output_dim(&self) -> Option<usize> {
        Some(match self.variant {
            LeNetVariant::Plus => Self::trunk_width() * FINAL_HW * FINAL_HW,
            LeNetVariant::Gap => GAP_PROJECTION_DIM,
        })
    }
}
