//! CIFAR-style residual backbones built from basic blocks.
//!
//! Stem: 3x3 conv (stride 1) + batch norm + ReLU. Each stage after the first
//! halves the spatial size. Identity shortcuts are described as empty
//! containers in the layout, matching how the network is assembled.

use candle_core::{Module, ModuleT, Tensor};
use candle_nn::{BatchNorm, BatchNormConfig, Conv2d, Conv2dConfig, VarBuilder};

use super::{Backbone, LayerNode};

/// Stage widths and depths of a residual backbone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResNetConfig {
    pub input_channels: usize,
    pub stage_channels: Vec<usize>,
    pub block_depths: Vec<usize>,
}

impl ResNetConfig {
    /// Three stages of one block each (16, 32, 64 channels).
    pub fn resnet8(input_channels: usize) -> Self {
        Self {
            input_channels,
            stage_channels: vec![16, 32, 64],
            block_depths: vec![1, 1, 1],
        }
    }

    /// Four stages of two blocks each (64 to 512 channels).
    pub fn resnet18(input_channels: usize) -> Self {
        Self {
            input_channels,
            stage_channels: vec![64, 128, 256, 512],
            block_depths: vec![2, 2, 2, 2],
        }
    }

    /// Four stages of 3, 4, 6, 3 blocks (64 to 512 channels).
    pub fn resnet34(input_channels: usize) -> Self {
        Self {
            input_channels,
            stage_channels: vec![64, 128, 256, 512],
            block_depths: vec![3, 4, 6, 3],
        }
    }
}

fn conv3x3(in_c: usize, out_c: usize, stride: usize, vb: VarBuilder) -> candle_core::Result<Conv2d> {
    let cfg = Conv2dConfig {
        padding: 1,
        stride,
        ..Default::default()
    };
    candle_nn::conv2d_no_bias(in_c, out_c, 3, cfg, vb)
}

fn bn(channels: usize, vb: VarBuilder) -> candle_core::Result<BatchNorm> {
    candle_nn::batch_norm(channels, BatchNormConfig::default(), vb)
}

struct BasicBlock {
    conv1: Conv2d,
    bn1: BatchNorm,
    conv2: Conv2d,
    bn2: BatchNorm,
    shortcut: Option<(Conv2d, BatchNorm)>,
    out_channels: usize,
}

impl BasicBlock {
    fn new(in_c: usize, out_c: usize, stride: usize, vb: VarBuilder) -> candle_core::Result<Self> {
        let conv1 = conv3x3(in_c, out_c, stride, vb.pp("conv1"))?;
        let bn1 = bn(out_c, vb.pp("bn1"))?;
        let conv2 = conv3x3(out_c, out_c, 1, vb.pp("conv2"))?;
        let bn2 = bn(out_c, vb.pp("bn2"))?;

        let shortcut = if stride != 1 || in_c != out_c {
            let cfg = Conv2dConfig {
                stride,
                ..Default::default()
            };
            let conv = candle_nn::conv2d_no_bias(in_c, out_c, 1, cfg, vb.pp("shortcut.0"))?;
            let norm = bn(out_c, vb.pp("shortcut.1"))?;
            Some((conv, norm))
        } else {
            None
        };

        Ok(Self {
            conv1,
            bn1,
            conv2,
            bn2,
            shortcut,
            out_channels: out_c,
        })
    }

    fn forward_t(&self, xs: &Tensor, train: bool) -> candle_core::Result<Tensor> {
        let ys = self.conv1.forward(xs)?;
        let ys = self.bn1.forward_t(&ys, train)?.relu()?;
        let ys = self.conv2.forward(&ys)?;
        let ys = self.bn2.forward_t(&ys, train)?;

        let residual = match &self.shortcut {
            Some((conv, norm)) => norm.forward_t(&conv.forward(xs)?, train)?,
            None => xs.clone(),
        };
        (ys + residual)?.relu()
    }

    fn layout(&self) -> LayerNode {
        let c = self.out_channels;
        let shortcut = match self.shortcut {
            Some(_) => vec![LayerNode::conv(c), LayerNode::batch_norm(c)],
            None => Vec::new(),
        };
        LayerNode::container(
            "BasicBlock",
            vec![
                LayerNode::conv(c),
                LayerNode::batch_norm(c),
                LayerNode::conv(c),
                LayerNode::batch_norm(c),
                LayerNode::container("shortcut", shortcut),
            ],
        )
    }
}

/// Residual backbone producing `[n, stage_channels.last(), h/2^(s-1), w/2^(s-1)]`.
pub struct ResNet {
    name: String,
    stem_conv: Conv2d,
    stem_bn: BatchNorm,
    stem_channels: usize,
    stages: Vec<Vec<BasicBlock>>,
}

impl ResNet {
    /// Build a residual backbone; parameters live under `vb`.
    pub fn new(name: &str, config: ResNetConfig, vb: VarBuilder) -> candle_core::Result<Self> {
        if config.stage_channels.is_empty() || config.stage_channels.len() != config.block_depths.len() {
            candle_core::bail!(
                "ResNet needs one depth per stage, got {} stages and {} depths",
                config.stage_channels.len(),
                config.block_depths.len()
            );
        }

        let stem_channels = config.stage_channels[0];
        let stem_conv = conv3x3(config.input_channels, stem_channels, 1, vb.pp("conv1"))?;
        let stem_bn = bn(stem_channels, vb.pp("bn1"))?;

        let mut stages = Vec::with_capacity(config.stage_channels.len());
        let mut in_c = stem_channels;
        for (idx, (&out_c, &depth)) in config
            .stage_channels
            .iter()
            .zip(config.block_depths.iter())
            .enumerate()
        {
            let stage_vb = vb.pp(format!("layer{}", idx + 1));
            let first_stride = if idx == 0 { 1 } else { 2 };
            let mut blocks = Vec::with_capacity(depth);
            for block_idx in 0..depth {
                let stride = if block_idx == 0 { first_stride } else { 1 };
                blocks.push(BasicBlock::new(in_c, out_c, stride, stage_vb.pp(block_idx))?);
                in_c = out_c;
            }
            stages.push(blocks);
        }

        Ok(Self {
            name: name.to_string(),
            stem_conv,
            stem_bn,
            stem_channels,
            stages,
        })
    }
}

impl Backbone for ResNet {
    fn name(&self) -> &str {
        &self.name
    }

    fn forward_t(&self, images: &Tensor, train: bool) -> candle_core::Result<Tensor> {
        let xs = self.stem_conv.forward(images)?;
        let mut xs = self.stem_bn.forward_t(&xs, train)?.relu()?;
        for block in self.stages.iter().flatten() {
            xs = block.forward_t(&xs, train)?;
        }
        Ok(xs)
    }

    fn layout(&self) -> LayerNode {
        let mut children = vec![
            LayerNode::conv(self.stem_channels),
            LayerNode::batch_norm(self.stem_channels),
        ];
        for (idx, blocks) in self.stages.iter().enumerate() {
            children.push(LayerNode::container(
                format!("layer{}", idx + 1),
                blocks.iter().map(BasicBlock::layout).collect(),
            ));
        }
        LayerNode::container(self.name.clone(), children)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    #[test]
    fn test_identity_blocks_have_empty_shortcut() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let net = ResNet::new("ResNet8", ResNetConfig::resnet8(3), vb).unwrap();
        let layout = net.layout();

        // stem conv, stem bn, three stages
        assert_eq!(layout.children().len(), 5);
        let first_block = &layout.children()[2].children()[0];
        assert!(first_block.children()[4].is_empty_container());
        let downsample_block = &layout.children()[3].children()[0];
        assert_eq!(downsample_block.children()[4].children().len(), 2);
    }

    #[test]
    fn test_mismatched_config_rejected() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let config = ResNetConfig {
            input_channels: 3,
            stage_channels: vec![16, 32],
            block_depths: vec![1],
        };
        assert!(ResNet::new("broken", config, vb).is_err());
    }

    #[test]
    fn test_train_mode_forward_shape() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let net = ResNet::new("ResNet8", ResNetConfig::resnet8(3), vb).unwrap();
        let images = Tensor::rand(0f32, 1f32, (4, 3, 16, 16), &Device::Cpu).unwrap();
        let fmap = net.forward_t(&images, true).unwrap();
        assert_eq!(fmap.dims(), &[4, 64, 4, 4]);
    }
}
