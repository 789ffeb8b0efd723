//! Burn image classifiers used by the training stack.
//!
//! The crate defines the ResNet family (18/34 with basic blocks, 50/101/152 with
//! bottleneck blocks) as plain Burn modules. Training and evaluation loops only see
//! them through [`ImageClassifier`], so other architectures can be swapped in without
//! touching the loops.

use burn::module::Module;
use burn::nn::conv::{Conv2d, Conv2dConfig};
use burn::nn::pool::{AdaptiveAvgPool2d, AdaptiveAvgPool2dConfig, MaxPool2d, MaxPool2dConfig};
use burn::nn::{BatchNorm, BatchNormConfig, Linear, LinearConfig, PaddingConfig2d};
use burn::tensor::activation::relu;
use burn::tensor::backend::Backend;
use burn::tensor::Tensor;

/// A network mapping an image batch `[batch, channels, height, width]` to class logits
/// `[batch, num_classes]`.
pub trait ImageClassifier<B: Backend> {
    fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2>;
    fn num_classes(&self) -> usize;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResNetDepth {
    R18,
    R34,
    R50,
    R101,
    R152,
}

impl ResNetDepth {
    /// Residual blocks per stage.
    pub fn layers(&self) -> [usize; 4] {
        match self {
            ResNetDepth::R18 => [2, 2, 2, 2],
            ResNetDepth::R34 | ResNetDepth::R50 => [3, 4, 6, 3],
            ResNetDepth::R101 => [3, 4, 23, 3],
            ResNetDepth::R152 => [3, 8, 36, 3],
        }
    }

    pub fn uses_bottleneck(&self) -> bool {
        !matches!(self, ResNetDepth::R18 | ResNetDepth::R34)
    }

    /// Output channel multiplier of a block relative to its stage width.
    pub fn expansion(&self) -> usize {
        if self.uses_bottleneck() {
            4
        } else {
            1
        }
    }
}

#[derive(Debug, Clone)]
pub struct ResNetConfig {
    pub depth: ResNetDepth,
    pub num_classes: usize,
    pub in_channels: usize,
}

impl Default for ResNetConfig {
    fn default() -> Self {
        Self {
            depth: ResNetDepth::R50,
            num_classes: 1000,
            in_channels: 3,
        }
    }
}

impl ResNetConfig {
    pub fn new(depth: ResNetDepth, num_classes: usize) -> Self {
        Self {
            depth,
            num_classes,
            ..Default::default()
        }
    }

    pub fn init<B: Backend>(&self, device: &B::Device) -> ResNet<B> {
        ResNet::new(self, device)
    }
}

/// 1x1 conv + batch norm projection used when a block changes resolution or width.
#[derive(Debug, Module)]
pub struct Downsample<B: Backend> {
    conv: Conv2d<B>,
    bn: BatchNorm<B, 2>,
}

impl<B: Backend> Downsample<B> {
    fn new(in_channels: usize, out_channels: usize, stride: usize, device: &B::Device) -> Self {
        Self {
            conv: Conv2dConfig::new([in_channels, out_channels], [1, 1])
                .with_stride([stride, stride])
                .with_bias(false)
                .init(device),
            bn: BatchNormConfig::new(out_channels).init(device),
        }
    }

    fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        self.bn.forward(self.conv.forward(x))
    }
}

/// Residual block. Basic blocks use two 3x3 convs; bottleneck blocks use 1x1 → 3x3 → 1x1
/// and carry the third conv/norm pair. The stride sits on the 3x3 conv in both cases.
#[derive(Debug, Module)]
pub struct ResidualBlock<B: Backend> {
    conv1: Conv2d<B>,
    bn1: BatchNorm<B, 2>,
    conv2: Conv2d<B>,
    bn2: BatchNorm<B, 2>,
    conv3: Option<Conv2d<B>>,
    bn3: Option<BatchNorm<B, 2>>,
    downsample: Option<Downsample<B>>,
}

impl<B: Backend> ResidualBlock<B> {
    fn basic(in_channels: usize, width: usize, stride: usize, device: &B::Device) -> Self {
        let downsample = (stride != 1 || in_channels != width)
            .then(|| Downsample::new(in_channels, width, stride, device));
        Self {
            conv1: conv3x3(in_channels, width, stride, device),
            bn1: BatchNormConfig::new(width).init(device),
            conv2: conv3x3(width, width, 1, device),
            bn2: BatchNormConfig::new(width).init(device),
            conv3: None,
            bn3: None,
            downsample,
        }
    }

    fn bottleneck(in_channels: usize, width: usize, stride: usize, device: &B::Device) -> Self {
        let out_channels = width * 4;
        let downsample = (stride != 1 || in_channels != out_channels)
            .then(|| Downsample::new(in_channels, out_channels, stride, device));
        Self {
            conv1: conv1x1(in_channels, width, device),
            bn1: BatchNormConfig::new(width).init(device),
            conv2: conv3x3(width, width, stride, device),
            bn2: BatchNormConfig::new(width).init(device),
            conv3: Some(conv1x1(width, out_channels, device)),
            bn3: Some(BatchNormConfig::new(out_channels).init(device)),
            downsample,
        }
    }

    pub fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        let identity = match &self.downsample {
            Some(down) => down.forward(input.clone()),
            None => input.clone(),
        };

        let x = relu(self.bn1.forward(self.conv1.forward(input)));
        let x = self.bn2.forward(self.conv2.forward(x));
        let x = match (&self.conv3, &self.bn3) {
            (Some(conv3), Some(bn3)) => bn3.forward(conv3.forward(relu(x))),
            _ => x,
        };

        relu(x + identity)
    }
}

#[derive(Debug, Module)]
pub struct ResNet<B: Backend> {
    conv1: Conv2d<B>,
    bn1: BatchNorm<B, 2>,
    maxpool: MaxPool2d,
    stages: Vec<Vec<ResidualBlock<B>>>,
    avgpool: AdaptiveAvgPool2d,
    fc: Linear<B>,
    num_classes: usize,
}

impl<B: Backend> ResNet<B> {
    pub fn new(cfg: &ResNetConfig, device: &B::Device) -> Self {
        let num_classes = cfg.num_classes.max(1);
        let conv1 = Conv2dConfig::new([cfg.in_channels, 64], [7, 7])
            .with_stride([2, 2])
            .with_padding(PaddingConfig2d::Explicit(3, 3))
            .with_bias(false)
            .init(device);
        let bn1 = BatchNormConfig::new(64).init(device);
        let maxpool = MaxPool2dConfig::new([3, 3])
            .with_strides([2, 2])
            .with_padding(PaddingConfig2d::Explicit(1, 1))
            .init();

        let expansion = cfg.depth.expansion();
        let mut in_channels = 64;
        let mut stages = Vec::with_capacity(4);
        for (stage_idx, (&blocks, width)) in cfg
            .depth
            .layers()
            .iter()
            .zip([64usize, 128, 256, 512])
            .enumerate()
        {
            let mut stage = Vec::with_capacity(blocks);
            for block_idx in 0..blocks {
                let stride = if stage_idx > 0 && block_idx == 0 { 2 } else { 1 };
                let block = if cfg.depth.uses_bottleneck() {
                    ResidualBlock::bottleneck(in_channels, width, stride, device)
                } else {
                    ResidualBlock::basic(in_channels, width, stride, device)
                };
                in_channels = width * expansion;
                stage.push(block);
            }
            stages.push(stage);
        }

        Self {
            conv1,
            bn1,
            maxpool,
            stages,
            avgpool: AdaptiveAvgPool2dConfig::new([1, 1]).init(),
            fc: LinearConfig::new(512 * expansion, num_classes).init(device),
            num_classes,
        }
    }

    /// Pooled features before the classification head, shape `[batch, 512 * expansion]`.
    pub fn features(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        let x = relu(self.bn1.forward(self.conv1.forward(images)));
        let mut x = self.maxpool.forward(x);
        for stage in &self.stages {
            for block in stage {
                x = block.forward(x);
            }
        }
        self.avgpool.forward(x).flatten::<2>(1, 3)
    }
}

impl<B: Backend> ImageClassifier<B> for ResNet<B> {
    fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        self.fc.forward(self.features(images))
    }

    fn num_classes(&self) -> usize {
        self.num_classes
    }
}

fn conv3x3<B: Backend>(
    in_channels: usize,
    out_channels: usize,
    stride: usize,
    device: &B::Device,
) -> Conv2d<B> {
    Conv2dConfig::new([in_channels, out_channels], [3, 3])
        .with_stride([stride, stride])
        .with_padding(PaddingConfig2d::Explicit(1, 1))
        .with_bias(false)
        .init(device)
}

fn conv1x1<B: Backend>(in_channels: usize, out_channels: usize, device: &B::Device) -> Conv2d<B> {
    Conv2dConfig::new([in_channels, out_channels], [1, 1])
        .with_bias(false)
        .init(device)
}

pub mod prelude {
    pub use super::{ImageClassifier, ResNet, ResNetConfig, ResNetDepth};
}
