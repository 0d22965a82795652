use burn::nn::conv::{Conv2d, Conv2dConfig};
use burn::nn::PaddingConfig2d;
use burn::prelude::*;

/// Configuration for the strided convolutional encoder shared by both
/// reference models.
///
/// ```text
/// (B, C, S, S)
///   → [Conv3x3 stride 2 → ReLU] × depth, channels base·2^i
///   → features: (B, base, S/2, S/2), …, (B, base·2^(depth-1), S/2^depth, S/2^depth)
/// ```
#[derive(Config, Debug)]
pub struct ConvEncoderConfig {
    /// Input image channels.
    pub in_channels: usize,
    /// Channels of the first block; doubled at every block.
    #[config(default = 8)]
    pub base_channels: usize,
    /// Number of stride-2 blocks.
    #[config(default = 4)]
    pub depth: usize,
}

#[derive(Module, Debug)]
pub struct ConvEncoder<B: Backend> {
    blocks: Vec<Conv2d<B>>,
}

impl ConvEncoderConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> ConvEncoder<B> {
        let mut blocks = Vec::with_capacity(self.depth);
        let mut in_ch = self.in_channels;
        for i in 0..self.depth {
            let out_ch = self.base_channels << i;
            blocks.push(
                Conv2dConfig::new([in_ch, out_ch], [3, 3])
                    .with_stride([2, 2])
                    .with_padding(PaddingConfig2d::Explicit(1, 1))
                    .init(device),
            );
            in_ch = out_ch;
        }
        ConvEncoder { blocks }
    }

    /// Channels of the deepest block.
    pub fn out_channels(&self) -> usize {
        self.base_channels << self.depth.saturating_sub(1)
    }

    /// Spatial side of the deepest block for a square input of `image_size`.
    pub fn out_size(&self, image_size: usize) -> usize {
        image_size >> self.depth
    }
}

impl<B: Backend> ConvEncoder<B> {
    /// All block activations, shallowest first.
    pub fn forward(&self, x: Tensor<B, 4>) -> Vec<Tensor<B, 4>> {
        let mut features = Vec::with_capacity(self.blocks.len());
        let mut h = x;
        for block in &self.blocks {
            h = burn::tensor::activation::relu(block.forward(h));
            features.push(h.clone());
        }
        features
    }
}
