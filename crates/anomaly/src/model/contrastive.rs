use burn::nn::{Linear, LinearConfig};
use burn::prelude::*;

use crate::model::contract::{ContrastiveModel, ContrastiveOutput, FeatureModel, ModelOutput};
use crate::model::encoder::{ConvEncoder, ConvEncoderConfig};

/// Configuration for the contrastive network used by the pretext regime.
///
/// ```text
/// (N, C, S, S)
///   → ConvEncoder → global average pool          (N, c_top)
///   ├→ Linear → ReLU → Linear → L2-normalise     projection (N, proj_dim)
///   └→ Linear                                    logits (N, num_classes)
/// ```
#[derive(Config, Debug)]
pub struct ContrastiveNetConfig {
    /// Input channels.
    pub in_channels: usize,
    /// Number of pretext classes.
    #[config(default = 2)]
    pub num_classes: usize,
    #[config(default = 8)]
    pub base_channels: usize,
    #[config(default = 4)]
    pub depth: usize,
    /// Hidden width of the projection head.
    #[config(default = 128)]
    pub proj_hidden: usize,
    /// Output dimension of the projection head.
    #[config(default = 64)]
    pub proj_dim: usize,
}

#[derive(Module, Debug)]
pub struct ContrastiveNet<B: Backend> {
    encoder: ConvEncoder<B>,
    proj1: Linear<B>,
    proj2: Linear<B>,
    classifier: Linear<B>,
}

impl ContrastiveNetConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> ContrastiveNet<B> {
        let enc = ConvEncoderConfig::new(self.in_channels)
            .with_base_channels(self.base_channels)
            .with_depth(self.depth);
        let top = enc.out_channels();
        ContrastiveNet {
            encoder: enc.init(device),
            proj1: LinearConfig::new(top, self.proj_hidden).init(device),
            proj2: LinearConfig::new(self.proj_hidden, self.proj_dim).init(device),
            classifier: LinearConfig::new(top, self.num_classes).init(device),
        }
    }
}

impl<B: Backend> ContrastiveNet<B> {
    fn pooled(&self, features: &[Tensor<B, 4>], images: Tensor<B, 4>) -> Tensor<B, 2> {
        let top = features.last().cloned().unwrap_or(images);
        let [n, c, _, _] = top.dims();
        top.mean_dim(3).mean_dim(2).reshape([n, c])
    }
}

/// Row-wise L2 normalisation of `(N, d)`.
pub fn l2_normalize<B: Backend>(x: Tensor<B, 2>) -> Tensor<B, 2> {
    let norm = x.clone().powf_scalar(2.0).sum_dim(1).sqrt().clamp_min(1e-12);
    x / norm
}

impl<B: Backend> ContrastiveModel<B> for ContrastiveNet<B> {
    fn forward_contrastive(&self, images: Tensor<B, 4>) -> ContrastiveOutput<B> {
        let features = self.encoder.forward(images.clone());
        let pooled = self.pooled(&features, images);

        let h = burn::tensor::activation::relu(self.proj1.forward(pooled.clone()));
        let projection = l2_normalize(self.proj2.forward(h));
        let logits = self.classifier.forward(pooled);
        ContrastiveOutput { projection, logits }
    }
}

impl<B: Backend> FeatureModel<B> for ContrastiveNet<B> {
    /// Encoder features; the primary output is the deepest feature map.
    fn forward_features(&self, images: Tensor<B, 4>) -> ModelOutput<B> {
        let features = self.encoder.forward(images.clone());
        let output = features.last().cloned().unwrap_or(images);
        ModelOutput {
            output,
            features,
            posterior: None,
        }
    }
}
