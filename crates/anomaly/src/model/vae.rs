use burn::nn::conv::{ConvTranspose2d, ConvTranspose2dConfig};
use burn::nn::{Linear, LinearConfig};
use burn::prelude::*;
use burn::tensor::Distribution;

use crate::model::contract::{FeatureModel, ModelOutput, Posterior};
use crate::model::encoder::{ConvEncoder, ConvEncoderConfig};

/// Configuration for the convolutional VAE used by the reconstruction regime.
///
/// ```text
/// (B, C, S, S)
///   → ConvEncoder (features f₁…f_depth)
///   → flatten → Linear → μ, log σ²        (B, latent)
///   → z = μ + ε·exp(½ log σ²)
///   → Linear → (B, c_top, S/2^depth, S/2^depth)
///   → [ConvTranspose 4x4 stride 2 → ReLU] × (depth-1) → ConvTranspose → logits (B, C, S, S)
/// ```
///
/// `image_size` must be divisible by `2^depth`.
#[derive(Config, Debug)]
pub struct ConvVaeConfig {
    /// Input channels (1 grayscale, 3 RGB).
    pub in_channels: usize,
    /// Square input side length.
    pub image_size: usize,
    #[config(default = 8)]
    pub base_channels: usize,
    #[config(default = 4)]
    pub depth: usize,
    /// Latent dimension.
    #[config(default = 32)]
    pub latent_dim: usize,
}

#[derive(Module, Debug)]
pub struct ConvVae<B: Backend> {
    encoder: ConvEncoder<B>,
    fc_mu: Linear<B>,
    fc_logvar: Linear<B>,
    fc_decode: Linear<B>,
    decoder: Vec<ConvTranspose2d<B>>,
    top_channels: usize,
    top_size: usize,
}

impl ConvVaeConfig {
    fn encoder_config(&self) -> ConvEncoderConfig {
        ConvEncoderConfig::new(self.in_channels)
            .with_base_channels(self.base_channels)
            .with_depth(self.depth)
    }

    pub fn init<B: Backend>(&self, device: &B::Device) -> ConvVae<B> {
        let enc = self.encoder_config();
        let top_channels = enc.out_channels();
        let top_size = enc.out_size(self.image_size).max(1);
        let flat = top_channels * top_size * top_size;

        let mut decoder = Vec::with_capacity(self.depth);
        let mut in_ch = top_channels;
        for i in (0..self.depth).rev() {
            let out_ch = if i == 0 {
                self.in_channels
            } else {
                self.base_channels << (i - 1)
            };
            decoder.push(
                ConvTranspose2dConfig::new([in_ch, out_ch], [4, 4])
                    .with_stride([2, 2])
                    .with_padding([1, 1])
                    .init(device),
            );
            in_ch = out_ch;
        }

        ConvVae {
            encoder: enc.init(device),
            fc_mu: LinearConfig::new(flat, self.latent_dim).init(device),
            fc_logvar: LinearConfig::new(flat, self.latent_dim).init(device),
            fc_decode: LinearConfig::new(self.latent_dim, flat).init(device),
            decoder,
            top_channels,
            top_size,
        }
    }
}

impl<B: Backend> ConvVae<B> {
    /// Decode latent codes into reconstruction logits.
    pub fn decode(&self, z: Tensor<B, 2>) -> Tensor<B, 4> {
        let [batch, _] = z.dims();
        let mut h = self
            .fc_decode
            .forward(z)
            .reshape([batch, self.top_channels, self.top_size, self.top_size]);
        let last = self.decoder.len().saturating_sub(1);
        for (i, layer) in self.decoder.iter().enumerate() {
            h = layer.forward(h);
            if i < last {
                h = burn::tensor::activation::relu(h);
            }
        }
        h
    }
}

impl<B: Backend> FeatureModel<B> for ConvVae<B> {
    fn forward_features(&self, images: Tensor<B, 4>) -> ModelOutput<B> {
        let device = images.device();
        let features = self.encoder.forward(images.clone());
        let top = features.last().cloned().unwrap_or(images);
        let flat: Tensor<B, 2> = top.flatten(1, 3);

        let mu = self.fc_mu.forward(flat.clone());
        let logvar = self.fc_logvar.forward(flat);
        let eps = Tensor::<B, 2>::random(mu.dims(), Distribution::Normal(0.0, 1.0), &device);
        let z = mu.clone() + eps * logvar.clone().mul_scalar(0.5).exp();

        ModelOutput {
            output: self.decode(z),
            features,
            posterior: Some(Posterior { mu, logvar }),
        }
    }
}
