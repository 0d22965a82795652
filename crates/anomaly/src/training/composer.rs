//! Loss composition policies: how a batch and a model become one scalar
//! objective plus named component values for logging.

use burn::prelude::*;
use cohort::Batch;

use crate::model::bridge::{batch_images, batch_views, tensor_to_f64, view_labels};
use crate::model::contract::{select_layer, ContrastiveModel, FeatureModel};
use crate::training::loss::{
    attention_entropy, bce_with_logits_sum, classification_loss, kl_divergence, simclr_loss,
};

/// Objective to differentiate plus the scalar value of every component.
#[derive(Debug)]
pub struct LossOutput<B: Backend> {
    pub objective: Tensor<B, 1>,
    /// `(name, value)` pairs, in a fixed order per policy.
    pub components: Vec<(String, f64)>,
}

/// A training regime's loss.
pub trait LossComposer<B: Backend, M> {
    fn compose(
        &self,
        model: &M,
        batch: &Batch,
        device: &B::Device,
    ) -> anyhow::Result<LossOutput<B>>;
}

/// Configuration for the contrastive pretext loss.
#[derive(Config, Debug)]
pub struct ContrastiveLossConfig {
    /// NT-Xent similarity temperature.
    #[config(default = 0.2)]
    pub temperature: f64,
    /// Drop the rotation-classification term entirely.
    #[config(default = false)]
    pub only_simclr: bool,
}

/// NT-Xent over both views, plus rotation cross-entropy unless `only_simclr`.
#[derive(Debug, Clone)]
pub struct ContrastiveComposer {
    config: ContrastiveLossConfig,
}

impl ContrastiveComposer {
    pub fn new(config: ContrastiveLossConfig) -> Self {
        Self { config }
    }
}

impl<B: Backend, M: ContrastiveModel<B>> LossComposer<B, M> for ContrastiveComposer {
    fn compose(
        &self,
        model: &M,
        batch: &Batch,
        device: &B::Device,
    ) -> anyhow::Result<LossOutput<B>> {
        let b = batch.len();
        let views = batch_views::<B>(batch, device)?;
        let out = model.forward_contrastive(views);
        let [_, d] = out.projection.dims();

        let contrastive = simclr_loss(out.projection.reshape([b, 2, d]), self.config.temperature);
        let contrastive_val = tensor_to_f64(contrastive.clone());

        if self.config.only_simclr {
            return Ok(LossOutput {
                objective: contrastive,
                components: vec![("contrastive".to_string(), contrastive_val)],
            });
        }

        let targets = view_labels::<B>(batch, device)?;
        let classification = classification_loss(out.logits, targets);
        let classification_val = tensor_to_f64(classification.clone());
        let total = contrastive + classification;
        let total_val = tensor_to_f64(total.clone());

        Ok(LossOutput {
            objective: total,
            components: vec![
                ("contrastive".to_string(), contrastive_val),
                ("classification".to_string(), classification_val),
                ("total".to_string(), total_val),
            ],
        })
    }
}

/// Configuration for the reconstruction + attention-entropy loss.
#[derive(Config, Debug)]
pub struct ReconstructionLossConfig {
    /// Weight of the KL term.
    #[config(default = 10.0)]
    pub wkl: f64,
    /// Weight of the attention-entropy term.
    #[config(default = 0.1)]
    pub w_entropy: f64,
    /// Feature layer offset for the attention map; negative counts from the
    /// deepest layer.
    #[config(default = "-4")]
    pub level_cams: isize,
}

/// VAE reconstruction + weighted KL + weighted attention entropy.
#[derive(Debug, Clone)]
pub struct ReconstructionComposer {
    config: ReconstructionLossConfig,
}

impl ReconstructionComposer {
    pub fn new(config: ReconstructionLossConfig) -> Self {
        Self { config }
    }
}

impl<B: Backend, M: FeatureModel<B>> LossComposer<B, M> for ReconstructionComposer {
    fn compose(
        &self,
        model: &M,
        batch: &Batch,
        device: &B::Device,
    ) -> anyhow::Result<LossOutput<B>> {
        let [_, _, h, w] = batch.shape;
        let images = batch_images::<B>(batch, device);
        let out = model.forward_features(images.clone());
        let posterior = out
            .posterior
            .ok_or_else(|| anyhow::anyhow!("Reconstruction loss needs a model with a posterior"))?;

        let reconstruction = bce_with_logits_sum(out.output, images);
        let kl = kl_divergence(posterior.mu, posterior.logvar);
        let layer = select_layer(out.features, self.config.level_cams)?;
        let entropy = attention_entropy(layer, [h, w]);

        let reconstruction_val = tensor_to_f64(reconstruction.clone());
        let kl_val = tensor_to_f64(kl.clone());
        let entropy_val = tensor_to_f64(entropy.clone());

        let total = reconstruction
            + kl.mul_scalar(self.config.wkl)
            + entropy.mul_scalar(self.config.w_entropy);
        let total_val = tensor_to_f64(total.clone());

        Ok(LossOutput {
            objective: total,
            components: vec![
                ("reconstruction".to_string(), reconstruction_val),
                ("kl".to_string(), kl_val),
                ("entropy".to_string(), entropy_val),
                ("total".to_string(), total_val),
            ],
        })
    }
}
