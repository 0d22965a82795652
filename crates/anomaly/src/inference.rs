//! Anomaly maps and per-image anomaly scores.
//!
//! The map is the channel mean of one feature layer, bilinearly upsampled
//! (aligned corners) to the input size. How a map becomes one score is an
//! [`AggregationPolicy`] resolved once from the data configuration.

use burn::prelude::*;
use cohort::{Batch, DataConfig, Modality};

use crate::model::bridge::{batch_images, tensor_to_vec};
use crate::model::contract::{select_layer, FeatureModel};
use crate::training::loss::upsample_bilinear;

/// Map → score reduction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregationPolicy {
    /// Maximum over foreground pixels (image value above the image minimum).
    /// With `rebase`, the foreground minimum is subtracted first.
    ForegroundMax { rebase: bool },
    /// Unmasked maximum.
    Max,
    /// Unmasked mean.
    Mean,
}

impl AggregationPolicy {
    /// MRI and CT use the foreground maximum, RF/DDR the plain maximum,
    /// everything else the mean.
    pub fn resolve(modality: Modality, dataset: &str, get_images: bool) -> Self {
        match modality {
            Modality::Mri | Modality::Ct => Self::ForegroundMax { rebase: get_images },
            Modality::Rf if dataset == "DDR" => Self::Max,
            _ => Self::Mean,
        }
    }

    pub fn from_config(config: &DataConfig, get_images: bool) -> Self {
        Self::resolve(config.modality, &config.dataset, get_images)
    }
}

/// Reduce one image's anomaly map to a score.
///
/// `map` is the `(H, W)` anomaly map; `image` is the `(C, H, W)` input used to
/// find the foreground. An image without foreground scores 0.
pub fn aggregate(policy: AggregationPolicy, map: &[f32], image: &[f32], channels: usize) -> f64 {
    match policy {
        AggregationPolicy::Mean => {
            if map.is_empty() {
                return 0.0;
            }
            map.iter().map(|&v| v as f64).sum::<f64>() / map.len() as f64
        }
        AggregationPolicy::Max => map
            .iter()
            .map(|&v| v as f64)
            .fold(None, |acc: Option<f64>, v| Some(acc.map_or(v, |a| a.max(v))))
            .unwrap_or(0.0),
        AggregationPolicy::ForegroundMax { rebase } => {
            let fg = foreground(image, channels, map.len());
            let values: Vec<f64> = map
                .iter()
                .zip(&fg)
                .filter(|(_, &is_fg)| is_fg)
                .map(|(&v, _)| v as f64)
                .collect();
            if values.is_empty() {
                return 0.0;
            }
            let max = values.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
            if rebase {
                let min = values.iter().cloned().fold(f64::INFINITY, f64::min);
                max - min
            } else {
                max
            }
        }
    }
}

/// Pixel mask of values (max over channels) strictly above the image minimum.
pub fn foreground(image: &[f32], channels: usize, pixels: usize) -> Vec<bool> {
    let channels = channels.max(1);
    let projected: Vec<f32> = (0..pixels)
        .map(|p| {
            (0..channels)
                .map(|c| image[c * pixels + p])
                .fold(f32::NEG_INFINITY, f32::max)
        })
        .collect();
    let min = projected.iter().cloned().fold(f32::INFINITY, f32::min);
    projected.iter().map(|&v| v > min).collect()
}

/// Turns model features into anomaly maps and scores.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AnomalyScorer {
    /// Feature layer offset; negative counts from the deepest layer.
    pub level: isize,
    pub policy: AggregationPolicy,
}

impl AnomalyScorer {
    pub fn new(level: isize, policy: AggregationPolicy) -> Self {
        Self { level, policy }
    }

    /// `(B, 1, H, W)` anomaly map for `(B, C, H, W)` images.
    ///
    /// Under [`AggregationPolicy::ForegroundMax`] background pixels are zero
    /// and, with `rebase`, the foreground minimum is subtracted.
    pub fn anomaly_map<B: Backend, M: FeatureModel<B>>(
        &self,
        model: &M,
        images: Tensor<B, 4>,
    ) -> anyhow::Result<Tensor<B, 4>> {
        let [_, _, h, w] = images.dims();
        let out = model.forward_features(images.clone());
        let layer = select_layer(out.features, self.level)?;
        let map = upsample_bilinear(layer.mean_dim(1), [h, w]);
        Ok(match self.policy {
            AggregationPolicy::ForegroundMax { rebase } => {
                restrict_to_foreground(map, images, rebase)
            }
            _ => map,
        })
    }

    /// One score per image of `batch`, in batch order.
    pub fn score_batch<B: Backend, M: FeatureModel<B>>(
        &self,
        model: &M,
        batch: &Batch,
        device: &B::Device,
    ) -> anyhow::Result<Vec<f64>> {
        Ok(self.score_batch_with_maps(model, batch, device)?.0)
    }

    /// Scores plus the flattened `(B, 1, H, W)` anomaly maps they came from.
    pub fn score_batch_with_maps<B: Backend, M: FeatureModel<B>>(
        &self,
        model: &M,
        batch: &Batch,
        device: &B::Device,
    ) -> anyhow::Result<(Vec<f64>, Vec<f32>)> {
        let [b, c, h, w] = batch.shape;
        let map = self.anomaly_map(model, batch_images::<B>(batch, device))?;
        let map = tensor_to_vec(map)?;
        let plane = h * w;
        let scores = (0..b)
            .map(|i| {
                let m = &map[i * plane..(i + 1) * plane];
                let img = &batch.images[i * c * plane..(i + 1) * c * plane];
                aggregate(self.policy, m, img, c)
            })
            .collect();
        Ok((scores, map))
    }
}

/// Zero `(B, 1, H, W)` map pixels outside each image's foreground, optionally
/// shifting the foreground so its minimum is 0.
pub fn restrict_to_foreground<B: Backend>(
    map: Tensor<B, 4>,
    images: Tensor<B, 4>,
    rebase: bool,
) -> Tensor<B, 4> {
    let [b, _, h, w] = images.dims();
    let projected = images.max_dim(1);
    let image_min = projected.clone().reshape([b, h * w]).min_dim(1).reshape([b, 1, 1, 1]);
    let background = projected.sub(image_min).lower_equal_elem(0.0);

    let map = map.mask_fill(background.clone(), 0.0);
    if !rebase {
        return map;
    }
    let fg_min = map
        .clone()
        .mask_fill(background.clone(), f32::MAX)
        .reshape([b, h * w])
        .min_dim(1)
        .reshape([b, 1, 1, 1]);
    map.sub(fg_min).mask_fill(background, 0.0)
}
