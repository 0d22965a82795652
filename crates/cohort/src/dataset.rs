//! Indexable sample providers over partitions.

use std::path::PathBuf;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::error::{CohortError, CohortResult};
use crate::partition::{Partition, SampleRef, TestGroup};
use crate::transform::{ImageTensor, ImageTransform};

/// One transformed sample.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    /// `(C, S, S)` image.
    pub image: ImageTensor,
    /// `(1, S, S)` binary mask (test data only).
    pub mask: Option<ImageTensor>,
    /// Class label, or pretext target for contrastive data.
    pub label: Option<i64>,
    /// Second view of the same image (contrastive data only).
    pub augmented: Option<ImageTensor>,
}

/// Indexable collection of samples shared read-only across loader workers.
pub trait SampleProvider: Send + Sync {
    /// Number of samples.
    fn len(&self) -> usize;

    /// Load and transform sample `idx`.
    ///
    /// # Errors
    /// [`CohortError::IndexOutOfBounds`] for `idx >= len()`, or the decode
    /// error of the underlying image.
    fn get(&self, idx: usize) -> CohortResult<Sample>;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Human-readable name for logging.
    fn name(&self) -> &str;
}

fn check_index(idx: usize, len: usize) -> CohortResult<()> {
    if idx >= len {
        return Err(CohortError::IndexOutOfBounds { index: idx, len });
    }
    Ok(())
}

/// Normal training/validation images. Every sample has label 0.
#[derive(Debug, Clone)]
pub struct NormalDataset {
    name: String,
    paths: Vec<PathBuf>,
    transform: ImageTransform,
}

impl NormalDataset {
    pub fn new(partition: &Partition, transform: ImageTransform) -> Self {
        Self {
            name: partition.name.clone(),
            paths: partition.paths().cloned().collect(),
            transform,
        }
    }
}

impl SampleProvider for NormalDataset {
    fn len(&self) -> usize {
        self.paths.len()
    }

    fn get(&self, idx: usize) -> CohortResult<Sample> {
        check_index(idx, self.paths.len())?;
        Ok(Sample {
            image: self.transform.load(&self.paths[idx])?,
            mask: None,
            label: Some(0),
            augmented: None,
        })
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Mixed normal + anomalous test images with labels and synthetic masks.
///
/// Normal samples come first, anomalous samples after. Label 1 gets the
/// diagonal mask, label 0 an all-zero mask.
#[derive(Debug, Clone)]
pub struct AnomalDataset {
    name: String,
    samples: Vec<SampleRef>,
    transform: ImageTransform,
}

impl AnomalDataset {
    pub fn new(name: impl Into<String>, group: &TestGroup, transform: ImageTransform) -> Self {
        Self {
            name: name.into(),
            samples: group.samples(),
            transform,
        }
    }

    /// Labels in sample order.
    pub fn labels(&self) -> Vec<i64> {
        self.samples.iter().map(|s| s.label.as_index()).collect()
    }
}

impl SampleProvider for AnomalDataset {
    fn len(&self) -> usize {
        self.samples.len()
    }

    fn get(&self, idx: usize) -> CohortResult<Sample> {
        check_index(idx, self.samples.len())?;
        let sample = &self.samples[idx];
        let image = self.transform.load(&sample.path)?;
        let label = sample.label.as_index();
        let size = self.transform.image_size as usize;
        let mask = if label == 1 {
            ImageTensor::diagonal(size)
        } else {
            ImageTensor::zeros(1, size, size)
        };
        Ok(Sample {
            image,
            mask: Some(mask),
            label: Some(label),
            augmented: None,
        })
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Normal images paired with an augmented view and a rotation target.
///
/// The target `k` is drawn from a generator seeded by `(seed, index)`, so a
/// given sample always gets the same rotation. Both views are rotated by
/// `k` quarter turns; the augmented view is also mirrored and jittered.
#[derive(Debug, Clone)]
pub struct ContrastiveDataset {
    inner: NormalDataset,
    num_classes: usize,
    seed: u64,
}

impl ContrastiveDataset {
    pub fn new(partition: &Partition, transform: ImageTransform, num_classes: usize, seed: u64) -> Self {
        Self {
            inner: NormalDataset::new(partition, transform),
            num_classes: num_classes.max(1),
            seed,
        }
    }

    fn rng_for(&self, idx: usize) -> StdRng {
        StdRng::seed_from_u64(
            self.seed
                .wrapping_mul(0x9E37_79B9_7F4A_7C15)
                .wrapping_add(idx as u64),
        )
    }
}

impl SampleProvider for ContrastiveDataset {
    fn len(&self) -> usize {
        self.inner.len()
    }

    fn get(&self, idx: usize) -> CohortResult<Sample> {
        let base = self.inner.get(idx)?.image;
        let mut rng = self.rng_for(idx);
        let k = rng.gen_range(0..self.num_classes);
        let scale = rng.gen_range(0.8f32..1.2);
        let shift = rng.gen_range(-0.1f32..0.1);

        let image = base.rotate90(k);
        let augmented = image.flip_horizontal().jitter(scale, shift);
        Ok(Sample {
            image,
            mask: None,
            label: Some(k as i64),
            augmented: Some(augmented),
        })
    }

    fn name(&self) -> &str {
        self.inner.name()
    }
}
