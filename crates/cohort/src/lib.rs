//! Data side of the anomaly-detection experiments.
//!
//! Resolves split manifests from configuration filters, balances and
//! partitions them deterministically into train/validation/test groups, and
//! serves transformed image samples in seeded batches. Nothing here touches
//! tensors from a deep-learning framework: images are returned as flat `f32`
//! buffers and converted by the training crate.

pub mod config;
pub mod dataset;
pub mod error;
pub mod loader;
pub mod manifest;
pub mod partition;
pub mod provider;
pub mod transform;

pub use config::{DataConfig, Modality, SexSelection};
pub use dataset::{AnomalDataset, ContrastiveDataset, NormalDataset, Sample, SampleProvider};
pub use error::{CohortError, CohortResult};
pub use loader::{Batch, BatchProvider};
pub use manifest::{Manifest, Sex};
pub use partition::{
    Label, Partition, PartitionPolicy, Partitioner, SampleRef, TestGroup, TestPartitions,
    TrainPartitions,
};
pub use provider::{partition_provider, PartitionProvider};
pub use transform::{ImageTensor, ImageTransform, ResizeMode};
