//! Data configuration loaded from the `[data]` TOML section.

use std::fmt;
use std::path::PathBuf;

use serde::Deserialize;

use crate::error::{CohortError, CohortResult};
use crate::manifest::Sex;

/// Imaging modality of the corpus. Selects the manifest layout and the
/// anomaly-score aggregation policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Modality {
    /// Chest X-ray (CheXpert).
    Cxr,
    /// Brain MRI.
    Mri,
    /// Computed tomography.
    Ct,
    /// Retinal fundus photography.
    Rf,
    /// Colonoscopy.
    Col,
}

impl Modality {
    /// Directory under `datasets_dir` that holds this modality's data.
    pub fn dir_name(&self) -> &'static str {
        match self {
            Self::Cxr => "ChestXR",
            Self::Mri => "MRI",
            Self::Ct => "CT",
            Self::Rf => "RF",
            Self::Col => "COL",
        }
    }
}

impl fmt::Display for Modality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Cxr => "CXR",
            Self::Mri => "MRI",
            Self::Ct => "CT",
            Self::Rf => "RF",
            Self::Col => "COL",
        };
        write!(f, "{s}")
    }
}

/// Which demographic subgroups to draw from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SexSelection {
    /// Male and female manifests, balanced to equal length.
    Both,
    /// Male manifests only.
    Male,
    /// Female manifests only.
    Female,
}

impl SexSelection {
    /// Subgroups in manifest resolution order (male before female).
    pub fn subgroups(&self) -> Vec<Sex> {
        match self {
            Self::Both => vec![Sex::Male, Sex::Female],
            Self::Male => vec![Sex::Male],
            Self::Female => vec![Sex::Female],
        }
    }
}

/// Everything the data pipeline needs: manifest filters, partition ratios,
/// transform settings and loader parameters.
#[derive(Debug, Clone, Deserialize)]
pub struct DataConfig {
    /// Root directory holding one sub-directory per modality.
    #[serde(default = "default_datasets_dir")]
    pub datasets_dir: PathBuf,

    /// Imaging modality.
    #[serde(default = "default_modality")]
    pub modality: Modality,

    /// Dataset name within the modality (e.g. `DDR` for RF).
    #[serde(default)]
    pub dataset: String,

    /// Demographic subgroup filter.
    #[serde(default = "default_sex")]
    pub sex: SexSelection,

    /// Restrict to anterior-posterior projections.
    #[serde(default, alias = "AP_only")]
    pub ap_only: bool,

    /// Use the manifests of images with support devices present.
    #[serde(default)]
    pub sup_devices: bool,

    /// Target pathology of the anomalous manifests.
    #[serde(default = "default_pathology")]
    pub pathology: String,

    /// Side length of the square network input.
    #[serde(default = "default_image_size")]
    pub image_size: u32,

    /// Input channels: 1 (grayscale) or 3 (RGB).
    #[serde(default = "default_img_channels")]
    pub img_channels: usize,

    /// Standardize images with the fixed global mean/std.
    #[serde(default)]
    pub standardize: bool,

    /// Fraction of the normal train pool used for training (rest = validation).
    #[serde(default = "default_normal_split")]
    pub normal_split: f64,

    /// Fraction of each test sequence assigned to the primary test group.
    #[serde(default = "default_anomal_split")]
    pub anomal_split: f64,

    /// Normal samples reserved per subgroup for testing.
    #[serde(default = "default_test_reservation")]
    pub test_reservation: usize,

    /// Anomalous test samples kept per subgroup.
    #[serde(default = "default_anomal_cap")]
    pub anomal_cap: usize,

    /// Seed of every partition permutation.
    #[serde(default = "default_seed")]
    pub seed: u64,

    /// Samples per batch.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Loader worker threads (0 = load on the calling thread).
    #[serde(default = "default_num_workers")]
    pub num_workers: usize,

    /// Batches buffered ahead of the consumer.
    #[serde(default = "default_prefetch")]
    pub prefetch: usize,

    /// Number of pretext classes for contrastive training targets.
    #[serde(default = "default_cls_head_number")]
    pub cls_head_number: usize,
}

fn default_datasets_dir() -> PathBuf {
    PathBuf::from("data")
}
fn default_modality() -> Modality {
    Modality::Cxr
}
fn default_sex() -> SexSelection {
    SexSelection::Both
}
fn default_pathology() -> String {
    "effusion".to_string()
}
fn default_image_size() -> u32 {
    128
}
fn default_img_channels() -> usize {
    1
}
fn default_normal_split() -> f64 {
    0.95
}
fn default_anomal_split() -> f64 {
    0.7
}
fn default_test_reservation() -> usize {
    200
}
fn default_anomal_cap() -> usize {
    200
}
fn default_seed() -> u64 {
    42
}
fn default_batch_size() -> usize {
    32
}
fn default_num_workers() -> usize {
    4
}
fn default_prefetch() -> usize {
    2
}
fn default_cls_head_number() -> usize {
    2
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            datasets_dir: default_datasets_dir(),
            modality: default_modality(),
            dataset: String::new(),
            sex: default_sex(),
            ap_only: false,
            sup_devices: false,
            pathology: default_pathology(),
            image_size: default_image_size(),
            img_channels: default_img_channels(),
            standardize: false,
            normal_split: default_normal_split(),
            anomal_split: default_anomal_split(),
            test_reservation: default_test_reservation(),
            anomal_cap: default_anomal_cap(),
            seed: default_seed(),
            batch_size: default_batch_size(),
            num_workers: default_num_workers(),
            prefetch: default_prefetch(),
            cls_head_number: default_cls_head_number(),
        }
    }
}

impl DataConfig {
    /// Reject values the pipeline cannot work with.
    pub fn validate(&self) -> CohortResult<()> {
        if !(self.normal_split > 0.0 && self.normal_split <= 1.0) {
            return Err(CohortError::Config(format!(
                "normal_split must be in (0, 1], got {}",
                self.normal_split
            )));
        }
        if !(0.0..=1.0).contains(&self.anomal_split) {
            return Err(CohortError::Config(format!(
                "anomal_split must be in [0, 1], got {}",
                self.anomal_split
            )));
        }
        if self.image_size == 0 {
            return Err(CohortError::Config("image_size must be > 0".into()));
        }
        if self.img_channels != 1 && self.img_channels != 3 {
            return Err(CohortError::Config(format!(
                "img_channels must be 1 or 3, got {}",
                self.img_channels
            )));
        }
        if self.batch_size == 0 {
            return Err(CohortError::Config("batch_size must be > 0".into()));
        }
        if self.cls_head_number == 0 || self.cls_head_number > 4 {
            return Err(CohortError::Config(format!(
                "cls_head_number must be in 1..=4 (one class per quarter turn), got {}",
                self.cls_head_number
            )));
        }
        if self.modality != Modality::Cxr && self.sex != SexSelection::Both {
            tracing::warn!(
                modality = %self.modality,
                "sex filter only applies to CXR manifests; ignoring"
            );
        }
        Ok(())
    }
}
