//! Per-modality manifest layouts behind one trait.
//!
//! [`partition_provider`] maps the configured [`Modality`] to the provider
//! that knows where that corpus keeps its split files.

use std::path::PathBuf;

use crate::config::{DataConfig, Modality};
use crate::error::CohortResult;
use crate::manifest::{self, Manifest, Sex};
use crate::partition::{PartitionPolicy, Partitioner, TestPartitions, TrainPartitions};

/// Source of manifests plus the partitioner applied to them.
pub trait PartitionProvider: Send + Sync {
    /// Short identifier for logging.
    fn name(&self) -> &str;

    /// Normal manifests, one per subgroup, in subgroup order.
    fn normal_manifests(&self) -> CohortResult<Vec<Manifest>>;

    /// Anomalous manifests, one per subgroup, in subgroup order.
    fn anomal_manifests(&self) -> CohortResult<Vec<Manifest>>;

    fn partitioner(&self) -> &Partitioner;

    fn train_partitions(&self) -> CohortResult<TrainPartitions> {
        let normals = self.normal_manifests()?;
        self.partitioner().train_partitions(&normals)
    }

    fn test_partitions(&self) -> CohortResult<TestPartitions> {
        let normals = self.normal_manifests()?;
        let anomals = self.anomal_manifests()?;
        self.partitioner().test_partitions(&normals, &anomals)
    }
}

/// CheXpert layout: per-sex manifests filtered by projection and devices.
#[derive(Debug, Clone)]
pub struct ChexpertProvider {
    root: PathBuf,
    subgroups: Vec<Sex>,
    ap_only: bool,
    sup_devices: bool,
    pathology: String,
    partitioner: Partitioner,
}

impl ChexpertProvider {
    pub fn new(config: &DataConfig) -> Self {
        Self {
            root: config.datasets_dir.join(Modality::Cxr.dir_name()),
            subgroups: config.sex.subgroups(),
            ap_only: config.ap_only,
            sup_devices: config.sup_devices,
            pathology: config.pathology.clone(),
            partitioner: Partitioner::new(PartitionPolicy::from_config(config)),
        }
    }

    fn splits_dir(&self, kind: &str) -> PathBuf {
        self.root.join("CheXpert-v1.0-small").join(kind)
    }
}

impl PartitionProvider for ChexpertProvider {
    fn name(&self) -> &str {
        "chexpert"
    }

    fn normal_manifests(&self) -> CohortResult<Vec<Manifest>> {
        let dir = self.splits_dir("normal_splits");
        self.subgroups
            .iter()
            .map(|&sex| {
                let prefix = manifest::chexpert_normal_prefix(sex, self.ap_only, self.sup_devices);
                let file = manifest::resolve_unique(&dir, &prefix)?;
                Manifest::load(&file, &self.root)
            })
            .collect()
    }

    fn anomal_manifests(&self) -> CohortResult<Vec<Manifest>> {
        let dir = self.splits_dir("anomal_splits");
        self.subgroups
            .iter()
            .map(|&sex| {
                let prefix = manifest::chexpert_anomal_prefix(
                    sex,
                    &self.pathology,
                    self.ap_only,
                    self.sup_devices,
                );
                let file = manifest::resolve_unique(&dir, &prefix)?;
                Manifest::load(&file, &self.root)
            })
            .collect()
    }

    fn partitioner(&self) -> &Partitioner {
        &self.partitioner
    }
}

/// Single-subgroup layout used by the MRI, CT, RF and COL corpora.
#[derive(Debug, Clone)]
pub struct SplitListProvider {
    name: String,
    root: PathBuf,
    pathology: String,
    partitioner: Partitioner,
}

impl SplitListProvider {
    pub fn new(config: &DataConfig) -> Self {
        Self {
            name: config.modality.to_string().to_lowercase(),
            root: config.datasets_dir.join(config.modality.dir_name()),
            pathology: config.pathology.clone(),
            partitioner: Partitioner::new(PartitionPolicy::from_config(config)),
        }
    }
}

impl PartitionProvider for SplitListProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn normal_manifests(&self) -> CohortResult<Vec<Manifest>> {
        let file = manifest::resolve_unique(&self.root.join("normal_splits"), "normal_train")?;
        Ok(vec![Manifest::load(&file, &self.root)?])
    }

    fn anomal_manifests(&self) -> CohortResult<Vec<Manifest>> {
        let prefix = format!("anomal_{}", self.pathology);
        let file = manifest::resolve_unique(&self.root.join("anomal_splits"), &prefix)?;
        Ok(vec![Manifest::load(&file, &self.root)?])
    }

    fn partitioner(&self) -> &Partitioner {
        &self.partitioner
    }
}

/// Provider for the configured modality.
pub fn partition_provider(config: &DataConfig) -> Box<dyn PartitionProvider> {
    match config.modality {
        Modality::Cxr => Box::new(ChexpertProvider::new(config)),
        Modality::Mri | Modality::Ct | Modality::Rf | Modality::Col => {
            Box::new(SplitListProvider::new(config))
        }
    }
}
