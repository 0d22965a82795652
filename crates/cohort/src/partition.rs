//! Subgroup-balanced, seeded partitioning of manifests.
//!
//! Partitions are derived data: they are recomputed from the manifests and the
//! seed on every run and never written to disk. Two calls with identical
//! inputs return identical, identically ordered partitions.
//!
//! ```text
//! normal manifests (1 or 2 subgroups)
//!   → truncate to shortest                     (subgroup balance)
//!   → [..reservation] per subgroup             → normal-test
//!   → [reservation..] per subgroup, concat     → train pool
//!        → seeded permutation → [..split] train / [split..] val
//! anomalous manifests
//!   → truncate to shortest, concat, cap        → anomal-test
//! normal-test + anomal-test
//!   → seeded permutations → primary / secondary test groups
//! ```

use std::collections::HashSet;
use std::path::PathBuf;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

use crate::config::DataConfig;
use crate::error::{CohortError, CohortResult};
use crate::manifest::Manifest;

/// Ground-truth class of a sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Label {
    Normal,
    Anomalous,
}

impl Label {
    /// Integer class index (0 = normal, 1 = anomalous).
    pub fn as_index(&self) -> i64 {
        match self {
            Self::Normal => 0,
            Self::Anomalous => 1,
        }
    }
}

/// One entry of a partition: an image path and its label.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SampleRef {
    pub path: PathBuf,
    pub label: Label,
}

/// Named, ordered sequence of sample references.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Partition {
    pub name: String,
    pub samples: Vec<SampleRef>,
}

impl Partition {
    fn from_paths(name: &str, paths: Vec<PathBuf>, label: Label) -> Self {
        Self {
            name: name.to_string(),
            samples: paths
                .into_iter()
                .map(|path| SampleRef { path, label })
                .collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Image paths in partition order.
    pub fn paths(&self) -> impl Iterator<Item = &PathBuf> {
        self.samples.iter().map(|s| &s.path)
    }
}

/// Normal-only partitions used to fit a model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrainPartitions {
    pub train: Partition,
    /// `None` when `normal_split` consumes the whole pool.
    pub val: Option<Partition>,
}

impl TrainPartitions {
    /// Number of training paths that also occur in `test`.
    pub fn overlap_with(&self, test: &TestPartitions) -> usize {
        let test_paths: HashSet<&PathBuf> = test.all_paths().collect();
        self.train
            .paths()
            .chain(self.val.iter().flat_map(|v| v.paths()))
            .filter(|p| test_paths.contains(p))
            .count()
    }
}

/// A paired normal + anomalous evaluation slice.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestGroup {
    pub normal: Partition,
    pub anomal: Partition,
}

impl TestGroup {
    /// Normal samples followed by anomalous samples, labels in lockstep.
    pub fn samples(&self) -> Vec<SampleRef> {
        self.normal
            .samples
            .iter()
            .chain(self.anomal.samples.iter())
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.normal.len() + self.anomal.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// The two evaluation slices drawn from one fixed permutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestPartitions {
    pub primary: TestGroup,
    pub secondary: TestGroup,
}

impl TestPartitions {
    fn all_paths(&self) -> impl Iterator<Item = &PathBuf> {
        [&self.primary, &self.secondary]
            .into_iter()
            .flat_map(|g| g.normal.paths().chain(g.anomal.paths()))
    }
}

/// Sizes, ratios and seed of the partitioning scheme.
#[derive(Debug, Clone, PartialEq)]
pub struct PartitionPolicy {
    /// Normal samples reserved per subgroup for the test partition.
    pub test_reservation: usize,
    /// Maximum anomalous test samples per subgroup.
    pub anomal_cap: usize,
    /// Seed of every permutation.
    pub seed: u64,
    /// Train fraction of the normal train pool.
    pub normal_split: f64,
    /// Primary fraction of each test sequence.
    pub anomal_split: f64,
}

impl Default for PartitionPolicy {
    fn default() -> Self {
        Self {
            test_reservation: 200,
            anomal_cap: 200,
            seed: 42,
            normal_split: 0.95,
            anomal_split: 0.7,
        }
    }
}

impl PartitionPolicy {
    pub fn from_config(config: &DataConfig) -> Self {
        Self {
            test_reservation: config.test_reservation,
            anomal_cap: config.anomal_cap,
            seed: config.seed,
            normal_split: config.normal_split,
            anomal_split: config.anomal_split,
        }
    }
}

/// Splits manifests into train/validation/test partitions.
#[derive(Debug, Clone)]
pub struct Partitioner {
    policy: PartitionPolicy,
}

impl Partitioner {
    pub fn new(policy: PartitionPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &PartitionPolicy {
        &self.policy
    }

    /// Balanced normal lists, each checked against the test reservation.
    fn balanced_normals(&self, normals: &[Manifest]) -> CohortResult<Vec<Vec<PathBuf>>> {
        if normals.is_empty() {
            return Err(CohortError::Config("no normal manifests given".into()));
        }
        let balanced = balance(normals.iter().map(|m| m.paths().to_vec()).collect());
        let needed = self.policy.test_reservation;
        for (manifest, list) in normals.iter().zip(&balanced) {
            if list.len() < needed {
                return Err(CohortError::InsufficientSamples {
                    manifest: manifest.name(),
                    needed,
                    found: list.len(),
                });
            }
        }
        Ok(balanced)
    }

    /// Normal paths left for training after the per-subgroup test reservation,
    /// concatenated across subgroups, in manifest order.
    pub fn train_pool(&self, normals: &[Manifest]) -> CohortResult<Vec<PathBuf>> {
        let reservation = self.policy.test_reservation;
        let balanced = self.balanced_normals(normals)?;
        Ok(balanced
            .into_iter()
            .flat_map(|list| list.into_iter().skip(reservation))
            .collect())
    }

    /// Unpermuted (normal-test, anomal-test) sequences.
    pub fn test_pool(
        &self,
        normals: &[Manifest],
        anomals: &[Manifest],
    ) -> CohortResult<(Vec<PathBuf>, Vec<PathBuf>)> {
        if anomals.is_empty() {
            return Err(CohortError::Config("no anomalous manifests given".into()));
        }
        let reservation = self.policy.test_reservation;
        let normal_test: Vec<PathBuf> = self
            .balanced_normals(normals)?
            .into_iter()
            .flat_map(|list| list.into_iter().take(reservation))
            .collect();

        let cap = self.policy.anomal_cap * anomals.len();
        let anomal_test: Vec<PathBuf> = balance(anomals.iter().map(|m| m.paths().to_vec()).collect())
            .into_iter()
            .flatten()
            .take(cap)
            .collect();

        Ok((normal_test, anomal_test))
    }

    /// Seeded train / validation split of the train pool.
    pub fn train_partitions(&self, normals: &[Manifest]) -> CohortResult<TrainPartitions> {
        let pool = self.train_pool(normals)?;
        let mut rng = StdRng::seed_from_u64(self.policy.seed);
        let pool = permuted(pool, &mut rng);

        let split = split_index(pool.len(), self.policy.normal_split);
        let (train, val) = if split == pool.len() {
            (pool, None)
        } else {
            let mut train = pool;
            let val = train.split_off(split);
            (train, Some(val))
        };

        let partitions = TrainPartitions {
            train: Partition::from_paths("normal-train", train, Label::Normal),
            val: val.map(|v| Partition::from_paths("normal-val", v, Label::Normal)),
        };
        tracing::info!(
            train = partitions.train.len(),
            val = partitions.val.as_ref().map(|v| v.len()).unwrap_or(0),
            subgroups = normals.len(),
            "Built train partitions"
        );
        Ok(partitions)
    }

    /// Seeded primary / secondary split of the test sequences.
    ///
    /// One generator seeded with the policy seed permutes the normal sequence
    /// first and the anomalous sequence second.
    pub fn test_partitions(
        &self,
        normals: &[Manifest],
        anomals: &[Manifest],
    ) -> CohortResult<TestPartitions> {
        let (normal, anomal) = self.test_pool(normals, anomals)?;
        let mut rng = StdRng::seed_from_u64(self.policy.seed);
        let mut normal = permuted(normal, &mut rng);
        let mut anomal = permuted(anomal, &mut rng);

        let split_normal = split_index(normal.len(), self.policy.anomal_split);
        let split_anomal = split_index(anomal.len(), self.policy.anomal_split);
        let normal_rest = normal.split_off(split_normal);
        let anomal_rest = anomal.split_off(split_anomal);

        let partitions = TestPartitions {
            primary: TestGroup {
                normal: Partition::from_paths("normal-test-primary", normal, Label::Normal),
                anomal: Partition::from_paths("anomal-test-primary", anomal, Label::Anomalous),
            },
            secondary: TestGroup {
                normal: Partition::from_paths("normal-test-secondary", normal_rest, Label::Normal),
                anomal: Partition::from_paths("anomal-test-secondary", anomal_rest, Label::Anomalous),
            },
        };
        tracing::info!(
            primary_normal = partitions.primary.normal.len(),
            primary_anomal = partitions.primary.anomal.len(),
            secondary_normal = partitions.secondary.normal.len(),
            secondary_anomal = partitions.secondary.anomal.len(),
            "Built test partitions"
        );
        Ok(partitions)
    }
}

/// Truncate every list to the length of the shortest one, keeping order.
pub fn balance(mut lists: Vec<Vec<PathBuf>>) -> Vec<Vec<PathBuf>> {
    if let Some(shortest) = lists.iter().map(|l| l.len()).min() {
        for list in &mut lists {
            list.truncate(shortest);
        }
    }
    lists
}

/// `floor(len * ratio)`, clamped to `len`.
pub fn split_index(len: usize, ratio: f64) -> usize {
    ((len as f64 * ratio).floor() as usize).min(len)
}

fn permuted(mut paths: Vec<PathBuf>, rng: &mut StdRng) -> Vec<PathBuf> {
    paths.shuffle(rng);
    paths
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manifest(prefix: &str, n: usize) -> Manifest {
        Manifest::new(
            format!("{prefix}.txt"),
            (0..n).map(|i| PathBuf::from(format!("{prefix}/{i:05}.png"))).collect(),
        )
    }

    fn policy(normal_split: f64, anomal_split: f64) -> PartitionPolicy {
        PartitionPolicy {
            normal_split,
            anomal_split,
            ..PartitionPolicy::default()
        }
    }

    #[test]
    fn test_balance_truncates_tail() {
        let lists = vec![
            vec![PathBuf::from("a0"), PathBuf::from("a1"), PathBuf::from("a2")],
            vec![PathBuf::from("b0"), PathBuf::from("b1")],
        ];
        let balanced = balance(lists);
        assert_eq!(balanced[0], vec![PathBuf::from("a0"), PathBuf::from("a1")]);
        assert_eq!(balanced[1].len(), 2);
    }

    #[test]
    fn test_split_index() {
        assert_eq!(split_index(1500, 0.8), 1200);
        assert_eq!(split_index(10, 1.0), 10);
        assert_eq!(split_index(7, 0.5), 3);
        assert_eq!(split_index(0, 0.7), 0);
    }

    #[test]
    fn test_both_subgroups_scenario() {
        // [1000, 950] → balanced 950 → test 200+200, pool 750+750
        let normals = vec![manifest("male", 1000), manifest("female", 950)];
        let anomals = vec![manifest("male_eff", 300), manifest("female_eff", 500)];
        let p = Partitioner::new(policy(0.8, 0.7));

        let pool = p.train_pool(&normals).unwrap();
        assert_eq!(pool.len(), 1500);

        let (normal_test, anomal_test) = p.test_pool(&normals, &anomals).unwrap();
        assert_eq!(normal_test.len(), 400);
        assert!(anomal_test.len() <= 400);

        let train = p.train_partitions(&normals).unwrap();
        assert_eq!(train.train.len(), 1200);
        assert_eq!(train.val.as_ref().unwrap().len(), 300);
        assert_eq!(train.train.len() + train.val.unwrap().len(), 2 * (950 - 200));
    }

    #[test]
    fn test_train_pool_skips_reservation_per_subgroup() {
        let normals = vec![manifest("male", 205), manifest("female", 210)];
        let p = Partitioner::new(PartitionPolicy::default());
        let pool = p.train_pool(&normals).unwrap();
        // Balanced to 205 → 5 from each subgroup, starting at index 200
        assert_eq!(pool.len(), 10);
        assert_eq!(pool[0], PathBuf::from("male/00200.png"));
        assert_eq!(pool[5], PathBuf::from("female/00200.png"));
        assert_eq!(pool[9], PathBuf::from("female/00204.png"));
    }

    #[test]
    fn test_normal_test_is_front_of_each_subgroup() {
        let normals = vec![manifest("male", 300), manifest("female", 300)];
        let anomals = vec![manifest("male_eff", 10), manifest("female_eff", 10)];
        let p = Partitioner::new(PartitionPolicy::default());
        let (normal_test, _) = p.test_pool(&normals, &anomals).unwrap();
        assert_eq!(normal_test[0], PathBuf::from("male/00000.png"));
        assert_eq!(normal_test[199], PathBuf::from("male/00199.png"));
        assert_eq!(normal_test[200], PathBuf::from("female/00000.png"));
    }

    #[test]
    fn test_anomal_cap_both_and_single() {
        let p = Partitioner::new(PartitionPolicy::default());

        let normals = vec![manifest("male", 400), manifest("female", 400)];
        let anomals = vec![manifest("male_eff", 1000), manifest("female_eff", 900)];
        let (_, anomal_test) = p.test_pool(&normals, &anomals).unwrap();
        assert_eq!(anomal_test.len(), 400);

        let normals = vec![manifest("male", 400)];
        let anomals = vec![manifest("male_eff", 1000)];
        let (normal_test, anomal_test) = p.test_pool(&normals, &anomals).unwrap();
        assert_eq!(normal_test.len(), 200);
        assert_eq!(anomal_test.len(), 200);
    }

    #[test]
    fn test_anomal_balanced_before_concat() {
        let p = Partitioner::new(PartitionPolicy::default());
        let normals = vec![manifest("male", 300), manifest("female", 300)];
        let anomals = vec![manifest("male_eff", 150), manifest("female_eff", 50)];
        let (_, anomal_test) = p.test_pool(&normals, &anomals).unwrap();
        // Balanced to 50 each, total 100 (under the 400 cap)
        assert_eq!(anomal_test.len(), 100);
        assert_eq!(anomal_test[49], PathBuf::from("male_eff/00049.png"));
        assert_eq!(anomal_test[50], PathBuf::from("female_eff/00000.png"));
    }

    #[test]
    fn test_insufficient_samples() {
        let normals = vec![manifest("male", 500), manifest("female", 150)];
        let p = Partitioner::new(PartitionPolicy::default());
        match p.train_pool(&normals).unwrap_err() {
            CohortError::InsufficientSamples { needed, found, .. } => {
                assert_eq!(needed, 200);
                assert_eq!(found, 150);
            }
            other => panic!("expected InsufficientSamples, got {other:?}"),
        }
    }

    #[test]
    fn test_reservation_is_configurable() {
        let normals = vec![manifest("male", 30)];
        let anomals = vec![manifest("male_eff", 30)];
        let p = Partitioner::new(PartitionPolicy {
            test_reservation: 10,
            anomal_cap: 5,
            ..PartitionPolicy::default()
        });
        let (normal_test, anomal_test) = p.test_pool(&normals, &anomals).unwrap();
        assert_eq!(normal_test.len(), 10);
        assert_eq!(anomal_test.len(), 5);
        assert_eq!(p.train_pool(&normals).unwrap().len(), 20);
    }

    #[test]
    fn test_full_split_produces_no_val() {
        let normals = vec![manifest("male", 260)];
        let p = Partitioner::new(policy(1.0, 0.5));
        let parts = p.train_partitions(&normals).unwrap();
        assert_eq!(parts.train.len(), 60);
        assert!(parts.val.is_none());
    }

    #[test]
    fn test_partitions_deterministic() {
        let normals = vec![manifest("male", 700), manifest("female", 650)];
        let anomals = vec![manifest("male_eff", 300), manifest("female_eff", 320)];
        let p = Partitioner::new(policy(0.9, 0.6));

        let a = p.train_partitions(&normals).unwrap();
        let b = p.train_partitions(&normals).unwrap();
        assert_eq!(a, b);

        let ta = p.test_partitions(&normals, &anomals).unwrap();
        let tb = p.test_partitions(&normals, &anomals).unwrap();
        assert_eq!(ta, tb);
    }

    #[test]
    fn test_different_seed_changes_order() {
        let normals = vec![manifest("male", 700)];
        let a = Partitioner::new(policy(0.9, 0.6)).train_partitions(&normals).unwrap();
        let b = Partitioner::new(PartitionPolicy {
            seed: 7,
            ..policy(0.9, 0.6)
        })
        .train_partitions(&normals)
        .unwrap();
        assert_ne!(a.train, b.train);
    }

    #[test]
    fn test_train_val_disjoint_and_no_test_leakage() {
        let normals = vec![manifest("male", 600), manifest("female", 620)];
        let anomals = vec![manifest("male_eff", 300), manifest("female_eff", 300)];
        let p = Partitioner::new(policy(0.75, 0.5));

        let train = p.train_partitions(&normals).unwrap();
        let test = p.test_partitions(&normals, &anomals).unwrap();

        let train_set: HashSet<&PathBuf> = train.train.paths().collect();
        let val = train.val.as_ref().unwrap();
        assert!(val.paths().all(|path| !train_set.contains(path)));
        assert_eq!(train.overlap_with(&test), 0);
    }

    #[test]
    fn test_test_group_sizes_and_labels() {
        let normals = vec![manifest("male", 400), manifest("female", 400)];
        let anomals = vec![manifest("male_eff", 300), manifest("female_eff", 300)];
        let p = Partitioner::new(policy(0.9, 0.75));
        let test = p.test_partitions(&normals, &anomals).unwrap();

        assert_eq!(test.primary.normal.len(), 300);
        assert_eq!(test.secondary.normal.len(), 100);
        assert_eq!(test.primary.anomal.len(), 300);
        assert_eq!(test.secondary.anomal.len(), 100);
        assert!(test.primary.anomal.len() <= 400);

        let samples = test.primary.samples();
        assert_eq!(samples.len(), 600);
        assert!(samples[..300].iter().all(|s| s.label == Label::Normal));
        assert!(samples[300..].iter().all(|s| s.label == Label::Anomalous));
    }

    #[test]
    fn test_missing_manifests_rejected() {
        let p = Partitioner::new(PartitionPolicy::default());
        assert!(p.train_pool(&[]).is_err());
        assert!(p.test_pool(&[manifest("male", 300)], &[]).is_err());
    }
}
