//! Result types written by the CLI.

use anomaly::evaluate::EvalReport;
use serde::{Deserialize, Serialize};

/// Sizes of the partitions produced for one configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SplitSummary {
    /// Partition provider name (`chexpert`, `mri`, …).
    pub provider: String,
    pub train: usize,
    pub val: usize,
    pub primary_normal: usize,
    pub primary_anomalous: usize,
    pub secondary_normal: usize,
    pub secondary_anomalous: usize,
    /// Training paths that also occur in a test group. Always 0 for valid splits.
    pub overlap: usize,
}

/// Outcome of one training run, written next to its checkpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainSummary {
    /// `ccd` or `amcons`.
    pub regime: String,
    /// Human-readable termination reason.
    pub termination: String,
    pub steps: usize,
    pub epochs: usize,
    pub final_lr: f64,
    pub train_samples: usize,
    /// Directory of the final checkpoint.
    pub final_checkpoint: String,
    pub elapsed_secs: f64,
}

/// Metrics of one scored test group.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupResult {
    pub name: String,
    #[serde(flatten)]
    pub report: EvalReport,
}

/// Results of evaluating a checkpoint on the test groups.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvalResult {
    /// Checkpoint directory or file that was evaluated.
    pub checkpoint: String,
    /// `vae` or `contrastive`.
    pub model: String,
    pub modality: String,
    pub dataset: String,
    /// Feature layer offset used for anomaly maps.
    pub level: isize,
    /// Aggregation policy, e.g. `Mean` or `ForegroundMax { rebase: false }`.
    pub aggregation: String,
    pub groups: Vec<GroupResult>,
}

impl EvalResult {
    /// Mean AUROC over groups; 0 when there are none.
    pub fn mean_auroc(&self) -> f64 {
        if self.groups.is_empty() {
            return 0.0;
        }
        self.groups.iter().map(|g| g.report.auroc).sum::<f64>() / self.groups.len() as f64
    }
}
