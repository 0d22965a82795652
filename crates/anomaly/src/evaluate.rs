//! Test-set evaluation: score every image of each test group and report
//! ranking metrics against the normal/anomalous labels.

use burn::prelude::*;
use cohort::BatchProvider;
use indicatif::{ProgressBar, ProgressStyle};

use crate::inference::AnomalyScorer;
use crate::model::contract::FeatureModel;

/// Metrics for one test group.
#[derive(serde::Serialize, serde::Deserialize, Debug, Clone, PartialEq)]
pub struct EvalReport {
    pub auroc: f64,
    pub average_precision: f64,
    pub mean_score_normal: f64,
    pub mean_score_anomalous: f64,
    pub n_normal: usize,
    pub n_anomalous: usize,
    /// Average precision of the anomaly maps against the sample masks, when
    /// the group carries masks with at least one positive pixel.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pixel_average_precision: Option<f64>,
}

impl EvalReport {
    /// Build a report from per-image scores and anomaly flags.
    ///
    /// # Errors
    /// Fails unless both classes are present.
    pub fn from_scores(scores: &[f64], anomalous: &[bool]) -> anyhow::Result<Self> {
        anyhow::ensure!(
            scores.len() == anomalous.len(),
            "Got {} scores for {} labels",
            scores.len(),
            anomalous.len()
        );
        let n_anomalous = anomalous.iter().filter(|&&a| a).count();
        let n_normal = anomalous.len() - n_anomalous;
        anyhow::ensure!(
            n_normal > 0 && n_anomalous > 0,
            "Evaluation needs both classes (normal: {n_normal}, anomalous: {n_anomalous})"
        );

        let mean_of = |want: bool, n: usize| {
            scores
                .iter()
                .zip(anomalous)
                .filter(|(_, &a)| a == want)
                .map(|(s, _)| s)
                .sum::<f64>()
                / n as f64
        };

        Ok(Self {
            auroc: roc_auc(scores, anomalous),
            average_precision: average_precision(scores, anomalous),
            mean_score_normal: mean_of(false, n_normal),
            mean_score_anomalous: mean_of(true, n_anomalous),
            n_normal,
            n_anomalous,
            pixel_average_precision: None,
        })
    }

    /// Attach the pixel-level AP of `pixel_scores` against mask pixels above 0.5.
    pub fn with_pixel_scores(mut self, pixel_scores: &[f32], masks: &[f32]) -> Self {
        let positive: Vec<bool> = masks.iter().map(|&m| m > 0.5).collect();
        if pixel_scores.len() == positive.len() && positive.iter().any(|&p| p) {
            let scores: Vec<f64> = pixel_scores.iter().map(|&v| v as f64).collect();
            self.pixel_average_precision = Some(average_precision(&scores, &positive));
        }
        self
    }

    /// Metrics as `(prefix/name, value)` pairs for a metric sink.
    pub fn to_metrics(&self, prefix: &str) -> Vec<(String, f64)> {
        let mut metrics = vec![
            (format!("{prefix}/auroc"), self.auroc),
            (format!("{prefix}/average_precision"), self.average_precision),
            (format!("{prefix}/mean_score_normal"), self.mean_score_normal),
            (format!("{prefix}/mean_score_anomalous"), self.mean_score_anomalous),
            (format!("{prefix}/n_normal"), self.n_normal as f64),
            (format!("{prefix}/n_anomalous"), self.n_anomalous as f64),
        ];
        if let Some(ap) = self.pixel_average_precision {
            metrics.push((format!("{prefix}/pixel_average_precision"), ap));
        }
        metrics
    }
}

/// Area under the ROC curve via the Mann-Whitney rank-sum statistic.
/// Tied scores share their average rank. Returns 0.5 when a class is missing.
pub fn roc_auc(scores: &[f64], anomalous: &[bool]) -> f64 {
    let n_pos = anomalous.iter().filter(|&&a| a).count();
    let n_neg = anomalous.len() - n_pos;
    if n_pos == 0 || n_neg == 0 {
        return 0.5;
    }

    let mut order: Vec<usize> = (0..scores.len()).collect();
    order.sort_by(|&a, &b| scores[a].total_cmp(&scores[b]));

    let mut rank_sum = 0.0;
    let mut i = 0;
    while i < order.len() {
        let mut j = i;
        while j + 1 < order.len() && scores[order[j + 1]] == scores[order[i]] {
            j += 1;
        }
        // 1-based ranks i+1 ..= j+1
        let avg_rank = (i + j + 2) as f64 / 2.0;
        rank_sum += order[i..=j].iter().filter(|&&k| anomalous[k]).count() as f64 * avg_rank;
        i = j + 1;
    }

    let n_pos = n_pos as f64;
    (rank_sum - n_pos * (n_pos + 1.0) / 2.0) / (n_pos * n_neg as f64)
}

/// Step-wise area under the precision-recall curve: `Σ (Rₖ − Rₖ₋₁)·Pₖ`
/// over distinct score thresholds, highest first.
pub fn average_precision(scores: &[f64], anomalous: &[bool]) -> f64 {
    let n_pos = anomalous.iter().filter(|&&a| a).count();
    if n_pos == 0 {
        return 0.0;
    }

    let mut order: Vec<usize> = (0..scores.len()).collect();
    order.sort_by(|&a, &b| scores[b].total_cmp(&scores[a]));

    let mut ap = 0.0;
    let mut tp = 0usize;
    let mut seen = 0usize;
    let mut prev_recall = 0.0;
    let mut i = 0;
    while i < order.len() {
        let threshold = scores[order[i]];
        while i < order.len() && scores[order[i]] == threshold {
            if anomalous[order[i]] {
                tp += 1;
            }
            seen += 1;
            i += 1;
        }
        let recall = tp as f64 / n_pos as f64;
        let precision = tp as f64 / seen as f64;
        ap += (recall - prev_recall) * precision;
        prev_recall = recall;
    }
    ap
}

/// Everything scored for one test group.
#[derive(Debug, Clone, Default)]
pub struct GroupScores {
    pub scores: Vec<f64>,
    pub anomalous: Vec<bool>,
    /// Flattened anomaly maps of the batches that carried masks.
    pub pixel_scores: Vec<f32>,
    /// Masks aligned with `pixel_scores`.
    pub masks: Vec<f32>,
}

impl GroupScores {
    pub fn report(&self) -> anyhow::Result<EvalReport> {
        let report = EvalReport::from_scores(&self.scores, &self.anomalous)?;
        Ok(report.with_pixel_scores(&self.pixel_scores, &self.masks))
    }
}

/// Scores named test groups with an [`AnomalyScorer`].
#[derive(Debug, Clone)]
pub struct Evaluator {
    scorer: AnomalyScorer,
    groups: Vec<(String, BatchProvider)>,
}

impl Evaluator {
    pub fn new(scorer: AnomalyScorer) -> Self {
        Self {
            scorer,
            groups: Vec::new(),
        }
    }

    /// Add a test group. Its samples must carry labels (0 normal, 1 anomalous).
    pub fn with_group(mut self, name: impl Into<String>, loader: BatchProvider) -> Self {
        self.groups.push((name.into(), loader));
        self
    }

    /// Scores, anomaly flags and masked maps for every image of `loader`.
    pub fn score_group<B: Backend, M: FeatureModel<B>>(
        &self,
        model: &M,
        loader: &BatchProvider,
        device: &B::Device,
    ) -> anyhow::Result<GroupScores> {
        let pb = ProgressBar::new(loader.num_batches() as u64);
        pb.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("=> "),
        );
        pb.set_message(loader.dataset().name().to_string());

        let mut group = GroupScores {
            scores: Vec::with_capacity(loader.len()),
            anomalous: Vec::with_capacity(loader.len()),
            ..GroupScores::default()
        };
        for batch in loader.epoch(0) {
            let batch = batch?;
            let labels = batch.labels.as_ref().ok_or_else(|| {
                anyhow::anyhow!("Test group {} has no labels", loader.dataset().name())
            })?;
            group.anomalous.extend(labels.iter().map(|&l| l != 0));
            let (scores, maps) = self.scorer.score_batch_with_maps(model, &batch, device)?;
            group.scores.extend(scores);
            if let Some(masks) = &batch.masks {
                group.pixel_scores.extend(maps);
                group.masks.extend_from_slice(masks);
            }
            pb.inc(1);
        }
        pb.finish_with_message("done");
        Ok(group)
    }

    /// One report per group, in insertion order.
    pub fn evaluate<B: Backend, M: FeatureModel<B>>(
        &self,
        model: &M,
        device: &B::Device,
    ) -> anyhow::Result<Vec<(String, EvalReport)>> {
        let mut reports = Vec::with_capacity(self.groups.len());
        for (name, loader) in &self.groups {
            let report = self
                .score_group(model, loader, device)?
                .report()
                .map_err(|e| anyhow::anyhow!("Test group {name}: {e}"))?;
            tracing::info!(
                group = name.as_str(),
                auroc = format!("{:.4}", report.auroc),
                ap = format!("{:.4}", report.average_precision),
                n_normal = report.n_normal,
                n_anomalous = report.n_anomalous,
                pixel_ap = report.pixel_average_precision.map(|ap| format!("{ap:.4}")),
                "Evaluated test group"
            );
            reports.push((name.clone(), report));
        }
        Ok(reports)
    }

    /// All group metrics flattened for a metric sink.
    pub fn evaluate_metrics<B: Backend, M: FeatureModel<B>>(
        &self,
        model: &M,
        device: &B::Device,
    ) -> anyhow::Result<Vec<(String, f64)>> {
        Ok(self
            .evaluate(model, device)?
            .iter()
            .flat_map(|(name, report)| report.to_metrics(name))
            .collect())
    }

    /// Closure suitable as the training loop's evaluation callback.
    pub fn callback<'a, B: Backend, M: FeatureModel<B>>(
        &'a self,
        device: &'a B::Device,
    ) -> impl FnMut(&M, usize) -> anyhow::Result<Vec<(String, f64)>> + 'a
    where
        B: 'a,
        M: 'a,
    {
        move |model: &M, step: usize| {
            tracing::info!(step, groups = self.groups.len(), "Running evaluation");
            self.evaluate_metrics(model, device)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_perfect_separation() {
        let scores = [0.1, 0.2, 0.3, 0.8, 0.9];
        let labels = [false, false, false, true, true];
        assert!((roc_auc(&scores, &labels) - 1.0).abs() < 1e-12);
        assert!((average_precision(&scores, &labels) - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_inverted_scores() {
        let scores = [0.9, 0.8, 0.1];
        let labels = [false, false, true];
        assert!(roc_auc(&scores, &labels).abs() < 1e-12);
        assert!((average_precision(&scores, &labels) - 1.0 / 3.0).abs() < 1e-12);
    }

    #[test]
    fn test_ties_share_rank() {
        // All tied: AUROC 0.5, AP equals the positive rate
        let scores = [0.5; 4];
        let labels = [true, false, false, true];
        assert!((roc_auc(&scores, &labels) - 0.5).abs() < 1e-12);
        assert!((average_precision(&scores, &labels) - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_known_auroc() {
        // pairs (pos, neg): (0.8>0.3) (0.8>0.6) (0.4>0.3) (0.4<0.6) → 3/4
        let scores = [0.3, 0.6, 0.8, 0.4];
        let labels = [false, false, true, true];
        assert!((roc_auc(&scores, &labels) - 0.75).abs() < 1e-12);
        // descending: 0.8(+) 0.6(-) 0.4(+) 0.3(-): 0.5·1 + 0.5·(2/3)
        let ap = average_precision(&scores, &labels);
        assert!((ap - (0.5 + 1.0 / 3.0)).abs() < 1e-12);
    }

    #[test]
    fn test_report_requires_both_classes() {
        assert!(EvalReport::from_scores(&[0.1, 0.2], &[false, false]).is_err());
        assert!(EvalReport::from_scores(&[0.1], &[false, true]).is_err());

        let report = EvalReport::from_scores(&[0.0, 1.0, 3.0], &[false, true, true]).unwrap();
        assert_eq!(report.n_normal, 1);
        assert_eq!(report.n_anomalous, 2);
        assert_eq!(report.mean_score_anomalous, 2.0);
        assert_eq!(report.auroc, 1.0);

        let metrics = report.to_metrics("test");
        assert_eq!(metrics[0], ("test/auroc".to_string(), 1.0));
        assert_eq!(metrics.len(), 6);
    }

    #[test]
    fn test_pixel_average_precision() {
        let report = EvalReport::from_scores(&[0.0, 1.0], &[false, true]).unwrap();
        // Mask pixels 1 and 3; the map ranks 3 first, then 0, then 1
        let masked = report
            .clone()
            .with_pixel_scores(&[0.5, 0.2, 0.1, 0.9], &[0.0, 1.0, 0.0, 1.0]);
        let ap = masked.pixel_average_precision.unwrap();
        assert!((ap - (0.5 + 0.5 * 2.0 / 3.0)).abs() < 1e-12, "got {ap}");

        let metrics = masked.to_metrics("val");
        assert_eq!(metrics.len(), 7);
        assert_eq!(metrics[6].0, "val/pixel_average_precision");

        // All-zero masks or mismatched lengths leave it unset
        let empty = report.clone().with_pixel_scores(&[0.3, 0.4], &[0.0, 0.0]);
        assert!(empty.pixel_average_precision.is_none());
        let mismatched = report.with_pixel_scores(&[0.3], &[1.0, 0.0]);
        assert!(mismatched.pixel_average_precision.is_none());
    }
}
