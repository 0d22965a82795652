//! Integration tests for the anomaly crate.
//!
//! These tests drive the full training loop end to end: sample provider →
//! batch provider → loss composer → optimizer → metric sinks → checkpoint
//! store, plus evaluation of a trained model. All use the NdArray backend and
//! small synthetic images.

use std::path::Path;
use std::sync::Arc;

use burn::backend::ndarray::NdArray;
use burn::backend::Autodiff;
use burn::optim::decay::WeightDecayConfig;
use burn::optim::momentum::MomentumConfig;
use burn::optim::{AdamConfig, SgdConfig};
use burn::prelude::*;
use image::{GrayImage, Luma};
use tempfile::TempDir;

use anomaly::evaluate::Evaluator;
use anomaly::inference::{AggregationPolicy, AnomalyScorer};
use anomaly::model::contrastive::{ContrastiveNet, ContrastiveNetConfig};
use anomaly::model::vae::{ConvVae, ConvVaeConfig};
use anomaly::training::checkpoint::{CheckpointStore, load_model};
use anomaly::training::composer::{
    ContrastiveComposer, ContrastiveLossConfig, ReconstructionComposer, ReconstructionLossConfig,
};
use anomaly::training::metrics::{FanoutSink, JsonlSink, MemorySink, MetricSink};
use anomaly::training::trainer::{train, EvalFn, LrScheduleKind, Termination, TrainingConfig};
use cohort::{
    BatchProvider, CohortResult, ImageTensor, ImageTransform, Label, NormalDataset, Partition,
    ResizeMode, Sample, SampleProvider, SampleRef,
};

type TestBackend = NdArray<f32>;
type TestAutodiffBackend = Autodiff<NdArray<f32>>;

const SIZE: usize = 16;

/// Helper: synthetic grayscale images. Anomalous samples carry a bright square.
struct Synthetic {
    n: usize,
    anomalous_from: usize,
    contrastive: bool,
    masked: bool,
}

impl Synthetic {
    fn normal(n: usize) -> Self {
        Self { n, anomalous_from: n, contrastive: false, masked: false }
    }

    fn contrastive(n: usize) -> Self {
        Self { n, anomalous_from: n, contrastive: true, masked: false }
    }

    fn labelled(n_normal: usize, n_anomalous: usize) -> Self {
        Self {
            n: n_normal + n_anomalous,
            anomalous_from: n_normal,
            contrastive: false,
            masked: false,
        }
    }

    fn with_masks(mut self) -> Self {
        self.masked = true;
        self
    }

    /// The bright square for anomalous samples, empty otherwise.
    fn mask(&self, idx: usize) -> ImageTensor {
        let mut mask = ImageTensor::zeros(1, SIZE, SIZE);
        if idx >= self.anomalous_from {
            for y in 5..10 {
                for x in 5..10 {
                    mask.data[y * SIZE + x] = 1.0;
                }
            }
        }
        mask
    }

    fn image(&self, idx: usize) -> ImageTensor {
        let mut img = ImageTensor::zeros(1, SIZE, SIZE);
        for y in 2..SIZE - 2 {
            for x in 2..SIZE - 2 {
                img.data[y * SIZE + x] = 0.3 + 0.02 * ((x + y + idx) % 5) as f32;
            }
        }
        if idx >= self.anomalous_from {
            for y in 5..10 {
                for x in 5..10 {
                    img.data[y * SIZE + x] = 1.0;
                }
            }
        }
        img
    }
}

impl SampleProvider for Synthetic {
    fn len(&self) -> usize {
        self.n
    }

    fn get(&self, idx: usize) -> CohortResult<Sample> {
        if idx >= self.n {
            return Err(cohort::CohortError::IndexOutOfBounds { index: idx, len: self.n });
        }
        let image = self.image(idx);
        let anomalous = idx >= self.anomalous_from;
        if self.contrastive {
            let k = idx % 2;
            return Ok(Sample {
                image: image.rotate90(k),
                mask: None,
                label: Some(k as i64),
                augmented: Some(image.rotate90(k).flip_horizontal().jitter(1.1, 0.05)),
            });
        }
        Ok(Sample {
            image,
            mask: self.masked.then(|| self.mask(idx)),
            label: Some(anomalous as i64),
            augmented: None,
        })
    }

    fn name(&self) -> &str {
        "synthetic"
    }
}

fn vae_config() -> ConvVaeConfig {
    ConvVaeConfig::new(1, SIZE).with_base_channels(2).with_latent_dim(4)
}

fn contrastive_config() -> ContrastiveNetConfig {
    ContrastiveNetConfig::new(1)
        .with_base_channels(2)
        .with_proj_hidden(8)
        .with_proj_dim(4)
}

fn read_jsonl(path: &Path) -> Vec<serde_json::Value> {
    std::fs::read_to_string(path)
        .unwrap()
        .lines()
        .map(|l| serde_json::from_str(l).unwrap())
        .collect()
}

#[test]
fn test_reconstruction_run_stops_on_step_budget() {
    let tmp = TempDir::new().unwrap();
    let device = Default::default();
    let loader = BatchProvider::new(Arc::new(Synthetic::normal(10)), 4).with_shuffle(7);

    let config = TrainingConfig::new()
        .with_lr(1e-3)
        .with_max_steps(Some(5))
        .with_max_epochs(100)
        .with_log_frequency(2)
        .with_save_checkpoint(4)
        .with_schedule(LrScheduleKind::Constant);
    let model: ConvVae<TestAutodiffBackend> = vae_config().init(&device);
    let optimizer = AdamConfig::new().init();
    let composer = ReconstructionComposer::new(ReconstructionLossConfig::new().with_level_cams(-2));

    let metrics_path = tmp.path().join("metrics.jsonl");
    let mut sink = JsonlSink::create(&metrics_path).unwrap();
    let store = CheckpointStore::new(tmp.path().join("ckpt"));

    let outcome = train(
        &config, model, optimizer, &loader, &composer, &mut sink, &store, None, &device,
    )
    .unwrap();
    drop(sink);

    // 3 batches per epoch: steps 1-3 in epoch 0, 4-5 in epoch 1
    assert_eq!(outcome.termination, Termination::MaxSteps { step: 5 });
    assert_eq!(outcome.state.step, 5);
    assert_eq!(outcome.state.epoch, 1);

    assert!(store.path("step_4").join("model.mpk").exists());
    assert!(!store.path("step_2").exists());
    assert!(store.path("final").join("model.mpk").exists());
    assert_eq!(store.load_meta("final").unwrap().step, 5);

    // Logs at steps 2 and 4, then the leftover window at step 5
    let lines = read_jsonl(&metrics_path);
    let steps: Vec<u64> = lines.iter().map(|l| l["step"].as_u64().unwrap()).collect();
    assert_eq!(steps, vec![2, 4, 5]);
    for key in ["reconstruction", "kl", "entropy", "total"] {
        assert!(lines[0][key].as_f64().unwrap().is_finite(), "{key}");
    }
    assert_eq!(lines[0]["lr"].as_f64().unwrap(), 1e-3);

    // Final weights reload into a fresh model
    let reloaded = load_model(vae_config().init::<TestBackend>(&device), &store.path("final"), &device);
    assert!(reloaded.is_ok());
}

#[test]
fn test_contrastive_run_stops_on_epoch_budget() {
    let tmp = TempDir::new().unwrap();
    let device = Default::default();
    let loader = BatchProvider::new(Arc::new(Synthetic::contrastive(6)), 4)
        .with_workers(2, 1)
        .with_shuffle(3);

    let config = TrainingConfig::new()
        .with_lr(0.01)
        .with_max_epochs(2)
        .with_log_frequency(1)
        .with_save_checkpoint(0);
    let model: ContrastiveNet<TestAutodiffBackend> = contrastive_config().init(&device);
    let optimizer = SgdConfig::new()
        .with_momentum(Some(MomentumConfig::new().with_momentum(0.9).with_dampening(0.0)))
        .with_weight_decay(Some(WeightDecayConfig::new(3e-4)))
        .init();
    let composer = ContrastiveComposer::new(ContrastiveLossConfig::new());

    let mut sink = MemorySink::default();
    let store = CheckpointStore::new(tmp.path());
    let outcome = train(
        &config, model, optimizer, &loader, &composer, &mut sink, &store, None, &device,
    )
    .unwrap();

    // 2 batches per epoch (4 + 2)
    assert_eq!(outcome.termination, Termination::MaxEpochs { epoch: 2 });
    assert_eq!(outcome.state.step, 4);
    assert_eq!(sink.records.len(), 4);
    for (i, (step, values)) in sink.records.iter().enumerate() {
        assert_eq!(*step, i + 1);
        let names: Vec<&str> = values.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(names, vec!["contrastive", "classification", "total", "lr"]);
    }

    // Cosine: epoch 1 runs below the base rate
    let lr_epoch0 = sink.records[0].1[3].1;
    let lr_epoch1 = sink.records[2].1[3].1;
    assert!((lr_epoch0 - 0.01).abs() < 1e-12);
    assert!(lr_epoch1 < lr_epoch0);

    assert!(store.path("final").join("model.mpk").exists());
    assert!(!store.path("step_1").exists());
}

#[test]
fn test_only_simclr_logs_single_component() {
    let tmp = TempDir::new().unwrap();
    let device = Default::default();
    let loader = BatchProvider::new(Arc::new(Synthetic::contrastive(4)), 2);

    let config = TrainingConfig::new().with_max_steps(Some(2)).with_log_frequency(1);
    let model: ContrastiveNet<TestAutodiffBackend> = contrastive_config().init(&device);
    let composer = ContrastiveComposer::new(ContrastiveLossConfig::new().with_only_simclr(true));
    let mut sink = MemorySink::default();

    train(
        &config,
        model,
        SgdConfig::new().init(),
        &loader,
        &composer,
        &mut sink,
        &CheckpointStore::new(tmp.path()),
        None,
        &device,
    )
    .unwrap();

    let names: Vec<&str> = sink.records[0].1.iter().map(|(k, _)| k.as_str()).collect();
    assert_eq!(names, vec!["contrastive", "lr"]);
}

#[test]
fn test_evaluation_runs_on_cadence() {
    let tmp = TempDir::new().unwrap();
    let device = Default::default();
    let loader = BatchProvider::new(Arc::new(Synthetic::normal(8)), 4);
    let test_loader = BatchProvider::new(Arc::new(Synthetic::labelled(3, 3)), 4).with_shuffle(1);

    let evaluator = Evaluator::new(AnomalyScorer::new(-1, AggregationPolicy::Mean))
        .with_group("test", test_loader);
    let mut callback = evaluator.callback::<TestBackend, ConvVae<TestBackend>>(&device);
    let eval: &mut EvalFn<'_, ConvVae<TestBackend>> = &mut callback;

    let config = TrainingConfig::new()
        .with_lr(1e-3)
        .with_max_steps(Some(4))
        .with_log_frequency(0)
        .with_anom_val_frequency(2)
        .with_schedule(LrScheduleKind::Constant);
    let model: ConvVae<TestAutodiffBackend> = vae_config().init(&device);
    let composer = ReconstructionComposer::new(ReconstructionLossConfig::new().with_level_cams(-1));
    let mut sink = MemorySink::default();

    train(
        &config,
        model,
        AdamConfig::new().init(),
        &loader,
        &composer,
        &mut sink,
        &CheckpointStore::new(tmp.path()),
        Some(eval),
        &device,
    )
    .unwrap();

    // Evaluations at steps 2 and 4, then the final loss window at step 4
    let eval_steps: Vec<usize> = sink
        .records
        .iter()
        .filter(|(_, values)| values.iter().any(|(k, _)| k == "test/auroc"))
        .map(|(step, _)| *step)
        .collect();
    assert_eq!(eval_steps, vec![2, 4]);

    let (_, values) = &sink.records[0];
    let get = |name: &str| values.iter().find(|(k, _)| k == name).map(|(_, v)| *v).unwrap();
    assert_eq!(get("test/n_normal"), 3.0);
    assert_eq!(get("test/n_anomalous"), 3.0);
    let auroc = get("test/auroc");
    assert!((0.0..=1.0).contains(&auroc));
}

#[test]
fn test_evaluation_error_halts_training() {
    let tmp = TempDir::new().unwrap();
    let device = Default::default();
    let loader = BatchProvider::new(Arc::new(Synthetic::normal(8)), 4);
    // Normal-only test group cannot be evaluated
    let evaluator = Evaluator::new(AnomalyScorer::new(-1, AggregationPolicy::Max))
        .with_group("broken", BatchProvider::new(Arc::new(Synthetic::normal(4)), 2));
    let mut callback = evaluator.callback::<TestBackend, ConvVae<TestBackend>>(&device);
    let eval: &mut EvalFn<'_, ConvVae<TestBackend>> = &mut callback;

    let config = TrainingConfig::new().with_max_steps(Some(4)).with_anom_val_frequency(1);
    let composer = ReconstructionComposer::new(ReconstructionLossConfig::new().with_level_cams(-1));
    let result = train(
        &config,
        vae_config().init::<TestAutodiffBackend>(&device),
        AdamConfig::new().init(),
        &loader,
        &composer,
        &mut MemorySink::default(),
        &CheckpointStore::new(tmp.path()),
        Some(eval),
        &device,
    );
    assert!(result.is_err());
    assert!(!tmp.path().join("final").exists());
}

#[test]
fn test_empty_training_set_rejected() {
    let tmp = TempDir::new().unwrap();
    let device = Default::default();
    let loader = BatchProvider::new(Arc::new(Synthetic::normal(0)), 4);
    let composer = ReconstructionComposer::new(ReconstructionLossConfig::new());
    let result = train(
        &TrainingConfig::new(),
        vae_config().init::<TestAutodiffBackend>(&device),
        AdamConfig::new().init(),
        &loader,
        &composer,
        &mut MemorySink::default(),
        &CheckpointStore::new(tmp.path()),
        None,
        &device,
    );
    assert!(result.is_err());
}

#[test]
fn test_training_from_png_partition() {
    let tmp = TempDir::new().unwrap();
    let img_dir = tmp.path().join("imgs");
    std::fs::create_dir_all(&img_dir).unwrap();
    let samples = (0..5)
        .map(|i| {
            let path = img_dir.join(format!("{i}.png"));
            GrayImage::from_fn(20, 18, |x, y| Luma([((x * 7 + y * 3 + i * 11) % 256) as u8]))
                .save(&path)
                .unwrap();
            SampleRef { path, label: Label::Normal }
        })
        .collect();
    let partition = Partition { name: "train".to_string(), samples };
    let transform = ImageTransform::new(SIZE as u32, 1, true, ResizeMode::ShorterSide);
    let dataset = NormalDataset::new(&partition, transform);
    let loader = BatchProvider::new(Arc::new(dataset), 2).with_workers(2, 2);

    let device = Default::default();
    let config = TrainingConfig::new()
        .with_lr(1e-4)
        .with_max_epochs(1)
        .with_log_frequency(3)
        .with_schedule(LrScheduleKind::Constant);
    let composer = ReconstructionComposer::new(ReconstructionLossConfig::new());
    let jsonl = tmp.path().join("logs/metrics.jsonl");
    let mut sink = FanoutSink::new()
        .with(MemorySink::default())
        .with(JsonlSink::create(&jsonl).unwrap());

    let outcome = train(
        &config,
        vae_config().init::<TestAutodiffBackend>(&device),
        AdamConfig::new().init(),
        &loader,
        &composer,
        &mut sink as &mut dyn MetricSink,
        &CheckpointStore::new(tmp.path().join("ckpt")),
        None,
        &device,
    )
    .unwrap();
    drop(sink);

    assert_eq!(outcome.termination, Termination::MaxEpochs { epoch: 1 });
    assert_eq!(outcome.state.step, 3);
    assert_eq!(read_jsonl(&jsonl).len(), 1);
}

#[test]
fn test_masked_group_reports_pixel_precision() {
    let device = Default::default();
    let model: ConvVae<TestBackend> = vae_config().init(&device);
    let scorer = AnomalyScorer::new(-1, AggregationPolicy::ForegroundMax { rebase: true });
    let masked = Synthetic::labelled(3, 3).with_masks();
    let evaluator = Evaluator::new(scorer)
        .with_group("masked", BatchProvider::new(Arc::new(masked), 4))
        .with_group("plain", BatchProvider::new(Arc::new(Synthetic::labelled(3, 3)), 4));

    let reports = evaluator.evaluate(&model, &device).unwrap();
    assert_eq!(reports.len(), 2);
    let pixel_ap = reports[0].1.pixel_average_precision.unwrap();
    assert!((0.0..=1.0).contains(&pixel_ap));
    assert!(reports[1].1.pixel_average_precision.is_none());

    let metrics = evaluator.evaluate_metrics(&model, &device).unwrap();
    assert!(metrics.iter().any(|(k, _)| k == "masked/pixel_average_precision"));
    assert!(!metrics.iter().any(|(k, _)| k == "plain/pixel_average_precision"));
}
