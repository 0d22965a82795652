//! Partitioning, training and evaluation pipelines behind the CLI subcommands.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use burn::backend::ndarray::{NdArray, NdArrayDevice};
use burn::backend::Autodiff;
use burn::optim::decay::WeightDecayConfig;
use burn::optim::momentum::MomentumConfig;
use burn::optim::{AdamConfig, SgdConfig};

use anomaly::evaluate::Evaluator;
use anomaly::inference::{AggregationPolicy, AnomalyScorer};
use anomaly::model::contrastive::ContrastiveNet;
use anomaly::model::vae::ConvVae;
use anomaly::training::checkpoint::{load_model, CheckpointStore};
use anomaly::training::composer::{ContrastiveComposer, ReconstructionComposer};
use anomaly::training::metrics::{FanoutSink, JsonlSink, TracingSink};
use anomaly::training::trainer::{train, EvalFn, TrainOutcome};
use cohort::{
    partition_provider, AnomalDataset, BatchProvider, ContrastiveDataset, DataConfig,
    ImageTransform, NormalDataset, ResizeMode, TestGroup, TestPartitions,
};

use crate::config::{
    build_contrastive_loss, build_contrastive_net_config, build_data_config,
    build_reconstruction_loss, build_training_config, build_vae_config, load_uad_toml,
    scoring_level, DataCli, Regime, TrainingCli,
};
use crate::results::{EvalResult, GroupResult, SplitSummary, TrainSummary};

type TrainBackend = Autodiff<NdArray<f32>>;
type InferenceBackend = NdArray<f32>;

const SGD_MOMENTUM: f64 = 0.9;
const SGD_WEIGHT_DECAY: f32 = 3e-4;

/// Which reference model a checkpoint holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum ModelKind {
    /// Convolutional VAE from `train-amcons`.
    Vae,
    /// Contrastive network from `train-ccd`.
    Contrastive,
}

impl ModelKind {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Vae => "vae",
            Self::Contrastive => "contrastive",
        }
    }
}

/// Arguments for the `splits` subcommand.
#[derive(Debug)]
pub struct SplitsArgs {
    /// Path to the config TOML file.
    pub config: PathBuf,
    pub data: DataCli,
    /// Print JSON instead of human-readable text.
    pub json: bool,
}

/// Arguments for the `train-ccd` subcommand.
#[derive(Debug)]
pub struct TrainCcdArgs {
    pub config: PathBuf,
    /// Directory for checkpoints, metrics and the run summary.
    pub output_dir: PathBuf,
    pub data: DataCli,
    pub training: TrainingCli,
    /// Train only with the NT-Xent term.
    pub only_simclr: bool,
}

/// Arguments for the `train-amcons` subcommand.
#[derive(Debug)]
pub struct TrainAmconsArgs {
    pub config: PathBuf,
    pub output_dir: PathBuf,
    pub data: DataCli,
    pub training: TrainingCli,
}

/// Arguments for the `evaluate` subcommand.
#[derive(Debug)]
pub struct EvaluateArgs {
    pub config: PathBuf,
    /// Checkpoint directory (or its `model.mpk`).
    pub checkpoint: PathBuf,
    pub model: ModelKind,
    pub data: DataCli,
    /// Optional path for JSON results.
    pub output: Option<PathBuf>,
}

/// Compute the partitions for a configuration and print their sizes.
pub fn run_splits(args: SplitsArgs) -> anyhow::Result<SplitSummary> {
    let toml = load_uad_toml(&args.config)?;
    let data = build_data_config(toml.data, &args.data)?;
    let provider = partition_provider(&data);

    let train = provider.train_partitions()?;
    let test = provider.test_partitions()?;
    let summary = SplitSummary {
        provider: provider.name().to_string(),
        train: train.train.len(),
        val: train.val.as_ref().map_or(0, |v| v.len()),
        primary_normal: test.primary.normal.len(),
        primary_anomalous: test.primary.anomal.len(),
        secondary_normal: test.secondary.normal.len(),
        secondary_anomalous: test.secondary.anomal.len(),
        overlap: train.overlap_with(&test),
    };

    if args.json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        println!("--- Partitions ({}) ---", summary.provider);
        println!("Train: {}", summary.train);
        println!("Validation: {}", summary.val);
        println!(
            "Test primary: {} normal / {} anomalous",
            summary.primary_normal, summary.primary_anomalous
        );
        println!(
            "Test secondary: {} normal / {} anomalous",
            summary.secondary_normal, summary.secondary_anomalous
        );
        println!("Train/test overlap: {}", summary.overlap);
    }
    Ok(summary)
}

/// Contrastive pretext training of the contrastive network.
pub fn run_train_ccd(args: TrainCcdArgs) -> anyhow::Result<TrainSummary> {
    let start = Instant::now();

    // 1. Load config
    let toml = load_uad_toml(&args.config)?;
    let data = build_data_config(toml.data, &args.data)?;
    let config = build_training_config(Regime::Contrastive, &toml.training, &args.training);
    let loss = build_contrastive_loss(&toml.loss, args.only_simclr);

    // 2. Partition and build the loader
    let provider = partition_provider(&data);
    let partitions = provider.train_partitions()?;
    tracing::info!(
        provider = provider.name(),
        train = partitions.train.len(),
        val = partitions.val.as_ref().map_or(0, |v| v.len()),
        "Partitioned training data"
    );
    let transform = ImageTransform::from_config(&data, ResizeMode::ShorterSide);
    let dataset = ContrastiveDataset::new(&partitions.train, transform, data.cls_head_number, data.seed);
    let loader = BatchProvider::from_config(Arc::new(dataset), &data, true);

    // 3. Model and optimizer
    let device = NdArrayDevice::Cpu;
    let model: ContrastiveNet<TrainBackend> = build_contrastive_net_config(&toml.model, &data).init(&device);
    let optimizer = SgdConfig::new()
        .with_momentum(Some(
            MomentumConfig::new()
                .with_momentum(SGD_MOMENTUM)
                .with_dampening(0.0),
        ))
        .with_weight_decay(Some(WeightDecayConfig::new(SGD_WEIGHT_DECAY)))
        .init();
    tracing::info!(
        temperature = loss.temperature,
        only_simclr = loss.only_simclr,
        classes = data.cls_head_number,
        "Contrastive loss"
    );

    // 4. Train
    let mut sink = metric_sink(&args.output_dir)?;
    let store = CheckpointStore::new(args.output_dir.clone());
    let composer = ContrastiveComposer::new(loss);
    let outcome = train(
        &config, model, optimizer, &loader, &composer, &mut sink, &store, None, &device,
    )?;

    write_train_summary(Regime::Contrastive, &args.output_dir, &store, &outcome, loader.len(), start)
}

/// Reconstruction + attention-entropy training of the VAE, with optional
/// periodic evaluation on the secondary test group.
pub fn run_train_amcons(args: TrainAmconsArgs) -> anyhow::Result<TrainSummary> {
    let start = Instant::now();

    // 1. Load config
    let toml = load_uad_toml(&args.config)?;
    let data = build_data_config(toml.data, &args.data)?;
    let config = build_training_config(Regime::Reconstruction, &toml.training, &args.training);
    let loss = build_reconstruction_loss(&toml.loss);

    // 2. Partition and build the loaders
    let provider = partition_provider(&data);
    let partitions = provider.train_partitions()?;
    tracing::info!(
        provider = provider.name(),
        train = partitions.train.len(),
        val = partitions.val.as_ref().map_or(0, |v| v.len()),
        "Partitioned training data"
    );
    let transform = ImageTransform::from_config(&data, ResizeMode::ShorterSide);
    let loader = BatchProvider::from_config(
        Arc::new(NormalDataset::new(&partitions.train, transform)),
        &data,
        true,
    );

    let device = NdArrayDevice::Cpu;
    let evaluator = if config.anom_val_frequency > 0 {
        let test = provider.test_partitions()?;
        let scorer = AnomalyScorer::new(
            scoring_level(&toml.loss),
            AggregationPolicy::from_config(&data, toml.training.get_images),
        );
        Some(Evaluator::new(scorer).with_group("val", test_loader("val", &test.secondary, &data)))
    } else {
        None
    };
    let mut callback = evaluator
        .as_ref()
        .map(|e| e.callback::<InferenceBackend, ConvVae<InferenceBackend>>(&device));
    let eval = match callback.as_mut() {
        Some(f) => Some(f as &mut EvalFn<'_, ConvVae<InferenceBackend>>),
        None => None,
    };

    // 3. Model and optimizer
    let model: ConvVae<TrainBackend> = build_vae_config(&toml.model, &data).init(&device);
    let optimizer = AdamConfig::new().init();
    tracing::info!(
        wkl = loss.wkl,
        w_entropy = loss.w_entropy,
        level_cams = loss.level_cams,
        "Reconstruction loss"
    );

    // 4. Train
    let mut sink = metric_sink(&args.output_dir)?;
    let store = CheckpointStore::new(args.output_dir.clone());
    let composer = ReconstructionComposer::new(loss);
    let outcome = train(
        &config, model, optimizer, &loader, &composer, &mut sink, &store, eval, &device,
    )?;

    write_train_summary(Regime::Reconstruction, &args.output_dir, &store, &outcome, loader.len(), start)
}

/// Score both test groups with a trained checkpoint.
pub fn run_evaluate(args: EvaluateArgs) -> anyhow::Result<EvalResult> {
    let toml = load_uad_toml(&args.config)?;
    let data = build_data_config(toml.data, &args.data)?;
    let provider = partition_provider(&data);
    let test = provider.test_partitions()?;

    let scorer = AnomalyScorer::new(
        scoring_level(&toml.loss),
        AggregationPolicy::from_config(&data, toml.training.get_images),
    );
    let evaluator = test_loaders(&data, &test)
        .into_iter()
        .fold(Evaluator::new(scorer), |ev, (name, loader)| ev.with_group(name, loader));

    let device = NdArrayDevice::Cpu;
    tracing::info!(
        checkpoint = %args.checkpoint.display(),
        model = args.model.name(),
        "Loading checkpoint"
    );
    let reports = match args.model {
        ModelKind::Vae => {
            let init = build_vae_config(&toml.model, &data).init::<InferenceBackend>(&device);
            let model = load_model(init, &args.checkpoint, &device)?;
            evaluator.evaluate(&model, &device)?
        }
        ModelKind::Contrastive => {
            let init = build_contrastive_net_config(&toml.model, &data).init::<InferenceBackend>(&device);
            let model = load_model(init, &args.checkpoint, &device)?;
            evaluator.evaluate(&model, &device)?
        }
    };

    let result = EvalResult {
        checkpoint: args.checkpoint.display().to_string(),
        model: args.model.name().to_string(),
        modality: data.modality.to_string(),
        dataset: data.dataset.clone(),
        level: scorer.level,
        aggregation: format!("{:?}", scorer.policy),
        groups: reports
            .into_iter()
            .map(|(name, report)| GroupResult { name, report })
            .collect(),
    };

    println!("--- Evaluation ({}, {}) ---", result.modality, result.aggregation);
    for group in &result.groups {
        println!(
            "{}: AUROC {:.4}  AP {:.4}  ({} normal / {} anomalous)",
            group.name,
            group.report.auroc,
            group.report.average_precision,
            group.report.n_normal,
            group.report.n_anomalous
        );
    }

    if let Some(path) = &args.output {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        serde_json::to_writer_pretty(std::fs::File::create(path)?, &result)?;
        tracing::info!(path = %path.display(), "Wrote evaluation results");
    }
    Ok(result)
}

/// Shuffled loaders over both test groups, named `test_primary` and `test_secondary`.
fn test_loaders(data: &DataConfig, test: &TestPartitions) -> Vec<(String, BatchProvider)> {
    [("test_primary", &test.primary), ("test_secondary", &test.secondary)]
        .into_iter()
        .map(|(name, group)| (name.to_string(), test_loader(name, group, data)))
        .collect()
}

/// Shuffled loader over one labelled test group.
fn test_loader(name: &str, group: &TestGroup, data: &DataConfig) -> BatchProvider {
    let transform = ImageTransform::from_config(data, ResizeMode::Exact);
    let dataset = AnomalDataset::new(name, group, transform);
    BatchProvider::from_config(Arc::new(dataset), data, true)
}

/// Tracing output plus `<output_dir>/metrics.jsonl`.
fn metric_sink(output_dir: &Path) -> anyhow::Result<FanoutSink> {
    std::fs::create_dir_all(output_dir)?;
    let jsonl = JsonlSink::create(&output_dir.join("metrics.jsonl"))?;
    Ok(FanoutSink::new().with(TracingSink).with(jsonl))
}

fn write_train_summary<M>(
    regime: Regime,
    output_dir: &Path,
    store: &CheckpointStore,
    outcome: &TrainOutcome<M>,
    train_samples: usize,
    start: Instant,
) -> anyhow::Result<TrainSummary> {
    let summary = TrainSummary {
        regime: regime.name().to_string(),
        termination: outcome.termination.to_string(),
        steps: outcome.state.step,
        epochs: outcome.state.epoch,
        final_lr: outcome.state.lr,
        train_samples,
        final_checkpoint: store.path("final").display().to_string(),
        elapsed_secs: start.elapsed().as_secs_f64(),
    };
    let path = output_dir.join("summary.json");
    serde_json::to_writer_pretty(std::fs::File::create(&path)?, &summary)?;

    println!("\n--- Training Summary ({}) ---", summary.regime);
    println!("Stopped: {}", summary.termination);
    println!("Steps: {}  Epochs: {}", summary.steps, summary.epochs);
    println!("Final checkpoint: {}", summary.final_checkpoint);
    println!("Elapsed: {:.1}s", summary.elapsed_secs);
    Ok(summary)
}
