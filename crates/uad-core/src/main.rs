use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use uad_core::config::{DataCli, TrainingCli};
use uad_core::pipeline::{
    self, EvaluateArgs, ModelKind, SplitsArgs, TrainAmconsArgs, TrainCcdArgs,
};

/// uad: unsupervised anomaly detection on medical images.
#[derive(Parser)]
#[command(name = "uad", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

/// Data flags shared by every subcommand.
#[derive(Args, Debug)]
struct DataFlags {
    /// Override the datasets root directory.
    #[arg(long)]
    datasets_dir: Option<PathBuf>,
    /// Override the batch size.
    #[arg(long)]
    batch_size: Option<usize>,
    /// Override the number of loader worker threads.
    #[arg(long)]
    num_workers: Option<usize>,
}

impl From<DataFlags> for DataCli {
    fn from(flags: DataFlags) -> Self {
        Self {
            datasets_dir: flags.datasets_dir,
            batch_size: flags.batch_size,
            num_workers: flags.num_workers,
        }
    }
}

/// Training-budget flags shared by both training subcommands.
#[derive(Args, Debug)]
struct TrainingFlags {
    /// Override the base learning rate.
    #[arg(long)]
    lr: Option<f64>,
    /// Override the optimizer step budget.
    #[arg(long)]
    max_steps: Option<usize>,
    /// Override the epoch budget.
    #[arg(long)]
    max_epochs: Option<usize>,
}

impl From<TrainingFlags> for TrainingCli {
    fn from(flags: TrainingFlags) -> Self {
        Self {
            lr: flags.lr,
            max_steps: flags.max_steps,
            max_epochs: flags.max_epochs,
        }
    }
}

/// CLI subcommands for partitioning, training and evaluation.
#[derive(Subcommand)]
enum Command {
    /// Print the partition sizes for a configuration.
    Splits {
        /// Path to config TOML file.
        #[arg(long, default_value = "configs/uad.toml")]
        config: PathBuf,
        #[command(flatten)]
        data: DataFlags,
        /// Output as JSON instead of human-readable text.
        #[arg(long)]
        json: bool,
    },
    /// Contrastive pretext training (NT-Xent + rotation classifier).
    TrainCcd {
        /// Path to config TOML file.
        #[arg(long, default_value = "configs/uad.toml")]
        config: PathBuf,
        /// Directory for checkpoints and metrics.
        #[arg(long, default_value = "checkpoints/ccd")]
        output_dir: PathBuf,
        #[command(flatten)]
        data: DataFlags,
        #[command(flatten)]
        training: TrainingFlags,
        /// Train only with the NT-Xent term.
        #[arg(long)]
        only_simclr: bool,
    },
    /// Reconstruction + attention-entropy training of the VAE.
    TrainAmcons {
        /// Path to config TOML file.
        #[arg(long, default_value = "configs/uad.toml")]
        config: PathBuf,
        /// Directory for checkpoints and metrics.
        #[arg(long, default_value = "checkpoints/amcons")]
        output_dir: PathBuf,
        #[command(flatten)]
        data: DataFlags,
        #[command(flatten)]
        training: TrainingFlags,
    },
    /// Score both test groups with a trained checkpoint.
    Evaluate {
        /// Path to config TOML file.
        #[arg(long, default_value = "configs/uad.toml")]
        config: PathBuf,
        /// Checkpoint directory (e.g. checkpoints/amcons/final).
        #[arg(long)]
        checkpoint: PathBuf,
        /// Model stored in the checkpoint.
        #[arg(long, value_enum, default_value_t = ModelKind::Vae)]
        model: ModelKind,
        #[command(flatten)]
        data: DataFlags,
        /// Path to write JSON evaluation results.
        #[arg(long)]
        output: Option<PathBuf>,
    },
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Splits { config, data, json } => pipeline::run_splits(SplitsArgs {
            config,
            data: data.into(),
            json,
        })
        .map(|_| ()),
        Command::TrainCcd {
            config,
            output_dir,
            data,
            training,
            only_simclr,
        } => pipeline::run_train_ccd(TrainCcdArgs {
            config,
            output_dir,
            data: data.into(),
            training: training.into(),
            only_simclr,
        })
        .map(|_| ()),
        Command::TrainAmcons {
            config,
            output_dir,
            data,
            training,
        } => pipeline::run_train_amcons(TrainAmconsArgs {
            config,
            output_dir,
            data: data.into(),
            training: training.into(),
        })
        .map(|_| ()),
        Command::Evaluate {
            config,
            checkpoint,
            model,
            data,
            output,
        } => pipeline::run_evaluate(EvaluateArgs {
            config,
            checkpoint,
            model,
            data: data.into(),
            output,
        })
        .map(|_| ()),
    }
}
