//! TOML config loading for the `uad` CLI.
//!
//! Deserializes `configs/uad.toml`, which has `[data]`, `[training]`, `[loss]`
//! and `[model]` sections, then merges with CLI overrides.
//! Priority chain: regime defaults < TOML values < CLI flags.

use std::path::{Path, PathBuf};

use anomaly::model::contrastive::ContrastiveNetConfig;
use anomaly::model::vae::ConvVaeConfig;
use anomaly::training::composer::{ContrastiveLossConfig, ReconstructionLossConfig};
use anomaly::training::trainer::{LrScheduleKind, TrainingConfig};
use cohort::DataConfig;
use serde::Deserialize;

/// Top-level structure matching `configs/uad.toml`. Every section is optional.
#[derive(Debug, Default, Deserialize)]
pub struct UadToml {
    #[serde(default)]
    pub data: DataConfig,
    #[serde(default)]
    pub training: TrainingOverrides,
    #[serde(default)]
    pub loss: LossOverrides,
    #[serde(default)]
    pub model: ModelOverrides,
}

/// Optional overrides for `TrainingConfig` fields.
#[derive(Debug, Default, Deserialize)]
pub struct TrainingOverrides {
    pub lr: Option<f64>,
    pub max_steps: Option<usize>,
    pub max_epochs: Option<usize>,
    pub log_frequency: Option<usize>,
    pub save_checkpoint: Option<usize>,
    pub anom_val_frequency: Option<usize>,
    pub schedule: Option<LrScheduleKind>,
    pub eta_min_ratio: Option<f64>,
    /// Rebase foreground maps by their minimum when scoring MRI/CT.
    #[serde(default)]
    pub get_images: bool,
}

/// Optional overrides for both loss policies.
#[derive(Debug, Default, Deserialize)]
pub struct LossOverrides {
    pub temperature: Option<f64>,
    pub only_simclr: Option<bool>,
    pub wkl: Option<f64>,
    #[serde(alias = "wH")]
    pub w_entropy: Option<f64>,
    /// Feature layer used for attention maps and anomaly maps.
    pub level_cams: Option<isize>,
}

/// Optional overrides for the reference model sizes.
#[derive(Debug, Default, Deserialize)]
pub struct ModelOverrides {
    pub base_channels: Option<usize>,
    pub depth: Option<usize>,
    pub latent_dim: Option<usize>,
    pub proj_hidden: Option<usize>,
    pub proj_dim: Option<usize>,
}

/// CLI flags shared by every subcommand that touches data.
#[derive(Debug, Default, Clone)]
pub struct DataCli {
    pub datasets_dir: Option<PathBuf>,
    pub batch_size: Option<usize>,
    pub num_workers: Option<usize>,
}

/// CLI flags of the training subcommands.
#[derive(Debug, Default, Clone)]
pub struct TrainingCli {
    pub lr: Option<f64>,
    pub max_steps: Option<usize>,
    pub max_epochs: Option<usize>,
}

/// Which training regime a config is built for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Regime {
    /// Contrastive pretext training (SGD, cosine schedule).
    Contrastive,
    /// Reconstruction + attention-entropy training (Adam, constant rate).
    Reconstruction,
}

impl Regime {
    /// Defaults of each regime before TOML and CLI overrides.
    pub fn default_training(&self) -> TrainingConfig {
        match self {
            Self::Contrastive => TrainingConfig::new()
                .with_lr(0.01)
                .with_max_epochs(200)
                .with_max_steps(Some(20_000))
                .with_log_frequency(200)
                .with_save_checkpoint(2000)
                .with_schedule(LrScheduleKind::Cosine),
            Self::Reconstruction => TrainingConfig::new()
                .with_lr(1e-4)
                .with_max_epochs(300)
                .with_max_steps(Some(10_000))
                .with_log_frequency(50)
                .with_save_checkpoint(1000)
                .with_schedule(LrScheduleKind::Constant),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Contrastive => "ccd",
            Self::Reconstruction => "amcons",
        }
    }
}

/// Load and deserialize a `UadToml` from a TOML file.
pub fn load_uad_toml(path: &Path) -> anyhow::Result<UadToml> {
    let contents = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("Failed to read config {}: {e}", path.display()))?;
    let config: UadToml = toml::from_str(&contents)?;
    tracing::info!(path = %path.display(), "Loaded config");
    Ok(config)
}

/// Apply CLI data flags and validate the result.
pub fn build_data_config(mut data: DataConfig, cli: &DataCli) -> anyhow::Result<DataConfig> {
    if let Some(dir) = &cli.datasets_dir {
        data.datasets_dir = dir.clone();
    }
    if let Some(n) = cli.batch_size {
        data.batch_size = n;
    }
    if let Some(n) = cli.num_workers {
        data.num_workers = n;
    }
    data.validate()?;
    Ok(data)
}

/// Build a `TrainingConfig` from regime defaults, TOML overrides and CLI flags.
pub fn build_training_config(
    regime: Regime,
    overrides: &TrainingOverrides,
    cli: &TrainingCli,
) -> TrainingConfig {
    let mut config = regime.default_training();

    // Apply TOML overrides
    if let Some(lr) = overrides.lr {
        config.lr = lr;
    }
    if overrides.max_steps.is_some() {
        config.max_steps = overrides.max_steps;
    }
    if let Some(n) = overrides.max_epochs {
        config.max_epochs = n;
    }
    if let Some(n) = overrides.log_frequency {
        config.log_frequency = n;
    }
    if let Some(n) = overrides.save_checkpoint {
        config.save_checkpoint = n;
    }
    if let Some(n) = overrides.anom_val_frequency {
        config.anom_val_frequency = n;
    }
    if let Some(schedule) = overrides.schedule {
        config.schedule = schedule;
    }
    if let Some(ratio) = overrides.eta_min_ratio {
        config.eta_min_ratio = ratio;
    }

    // CLI overrides take highest priority
    if let Some(lr) = cli.lr {
        config.lr = lr;
    }
    if cli.max_steps.is_some() {
        config.max_steps = cli.max_steps;
    }
    if let Some(n) = cli.max_epochs {
        config.max_epochs = n;
    }

    config
}

/// Contrastive loss settings; `--only-simclr` on the CLI forces the flag on.
pub fn build_contrastive_loss(overrides: &LossOverrides, only_simclr_cli: bool) -> ContrastiveLossConfig {
    let mut config = ContrastiveLossConfig::new();
    if let Some(t) = overrides.temperature {
        config.temperature = t;
    }
    if let Some(flag) = overrides.only_simclr {
        config.only_simclr = flag;
    }
    if only_simclr_cli {
        config.only_simclr = true;
    }
    config
}

pub fn build_reconstruction_loss(overrides: &LossOverrides) -> ReconstructionLossConfig {
    let mut config = ReconstructionLossConfig::new();
    if let Some(w) = overrides.wkl {
        config.wkl = w;
    }
    if let Some(w) = overrides.w_entropy {
        config.w_entropy = w;
    }
    if let Some(level) = overrides.level_cams {
        config.level_cams = level;
    }
    config
}

/// Layer offset used for anomaly maps (same setting as the attention loss).
pub fn scoring_level(overrides: &LossOverrides) -> isize {
    overrides
        .level_cams
        .unwrap_or_else(|| ReconstructionLossConfig::new().level_cams)
}

pub fn build_vae_config(overrides: &ModelOverrides, data: &DataConfig) -> ConvVaeConfig {
    let mut config = ConvVaeConfig::new(data.img_channels, data.image_size as usize);
    if let Some(n) = overrides.base_channels {
        config.base_channels = n;
    }
    if let Some(n) = overrides.depth {
        config.depth = n;
    }
    if let Some(n) = overrides.latent_dim {
        config.latent_dim = n;
    }
    config
}

pub fn build_contrastive_net_config(overrides: &ModelOverrides, data: &DataConfig) -> ContrastiveNetConfig {
    let mut config = ContrastiveNetConfig::new(data.img_channels).with_num_classes(data.cls_head_number);
    if let Some(n) = overrides.base_channels {
        config.base_channels = n;
    }
    if let Some(n) = overrides.depth {
        config.depth = n;
    }
    if let Some(n) = overrides.proj_hidden {
        config.proj_hidden = n;
    }
    if let Some(n) = overrides.proj_dim {
        config.proj_dim = n;
    }
    config
}
