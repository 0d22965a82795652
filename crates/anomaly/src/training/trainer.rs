//! Training loop controller.
//!
//! An explicit state machine `Initializing → Running → Terminated(reason)`
//! drives the model through epochs of a [`BatchProvider`]. Every step runs
//! the [`LossComposer`], back-propagates, updates with the current learning
//! rate and records the loss components. Step-based cadences log windowed
//! loss means, write checkpoints and run evaluation. A single termination
//! predicate is checked after every step and at every epoch boundary; the
//! final checkpoint is always written.

use std::fmt;
use std::time::Instant;

use burn::module::AutodiffModule;
use burn::optim::{GradientsParams, Optimizer};
use burn::prelude::*;
use burn::tensor::backend::AutodiffBackend;
use cohort::BatchProvider;

use crate::training::checkpoint::{CheckpointMeta, CheckpointStore};
use crate::training::composer::LossComposer;
use crate::training::metrics::MetricSink;

/// Learning-rate schedule kind.
#[derive(serde::Serialize, serde::Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LrScheduleKind {
    /// Cosine annealing recomputed at every epoch boundary.
    Cosine,
    /// Base rate throughout.
    Constant,
}

impl fmt::Display for LrScheduleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cosine => write!(f, "cosine"),
            Self::Constant => write!(f, "constant"),
        }
    }
}

/// Configuration for the training loop.
#[derive(Config, Debug)]
pub struct TrainingConfig {
    /// Base learning rate.
    #[config(default = 0.01)]
    pub lr: f64,
    /// Stop after this many optimizer steps.
    pub max_steps: Option<usize>,
    /// Stop after this many full epochs.
    #[config(default = 200)]
    pub max_epochs: usize,
    /// Steps between loss logs (0 disables).
    #[config(default = 50)]
    pub log_frequency: usize,
    /// Steps between checkpoints (0 disables; the final one is always written).
    #[config(default = 1000)]
    pub save_checkpoint: usize,
    /// Steps between evaluations (0 disables).
    #[config(default = 0)]
    pub anom_val_frequency: usize,
    #[config(default = "LrScheduleKind::Cosine")]
    pub schedule: LrScheduleKind,
    /// Cosine floor as a fraction of the base rate.
    #[config(default = 1e-3)]
    pub eta_min_ratio: f64,
}

/// Learning rate at the start of `epoch`.
///
/// Cosine: `floor + (base − floor)(1 + cos(π·epoch/max_epochs))/2` with
/// `floor = base · eta_min_ratio`. Not compounded: each epoch's rate depends
/// only on the epoch index.
pub fn lr_at_epoch(config: &TrainingConfig, epoch: usize) -> f64 {
    match config.schedule {
        LrScheduleKind::Constant => config.lr,
        LrScheduleKind::Cosine => {
            let floor = config.lr * config.eta_min_ratio;
            let progress = if config.max_epochs == 0 {
                1.0
            } else {
                (epoch as f64 / config.max_epochs as f64).min(1.0)
            };
            floor + (config.lr - floor) * (1.0 + (std::f64::consts::PI * progress).cos()) / 2.0
        }
    }
}

/// Why the loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    MaxSteps { step: usize },
    MaxEpochs { epoch: usize },
}

impl fmt::Display for Termination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MaxSteps { step } => write!(f, "max steps reached at step {step}"),
            Self::MaxEpochs { epoch } => write!(f, "max epochs reached at epoch {epoch}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Initializing,
    Running,
    Terminated(Termination),
}

/// Per-component sums since the last drain.
#[derive(Debug, Clone, Default)]
pub struct LossAccumulator {
    sums: Vec<(String, f64)>,
    count: usize,
}

impl LossAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, components: &[(String, f64)]) {
        for (name, value) in components {
            match self.sums.iter_mut().find(|(k, _)| k == name) {
                Some((_, sum)) => *sum += value,
                None => self.sums.push((name.clone(), *value)),
            }
        }
        self.count += 1;
    }

    /// Number of steps since the last drain.
    pub fn count(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Mean of every component since the last drain, then reset.
    pub fn drain(&mut self) -> Vec<(String, f64)> {
        let n = self.count.max(1) as f64;
        let means = self.sums.drain(..).map(|(k, s)| (k, s / n)).collect();
        self.count = 0;
        means
    }
}

/// Everything the controller tracks between steps.
#[derive(Debug, Clone)]
pub struct TrainingState {
    /// Completed optimizer steps.
    pub step: usize,
    /// Completed epochs.
    pub epoch: usize,
    pub lr: f64,
    pub losses: LossAccumulator,
    pub phase: Phase,
}

impl TrainingState {
    pub fn new(lr: f64) -> Self {
        Self {
            step: 0,
            epoch: 0,
            lr,
            losses: LossAccumulator::new(),
            phase: Phase::Initializing,
        }
    }

    /// The single termination predicate; the step budget wins ties.
    pub fn termination(&self, config: &TrainingConfig) -> Option<Termination> {
        if let Some(max_steps) = config.max_steps {
            if self.step >= max_steps {
                return Some(Termination::MaxSteps { step: self.step });
            }
        }
        if self.epoch >= config.max_epochs {
            return Some(Termination::MaxEpochs { epoch: self.epoch });
        }
        None
    }

    fn meta(&self) -> CheckpointMeta {
        CheckpointMeta {
            step: self.step,
            epoch: self.epoch,
            lr: self.lr,
        }
    }
}

/// `true` when the 1-based `step` hits a non-zero cadence.
pub fn on_cadence(step: usize, every: usize) -> bool {
    every > 0 && step > 0 && step % every == 0
}

/// Evaluation callback: receives the inference copy of the model and the
/// current step, returns metrics to log.
pub type EvalFn<'a, M> = dyn FnMut(&M, usize) -> anyhow::Result<Vec<(String, f64)>> + 'a;

/// Result of a finished run.
pub struct TrainOutcome<M> {
    pub model: M,
    pub termination: Termination,
    pub state: TrainingState,
}

/// Run the training loop.
///
/// # Arguments
/// - `config`: cadences, budget and learning-rate schedule
/// - `model`: initialised model (consumed and returned updated)
/// - `optimizer`: optimizer built by the caller (SGD for the contrastive
///   regime, Adam for the reconstruction regime)
/// - `loader`: training batches; must not be empty
/// - `composer`: loss policy
/// - `sink`: destination for loss means and evaluation metrics
/// - `store`: checkpoint directory
/// - `evaluate`: optional evaluation callback run every `anom_val_frequency` steps
///
/// # Errors
/// Data-loading, loss, evaluation and checkpoint errors halt the run.
#[allow(clippy::too_many_arguments)]
pub fn train<B, M, O, C>(
    config: &TrainingConfig,
    mut model: M,
    mut optimizer: O,
    loader: &BatchProvider,
    composer: &C,
    sink: &mut dyn MetricSink,
    store: &CheckpointStore,
    mut evaluate: Option<&mut EvalFn<'_, M::InnerModule>>,
    device: &B::Device,
) -> anyhow::Result<TrainOutcome<M>>
where
    B: AutodiffBackend,
    M: AutodiffModule<B>,
    O: Optimizer<M, B>,
    C: LossComposer<B, M>,
{
    if loader.is_empty() {
        anyhow::bail!("Training set {} is empty", loader.dataset().name());
    }

    let mut state = TrainingState::new(lr_at_epoch(config, 0));
    tracing::info!(
        samples = loader.len(),
        batches_per_epoch = loader.num_batches(),
        max_steps = ?config.max_steps,
        max_epochs = config.max_epochs,
        schedule = %config.schedule,
        lr = config.lr,
        "Starting training"
    );
    let train_start = Instant::now();
    state.phase = Phase::Running;

    let termination = loop {
        if let Some(reason) = state.termination(config) {
            break reason;
        }
        state.lr = lr_at_epoch(config, state.epoch);

        let mut stopped = None;
        for batch in loader.epoch(state.epoch) {
            let batch = batch?;
            let loss = composer.compose(&model, &batch, device)?;

            let grads = GradientsParams::from_grads(loss.objective.backward(), &model);
            model = optimizer.step(state.lr, model, grads);
            state.step += 1;
            state.losses.push(&loss.components);

            if on_cadence(state.step, config.log_frequency) {
                let mut values = state.losses.drain();
                values.push(("lr".to_string(), state.lr));
                sink.log(&values, state.step);
                let lr_str = format!("{:.2e}", state.lr);
                tracing::debug!(
                    step = state.step,
                    epoch = state.epoch,
                    lr = %lr_str,
                    elapsed_secs = format!("{:.1}", train_start.elapsed().as_secs_f64()),
                    "Logged training losses"
                );
            }

            if on_cadence(state.step, config.save_checkpoint) {
                store.save(&model, &format!("step_{}", state.step), &state.meta())?;
            }

            if on_cadence(state.step, config.anom_val_frequency) {
                if let Some(eval) = evaluate.as_deref_mut() {
                    let inference_model = model.valid();
                    let metrics = eval(&inference_model, state.step)?;
                    sink.log(&metrics, state.step);
                }
            }

            if let Some(reason) = state.termination(config) {
                stopped = Some(reason);
                break;
            }
        }

        if let Some(reason) = stopped {
            break reason;
        }
        state.epoch += 1;
    };

    state.phase = Phase::Terminated(termination);
    if !state.losses.is_empty() {
        let values = state.losses.drain();
        sink.log(&values, state.step);
    }
    store.save(&model, "final", &state.meta())?;

    tracing::info!(
        step = state.step,
        epoch = state.epoch,
        reason = %termination,
        elapsed_secs = format!("{:.1}", train_start.elapsed().as_secs_f64()),
        "Training complete. Final checkpoint saved."
    );

    Ok(TrainOutcome {
        model,
        termination,
        state,
    })
}
