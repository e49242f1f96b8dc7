//! Per-epoch schedules: trade-off weights, learning-rate decay and the
//! optimizer factory.
//!
//! A [`TradeoffSchedule`] maps an epoch number to one scalar weight. A
//! strategy combines `k` auxiliary losses and therefore needs exactly `k`
//! schedules; [`resolve_tradeoff`] evaluates all of them once per epoch.
//!
//! ```rust
//! use uda_train::schedule::{resolve_tradeoff, TradeoffSchedule};
//!
//! let schedules = vec![
//!     TradeoffSchedule::constant(1.0),
//!     TradeoffSchedule::Linear { start: 0.0, end: 1.0, ramp_epochs: 4 },
//! ];
//! assert_eq!(resolve_tradeoff(&schedules, 1, 10), vec![1.0, 0.0]);
//! assert_eq!(resolve_tradeoff(&schedules, 5, 10), vec![1.0, 1.0]);
//! ```

use serde::{Deserialize, Serialize};
use tch::nn::{self, OptimizerConfig};

use crate::config::TrainingConfig;
use crate::error::TrainResult;

// ---------------------------------------------------------------------------
// TradeoffSchedule
// ---------------------------------------------------------------------------

/// Policy mapping `epoch → weight` for one auxiliary objective.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TradeoffSchedule {
    /// The same weight for every epoch.
    Constant {
        /// Weight.
        value: f64,
    },
    /// Linear ramp from `start` (epoch 1) to `end` (epoch `ramp_epochs + 1`
    /// and later).
    Linear {
        /// Weight at epoch 1.
        start: f64,
        /// Weight once the ramp is complete.
        end: f64,
        /// Number of epochs the ramp lasts.
        ramp_epochs: usize,
    },
    /// Sigmoid warm-up `value · (2 / (1 + exp(-10p)) - 1)` with
    /// `p = epoch / max_epoch`.
    Sigmoid {
        /// Asymptotic weight.
        value: f64,
    },
}

impl TradeoffSchedule {
    /// Shorthand for [`TradeoffSchedule::Constant`].
    pub fn constant(value: f64) -> Self {
        TradeoffSchedule::Constant { value }
    }

    /// Weight for the 1-based `epoch` of a run lasting `max_epoch` epochs.
    pub fn weight(&self, epoch: usize, max_epoch: usize) -> f64 {
        match *self {
            TradeoffSchedule::Constant { value } => value,
            TradeoffSchedule::Linear { start, end, ramp_epochs } => {
                if ramp_epochs == 0 {
                    return end;
                }
                let done = epoch.saturating_sub(1).min(ramp_epochs) as f64;
                start + (end - start) * done / ramp_epochs as f64
            }
            TradeoffSchedule::Sigmoid { value } => {
                let p = epoch as f64 / max_epoch.max(1) as f64;
                value * (2.0 / (1.0 + (-10.0 * p).exp()) - 1.0)
            }
        }
    }

    /// Rejects negative or non-finite weights.
    pub(crate) fn is_valid(&self) -> bool {
        let ok = |v: f64| v.is_finite() && v >= 0.0;
        match *self {
            TradeoffSchedule::Constant { value } | TradeoffSchedule::Sigmoid { value } => ok(value),
            TradeoffSchedule::Linear { start, end, .. } => ok(start) && ok(end),
        }
    }
}

/// Evaluate every schedule for `epoch`, preserving order.
pub fn resolve_tradeoff(schedules: &[TradeoffSchedule], epoch: usize, max_epoch: usize) -> Vec<f64> {
    schedules.iter().map(|s| s.weight(epoch, max_epoch)).collect()
}

// ---------------------------------------------------------------------------
// Learning-rate scheduling
// ---------------------------------------------------------------------------

/// Learning-rate policy, stepped once per epoch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LrSchedulerConfig {
    /// No scheduler: the learning rate never changes.
    Fixed,
    /// Multiply by `gamma` every `step_size` epochs.
    Step {
        /// Epochs between decays.
        step_size: usize,
        /// Multiplicative factor.
        gamma: f64,
    },
    /// Multiply by `gamma` at each milestone epoch.
    MultiStep {
        /// Strictly increasing milestone epochs.
        milestones: Vec<usize>,
        /// Multiplicative factor.
        gamma: f64,
    },
    /// Multiply by `gamma` every epoch.
    Exp {
        /// Multiplicative factor.
        gamma: f64,
    },
}

/// Epoch-level learning-rate scheduler attached to one optimizer.
#[derive(Debug, Clone)]
pub struct LrScheduler {
    policy: LrSchedulerConfig,
    base_lr: f64,
    last_epoch: usize,
}

impl LrScheduler {
    /// Build a scheduler for `policy`; [`LrSchedulerConfig::Fixed`] yields
    /// `None`.
    pub fn new(policy: &LrSchedulerConfig, base_lr: f64) -> Option<Self> {
        match policy {
            LrSchedulerConfig::Fixed => None,
            other => Some(LrScheduler { policy: other.clone(), base_lr, last_epoch: 0 }),
        }
    }

    /// Learning rate currently applied to the optimizer.
    pub fn get_last_lr(&self) -> f64 {
        let e = self.last_epoch;
        match &self.policy {
            LrSchedulerConfig::Fixed => self.base_lr,
            LrSchedulerConfig::Step { step_size, gamma } => {
                self.base_lr * gamma.powi((e / (*step_size).max(1)) as i32)
            }
            LrSchedulerConfig::MultiStep { milestones, gamma } => {
                let passed = milestones.iter().filter(|&&m| m <= e).count();
                self.base_lr * gamma.powi(passed as i32)
            }
            LrSchedulerConfig::Exp { gamma } => self.base_lr * gamma.powi(e as i32),
        }
    }

    /// Advance one epoch and push the new learning rate into `opt`.
    pub fn step(&mut self, opt: &mut nn::Optimizer) {
        self.last_epoch += 1;
        opt.set_lr(self.get_last_lr());
    }
}

// ---------------------------------------------------------------------------
// Optimizer factory
// ---------------------------------------------------------------------------

/// Optimizer family used for every parameter group of a strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OptimizerKind {
    /// Adam with decoupled defaults (β₁ = 0.9, β₂ = 0.999).
    Adam,
    /// Stochastic gradient descent with momentum.
    Sgd,
}

/// Build an optimizer over every trainable variable of `vs`.
///
/// # Errors
///
/// Returns [`crate::TrainError::Tch`] if libtorch rejects the parameters.
pub fn build_optimizer(vs: &nn::VarStore, config: &TrainingConfig) -> TrainResult<nn::Optimizer> {
    let opt = match config.optimizer {
        OptimizerKind::Adam => nn::Adam { wd: config.weight_decay, ..Default::default() }
            .build(vs, config.learning_rate)?,
        OptimizerKind::Sgd => nn::Sgd {
            momentum: config.momentum,
            wd: config.weight_decay,
            ..Default::default()
        }
        .build(vs, config.learning_rate)?,
    };
    Ok(opt)
}

/// Build the scheduler configured for an optimizer created by
/// [`build_optimizer`].
pub fn build_lr_scheduler(config: &TrainingConfig) -> Option<LrScheduler> {
    LrScheduler::new(&config.lr_scheduler, config.learning_rate)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
