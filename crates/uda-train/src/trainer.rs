//! Shared epoch orchestration.
//!
//! Every strategy runs under the same state machine:
//!
//! ```text
//! resolve train mode ─► capability check ─► trade-off length check
//!        │
//!        ▼
//! for epoch in 1..=max_epoch
//!     ├─ train phase: Mode::Train, num_iter = batches("train")
//!     │      target ◄─ "train"; source ◄─ SourceSelection; train_step
//!     ├─ val phase:   Mode::Eval, num_iter = batches("val"), no_grad
//!     │      target ◄─ "val"; val_step
//!     ├─ best.update(epoch, target accuracy)        (>=, latest tie wins)
//!     └─ step learning-rate schedulers
//! ```
//!
//! Configuration problems surface before the first epoch; anything failing
//! mid-run aborts the run with the partially accumulated epoch discarded.

use tracing::{debug, info};

use crate::config::TrainingConfig;
use crate::dataset::{Batch, DomainBatchSource};
use crate::error::{ConfigError, TrainError, TrainResult};
use crate::metrics::{BestModelRecord, EpochMetrics, EpochReport, Phase, PhaseSummary};
use crate::mode::{SourceSelection, TrainMode};
use crate::model::Mode;
use crate::schedule::resolve_tradeoff;

/// Name under which every strategy reports target validation accuracy.
pub const TARGET_ACCURACY: &str = "Target Data";

// ---------------------------------------------------------------------------
// Strategy
// ---------------------------------------------------------------------------

/// One domain-adaptation algorithm: its networks, optimizers and per-batch
/// update rule.
pub trait Strategy {
    /// Display name used in logs and errors.
    fn name(&self) -> &'static str;

    /// Number of trade-off weights [`Strategy::train_step`] expects.
    fn tradeoff_len(&self) -> usize;

    /// Whether the strategy can train with `mode`. Multi-source data is
    /// rejected by default.
    fn supports(&self, mode: &TrainMode) -> bool {
        !matches!(mode, TrainMode::MultiSource(_))
    }

    /// Switch every owned sub-network to `mode`.
    fn set_mode(&mut self, mode: Mode);

    /// One training iteration on a `(source, target)` pair.
    fn train_step(
        &mut self,
        source: &Batch,
        target: &Batch,
        tradeoff: &[f64],
        metrics: &mut EpochMetrics,
    ) -> TrainResult<()>;

    /// One validation iteration on a target batch. Must record
    /// [`TARGET_ACCURACY`].
    fn val_step(&mut self, target: &Batch, metrics: &mut EpochMetrics) -> TrainResult<()>;

    /// Learning rates currently applied, one per scheduled optimizer. Empty
    /// when no scheduler is configured.
    fn current_lr(&self) -> Vec<f64>;

    /// Advance every learning-rate scheduler by one epoch.
    fn step_schedulers(&mut self);
}

// ---------------------------------------------------------------------------
// Trainer
// ---------------------------------------------------------------------------

/// Result of a completed run.
#[derive(Debug, Clone, PartialEq)]
pub struct TrainingSummary {
    /// Best target validation accuracy and its epoch.
    pub best: BestModelRecord,
    /// Per-epoch phase means, in epoch order.
    pub history: Vec<EpochReport>,
}

/// Drives a [`Strategy`] through a full multi-epoch run.
#[derive(Debug, Clone)]
pub struct Trainer {
    config: TrainingConfig,
}

impl Trainer {
    /// Create a trainer for `config`.
    pub fn new(config: TrainingConfig) -> Self {
        Trainer { config }
    }

    /// The active configuration.
    pub fn config(&self) -> &TrainingConfig {
        &self.config
    }

    /// Run `max_epoch` epochs of `strategy` on batches from `data`.
    ///
    /// # Errors
    ///
    /// - [`ConfigError::UnsupportedTrainMode`] before the first epoch when
    ///   the strategy rejects the configured train mode.
    /// - [`ConfigError::TradeoffLength`] before the first epoch when the
    ///   number of trade-off schedules is wrong for the strategy.
    /// - Any error raised by the data source or a strategy step.
    pub fn train(&self, strategy: &mut dyn Strategy, data: &mut dyn DomainBatchSource) -> TrainResult<TrainingSummary> {
        let selection = self.prepare(strategy)?;
        let max_epoch = self.config.max_epoch;
        let mut best = BestModelRecord::default();
        let mut history = Vec::with_capacity(max_epoch);

        for epoch in 1..=max_epoch {
            info!("-----Epoch {}/{}-----", epoch, max_epoch);
            let lr = strategy.current_lr();
            if !lr.is_empty() {
                info!("current lr: {:?}", lr);
            }

            let train = self.run_train_phase(epoch, strategy, data, &selection)?;
            let val = run_val_phase(strategy, data)?;

            let accuracy = val.accuracy(TARGET_ACCURACY).ok_or_else(|| {
                TrainError::training_step(format!("{} did not report `{TARGET_ACCURACY}`", strategy.name()))
            })?;
            best.update(epoch, accuracy);
            info!("The best model epoch {}, val-acc {:.4}", best.epoch, best.accuracy);

            strategy.step_schedulers();
            history.push(EpochReport { epoch, train, val });
        }

        Ok(TrainingSummary { best, history })
    }

    /// Pre-flight checks; returns the batch-pair supplier for the run.
    fn prepare(&self, strategy: &dyn Strategy) -> TrainResult<SourceSelection> {
        let mode = self.config.train_mode()?;
        let unsupported = || ConfigError::UnsupportedTrainMode { strategy: strategy.name(), mode: mode.to_string() };
        if !strategy.supports(&mode) {
            return Err(unsupported().into());
        }
        let selection = mode.source_selection().ok_or_else(unsupported)?;

        let expected = strategy.tradeoff_len();
        if self.config.tradeoff.len() != expected {
            return Err(ConfigError::TradeoffLength {
                strategy: strategy.name(),
                expected,
                found: self.config.tradeoff.len(),
            }
            .into());
        }
        info!("training {} with {} data", strategy.name(), mode);
        Ok(selection)
    }

    fn run_train_phase(
        &self,
        epoch: usize,
        strategy: &mut dyn Strategy,
        data: &mut dyn DomainBatchSource,
        selection: &SourceSelection,
    ) -> TrainResult<PhaseSummary> {
        strategy.set_mode(Mode::Train);
        let tradeoff = resolve_tradeoff(&self.config.tradeoff, epoch, self.config.max_epoch);
        debug!("tradeoff for epoch {}: {:?}", epoch, tradeoff);

        let num_iter = data.num_batches(Phase::Train.key())?;
        let mut metrics = EpochMetrics::new();
        for _ in 0..num_iter {
            let target = data.next_batch(Phase::Train.key())?;
            let (source, target) = selection.next_pair(data, target)?;
            strategy.train_step(&source, &target, &tradeoff, &mut metrics)?;
        }
        Ok(report_phase(Phase::Train, &metrics, num_iter))
    }
}

fn run_val_phase(strategy: &mut dyn Strategy, data: &mut dyn DomainBatchSource) -> TrainResult<PhaseSummary> {
    strategy.set_mode(Mode::Eval);
    let num_iter = data.num_batches(Phase::Val.key())?;
    let mut metrics = EpochMetrics::new();
    for _ in 0..num_iter {
        let target = data.next_batch(Phase::Val.key())?;
        tch::no_grad(|| strategy.val_step(&target, &mut metrics))?;
    }
    Ok(report_phase(Phase::Val, &metrics, num_iter))
}

fn report_phase(phase: Phase, metrics: &EpochMetrics, num_iter: usize) -> PhaseSummary {
    let summary = PhaseSummary::from_metrics(metrics, num_iter);
    for (name, value) in &summary.losses {
        info!("{}-Loss {}: {:.4}", phase, name, value);
    }
    for (name, value) in &summary.accuracies {
        info!("{}-Acc {}: {:.4}", phase, name, value);
    }
    summary
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use super::*;
    use crate::mode::TrainModeKind;
    use crate::schedule::TradeoffSchedule;
    use tch::{Device, Kind, Tensor};

    /// Records calls and replays scripted metric values.
    struct Scripted {
        train_losses: VecDeque<f64>,
        val_accs: VecDeque<f64>,
        modes: Vec<Mode>,
        scheduler_steps: usize,
        source_lens: Vec<i64>,
    }

    impl Scripted {
        fn new(train_losses: &[f64], val_accs: &[f64]) -> Self {
            Scripted {
                train_losses: train_losses.iter().copied().collect(),
                val_accs: val_accs.iter().copied().collect(),
                modes: Vec::new(),
                scheduler_steps: 0,
                source_lens: Vec::new(),
            }
        }
    }

    impl Strategy for Scripted {
        fn name(&self) -> &'static str {
            "Scripted"
        }
        fn tradeoff_len(&self) -> usize {
            1
        }
        fn set_mode(&mut self, mode: Mode) {
            self.modes.push(mode);
        }
        fn train_step(&mut self, source: &Batch, _: &Batch, _: &[f64], m: &mut EpochMetrics) -> TrainResult<()> {
            self.source_lens.push(source.len());
            m.add_loss("loss", self.train_losses.pop_front().unwrap_or(0.0));
            Ok(())
        }
        fn val_step(&mut self, _: &Batch, m: &mut EpochMetrics) -> TrainResult<()> {
            m.add_acc(TARGET_ACCURACY, self.val_accs.pop_front().unwrap_or(0.0));
            Ok(())
        }
        fn current_lr(&self) -> Vec<f64> {
            Vec::new()
        }
        fn step_schedulers(&mut self) {
            self.scheduler_steps += 1;
        }
    }

    /// Fixed batch counts per key; every batch has `len` rows.
    struct Counted {
        train: usize,
        val: usize,
        len: i64,
    }

    impl DomainBatchSource for Counted {
        fn num_batches(&self, key: &str) -> TrainResult<usize> {
            match key {
                "train" => Ok(self.train),
                "val" => Ok(self.val),
                _ => Ok(1),
            }
        }
        fn next_batch(&mut self, _: &str) -> TrainResult<Batch> {
            Ok(Batch::new(
                Tensor::zeros([self.len, 2], (Kind::Float, Device::Cpu)),
                Tensor::zeros([self.len], (Kind::Int64, Device::Cpu)),
            ))
        }
    }

    fn config(max_epoch: usize) -> TrainingConfig {
        TrainingConfig {
            max_epoch,
            train_mode: TrainModeKind::Supervised,
            tradeoff: vec![TradeoffSchedule::constant(1.0)],
            ..TrainingConfig::default()
        }
    }

    #[test]
    fn phase_means_divide_by_num_iter() {
        let mut strategy = Scripted::new(&[1.0, 2.0, 6.0], &[0.5, 1.0]);
        let mut data = Counted { train: 3, val: 2, len: 2 };
        let summary = Trainer::new(config(1)).train(&mut strategy, &mut data).unwrap();
        let report = &summary.history[0];
        assert_eq!(report.train.loss("loss"), Some(3.0));
        assert_eq!(report.val.accuracy(TARGET_ACCURACY), Some(0.75));
    }

    #[test]
    fn modes_alternate_and_schedulers_step_per_epoch() {
        let mut strategy = Scripted::new(&[], &[]);
        let mut data = Counted { train: 1, val: 1, len: 2 };
        Trainer::new(config(3)).train(&mut strategy, &mut data).unwrap();
        assert_eq!(strategy.modes, vec![Mode::Train, Mode::Eval, Mode::Train, Mode::Eval, Mode::Train, Mode::Eval]);
        assert_eq!(strategy.scheduler_steps, 3);
    }

    #[test]
    fn ties_keep_latest_epoch() {
        let mut strategy = Scripted::new(&[], &[0.5, 0.75, 0.75, 0.25]);
        let mut data = Counted { train: 1, val: 1, len: 2 };
        let summary = Trainer::new(config(4)).train(&mut strategy, &mut data).unwrap();
        assert_eq!(summary.best, BestModelRecord { accuracy: 0.75, epoch: 3 });
    }

    #[test]
    fn multi_source_fails_before_any_epoch() {
        let mut strategy = Scripted::new(&[], &[]);
        let mut data = Counted { train: 1, val: 1, len: 2 };
        let cfg = TrainingConfig {
            train_mode: TrainModeKind::MultiSource,
            source_names: vec!["a".into(), "b".into()],
            ..config(2)
        };
        let err = Trainer::new(cfg).train(&mut strategy, &mut data).unwrap_err();
        assert!(matches!(err, TrainError::Config(ConfigError::UnsupportedTrainMode { strategy: "Scripted", .. })));
        assert!(strategy.modes.is_empty());
    }

    #[test]
    fn multi_source_without_names_still_names_the_strategy() {
        let mut strategy = Scripted::new(&[], &[]);
        let mut data = Counted { train: 1, val: 1, len: 2 };
        let cfg = TrainingConfig { train_mode: TrainModeKind::MultiSource, source_names: vec![], ..config(2) };
        let err = Trainer::new(cfg).train(&mut strategy, &mut data).unwrap_err();
        assert!(matches!(
            err,
            TrainError::Config(ConfigError::UnsupportedTrainMode { strategy: "Scripted", .. })
        ));
        assert!(strategy.modes.is_empty());
    }

    #[test]
    fn wrong_tradeoff_length_fails_before_any_epoch() {
        let mut strategy = Scripted::new(&[], &[]);
        let mut data = Counted { train: 1, val: 1, len: 2 };
        let cfg = TrainingConfig { tradeoff: Vec::new(), ..config(2) };
        let err = Trainer::new(cfg).train(&mut strategy, &mut data).unwrap_err();
        assert!(matches!(err, TrainError::Config(ConfigError::TradeoffLength { expected: 1, found: 0, .. })));
        assert!(strategy.modes.is_empty());
    }

    #[test]
    fn single_source_pulls_from_named_domain() {
        let mut strategy = Scripted::new(&[], &[]);
        let mut data = Counted { train: 2, val: 1, len: 3 };
        let cfg = TrainingConfig { train_mode: TrainModeKind::SingleSource, ..config(1) };
        Trainer::new(cfg).train(&mut strategy, &mut data).unwrap();
        assert_eq!(strategy.source_lens, vec![3, 3]);
    }
}
