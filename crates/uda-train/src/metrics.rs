//! Epoch bookkeeping: running sums, phase means and best-epoch tracking.
//!
//! An [`EpochMetrics`] lives for exactly one phase (`train` or `val`). Every
//! batch adds its contribution under a name; at phase end the sums are
//! divided by the iteration count. Names keep their first-insertion order so
//! log lines come out in the order the strategy produced them.
//!
//! [`BestModelRecord`] persists for the whole run and is updated after each
//! validation phase with `>=`, so a tie moves the record to the later epoch.

use std::fmt;

use tch::{Kind, Tensor};

// ---------------------------------------------------------------------------
// Accuracy
// ---------------------------------------------------------------------------

/// Fraction of rows of `logits [B, C]` whose argmax equals `labels [B]`.
pub fn accuracy(logits: &Tensor, labels: &Tensor) -> f64 {
    logits
        .argmax(1, false)
        .eq_tensor(labels)
        .to_kind(Kind::Float)
        .mean(Kind::Float)
        .double_value(&[])
}

// ---------------------------------------------------------------------------
// Phase
// ---------------------------------------------------------------------------

/// One half of an epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    /// Parameter updates on paired source/target batches.
    Train,
    /// Target-only evaluation without gradients.
    Val,
}

impl Phase {
    /// Key under which the target stream of this phase is registered.
    pub fn key(self) -> &'static str {
        match self {
            Phase::Train => "train",
            Phase::Val => "val",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

// ---------------------------------------------------------------------------
// EpochMetrics
// ---------------------------------------------------------------------------

/// Named running sums of losses and accuracies for one phase.
#[derive(Debug, Clone, Default)]
pub struct EpochMetrics {
    losses: Vec<(String, f64)>,
    accuracies: Vec<(String, f64)>,
}

impl EpochMetrics {
    /// Empty accumulator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a loss contribution under `name`.
    pub fn add_loss(&mut self, name: &str, value: f64) {
        accumulate(&mut self.losses, name, value);
    }

    /// Add an accuracy contribution under `name`.
    pub fn add_acc(&mut self, name: &str, value: f64) {
        accumulate(&mut self.accuracies, name, value);
    }

    /// Running loss sum for `name`.
    pub fn loss_sum(&self, name: &str) -> Option<f64> {
        lookup(&self.losses, name)
    }

    /// Running accuracy sum for `name`.
    pub fn acc_sum(&self, name: &str) -> Option<f64> {
        lookup(&self.accuracies, name)
    }

    /// Phase-mean losses `(name, sum / num_iter)` in insertion order.
    pub fn loss_means(&self, num_iter: usize) -> Vec<(String, f64)> {
        means(&self.losses, num_iter)
    }

    /// Phase-mean accuracies `(name, sum / num_iter)` in insertion order.
    pub fn acc_means(&self, num_iter: usize) -> Vec<(String, f64)> {
        means(&self.accuracies, num_iter)
    }
}

fn accumulate(entries: &mut Vec<(String, f64)>, name: &str, value: f64) {
    match entries.iter_mut().find(|(n, _)| n == name) {
        Some((_, sum)) => *sum += value,
        None => entries.push((name.to_string(), value)),
    }
}

fn lookup(entries: &[(String, f64)], name: &str) -> Option<f64> {
    entries.iter().find(|(n, _)| n == name).map(|(_, v)| *v)
}

fn means(entries: &[(String, f64)], num_iter: usize) -> Vec<(String, f64)> {
    let n = num_iter.max(1) as f64;
    entries.iter().map(|(name, sum)| (name.clone(), sum / n)).collect()
}

// ---------------------------------------------------------------------------
// PhaseSummary / EpochReport
// ---------------------------------------------------------------------------

/// Phase means reported at the end of one phase.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PhaseSummary {
    /// Mean losses in insertion order.
    pub losses: Vec<(String, f64)>,
    /// Mean accuracies in insertion order.
    pub accuracies: Vec<(String, f64)>,
}

impl PhaseSummary {
    /// Summarise `metrics` accumulated over `num_iter` batches.
    pub fn from_metrics(metrics: &EpochMetrics, num_iter: usize) -> Self {
        Self { losses: metrics.loss_means(num_iter), accuracies: metrics.acc_means(num_iter) }
    }

    /// Mean accuracy for `name`.
    pub fn accuracy(&self, name: &str) -> Option<f64> {
        lookup(&self.accuracies, name)
    }

    /// Mean loss for `name`.
    pub fn loss(&self, name: &str) -> Option<f64> {
        lookup(&self.losses, name)
    }
}

/// Both phase summaries of one epoch.
#[derive(Debug, Clone, PartialEq)]
pub struct EpochReport {
    /// 1-based epoch number.
    pub epoch: usize,
    /// Training phase means.
    pub train: PhaseSummary,
    /// Validation phase means.
    pub val: PhaseSummary,
}

// ---------------------------------------------------------------------------
// BestModelRecord
// ---------------------------------------------------------------------------

/// Best target validation accuracy seen so far and the epoch it occurred.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct BestModelRecord {
    /// Best validation accuracy.
    pub accuracy: f64,
    /// Epoch of [`BestModelRecord::accuracy`]; `0` before any validation.
    pub epoch: usize,
}

impl BestModelRecord {
    /// Record `accuracy` for `epoch`. Ties replace the stored epoch, so the
    /// latest epoch reaching the maximum wins. Returns `true` on update.
    pub fn update(&mut self, epoch: usize, accuracy: f64) -> bool {
        if accuracy >= self.accuracy {
            self.accuracy = accuracy;
            self.epoch = epoch;
            true
        } else {
            false
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
