//! MCD: maximum classifier discrepancy.
//!
//! Each training batch runs three sub-steps in order:
//!
//! ```text
//! Step 1  G, C1, C2   min  CE(C1) + CE(C2)                    on source
//! Step 2  C1, C2      min  CE(C1) + CE(C2) − t0 · d(p1, p2)   G frozen
//! Step 3  G           min  t0 · d(p1, p2)  on target only, repeated
//! ```
//!
//! `d` is the mean absolute difference of the two heads' softmax outputs.
//! Both optimizers are zeroed around every sub-step so no gradient leaks
//! from one to the next.

use tch::{Device, Kind, Tensor};

use super::{weight, ScheduledOptimizer};
use crate::config::TrainingConfig;
use crate::dataset::{concat_pair, split_halves, Batch};
use crate::error::TrainResult;
use crate::losses::{classifier_discrepancy, cross_entropy};
use crate::metrics::{accuracy, EpochMetrics};
use crate::model::{McdNetworks, Mode};
use crate::trainer::{Strategy, TARGET_ACCURACY};

const NAME: &str = "MCD";

/// MCD strategy state.
pub struct McdStrategy {
    nets: McdNetworks,
    opt_g: ScheduledOptimizer,
    opt_c: ScheduledOptimizer,
    generator_steps: usize,
}

impl McdStrategy {
    /// Build `G`, `C1`, `C2` and one optimizer per parameter group.
    ///
    /// # Errors
    ///
    /// Propagates optimizer construction failures.
    pub fn new(config: &TrainingConfig, device: Device) -> TrainResult<Self> {
        let nets = McdNetworks::new(config, device);
        let opt_g = ScheduledOptimizer::new(nets.generator_store(), config)?;
        let opt_c = ScheduledOptimizer::new(nets.classifier_store(), config)?;
        Ok(McdStrategy { nets, opt_g, opt_c, generator_steps: config.mcd_generator_steps })
    }

    /// The trained networks.
    pub fn networks(&self) -> &McdNetworks {
        &self.nets
    }

    fn zero_grad(&mut self) {
        self.opt_g.opt.zero_grad();
        self.opt_c.opt.zero_grad();
    }

    /// Both heads' logits for a joint forward pass, split `(y1_s, y1_t, y2_s, y2_t)`.
    fn joint_logits(&self, source: &Batch, target: &Batch) -> TrainResult<(Tensor, Tensor, Tensor, Tensor)> {
        let inputs = concat_pair(source, target)?;
        let features = self.nets.features(&inputs);
        let (y1, y2) = self.nets.classify(&features);
        let (y1_s, y1_t) = split_halves(&y1);
        let (y2_s, y2_t) = split_halves(&y2);
        Ok((y1_s, y1_t, y2_s, y2_t))
    }

    /// Step 1: supervised update of `G`, `C1` and `C2` on the source half.
    ///
    /// # Errors
    ///
    /// [`crate::TrainError::BatchMismatch`] for unequal batches.
    pub fn step_supervised(&mut self, source: &Batch, target: &Batch, metrics: &mut EpochMetrics) -> TrainResult<()> {
        self.zero_grad();
        let (y1_s, _, y2_s, _) = self.joint_logits(source, target)?;
        let loss = cross_entropy(&y1_s, &source.labels) + cross_entropy(&y2_s, &source.labels);
        loss.backward();
        self.opt_g.opt.step();
        self.opt_c.opt.step();
        self.zero_grad();

        metrics.add_acc("Classifier 1 source train", accuracy(&y1_s, &source.labels));
        metrics.add_acc("Classifier 2 source train", accuracy(&y2_s, &source.labels));
        metrics.add_loss("Step 1: Source domain", loss.double_value(&[]));
        Ok(())
    }

    /// Step 2: update only the heads, keeping them accurate on the source
    /// while pushing their target predictions apart.
    ///
    /// # Errors
    ///
    /// [`crate::TrainError::BatchMismatch`] for unequal batches.
    pub fn step_maximize_discrepancy(
        &mut self,
        source: &Batch,
        target: &Batch,
        tradeoff: f64,
        metrics: &mut EpochMetrics,
    ) -> TrainResult<()> {
        let (y1_s, y1_t, y2_s, y2_t) = self.joint_logits(source, target)?;
        let supervised = cross_entropy(&y1_s, &source.labels) + cross_entropy(&y2_s, &source.labels);
        let discrepancy = classifier_discrepancy(&y1_t.softmax(-1, Kind::Float), &y2_t.softmax(-1, Kind::Float));
        let loss = supervised - discrepancy * tradeoff;
        loss.backward();
        self.opt_c.opt.step();
        self.zero_grad();

        metrics.add_loss("Step 2: Maximize discrepancy", loss.double_value(&[]));
        Ok(())
    }

    /// Step 3: update only `G` to bring the heads back into agreement on
    /// the target batch, `generator_steps` times.
    ///
    /// Only the weighted discrepancy is back-propagated. The recorded loss
    /// is the unweighted discrepancy summed over the repetitions, each
    /// measured before its own update.
    pub fn step_minimize_discrepancy(&mut self, target: &Batch, tradeoff: f64, metrics: &mut EpochMetrics) {
        let mut total = 0.0;
        for _ in 0..self.generator_steps {
            let features = self.nets.features(&target.inputs);
            let (y1, y2) = self.nets.classify(&features);
            let discrepancy = classifier_discrepancy(&y1.softmax(-1, Kind::Float), &y2.softmax(-1, Kind::Float));
            (&discrepancy * tradeoff).backward();
            self.opt_g.opt.step();
            self.zero_grad();
            total += discrepancy.double_value(&[]);
        }
        metrics.add_loss("Step 3: Minimize discrepancy", total);
    }
}

impl Strategy for McdStrategy {
    fn name(&self) -> &'static str {
        NAME
    }

    fn tradeoff_len(&self) -> usize {
        1
    }

    fn set_mode(&mut self, mode: Mode) {
        self.nets.set_mode(mode);
    }

    fn train_step(
        &mut self,
        source: &Batch,
        target: &Batch,
        tradeoff: &[f64],
        metrics: &mut EpochMetrics,
    ) -> TrainResult<()> {
        let t0 = weight(tradeoff, 0, NAME)?;
        self.step_supervised(source, target, metrics)?;
        self.step_maximize_discrepancy(source, target, t0, metrics)?;
        self.step_minimize_discrepancy(target, t0, metrics);
        Ok(())
    }

    fn val_step(&mut self, target: &Batch, metrics: &mut EpochMetrics) -> TrainResult<()> {
        let features = self.nets.features(&target.inputs);
        let (y1, y2) = self.nets.classify(&features);
        metrics.add_acc("Classifier 1 Target Data", accuracy(&y1, &target.labels));
        metrics.add_acc("Classifier 2 Target Data", accuracy(&y2, &target.labels));
        metrics.add_acc(TARGET_ACCURACY, accuracy(&(&y1 + &y2), &target.labels));
        Ok(())
    }

    fn current_lr(&self) -> Vec<f64> {
        self.opt_g.current_lr().into_iter().chain(self.opt_c.current_lr()).collect()
    }

    fn step_schedulers(&mut self) {
        self.opt_g.step_scheduler();
        self.opt_c.step_scheduler();
    }
}
