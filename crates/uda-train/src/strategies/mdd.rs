//! MDD: margin disparity discrepancy with a gradient reversal layer.
//!
//! One composite module, one optimizer, one backward per batch. The
//! adversarial head sits behind the reversal layer, so minimising
//! `L_cls − t0 · MDD` trains the head to maximise MDD while the feature
//! extractor receives the reversed (minimising) gradient.

use tch::Device;
use tracing::debug;

use super::{weight, ScheduledOptimizer};
use crate::config::TrainingConfig;
use crate::dataset::{concat_pair, split_halves, Batch};
use crate::error::TrainResult;
use crate::losses::{cross_entropy, ClassificationMdd};
use crate::metrics::{accuracy, EpochMetrics};
use crate::model::{MddNetwork, Mode};
use crate::trainer::{Strategy, TARGET_ACCURACY};

const NAME: &str = "MDD";

/// MDD strategy state.
pub struct MddStrategy {
    net: MddNetwork,
    optimizer: ScheduledOptimizer,
    mdd: ClassificationMdd,
}

impl MddStrategy {
    /// Build the composite module and its optimizer on `device`.
    ///
    /// # Errors
    ///
    /// Propagates optimizer construction failures.
    pub fn new(config: &TrainingConfig, device: Device) -> TrainResult<Self> {
        let net = MddNetwork::new(config, device);
        let optimizer = ScheduledOptimizer::new(net.var_store(), config)?;
        Ok(MddStrategy { net, optimizer, mdd: ClassificationMdd::new(config.mdd_margin) })
    }

    /// The trained module.
    pub fn network(&self) -> &MddNetwork {
        &self.net
    }
}

impl Strategy for MddStrategy {
    fn name(&self) -> &'static str {
        NAME
    }

    fn tradeoff_len(&self) -> usize {
        1
    }

    fn set_mode(&mut self, mode: Mode) {
        self.net.set_mode(mode);
    }

    fn train_step(
        &mut self,
        source: &Batch,
        target: &Batch,
        tradeoff: &[f64],
        metrics: &mut EpochMetrics,
    ) -> TrainResult<()> {
        let t0 = weight(tradeoff, 0, NAME)?;

        let inputs = concat_pair(source, target)?;
        let (y, y_adv) = self.net.forward(&inputs).into_pair()?;
        let (y_s, y_t) = split_halves(&y);
        let (y_s_adv, y_t_adv) = split_halves(&y_adv);

        let cls_loss = cross_entropy(&y_s, &source.labels);
        let transfer_loss = -self.mdd.forward(&y_s, &y_s_adv, &y_t, &y_t_adv) * t0;
        let loss = &cls_loss + &transfer_loss;
        self.net.step();

        self.optimizer.opt.zero_grad();
        loss.backward();
        self.optimizer.opt.step();

        debug!("MDD batch: grl coeff {:.5}", self.net.grl().coeff());
        metrics.add_acc("Source train", accuracy(&y_s, &source.labels));
        metrics.add_loss("Source domain", cls_loss.double_value(&[]));
        metrics.add_loss("MDD", transfer_loss.double_value(&[]));
        Ok(())
    }

    fn val_step(&mut self, target: &Batch, metrics: &mut EpochMetrics) -> TrainResult<()> {
        let output = self.net.forward(&target.inputs);
        metrics.add_acc(TARGET_ACCURACY, accuracy(&output.main, &target.labels));
        Ok(())
    }

    fn current_lr(&self) -> Vec<f64> {
        self.optimizer.current_lr().into_iter().collect()
    }

    fn step_schedulers(&mut self) {
        self.optimizer.step_scheduler();
    }
}
