//! IRM: kernel alignment plus an invariance-gradient penalty.
//!
//! Per training batch:
//!
//! ```text
//! (y, f)      = net([x_s; x_t])          split into source / target halves
//! L_cls       = CE(y_s, labels_s)
//! L_mmd       = MK-MMD(f_s, f_t)
//! L_irm       = Σ ∂CE(w·y_even)/∂w · ∂CE(w·y_odd)/∂w   at w = 1
//! L           = L_cls + t0 · L_mmd + t1 · L_irm          one optimizer step
//! ```

use tch::Device;
use tracing::debug;

use super::{weight, ScheduledOptimizer};
use crate::config::TrainingConfig;
use crate::dataset::{concat_pair, split_halves, Batch};
use crate::error::TrainResult;
use crate::losses::{cross_entropy, InvariancePenalty, MultipleKernelMmd};
use crate::metrics::{accuracy, EpochMetrics};
use crate::model::{IrmNetwork, Mode};
use crate::trainer::{Strategy, TARGET_ACCURACY};

const NAME: &str = "IRM";

/// IRM strategy state.
pub struct IrmStrategy {
    net: IrmNetwork,
    optimizer: ScheduledOptimizer,
    mmd: MultipleKernelMmd,
    penalty: InvariancePenalty,
}

impl IrmStrategy {
    /// Build the network and its optimizer on `device`.
    ///
    /// The invariance scale is created outside the network's store, so the
    /// optimizer never sees it.
    ///
    /// # Errors
    ///
    /// Propagates optimizer construction failures.
    pub fn new(config: &TrainingConfig, device: Device) -> TrainResult<Self> {
        let net = IrmNetwork::new(config, device);
        let optimizer = ScheduledOptimizer::new(net.var_store(), config)?;
        Ok(IrmStrategy {
            net,
            optimizer,
            mmd: MultipleKernelMmd::default(),
            penalty: InvariancePenalty::new(device),
        })
    }

    /// The trained network.
    pub fn network(&self) -> &IrmNetwork {
        &self.net
    }

    /// The invariance penalty and its scale.
    pub fn penalty(&self) -> &InvariancePenalty {
        &self.penalty
    }
}

impl Strategy for IrmStrategy {
    fn name(&self) -> &'static str {
        NAME
    }

    fn tradeoff_len(&self) -> usize {
        2
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
        let (t_mmd, t_irm) = (weight(tradeoff, 0, NAME)?, weight(tradeoff, 1, NAME)?);

        let inputs = concat_pair(source, target)?;
        let (prediction, features) = self.net.forward(&inputs);
        let (y_s, _) = split_halves(&prediction);
        let (f_s, f_t) = split_halves(&features);

        let mmd_loss = self.mmd.forward(&f_s, &f_t)?;
        let cls_loss = cross_entropy(&y_s, &source.labels);
        let irm_loss = self.penalty.forward(&y_s, &source.labels)?;
        let total = &cls_loss + &mmd_loss * t_mmd + &irm_loss * t_irm;

        self.optimizer.opt.zero_grad();
        total.backward();
        self.optimizer.opt.step();
        self.penalty.zero_grad();

        let (cls, mmd, irm) = (cls_loss.double_value(&[]), mmd_loss.double_value(&[]), irm_loss.double_value(&[]));
        debug!("IRM batch: cls {:.4}, mmd {:.4}, irm {:.4}", cls, mmd, irm);
        metrics.add_loss("Source Classifier", cls);
        metrics.add_loss("Mk MMD", mmd);
        metrics.add_loss("IRM", irm);
        metrics.add_acc("Source Data", accuracy(&y_s, &source.labels));
        Ok(())
    }

    fn val_step(&mut self, target: &Batch, metrics: &mut EpochMetrics) -> TrainResult<()> {
        let (prediction, _) = self.net.forward(&target.inputs);
        metrics.add_acc(TARGET_ACCURACY, accuracy(&prediction, &target.labels));
        Ok(())
    }

    fn current_lr(&self) -> Vec<f64> {
        self.optimizer.current_lr().into_iter().collect()
    }

    fn step_schedulers(&mut self) {
        self.optimizer.step_scheduler();
    }
}
