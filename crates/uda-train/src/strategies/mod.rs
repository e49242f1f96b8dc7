//! The three domain-adaptation strategies.
//!
//! | Strategy        | Optimizers | Alignment objective                    |
//! |-----------------|------------|----------------------------------------|
//! | [`IrmStrategy`] | 1          | MK-MMD + invariance penalty            |
//! | [`McdStrategy`] | 2 (G / C)  | classifier discrepancy, min-max        |
//! | [`MddStrategy`] | 1          | margin disparity discrepancy via a GRL |

mod irm;
mod mcd;
mod mdd;

pub use irm::IrmStrategy;
pub use mcd::McdStrategy;
pub use mdd::MddStrategy;

use tch::nn;

use crate::config::{Method, TrainingConfig};
use crate::error::TrainResult;
use crate::schedule::{build_lr_scheduler, build_optimizer, LrScheduler};
use crate::trainer::Strategy;

/// Seed libtorch and build the strategy selected by `config.method`.
///
/// # Errors
///
/// Propagates optimizer construction failures.
pub fn build_strategy(config: &TrainingConfig) -> TrainResult<Box<dyn Strategy>> {
    tch::manual_seed(config.seed as i64);
    let device = config.device();
    let strategy: Box<dyn Strategy> = match config.method {
        Method::Irm => Box::new(IrmStrategy::new(config, device)?),
        Method::Mcd => Box::new(McdStrategy::new(config, device)?),
        Method::Mdd => Box::new(MddStrategy::new(config, device)?),
    };
    Ok(strategy)
}

/// An optimizer and its optional learning-rate scheduler.
struct ScheduledOptimizer {
    opt: nn::Optimizer,
    scheduler: Option<LrScheduler>,
}

impl ScheduledOptimizer {
    fn new(vs: &nn::VarStore, config: &TrainingConfig) -> TrainResult<Self> {
        Ok(ScheduledOptimizer { opt: build_optimizer(vs, config)?, scheduler: build_lr_scheduler(config) })
    }

    fn current_lr(&self) -> Option<f64> {
        self.scheduler.as_ref().map(LrScheduler::get_last_lr)
    }

    fn step_scheduler(&mut self) {
        if let Some(scheduler) = self.scheduler.as_mut() {
            scheduler.step(&mut self.opt);
        }
    }
}

/// Weight `i` of the resolved trade-off vector.
fn weight(tradeoff: &[f64], i: usize, strategy: &'static str) -> TrainResult<f64> {
    tradeoff.get(i).copied().ok_or_else(|| {
        crate::error::ConfigError::TradeoffLength { strategy, expected: i + 1, found: tradeoff.len() }.into()
    })
}
