//! End-to-end tests of the three strategies under the shared trainer.
//!
//! Scenario: two classes on a single scalar feature (class 0 around −1,
//! class 1 around +1), 8 labelled source samples, 8 target samples from the
//! same distribution, two epochs.

use approx::assert_abs_diff_eq;
use tch::{Device, Kind, Tensor};
use uda_train::config::{Method, TrainingConfig};
use uda_train::dataset::{
    synthetic_domain, Batch, DomainBatchSource, DomainDataset, DomainLoaders, LoaderOptions, SyntheticDomainConfig,
};
use uda_train::losses::classifier_discrepancy;
use uda_train::metrics::EpochMetrics;
use uda_train::mode::TrainModeKind;
use uda_train::schedule::{LrSchedulerConfig, TradeoffSchedule};
use uda_train::strategies::{build_strategy, IrmStrategy, McdStrategy, MddStrategy};
use uda_train::trainer::{Strategy, Trainer, TARGET_ACCURACY};
use uda_train::{ConfigError, TrainError};

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

fn domain(name: &str, seed: u64) -> DomainDataset {
    sized_domain(name, 8, seed)
}

fn sized_domain(name: &str, num_samples: usize, seed: u64) -> DomainDataset {
    let cfg = SyntheticDomainConfig {
        num_samples,
        input_dim: 1,
        num_classes: 2,
        separation: 2.0,
        spread: 0.25,
        shift: 0.0,
        seed,
    };
    synthetic_domain(name, &cfg).expect("synthetic domain")
}

fn config(method: Method, train_mode: TrainModeKind, sources: &[&str]) -> TrainingConfig {
    TrainingConfig {
        method,
        train_mode,
        source_names: sources.iter().map(|s| s.to_string()).collect(),
        input_dim: 1,
        hidden_dim: 32,
        feature_dim: 16,
        num_classes: 2,
        dropout: 0.0,
        learning_rate: 0.05,
        weight_decay: 0.0,
        lr_scheduler: LrSchedulerConfig::Fixed,
        max_epoch: 2,
        batch_size: 2,
        tradeoff: vec![TradeoffSchedule::constant(1.0); method.tradeoff_len()],
        seed: 0,
        ..TrainingConfig::default()
    }
}

fn loaders(cfg: &TrainingConfig) -> DomainLoaders {
    let sources = match cfg.train_mode {
        TrainModeKind::Supervised => Vec::new(),
        _ => cfg.source_names.iter().enumerate().map(|(i, n)| domain(n, 10 + i as u64)).collect(),
    };
    DomainLoaders::for_run(
        domain("target", 1),
        domain("target", 2),
        sources,
        LoaderOptions { batch_size: cfg.batch_size, shuffle: true, drop_last: false, seed: 5 },
        Device::Cpu,
    )
    .expect("loaders")
}

fn run(method: Method, mode: TrainModeKind, sources: &[&str]) -> Result<uda_train::TrainingSummary, TrainError> {
    let cfg = config(method, mode, sources);
    cfg.validate().expect("valid config");
    let mut data = loaders(&cfg);
    let mut strategy = build_strategy(&cfg)?;
    Trainer::new(cfg).train(strategy.as_mut(), &mut data)
}

// ---------------------------------------------------------------------------
// End-to-end
// ---------------------------------------------------------------------------

fn assert_beats_chance(method: Method, mode: TrainModeKind, sources: &[&str]) {
    let summary = run(method, mode, sources).unwrap_or_else(|e| panic!("{method} / {mode:?} failed: {e}"));
    assert_eq!(summary.history.len(), 2);
    assert!(
        summary.best.accuracy > 0.5,
        "{method} / {mode:?}: best target accuracy {} does not beat chance",
        summary.best.accuracy
    );
    let max_seen = summary.history.iter().filter_map(|r| r.val.accuracy(TARGET_ACCURACY)).fold(0.0, f64::max);
    assert_eq!(max_seen, summary.best.accuracy);
}

#[test]
fn irm_learns_in_every_supported_mode() {
    assert_beats_chance(Method::Irm, TrainModeKind::Supervised, &[]);
    assert_beats_chance(Method::Irm, TrainModeKind::SingleSource, &["source"]);
    assert_beats_chance(Method::Irm, TrainModeKind::SourceCombine, &["s1", "s2"]);
}

#[test]
fn mcd_learns_in_every_supported_mode() {
    assert_beats_chance(Method::Mcd, TrainModeKind::Supervised, &[]);
    assert_beats_chance(Method::Mcd, TrainModeKind::SingleSource, &["source"]);
    assert_beats_chance(Method::Mcd, TrainModeKind::SourceCombine, &["s1", "s2"]);
}

#[test]
fn mdd_learns_in_every_supported_mode() {
    assert_beats_chance(Method::Mdd, TrainModeKind::Supervised, &[]);
    assert_beats_chance(Method::Mdd, TrainModeKind::SingleSource, &["source"]);
    assert_beats_chance(Method::Mdd, TrainModeKind::SourceCombine, &["s1", "s2"]);
}

#[test]
fn every_strategy_rejects_multi_source_before_training() {
    for method in [Method::Irm, Method::Mcd, Method::Mdd] {
        let err = run(method, TrainModeKind::MultiSource, &["s1", "s2"]).expect_err("multi-source must fail");
        match err {
            TrainError::Config(ConfigError::UnsupportedTrainMode { strategy, mode }) => {
                assert_eq!(strategy, method.name());
                assert_eq!(mode, "multi-source");
            }
            other => panic!("{method}: unexpected error {other}"),
        }
    }
}

#[test]
fn unequal_domain_sizes_train_without_partial_batches() {
    let base = config(Method::Irm, TrainModeKind::SingleSource, &["source"]);
    let cfg = TrainingConfig { batch_size: 4, max_epoch: 1, ..base };
    cfg.validate().expect("valid config");
    let mut data = DomainLoaders::for_run(
        sized_domain("target", 10, 1),
        sized_domain("target", 10, 2),
        vec![sized_domain("source", 12, 10)],
        LoaderOptions { batch_size: 4, ..LoaderOptions::default() },
        Device::Cpu,
    )
    .expect("loaders");
    let mut strategy = build_strategy(&cfg).expect("irm");
    let summary = Trainer::new(cfg).train(strategy.as_mut(), &mut data).expect("epoch completes");
    assert_eq!(summary.history.len(), 1);
}

#[test]
fn mdd_reversal_advances_once_per_batch_across_epochs() {
    let cfg = config(Method::Mdd, TrainModeKind::SingleSource, &["source"]);
    let mut data = loaders(&cfg);
    let per_epoch = data.num_batches("train").expect("train stream") as u64;
    tch::manual_seed(0);
    let mut mdd = MddStrategy::new(&cfg, Device::Cpu).expect("mdd");
    Trainer::new(cfg.clone()).train(&mut mdd, &mut data).expect("mdd run");
    assert_eq!(mdd.network().grl().iterations(), cfg.max_epoch as u64 * per_epoch);
    assert!(mdd.network().grl().coeff() > 0.0);
}

#[test]
fn irm_optimizer_never_moves_invariance_scale() {
    tch::manual_seed(0);
    let cfg = config(Method::Irm, TrainModeKind::SingleSource, &["source"]);
    let mut irm = IrmStrategy::new(&cfg, Device::Cpu).expect("irm");
    let (source, target) = (toy_batch(0.0), toy_batch(0.1));
    let before = snapshot(irm.network().var_store());

    let mut metrics = EpochMetrics::new();
    for _ in 0..3 {
        irm.train_step(&source, &target, &[1.0, 1.0], &mut metrics).expect("irm step");
    }

    assert!(total_change(&before, &snapshot(irm.network().var_store())) > 0.0, "network must train");
    assert_eq!(irm.penalty().scale().double_value(&[0]), 1.0);
}

#[test]
fn train_history_reports_strategy_metrics() {
    let summary = run(Method::Mcd, TrainModeKind::SingleSource, &["source"]).expect("mcd run");
    let train = &summary.history[0].train;
    let names: Vec<&str> = train.losses.iter().map(|(n, _)| n.as_str()).collect();
    assert_eq!(
        names,
        vec!["Step 1: Source domain", "Step 2: Maximize discrepancy", "Step 3: Minimize discrepancy"]
    );
    let val = &summary.history[0].val;
    assert!(val.accuracy("Classifier 1 Target Data").is_some());
    assert!(val.accuracy("Classifier 2 Target Data").is_some());
}

// ---------------------------------------------------------------------------
// MCD step ordering
// ---------------------------------------------------------------------------

fn snapshot(vs: &tch::nn::VarStore) -> Vec<Tensor> {
    let mut vars: Vec<(String, Tensor)> = vs.variables().into_iter().collect();
    vars.sort_by(|a, b| a.0.cmp(&b.0));
    vars.into_iter().map(|(_, t)| t.detach().copy()).collect()
}

fn total_change(before: &[Tensor], after: &[Tensor]) -> f64 {
    before.iter().zip(after).map(|(a, b)| (a - b).abs().sum(Kind::Float).double_value(&[])).sum()
}

fn toy_batch(shift: f32) -> Batch {
    let inputs = Tensor::from_slice(&[-1.0f32 + shift, -0.8 + shift, 0.9 + shift, 1.1 + shift]).view([4, 1]);
    Batch::new(inputs, Tensor::from_slice(&[0i64, 0, 1, 1]))
}

#[test]
fn mcd_step_one_updates_generator_and_step_two_does_not() {
    tch::manual_seed(0);
    let cfg = config(Method::Mcd, TrainModeKind::SingleSource, &["source"]);
    let mut mcd = McdStrategy::new(&cfg, Device::Cpu).expect("mcd");
    let (source, target) = (toy_batch(0.0), toy_batch(0.1));
    let mut metrics = EpochMetrics::new();

    let g0 = snapshot(mcd.networks().generator_store());
    mcd.step_supervised(&source, &target, &mut metrics).expect("step 1");
    let g1 = snapshot(mcd.networks().generator_store());
    assert!(total_change(&g0, &g1) > 0.0, "step 1 must move G");

    let c1 = snapshot(mcd.networks().classifier_store());
    mcd.step_maximize_discrepancy(&source, &target, 0.0, &mut metrics).expect("step 2");
    let g2 = snapshot(mcd.networks().generator_store());
    let c2 = snapshot(mcd.networks().classifier_store());
    assert_eq!(total_change(&g1, &g2), 0.0, "step 2 must leave G untouched");
    assert!(total_change(&c1, &c2) > 0.0, "step 2 must move the heads");
}

/// With a zero trade-off nothing moves, so every repetition sees the same
/// unweighted discrepancy and the logged value is four times it.
#[test]
fn mcd_step_three_logs_unweighted_discrepancy_sum() {
    tch::manual_seed(0);
    let cfg = TrainingConfig { mcd_generator_steps: 4, ..config(Method::Mcd, TrainModeKind::Supervised, &[]) };
    let mut mcd = McdStrategy::new(&cfg, Device::Cpu).expect("mcd");
    let target = toy_batch(0.0);
    let c0 = snapshot(mcd.networks().classifier_store());

    let per_step = tch::no_grad(|| {
        let (y1, y2) = mcd.networks().classify(&mcd.networks().features(&target.inputs));
        classifier_discrepancy(&y1.softmax(-1, Kind::Float), &y2.softmax(-1, Kind::Float)).double_value(&[])
    });
    assert!(per_step > 0.0, "independent heads must disagree");

    let mut metrics = EpochMetrics::new();
    mcd.step_minimize_discrepancy(&target, 0.0, &mut metrics);

    let logged = metrics.loss_sum("Step 3: Minimize discrepancy").expect("step 3 recorded");
    assert_abs_diff_eq!(logged, 4.0 * per_step, epsilon = 1e-5);
    let c1 = snapshot(mcd.networks().classifier_store());
    assert_eq!(total_change(&c0, &c1), 0.0, "step 3 must leave the heads untouched");
}

#[test]
fn mcd_rejects_unequal_batches() {
    tch::manual_seed(0);
    let cfg = config(Method::Mcd, TrainModeKind::SingleSource, &["source"]);
    let mut mcd = McdStrategy::new(&cfg, Device::Cpu).expect("mcd");
    let short = Batch::new(Tensor::zeros([2, 1], (Kind::Float, Device::Cpu)), Tensor::from_slice(&[0i64, 1]));
    let err = mcd.step_supervised(&toy_batch(0.0), &short, &mut EpochMetrics::new()).expect_err("mismatch");
    assert!(matches!(err, TrainError::BatchMismatch { source_len: 4, target_len: 2 }));
}
