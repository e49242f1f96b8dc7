//! Integration tests for [`uda_train::config`]: the on-disk JSON format.

use tempfile::tempdir;
use uda_train::config::{Method, TrainingConfig};
use uda_train::mode::{TrainMode, TrainModeKind};
use uda_train::schedule::{resolve_tradeoff, LrSchedulerConfig, OptimizerKind, TradeoffSchedule};
use uda_train::ConfigError;

const MDD_RUN: &str = r#"{
    "method": "mdd",
    "train_mode": "source_combine",
    "source_names": ["amazon", "webcam"],
    "input_dim": 8,
    "hidden_dim": 32,
    "feature_dim": 16,
    "num_classes": 3,
    "dropout": 0.1,
    "optimizer": "sgd",
    "learning_rate": 0.01,
    "momentum": 0.9,
    "weight_decay": 0.0005,
    "lr_scheduler": { "kind": "exp", "gamma": 0.95 },
    "max_epoch": 30,
    "batch_size": 32,
    "tradeoff": [{ "kind": "sigmoid", "value": 1.0 }],
    "mdd_margin": 4.0,
    "grl": { "alpha": 1.0, "lo": 0.0, "hi": 0.1, "max_iters": 1000 },
    "mcd_generator_steps": 4,
    "use_gpu": false,
    "gpu_device_id": 0,
    "seed": 7
}"#;

#[test]
fn hand_written_json_loads() {
    let tmp = tempdir().unwrap();
    let path = tmp.path().join("mdd.json");
    std::fs::write(&path, MDD_RUN).unwrap();

    let cfg = TrainingConfig::from_json(&path).expect("valid config");
    assert_eq!(cfg.method, Method::Mdd);
    assert_eq!(cfg.optimizer, OptimizerKind::Sgd);
    assert_eq!(cfg.lr_scheduler, LrSchedulerConfig::Exp { gamma: 0.95 });
    assert_eq!(cfg.tradeoff, vec![TradeoffSchedule::Sigmoid { value: 1.0 }]);
    assert_eq!(
        cfg.train_mode().unwrap(),
        TrainMode::SourceCombine(vec!["amazon".to_string(), "webcam".to_string()])
    );
}

#[test]
fn json_with_wrong_tradeoff_count_is_rejected() {
    let tmp = tempdir().unwrap();
    let path = tmp.path().join("irm.json");
    let json = MDD_RUN.replace("\"mdd\"", "\"irm\"");
    std::fs::write(&path, json).unwrap();

    match TrainingConfig::from_json(&path) {
        Err(ConfigError::TradeoffLength { strategy, expected, found }) => {
            assert_eq!((strategy, expected, found), ("IRM", 2, 1));
        }
        other => panic!("expected TradeoffLength, got {other:?}"),
    }
}

#[test]
fn resolved_tradeoff_follows_epochs() {
    let cfg = TrainingConfig {
        tradeoff: vec![
            TradeoffSchedule::Linear { start: 0.0, end: 1.0, ramp_epochs: 2 },
            TradeoffSchedule::constant(0.5),
        ],
        ..TrainingConfig::default()
    };
    cfg.validate().expect("valid");
    assert_eq!(resolve_tradeoff(&cfg.tradeoff, 1, cfg.max_epoch), vec![0.0, 0.5]);
    assert_eq!(resolve_tradeoff(&cfg.tradeoff, 2, cfg.max_epoch), vec![0.5, 0.5]);
    assert_eq!(resolve_tradeoff(&cfg.tradeoff, 3, cfg.max_epoch), vec![1.0, 0.5]);
}

#[test]
fn supervised_mode_round_trips_without_sources() {
    let tmp = tempdir().unwrap();
    let path = tmp.path().join("sup.json");
    let cfg = TrainingConfig { train_mode: TrainModeKind::Supervised, source_names: Vec::new(), ..Default::default() };
    cfg.to_json(&path).unwrap();
    let loaded = TrainingConfig::from_json(&path).unwrap();
    assert_eq!(loaded.train_mode().unwrap(), TrainMode::Supervised);
}
