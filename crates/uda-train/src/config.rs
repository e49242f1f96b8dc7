//! Training configuration for domain-adaptation runs.
//!
//! [`TrainingConfig`] holds every hyper-parameter a run needs: which
//! strategy to train, where source batches come from, the shape of the
//! networks, the optimisation recipe and the per-strategy knobs. It is
//! serializable via [`serde`] so a run can be stored to / restored from a
//! JSON file.
//!
//! # Example
//!
//! ```rust
//! use uda_train::config::{Method, TrainingConfig};
//!
//! let cfg = TrainingConfig::default();
//! cfg.validate().expect("default config is valid");
//!
//! assert_eq!(cfg.method, Method::Irm);
//! assert_eq!(cfg.tradeoff.len(), 2);
//! ```

use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tch::Device;

use crate::domain::WarmStartSchedule;
use crate::error::ConfigError;
use crate::mode::{TrainMode, TrainModeKind};
use crate::schedule::{LrSchedulerConfig, OptimizerKind, TradeoffSchedule};

// ---------------------------------------------------------------------------
// Method
// ---------------------------------------------------------------------------

/// Domain-adaptation strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Method {
    /// Kernel alignment plus invariance penalty.
    Irm,
    /// Maximum classifier discrepancy.
    Mcd,
    /// Margin disparity discrepancy.
    Mdd,
}

impl Method {
    /// Number of trade-off weights the strategy combines.
    pub fn tradeoff_len(self) -> usize {
        match self {
            Method::Irm => 2,
            Method::Mcd | Method::Mdd => 1,
        }
    }

    /// Constant `1.0` for every auxiliary loss of the strategy.
    pub fn default_tradeoff(self) -> Vec<TradeoffSchedule> {
        vec![TradeoffSchedule::constant(1.0); self.tradeoff_len()]
    }

    /// Upper-case display name, as used in log lines and errors.
    pub fn name(self) -> &'static str {
        match self {
            Method::Irm => "IRM",
            Method::Mcd => "MCD",
            Method::Mdd => "MDD",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ---------------------------------------------------------------------------
// TrainingConfig
// ---------------------------------------------------------------------------

/// Complete configuration for one training run.
///
/// Use [`TrainingConfig::default()`] as a starting point, then override
/// individual fields as needed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingConfig {
    // -----------------------------------------------------------------------
    // Strategy / data
    // -----------------------------------------------------------------------
    /// Strategy to train. Default: **irm**.
    pub method: Method,

    /// Where source batches come from. Default: **single_source**.
    pub train_mode: TrainModeKind,

    /// Source domain names; the first is used by `single_source`, all of
    /// them by `source_combine`. Default: **["source"]**.
    pub source_names: Vec<String>,

    // -----------------------------------------------------------------------
    // Model
    // -----------------------------------------------------------------------
    /// Input feature width. Default: **16**.
    pub input_dim: usize,

    /// Hidden width of the feature extractor. Default: **64**.
    pub hidden_dim: usize,

    /// Width of the features handed to the classifier heads. Default: **32**.
    pub feature_dim: usize,

    /// Number of classes. Default: **2**.
    pub num_classes: usize,

    /// Dropout probability inside the networks, in `[0, 1)`. Default: **0.5**.
    pub dropout: f64,

    // -----------------------------------------------------------------------
    // Optimisation
    // -----------------------------------------------------------------------
    /// Optimizer family. Default: **adam**.
    pub optimizer: OptimizerKind,

    /// Initial learning rate. Default: **1e-3**.
    pub learning_rate: f64,

    /// SGD momentum; ignored by Adam. Default: **0.9**.
    pub momentum: f64,

    /// L2 weight decay. Default: **1e-5**.
    pub weight_decay: f64,

    /// Learning-rate policy, stepped once per epoch. Default: **step(50, 0.1)**.
    pub lr_scheduler: LrSchedulerConfig,

    /// Number of epochs. Default: **100**.
    pub max_epoch: usize,

    /// Samples per batch for both domains. Default: **64**.
    pub batch_size: usize,

    // -----------------------------------------------------------------------
    // Objective weighting
    // -----------------------------------------------------------------------
    /// One schedule per auxiliary loss: IRM takes 2 (MMD, invariance),
    /// MCD and MDD take 1. Default: **[constant 1.0, constant 1.0]**.
    pub tradeoff: Vec<TradeoffSchedule>,

    /// MDD margin γ. Default: **4.0**.
    pub mdd_margin: f64,

    /// MDD gradient-reversal warm-up. Default: **alpha 1, lo 0, hi 0.1,
    /// max_iters 1000**.
    pub grl: WarmStartSchedule,

    /// MCD generator updates per batch (Step 3). Default: **4**.
    pub mcd_generator_steps: usize,

    // -----------------------------------------------------------------------
    // Device / reproducibility
    // -----------------------------------------------------------------------
    /// Use a CUDA device when one is available. Default: **false**.
    pub use_gpu: bool,

    /// CUDA device index when `use_gpu` is `true`. Default: **0**.
    pub gpu_device_id: usize,

    /// Seed for parameter initialisation and batch shuffling. Default: **42**.
    pub seed: u64,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        TrainingConfig {
            method: Method::Irm,
            train_mode: TrainModeKind::SingleSource,
            source_names: vec!["source".to_string()],
            input_dim: 16,
            hidden_dim: 64,
            feature_dim: 32,
            num_classes: 2,
            dropout: 0.5,
            optimizer: OptimizerKind::Adam,
            learning_rate: 1e-3,
            momentum: 0.9,
            weight_decay: 1e-5,
            lr_scheduler: LrSchedulerConfig::Step { step_size: 50, gamma: 0.1 },
            max_epoch: 100,
            batch_size: 64,
            tradeoff: Method::Irm.default_tradeoff(),
            mdd_margin: 4.0,
            grl: WarmStartSchedule::default(),
            mcd_generator_steps: 4,
            use_gpu: false,
            gpu_device_id: 0,
            seed: 42,
        }
    }
}

impl TrainingConfig {
    /// Load a [`TrainingConfig`] from a JSON file at `path` and validate it.
    ///
    /// # Errors
    ///
    /// [`ConfigError::FileRead`] if the file cannot be opened,
    /// [`ConfigError::ParseError`] if the JSON is malformed, and any
    /// [`TrainingConfig::validate`] error.
    pub fn from_json(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::FileRead {
            path: path.to_path_buf(),
            source,
        })?;
        let cfg: TrainingConfig = serde_json::from_str(&contents).map_err(|source| ConfigError::ParseError {
            path: path.to_path_buf(),
            source,
        })?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Write this configuration to `path` as pretty-printed JSON, creating
    /// parent directories if necessary.
    ///
    /// # Errors
    ///
    /// [`ConfigError::FileRead`] on any I/O failure.
    pub fn to_json(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| ConfigError::FileRead {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| ConfigError::invalid_value("(serialization)", e.to_string()))?;
        std::fs::write(path, json).map_err(|source| ConfigError::FileRead {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(())
    }

    /// Resolve `train_mode` against `source_names`.
    ///
    /// # Errors
    ///
    /// See [`TrainMode::resolve`].
    pub fn train_mode(&self) -> Result<TrainMode, ConfigError> {
        TrainMode::resolve(self.train_mode, &self.source_names)
    }

    /// Device all tensors of the run live on.
    pub fn device(&self) -> Device {
        if self.use_gpu && tch::Cuda::is_available() {
            Device::Cuda(self.gpu_device_id)
        } else {
            Device::Cpu
        }
    }

    /// Validate all fields, returning the first problem found.
    ///
    /// # Errors
    ///
    /// [`ConfigError::InvalidValue`] for out-of-range fields and
    /// [`ConfigError::TradeoffLength`] when the number of trade-off
    /// schedules does not match [`Method::tradeoff_len`].
    pub fn validate(&self) -> Result<(), ConfigError> {
        // Model dims
        if self.input_dim == 0 {
            return Err(ConfigError::invalid_value("input_dim", "must be > 0"));
        }
        if self.hidden_dim == 0 {
            return Err(ConfigError::invalid_value("hidden_dim", "must be > 0"));
        }
        if self.feature_dim == 0 {
            return Err(ConfigError::invalid_value("feature_dim", "must be > 0"));
        }
        if self.num_classes < 2 {
            return Err(ConfigError::invalid_value("num_classes", "must be >= 2"));
        }
        if !(0.0..1.0).contains(&self.dropout) {
            return Err(ConfigError::invalid_value("dropout", format!("must be in [0, 1), got {}", self.dropout)));
        }

        // Optimisation
        if !(self.learning_rate.is_finite() && self.learning_rate > 0.0) {
            return Err(ConfigError::invalid_value(
                "learning_rate",
                format!("must be > 0.0, got {}", self.learning_rate),
            ));
        }
        if !(0.0..1.0).contains(&self.momentum) {
            return Err(ConfigError::invalid_value("momentum", "must be in [0, 1)"));
        }
        if self.weight_decay < 0.0 {
            return Err(ConfigError::invalid_value("weight_decay", "must be >= 0.0"));
        }
        self.validate_lr_scheduler()?;
        if self.max_epoch == 0 {
            return Err(ConfigError::invalid_value("max_epoch", "must be > 0"));
        }
        // Every statistic here needs both halves of a batch to hold at least
        // two samples.
        if self.batch_size < 2 {
            return Err(ConfigError::invalid_value("batch_size", "must be >= 2"));
        }

        // Objective weighting
        let expected = self.method.tradeoff_len();
        if self.tradeoff.len() != expected {
            return Err(ConfigError::TradeoffLength {
                strategy: self.method.name(),
                expected,
                found: self.tradeoff.len(),
            });
        }
        if let Some(i) = self.tradeoff.iter().position(|s| !s.is_valid()) {
            return Err(ConfigError::invalid_value(
                "tradeoff",
                format!("schedule {i} has a negative or non-finite weight"),
            ));
        }
        if !(self.mdd_margin.is_finite() && self.mdd_margin > 0.0) {
            return Err(ConfigError::invalid_value("mdd_margin", "must be > 0.0"));
        }
        if self.grl.hi < self.grl.lo || self.grl.max_iters == 0 {
            return Err(ConfigError::invalid_value("grl", "requires hi >= lo and max_iters > 0"));
        }
        if self.mcd_generator_steps == 0 {
            return Err(ConfigError::invalid_value("mcd_generator_steps", "must be > 0"));
        }

        // Source domains
        self.train_mode()?;

        Ok(())
    }

    fn validate_lr_scheduler(&self) -> Result<(), ConfigError> {
        match &self.lr_scheduler {
            LrSchedulerConfig::Fixed => Ok(()),
            LrSchedulerConfig::Step { step_size, gamma } => {
                if *step_size == 0 {
                    return Err(ConfigError::invalid_value("lr_scheduler.step_size", "must be > 0"));
                }
                check_gamma(*gamma)
            }
            LrSchedulerConfig::MultiStep { milestones, gamma } => {
                if milestones.windows(2).any(|w| w[0] >= w[1]) {
                    return Err(ConfigError::invalid_value(
                        "lr_scheduler.milestones",
                        "must be sorted in strictly increasing order",
                    ));
                }
                check_gamma(*gamma)
            }
            LrSchedulerConfig::Exp { gamma } => check_gamma(*gamma),
        }
    }
}

fn check_gamma(gamma: f64) -> Result<(), ConfigError> {
    if gamma > 0.0 && gamma <= 1.0 {
        Ok(())
    } else {
        Err(ConfigError::invalid_value("lr_scheduler.gamma", format!("must be in (0, 1], got {gamma}")))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn default_config_is_valid() {
        TrainingConfig::default().validate().expect("default config should be valid");
    }

    #[test]
    fn json_round_trip() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("nested").join("config.json");

        let original = TrainingConfig {
            method: Method::Mdd,
            tradeoff: vec![TradeoffSchedule::Linear { start: 0.0, end: 1.0, ramp_epochs: 5 }],
            lr_scheduler: LrSchedulerConfig::MultiStep { milestones: vec![10, 20], gamma: 0.5 },
            ..TrainingConfig::default()
        };
        original.to_json(&path).expect("serialization should succeed");

        let loaded = TrainingConfig::from_json(&path).expect("deserialization should succeed");
        assert_eq!(loaded, original);
    }

    #[test]
    fn malformed_json_is_a_parse_error() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("bad.json");
        std::fs::write(&path, "{ not json").unwrap();
        assert!(matches!(TrainingConfig::from_json(&path), Err(ConfigError::ParseError { .. })));
    }

    #[test]
    fn missing_file_is_a_read_error() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("absent.json");
        assert!(matches!(TrainingConfig::from_json(&path), Err(ConfigError::FileRead { .. })));
    }

    #[test]
    fn tradeoff_length_must_match_method() {
        let cfg = TrainingConfig { method: Method::Mcd, ..TrainingConfig::default() };
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::TradeoffLength { strategy: "MCD", expected: 1, found: 2 })
        ));
    }

    #[test]
    fn dropout_of_one_is_invalid() {
        let cfg = TrainingConfig { dropout: 1.0, ..TrainingConfig::default() };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn unsorted_milestones_are_invalid() {
        let cfg = TrainingConfig {
            lr_scheduler: LrSchedulerConfig::MultiStep { milestones: vec![20, 10], gamma: 0.1 },
            ..TrainingConfig::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn single_source_without_names_is_invalid() {
        let cfg = TrainingConfig { source_names: Vec::new(), ..TrainingConfig::default() };
        assert!(cfg.validate().is_err());
        let cfg = TrainingConfig { train_mode: TrainModeKind::Supervised, ..cfg };
        cfg.validate().expect("supervised needs no source names");
    }

    #[test]
    fn cpu_device_unless_gpu_requested() {
        assert_eq!(TrainingConfig::default().device(), Device::Cpu);
    }
}
