//! Error types for the domain-adaptation training pipeline.
//!
//! Every module that produces an error imports its error type from here
//! rather than defining it inline, keeping the hierarchy in one place.
//!
//! ## Hierarchy
//!
//! ```text
//! TrainError (top-level)
//! ├── ConfigError   (config validation / file loading / unsupported train mode)
//! ├── DatasetError  (domain lookup, empty pools, tensor shapes)
//! └── TchError      (libtorch failures surfaced by `f_*` calls)
//! ```
//!
//! There are no retries anywhere in the pipeline: a failed batch aborts the
//! run and the partially accumulated epoch is discarded.

use std::path::PathBuf;
use thiserror::Error;

// ---------------------------------------------------------------------------
// TrainResult
// ---------------------------------------------------------------------------

/// Convenient `Result` alias used by orchestration-level functions.
pub type TrainResult<T> = Result<T, TrainError>;

// ---------------------------------------------------------------------------
// TrainError: top-level aggregator
// ---------------------------------------------------------------------------

/// Top-level error type for the training pipeline.
///
/// [`crate::trainer::Trainer`] and the strategies return `TrainResult<T>`.
/// Lower-level errors from [`crate::config`] and [`crate::dataset`] are
/// coerced into `TrainError` via [`From`].
#[derive(Debug, Error)]
pub enum TrainError {
    /// A configuration validation or loading error.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// A dataset loading or access error.
    #[error("Dataset error: {0}")]
    Dataset(#[from] DatasetError),

    /// An error raised by libtorch.
    #[error("Torch error: {0}")]
    Tch(#[from] tch::TchError),

    /// Source and target batches cannot be split back into equal halves.
    #[error("Batch size mismatch: source has {source_len} samples, target has {target_len}")]
    BatchMismatch {
        /// Number of samples in the source batch.
        source_len: i64,
        /// Number of samples in the target batch.
        target_len: i64,
    },

    /// A training step failed.
    #[error("Training step failed: {0}")]
    TrainingStep(String),
}

impl TrainError {
    /// Construct a [`TrainError::TrainingStep`].
    pub fn training_step<S: Into<String>>(msg: S) -> Self {
        TrainError::TrainingStep(msg.into())
    }
}

// ---------------------------------------------------------------------------
// ConfigError
// ---------------------------------------------------------------------------

/// Errors produced when loading or validating a [`TrainingConfig`], or when
/// a strategy is asked to run in a mode it cannot support.
///
/// [`TrainingConfig`]: crate::config::TrainingConfig
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A field has an invalid value.
    #[error("Invalid value for `{field}`: {reason}")]
    InvalidValue {
        /// Name of the field.
        field: &'static str,
        /// Human-readable reason.
        reason: String,
    },

    /// A configuration file could not be read from disk.
    #[error("Cannot read config file `{path}`: {source}")]
    FileRead {
        /// Path that was being read.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// A configuration file contains malformed JSON.
    #[error("Cannot parse config file `{path}`: {source}")]
    ParseError {
        /// Path that was being parsed.
        path: PathBuf,
        /// Underlying JSON parse error.
        #[source]
        source: serde_json::Error,
    },

    /// The strategy cannot be trained in the requested mode.
    #[error("{strategy} cannot be trained with {mode} data")]
    UnsupportedTrainMode {
        /// Strategy name (e.g. `"MCD"`).
        strategy: &'static str,
        /// Offending mode (e.g. `"multi-source"`).
        mode: String,
    },

    /// The trade-off vector does not match the strategy's auxiliary losses.
    #[error("{strategy} combines {expected} auxiliary losses but {found} trade-off schedules were given")]
    TradeoffLength {
        /// Strategy name.
        strategy: &'static str,
        /// Number of weights the strategy needs.
        expected: usize,
        /// Number of schedules in the config.
        found: usize,
    },
}

impl ConfigError {
    /// Construct a [`ConfigError::InvalidValue`].
    pub fn invalid_value<S: Into<String>>(field: &'static str, reason: S) -> Self {
        ConfigError::InvalidValue { field, reason: reason.into() }
    }
}

// ---------------------------------------------------------------------------
// DatasetError
// ---------------------------------------------------------------------------

/// Errors produced while assembling or sampling domain batches.
///
/// Missing data is never suppressed: an unknown domain key or an empty pool
/// fails the run explicitly.
#[derive(Debug, Error)]
pub enum DatasetError {
    /// No loader is registered under the requested key.
    #[error("Unknown domain `{key}` (registered: {registered:?})")]
    UnknownDomain {
        /// Requested key.
        key: String,
        /// Keys that are available.
        registered: Vec<String>,
    },

    /// A dataset with zero samples was handed to a loader.
    #[error("Domain `{name}` contains no samples")]
    EmptyDomain {
        /// Domain name.
        name: String,
    },

    /// Inputs and labels disagree on the number of samples, or feature
    /// widths of combined domains differ.
    #[error("Shape mismatch in `{name}`: {message}")]
    ShapeMismatch {
        /// Domain name.
        name: String,
        /// Description of the problem.
        message: String,
    },
}

impl DatasetError {
    /// Construct a [`DatasetError::ShapeMismatch`].
    pub fn shape_mismatch<S: Into<String>>(name: impl Into<String>, msg: S) -> Self {
        DatasetError::ShapeMismatch { name: name.into(), message: msg.into() }
    }
}
