//! # Unsupervised Domain-Adaptation Training
//!
//! This crate trains a classifier on a labelled *source* domain so that it
//! performs well on an unlabelled *target* domain. Three strategies share one
//! epoch loop:
//!
//! - **IRM**: MK-MMD feature alignment plus an invariance-gradient penalty.
//! - **MCD**: two heads trained to disagree on the target, a generator
//!   trained to make them agree.
//! - **MDD**: margin disparity discrepancy against an adversarial head behind
//!   a gradient reversal layer.
//!
//! ## Architecture
//!
//! ```text
//! TrainingConfig ──► build_strategy ──► Strategy (IRM | MCD | MDD)
//!       │                                   │
//!       │                          model / losses / domain
//!       ▼                                   │
//!    Trainer ◄──────────────────────────────┘
//!       │
//!   DomainBatchSource (DomainLoaders ◄─ CyclingLoader ◄─ DomainDataset)
//!       │
//!   metrics (EpochMetrics, BestModelRecord)
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use uda_train::config::TrainingConfig;
//! use uda_train::dataset::{synthetic_domain, DomainLoaders, LoaderOptions, SyntheticDomainConfig};
//! use uda_train::strategies::build_strategy;
//! use uda_train::trainer::Trainer;
//!
//! let config = TrainingConfig { max_epoch: 5, ..TrainingConfig::default() };
//! config.validate().expect("config is valid");
//!
//! let domain = |name: &str, shift: f32| {
//!     synthetic_domain(name, &SyntheticDomainConfig { shift, ..Default::default() }).unwrap()
//! };
//! let mut data = DomainLoaders::for_run(
//!     domain("target", 0.5),
//!     domain("target", 0.5),
//!     vec![domain("source", 0.0)],
//!     LoaderOptions { batch_size: config.batch_size, ..Default::default() },
//!     config.device(),
//! )
//! .unwrap();
//!
//! let mut strategy = build_strategy(&config).unwrap();
//! let summary = Trainer::new(config).train(strategy.as_mut(), &mut data).unwrap();
//! println!("best epoch {} ({:.4})", summary.best.epoch, summary.best.accuracy);
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod dataset;
pub mod domain;
pub mod error;
pub mod losses;
pub mod metrics;
pub mod mode;
pub mod model;
pub mod schedule;
pub mod strategies;
pub mod trainer;

// Convenient re-exports at the crate root.
pub use config::{Method, TrainingConfig};
pub use dataset::{Batch, DomainBatchSource, DomainDataset, DomainLoaders};
pub use error::{ConfigError, DatasetError, TrainError, TrainResult};
pub use mode::TrainMode;
pub use strategies::build_strategy;
pub use trainer::{Strategy, Trainer, TrainingSummary};

/// Crate version string.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
