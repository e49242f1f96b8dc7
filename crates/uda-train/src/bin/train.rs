//! `train` binary: runs one domain-adaptation strategy end to end.
//!
//! Real datasets are out of scope for this crate, so the binary trains on
//! deterministic synthetic domains: a target domain shifted away from one
//! or more source domains.
//!
//! # Usage
//!
//! ```bash
//! cargo run --bin train -- --method mdd --epochs 20
//! cargo run --bin train -- --config run.json --cuda --log-level debug
//! ```

use clap::Parser;
use std::path::PathBuf;
use tracing::{error, info};
use uda_train::config::{Method, TrainingConfig};
use uda_train::dataset::{synthetic_domain, DomainDataset, DomainLoaders, LoaderOptions, SyntheticDomainConfig};
use uda_train::mode::TrainModeKind;
use uda_train::strategies::build_strategy;
use uda_train::trainer::Trainer;
use uda_train::TrainResult;

/// Command-line arguments for the training binary.
#[derive(Parser, Debug)]
#[command(name = "train", version, about = "Unsupervised domain-adaptation trainer (IRM / MCD / MDD)", long_about = None)]
struct Args {
    /// Path to a JSON configuration file.
    ///
    /// If not provided, the default `TrainingConfig` is used.
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Override the strategy from the config (irm, mcd, mdd).
    #[arg(long, value_parser = parse_method)]
    method: Option<Method>,

    /// Override the number of epochs.
    #[arg(long)]
    epochs: Option<usize>,

    /// Enable CUDA training (overrides config `use_gpu`).
    #[arg(long, default_value_t = false)]
    cuda: bool,

    /// Samples per synthetic domain.
    #[arg(long, default_value_t = 256)]
    samples: usize,

    /// Shift of the synthetic target domain relative to the sources.
    #[arg(long, default_value_t = 0.75)]
    target_shift: f32,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn parse_method(s: &str) -> Result<Method, String> {
    match s.to_ascii_lowercase().as_str() {
        "irm" => Ok(Method::Irm),
        "mcd" => Ok(Method::Mcd),
        "mdd" => Ok(Method::Mdd),
        other => Err(format!("unknown method `{other}` (expected irm, mcd or mdd)")),
    }
}

fn main() {
    let args = Args::parse();

    let log_level_filter = args
        .log_level
        .parse::<tracing_subscriber::filter::LevelFilter>()
        .unwrap_or(tracing_subscriber::filter::LevelFilter::INFO);

    tracing_subscriber::fmt()
        .with_max_level(log_level_filter)
        .with_target(false)
        .with_thread_ids(false)
        .init();

    info!("Domain-adaptation trainer v{}", uda_train::VERSION);

    let mut config = match args.config.as_deref() {
        Some(path) => {
            info!("Loading configuration from {}", path.display());
            match TrainingConfig::from_json(path) {
                Ok(cfg) => cfg,
                Err(e) => {
                    error!("Failed to load configuration: {e}");
                    std::process::exit(1);
                }
            }
        }
        None => {
            info!("No configuration file provided, using defaults");
            TrainingConfig::default()
        }
    };

    // Apply CLI overrides.
    if let Some(method) = args.method {
        if method != config.method && config.tradeoff.len() != method.tradeoff_len() {
            info!("Resetting trade-off schedules to the {} defaults", method);
            config.tradeoff = method.default_tradeoff();
        }
        config.method = method;
    }
    if let Some(epochs) = args.epochs {
        config.max_epoch = epochs;
    }
    if args.cuda {
        config.use_gpu = true;
    }

    if let Err(e) = config.validate() {
        error!("Configuration validation failed: {e}");
        std::process::exit(1);
    }

    info!("Configuration validated successfully");
    info!("  method       : {}", config.method);
    info!("  train mode   : {:?}", config.train_mode);
    info!("  batch size   : {}", config.batch_size);
    info!("  learning rate: {}", config.learning_rate);
    info!("  epochs       : {}", config.max_epoch);
    info!("  device       : {:?}", config.device());

    if let Err(e) = run(config, &args) {
        error!("Training failed: {e}");
        std::process::exit(1);
    }
}

fn run(config: TrainingConfig, args: &Args) -> TrainResult<()> {
    let data = build_domains(&config, args)?;
    let mut loaders = DomainLoaders::for_run(
        data.target_train,
        data.target_val,
        data.sources,
        LoaderOptions { batch_size: config.batch_size, seed: config.seed, ..LoaderOptions::default() },
        config.device(),
    )?;
    info!("Registered domains: {:?}", loaders.keys());

    let mut strategy = build_strategy(&config)?;
    let summary = Trainer::new(config).train(strategy.as_mut(), &mut loaders)?;
    info!("Finished: best epoch {}, val-acc {:.4}", summary.best.epoch, summary.best.accuracy);
    Ok(())
}

struct SyntheticDomains {
    target_train: DomainDataset,
    target_val: DomainDataset,
    sources: Vec<DomainDataset>,
}

fn build_domains(config: &TrainingConfig, args: &Args) -> TrainResult<SyntheticDomains> {
    let base = SyntheticDomainConfig {
        num_samples: args.samples,
        input_dim: config.input_dim,
        num_classes: config.num_classes,
        seed: config.seed,
        ..SyntheticDomainConfig::default()
    };
    info!("Synthetic domains: {} samples each, target shift {}", args.samples, args.target_shift);

    let target = |seed_offset: u64| SyntheticDomainConfig {
        shift: args.target_shift,
        seed: base.seed.wrapping_add(seed_offset),
        ..base.clone()
    };
    let target_train = synthetic_domain("target", &target(1000))?;
    let target_val = synthetic_domain("target", &target(2000))?;

    let sources = match config.train_mode {
        TrainModeKind::Supervised => Vec::new(),
        _ => config
            .source_names
            .iter()
            .enumerate()
            .map(|(i, name)| {
                let cfg = SyntheticDomainConfig {
                    shift: -0.25 * i as f32,
                    seed: base.seed.wrapping_add(i as u64),
                    ..base.clone()
                };
                synthetic_domain(name, &cfg)
            })
            .collect::<Result<Vec<_>, _>>()?,
    };
    Ok(SyntheticDomains { target_train, target_val, sources })
}
