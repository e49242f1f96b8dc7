//! Source-domain selection.
//!
//! The configured `train_mode` decides where the *source* half of every
//! training batch comes from. It is resolved once, at the start of a run,
//! into a [`TrainMode`]; the trainer then asks the mode for a
//! [`SourceSelection`] that supplies `(source, target)` pairs for the rest of
//! the run.
//!
//! | `train_mode`     | source batch                                   |
//! |------------------|------------------------------------------------|
//! | `supervised`     | the target batch itself                        |
//! | `single_source`  | next batch of the named domain                 |
//! | `source_combine` | next batch of the pooled domains (`a+b+…` key) |
//! | `multi_source`   | rejected before the first epoch                |

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::dataset::{Batch, DomainBatchSource};
use crate::error::{ConfigError, TrainResult};

/// Serialized form of the train mode, as written in config files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrainModeKind {
    /// Source batches are the target batches.
    Supervised,
    /// One named source domain.
    SingleSource,
    /// Several source domains pooled into one loader.
    SourceCombine,
    /// Several source domains kept apart.
    MultiSource,
}

/// Train mode resolved against the configured source names.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrainMode {
    /// No separate source domain.
    Supervised,
    /// Source batches come from this domain.
    SingleSource(String),
    /// Source batches come from the union of these domains.
    SourceCombine(Vec<String>),
    /// One loader per source domain. No strategy in this crate supports it.
    MultiSource(Vec<String>),
}

impl TrainMode {
    /// Resolve `kind` against `source_names`.
    ///
    /// # Errors
    ///
    /// [`ConfigError::InvalidValue`] when single-source or source-combine
    /// training is given no source domain. Multi-source always resolves so
    /// that the strategy capability check can reject it by name.
    pub fn resolve(kind: TrainModeKind, source_names: &[String]) -> Result<Self, ConfigError> {
        let need_sources = || {
            if source_names.is_empty() {
                Err(ConfigError::invalid_value(
                    "source_names",
                    format!("{} training needs at least one source domain", Self::kind_label(kind)),
                ))
            } else {
                Ok(())
            }
        };
        match kind {
            TrainModeKind::Supervised => Ok(TrainMode::Supervised),
            TrainModeKind::SingleSource => {
                need_sources()?;
                if source_names.len() > 1 {
                    tracing::warn!(
                        "single-source training uses `{}`; ignoring {} further source name(s)",
                        source_names[0],
                        source_names.len() - 1
                    );
                }
                Ok(TrainMode::SingleSource(source_names[0].clone()))
            }
            TrainModeKind::SourceCombine => {
                need_sources()?;
                Ok(TrainMode::SourceCombine(source_names.to_vec()))
            }
            TrainModeKind::MultiSource => Ok(TrainMode::MultiSource(source_names.to_vec())),
        }
    }

    fn kind_label(kind: TrainModeKind) -> &'static str {
        match kind {
            TrainModeKind::Supervised => "supervised",
            TrainModeKind::SingleSource => "single-source",
            TrainModeKind::SourceCombine => "source-combine",
            TrainModeKind::MultiSource => "multi-source",
        }
    }

    /// Configuration kind of this mode.
    pub fn kind(&self) -> TrainModeKind {
        match self {
            TrainMode::Supervised => TrainModeKind::Supervised,
            TrainMode::SingleSource(_) => TrainModeKind::SingleSource,
            TrainMode::SourceCombine(_) => TrainModeKind::SourceCombine,
            TrainMode::MultiSource(_) => TrainModeKind::MultiSource,
        }
    }

    /// Batch-pair supplier for this mode, or `None` for
    /// [`TrainMode::MultiSource`], which has no single source stream.
    pub fn source_selection(&self) -> Option<SourceSelection> {
        match self {
            TrainMode::Supervised => Some(SourceSelection::SameAsTarget),
            TrainMode::SingleSource(name) => Some(SourceSelection::Domain(name.clone())),
            TrainMode::SourceCombine(names) => Some(SourceSelection::Domain(combined_key(names))),
            TrainMode::MultiSource(_) => None,
        }
    }
}

impl fmt::Display for TrainMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(Self::kind_label(self.kind()))
    }
}

/// Loader key under which pooled source domains are registered.
pub fn combined_key(names: &[String]) -> String {
    names.join("+")
}

// ---------------------------------------------------------------------------
// SourceSelection
// ---------------------------------------------------------------------------

/// Supplies the source half of each training pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceSelection {
    /// Reuse the target batch.
    SameAsTarget,
    /// Draw from the loader registered under this key.
    Domain(String),
}

impl SourceSelection {
    /// Pair `target` with a source batch, in `(source, target)` order.
    ///
    /// # Errors
    ///
    /// Propagates lookup failures from `source`.
    pub fn next_pair(&self, source: &mut dyn DomainBatchSource, target: Batch) -> TrainResult<(Batch, Batch)> {
        match self {
            SourceSelection::SameAsTarget => Ok((target.shallow_clone(), target)),
            SourceSelection::Domain(key) => Ok((source.next_batch(key)?, target)),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
