//! Domain datasets and endless batch streams.
//!
//! This module provides:
//!
//! - [`Batch`]: one `(inputs [B, D], labels [B])` pair, plus the helpers that
//!   join a source and a target batch for a single forward pass and split the
//!   result back into halves.
//! - [`DomainDataset`]: an in-memory labelled domain. Several domains can be
//!   pooled with [`DomainDataset::combine`].
//! - [`CyclingLoader`]: batched iteration with a deterministic, per-cycle
//!   reshuffle that restarts itself when exhausted.
//! - [`DomainBatchSource`]: the keyed stream the trainer pulls from, and its
//!   standard implementation [`DomainLoaders`].
//! - [`synthetic_domain`]: separable class clusters for dry runs and tests.
//!
//! # Keys
//!
//! ```text
//! "train" / "val"   target stream of the matching phase
//! "<name>"          one source domain
//! "<a>+<b>+…"       pooled source domains (see crate::mode::combined_key)
//! ```
//!
//! # Example
//!
//! ```rust
//! use uda_train::dataset::{synthetic_domain, CyclingLoader, LoaderOptions, SyntheticDomainConfig};
//!
//! let ds = synthetic_domain("office", &SyntheticDomainConfig::default()).unwrap();
//! let mut loader = CyclingLoader::new(ds, LoaderOptions { batch_size: 16, ..Default::default() }).unwrap();
//! let n = loader.num_batches();
//! for _ in 0..3 * n {
//!     let batch = loader.next_batch();
//!     assert!(batch.len() > 0);
//! }
//! ```

use std::collections::HashMap;

use tch::{Device, Kind, Tensor};
use tracing::debug;

use crate::error::{DatasetError, TrainError, TrainResult};
use crate::mode::combined_key;

// ---------------------------------------------------------------------------
// Batch
// ---------------------------------------------------------------------------

/// A mini-batch of inputs `[B, D]` (f32) and labels `[B]` (i64).
#[derive(Debug)]
pub struct Batch {
    /// Input features.
    pub inputs: Tensor,
    /// Class indices.
    pub labels: Tensor,
}

impl Batch {
    /// Wrap `inputs` and `labels`.
    pub fn new(inputs: Tensor, labels: Tensor) -> Self {
        Batch { inputs, labels }
    }

    /// Number of samples.
    pub fn len(&self) -> i64 {
        self.inputs.size().first().copied().unwrap_or(0)
    }

    /// `true` when the batch holds no samples.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// A second handle to the same storage.
    pub fn shallow_clone(&self) -> Self {
        Batch { inputs: self.inputs.shallow_clone(), labels: self.labels.shallow_clone() }
    }

    /// Move both tensors to `device`.
    pub fn to_device(&self, device: Device) -> Self {
        Batch { inputs: self.inputs.to_device(device), labels: self.labels.to_device(device) }
    }
}

/// Concatenate source and target inputs along the batch axis, source first.
///
/// # Errors
///
/// [`TrainError::BatchMismatch`] when the two batches differ in size, since
/// the joint output could not be split back into equal halves.
pub fn concat_pair(source: &Batch, target: &Batch) -> TrainResult<Tensor> {
    let (s, t) = (source.len(), target.len());
    if s != t {
        return Err(TrainError::BatchMismatch { source_len: s, target_len: t });
    }
    Ok(Tensor::cat(&[&source.inputs, &target.inputs], 0))
}

/// Split a tensor produced from [`concat_pair`] into `(source, target)`.
pub fn split_halves(joint: &Tensor) -> (Tensor, Tensor) {
    let half = joint.size()[0] / 2;
    (joint.narrow(0, 0, half), joint.narrow(0, half, half))
}

// ---------------------------------------------------------------------------
// DomainDataset
// ---------------------------------------------------------------------------

/// An in-memory labelled domain.
#[derive(Debug)]
pub struct DomainDataset {
    name: String,
    inputs: Tensor,
    labels: Tensor,
}

impl DomainDataset {
    /// Build a domain from `inputs [N, D]` and `labels [N]`.
    ///
    /// # Errors
    ///
    /// [`DatasetError::EmptyDomain`] for `N == 0`, and
    /// [`DatasetError::ShapeMismatch`] when ranks or lengths disagree.
    pub fn new(name: impl Into<String>, inputs: Tensor, labels: Tensor) -> Result<Self, DatasetError> {
        let name = name.into();
        let in_shape = inputs.size();
        let lbl_shape = labels.size();
        if in_shape.len() != 2 {
            return Err(DatasetError::shape_mismatch(name, format!("inputs must be [N, D], got {in_shape:?}")));
        }
        if lbl_shape.len() != 1 || lbl_shape[0] != in_shape[0] {
            return Err(DatasetError::shape_mismatch(
                name,
                format!("labels {lbl_shape:?} do not match inputs {in_shape:?}"),
            ));
        }
        if in_shape[0] == 0 {
            return Err(DatasetError::EmptyDomain { name });
        }
        Ok(DomainDataset {
            name,
            inputs: inputs.to_kind(Kind::Float),
            labels: labels.to_kind(Kind::Int64),
        })
    }

    /// Pool several domains into one named dataset.
    ///
    /// # Errors
    ///
    /// [`DatasetError::EmptyDomain`] if `parts` is empty, and
    /// [`DatasetError::ShapeMismatch`] if feature widths differ.
    pub fn combine(name: impl Into<String>, parts: &[&DomainDataset]) -> Result<Self, DatasetError> {
        let name = name.into();
        let Some(first) = parts.first() else {
            return Err(DatasetError::EmptyDomain { name });
        };
        let width = first.feature_dim();
        if let Some(odd) = parts.iter().find(|p| p.feature_dim() != width) {
            return Err(DatasetError::shape_mismatch(
                name,
                format!("`{}` has {} features, expected {width}", odd.name, odd.feature_dim()),
            ));
        }
        let inputs: Vec<&Tensor> = parts.iter().map(|p| &p.inputs).collect();
        let labels: Vec<&Tensor> = parts.iter().map(|p| &p.labels).collect();
        Self::new(name, Tensor::cat(&inputs, 0), Tensor::cat(&labels, 0))
    }

    /// Domain name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of samples.
    pub fn len(&self) -> usize {
        self.inputs.size()[0] as usize
    }

    /// Always `false`: empty domains are rejected at construction.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Feature width `D`.
    pub fn feature_dim(&self) -> i64 {
        self.inputs.size()[1]
    }

    /// Gather the rows at `indices` into a batch.
    fn gather(&self, indices: &[usize]) -> Batch {
        let idx: Vec<i64> = indices.iter().map(|&i| i as i64).collect();
        let idx = Tensor::from_slice(&idx).to_device(self.inputs.device());
        Batch::new(self.inputs.index_select(0, &idx), self.labels.index_select(0, &idx))
    }
}

// ---------------------------------------------------------------------------
// CyclingLoader
// ---------------------------------------------------------------------------

/// Batching options for a [`CyclingLoader`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoaderOptions {
    /// Samples per batch.
    pub batch_size: usize,
    /// Reshuffle at the start of every cycle.
    pub shuffle: bool,
    /// Skip the trailing partial batch of a cycle.
    pub drop_last: bool,
    /// Shuffle seed; cycle `k` uses a seed derived from `seed` and `k`.
    pub seed: u64,
}

impl Default for LoaderOptions {
    fn default() -> Self {
        LoaderOptions { batch_size: 32, shuffle: true, drop_last: false, seed: 42 }
    }
}

/// Endless batched iterator over one [`DomainDataset`].
///
/// One *cycle* is one pass over the dataset. When a cycle is exhausted the
/// next call to [`CyclingLoader::next_batch`] starts a new one, with a fresh
/// permutation when shuffling is enabled.
#[derive(Debug)]
pub struct CyclingLoader {
    dataset: DomainDataset,
    options: LoaderOptions,
    order: Vec<usize>,
    cursor: usize,
    cycle: u64,
}

impl CyclingLoader {
    /// Create a loader positioned at the start of its first cycle.
    ///
    /// # Errors
    ///
    /// [`DatasetError::ShapeMismatch`] if `batch_size` is zero, or if
    /// `drop_last` is set and the dataset cannot fill a single batch.
    pub fn new(dataset: DomainDataset, options: LoaderOptions) -> Result<Self, DatasetError> {
        if options.batch_size == 0 {
            return Err(DatasetError::shape_mismatch(dataset.name.clone(), "batch_size must be > 0"));
        }
        if options.drop_last && dataset.len() < options.batch_size {
            return Err(DatasetError::shape_mismatch(
                dataset.name.clone(),
                format!("{} samples cannot fill one batch of {} with drop_last", dataset.len(), options.batch_size),
            ));
        }
        let mut loader = CyclingLoader { dataset, options, order: Vec::new(), cursor: 0, cycle: 0 };
        loader.start_cycle();
        Ok(loader)
    }

    /// The underlying dataset.
    pub fn dataset(&self) -> &DomainDataset {
        &self.dataset
    }

    /// Batches in one cycle.
    pub fn num_batches(&self) -> usize {
        let n = self.dataset.len();
        let bs = self.options.batch_size;
        if self.options.drop_last {
            n / bs
        } else {
            (n + bs - 1) / bs
        }
    }

    /// Next batch, starting a new cycle if the current one is exhausted.
    pub fn next_batch(&mut self) -> Batch {
        let n = self.order.len();
        let bs = self.options.batch_size;
        let remaining = n - self.cursor;
        if remaining == 0 || (self.options.drop_last && remaining < bs) {
            self.cycle += 1;
            self.start_cycle();
            debug!("loader `{}` starts cycle {}", self.dataset.name, self.cycle);
        }
        let end = (self.cursor + bs).min(n);
        let batch = self.dataset.gather(&self.order[self.cursor..end]);
        self.cursor = end;
        batch
    }

    fn start_cycle(&mut self) {
        self.order = (0..self.dataset.len()).collect();
        if self.options.shuffle {
            let seed = self.options.seed ^ self.cycle.wrapping_mul(0x9E37_79B9_7F4A_7C15);
            xorshift_shuffle(&mut self.order, seed);
        }
        self.cursor = 0;
    }
}

/// In-place Fisher-Yates shuffle driven by a 64-bit xorshift generator.
fn xorshift_shuffle(indices: &mut [usize], seed: u64) {
    let n = indices.len();
    if n <= 1 {
        return;
    }
    let mut state = XorShift64::new(seed);
    for i in (1..n).rev() {
        let j = (state.next_u64() as usize) % (i + 1);
        indices.swap(i, j);
    }
}

struct XorShift64(u64);

impl XorShift64 {
    fn new(seed: u64) -> Self {
        XorShift64(if seed == 0 { 0x853c_49e6_748f_ea9b } else { seed })
    }

    fn next_u64(&mut self) -> u64 {
        self.0 ^= self.0 << 13;
        self.0 ^= self.0 >> 7;
        self.0 ^= self.0 << 17;
        self.0
    }

    /// Uniform sample in `[-1, 1)`.
    fn next_symmetric(&mut self) -> f32 {
        let unit = (self.next_u64() >> 40) as f32 / (1u64 << 24) as f32;
        2.0 * unit - 1.0
    }
}

// ---------------------------------------------------------------------------
// DomainBatchSource
// ---------------------------------------------------------------------------

/// Keyed, endless supply of batches.
///
/// The phase keys `"train"` and `"val"` address the target stream; any other
/// key names a source domain.
pub trait DomainBatchSource {
    /// Batches in one cycle of the stream under `key`.
    fn num_batches(&self, key: &str) -> TrainResult<usize>;

    /// Next batch of the stream under `key`, re-cycling on exhaustion.
    fn next_batch(&mut self, key: &str) -> TrainResult<Batch>;
}

/// [`DomainBatchSource`] backed by one [`CyclingLoader`] per key. Every
/// batch is delivered on a single fixed device.
#[derive(Debug)]
pub struct DomainLoaders {
    device: Device,
    loaders: HashMap<String, CyclingLoader>,
}

impl DomainLoaders {
    /// Empty registry delivering batches on `device`.
    pub fn new(device: Device) -> Self {
        DomainLoaders { device, loaders: HashMap::new() }
    }

    /// Register `loader` under `key`, replacing any previous entry.
    pub fn insert(&mut self, key: impl Into<String>, loader: CyclingLoader) {
        self.loaders.insert(key.into(), loader);
    }

    /// Standard registry for one run: the target `train` and `val` streams,
    /// each source domain under its own name, and the pooled sources under
    /// their combined key when there is more than one.
    ///
    /// The target `train` stream and every source stream always drop the
    /// trailing partial batch, whatever `options.drop_last` says, so that
    /// paired source and target batches have equal sizes on every
    /// iteration. The validation stream is never shuffled and never drops
    /// samples.
    ///
    /// # Errors
    ///
    /// Propagates [`CyclingLoader::new`] and [`DomainDataset::combine`]
    /// failures.
    pub fn for_run(
        target_train: DomainDataset,
        target_val: DomainDataset,
        sources: Vec<DomainDataset>,
        options: LoaderOptions,
        device: Device,
    ) -> Result<Self, DatasetError> {
        let options = LoaderOptions { drop_last: true, ..options };
        let mut loaders = DomainLoaders::new(device);
        loaders.insert("train", CyclingLoader::new(target_train, options)?);
        let val_options = LoaderOptions { shuffle: false, drop_last: false, ..options };
        loaders.insert("val", CyclingLoader::new(target_val, val_options)?);

        if sources.len() > 1 {
            let names: Vec<String> = sources.iter().map(|s| s.name().to_string()).collect();
            let key = combined_key(&names);
            let refs: Vec<&DomainDataset> = sources.iter().collect();
            let pooled = DomainDataset::combine(key.clone(), &refs)?;
            loaders.insert(key, CyclingLoader::new(pooled, options)?);
        }
        for (i, source) in sources.into_iter().enumerate() {
            let name = source.name().to_string();
            let opts = LoaderOptions { seed: options.seed.wrapping_add(i as u64 + 1), ..options };
            loaders.insert(name, CyclingLoader::new(source, opts)?);
        }
        Ok(loaders)
    }

    /// Registered keys, sorted.
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.loaders.keys().cloned().collect();
        keys.sort();
        keys
    }

    fn unknown(&self, key: &str) -> DatasetError {
        DatasetError::UnknownDomain { key: key.to_string(), registered: self.keys() }
    }
}

impl DomainBatchSource for DomainLoaders {
    fn num_batches(&self, key: &str) -> TrainResult<usize> {
        self.loaders.get(key).map(CyclingLoader::num_batches).ok_or_else(|| self.unknown(key).into())
    }

    fn next_batch(&mut self, key: &str) -> TrainResult<Batch> {
        let device = self.device;
        match self.loaders.get_mut(key) {
            Some(loader) => Ok(loader.next_batch().to_device(device)),
            None => Err(self.unknown(key).into()),
        }
    }
}

// ---------------------------------------------------------------------------
// Synthetic domains
// ---------------------------------------------------------------------------

/// Parameters of a synthetic domain.
///
/// Class `c` is centred on `separation · (c − (C − 1) / 2)` along axis
/// `c mod D`; every sample is then offset by `shift` on all axes and
/// perturbed by uniform noise in `[-spread, spread]`. Classes stay linearly
/// separable while `spread < separation / 2`.
#[derive(Debug, Clone, PartialEq)]
pub struct SyntheticDomainConfig {
    /// Number of samples; labels cycle `0, 1, …, C−1, 0, …`.
    pub num_samples: usize,
    /// Feature width `D`.
    pub input_dim: usize,
    /// Number of classes `C`.
    pub num_classes: usize,
    /// Distance between neighbouring class centres.
    pub separation: f32,
    /// Half-width of the uniform noise.
    pub spread: f32,
    /// Domain shift added to every feature.
    pub shift: f32,
    /// Noise seed.
    pub seed: u64,
}

impl Default for SyntheticDomainConfig {
    fn default() -> Self {
        SyntheticDomainConfig {
            num_samples: 64,
            input_dim: 16,
            num_classes: 2,
            separation: 2.0,
            spread: 0.25,
            shift: 0.0,
            seed: 7,
        }
    }
}

/// Generate a deterministic synthetic domain.
///
/// # Errors
///
/// [`DatasetError::EmptyDomain`] for zero samples and
/// [`DatasetError::ShapeMismatch`] for zero features or classes.
pub fn synthetic_domain(name: &str, cfg: &SyntheticDomainConfig) -> Result<DomainDataset, DatasetError> {
    if cfg.input_dim == 0 || cfg.num_classes == 0 {
        return Err(DatasetError::shape_mismatch(name, "input_dim and num_classes must be > 0"));
    }
    let (n, d, c) = (cfg.num_samples, cfg.input_dim, cfg.num_classes);
    let mut rng = XorShift64::new(cfg.seed);
    let mut inputs = Vec::with_capacity(n * d);
    let mut labels = Vec::with_capacity(n);
    let centre_offset = (c as f32 - 1.0) / 2.0;

    for i in 0..n {
        let class = i % c;
        let axis = class % d;
        for j in 0..d {
            let centre = if j == axis { cfg.separation * (class as f32 - centre_offset) } else { 0.0 };
            inputs.push(centre + cfg.shift + cfg.spread * rng.next_symmetric());
        }
        labels.push(class as i64);
    }

    let inputs = Tensor::from_slice(&inputs).view([n as i64, d as i64]);
    DomainDataset::new(name, inputs, Tensor::from_slice(&labels))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
