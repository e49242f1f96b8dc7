//! Networks trained by the domain-adaptation strategies.
//!
//! # Building blocks
//!
//! ```text
//! x [B, D] ──► FeatureExtractor (G) ──► f [B, F] ──► ClassifierHead ──► y [B, C]
//!              linear · relu · dropout              linear · relu · dropout
//!              linear · relu                        linear
//! ```
//!
//! # Composites
//!
//! | Strategy | Composite       | Parameter stores                |
//! |----------|-----------------|---------------------------------|
//! | IRM      | [`IrmNetwork`]  | one: `g`, `head`                |
//! | MCD      | [`McdNetworks`] | two: `g` / `c1`, `c2`           |
//! | MDD      | [`MddNetwork`]  | one: `g`, `c1`, `c2` (+ GRL)    |
//!
//! Each composite holds a single [`Mode`] and hands it to every sub-network
//! on every forward call, so its parts can never disagree about dropout.

use tch::{nn, nn::ModuleT, Device, Tensor};

use crate::config::TrainingConfig;
use crate::domain::GradientReversalLayer;
use crate::error::{TrainError, TrainResult};

// ---------------------------------------------------------------------------
// Mode
// ---------------------------------------------------------------------------

/// Train/eval switch shared by all sub-networks of a composite.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Mode {
    /// Dropout active; MDD produces the adversarial output.
    #[default]
    Train,
    /// Deterministic inference.
    Eval,
}

impl Mode {
    /// `true` in [`Mode::Train`].
    pub fn is_train(self) -> bool {
        self == Mode::Train
    }
}

// ---------------------------------------------------------------------------
// Sub-networks
// ---------------------------------------------------------------------------

/// Feature extractor `G`: two fully connected layers with ReLU.
#[derive(Debug)]
pub struct FeatureExtractor {
    net: nn::SequentialT,
}

impl FeatureExtractor {
    /// Register the layers under `p`.
    pub fn new(p: &nn::Path, input_dim: i64, hidden_dim: i64, feature_dim: i64, dropout: f64) -> Self {
        let net = nn::seq_t()
            .add(nn::linear(p / "fc1", input_dim, hidden_dim, Default::default()))
            .add_fn(|x| x.relu())
            .add_fn_t(move |x, train| x.dropout(dropout, train))
            .add(nn::linear(p / "fc2", hidden_dim, feature_dim, Default::default()))
            .add_fn(|x| x.relu());
        FeatureExtractor { net }
    }

    /// `[B, D] → [B, F]`.
    pub fn forward(&self, x: &Tensor, mode: Mode) -> Tensor {
        self.net.forward_t(x, mode.is_train())
    }
}

/// Classifier head: bottleneck layer followed by a linear classifier.
#[derive(Debug)]
pub struct ClassifierHead {
    net: nn::SequentialT,
}

impl ClassifierHead {
    /// Register the layers under `p`.
    pub fn new(p: &nn::Path, feature_dim: i64, num_classes: i64, dropout: f64) -> Self {
        let net = nn::seq_t()
            .add(nn::linear(p / "bottleneck", feature_dim, feature_dim, Default::default()))
            .add_fn(|x| x.relu())
            .add_fn_t(move |x, train| x.dropout(dropout, train))
            .add(nn::linear(p / "fc", feature_dim, num_classes, Default::default()));
        ClassifierHead { net }
    }

    /// `[B, F] → [B, C]` logits.
    pub fn forward(&self, features: &Tensor, mode: Mode) -> Tensor {
        self.net.forward_t(features, mode.is_train())
    }
}

fn extractor(p: &nn::Path, cfg: &TrainingConfig) -> FeatureExtractor {
    FeatureExtractor::new(p, cfg.input_dim as i64, cfg.hidden_dim as i64, cfg.feature_dim as i64, cfg.dropout)
}

fn classifier_head(p: &nn::Path, cfg: &TrainingConfig) -> ClassifierHead {
    ClassifierHead::new(p, cfg.feature_dim as i64, cfg.num_classes as i64, cfg.dropout)
}

fn num_parameters(vs: &nn::VarStore) -> usize {
    vs.trainable_variables().iter().map(|t| t.numel() as usize).sum()
}

// ---------------------------------------------------------------------------
// IRM
// ---------------------------------------------------------------------------

/// Base model of the IRM strategy: `x → (prediction, feature)`.
#[derive(Debug)]
pub struct IrmNetwork {
    vs: nn::VarStore,
    g: FeatureExtractor,
    head: ClassifierHead,
    mode: Mode,
}

impl IrmNetwork {
    /// Build all layers on `device`.
    pub fn new(cfg: &TrainingConfig, device: Device) -> Self {
        let vs = nn::VarStore::new(device);
        let root = vs.root();
        let g = extractor(&(&root / "g"), cfg);
        let head = classifier_head(&(&root / "head"), cfg);
        IrmNetwork { vs, g, head, mode: Mode::Train }
    }

    /// Set the mode of every sub-network.
    pub fn set_mode(&mut self, mode: Mode) {
        self.mode = mode;
    }

    /// Current mode.
    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// `(prediction [B, C], feature [B, F])`.
    pub fn forward(&self, x: &Tensor) -> (Tensor, Tensor) {
        let features = self.g.forward(x, self.mode);
        let prediction = self.head.forward(&features, self.mode);
        (prediction, features)
    }

    /// Parameter store, for building the optimizer.
    pub fn var_store(&self) -> &nn::VarStore {
        &self.vs
    }

    /// Count trainable parameters.
    pub fn num_parameters(&self) -> usize {
        num_parameters(&self.vs)
    }
}

// ---------------------------------------------------------------------------
// MCD
// ---------------------------------------------------------------------------

/// Generator `G` and two independently initialised heads `C1`, `C2`.
///
/// `G` and the heads live in separate stores so each group gets its own
/// optimizer.
#[derive(Debug)]
pub struct McdNetworks {
    g_vs: nn::VarStore,
    c_vs: nn::VarStore,
    g: FeatureExtractor,
    c1: ClassifierHead,
    c2: ClassifierHead,
    mode: Mode,
}

impl McdNetworks {
    /// Build all layers on `device`.
    pub fn new(cfg: &TrainingConfig, device: Device) -> Self {
        let g_vs = nn::VarStore::new(device);
        let c_vs = nn::VarStore::new(device);
        let g = extractor(&(&g_vs.root() / "g"), cfg);
        let c1 = classifier_head(&(&c_vs.root() / "c1"), cfg);
        let c2 = classifier_head(&(&c_vs.root() / "c2"), cfg);
        McdNetworks { g_vs, c_vs, g, c1, c2, mode: Mode::Train }
    }

    /// Set the mode of `G`, `C1` and `C2`.
    pub fn set_mode(&mut self, mode: Mode) {
        self.mode = mode;
    }

    /// Current mode.
    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// `G(x)`.
    pub fn features(&self, x: &Tensor) -> Tensor {
        self.g.forward(x, self.mode)
    }

    /// `(C1(f), C2(f))`.
    pub fn classify(&self, features: &Tensor) -> (Tensor, Tensor) {
        (self.c1.forward(features, self.mode), self.c2.forward(features, self.mode))
    }

    /// Parameters of `G`.
    pub fn generator_store(&self) -> &nn::VarStore {
        &self.g_vs
    }

    /// Parameters of `C1` and `C2`.
    pub fn classifier_store(&self) -> &nn::VarStore {
        &self.c_vs
    }

    /// Count trainable parameters across both stores.
    pub fn num_parameters(&self) -> usize {
        num_parameters(&self.g_vs) + num_parameters(&self.c_vs)
    }
}

// ---------------------------------------------------------------------------
// MDD
// ---------------------------------------------------------------------------

/// Output of [`MddNetwork::forward`].
#[derive(Debug)]
pub struct MddOutput {
    /// Main classifier logits.
    pub main: Tensor,
    /// Adversarial classifier logits; only produced in [`Mode::Train`].
    pub adversarial: Option<Tensor>,
}

impl MddOutput {
    /// Both outputs, failing if the adversarial head was skipped.
    ///
    /// # Errors
    ///
    /// [`TrainError::TrainingStep`] for outputs produced in eval mode.
    pub fn into_pair(self) -> TrainResult<(Tensor, Tensor)> {
        match self.adversarial {
            Some(adv) => Ok((self.main, adv)),
            None => Err(TrainError::training_step("adversarial output is only produced in train mode")),
        }
    }
}

/// Composite MDD module:
///
/// ```text
/// x ─► G ─► f ─┬────────► C1 ─► main
///              └─► GRL ─► C2 ─► adversarial   (train mode only)
/// ```
#[derive(Debug)]
pub struct MddNetwork {
    vs: nn::VarStore,
    g: FeatureExtractor,
    c1: ClassifierHead,
    c2: ClassifierHead,
    grl: GradientReversalLayer,
    mode: Mode,
}

impl MddNetwork {
    /// Build all layers on `device`, with the reversal layer at iteration 0.
    pub fn new(cfg: &TrainingConfig, device: Device) -> Self {
        let vs = nn::VarStore::new(device);
        let root = vs.root();
        let g = extractor(&(&root / "g"), cfg);
        let c1 = classifier_head(&(&root / "c1"), cfg);
        let c2 = classifier_head(&(&root / "c2"), cfg);
        let grl = GradientReversalLayer::new(cfg.grl);
        MddNetwork { vs, g, c1, c2, grl, mode: Mode::Train }
    }

    /// Set the mode of `G`, `C1` and `C2`.
    pub fn set_mode(&mut self, mode: Mode) {
        self.mode = mode;
    }

    /// Current mode.
    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// Forward pass; the adversarial branch only runs in train mode.
    pub fn forward(&self, x: &Tensor) -> MddOutput {
        let features = self.g.forward(x, self.mode);
        let main = self.c1.forward(&features, self.mode);
        let adversarial = match self.mode {
            Mode::Train => Some(self.c2.forward(&self.grl.forward(&features), self.mode)),
            Mode::Eval => None,
        };
        MddOutput { main, adversarial }
    }

    /// Advance the reversal coefficient by one iteration.
    pub fn step(&mut self) {
        self.grl.step();
    }

    /// The reversal layer.
    pub fn grl(&self) -> &GradientReversalLayer {
        &self.grl
    }

    /// Parameter store, for building the optimizer.
    pub fn var_store(&self) -> &nn::VarStore {
        &self.vs
    }

    /// Count trainable parameters.
    pub fn num_parameters(&self) -> usize {
        num_parameters(&self.vs)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use tch::Kind;

    fn tiny_config() -> TrainingConfig {
        TrainingConfig { input_dim: 3, hidden_dim: 8, feature_dim: 4, num_classes: 2, ..TrainingConfig::default() }
    }

    fn batch(n: i64) -> Tensor {
        Tensor::ones([n, 3], (Kind::Float, Device::Cpu))
    }

    #[test]
    fn irm_network_returns_prediction_and_feature() {
        tch::manual_seed(0);
        let net = IrmNetwork::new(&tiny_config(), Device::Cpu);
        let (y, f) = net.forward(&batch(5));
        assert_eq!(y.size(), vec![5, 2]);
        assert_eq!(f.size(), vec![5, 4]);
        assert!(net.num_parameters() > 0);
    }

    #[test]
    fn mcd_heads_are_independent() {
        tch::manual_seed(0);
        let mut nets = McdNetworks::new(&tiny_config(), Device::Cpu);
        nets.set_mode(Mode::Eval);
        let (y1, y2) = nets.classify(&nets.features(&batch(2)));
        let diff = (y1 - y2).abs().sum(Kind::Float).double_value(&[]);
        assert!(diff > 0.0);
        assert_eq!(nets.classifier_store().trainable_variables().len(), 8);
        assert_eq!(nets.generator_store().trainable_variables().len(), 4);
    }

    #[test]
    fn mdd_eval_mode_skips_adversarial_head() {
        tch::manual_seed(0);
        let mut net = MddNetwork::new(&tiny_config(), Device::Cpu);
        assert!(net.forward(&batch(2)).adversarial.is_some());
        net.set_mode(Mode::Eval);
        let out = net.forward(&batch(2));
        assert!(out.adversarial.is_none());
        assert!(out.into_pair().is_err());
    }

    #[test]
    fn eval_mode_is_deterministic_with_dropout() {
        tch::manual_seed(0);
        let cfg = TrainingConfig { dropout: 0.9, ..tiny_config() };
        let mut net = IrmNetwork::new(&cfg, Device::Cpu);
        net.set_mode(Mode::Eval);
        let a = net.forward(&batch(4)).0;
        let b = net.forward(&batch(4)).0;
        assert_eq!((a - b).abs().max().double_value(&[]), 0.0);
    }

    #[test]
    fn mdd_step_advances_grl() {
        let mut net = MddNetwork::new(&tiny_config(), Device::Cpu);
        net.step();
        assert_eq!(net.grl().iterations(), 1);
    }
}
