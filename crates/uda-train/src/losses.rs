//! Domain-alignment losses.
//!
//! Each strategy combines a supervised cross-entropy on the source half of a
//! batch with one of the alignment penalties below:
//!
//! - **MK-MMD** ([`MultipleKernelMmd`]): kernel two-sample statistic between
//!   source and target features (IRM strategy).
//! - **Invariance penalty** ([`InvariancePenalty`]): product of the risk
//!   gradients of two interleaved sub-batches with respect to a shared scale
//!   (IRM strategy).
//! - **Classifier discrepancy** ([`classifier_discrepancy`]): mean absolute
//!   difference of two probability tensors (MCD strategy).
//! - **Margin disparity discrepancy** ([`ClassificationMdd`]): margin-weighted
//!   disagreement between a main and an adversarial head (MDD strategy).
//!
//! ```text
//! IRM:  L = CE + t0 · MMD + t1 · penalty
//! MCD:  L = CE ± t0 · discrepancy
//! MDD:  L = CE + t0 · (−MDD)
//! ```

use tch::{Device, Kind, Reduction, Tensor};

use crate::error::{TrainError, TrainResult};

// ─────────────────────────────────────────────────────────────────────────────
// Supervised objective
// ─────────────────────────────────────────────────────────────────────────────

/// Mean softmax cross-entropy between `logits [B, C]` and integer `labels [B]`.
pub fn cross_entropy(logits: &Tensor, labels: &Tensor) -> Tensor {
    logits.cross_entropy_for_logits(labels)
}

// ─────────────────────────────────────────────────────────────────────────────
// MK-MMD
// ─────────────────────────────────────────────────────────────────────────────

/// Gaussian kernel whose bandwidth tracks the batch:
/// `k(x, y) = exp(-‖x − y‖² / (2σ²))` with `σ² = alpha · mean(‖x − y‖²)`.
#[derive(Debug, Clone, Copy)]
pub struct GaussianKernel {
    alpha: f64,
}

impl GaussianKernel {
    /// Kernel with bandwidth multiplier `alpha`.
    pub fn new(alpha: f64) -> Self {
        Self { alpha }
    }

    /// Apply the kernel to a matrix of squared pairwise distances.
    ///
    /// The bandwidth is computed from detached distances, so no gradient
    /// flows through `σ²`.
    pub fn forward(&self, sq_dist: &Tensor) -> Tensor {
        let sigma_sq = sq_dist.detach().mean(Kind::Float) * self.alpha;
        (sq_dist.neg() / (sigma_sq * 2.0)).exp()
    }
}

/// Multiple-kernel maximum mean discrepancy (Long et al., ICML 2015).
///
/// Uses the quadratic (unbiased) estimator over the joint
/// `[source; target]` kernel matrix, plus the `2 / (B − 1)` correction for
/// the excluded diagonal.
#[derive(Debug, Clone)]
pub struct MultipleKernelMmd {
    kernels: Vec<GaussianKernel>,
}

impl Default for MultipleKernelMmd {
    /// Kernels with `alpha = 2^k` for `k ∈ {-3, …, 1}`.
    fn default() -> Self {
        Self::new((-3..2).map(|k| GaussianKernel::new(2f64.powi(k))).collect())
    }
}

impl MultipleKernelMmd {
    /// MMD over the sum of `kernels`.
    pub fn new(kernels: Vec<GaussianKernel>) -> Self {
        Self { kernels }
    }

    /// Discrepancy between `z_s [B, F]` and `z_t [B, F]`.
    ///
    /// # Errors
    ///
    /// Returns [`TrainError::BatchMismatch`] when the halves differ in size
    /// and [`TrainError::TrainingStep`] for batches smaller than two.
    pub fn forward(&self, z_s: &Tensor, z_t: &Tensor) -> TrainResult<Tensor> {
        let b = z_s.size()[0];
        let bt = z_t.size()[0];
        if b != bt {
            return Err(TrainError::BatchMismatch { source_len: b, target_len: bt });
        }
        if b < 2 {
            return Err(TrainError::training_step("MK-MMD needs at least two samples per domain"));
        }

        let features = Tensor::cat(&[z_s, z_t], 0);
        let sq_dist = (features.unsqueeze(0) - features.unsqueeze(1))
            .pow_tensor_scalar(2)
            .sum_dim_intlist(&[-1_i64][..], false, Kind::Float);

        let kernel_matrix = self
            .kernels
            .iter()
            .fold(sq_dist.zeros_like(), |acc, k| acc + k.forward(&sq_dist));

        let index = mmd_index_matrix(b, z_s.device());
        let loss = (kernel_matrix * index).sum(Kind::Float) + 2.0 / (b - 1) as f64;
        Ok(loss)
    }
}

/// Weights of the quadratic MMD estimator over a `[2B, 2B]` kernel matrix:
/// `1 / (B(B−1))` off-diagonal within a domain, `−1 / B²` across domains.
fn mmd_index_matrix(b: i64, device: Device) -> Tensor {
    let n = 2 * b;
    let same = 1.0 / (b * (b - 1)) as f32;
    let cross = -1.0 / (b * b) as f32;
    let at = |i: i64, j: i64| (i * n + j) as usize;

    let mut m = vec![0.0_f32; (n * n) as usize];
    for i in 0..b {
        for j in 0..b {
            if i != j {
                m[at(i, j)] = same;
                m[at(i + b, j + b)] = same;
            }
            m[at(i, j + b)] = cross;
            m[at(i + b, j)] = cross;
        }
    }
    Tensor::from_slice(&m).view([n, n]).to_device(device)
}

// ─────────────────────────────────────────────────────────────────────────────
// Invariance penalty
// ─────────────────────────────────────────────────────────────────────────────

/// IRMv1 penalty (Arjovsky et al., 2019).
///
/// A scalar "dummy classifier" `w = 1.0` multiplies the logits of the
/// even- and odd-indexed halves of the batch. The penalty is
/// `Σ ∂L_even/∂w · ∂L_odd/∂w`. Both gradients stay in the graph so the
/// penalty can be back-propagated into the network.
///
/// `w` is a leaf that requires grad but belongs to no `VarStore`, so no
/// optimizer ever updates it.
pub struct InvariancePenalty {
    scale: Tensor,
}

impl InvariancePenalty {
    /// Create the penalty with its scale on `device`.
    pub fn new(device: Device) -> Self {
        let scale = Tensor::ones([1], (Kind::Float, device)).set_requires_grad(true);
        Self { scale }
    }

    /// The dummy scale `w`.
    pub fn scale(&self) -> &Tensor {
        &self.scale
    }

    /// Penalty for source `logits [B, C]` and `labels [B]`.
    ///
    /// # Errors
    ///
    /// Fails for batches with fewer than two samples (one half would be
    /// empty) and propagates libtorch autograd errors.
    pub fn forward(&self, logits: &Tensor, labels: &Tensor) -> TrainResult<Tensor> {
        let n = logits.size()[0];
        if n < 2 {
            return Err(TrainError::training_step("invariance penalty needs at least two samples"));
        }
        let grad_1 = self.scale_gradient(&logits.slice(0, 0, n, 2), &labels.slice(0, 0, n, 2))?;
        let grad_2 = self.scale_gradient(&logits.slice(0, 1, n, 2), &labels.slice(0, 1, n, 2))?;
        Ok((grad_1 * grad_2).sum(Kind::Float))
    }

    /// `∂ CE(logits · w, labels) / ∂w`, differentiable w.r.t. `logits`.
    fn scale_gradient(&self, logits: &Tensor, labels: &Tensor) -> TrainResult<Tensor> {
        let loss = cross_entropy(&(logits * &self.scale), labels);
        let mut grads = Tensor::f_run_backward(&[&loss], &[&self.scale], true, true)?;
        grads
            .pop()
            .ok_or_else(|| TrainError::training_step("autograd returned no gradient for the invariance scale"))
    }

    /// Drop the gradient accumulated on the scale by the main backward pass.
    pub fn zero_grad(&mut self) {
        self.scale.zero_grad();
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Classifier discrepancy (MCD)
// ─────────────────────────────────────────────────────────────────────────────

/// Mean absolute elementwise difference between two probability tensors.
pub fn classifier_discrepancy(p1: &Tensor, p2: &Tensor) -> Tensor {
    (p1 - p2).abs().mean(Kind::Float)
}

// ─────────────────────────────────────────────────────────────────────────────
// Margin disparity discrepancy (MDD)
// ─────────────────────────────────────────────────────────────────────────────

/// Offset used by [`shift_log`] in the MDD target term.
pub const SHIFT_LOG_OFFSET: f64 = 1e-6;

/// `log(clamp(x + offset, offset, 1))`.
///
/// The lower bound keeps the logarithm finite for `x ≤ 0`; the upper bound
/// caps the result at `log(1) = 0`.
pub fn shift_log(x: &Tensor, offset: f64) -> Tensor {
    (x + offset).clamp(offset, 1.0).log()
}

/// Batch reduction applied to the per-sample MDD.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MddReduction {
    /// Average over the batch.
    Mean,
    /// Sum over the batch.
    Sum,
}

/// Margin disparity discrepancy for classification (Zhang et al., ICML 2019).
///
/// ```text
/// source term = −margin · CE(y_s_adv, argmax y_s)
/// target term = log(1 − softmax(y_t_adv)[argmax y_t])      (via shift_log)
/// MDD         = reduce(source term + target term)
/// ```
///
/// The adversarial head maximises this value; callers minimise `−MDD` and
/// rely on a [`crate::domain::GradientReversalLayer`] to flip the sign again
/// for the feature extractor.
#[derive(Debug, Clone, Copy)]
pub struct ClassificationMdd {
    /// Margin γ weighting the source term.
    pub margin: f64,
    /// Batch reduction.
    pub reduction: MddReduction,
}

impl Default for ClassificationMdd {
    fn default() -> Self {
        Self { margin: 4.0, reduction: MddReduction::Mean }
    }
}

impl ClassificationMdd {
    /// MDD with margin `margin` and mean reduction.
    pub fn new(margin: f64) -> Self {
        Self { margin, ..Default::default() }
    }

    /// Raw (non-negated) discrepancy.
    pub fn forward(&self, y_s: &Tensor, y_s_adv: &Tensor, y_t: &Tensor, y_t_adv: &Tensor) -> Tensor {
        let source_loss = source_disparity(y_s, y_s_adv) * (-self.margin);
        let target_loss = target_disparity(y_t, y_t_adv);
        let loss = source_loss + target_loss;
        match self.reduction {
            MddReduction::Mean => loss.mean(Kind::Float),
            MddReduction::Sum => loss.sum(Kind::Float),
        }
    }
}

/// Per-sample CE of the adversarial head against the main head's argmax.
fn source_disparity(y: &Tensor, y_adv: &Tensor) -> Tensor {
    let prediction = y.detach().argmax(1, false);
    y_adv.cross_entropy_loss::<Tensor>(&prediction, None, Reduction::None, -100, 0.0)
}

/// Per-sample `−NLL(shift_log(1 − softmax(y_adv)), argmax y)`.
fn target_disparity(y: &Tensor, y_adv: &Tensor) -> Tensor {
    let prediction = y.detach().argmax(1, false);
    let complement = y_adv.softmax(1, Kind::Float).neg() + 1.0;
    -shift_log(&complement, SHIFT_LOG_OFFSET).nll_loss::<Tensor>(&prediction, None, Reduction::None, -100)
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
