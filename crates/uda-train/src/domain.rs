//! Gradient reversal for adversarial domain adaptation.
//!
//! Components: [`GradientReversalLayer`] and its coefficient schedule
//! [`WarmStartSchedule`].
//!
//! The layer is the identity in the forward pass. In the backward pass the
//! incoming gradient is multiplied by `-coeff`, so a head placed behind the
//! layer is trained to *maximise* whatever the encoder in front of it is
//! trained to minimise.

use serde::{Deserialize, Serialize};
use tch::Tensor;

// ---------------------------------------------------------------------------
// WarmStartSchedule
// ---------------------------------------------------------------------------

/// Coefficient annealing for the reversal layer:
///
/// ```text
/// coeff(i) = 2 (hi - lo) / (1 + exp(-alpha · i / max_iters)) - (hi - lo) + lo
/// ```
///
/// `coeff(0) = lo`, the curve is monotone non-decreasing in `i` and bounded
/// above by `hi`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WarmStartSchedule {
    /// Steepness of the sigmoid.
    pub alpha: f64,
    /// Initial coefficient.
    pub lo: f64,
    /// Asymptotic coefficient.
    pub hi: f64,
    /// Iteration scale of the warm-up.
    pub max_iters: u64,
}

impl Default for WarmStartSchedule {
    fn default() -> Self {
        WarmStartSchedule { alpha: 1.0, lo: 0.0, hi: 0.1, max_iters: 1000 }
    }
}

impl WarmStartSchedule {
    /// Coefficient after `iter` schedule steps.
    pub fn coeff(&self, iter: u64) -> f64 {
        let span = self.hi - self.lo;
        let p = iter as f64 / self.max_iters.max(1) as f64;
        2.0 * span / (1.0 + (-self.alpha * p).exp()) - span + self.lo
    }
}

// ---------------------------------------------------------------------------
// GradientReversalLayer
// ---------------------------------------------------------------------------

/// Gradient Reversal Layer (Ganin & Lempitsky, ICML 2015) with a warm-start
/// coefficient.
///
/// The coefficient is owned by the layer and only changes through
/// [`GradientReversalLayer::step`]; the value used for a batch is captured
/// when [`GradientReversalLayer::forward`] builds the graph.
#[derive(Debug, Clone)]
pub struct GradientReversalLayer {
    schedule: WarmStartSchedule,
    iter_num: u64,
}

impl GradientReversalLayer {
    /// Create a layer at iteration 0.
    pub fn new(schedule: WarmStartSchedule) -> Self {
        Self { schedule, iter_num: 0 }
    }

    /// Current reversal coefficient.
    pub fn coeff(&self) -> f64 {
        self.schedule.coeff(self.iter_num)
    }

    /// Number of schedule steps taken so far.
    pub fn iterations(&self) -> u64 {
        self.iter_num
    }

    /// Advance the schedule by one iteration.
    pub fn step(&mut self) {
        self.iter_num += 1;
    }

    /// Forward pass: value-identical to `x`, gradient `-coeff · grad`.
    ///
    /// `x - x.detach()` is exactly zero, so the output equals `x` bit for bit.
    pub fn forward(&self, x: &Tensor) -> Tensor {
        let frozen = x.detach();
        (x - &frozen) * (-self.coeff()) + frozen
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use tch::{Device, Kind};

    #[test]
    fn schedule_starts_at_lo() {
        let s = WarmStartSchedule::default();
        assert!(s.coeff(0).abs() < 1e-12);
    }

    #[test]
    fn schedule_monotone_and_bounded_by_hi() {
        let s = WarmStartSchedule::default();
        let mut prev = s.coeff(0);
        for i in (1..20_000).step_by(97) {
            let c = s.coeff(i);
            assert!(c >= prev - 1e-12, "not monotone at iter {i}");
            assert!(c <= s.hi + 1e-12);
            prev = c;
        }
    }

    #[test]
    fn schedule_reference_value() {
        // alpha=1, i=max_iters => 2*0.1/(1+e^-1) - 0.1 ≈ 0.04621
        let s = WarmStartSchedule::default();
        assert_abs_diff_eq!(s.coeff(1000), 0.046_211_7, epsilon = 1e-6);
    }

    #[test]
    fn grl_forward_is_identity() {
        let grl = GradientReversalLayer::new(WarmStartSchedule { lo: 0.5, hi: 0.5, ..Default::default() });
        let x = Tensor::from_slice(&[1.0f32, -2.0, 3.0, 0.0, -0.5]);
        let y = grl.forward(&x);
        let diff = (&y - &x).abs().max().double_value(&[]);
        assert_eq!(diff, 0.0);
    }

    #[test]
    fn grl_backward_negates_with_coeff() {
        let grl = GradientReversalLayer::new(WarmStartSchedule { lo: 0.7, hi: 0.7, ..Default::default() });
        let x = Tensor::from_slice(&[1.0f32, -2.0, 3.0]).set_requires_grad(true);
        let y = grl.forward(&x);
        (y * Tensor::from_slice(&[1.0f32, 2.0, -4.0])).sum(Kind::Float).backward();
        let g = x.grad();
        let expected = [-0.7, -1.4, 2.8];
        for (i, e) in expected.iter().enumerate() {
            assert_abs_diff_eq!(g.double_value(&[i as i64]), *e, epsilon = 1e-6);
        }
    }

    #[test]
    fn grl_step_advances_coeff() {
        let mut grl = GradientReversalLayer::new(WarmStartSchedule { max_iters: 10, ..Default::default() });
        let c0 = grl.coeff();
        grl.step();
        grl.step();
        assert_eq!(grl.iterations(), 2);
        assert!(grl.coeff() > c0);
        let x = Tensor::zeros([2, 3], (Kind::Float, Device::Cpu));
        assert_eq!(grl.forward(&x).size(), vec![2, 3]);
    }
}
