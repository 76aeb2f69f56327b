//! Entropy coefficient: fixed scalar or learned Lagrange multiplier.
//!
//! The entropy term of the objective is either `-coef * entropy` with a
//! fixed coefficient, or a soft inequality constraint on the policy entropy
//! enforced by a trainable multiplier in a min-max framing: the policy is
//! pushed toward satisfying the constraint while the multiplier grows when
//! the constraint is violated and shrinks when it is slack.
//!
//! The multiplier is stored in log space so it stays positive, and is
//! projected back into its bounds after every optimizer step.

use burn::tensor::backend::AutodiffBackend;
use burn::tensor::Tensor;

// ============================================================================
// LagrangeCoefficient
// ============================================================================

/// Trainable Lagrange multiplier for an inequality constraint on a scalar
/// statistic (here: the policy entropy).
///
/// Invariant: after [`project_into_bounds`](Self::project_into_bounds) the
/// multiplier lies in `[alpha_min, alpha_max]`, regardless of where the
/// preceding gradient step moved it.
#[derive(Debug, Clone)]
pub struct LagrangeCoefficient<B: AutodiffBackend> {
    /// log(alpha), gradient-tracked. Log-space storage keeps alpha > 0.
    log_alpha: Tensor<B, 1>,
    threshold: f32,
    greater_than: bool,
    log_alpha_min: f32,
    log_alpha_max: f32,
}

impl<B: AutodiffBackend> LagrangeCoefficient<B> {
    /// Create a multiplier enforcing `statistic >= threshold` (or `<=` when
    /// `greater_than` is false).
    ///
    /// `init_alpha` and `alpha_min` must be positive; `alpha_max` must be at
    /// least `alpha_min`.
    pub fn new(
        threshold: f32,
        init_alpha: f32,
        alpha_min: f32,
        alpha_max: f32,
        greater_than: bool,
        device: &B::Device,
    ) -> Self {
        debug_assert!(init_alpha > 0.0, "init_alpha must be > 0");
        debug_assert!(alpha_min > 0.0, "alpha_min must be > 0");
        debug_assert!(alpha_max >= alpha_min, "alpha_max must be >= alpha_min");

        Self {
            log_alpha: Tensor::from_floats([init_alpha.ln()], device).require_grad(),
            threshold,
            greater_than,
            log_alpha_min: alpha_min.ln(),
            log_alpha_max: alpha_max.ln(),
        }
    }

    /// Constraint threshold.
    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    /// Current multiplier as a differentiable scalar tensor.
    pub fn current(&self) -> Tensor<B, 1> {
        self.log_alpha.clone().exp()
    }

    /// Current multiplier as a host scalar.
    pub fn value(&self) -> f32 {
        self.current().into_data().as_slice::<f32>().unwrap()[0]
    }

    /// Constraint loss for the given statistic (a scalar tensor).
    ///
    /// For a greater-than constraint this is
    /// `detach(alpha) * (T - x) + alpha * (detach(x) - T)` (sign-flipped
    /// otherwise): the first term drives the constrained statistic through
    /// its own gradient, the second drives the multiplier up while the
    /// constraint is violated and down while it is slack. The two terms
    /// cancel numerically, so the entry adds nothing to the reported loss
    /// value.
    pub fn lagrangian_loss(&self, statistic: Tensor<B, 1>) -> Tensor<B, 1> {
        let coeff = self.current();
        if self.greater_than {
            coeff.clone().detach() * (statistic.clone().neg().add_scalar(self.threshold))
                + coeff * (statistic.detach().sub_scalar(self.threshold))
        } else {
            coeff.clone().detach() * (statistic.clone().sub_scalar(self.threshold))
                + coeff * (statistic.detach().neg().add_scalar(self.threshold))
        }
    }

    /// Gradient of `log_alpha` from the last backward pass, if it
    /// participated in the graph.
    pub fn grad(&self, grads: &B::Gradients) -> Option<Tensor<B::InnerBackend, 1>> {
        self.log_alpha.grad(grads)
    }

    /// Gradient-descent step on `log_alpha`.
    ///
    /// Call [`project_into_bounds`](Self::project_into_bounds) afterwards;
    /// the step itself may leave the multiplier outside its bounds.
    pub fn apply_grad_step(&mut self, lr: f64, grad: f32) {
        let current = self.log_alpha.clone().into_data().as_slice::<f32>().unwrap()[0];
        let updated = current - lr as f32 * grad;
        let device = self.log_alpha.device();
        self.log_alpha = Tensor::from_floats([updated], &device).require_grad();
    }

    /// Clamp the multiplier back into `[alpha_min, alpha_max]`.
    ///
    /// Infallible and idempotent; runs after every optimizer step.
    pub fn project_into_bounds(&mut self) {
        let current = self.log_alpha.clone().into_data().as_slice::<f32>().unwrap()[0];
        let clamped = current.clamp(self.log_alpha_min, self.log_alpha_max);
        if clamped != current {
            let device = self.log_alpha.device();
            self.log_alpha = Tensor::from_floats([clamped], &device).require_grad();
        }
    }
}

// ============================================================================
// EntropyCoefficient
// ============================================================================

/// Entropy coefficient of the composite objective: either a plain number or
/// an adaptive Lagrange controller. Loss and metrics logic dispatch on the
/// variant explicitly.
#[derive(Debug, Clone)]
pub enum EntropyCoefficient<B: AutodiffBackend> {
    /// Fixed scalar; the entropy term is `-coef * entropy`.
    Fixed(f32),
    /// Learned multiplier enforcing an entropy constraint.
    Adaptive(LagrangeCoefficient<B>),
}

impl<B: AutodiffBackend> EntropyCoefficient<B> {
    /// Whether the coefficient is a learned multiplier.
    pub fn is_adaptive(&self) -> bool {
        matches!(self, Self::Adaptive(_))
    }

    /// Current numeric coefficient value.
    pub fn value(&self) -> f32 {
        match self {
            Self::Fixed(coef) => *coef,
            Self::Adaptive(lagrange) => lagrange.value(),
        }
    }

    /// Entropy contribution to the total loss, given the reduced entropy.
    pub fn entropy_term(&self, entropy: Tensor<B, 1>) -> Tensor<B, 1> {
        match self {
            Self::Fixed(coef) => entropy.mul_scalar(-*coef),
            Self::Adaptive(lagrange) => lagrange.lagrangian_loss(entropy),
        }
    }
}
