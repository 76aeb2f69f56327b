//! Extension points around the backward pass and optimizer step.
//!
//! Variants of the update (auxiliary losses, custom regularizers, extra
//! bookkeeping) plug in through [`UpdateHooks`] instead of overriding the
//! loop itself. Every hook defaults to a no-op; the loop's own work —
//! gradient synchronization, norm clipping, the optimizer step, and the
//! multiplier bounds projection — is not overridable.

use burn::tensor::backend::AutodiffBackend;
use burn::tensor::Tensor;

/// Hooks invoked by the update loop around each minibatch step.
pub trait UpdateHooks<B: AutodiffBackend> {
    /// Rewrite the total loss before the backward pass.
    fn before_backward(&mut self, loss: Tensor<B, 1>) -> Tensor<B, 1> {
        loss
    }

    /// Observe the loss after the backward pass.
    fn after_backward(&mut self, _loss: &Tensor<B, 1>) {}

    /// Runs after gradient synchronization and clipping, before the step.
    fn before_step(&mut self) {}

    /// Runs after the optimizer step and the coefficient projection.
    fn after_step(&mut self) {}
}

/// The default hook set: every extension point is a no-op.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultHooks;

impl<B: AutodiffBackend> UpdateHooks<B> for DefaultHooks {}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::{Autodiff, NdArray};
    use burn::tensor::backend::Backend;

    type B = Autodiff<NdArray<f32>>;

    #[test]
    fn test_default_hooks_pass_loss_through() {
        let device = <B as Backend>::Device::default();
        let loss = Tensor::<B, 1>::from_floats([1.5], &device);

        let mut hooks = DefaultHooks;
        let out = UpdateHooks::<B>::before_backward(&mut hooks, loss.clone());
        let expected = loss.into_data().as_slice::<f32>().unwrap()[0];
        let got = out.into_data().as_slice::<f32>().unwrap()[0];
        assert_eq!(expected, got);
    }
}
