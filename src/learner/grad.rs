//! Gradient-norm computation and clipping over [`GradientsParams`].
//!
//! Clipping is scoped to an explicit set of parameter ids (the policy's
//! clipping scope); parameters without a gradient this step are skipped.

use std::collections::HashSet;
use std::marker::PhantomData;

use burn::module::{Module, ModuleVisitor, ParamId};
use burn::optim::GradientsParams;
use burn::tensor::backend::{AutodiffBackend, Backend};
use burn::tensor::{Bool, Int, Tensor};

struct SumOfSquares<'a, B: AutodiffBackend> {
    grads: &'a GradientsParams,
    scope: &'a HashSet<ParamId>,
    sum_sq: f32,
    _backend: PhantomData<B>,
}

impl<B: AutodiffBackend> ModuleVisitor<B> for SumOfSquares<'_, B> {
    fn visit_float<const D: usize>(&mut self, id: ParamId, _tensor: &Tensor<B, D>) {
        if !self.scope.contains(&id) {
            return;
        }
        if let Some(grad) = self.grads.get::<B::InnerBackend, D>(id) {
            let sq = grad
                .powf_scalar(2.0)
                .sum()
                .into_data()
                .as_slice::<f32>()
                .unwrap()[0];
            self.sum_sq += sq;
        }
    }

    fn visit_int<const D: usize>(&mut self, _id: ParamId, _tensor: &Tensor<B, D, Int>) {}

    fn visit_bool<const D: usize>(&mut self, _id: ParamId, _tensor: &Tensor<B, D, Bool>) {}
}

struct Rescale<'a, B: AutodiffBackend> {
    grads: &'a mut GradientsParams,
    scope: &'a HashSet<ParamId>,
    factor: f32,
    _backend: PhantomData<B>,
}

impl<B: AutodiffBackend> ModuleVisitor<B> for Rescale<'_, B> {
    fn visit_float<const D: usize>(&mut self, id: ParamId, _tensor: &Tensor<B, D>) {
        if !self.scope.contains(&id) {
            return;
        }
        if let Some(grad) = self.grads.remove::<B::InnerBackend, D>(id) {
            self.grads.register(id, grad.mul_scalar(self.factor));
        }
    }

    fn visit_int<const D: usize>(&mut self, _id: ParamId, _tensor: &Tensor<B, D, Int>) {}

    fn visit_bool<const D: usize>(&mut self, _id: ParamId, _tensor: &Tensor<B, D, Bool>) {}
}

/// Total L2 norm of the gradients for the given parameter scope.
pub fn global_grad_norm<B, M>(module: &M, grads: &GradientsParams, scope: &[ParamId]) -> f32
where
    B: AutodiffBackend,
    M: Module<B>,
{
    let scope: HashSet<ParamId> = scope.iter().copied().collect();
    let mut visitor = SumOfSquares::<B> {
        grads,
        scope: &scope,
        sum_sq: 0.0,
        _backend: PhantomData,
    };
    module.visit(&mut visitor);
    visitor.sum_sq.sqrt()
}

/// Clip the scoped gradients to `max_norm`, returning the pre-clip norm.
///
/// When the norm exceeds `max_norm` every scoped gradient is rescaled by
/// `max_norm / (norm + 1e-6)`; otherwise the gradients are untouched.
pub fn clip_grad_norm<B, M>(
    module: &M,
    grads: &mut GradientsParams,
    scope: &[ParamId],
    max_norm: f32,
) -> f32
where
    B: AutodiffBackend,
    M: Module<B>,
{
    let total_norm = global_grad_norm::<B, M>(module, grads, scope);
    if total_norm > max_norm {
        let scope: HashSet<ParamId> = scope.iter().copied().collect();
        let mut visitor = Rescale::<B> {
            grads,
            scope: &scope,
            factor: max_norm / (total_norm + 1e-6),
            _backend: PhantomData,
        };
        module.visit(&mut visitor);
    }
    total_norm
}
