//! Loss assembly primitives for the clipped-surrogate objective.
//!
//! All functions return per-sample tensors unless noted; the update loop
//! reduces them to scalars (optionally importance-weighted) before summing
//! the total objective. No ratio clamping or NaN suppression happens here:
//! non-finite values propagate so callers can observe training instability.

use burn::tensor::backend::AutodiffBackend;
use burn::tensor::Tensor;

/// Clipped surrogate policy loss, per sample.
///
/// `-min(adv * ratio, adv * clamp(ratio, 1 - c, 1 + c))`
///
/// `ratio` is `exp(new_log_prob - old_log_prob)`.
pub fn clipped_surrogate_loss<B: AutodiffBackend>(
    ratio: Tensor<B, 1>,
    advantages: Tensor<B, 1>,
    clip_param: f32,
) -> Tensor<B, 1> {
    let surr1 = advantages.clone() * ratio.clone();
    let surr2 = advantages * ratio.clamp(1.0 - clip_param, 1.0 + clip_param);
    -(surr1.min_pair(surr2))
}

/// Half mean-squared error, per sample: `0.5 * (pred - target)^2`.
pub fn half_mse<B: AutodiffBackend>(pred: Tensor<B, 1>, target: Tensor<B, 1>) -> Tensor<B, 1> {
    (pred - target).powf_scalar(2.0).mul_scalar(0.5)
}

/// Select the value estimates entering the clipped value loss.
///
/// The change from the old prediction is clamped to `[-c, c]`; the raw value
/// is kept only where `|value - old_pred| < c`, the clamped reconstruction
/// otherwise. A delta of exactly `c` takes the clamped branch, which is
/// numerically identical but carries no gradient into the value head (the
/// delta is detached).
pub fn clipped_values<B: AutodiffBackend>(
    values: Tensor<B, 1>,
    old_value_preds: Tensor<B, 1>,
    clip_param: f32,
) -> Tensor<B, 1> {
    let delta = values.clone().detach() - old_value_preds.clone();
    let value_pred_clipped = old_value_preds + delta.clone().clamp(-clip_param, clip_param);
    values.mask_where(delta.abs().greater_equal_elem(clip_param), value_pred_clipped)
}

/// Log-target KL divergence, reduced to a scalar.
///
/// Pointwise `exp(target) * (target - input)` over log-space inputs,
/// averaged over all elements. With the old log-probabilities as `input` and
/// the new ones as `target` this regularizes the updated policy toward the
/// behavior policy.
pub fn kl_div_log_target<B: AutodiffBackend>(
    input_log_probs: Tensor<B, 1>,
    target_log_probs: Tensor<B, 1>,
) -> Tensor<B, 1> {
    (target_log_probs.clone().exp() * (target_log_probs - input_log_probs)).mean()
}

/// Reduce a per-sample tensor to a scalar mean, elementwise-weighted when
/// importance coefficients are present.
pub fn reduce_mean<B: AutodiffBackend>(
    per_sample: Tensor<B, 1>,
    weights: Option<&Tensor<B, 1>>,
) -> Tensor<B, 1> {
    match weights {
        Some(w) => (w.clone() * per_sample).mean(),
        None => per_sample.mean(),
    }
}
