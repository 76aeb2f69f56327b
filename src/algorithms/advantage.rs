//! Advantage computation and normalization.
//!
//! Advantages are per-sample `returns - value_preds`. Normalization brings
//! them to zero mean and unit variance, but masked or invalid timesteps show
//! up as non-finite entries: statistics are computed over finite entries
//! only, while the shift and scale are applied to the full tensor so
//! non-finite entries stay non-finite for downstream code to observe.

use burn::tensor::backend::Backend;
use burn::tensor::Tensor;

/// Numerical stability term added to the variance before the reciprocal
/// square root.
pub const EPS_PPO: f32 = 1e-5;

/// Normalize advantages to zero mean / unit variance.
///
/// Mean and (unbiased) variance are computed host-side over finite entries.
/// The whole tensor is then shifted by the mean and scaled by
/// `1 / sqrt(var + EPS_PPO)`, which never divides by zero even for
/// all-equal inputs. If no finite entry exists the input is returned
/// unchanged.
pub fn normalized_advantages<B: Backend>(advantages: Tensor<B, 1>) -> Tensor<B, 1> {
    let data = advantages.clone().into_data();
    let values = data.as_slice::<f32>().unwrap();

    let finite: Vec<f32> = values.iter().copied().filter(|v| v.is_finite()).collect();
    if finite.is_empty() {
        log::warn!("no finite advantage entries, skipping normalization");
        return advantages;
    }

    let n = finite.len();
    let mean = finite.iter().sum::<f32>() / n as f32;
    let var = if n > 1 {
        finite.iter().map(|v| (v - mean).powi(2)).sum::<f32>() / (n - 1) as f32
    } else {
        0.0
    };

    let scale = (var + EPS_PPO).sqrt().recip();
    advantages.sub_scalar(mean).mul_scalar(scale)
}
