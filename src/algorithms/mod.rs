//! Algorithmic components of the update core.
//!
//! - `advantage`: advantage computation and normalization
//! - `losses`: clipped-surrogate objective and auxiliary loss primitives
//! - `entropy_coef`: fixed or Lagrangian entropy coefficient

pub mod advantage;
pub mod entropy_coef;
pub mod losses;

pub use advantage::{normalized_advantages, EPS_PPO};
pub use entropy_coef::{EntropyCoefficient, LagrangeCoefficient};
pub use losses::{
    clipped_surrogate_loss, clipped_values, half_mse, kl_div_log_target, reduce_mean,
};
