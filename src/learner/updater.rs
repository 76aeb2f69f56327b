//! The minibatch update loop.
//!
//! [`PpoUpdater`] drives everything: it pulls minibatches from the
//! experience source, evaluates the policy, assembles the composite loss,
//! backpropagates, synchronizes and clips gradients, steps the optimizer,
//! and accumulates metrics. One [`update`](PpoUpdater::update) call runs
//! `ppo_epoch` epochs over the stored batch and returns per-metric means.
//!
//! The policy module flows through `update` by value and is returned with
//! the updated parameters (burn's functional module update); the updater
//! itself owns only the optimizer state, the entropy coefficient, and the
//! injected collaborators.

use std::collections::BTreeMap;
use std::fmt;
use std::marker::PhantomData;

use burn::optim::{AdamConfig, GradientsParams, Optimizer};
use burn::tensor::backend::AutodiffBackend;
use burn::tensor::Tensor;

use crate::algorithms::advantage::normalized_advantages;
use crate::algorithms::entropy_coef::{EntropyCoefficient, LagrangeCoefficient};
use crate::algorithms::losses::{
    clipped_surrogate_loss, clipped_values, half_mse, kl_div_log_target, reduce_mean,
};
use crate::distributed::{ProcessGroup, ReduceHandle, SingleProcess};
use crate::learner::config::{ConfigError, PpoConfig};
use crate::learner::grad::clip_grad_norm;
use crate::learner::hooks::{DefaultHooks, UpdateHooks};
use crate::metrics::LearnerMetrics;
use crate::policy::{ActionDistribution, EvaluationOutput, Policy};
use crate::rollout::{ExperienceSource, MiniBatch};

/// Weight of the KL regularizer inside the joint loss.
const KL_WEIGHT: f32 = 0.3;

/// Bounds of the adaptive entropy multiplier.
const ALPHA_MIN: f32 = 1e-4;
const ALPHA_MAX: f32 = 1.0;

// ============================================================================
// UpdateError
// ============================================================================

/// Collaborator contract violation detected during an update.
///
/// A training step is not retryable without an external snapshot of the
/// optimizer state, so these abort the update immediately.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateError {
    /// A minibatch field or an evaluation output does not share the batch's
    /// leading dimension.
    ShapeMismatch {
        field: &'static str,
        expected: usize,
        got: usize,
    },
    /// The experience source yielded a different number of minibatches than
    /// the configuration asked for.
    MinibatchCount {
        expected: usize,
        got: usize,
    },
}

impl fmt::Display for UpdateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UpdateError::ShapeMismatch { field, expected, got } => {
                write!(f, "{}: expected {} samples, got {}", field, expected, got)
            }
            UpdateError::MinibatchCount { expected, got } => {
                write!(
                    f,
                    "experience source yielded {} minibatches, expected {}",
                    got, expected
                )
            }
        }
    }
}

impl std::error::Error for UpdateError {}

fn check_dim(field: &'static str, got: usize, expected: usize) -> Result<(), UpdateError> {
    if got == expected {
        Ok(())
    } else {
        Err(UpdateError::ShapeMismatch { field, expected, got })
    }
}

fn validate_batch<B: AutodiffBackend>(batch: &MiniBatch<B>) -> Result<(), UpdateError> {
    let n = batch.len();
    check_dim(
        "recurrent_hidden_states",
        batch.recurrent_hidden_states.dims()[0],
        n,
    )?;
    check_dim("prev_actions", batch.prev_actions.dims()[0], n)?;
    check_dim("masks", batch.masks.dims()[0], n)?;
    check_dim("actions", batch.actions.dims()[0], n)?;
    check_dim("action_log_probs", batch.action_log_probs.dims()[0], n)?;
    check_dim("value_preds", batch.value_preds.dims()[0], n)?;
    check_dim("returns", batch.returns.dims()[0], n)?;
    check_dim("advantages", batch.advantages.dims()[0], n)?;
    if let Some(is_coeffs) = &batch.is_coeffs {
        check_dim("is_coeffs", is_coeffs.dims()[0], n)?;
    }
    Ok(())
}

fn validate_evaluation<B: AutodiffBackend>(
    out: &EvaluationOutput<B>,
    n: usize,
) -> Result<(), UpdateError> {
    check_dim("values", out.values.dims()[0], n)?;
    check_dim("action_values", out.action_values.dims()[0], n)?;
    check_dim("new action_log_probs", out.action_log_probs.dims()[0], n)?;
    check_dim("entropy", out.entropy.dims()[0], n)?;
    Ok(())
}

// ============================================================================
// PpoUpdater
// ============================================================================

/// Clipped-surrogate policy updater.
///
/// Built from a validated [`PpoConfig`] via [`PpoConfig::init`]; collaborators
/// are swapped in with [`with_process_group`](Self::with_process_group) and
/// [`with_hooks`](Self::with_hooks).
pub struct PpoUpdater<B, M, O, H = DefaultHooks>
where
    B: AutodiffBackend,
    M: Policy<B>,
    O: Optimizer<M, B>,
    H: UpdateHooks<B>,
{
    config: PpoConfig,
    optimizer: O,
    entropy_coef: EntropyCoefficient<B>,
    process_group: Box<dyn ProcessGroup>,
    hooks: H,
    _policy: PhantomData<M>,
}

impl PpoConfig {
    /// Build an updater for `policy`, validating the configuration.
    ///
    /// The optimizer (Adam with the configured epsilon) is created here; a
    /// policy without trainable parameters is rejected up front rather than
    /// failing at step time. The entropy coefficient becomes an adaptive
    /// Lagrange multiplier only when `use_adaptive_entropy_pen` is set and
    /// the policy's action distribution is Gaussian.
    pub fn init<B, M>(
        self,
        policy: &M,
        device: &B::Device,
    ) -> Result<PpoUpdater<B, M, impl Optimizer<M, B>, DefaultHooks>, ConfigError>
    where
        B: AutodiffBackend,
        M: Policy<B>,
    {
        self.validate()?;
        if policy.num_params() == 0 {
            return Err(ConfigError::NoTrainableParameters);
        }

        let optimizer = AdamConfig::new().with_epsilon(self.epsilon).init();

        let entropy_coef = if self.use_adaptive_entropy_pen
            && policy.action_distribution() == ActionDistribution::Gaussian
        {
            EntropyCoefficient::Adaptive(LagrangeCoefficient::new(
                -self.entropy_target_factor * policy.num_actions() as f32,
                self.entropy_coef,
                ALPHA_MIN,
                ALPHA_MAX,
                true,
                device,
            ))
        } else {
            EntropyCoefficient::Fixed(self.entropy_coef)
        };

        Ok(PpoUpdater {
            config: self,
            optimizer,
            entropy_coef,
            process_group: Box::new(SingleProcess),
            hooks: DefaultHooks,
            _policy: PhantomData,
        })
    }
}

impl<B, M, O, H> PpoUpdater<B, M, O, H>
where
    B: AutodiffBackend,
    M: Policy<B>,
    O: Optimizer<M, B>,
    H: UpdateHooks<B>,
{
    /// Inject a distributed process group (default: [`SingleProcess`]).
    pub fn with_process_group(mut self, group: Box<dyn ProcessGroup>) -> Self {
        self.process_group = group;
        self
    }

    /// Replace the hook set.
    pub fn with_hooks<H2: UpdateHooks<B>>(self, hooks: H2) -> PpoUpdater<B, M, O, H2> {
        PpoUpdater {
            config: self.config,
            optimizer: self.optimizer,
            entropy_coef: self.entropy_coef,
            process_group: self.process_group,
            hooks,
            _policy: PhantomData,
        }
    }

    /// The validated configuration.
    pub fn config(&self) -> &PpoConfig {
        &self.config
    }

    /// The entropy coefficient (fixed or adaptive).
    pub fn entropy_coef(&self) -> &EntropyCoefficient<B> {
        &self.entropy_coef
    }

    /// The installed hook set.
    pub fn hooks(&self) -> &H {
        &self.hooks
    }

    /// Advantages for the stored batch: `returns - value_preds`, normalized
    /// when configured. Non-finite entries (masked timesteps) pass through.
    pub fn advantages<R: ExperienceSource<B>>(&self, source: &R) -> Tensor<B, 1> {
        let advantages = source.returns() - source.value_preds();
        if !self.config.use_normalized_advantage {
            return advantages;
        }
        normalized_advantages(advantages)
    }

    /// Run one full update: `ppo_epoch` epochs of `num_mini_batch`
    /// minibatches each, in the order the source yields them.
    ///
    /// Returns the policy with updated parameters and the mean of every
    /// recorded metric. Gradients exist only between each backward pass and
    /// the optimizer step that consumes them; nothing accumulates across
    /// minibatches or calls.
    ///
    /// Under a distributed group only non-policy parameters (the adaptive
    /// entropy multiplier) are synchronized here, via an async all-reduce of
    /// their averaged gradients. Policy-parameter gradients are assumed to
    /// be synchronized by an external mechanism (e.g. a distributed model
    /// wrapper); verify that guarantee before relying on multi-worker
    /// training.
    pub fn update<R: ExperienceSource<B>>(
        &mut self,
        mut policy: M,
        source: &R,
    ) -> Result<(M, BTreeMap<String, f32>), UpdateError> {
        let advantages = self.advantages(source);
        let mut metrics = LearnerMetrics::new();

        log::debug!(
            "ppo update: {} epochs x {} minibatches",
            self.config.ppo_epoch,
            self.config.num_mini_batch
        );

        for epoch in 0..self.config.ppo_epoch {
            let final_epoch = epoch + 1 == self.config.ppo_epoch;
            let mut yielded = 0;

            for batch in source.recurrent_generator(advantages.clone(), self.config.num_mini_batch)
            {
                policy = self.minibatch_step(policy, &batch, final_epoch, &mut metrics)?;
                yielded += 1;
            }

            if yielded != self.config.num_mini_batch {
                return Err(UpdateError::MinibatchCount {
                    expected: self.config.num_mini_batch,
                    got: yielded,
                });
            }
        }

        Ok((policy, metrics.means()))
    }

    /// One gradient step on one minibatch.
    fn minibatch_step(
        &mut self,
        policy: M,
        batch: &MiniBatch<B>,
        final_epoch: bool,
        metrics: &mut LearnerMetrics,
    ) -> Result<M, UpdateError> {
        let clip_param = self.config.clip_param;
        let n = batch.len();
        validate_batch(batch)?;

        let out = policy.evaluate_actions(
            batch.observations.clone(),
            batch.recurrent_hidden_states.clone(),
            batch.prev_actions.clone(),
            batch.masks.clone(),
            batch.actions.clone(),
            batch.seq_info.as_ref(),
        );
        validate_evaluation(&out, n)?;

        let ratio = (out.action_log_probs.clone() - batch.action_log_probs.clone()).exp();
        let action_loss = clipped_surrogate_loss(ratio.clone(), batch.advantages.clone(), clip_param);

        let orig_values = out.values.clone();
        let values = if self.config.use_clipped_value_loss {
            clipped_values(out.values.clone(), batch.value_preds.clone(), clip_param)
        } else {
            out.values.clone()
        };
        let value_loss = half_mse(values, batch.returns.clone());
        let act_val_loss = half_mse(out.action_values.clone(), batch.returns.clone());

        let kl = kl_div_log_target(batch.action_log_probs.clone(), out.action_log_probs.clone())
            .mul_scalar(KL_WEIGHT);

        let weights = batch.is_coeffs.as_ref().map(|c| c.clone().clamp_max(1.0));
        let action_loss = reduce_mean(action_loss, weights.as_ref());
        let act_val_loss = reduce_mean(act_val_loss, weights.as_ref());
        let value_loss = reduce_mean(value_loss, weights.as_ref());
        let dist_entropy = reduce_mean(out.entropy.clone(), weights.as_ref());

        let joint_loss = kl + act_val_loss;
        let entropy_term = self.entropy_coef.entropy_term(dist_entropy.clone());

        let total_loss = value_loss.clone().mul_scalar(self.config.value_loss_coef)
            + action_loss.clone()
            + joint_loss
            + entropy_term;

        let total_loss = self.hooks.before_backward(total_loss);
        let raw_grads = total_loss.backward();
        self.hooks.after_backward(&total_loss);

        // The multiplier's gradient must come out before the module
        // gradients consume the container.
        let mut coef_grad: Option<f32> = None;
        let mut pending: Option<Box<dyn ReduceHandle>> = None;
        if let EntropyCoefficient::Adaptive(lagrange) = &self.entropy_coef {
            if let Some(grad) = lagrange.grad(&raw_grads) {
                let grad = grad.into_data().as_slice::<f32>().unwrap()[0];
                if self.process_group.is_initialized() {
                    let world_size = self.process_group.world_size() as f32;
                    pending = Some(self.process_group.all_reduce_sum(vec![grad / world_size]));
                } else {
                    coef_grad = Some(grad);
                }
            }
        }

        let mut grads = GradientsParams::from_grads(raw_grads, &policy);

        let grad_norm = clip_grad_norm::<B, M>(
            &policy,
            &mut grads,
            &policy.policy_parameters(),
            self.config.max_grad_norm,
        );

        if let Some(handle) = pending {
            coef_grad = Some(handle.wait()[0]);
        }

        self.hooks.before_step();
        let policy = self.optimizer.step(self.config.learning_rate, policy, grads);

        if let EntropyCoefficient::Adaptive(lagrange) = &mut self.entropy_coef {
            if let Some(grad) = coef_grad {
                lagrange.apply_grad_step(self.config.learning_rate, grad);
            }
            // Projection runs every step, whether or not the multiplier
            // received a gradient.
            lagrange.project_into_bounds();
        }
        self.hooks.after_step();

        if let Some(is_coeffs) = &batch.is_coeffs {
            record_min_mean_max(metrics, "ver_is_coeffs", is_coeffs);
        }
        record_min_mean_max(metrics, "value_pred", &orig_values);
        record_min_mean_max(metrics, "prob_ratio", &ratio);

        metrics.record("value_loss", scalar(value_loss));
        metrics.record("action_loss", scalar(action_loss));
        metrics.record("dist_entopy", scalar(dist_entropy));
        metrics.record("grad_norm", grad_norm);

        if final_epoch {
            let data = ratio.clone().detach().into_data();
            let clipped = data
                .as_slice::<f32>()
                .unwrap()
                .iter()
                .filter(|r| **r > 1.0 + clip_param || **r < 1.0 - clip_param)
                .count();
            metrics.record("ppo_fraction_clipped", clipped as f32 / n as f32);
        }

        if self.entropy_coef.is_adaptive() {
            metrics.record("entropy_coef", self.entropy_coef.value());
        }

        Ok(policy)
    }
}

/// Pull a scalar tensor down to a host value.
fn scalar<B: AutodiffBackend>(t: Tensor<B, 1>) -> f32 {
    t.into_data().as_slice::<f32>().unwrap()[0]
}

fn record_min_mean_max<B: AutodiffBackend>(
    metrics: &mut LearnerMetrics,
    prefix: &str,
    t: &Tensor<B, 1>,
) {
    let t = t.clone().detach();
    metrics.record(&format!("{}_min", prefix), scalar(t.clone().min()));
    metrics.record(&format!("{}_mean", prefix), scalar(t.clone().mean()));
    metrics.record(&format!("{}_max", prefix), scalar(t.max()));
}
