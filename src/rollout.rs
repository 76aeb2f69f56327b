//! Experience-source interface consumed by the update loop.
//!
//! The buffer that stores and replays rollouts lives outside this crate. The
//! update loop only needs three things from it: the raw per-step returns, the
//! raw per-step value predictions, and a per-epoch finite sequence of
//! minibatches. How the source partitions, pads, or reshuffles experience
//! between epochs is its own business.

use burn::tensor::backend::Backend;
use burn::tensor::Tensor;

// ============================================================================
// SequenceInfo
// ============================================================================

/// Metadata describing how flattened timesteps regroup into sequences for
/// recurrent unrolling.
///
/// Opaque to the update loop: it is passed through to
/// [`Policy::evaluate_actions`](crate::policy::Policy::evaluate_actions)
/// untouched.
#[derive(Debug, Clone)]
pub struct SequenceInfo {
    /// Start index of each sequence in the flat batch.
    pub sequence_starts: Vec<usize>,
    /// Length of each sequence.
    pub sequence_lengths: Vec<usize>,
    /// Validity mask for padded positions (1.0 = valid, 0.0 = padding).
    pub mask: Option<Vec<f32>>,
}

// ============================================================================
// MiniBatch
// ============================================================================

/// One slice of an experience batch, processed in one gradient step.
///
/// All tensors share the leading batch dimension `n`; the update loop checks
/// this before evaluating the policy. `advantages`, `returns`,
/// `value_preds` and `action_log_probs` are per-sample scalars.
#[derive(Debug, Clone)]
pub struct MiniBatch<B: Backend> {
    /// Observations `[n, obs_dim]`.
    pub observations: Tensor<B, 2>,
    /// Recurrent hidden states `[n, layers, hidden_dim]`.
    pub recurrent_hidden_states: Tensor<B, 3>,
    /// Previous actions `[n, action_dim]`.
    pub prev_actions: Tensor<B, 2>,
    /// Validity masks `[n, 1]` (0.0 at episode starts).
    pub masks: Tensor<B, 2>,
    /// Actions taken `[n, action_dim]`.
    pub actions: Tensor<B, 2>,
    /// Log probability of each taken action under the behavior policy `[n]`.
    pub action_log_probs: Tensor<B, 1>,
    /// Value estimates recorded at collection time `[n]`.
    pub value_preds: Tensor<B, 1>,
    /// Discounted returns `[n]`.
    pub returns: Tensor<B, 1>,
    /// Advantages `[n]`, already normalized by the caller when configured.
    pub advantages: Tensor<B, 1>,
    /// Per-sample importance-sampling coefficients `[n]`, when the source
    /// replays off-policy data.
    pub is_coeffs: Option<Tensor<B, 1>>,
    /// Recurrent sequence metadata, when the policy unrolls sequences.
    pub seq_info: Option<SequenceInfo>,
}

impl<B: Backend> MiniBatch<B> {
    /// Number of samples in this minibatch.
    pub fn len(&self) -> usize {
        self.observations.dims()[0]
    }

    /// Whether the minibatch holds no samples.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ============================================================================
// ExperienceSource
// ============================================================================

/// Rollout storage collaborator.
///
/// One call to [`recurrent_generator`](Self::recurrent_generator) yields one
/// epoch's worth of minibatches; the update loop calls it afresh for every
/// epoch, so the source is free to re-partition between epochs. The yielded
/// count must equal `num_mini_batch` — the loop treats any other count as a
/// contract violation.
pub trait ExperienceSource<B: Backend> {
    /// Raw per-step returns for the whole stored batch `[total]`.
    fn returns(&self) -> Tensor<B, 1>;

    /// Raw per-step value predictions for the whole stored batch `[total]`.
    fn value_preds(&self) -> Tensor<B, 1>;

    /// Yield one epoch of minibatches built from the given advantages.
    fn recurrent_generator(
        &self,
        advantages: Tensor<B, 1>,
        num_mini_batch: usize,
    ) -> Box<dyn Iterator<Item = MiniBatch<B>> + '_>;
}
