//! Policy-network collaborator interface.
//!
//! The network architecture and action-distribution family live outside this
//! crate. The update loop talks to them through [`Policy`]: one batched
//! "evaluate actions" call plus a handful of accessors used at construction
//! time (distribution tag, action dimensionality) and at clipping time
//! (parameter scope).

use std::collections::BTreeMap;

use burn::module::{AutodiffModule, Module, ModuleVisitor, ParamId};
use burn::tensor::backend::{AutodiffBackend, Backend};
use burn::tensor::{Bool, Int, Tensor};

use crate::rollout::SequenceInfo;

// ============================================================================
// ActionDistribution
// ============================================================================

/// Action-distribution family tag.
///
/// Only used to decide whether an adaptive entropy coefficient may be
/// constructed; the update loop never samples from the distribution itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionDistribution {
    /// Categorical distribution over discrete actions.
    Categorical,
    /// Gaussian distribution over continuous actions.
    Gaussian,
}

// ============================================================================
// EvaluationOutput
// ============================================================================

/// Result of evaluating stored actions under the current parameters.
///
/// All per-sample tensors are `[n]` for a minibatch of `n` samples; the
/// update loop validates this against the minibatch before using them.
#[derive(Debug, Clone)]
pub struct EvaluationOutput<B: Backend> {
    /// Value estimates `[n]`.
    pub values: Tensor<B, 1>,
    /// Auxiliary action-value estimates `[n]`, an independent head.
    pub action_values: Tensor<B, 1>,
    /// Log probability of the taken actions `[n]`.
    pub action_log_probs: Tensor<B, 1>,
    /// Distribution entropy `[n]`.
    pub entropy: Tensor<B, 1>,
    /// Auxiliary outputs. Carried for callers that extend the loop via
    /// hooks; the core update loop ignores them.
    pub extra: BTreeMap<String, Tensor<B, 1>>,
}

impl<B: Backend> EvaluationOutput<B> {
    /// Build an output with no auxiliary extras.
    pub fn new(
        values: Tensor<B, 1>,
        action_values: Tensor<B, 1>,
        action_log_probs: Tensor<B, 1>,
        entropy: Tensor<B, 1>,
    ) -> Self {
        Self {
            values,
            action_values,
            action_log_probs,
            entropy,
            extra: BTreeMap::new(),
        }
    }
}

// ============================================================================
// Policy Trait
// ============================================================================

/// Trainable policy/value network, borrowed by the update loop.
///
/// Implementors are burn modules; the loop moves the module through the
/// optimizer step and hands it back, so the caller keeps long-term
/// ownership.
pub trait Policy<B: AutodiffBackend>: AutodiffModule<B> {
    /// Evaluate the stored `actions` under the current parameters.
    ///
    /// `seq_info` is only present for recurrent policies and is forwarded
    /// verbatim from the minibatch.
    #[allow(clippy::too_many_arguments)]
    fn evaluate_actions(
        &self,
        observations: Tensor<B, 2>,
        recurrent_hidden_states: Tensor<B, 3>,
        prev_actions: Tensor<B, 2>,
        masks: Tensor<B, 2>,
        actions: Tensor<B, 2>,
        seq_info: Option<&SequenceInfo>,
    ) -> EvaluationOutput<B>;

    /// Which distribution family the action head parameterizes.
    fn action_distribution(&self) -> ActionDistribution;

    /// Action dimensionality (continuous) or action count (discrete).
    fn num_actions(&self) -> usize;

    /// Parameters whose gradient norm is clipped.
    ///
    /// Defaults to every parameter of the module; override to clip a
    /// subset (e.g. exclude a frozen encoder).
    fn policy_parameters(&self) -> Vec<ParamId> {
        all_param_ids(self)
    }
}

/// Collect the ids of every float parameter in a module.
pub fn all_param_ids<B: Backend, M: Module<B>>(module: &M) -> Vec<ParamId> {
    struct Collect {
        ids: Vec<ParamId>,
    }

    impl<B: Backend> ModuleVisitor<B> for Collect {
        fn visit_float<const D: usize>(&mut self, id: ParamId, _tensor: &Tensor<B, D>) {
            self.ids.push(id);
        }

        fn visit_int<const D: usize>(&mut self, _id: ParamId, _tensor: &Tensor<B, D, Int>) {}

        fn visit_bool<const D: usize>(&mut self, _id: ParamId, _tensor: &Tensor<B, D, Bool>) {}
    }

    let mut visitor = Collect { ids: Vec::new() };
    module.visit(&mut visitor);
    visitor.ids
}
