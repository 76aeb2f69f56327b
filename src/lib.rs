//! # PPO Learner: the learning-update core of an actor-critic trainer
//!
//! Given a batch of collected experience (observations, actions,
//! returns, behavior-policy log probabilities, value estimates), this crate
//! computes a clipped policy-gradient objective with auxiliary value and
//! entropy terms and performs several epochs of minibatch gradient updates
//! against a policy/value network.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────┐
//! │                        PpoUpdater                          │
//! ├────────────────────────────────────────────────────────────┤
//! │  ExperienceSource ──► minibatches ──► Policy.evaluate      │
//! │        │                                   │               │
//! │   advantages                        loss assembly          │
//! │  (normalized)                  surrogate + value + joint   │
//! │                                + entropy coefficient       │
//! │                                        │                   │
//! │                      backward ──► all-reduce (non-policy)  │
//! │                               ──► clip grad norm           │
//! │                               ──► optimizer step           │
//! │                               ──► multiplier projection    │
//! │                                        │                   │
//! │                                 LearnerMetrics ──► means   │
//! └────────────────────────────────────────────────────────────┘
//! ```
//!
//! The network architecture, the experience buffer, and the distributed
//! process group are collaborators reached through traits ([`Policy`],
//! [`ExperienceSource`], [`ProcessGroup`]); this crate owns only the update
//! algorithm itself.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use ppo_learner::{PpoConfig, Policy, ExperienceSource};
//!
//! let config = PpoConfig::new()
//!     .with_clip_param(0.2)
//!     .with_ppo_epoch(4)
//!     .with_num_mini_batch(4)
//!     .build()?;
//!
//! let mut updater = config.init(&policy, &device)?;
//! let (policy, metrics) = updater.update(policy, &rollouts)?;
//! println!("value loss {}", metrics["value_loss"]);
//! ```

pub mod algorithms;
pub mod distributed;
pub mod learner;
pub mod metrics;
pub mod policy;
pub mod rollout;

pub use algorithms::advantage::{normalized_advantages, EPS_PPO};
pub use algorithms::entropy_coef::{EntropyCoefficient, LagrangeCoefficient};
pub use distributed::{LocalGroup, ProcessGroup, ReduceHandle, SingleProcess};
pub use learner::{ConfigError, DefaultHooks, PpoConfig, PpoUpdater, UpdateError, UpdateHooks};
pub use metrics::LearnerMetrics;
pub use policy::{ActionDistribution, EvaluationOutput, Policy};
pub use rollout::{ExperienceSource, MiniBatch, SequenceInfo};
