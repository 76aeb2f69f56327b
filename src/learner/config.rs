//! Configuration for the update loop.
//!
//! The configuration is an explicit struct with named fields: every
//! hyperparameter the loop consumes is a field here, validated at
//! construction. There is no dynamic field binding and no silent defaulting
//! of a misspelled option.

use std::fmt;

/// Configuration validation error.
///
/// Raised before any computation begins: either at [`PpoConfig::validate`]
/// or when the updater is built over a degenerate policy.
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigError {
    /// A count parameter (ppo_epoch, num_mini_batch) must be positive.
    InvalidCount {
        field: &'static str,
        value: usize,
    },
    /// A parameter is outside its valid range.
    OutOfRange {
        field: &'static str,
        value: f32,
        min: f32,
        max: f32,
    },
    /// A parameter must be strictly positive.
    NotPositive {
        field: &'static str,
        value: f64,
    },
    /// The policy exposes no trainable parameters, so no optimizer can be
    /// built and no update is possible.
    NoTrainableParameters,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::InvalidCount { field, value } => {
                write!(f, "{} must be > 0, got {}", field, value)
            }
            ConfigError::OutOfRange { field, value, min, max } => {
                write!(f, "{} must be in ({}, {}), got {}", field, min, max, value)
            }
            ConfigError::NotPositive { field, value } => {
                write!(f, "{} must be > 0, got {}", field, value)
            }
            ConfigError::NoTrainableParameters => {
                write!(f, "policy has no trainable parameters")
            }
        }
    }
}

impl std::error::Error for ConfigError {}

/// Hyperparameters of the clipped-surrogate update.
///
/// Immutable once the updater is built; use the `with_*` builders and
/// [`build`](Self::build) to construct a validated instance.
#[derive(Debug, Clone)]
pub struct PpoConfig {
    /// Probability-ratio clipping parameter (0 < c < 1).
    pub clip_param: f32,
    /// Number of optimization epochs over the stored batch.
    pub ppo_epoch: usize,
    /// Number of minibatches per epoch.
    pub num_mini_batch: usize,
    /// Weight of the value loss in the total objective.
    pub value_loss_coef: f32,
    /// Entropy coefficient; also the initial multiplier value when the
    /// adaptive entropy penalty is enabled.
    pub entropy_coef: f32,
    /// Optimizer learning rate.
    pub learning_rate: f64,
    /// Optimizer numerical stability term.
    pub epsilon: f32,
    /// Maximum gradient norm over the policy-parameter scope.
    pub max_grad_norm: f32,
    /// Clip the change of the value estimate from its rollout-time value.
    pub use_clipped_value_loss: bool,
    /// Normalize advantages to zero mean / unit variance.
    pub use_normalized_advantage: bool,
    /// Entropy constraint target, scaled by the action dimensionality.
    pub entropy_target_factor: f32,
    /// Learn the entropy coefficient as a Lagrange multiplier (Gaussian
    /// action distributions only).
    pub use_adaptive_entropy_pen: bool,
}

impl Default for PpoConfig {
    fn default() -> Self {
        Self {
            clip_param: 0.2,
            ppo_epoch: 4,
            num_mini_batch: 4,
            value_loss_coef: 0.5,
            entropy_coef: 0.01,
            learning_rate: 2.5e-4,
            epsilon: 1e-5,
            max_grad_norm: 0.5,
            use_clipped_value_loss: true,
            use_normalized_advantage: true,
            entropy_target_factor: 0.0,
            use_adaptive_entropy_pen: false,
        }
    }
}

impl PpoConfig {
    /// Create a configuration with defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate all parameters.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.ppo_epoch == 0 {
            return Err(ConfigError::InvalidCount {
                field: "ppo_epoch",
                value: 0,
            });
        }
        if self.num_mini_batch == 0 {
            return Err(ConfigError::InvalidCount {
                field: "num_mini_batch",
                value: 0,
            });
        }
        if self.clip_param <= 0.0 || self.clip_param >= 1.0 {
            return Err(ConfigError::OutOfRange {
                field: "clip_param",
                value: self.clip_param,
                min: 0.0,
                max: 1.0,
            });
        }
        if self.value_loss_coef < 0.0 {
            return Err(ConfigError::OutOfRange {
                field: "value_loss_coef",
                value: self.value_loss_coef,
                min: 0.0,
                max: f32::INFINITY,
            });
        }
        if self.learning_rate <= 0.0 {
            return Err(ConfigError::NotPositive {
                field: "learning_rate",
                value: self.learning_rate,
            });
        }
        if self.epsilon <= 0.0 {
            return Err(ConfigError::NotPositive {
                field: "epsilon",
                value: self.epsilon as f64,
            });
        }
        if self.max_grad_norm <= 0.0 {
            return Err(ConfigError::NotPositive {
                field: "max_grad_norm",
                value: self.max_grad_norm as f64,
            });
        }
        if self.use_adaptive_entropy_pen && self.entropy_coef <= 0.0 {
            // The adaptive multiplier is initialized from entropy_coef in
            // log space.
            return Err(ConfigError::NotPositive {
                field: "entropy_coef",
                value: self.entropy_coef as f64,
            });
        }
        Ok(())
    }

    /// Build and validate the configuration.
    pub fn build(self) -> Result<Self, ConfigError> {
        self.validate()?;
        Ok(self)
    }

    /// Set the ratio clipping parameter.
    pub fn with_clip_param(mut self, clip_param: f32) -> Self {
        self.clip_param = clip_param;
        self
    }

    /// Set the number of epochs per update.
    pub fn with_ppo_epoch(mut self, epochs: usize) -> Self {
        self.ppo_epoch = epochs;
        self
    }

    /// Set the number of minibatches per epoch.
    pub fn with_num_mini_batch(mut self, n: usize) -> Self {
        self.num_mini_batch = n;
        self
    }

    /// Set the value-loss weight.
    pub fn with_value_loss_coef(mut self, coef: f32) -> Self {
        self.value_loss_coef = coef;
        self
    }

    /// Set the entropy coefficient (initial multiplier value when adaptive).
    pub fn with_entropy_coef(mut self, coef: f32) -> Self {
        self.entropy_coef = coef;
        self
    }

    /// Set the learning rate.
    pub fn with_learning_rate(mut self, lr: f64) -> Self {
        self.learning_rate = lr;
        self
    }

    /// Set the optimizer stability term.
    pub fn with_epsilon(mut self, epsilon: f32) -> Self {
        self.epsilon = epsilon;
        self
    }

    /// Set the maximum gradient norm.
    pub fn with_max_grad_norm(mut self, norm: f32) -> Self {
        self.max_grad_norm = norm;
        self
    }

    /// Enable or disable value-loss clipping.
    pub fn with_clipped_value_loss(mut self, enabled: bool) -> Self {
        self.use_clipped_value_loss = enabled;
        self
    }

    /// Enable or disable advantage normalization.
    pub fn with_normalized_advantage(mut self, enabled: bool) -> Self {
        self.use_normalized_advantage = enabled;
        self
    }

    /// Set the entropy constraint target factor.
    pub fn with_entropy_target_factor(mut self, factor: f32) -> Self {
        self.entropy_target_factor = factor;
        self
    }

    /// Enable or disable the adaptive entropy penalty.
    pub fn with_adaptive_entropy_pen(mut self, enabled: bool) -> Self {
        self.use_adaptive_entropy_pen = enabled;
        self
    }
}
