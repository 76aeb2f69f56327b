//! Metric accumulation for the update loop.
//!
//! - [`LearnerMetrics`]: per-minibatch scalar series, reduced to means at the
//!   end of one update call

pub mod learner_metrics;

pub use learner_metrics::LearnerMetrics;
