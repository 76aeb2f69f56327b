//! Per-update metric accumulation.
//!
//! One [`LearnerMetrics`] instance lives for the duration of a single update
//! call. Every minibatch appends scalars under string keys; at the end of the
//! update each series is reduced to its arithmetic mean. Nothing persists
//! across update calls.

use std::collections::BTreeMap;

/// Ordered map from metric name to the per-minibatch values recorded so far.
///
/// Keys are ordered (BTreeMap) so reduced output is deterministic.
#[derive(Debug, Default)]
pub struct LearnerMetrics {
    series: BTreeMap<String, Vec<f32>>,
}

impl LearnerMetrics {
    /// Create an empty accumulator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one value to the series for `key`.
    pub fn record(&mut self, key: &str, value: f32) {
        self.series.entry(key.to_string()).or_default().push(value);
    }

    /// Number of values recorded under `key`.
    pub fn count(&self, key: &str) -> usize {
        self.series.get(key).map_or(0, Vec::len)
    }

    /// Whether any value was recorded under `key`.
    pub fn contains(&self, key: &str) -> bool {
        self.count(key) > 0
    }

    /// Reduce every series to its mean, consuming the accumulator.
    ///
    /// Non-finite recorded values flow into the mean untouched; detecting
    /// training instability from the output is the caller's job.
    pub fn means(self) -> BTreeMap<String, f32> {
        self.series
            .into_iter()
            .map(|(key, values)| {
                let mean = values.iter().sum::<f32>() / values.len() as f32;
                (key, mean)
            })
            .collect()
    }
}
