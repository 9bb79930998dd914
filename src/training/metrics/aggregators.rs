//! Exponential moving average over minibatch metrics

use serde::{Deserialize, Serialize};

use super::Metrics;
use crate::error::{Error, Result};

/// Per-epoch exponential moving average of minibatch metrics
///
/// With smoothing strength `alpha` the update weight is
/// `alpha' = alpha / (1 + alpha)` and each new value `x` moves the average to
/// `alpha' * old + (1 - alpha') * x`. `alpha = 0` tracks the latest value.
/// The first minibatch of an epoch seeds the average directly, as does the
/// first appearance of a metric name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsAggregator {
    alpha: f64,
    smoothed: Metrics,
}

impl MetricsAggregator {
    /// Create an aggregator with smoothing strength `alpha`
    pub fn new(alpha: f64) -> Result<Self> {
        if !(alpha >= 0.0) || !alpha.is_finite() {
            return Err(Error::config(format!("alpha must be a finite value >= 0, got {}", alpha)));
        }
        Ok(Self {
            alpha,
            smoothed: Metrics::new(),
        })
    }

    /// Smoothing strength
    pub fn alpha(&self) -> f64 {
        self.alpha
    }

    /// Weight given to the previous average
    pub fn weight(&self) -> f64 {
        self.alpha / (1.0 + self.alpha)
    }

    /// Fold minibatch `batch_idx`'s raw metrics into the average
    pub fn update(&mut self, batch_idx: usize, raw: &Metrics) -> &Metrics {
        if batch_idx == 0 || self.smoothed.is_empty() {
            self.smoothed = raw.clone();
            return &self.smoothed;
        }

        let weight = self.weight();
        for (name, &value) in raw {
            self.smoothed
                .entry(name.clone())
                .and_modify(|old| *old = weight * *old + (1.0 - weight) * value)
                .or_insert(value);
        }
        &self.smoothed
    }

    /// Current smoothed values
    pub fn current(&self) -> &Metrics {
        &self.smoothed
    }

    /// Continue from previously smoothed values, e.g. after a resume
    pub fn restore(&mut self, smoothed: Metrics) {
        self.smoothed = smoothed;
    }

    /// Forget all smoothed values
    pub fn reset(&mut self) {
        self.smoothed.clear();
    }
}
