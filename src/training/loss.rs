//! Loss functions for classifier training

use candle_core::{DType, Tensor, D};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Trait for loss functions
pub trait Loss: Send + Sync {
    /// Loss name
    fn name(&self) -> &str;

    /// Scalar loss of `predictions` against `targets`
    fn compute(&self, predictions: &Tensor, targets: &Tensor) -> Result<Tensor>;

    /// Called once after every finished epoch
    fn update_epoch(&mut self, _epoch: usize) {}
}

/// Label smoothing that decays linearly from `start` to `end` over the run
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SmoothingSchedule {
    /// Smoothing at epoch 0
    pub start: f64,
    /// Smoothing at the last epoch
    pub end: f64,
    /// Number of epochs in the run
    pub total_epochs: usize,
}

impl SmoothingSchedule {
    /// Smoothing used after `epoch` finished epochs
    pub fn at(&self, epoch: usize) -> f64 {
        let progress = (epoch as f64 / self.total_epochs.max(1) as f64).min(1.0);
        (1.0 - progress) * self.start + progress * self.end
    }
}

/// Cross-entropy over class logits with optional label smoothing
///
/// Predictions are `[batch, classes]` logits; targets are class indices of
/// shape `[batch]` in any numeric dtype.
#[derive(Debug, Clone)]
pub struct CrossEntropyLoss {
    schedule: Option<SmoothingSchedule>,
    epoch: usize,
}

impl CrossEntropyLoss {
    /// Plain cross-entropy
    pub fn new() -> Self {
        Self {
            schedule: None,
            epoch: 0,
        }
    }

    /// Cross-entropy whose label smoothing follows `schedule`
    pub fn with_smoothing(schedule: SmoothingSchedule) -> Self {
        Self {
            schedule: Some(schedule),
            epoch: 0,
        }
    }

    /// Label smoothing applied at the current epoch
    pub fn smoothing(&self) -> f64 {
        self.schedule.map_or(0.0, |s| s.at(self.epoch))
    }
}

impl Default for CrossEntropyLoss {
    fn default() -> Self {
        Self::new()
    }
}

impl Loss for CrossEntropyLoss {
    fn name(&self) -> &str {
        "cross_entropy"
    }

    fn compute(&self, predictions: &Tensor, targets: &Tensor) -> Result<Tensor> {
        let (batch, classes) = predictions.dims2()?;
        if targets.dims() != [batch] {
            return Err(Error::model(format!(
                "targets of shape {:?} do not match {} predictions",
                targets.dims(),
                batch
            )));
        }
        if classes == 0 {
            return Err(Error::model("predictions have no classes"));
        }

        let log_probs = candle_nn::ops::log_softmax(predictions, D::Minus1)?;
        let index = targets.to_dtype(DType::U32)?.unsqueeze(1)?;
        let nll = log_probs.gather(&index, 1)?.squeeze(1)?.mean_all()?.neg()?;

        let smoothing = self.smoothing();
        if smoothing <= 0.0 {
            return Ok(nll);
        }
        let uniform = log_probs.mean(D::Minus1)?.mean_all()?.neg()?;
        Ok(nll
            .affine(1.0 - smoothing, 0.0)?
            .add(&uniform.affine(smoothing, 0.0)?)?)
    }

    fn update_epoch(&mut self, epoch: usize) {
        self.epoch = epoch;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use candle_core::Device;

    fn logits() -> (Tensor, Tensor) {
        let predictions = Tensor::new(&[[2.0f32, 0.0], [0.0, 1.0]], &Device::Cpu).unwrap();
        let targets = Tensor::new(&[0u32, 1], &Device::Cpu).unwrap();
        (predictions, targets)
    }

    fn scalar(t: Tensor) -> f64 {
        t.to_dtype(DType::F64).unwrap().to_scalar::<f64>().unwrap()
    }

    #[test]
    fn test_cross_entropy_matches_closed_form() {
        let (predictions, targets) = logits();
        let loss = scalar(CrossEntropyLoss::new().compute(&predictions, &targets).unwrap());

        let first = (1.0 + (-2.0f64).exp()).ln();
        let second = (1.0 + (-1.0f64).exp()).ln();
        assert_relative_eq!(loss, (first + second) / 2.0, epsilon = 1e-5);
    }

    #[test]
    fn test_smoothing_decays_with_epochs() {
        let schedule = SmoothingSchedule {
            start: 0.1,
            end: 0.0,
            total_epochs: 10,
        };
        assert_relative_eq!(schedule.at(0), 0.1);
        assert_relative_eq!(schedule.at(5), 0.05);
        assert_relative_eq!(schedule.at(10), 0.0);

        let (predictions, targets) = logits();
        let mut loss = CrossEntropyLoss::with_smoothing(schedule);
        let smoothed = scalar(loss.compute(&predictions, &targets).unwrap());
        loss.update_epoch(10);
        let plain = scalar(loss.compute(&predictions, &targets).unwrap());

        // Confident correct predictions are penalised by smoothing
        assert!(smoothed > plain);
        assert_relative_eq!(
            plain,
            scalar(CrossEntropyLoss::new().compute(&predictions, &targets).unwrap()),
            epsilon = 1e-6
        );
    }

    #[test]
    fn test_rejects_mismatched_targets() {
        let (predictions, _) = logits();
        let targets = Tensor::new(&[0u32, 1, 1], &Device::Cpu).unwrap();
        assert!(CrossEntropyLoss::new().compute(&predictions, &targets).is_err());
    }
}
