//! Metrics for classifier training
//!
//! [`MetricsFn`] turns predictions and targets into named scalar metrics,
//! [`MetricsAggregator`] smooths minibatch metrics within an epoch and
//! [`MetricsCsv`] appends epoch and evaluation rows to CSV files.

pub mod aggregators;
pub mod exporters;

pub use aggregators::MetricsAggregator;
pub use exporters::{save_predictions, MetricsCsv};

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::PathBuf;

use candle_core::{DType, Tensor, D};

use crate::error::{Error, Result};
use crate::training::checkpoints::{ACCURACY_KEY, LOSS_KEY};
use crate::training::context::LogContext;
use crate::training::loss::Loss;
use crate::utils::io;

/// Named scalar metrics, ordered by name
pub type Metrics = BTreeMap<String, f64>;

/// Render metrics as `name value` pairs
pub fn format_metrics(metrics: &Metrics) -> String {
    let mut line = String::new();
    for (name, value) in metrics {
        let _ = write!(line, " {} {:.4}", name, value);
    }
    line
}

/// Metric computation plugged into the trainer
pub trait MetricsFn: Send + Sync {
    /// Metrics over a full split
    ///
    /// `output_prefix` is the base path for any auxiliary files the metric
    /// wants to write. Returns the metrics and a log line describing them.
    fn compute(
        &self,
        predictions: &Tensor,
        targets: &Tensor,
        loss: &dyn Loss,
        output_prefix: &str,
        ctx: &LogContext,
    ) -> Result<(Metrics, String)>;

    /// Cheap metrics for one training minibatch given its already computed loss
    fn minibatch_metrics(&self, predictions: &Tensor, targets: &Tensor, loss: f64) -> Result<Metrics>;

    /// Progress line fragment for smoothed minibatch metrics
    fn format_minibatch(&self, metrics: &Metrics) -> String {
        format_metrics(metrics)
    }
}

/// Loss and top-1 accuracy for class logits
#[derive(Debug, Clone, Default)]
pub struct ClassifierMetrics {
    write_confusion: bool,
}

impl ClassifierMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Also write `<output_prefix>.confusion.csv` on every full-split evaluation
    pub fn with_confusion_matrix(mut self) -> Self {
        self.write_confusion = true;
        self
    }

    fn predicted_classes(predictions: &Tensor) -> Result<Tensor> {
        Ok(predictions.argmax(D::Minus1)?.to_dtype(DType::U32)?)
    }

    fn accuracy(predictions: &Tensor, targets: &Tensor) -> Result<f64> {
        let count = targets.dims().first().copied().unwrap_or(0);
        if count == 0 {
            return Err(Error::data("cannot compute accuracy of an empty split"));
        }
        let predicted = Self::predicted_classes(predictions)?;
        let correct = predicted
            .eq(&targets.to_dtype(DType::U32)?)?
            .to_dtype(DType::F64)?
            .sum_all()?
            .to_scalar::<f64>()?;
        Ok(correct / count as f64)
    }

    fn write_confusion_matrix(&self, predictions: &Tensor, targets: &Tensor, path: PathBuf) -> Result<()> {
        let classes = predictions.dims2()?.1;
        let predicted = Self::predicted_classes(predictions)?.to_vec1::<u32>()?;
        let actual = targets.to_dtype(DType::U32)?.to_vec1::<u32>()?;

        let mut counts = vec![vec![0usize; classes]; classes];
        for (&p, &t) in predicted.iter().zip(&actual) {
            if let Some(row) = counts.get_mut(t as usize) {
                if let Some(cell) = row.get_mut(p as usize) {
                    *cell += 1;
                }
            }
        }

        let mut csv = String::from("target");
        for class in 0..classes {
            let _ = write!(csv, ",pred_{}", class);
        }
        csv.push('\n');
        for (class, row) in counts.iter().enumerate() {
            let _ = write!(csv, "{}", class);
            for count in row {
                let _ = write!(csv, ",{}", count);
            }
            csv.push('\n');
        }
        io::ensure_parent_exists(&path)?;
        std::fs::write(&path, csv)?;
        Ok(())
    }
}

impl MetricsFn for ClassifierMetrics {
    fn compute(
        &self,
        predictions: &Tensor,
        targets: &Tensor,
        loss: &dyn Loss,
        output_prefix: &str,
        ctx: &LogContext,
    ) -> Result<(Metrics, String)> {
        let loss_value = loss
            .compute(predictions, targets)?
            .to_dtype(DType::F64)?
            .to_scalar::<f64>()?;
        let accuracy = Self::accuracy(predictions, targets)?;

        if self.write_confusion && !output_prefix.is_empty() && ctx.is_primary() {
            let path = PathBuf::from(format!("{}.confusion.csv", output_prefix));
            self.write_confusion_matrix(predictions, targets, path)?;
        }

        let metrics = Metrics::from([
            (LOSS_KEY.to_string(), loss_value),
            (ACCURACY_KEY.to_string(), accuracy),
        ]);
        let line = format!(" Loss: {:10.4}, Accuracy: {:10.4}", loss_value, accuracy);
        Ok((metrics, line))
    }

    fn minibatch_metrics(&self, predictions: &Tensor, targets: &Tensor, loss: f64) -> Result<Metrics> {
        Ok(Metrics::from([
            (LOSS_KEY.to_string(), loss),
            (ACCURACY_KEY.to_string(), Self::accuracy(predictions, targets)?),
        ]))
    }

    fn format_minibatch(&self, metrics: &Metrics) -> String {
        format!(
            "loss {:.4}, acc {:.4}",
            metrics.get(LOSS_KEY).copied().unwrap_or(f64::NAN),
            metrics.get(ACCURACY_KEY).copied().unwrap_or(f64::NAN)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::training::loss::CrossEntropyLoss;
    use approx::assert_relative_eq;
    use candle_core::Device;
    use tempfile::TempDir;

    fn sample() -> (Tensor, Tensor) {
        let predictions = Tensor::new(
            &[[3.0f32, 0.0], [0.0, 3.0], [3.0, 0.0], [0.0, 3.0]],
            &Device::Cpu,
        )
        .unwrap();
        let targets = Tensor::new(&[0u32, 1, 1, 1], &Device::Cpu).unwrap();
        (predictions, targets)
    }

    #[test]
    fn test_accuracy_and_loss() {
        let (predictions, targets) = sample();
        let ctx = LogContext::new("test", 0, true);
        let (metrics, line) = ClassifierMetrics::new()
            .compute(&predictions, &targets, &CrossEntropyLoss::new(), "", &ctx)
            .unwrap();
        assert_relative_eq!(metrics[ACCURACY_KEY], 0.75);
        assert!(metrics[LOSS_KEY] > 0.0);
        assert!(line.contains("Accuracy"));
    }

    #[test]
    fn test_minibatch_metrics_keep_given_loss() {
        let (predictions, targets) = sample();
        let metrics = ClassifierMetrics::new()
            .minibatch_metrics(&predictions, &targets, 0.25)
            .unwrap();
        assert_relative_eq!(metrics[LOSS_KEY], 0.25);
        assert_relative_eq!(metrics[ACCURACY_KEY], 0.75);
        assert_eq!(ClassifierMetrics::new().format_minibatch(&metrics), "loss 0.2500, acc 0.7500");
    }

    #[test]
    fn test_confusion_matrix_file() {
        let dir = TempDir::new().unwrap();
        let prefix = dir.path().join("run.final.test");
        let (predictions, targets) = sample();
        let ctx = LogContext::new("run", 0, true);
        ClassifierMetrics::new()
            .with_confusion_matrix()
            .compute(
                &predictions,
                &targets,
                &CrossEntropyLoss::new(),
                prefix.to_str().unwrap(),
                &ctx,
            )
            .unwrap();

        let csv = std::fs::read_to_string(dir.path().join("run.final.test.confusion.csv")).unwrap();
        assert_eq!(csv, "target,pred_0,pred_1\n0,1,0\n1,1,2\n");
    }

    #[test]
    fn test_empty_split_is_an_error() {
        let predictions = Tensor::zeros((0, 2), DType::F32, &Device::Cpu).unwrap();
        let targets = Tensor::zeros(0, DType::U32, &Device::Cpu).unwrap();
        assert!(ClassifierMetrics::new()
            .minibatch_metrics(&predictions, &targets, 0.0)
            .is_err());
    }

    #[test]
    fn test_format_metrics() {
        let metrics = Metrics::from([("a".to_string(), 1.0), ("b".to_string(), 0.5)]);
        assert_eq!(format_metrics(&metrics), " a 1.0000 b 0.5000");
    }
}
