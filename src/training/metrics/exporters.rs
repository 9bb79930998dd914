//! CSV and prediction file exporters

use std::collections::HashMap;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};

use candle_core::{Device, Tensor};
use chrono::Utc;
use tracing::{debug, info};

use super::Metrics;
use crate::error::Result;
use crate::training::config::{SummarizeCsv, TrainingConfig};
use crate::training::data::Split;
use crate::utils::io;

/// Append one record to `path` through a csv writer, writing `header` first
/// when the file is new
fn append_record<I, S>(path: &Path, header: I, record: I) -> Result<()>
where
    I: IntoIterator<Item = S>,
    S: AsRef<[u8]>,
{
    io::ensure_parent_exists(path)?;
    let is_new = !path.exists();
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    let mut writer = csv::WriterBuilder::new().has_headers(false).from_writer(file);
    if is_new {
        writer.write_record(header)?;
    }
    writer.write_record(record)?;
    writer.flush()?;
    Ok(())
}

fn header(leading: &[&str], metrics: &Metrics) -> Vec<String> {
    leading
        .iter()
        .map(|name| name.to_string())
        .chain(metrics.keys().cloned())
        .collect()
}

fn row(leading: Vec<String>, metrics: &Metrics) -> Vec<String> {
    leading
        .into_iter()
        .chain(metrics.values().map(f64::to_string))
        .collect()
}

/// Appends metric rows to the run's CSV files
///
/// - `<predict_dir>/<prefix>.metrics.<split>.csv`: one row per epoch, only
///   with `summarize_csv = all`
/// - `<log_dir>/<group>.<Description>.metrics.csv`: one row per evaluated
///   checkpoint, with `summarize_csv` set to `test` or `all`
/// - `<log_dir>/<group>.best.accuracy.csv`: the best-accuracy record after it
///   is evaluated
///
/// `group` is the run prefix up to its first `-`, so related runs share the
/// summary files.
#[derive(Debug, Clone)]
pub struct MetricsCsv {
    mode: SummarizeCsv,
    prefix: String,
    group: String,
    predict_base: PathBuf,
    log_dir: PathBuf,
}

impl MetricsCsv {
    pub fn from_config(config: &TrainingConfig) -> Self {
        Self {
            mode: config.output.summarize_csv,
            prefix: config.prefix.clone(),
            group: config.run_group().to_string(),
            predict_base: config.predict_base(),
            log_dir: config.output.log_dir.clone(),
        }
    }

    /// Per-epoch file of `split`
    pub fn epoch_path(&self, split: Split) -> PathBuf {
        PathBuf::from(format!("{}.metrics.{}.csv", self.predict_base.display(), split))
    }

    /// Summary file for checkpoint `description`
    pub fn summary_path(&self, description: &str) -> PathBuf {
        self.log_dir.join(format!("{}.{}.metrics.csv", self.group, description))
    }

    /// Best-accuracy record file
    pub fn best_accuracy_path(&self) -> PathBuf {
        self.log_dir.join(format!("{}.best.accuracy.csv", self.group))
    }

    /// Remove per-epoch files left by an earlier run with the same prefix
    pub fn reset_epoch_files(&self) -> Result<()> {
        if self.mode != SummarizeCsv::All {
            return Ok(());
        }
        for split in Split::ALL {
            let path = self.epoch_path(split);
            match std::fs::remove_file(&path) {
                Ok(()) => debug!("Removed stale metrics file {}", path.display()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    /// Append the metrics of `split` after `epoch`
    pub fn write_epoch(&self, split: Split, epoch: usize, metrics: &Metrics) -> Result<()> {
        if self.mode != SummarizeCsv::All {
            return Ok(());
        }
        append_record(
            &self.epoch_path(split),
            header(&["epoch"], metrics),
            row(vec![epoch.to_string()], metrics),
        )
    }

    /// Append an evaluation row for checkpoint `description`
    pub fn write_summary(&self, description: &str, metrics: &Metrics) -> Result<()> {
        if self.mode == SummarizeCsv::None {
            return Ok(());
        }
        append_record(
            &self.summary_path(description),
            header(&["prefix", "timestamp"], metrics),
            row(vec![self.prefix.clone(), Utc::now().to_rfc3339()], metrics),
        )
    }

    /// Append the best-accuracy record
    pub fn write_best_accuracy(&self, epoch: usize, metrics: &Metrics) -> Result<()> {
        let path = self.best_accuracy_path();
        append_record(&path, header(&["epoch"], metrics), row(vec![epoch.to_string()], metrics))?;
        info!("Best accuracy metrics saved to {}", path.display());
        Ok(())
    }
}

/// Write predictions (and targets when known) to a safetensors file
pub fn save_predictions(path: &Path, predictions: &Tensor, targets: Option<&Tensor>) -> Result<()> {
    io::ensure_parent_exists(path)?;
    let mut tensors = HashMap::from([("predict".to_string(), predictions.to_device(&Device::Cpu)?)]);
    if let Some(targets) = targets {
        tensors.insert("targets".to_string(), targets.to_device(&Device::Cpu)?);
    }
    candle_core::safetensors::save(&tensors, path)?;
    info!("Saving predictions to file: {}", path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn exporter(dir: &Path, mode: SummarizeCsv) -> MetricsCsv {
        let mut config = TrainingConfig::default();
        config.prefix = "pelican-3".to_string();
        config.output.predict_dir = dir.join("predict");
        config.output.log_dir = dir.join("log");
        config.output.summarize_csv = mode;
        MetricsCsv::from_config(&config)
    }

    fn metrics(loss: f64) -> Metrics {
        Metrics::from([("accuracy".to_string(), 0.5), ("loss".to_string(), loss)])
    }

    #[test]
    fn test_epoch_rows_only_with_all() {
        let dir = TempDir::new().unwrap();
        let none = exporter(dir.path(), SummarizeCsv::Test);
        none.write_epoch(Split::Valid, 1, &metrics(1.0)).unwrap();
        assert!(!none.epoch_path(Split::Valid).exists());

        let all = exporter(dir.path(), SummarizeCsv::All);
        all.write_epoch(Split::Valid, 1, &metrics(1.0)).unwrap();
        all.write_epoch(Split::Valid, 2, &metrics(0.5)).unwrap();
        let content = std::fs::read_to_string(all.epoch_path(Split::Valid)).unwrap();
        assert_eq!(content, "epoch,accuracy,loss\n1,0.5,1\n2,0.5,0.5\n");

        all.reset_epoch_files().unwrap();
        assert!(!all.epoch_path(Split::Valid).exists());
    }

    #[test]
    fn test_summary_rows_grouped_by_run() {
        let dir = TempDir::new().unwrap();
        let csv = exporter(dir.path(), SummarizeCsv::Test);
        csv.write_summary("Final", &metrics(0.25)).unwrap();
        csv.write_summary("Final", &metrics(0.2)).unwrap();

        let path = dir.path().join("log").join("pelican.Final.metrics.csv");
        assert_eq!(csv.summary_path("Final"), path);
        let content = std::fs::read_to_string(path).unwrap();
        let lines: Vec<_> = content.lines().collect();
        assert_eq!(lines[0], "prefix,timestamp,accuracy,loss");
        assert_eq!(lines.len(), 3);
        assert!(lines[1].starts_with("pelican-3,"));
        assert!(lines[2].ends_with(",0.5,0.2"));
    }

    #[test]
    fn test_summary_quotes_prefix_with_comma() {
        let dir = TempDir::new().unwrap();
        let mut config = TrainingConfig::default();
        config.prefix = "run,lr=0.1".to_string();
        config.output.predict_dir = dir.path().join("predict");
        config.output.log_dir = dir.path().join("log");
        config.output.summarize_csv = SummarizeCsv::Test;
        let exporter = MetricsCsv::from_config(&config);
        exporter.write_summary("Final", &metrics(0.25)).unwrap();
        exporter.write_summary("Final", &metrics(0.2)).unwrap();

        let mut reader = csv::Reader::from_path(exporter.summary_path("Final")).unwrap();
        let headers = reader.headers().unwrap().clone();
        assert_eq!(headers.len(), 4);
        let rows: Vec<csv::StringRecord> = reader.records().map(|r| r.unwrap()).collect();
        assert_eq!(rows.len(), 2);
        for record in &rows {
            assert_eq!(record.len(), headers.len());
            assert_eq!(&record[0], "run,lr=0.1");
        }
        assert_eq!(&rows[1][3], "0.2");
    }

    #[test]
    fn test_best_accuracy_file() {
        let dir = TempDir::new().unwrap();
        let csv = exporter(dir.path(), SummarizeCsv::None);
        csv.write_best_accuracy(5, &metrics(0.3)).unwrap();
        let content = std::fs::read_to_string(csv.best_accuracy_path()).unwrap();
        assert_eq!(content, "epoch,accuracy,loss\n5,0.5,0.3\n");
    }

    #[test]
    fn test_save_predictions() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("out").join("run.final.test.safetensors");
        let predictions = Tensor::new(&[[0.1f32, 0.9]], &Device::Cpu).unwrap();
        let targets = Tensor::new(&[1u32], &Device::Cpu).unwrap();
        save_predictions(&path, &predictions, Some(&targets)).unwrap();

        let loaded = candle_core::safetensors::load(&path, &Device::Cpu).unwrap();
        assert!(loaded.contains_key("predict"));
        assert_eq!(loaded["targets"].to_vec1::<u32>().unwrap(), vec![1]);
    }
}
