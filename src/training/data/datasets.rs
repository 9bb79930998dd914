//! In-memory tensor datasets

use std::collections::BTreeMap;
use std::path::Path;

use candle_core::{Device, Tensor};
use tracing::info;

use super::{Batch, Dataset, Split};
use crate::error::{Error, Result};

/// Dataset of named tensors sharing their leading (sample) dimension
#[derive(Debug, Clone)]
pub struct TensorDataset {
    tensors: BTreeMap<String, Tensor>,
    len: usize,
}

impl TensorDataset {
    /// Wrap named tensors, checking they agree on the number of samples
    pub fn new(tensors: BTreeMap<String, Tensor>) -> Result<Self> {
        let mut len = None;
        for (name, tensor) in &tensors {
            let rows = *tensor
                .dims()
                .first()
                .ok_or_else(|| Error::data(format!("field '{}' is a scalar", name)))?;
            match len {
                None => len = Some(rows),
                Some(expected) if expected != rows => {
                    return Err(Error::data(format!(
                        "field '{}' has {} samples, expected {}",
                        name, rows, expected
                    )));
                }
                Some(_) => {}
            }
        }
        Ok(Self {
            tensors,
            len: len.unwrap_or(0),
        })
    }

    /// Load every tensor of a safetensors file
    pub fn from_safetensors<P: AsRef<Path>>(path: P, device: &Device) -> Result<Self> {
        let tensors = candle_core::safetensors::load(path.as_ref(), device)?;
        Self::new(tensors.into_iter().collect())
    }

    /// Tensor stored under `name`
    pub fn field(&self, name: &str) -> Option<&Tensor> {
        self.tensors.get(name)
    }
}

impl Dataset for TensorDataset {
    fn len(&self) -> usize {
        self.len
    }

    fn get_batch(&self, indices: &[usize]) -> Result<Batch> {
        if let Some(&bad) = indices.iter().find(|&&i| i >= self.len) {
            return Err(Error::data(format!("sample index {} out of range for {} samples", bad, self.len)));
        }
        let mut fields = BTreeMap::new();
        for (name, tensor) in &self.tensors {
            let index: Vec<u32> = indices.iter().map(|&i| i as u32).collect();
            let index = Tensor::from_vec(index, indices.len(), tensor.device())?;
            fields.insert(name.clone(), tensor.index_select(&index, 0)?);
        }
        Ok(Batch::new(fields))
    }
}

/// Load `<split>.safetensors` files from `dir`
///
/// The train and valid splits are required; test is optional.
pub fn load_splits<P: AsRef<Path>>(dir: P, device: &Device) -> Result<BTreeMap<Split, TensorDataset>> {
    let mut splits = BTreeMap::new();
    for split in Split::ALL {
        let path = dir.as_ref().join(format!("{}.safetensors", split.name()));
        if !path.is_file() {
            if split == Split::Test {
                continue;
            }
            return Err(Error::data(format!("missing {} split at {}", split, path.display())));
        }
        let dataset = TensorDataset::from_safetensors(&path, device)?;
        info!(split = split.name(), samples = dataset.len(), "Loaded {}", path.display());
        splits.insert(split, dataset);
    }
    Ok(splits)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::DType;
    use std::collections::HashMap;
    use tempfile::TempDir;

    fn dataset() -> TensorDataset {
        let x = Tensor::arange(0f32, 8.0, &Device::Cpu).unwrap().reshape((4, 2)).unwrap();
        let y = Tensor::new(&[0u32, 1, 0, 1], &Device::Cpu).unwrap();
        TensorDataset::new(BTreeMap::from([("inputs".to_string(), x), ("targets".to_string(), y)])).unwrap()
    }

    #[test]
    fn test_get_batch_selects_rows() {
        let batch = dataset().get_batch(&[3, 0]).unwrap();
        assert_eq!(
            batch.get("inputs").unwrap().to_vec2::<f32>().unwrap(),
            vec![vec![6.0, 7.0], vec![0.0, 1.0]]
        );
        assert_eq!(batch.get("targets").unwrap().to_vec1::<u32>().unwrap(), vec![1, 0]);
    }

    #[test]
    fn test_rejects_ragged_fields() {
        let x = Tensor::zeros((4, 2), DType::F32, &Device::Cpu).unwrap();
        let y = Tensor::zeros(3, DType::U32, &Device::Cpu).unwrap();
        let result = TensorDataset::new(BTreeMap::from([("x".to_string(), x), ("y".to_string(), y)]));
        assert!(result.is_err());
    }

    #[test]
    fn test_out_of_range_index() {
        assert!(dataset().get_batch(&[4]).is_err());
    }

    #[test]
    fn test_load_splits_requires_train_and_valid() {
        let dir = TempDir::new().unwrap();
        let x = Tensor::zeros((2, 3), DType::F32, &Device::Cpu).unwrap();
        let tensors = HashMap::from([("inputs".to_string(), x)]);
        candle_core::safetensors::save(&tensors, dir.path().join("train.safetensors")).unwrap();
        assert!(load_splits(dir.path(), &Device::Cpu).is_err());

        candle_core::safetensors::save(&tensors, dir.path().join("valid.safetensors")).unwrap();
        let splits = load_splits(dir.path(), &Device::Cpu).unwrap();
        assert_eq!(splits.len(), 2);
        assert_eq!(splits[&Split::Valid].len(), 2);
    }
}
