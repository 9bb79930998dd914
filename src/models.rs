//! Reference classifier used by the binary

use std::collections::BTreeMap;

use candle_core::{DType, Device, Module};
use candle_nn::{linear, Linear, VarBuilder, VarMap};

use crate::error::{Error, Result};
use crate::training::config::ModelConfig;
use crate::training::data::Batch;
use crate::training::model::{Model, ModelOutput, PREDICT_KEY};

/// Multi-layer perceptron over flat feature vectors
///
/// Hidden layers use ReLU; the last layer emits one logit per class.
pub struct MlpClassifier {
    layers: Vec<Linear>,
    var_map: VarMap,
    input_key: String,
}

impl MlpClassifier {
    /// Build a classifier for `input_dim` features
    pub fn new(input_dim: usize, config: &ModelConfig, input_key: impl Into<String>, device: &Device) -> Result<Self> {
        if input_dim == 0 || config.num_classes == 0 {
            return Err(Error::model("input_dim and num_classes must be positive"));
        }

        let var_map = VarMap::new();
        let vb = VarBuilder::from_varmap(&var_map, DType::F32, device);

        let mut layers = Vec::with_capacity(config.hidden_dims.len() + 1);
        let mut in_dim = input_dim;
        for (i, &hidden) in config.hidden_dims.iter().enumerate() {
            layers.push(linear(in_dim, hidden, vb.pp(format!("hidden_{}", i)))?);
            in_dim = hidden;
        }
        layers.push(linear(in_dim, config.num_classes, vb.pp("output"))?);

        Ok(Self {
            layers,
            var_map,
            input_key: input_key.into(),
        })
    }

    /// Number of trainable scalars
    pub fn num_parameters(&self) -> usize {
        self.var_map
            .all_vars()
            .iter()
            .map(|var| var.as_tensor().elem_count())
            .sum()
    }
}

impl Model for MlpClassifier {
    fn forward(&self, batch: &Batch, _train: bool) -> Result<ModelOutput> {
        let mut x = batch.get(&self.input_key)?.to_dtype(DType::F32)?.flatten_from(1)?;
        let last = self.layers.len() - 1;
        for (i, layer) in self.layers.iter().enumerate() {
            x = layer.forward(&x)?;
            if i < last {
                x = x.relu()?;
            }
        }
        Ok(BTreeMap::from([(PREDICT_KEY.to_string(), x)]))
    }

    fn var_map(&self) -> &VarMap {
        &self.var_map
    }
}
