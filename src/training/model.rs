//! Model interface consumed by the trainer

use std::collections::BTreeMap;

use candle_core::Tensor;
use candle_nn::VarMap;

use crate::error::{Error, Result};
use crate::training::data::Batch;

/// Output key holding the class logits
pub const PREDICT_KEY: &str = "predict";

/// Named model outputs
pub type ModelOutput = BTreeMap<String, Tensor>;

/// Trainable model
///
/// Parameters live in the returned [`VarMap`]; optimizers update them in place
/// and checkpoints snapshot and restore them by name.
pub trait Model: Send + Sync {
    /// Run the model on a batch; the output must contain [`PREDICT_KEY`]
    fn forward(&self, batch: &Batch, train: bool) -> Result<ModelOutput>;

    /// Trainable parameters
    fn var_map(&self) -> &VarMap;
}

/// Fetch the prediction tensor from a model output
pub fn predictions(output: &ModelOutput) -> Result<&Tensor> {
    output
        .get(PREDICT_KEY)
        .ok_or_else(|| Error::model(format!("model output has no '{}' entry", PREDICT_KEY)))
}
