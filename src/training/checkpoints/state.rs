//! Serializable tensor snapshots used inside checkpoint records

use std::collections::BTreeMap;

use candle_core::{DType, Device, Tensor};
use candle_nn::VarMap;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{Error, Result};

/// Flattened tensor contents with their element type
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TensorData {
    F32(Vec<f32>),
    F64(Vec<f64>),
    U32(Vec<u32>),
    I64(Vec<i64>),
    U8(Vec<u8>),
}

/// Half precision source type of data stored widened as `f32`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HalfPrecision {
    F16,
    BF16,
}

impl HalfPrecision {
    fn dtype(self) -> DType {
        match self {
            HalfPrecision::F16 => DType::F16,
            HalfPrecision::BF16 => DType::BF16,
        }
    }
}

/// Host-side copy of a tensor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TensorState {
    /// Tensor shape
    pub shape: Vec<usize>,

    /// Tensor data (flattened, row-major)
    pub data: TensorData,

    /// Set when `data` holds widened half precision values
    pub half: Option<HalfPrecision>,
}

impl TensorState {
    /// Copy a tensor to host memory
    ///
    /// `f16` and `bf16` are stored widened to `f32` and narrowed back by
    /// [`TensorState::to_tensor`]. Other types without a [`TensorData`]
    /// variant come back as `f32`.
    pub fn from_tensor(tensor: &Tensor) -> Result<Self> {
        let shape = tensor.dims().to_vec();
        let flat = tensor.to_device(&Device::Cpu)?.flatten_all()?;
        let half = match flat.dtype() {
            DType::F16 => Some(HalfPrecision::F16),
            DType::BF16 => Some(HalfPrecision::BF16),
            _ => None,
        };
        let data = match flat.dtype() {
            DType::F32 => TensorData::F32(flat.to_vec1()?),
            DType::F64 => TensorData::F64(flat.to_vec1()?),
            DType::U32 => TensorData::U32(flat.to_vec1()?),
            DType::I64 => TensorData::I64(flat.to_vec1()?),
            DType::U8 => TensorData::U8(flat.to_vec1()?),
            _ => TensorData::F32(flat.to_dtype(DType::F32)?.to_vec1()?),
        };
        Ok(Self { shape, data, half })
    }

    /// Rebuild the tensor on `device`
    pub fn to_tensor(&self, device: &Device) -> Result<Tensor> {
        let shape = self.shape.as_slice();
        let tensor = match &self.data {
            TensorData::F32(values) => Tensor::from_vec(values.clone(), shape, device)?,
            TensorData::F64(values) => Tensor::from_vec(values.clone(), shape, device)?,
            TensorData::U32(values) => Tensor::from_vec(values.clone(), shape, device)?,
            TensorData::I64(values) => Tensor::from_vec(values.clone(), shape, device)?,
            TensorData::U8(values) => Tensor::from_vec(values.clone(), shape, device)?,
        };
        match self.half {
            Some(half) => Ok(tensor.to_dtype(half.dtype())?),
            None => Ok(tensor),
        }
    }

    /// Number of elements
    pub fn numel(&self) -> usize {
        self.shape.iter().product()
    }
}

/// Named parameters of a model
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelState {
    /// Parameter name to contents
    pub tensors: BTreeMap<String, TensorState>,
}

impl ModelState {
    /// Snapshot every variable in `var_map`
    pub fn from_var_map(var_map: &VarMap) -> Result<Self> {
        let data = var_map
            .data()
            .lock()
            .map_err(|_| Error::model("parameter map lock poisoned"))?;
        let mut tensors = BTreeMap::new();
        for (name, var) in data.iter() {
            tensors.insert(name.clone(), TensorState::from_tensor(var.as_tensor())?);
        }
        Ok(Self { tensors })
    }

    /// Overwrite the variables of `var_map` in place
    ///
    /// Every variable must have a snapshot of identical shape; snapshot
    /// entries without a matching variable are ignored with a warning.
    pub fn apply_to(&self, var_map: &VarMap) -> Result<()> {
        let data = var_map
            .data()
            .lock()
            .map_err(|_| Error::model("parameter map lock poisoned"))?;

        for (name, var) in data.iter() {
            let state = self
                .tensors
                .get(name)
                .ok_or_else(|| Error::model(format!("checkpoint has no parameter '{}'", name)))?;
            if state.shape != var.dims() {
                return Err(Error::model(format!(
                    "parameter '{}' has shape {:?}, checkpoint has {:?}",
                    name,
                    var.dims(),
                    state.shape
                )));
            }
            let tensor = state.to_tensor(var.device())?.to_dtype(var.dtype())?;
            var.set(&tensor)?;
        }

        for name in self.tensors.keys().filter(|name| !data.contains_key(*name)) {
            warn!("Ignoring checkpoint parameter '{}' absent from the model", name);
        }
        Ok(())
    }

    /// Total number of scalar parameters
    pub fn parameter_count(&self) -> usize {
        self.tensors.values().map(TensorState::numel).sum()
    }
}
