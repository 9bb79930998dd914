//! Stochastic gradient descent with momentum and weight decay

use std::collections::{BTreeMap, HashMap};

use candle_core::backprop::GradStore;
use candle_core::{Tensor, Var};
use candle_nn::VarMap;

use super::{restore_buffer, sorted_vars, Optimizer, OptimizerStateDict};
use crate::error::Result;
use crate::training::checkpoints::TensorState;

/// SGD optimizer
pub struct SGDOptimizer {
    vars: Vec<(String, Var)>,
    learning_rate: f64,
    momentum: f64,
    weight_decay: f64,
    step_count: usize,
    /// Momentum buffers, created on the first update of each variable
    velocity: HashMap<String, Tensor>,
}

impl SGDOptimizer {
    /// Create a new SGD optimizer
    pub fn new(var_map: &VarMap, learning_rate: f64, momentum: f64, weight_decay: f64) -> Result<Self> {
        Ok(Self {
            vars: sorted_vars(var_map)?,
            learning_rate,
            momentum,
            weight_decay,
            step_count: 0,
            velocity: HashMap::new(),
        })
    }

    fn update_parameter(&mut self, name: &str, var: &Var, grad: &Tensor) -> Result<()> {
        let mut direction = if self.weight_decay > 0.0 {
            grad.add(&var.as_tensor().affine(self.weight_decay, 0.0)?)?
        } else {
            grad.clone()
        };

        if self.momentum > 0.0 {
            let buffer = match self.velocity.get(name) {
                Some(prev) => prev.affine(self.momentum, 0.0)?.add(&direction)?,
                None => direction.clone(),
            };
            self.velocity.insert(name.to_string(), buffer.clone());
            direction = buffer;
        }

        let updated = var
            .as_tensor()
            .sub(&direction.affine(self.learning_rate, 0.0)?)?;
        var.set(&updated)?;
        Ok(())
    }
}

impl Optimizer for SGDOptimizer {
    fn name(&self) -> &str {
        "sgd"
    }

    fn step(&mut self, gradients: &GradStore) -> Result<()> {
        self.step_count += 1;
        let vars = self.vars.clone();
        for (name, var) in &vars {
            if let Some(grad) = gradients.get(var.as_tensor()) {
                self.update_parameter(name, var, grad)?;
            }
        }
        Ok(())
    }

    fn learning_rate(&self) -> f64 {
        self.learning_rate
    }

    fn set_learning_rate(&mut self, lr: f64) {
        self.learning_rate = lr;
    }

    fn state_dict(&self) -> Result<OptimizerStateDict> {
        let mut state = BTreeMap::new();
        for (name, tensor) in &self.velocity {
            state.insert(format!("{}.momentum_buffer", name), TensorState::from_tensor(tensor)?);
        }

        Ok(OptimizerStateDict {
            optimizer_type: self.name().to_string(),
            step_count: self.step_count,
            learning_rate: self.learning_rate,
            state,
            hyperparameters: BTreeMap::from([
                ("momentum".to_string(), self.momentum),
                ("weight_decay".to_string(), self.weight_decay),
            ]),
        })
    }

    fn load_state_dict(&mut self, state_dict: OptimizerStateDict) -> Result<()> {
        state_dict.check_type(self.name())?;
        self.step_count = state_dict.step_count;
        self.learning_rate = state_dict.learning_rate;
        if let Some(&momentum) = state_dict.hyperparameters.get("momentum") {
            self.momentum = momentum;
        }
        if let Some(&weight_decay) = state_dict.hyperparameters.get("weight_decay") {
            self.weight_decay = weight_decay;
        }

        self.velocity.clear();
        for (name, var) in &self.vars {
            if let Some(buffer) = state_dict.state.get(&format!("{}.momentum_buffer", name)) {
                self.velocity.insert(name.clone(), restore_buffer(buffer, var)?);
            }
        }
        Ok(())
    }

    fn parameter_count(&self) -> usize {
        self.vars.len()
    }

    fn step_count(&self) -> usize {
        self.step_count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use candle_core::{DType, Device};
    use candle_nn::{Init, VarBuilder};

    #[test]
    fn test_sgd_plain_step() {
        let var_map = VarMap::new();
        let vb = VarBuilder::from_varmap(&var_map, DType::F32, &Device::Cpu);
        let w = vb.get_with_hints(1, "w", Init::Const(2.0)).unwrap();
        let mut optimizer = SGDOptimizer::new(&var_map, 0.1, 0.0, 0.0).unwrap();

        // d(w²)/dw = 2w = 4
        let grads = w.sqr().unwrap().sum_all().unwrap().backward().unwrap();
        optimizer.step(&grads).unwrap();

        assert_relative_eq!(w.to_vec1::<f32>().unwrap()[0], 1.6, epsilon = 1e-6);
    }

    #[test]
    fn test_sgd_momentum_accumulates() {
        let var_map = VarMap::new();
        let vb = VarBuilder::from_varmap(&var_map, DType::F32, &Device::Cpu);
        let w = vb.get_with_hints(1, "w", Init::Const(0.0)).unwrap();
        let mut optimizer = SGDOptimizer::new(&var_map, 1.0, 0.5, 0.0).unwrap();

        // Constant gradient of 1 from a linear loss
        for _ in 0..2 {
            let grads = w.sum_all().unwrap().backward().unwrap();
            optimizer.step(&grads).unwrap();
        }

        // Buffers: 1.0 then 1.5, total displacement 2.5
        assert_relative_eq!(w.to_vec1::<f32>().unwrap()[0], -2.5, epsilon = 1e-6);

        let dict = optimizer.state_dict().unwrap();
        assert!(dict.state.contains_key("w.momentum_buffer"));
    }
}
