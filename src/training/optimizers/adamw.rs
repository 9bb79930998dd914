//! AdamW optimizer implementation
//!
//! Adam with decoupled weight decay, applied directly to the variables of a
//! `VarMap`.

use std::collections::{BTreeMap, HashMap};

use candle_core::backprop::GradStore;
use candle_core::{Tensor, Var};
use candle_nn::VarMap;

use super::{restore_buffer, sorted_vars, Optimizer, OptimizerStateDict};
use crate::error::Result;
use crate::training::checkpoints::TensorState;

/// AdamW optimizer with decoupled weight decay
pub struct AdamWOptimizer {
    /// Variables being optimized, sorted by name
    vars: Vec<(String, Var)>,

    /// Learning rate
    learning_rate: f64,

    /// Beta1 parameter (momentum)
    beta1: f64,

    /// Beta2 parameter (RMSprop)
    beta2: f64,

    /// Epsilon for numerical stability
    epsilon: f64,

    /// Weight decay coefficient
    weight_decay: f64,

    /// Current step count
    step_count: usize,

    /// First moment estimates
    momentum: HashMap<String, Tensor>,

    /// Second moment estimates
    variance: HashMap<String, Tensor>,
}

impl AdamWOptimizer {
    /// Create a new AdamW optimizer
    pub fn new(
        var_map: &VarMap,
        learning_rate: f64,
        beta1: f64,
        beta2: f64,
        epsilon: f64,
        weight_decay: f64,
    ) -> Result<Self> {
        Ok(Self {
            vars: sorted_vars(var_map)?,
            learning_rate,
            beta1,
            beta2,
            epsilon,
            weight_decay,
            step_count: 0,
            momentum: HashMap::new(),
            variance: HashMap::new(),
        })
    }

    /// Apply AdamW update to one variable
    fn update_parameter(&mut self, name: &str, var: &Var, grad: &Tensor) -> Result<()> {
        let (m_prev, v_prev) = match (self.momentum.get(name), self.variance.get(name)) {
            (Some(m), Some(v)) => (m.clone(), v.clone()),
            _ => (grad.zeros_like()?, grad.zeros_like()?),
        };

        // m_t = β₁ m_{t-1} + (1 - β₁) g_t
        let m = m_prev
            .affine(self.beta1, 0.0)?
            .add(&grad.affine(1.0 - self.beta1, 0.0)?)?;
        // v_t = β₂ v_{t-1} + (1 - β₂) g_t²
        let v = v_prev
            .affine(self.beta2, 0.0)?
            .add(&grad.sqr()?.affine(1.0 - self.beta2, 0.0)?)?;

        let t = self.step_count as i32;
        let bias_correction1 = 1.0 - self.beta1.powi(t);
        let bias_correction2 = 1.0 - self.beta2.powi(t);

        let m_hat = m.affine(1.0 / bias_correction1, 0.0)?;
        let denom = v
            .affine(1.0 / bias_correction2, 0.0)?
            .sqrt()?
            .affine(1.0, self.epsilon)?;
        let update = m_hat.div(&denom)?.affine(self.learning_rate, 0.0)?;

        // θ_t = θ_{t-1} (1 - lr λ) - lr m̂_t / (√v̂_t + ε)
        let decayed = var
            .as_tensor()
            .affine(1.0 - self.learning_rate * self.weight_decay, 0.0)?;
        var.set(&decayed.sub(&update)?)?;

        self.momentum.insert(name.to_string(), m);
        self.variance.insert(name.to_string(), v);
        Ok(())
    }
}

impl Optimizer for AdamWOptimizer {
    fn name(&self) -> &str {
        "adamw"
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
        for (name, tensor) in &self.momentum {
            state.insert(format!("{}.exp_avg", name), TensorState::from_tensor(tensor)?);
        }
        for (name, tensor) in &self.variance {
            state.insert(format!("{}.exp_avg_sq", name), TensorState::from_tensor(tensor)?);
        }

        let hyperparameters = BTreeMap::from([
            ("beta1".to_string(), self.beta1),
            ("beta2".to_string(), self.beta2),
            ("epsilon".to_string(), self.epsilon),
            ("weight_decay".to_string(), self.weight_decay),
        ]);

        Ok(OptimizerStateDict {
            optimizer_type: self.name().to_string(),
            step_count: self.step_count,
            learning_rate: self.learning_rate,
            state,
            hyperparameters,
        })
    }

    fn load_state_dict(&mut self, state_dict: OptimizerStateDict) -> Result<()> {
        state_dict.check_type(self.name())?;
        self.step_count = state_dict.step_count;
        self.learning_rate = state_dict.learning_rate;

        if let Some(&beta1) = state_dict.hyperparameters.get("beta1") {
            self.beta1 = beta1;
        }
        if let Some(&beta2) = state_dict.hyperparameters.get("beta2") {
            self.beta2 = beta2;
        }
        if let Some(&epsilon) = state_dict.hyperparameters.get("epsilon") {
            self.epsilon = epsilon;
        }
        if let Some(&weight_decay) = state_dict.hyperparameters.get("weight_decay") {
            self.weight_decay = weight_decay;
        }

        self.momentum.clear();
        self.variance.clear();
        for (name, var) in &self.vars {
            let m = state_dict.state.get(&format!("{}.exp_avg", name));
            let v = state_dict.state.get(&format!("{}.exp_avg_sq", name));
            if let (Some(m), Some(v)) = (m, v) {
                self.momentum.insert(name.clone(), restore_buffer(m, var)?);
                self.variance.insert(name.clone(), restore_buffer(v, var)?);
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
