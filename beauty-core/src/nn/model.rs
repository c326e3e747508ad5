//! The model contract the runners drive.

use crate::error::{Result, TrainError};
use crate::nn::tensor::Tensor;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Serializable parameter snapshot: parameter name to value.
pub type StateDict = BTreeMap<String, Tensor>;

/// Whether the model tracks gradients and applies stochastic behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    Train,
    Eval,
}

impl Mode {
    pub fn is_training(self) -> bool {
        matches!(self, Mode::Train)
    }
}

/// A named trainable tensor with its accumulated gradient.
#[derive(Debug, Clone, PartialEq)]
pub struct Parameter {
    name: String,
    pub value: Tensor,
    pub grad: Tensor,
}

impl Parameter {
    pub fn new(name: impl Into<String>, value: Tensor) -> Self {
        let grad = Tensor::zeros(value.shape().to_vec());
        Self {
            name: name.into(),
            value,
            grad,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn zero_grad(&mut self) {
        self.grad.fill(0.0);
    }
}

/// A trainable model.
///
/// `forward` in [`Mode::Eval`] must not touch parameters or retain anything
/// needed by `backward`; `backward` accumulates into `Parameter::grad` and
/// fails with a compute error when there is no training-mode forward to
/// differentiate.
pub trait Model {
    type Input;
    type Output;

    fn set_mode(&mut self, mode: Mode);

    fn mode(&self) -> Mode;

    fn forward(&mut self, input: &Self::Input) -> Result<Self::Output>;

    /// Backpropagate `grad_output` (dLoss/dOutput of the last forward).
    fn backward(&mut self, grad_output: &Self::Output) -> Result<()>;

    fn parameters(&self) -> &[Parameter];

    fn parameters_mut(&mut self) -> &mut [Parameter];

    fn state_dict(&self) -> StateDict {
        self.parameters()
            .iter()
            .map(|p| (p.name().to_string(), p.value.clone()))
            .collect()
    }

    fn load_state_dict(&mut self, state: &StateDict) -> Result<()> {
        let params = self.parameters();
        if let Some(extra) = state
            .keys()
            .find(|k| !params.iter().any(|p| p.name() == k.as_str()))
        {
            return Err(TrainError::corrupt(format!(
                "unexpected parameter '{extra}' in state dict"
            )));
        }
        for param in self.parameters_mut() {
            let value = state.get(param.name()).ok_or_else(|| {
                TrainError::corrupt(format!("missing parameter '{}'", param.name()))
            })?;
            if !value.same_shape(&param.value) {
                return Err(TrainError::corrupt(format!(
                    "parameter '{}' has shape {:?}, expected {:?}",
                    param.name(),
                    value.shape(),
                    param.value.shape()
                )));
            }
            param.value = value.clone();
            param.zero_grad();
        }
        Ok(())
    }
}
