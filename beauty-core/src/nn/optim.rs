//! Optimizers.

use crate::error::{Result, TrainError};
use crate::nn::model::Parameter;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Parameter-update rule with serializable internal state.
pub trait Optimizer: Send {
    fn zero_grad(&mut self, params: &mut [Parameter]) {
        params.iter_mut().for_each(Parameter::zero_grad);
    }

    fn step(&mut self, params: &mut [Parameter]) -> Result<()>;

    fn learning_rate(&self) -> f64;

    fn set_learning_rate(&mut self, lr: f64);

    fn state_dict(&self) -> Result<serde_json::Value>;

    fn load_state_dict(&mut self, state: &serde_json::Value) -> Result<()>;
}

/// Stochastic gradient descent with optional momentum and L2 weight decay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sgd {
    learning_rate: f64,
    momentum: f64,
    weight_decay: f64,
    /// Momentum buffers keyed by parameter name.
    velocity: BTreeMap<String, Vec<f64>>,
}

impl Sgd {
    pub fn new(learning_rate: f64) -> Self {
        Self {
            learning_rate,
            momentum: 0.0,
            weight_decay: 0.0,
            velocity: BTreeMap::new(),
        }
    }

    pub fn with_momentum(mut self, momentum: f64) -> Self {
        self.momentum = momentum;
        self
    }

    pub fn with_weight_decay(mut self, weight_decay: f64) -> Self {
        self.weight_decay = weight_decay;
        self
    }
}

impl Optimizer for Sgd {
    fn step(&mut self, params: &mut [Parameter]) -> Result<()> {
        for param in params.iter_mut() {
            let len = param.value.len();
            let mut update: Vec<f64> = param
                .grad
                .data()
                .iter()
                .zip(param.value.data())
                .map(|(g, w)| g + self.weight_decay * w)
                .collect();

            if self.momentum > 0.0 {
                let buf = self
                    .velocity
                    .entry(param.name().to_string())
                    .or_insert_with(|| vec![0.0; len]);
                if buf.len() != len {
                    return Err(TrainError::compute(format!(
                        "momentum buffer for '{}' has {} values, parameter has {len}",
                        param.name(),
                        buf.len()
                    )));
                }
                for (v, u) in buf.iter_mut().zip(update.iter_mut()) {
                    *v = self.momentum * *v + *u;
                    *u = *v;
                }
            }

            for (w, u) in param.value.data_mut().iter_mut().zip(&update) {
                *w -= self.learning_rate * u;
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

    fn state_dict(&self) -> Result<serde_json::Value> {
        Ok(serde_json::to_value(self)?)
    }

    fn load_state_dict(&mut self, state: &serde_json::Value) -> Result<()> {
        *self = Sgd::deserialize(state)
            .map_err(|e| TrainError::corrupt(format!("sgd state: {e}")))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nn::tensor::Tensor;

    fn param(value: f64, grad: f64) -> Parameter {
        let mut p = Parameter::new("w", Tensor::new(vec![1], vec![value]).unwrap());
        p.grad = Tensor::new(vec![1], vec![grad]).unwrap();
        p
    }

    #[test]
    fn test_plain_sgd_step() {
        let mut opt = Sgd::new(0.1);
        let mut params = vec![param(1.0, 2.0)];
        opt.step(&mut params).unwrap();
        assert!((params[0].value.data()[0] - 0.8).abs() < 1e-12);
    }

    #[test]
    fn test_momentum_accumulates() {
        let mut opt = Sgd::new(1.0).with_momentum(0.5);
        let mut params = vec![param(0.0, 1.0)];
        opt.step(&mut params).unwrap(); // v = 1
        opt.step(&mut params).unwrap(); // v = 1.5
        assert!((params[0].value.data()[0] + 2.5).abs() < 1e-12);
    }

    #[test]
    fn test_zero_grad_clears() {
        let mut opt = Sgd::new(0.1);
        let mut params = vec![param(1.0, 2.0)];
        opt.zero_grad(&mut params);
        assert_eq!(params[0].grad.data(), &[0.0]);
    }

    #[test]
    fn test_state_roundtrip_restores_momentum() {
        let mut opt = Sgd::new(0.3).with_momentum(0.9);
        opt.step(&mut [param(0.0, 1.0)]).unwrap();
        let state = opt.state_dict().unwrap();

        let mut restored = Sgd::new(1.0);
        restored.load_state_dict(&state).unwrap();
        assert_eq!(restored, opt);

        let bad = serde_json::json!({"learning_rate": "fast"});
        assert!(matches!(
            restored.load_state_dict(&bad),
            Err(TrainError::CorruptData(_))
        ));
    }
}
