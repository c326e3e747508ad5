//! Linear regressor `y = x Wᵀ + b`.

use crate::error::{Result, TrainError};
use crate::nn::model::{Mode, Model, Parameter};
use crate::nn::tensor::Tensor;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

const WEIGHT: usize = 0;
const BIAS: usize = 1;

/// Fully connected layer used as a regression head.
#[derive(Debug, Clone)]
pub struct LinearRegressor {
    in_features: usize,
    out_features: usize,
    params: Vec<Parameter>,
    mode: Mode,
    /// Input of the last training-mode forward.
    cached_input: Option<Tensor>,
}

impl LinearRegressor {
    /// Zero-initialized regressor.
    pub fn new(in_features: usize, out_features: usize) -> Self {
        Self::from_parts(
            in_features,
            out_features,
            Tensor::zeros(vec![out_features, in_features]),
        )
    }

    /// Weights drawn uniformly from `±1/sqrt(in_features)`, bias zeroed.
    pub fn seeded(in_features: usize, out_features: usize, seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let bound = 1.0 / (in_features.max(1) as f64).sqrt();
        let mut weight = Tensor::zeros(vec![out_features, in_features]);
        for w in weight.data_mut() {
            *w = rng.gen_range(-bound..=bound);
        }
        Self::from_parts(in_features, out_features, weight)
    }

    fn from_parts(in_features: usize, out_features: usize, weight: Tensor) -> Self {
        Self {
            in_features,
            out_features,
            params: vec![
                Parameter::new("linear.weight", weight),
                Parameter::new("linear.bias", Tensor::zeros(vec![out_features])),
            ],
            mode: Mode::Train,
            cached_input: None,
        }
    }

    pub fn in_features(&self) -> usize {
        self.in_features
    }

    pub fn out_features(&self) -> usize {
        self.out_features
    }
}

impl Model for LinearRegressor {
    type Input = Tensor;
    type Output = Tensor;

    fn set_mode(&mut self, mode: Mode) {
        self.mode = mode;
        if !mode.is_training() {
            self.cached_input = None;
        }
    }

    fn mode(&self) -> Mode {
        self.mode
    }

    fn forward(&mut self, input: &Tensor) -> Result<Tensor> {
        if input.shape().len() != 2 || input.row_len() != self.in_features {
            return Err(TrainError::compute(format!(
                "linear forward: expected input [batch, {}], got {:?}",
                self.in_features,
                input.shape()
            )));
        }
        let weight = &self.params[WEIGHT].value;
        let bias = self.params[BIAS].value.data();
        let batch = input.rows();

        let mut out = Vec::with_capacity(batch * self.out_features);
        for r in 0..batch {
            let x = input.row(r);
            for o in 0..self.out_features {
                let dot: f64 = weight.row(o).iter().zip(x).map(|(w, x)| w * x).sum();
                out.push(dot + bias[o]);
            }
        }

        if self.mode.is_training() {
            self.cached_input = Some(input.clone());
        }
        Tensor::new(vec![batch, self.out_features], out)
    }

    fn backward(&mut self, grad_output: &Tensor) -> Result<()> {
        if !self.mode.is_training() {
            return Err(TrainError::compute("backward called in eval mode"));
        }
        let input = self
            .cached_input
            .take()
            .ok_or_else(|| TrainError::compute("backward called without a forward pass"))?;
        if grad_output.shape() != [input.rows(), self.out_features].as_slice() {
            return Err(TrainError::compute(format!(
                "linear backward: gradient shape {:?} does not match output [{}, {}]",
                grad_output.shape(),
                input.rows(),
                self.out_features
            )));
        }

        let (weight, bias) = self.params.split_at_mut(BIAS);
        let weight_grad = weight[WEIGHT].grad.data_mut();
        let bias_grad = bias[0].grad.data_mut();
        for r in 0..input.rows() {
            let x = input.row(r);
            let g = grad_output.row(r);
            for (o, &go) in g.iter().enumerate() {
                bias_grad[o] += go;
                let row = &mut weight_grad[o * self.in_features..(o + 1) * self.in_features];
                for (wg, &xi) in row.iter_mut().zip(x) {
                    *wg += go * xi;
                }
            }
        }
        Ok(())
    }

    fn parameters(&self) -> &[Parameter] {
        &self.params
    }

    fn parameters_mut(&mut self) -> &mut [Parameter] {
        &mut self.params
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn model_with(weight: Vec<f64>, bias: f64) -> LinearRegressor {
        let mut model = LinearRegressor::new(weight.len(), 1);
        model.parameters_mut()[WEIGHT].value = Tensor::new(vec![1, weight.len()], weight).unwrap();
        model.parameters_mut()[BIAS].value = Tensor::new(vec![1], vec![bias]).unwrap();
        model
    }

    #[test]
    fn test_forward_computes_affine_map() {
        let mut model = model_with(vec![2.0, -1.0], 0.5);
        let x = Tensor::from_rows(&[vec![1.0, 1.0], vec![3.0, 2.0]]).unwrap();
        let y = model.forward(&x).unwrap();
        assert_eq!(y.shape(), &[2, 1]);
        assert_eq!(y.data(), &[1.5, 4.5]);
    }

    #[test]
    fn test_forward_rejects_wrong_width() {
        let mut model = LinearRegressor::new(3, 1);
        let x = Tensor::zeros(vec![2, 2]);
        assert!(matches!(model.forward(&x), Err(TrainError::Compute(_))));
    }

    #[test]
    fn test_backward_accumulates_gradients() {
        let mut model = model_with(vec![0.0, 0.0], 0.0);
        let x = Tensor::from_rows(&[vec![1.0, 2.0], vec![3.0, 4.0]]).unwrap();
        model.forward(&x).unwrap();
        let g = Tensor::new(vec![2, 1], vec![1.0, 0.5]).unwrap();
        model.backward(&g).unwrap();

        assert_eq!(model.parameters()[WEIGHT].grad.data(), &[2.5, 4.0]);
        assert_eq!(model.parameters()[BIAS].grad.data(), &[1.5]);
    }

    #[test]
    fn test_backward_fails_in_eval_mode() {
        let mut model = LinearRegressor::new(2, 1);
        model.set_mode(Mode::Eval);
        let x = Tensor::zeros(vec![1, 2]);
        let y = model.forward(&x).unwrap();
        assert!(matches!(model.backward(&y), Err(TrainError::Compute(_))));
    }

    #[test]
    fn test_state_dict_roundtrip_and_shape_check() {
        let source = LinearRegressor::seeded(3, 1, 7);
        let mut target = LinearRegressor::new(3, 1);
        target.load_state_dict(&source.state_dict()).unwrap();
        assert_eq!(target.state_dict(), source.state_dict());

        let mut wrong = LinearRegressor::new(4, 1);
        assert!(matches!(
            wrong.load_state_dict(&source.state_dict()),
            Err(TrainError::CorruptData(_))
        ));
    }
}
