//! Loss functions.

use crate::error::{Result, TrainError};
use crate::nn::tensor::Tensor;

/// A differentiable scalar loss over `(output, target)`.
pub trait Loss<O, T>: Send + Sync {
    fn value(&self, output: &O, target: &T) -> Result<f64>;

    /// dLoss/dOutput, shaped like `output`.
    fn gradient(&self, output: &O, target: &T) -> Result<O>;
}

/// Mean squared error over every element.
#[derive(Debug, Clone, Copy, Default)]
pub struct MseLoss;

impl Loss<Tensor, Tensor> for MseLoss {
    fn value(&self, output: &Tensor, target: &Tensor) -> Result<f64> {
        output.expect_shape(target, "mse loss")?;
        if output.is_empty() {
            return Err(TrainError::compute("mse loss over an empty batch"));
        }
        let sum: f64 = output
            .data()
            .iter()
            .zip(target.data())
            .map(|(o, t)| (o - t).powi(2))
            .sum();
        Ok(sum / output.len() as f64)
    }

    fn gradient(&self, output: &Tensor, target: &Tensor) -> Result<Tensor> {
        output.expect_shape(target, "mse gradient")?;
        let n = output.len().max(1) as f64;
        let data = output
            .data()
            .iter()
            .zip(target.data())
            .map(|(o, t)| 2.0 * (o - t) / n)
            .collect();
        Tensor::new(output.shape().to_vec(), data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mse_value_and_gradient() {
        let o = Tensor::new(vec![2, 1], vec![1.0, 3.0]).unwrap();
        let t = Tensor::new(vec![2, 1], vec![0.0, 1.0]).unwrap();
        assert_eq!(MseLoss.value(&o, &t).unwrap(), 2.5);
        assert_eq!(MseLoss.gradient(&o, &t).unwrap().data(), &[1.0, 2.0]);
    }

    #[test]
    fn test_mse_shape_mismatch_is_compute_error() {
        let o = Tensor::zeros(vec![2, 1]);
        let t = Tensor::zeros(vec![3, 1]);
        assert!(matches!(MseLoss.value(&o, &t), Err(TrainError::Compute(_))));
    }
}
