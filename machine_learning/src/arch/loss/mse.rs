use ndarray::{ArrayD, ArrayViewD};

use super::LossFn;
use crate::{MlErr, Result};

/// Mean squared error loss function, averaged over every element.
#[derive(Default, Clone, Copy)]
pub struct Mse;

impl Mse {
    /// Returns a new `Mse`.
    pub fn new() -> Self {
        Self
    }

    fn check_shapes(y_pred: &ArrayViewD<f32>, y: &ArrayViewD<f32>) -> Result<()> {
        if y_pred.shape() != y.shape() {
            return Err(MlErr::InvalidShape {
                layer: "mse",
                got: y_pred.shape().to_vec(),
            });
        }

        Ok(())
    }
}

impl LossFn for Mse {
    fn loss(&self, y_pred: ArrayViewD<f32>, y: ArrayViewD<f32>) -> Result<f32> {
        Self::check_shapes(&y_pred, &y)?;

        let loss = (&y_pred - &y)
            .mapv(|x| x.powi(2))
            .mean()
            .unwrap_or_default();

        Ok(loss)
    }

    fn loss_prime(&self, y_pred: ArrayViewD<f32>, y: ArrayViewD<f32>) -> Result<ArrayD<f32>> {
        Self::check_shapes(&y_pred, &y)?;
        Ok((&y_pred - &y) * (2.0 / y_pred.len().max(1) as f32))
    }
}
