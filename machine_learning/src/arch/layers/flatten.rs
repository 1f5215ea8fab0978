use ndarray::{ArrayD, IxDyn};

use crate::{MlErr, Result};

/// Collapses every axis but the batch one.
#[derive(Debug, Clone, Copy, Default)]
pub struct Flatten;

impl Flatten {
    pub fn output_shape(&self, input: &[usize]) -> Result<Vec<usize>> {
        if input.is_empty() {
            return Err(MlErr::InvalidShape {
                layer: "flatten",
                got: input.to_vec(),
            });
        }

        Ok(vec![input.iter().product()])
    }

    pub fn forward(&self, x: ArrayD<f32>) -> Result<ArrayD<f32>> {
        let n = x.shape().first().copied().unwrap_or_default();
        let features = self.output_shape(&x.shape()[1.min(x.ndim())..])?[0];
        Ok(x.into_shape_with_order(IxDyn(&[n, features]))?)
    }

    /// Restores the shape the forward pass received.
    pub fn backward(&self, input_shape: &[usize], d: ArrayD<f32>) -> Result<ArrayD<f32>> {
        Ok(d.into_shape_with_order(IxDyn(input_shape))?)
    }
}
