use ndarray::{linalg, prelude::*};

use crate::{MlErr, Result};

/// A fully connected layer, `y = x·W + b`.
///
/// The parameters are the weights, laid out as `(in, out)`, followed by the biases.
#[derive(Debug, Clone)]
pub struct Linear {
    dim: (usize, usize),
    size: usize,
}

impl Linear {
    /// Creates a new `Linear` layer.
    ///
    /// # Arguments
    /// * `dim` - The `(in_features, out_features)` of the layer.
    pub fn new(dim: (usize, usize)) -> Self {
        Self {
            dim,
            size: (dim.0 + 1) * dim.1,
        }
    }

    /// Returns the size of this layer.
    ///
    /// # Returns
    /// The amount of parameters this layer has.
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn param_sizes(&self) -> [usize; 2] {
        [self.dim.0 * self.dim.1, self.dim.1]
    }

    pub fn fans(&self) -> (usize, usize) {
        self.dim
    }

    pub fn output_shape(&self, input: &[usize]) -> Result<Vec<usize>> {
        match input {
            &[features] if features == self.dim.0 => Ok(vec![self.dim.1]),
            _ => Err(MlErr::InvalidShape {
                layer: "linear",
                got: input.to_vec(),
            }),
        }
    }

    /// Makes the forward pass of a batch `(n, in)`.
    pub fn forward(&self, params: &[f32], x: ArrayView2<f32>) -> Result<Array2<f32>> {
        self.output_shape(&x.shape()[1..])?;

        let (w, b) = self.view_params(params)?;
        let mut z = Array2::zeros((x.nrows(), self.dim.1));
        linalg::general_mat_mul(1.0, &x, &w, 0.0, &mut z);
        z += &b;

        Ok(z)
    }

    /// Makes the backward pass.
    ///
    /// # Arguments
    /// * `params` - This layer's slice of parameters.
    /// * `grad` - This layer's slice of the gradient, overwritten with the new gradient.
    /// * `x` - The input seen by the matching forward pass.
    /// * `d` - The gradient of the loss with respect to the output.
    /// * `need_dx` - Whether the gradient with respect to the input is needed.
    pub fn backward(
        &self,
        params: &[f32],
        grad: &mut [f32],
        x: ArrayView2<f32>,
        d: ArrayView2<f32>,
        need_dx: bool,
    ) -> Result<Option<Array2<f32>>> {
        if d.dim() != (x.nrows(), self.dim.1) {
            return Err(MlErr::InvalidShape {
                layer: "linear",
                got: d.shape().to_vec(),
            });
        }

        let (mut dw, mut db) = self.view_grad(grad)?;
        linalg::general_mat_mul(1.0, &x.t(), &d, 0.0, &mut dw);
        db.assign(&d.sum_axis(Axis(0)));

        if !need_dx {
            return Ok(None);
        }

        let (w, _) = self.view_params(params)?;
        let mut dx = Array2::zeros((d.nrows(), self.dim.0));
        linalg::general_mat_mul(1.0, &d, &w.t(), 0.0, &mut dx);

        Ok(Some(dx))
    }

    /// Gives a view of the raw gradient slice as the delta weights and delta biases of this layer.
    ///
    /// # Arguments
    /// * `grad` - A gradient slice.
    ///
    /// # Returns
    /// A tuple containing the delta weights and delta biases.
    fn view_grad<'a>(
        &self,
        grad: &'a mut [f32],
    ) -> Result<(ArrayViewMut2<'a, f32>, ArrayViewMut1<'a, f32>)> {
        self.check_len("linear gradient", grad.len())?;
        let w_size = self.size - self.dim.1;
        let (dw_raw, db_raw) = grad.split_at_mut(w_size);
        let dw = ArrayViewMut2::from_shape(self.dim, dw_raw)?;
        let db = ArrayViewMut1::from_shape(self.dim.1, db_raw)?;
        Ok((dw, db))
    }

    /// Gives a view of the raw parameter slice as the weights and biases of this layer.
    ///
    /// # Arguments
    /// * `params` - A slice of parameters.
    ///
    /// # Returns
    /// A tuple containing the weights and biases.
    fn view_params<'a>(
        &self,
        params: &'a [f32],
    ) -> Result<(ArrayView2<'a, f32>, ArrayView1<'a, f32>)> {
        self.check_len("linear parameters", params.len())?;
        let w_size = self.size - self.dim.1;
        let weights = ArrayView2::from_shape(self.dim, &params[..w_size])?;
        let biases = ArrayView1::from_shape(self.dim.1, &params[w_size..])?;
        Ok((weights, biases))
    }

    fn check_len(&self, what: &'static str, got: usize) -> Result<()> {
        if got != self.size {
            return Err(MlErr::SizeMismatch {
                what,
                got,
                expected: self.size,
            });
        }

        Ok(())
    }
}
