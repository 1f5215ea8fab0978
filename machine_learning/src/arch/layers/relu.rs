use ndarray::{ArrayD, Zip};

use crate::{MlErr, Result};

/// The rectified linear unit, `max(0, x)`.
#[derive(Debug, Clone, Copy, Default)]
pub struct Relu;

impl Relu {
    pub fn forward(&self, x: ArrayD<f32>) -> ArrayD<f32> {
        x.mapv_into(|x| x.max(0.0))
    }

    /// Masks `d` with the positive entries of the forward output `y`.
    pub fn backward(&self, y: &ArrayD<f32>, mut d: ArrayD<f32>) -> Result<ArrayD<f32>> {
        if y.shape() != d.shape() {
            return Err(MlErr::InvalidShape {
                layer: "relu",
                got: d.shape().to_vec(),
            });
        }

        Zip::from(&mut d).and(y).par_for_each(|d, &y| {
            if y <= 0.0 {
                *d = 0.0;
            }
        });

        Ok(d)
    }
}
