use ndarray::ArrayD;
use rand::{Rng, rngs::StdRng};

use crate::{MlErr, Result};

/// Inverted dropout: while training every element is zeroed with probability `p` and the
/// survivors are scaled by `1 / (1 - p)`.
#[derive(Debug, Clone)]
pub struct Dropout {
    p: f32,
}

impl Dropout {
    /// Creates a new `Dropout` layer.
    ///
    /// # Returns
    /// An error if `p` is not within `[0, 1)`.
    pub fn new(p: f32) -> Result<Self> {
        if !(0.0..1.0).contains(&p) {
            return Err(MlErr::InvalidInit(format!(
                "dropout probability must be in [0, 1), got {p}"
            )));
        }

        Ok(Self { p })
    }

    /// Applies the dropout.
    ///
    /// # Returns
    /// The output and the scaled mask that was applied, `None` when the layer acted as the
    /// identity.
    pub fn forward(
        &self,
        x: ArrayD<f32>,
        training: bool,
        rng: &mut StdRng,
    ) -> (ArrayD<f32>, Option<ArrayD<f32>>) {
        if !training || self.p == 0.0 {
            return (x, None);
        }

        let scale = 1.0 / (1.0 - self.p);
        let mask = ArrayD::from_shape_simple_fn(x.raw_dim(), || {
            if rng.random::<f32>() < self.p {
                0.0
            } else {
                scale
            }
        });

        (x * &mask, Some(mask))
    }

    pub fn backward(&self, mask: Option<&ArrayD<f32>>, d: ArrayD<f32>) -> Result<ArrayD<f32>> {
        let Some(mask) = mask else {
            return Ok(d);
        };

        if mask.shape() != d.shape() {
            return Err(MlErr::InvalidShape {
                layer: "dropout",
                got: d.shape().to_vec(),
            });
        }

        Ok(d * mask)
    }
}
