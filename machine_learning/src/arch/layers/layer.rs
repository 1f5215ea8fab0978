use ndarray::{Array2, Array4, ArrayD, Ix2, Ix4};
use rand::rngs::StdRng;

use super::{Conv2d, Dropout, Flatten, Linear, MaxPool2d, Relu};
use crate::{MlErr, Result};

/// A layer of a stage module.
#[derive(Debug, Clone)]
pub enum Layer {
    Conv2d(Conv2d),
    Relu(Relu),
    MaxPool2d(MaxPool2d),
    Dropout(Dropout),
    Flatten(Flatten),
    Linear(Linear),
}

/// What a layer keeps from a forward pass to be able to go backward.
///
/// Every forward call produces its own cache, so several calls may be in flight before
/// their backward passes arrive.
#[derive(Debug)]
pub enum LayerCache {
    Conv2d { x: Array4<f32> },
    Relu { y: ArrayD<f32> },
    MaxPool2d {
        argmax: Array4<usize>,
        input_dim: (usize, usize, usize, usize),
    },
    Dropout { mask: Option<ArrayD<f32>> },
    Flatten { input_shape: Vec<usize> },
    Linear { x: Array2<f32> },
}

impl Layer {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Conv2d(_) => "conv2d",
            Self::Relu(_) => "relu",
            Self::MaxPool2d(_) => "max_pool2d",
            Self::Dropout(_) => "dropout",
            Self::Flatten(_) => "flatten",
            Self::Linear(_) => "linear",
        }
    }

    /// Returns the amount of parameters of this layer.
    pub fn size(&self) -> usize {
        match self {
            Self::Conv2d(l) => l.size(),
            Self::Linear(l) => l.size(),
            _ => 0,
        }
    }

    /// Returns the size of every parameter tensor of this layer, in storage order.
    pub fn param_sizes(&self) -> Vec<usize> {
        match self {
            Self::Conv2d(l) => l.param_sizes().to_vec(),
            Self::Linear(l) => l.param_sizes().to_vec(),
            _ => Vec::new(),
        }
    }

    /// Infers the per sample output shape from the per sample input shape.
    pub fn output_shape(&self, input: &[usize]) -> Result<Vec<usize>> {
        match self {
            Self::Conv2d(l) => l.output_shape(input),
            Self::MaxPool2d(l) => l.output_shape(input),
            Self::Flatten(l) => l.output_shape(input),
            Self::Linear(l) => l.output_shape(input),
            Self::Relu(_) | Self::Dropout(_) => Ok(input.to_vec()),
        }
    }

    /// Makes the forward pass of a batch.
    ///
    /// # Arguments
    /// * `params` - This layer's slice of parameters.
    /// * `x` - The input batch.
    /// * `training` - Whether dropout is active.
    /// * `rng` - The source of randomness for dropout masks.
    ///
    /// # Returns
    /// The output of the layer and the cache needed by `backward`.
    pub fn forward(
        &self,
        params: &[f32],
        x: ArrayD<f32>,
        training: bool,
        rng: &mut StdRng,
    ) -> Result<(ArrayD<f32>, LayerCache)> {
        let out = match self {
            Self::Conv2d(l) => {
                let x = self.expect_dim::<Ix4>(x)?;
                let y = l.forward(params, x.view())?;
                (y.into_dyn(), LayerCache::Conv2d { x })
            }
            Self::Relu(l) => {
                let y = l.forward(x);
                (y.clone(), LayerCache::Relu { y })
            }
            Self::MaxPool2d(l) => {
                let x = self.expect_dim::<Ix4>(x)?;
                let (y, argmax) = l.forward(x.view())?;
                let input_dim = x.dim();
                (y.into_dyn(), LayerCache::MaxPool2d { argmax, input_dim })
            }
            Self::Dropout(l) => {
                let (y, mask) = l.forward(x, training, rng);
                (y, LayerCache::Dropout { mask })
            }
            Self::Flatten(l) => {
                let input_shape = x.shape().to_vec();
                (l.forward(x)?, LayerCache::Flatten { input_shape })
            }
            Self::Linear(l) => {
                let x = self.expect_dim::<Ix2>(x)?;
                let y = l.forward(params, x.view())?;
                (y.into_dyn(), LayerCache::Linear { x })
            }
        };

        Ok(out)
    }

    /// Makes the backward pass of a batch.
    ///
    /// # Arguments
    /// * `params` - This layer's slice of parameters.
    /// * `grad` - This layer's slice of the gradient, overwritten.
    /// * `cache` - The cache returned by the matching `forward` call.
    /// * `d` - The gradient of the loss with respect to this layer's output.
    /// * `need_dx` - Whether the gradient with respect to the input has to be computed.
    ///
    /// # Returns
    /// The gradient with respect to the input, `None` if it was not needed by a
    /// parameterized layer.
    pub fn backward(
        &self,
        params: &[f32],
        grad: &mut [f32],
        cache: LayerCache,
        d: ArrayD<f32>,
        need_dx: bool,
    ) -> Result<Option<ArrayD<f32>>> {
        let dx = match (self, cache) {
            (Self::Conv2d(l), LayerCache::Conv2d { x }) => {
                let d = self.expect_dim::<Ix4>(d)?;
                l.backward(params, grad, x.view(), d, need_dx)?
                    .map(|dx| dx.into_dyn())
            }
            (Self::Relu(l), LayerCache::Relu { y }) => Some(l.backward(&y, d)?),
            (Self::MaxPool2d(l), LayerCache::MaxPool2d { argmax, input_dim }) => {
                let d = self.expect_dim::<Ix4>(d)?;
                Some(l.backward(&argmax, input_dim, d)?.into_dyn())
            }
            (Self::Dropout(l), LayerCache::Dropout { mask }) => {
                Some(l.backward(mask.as_ref(), d)?)
            }
            (Self::Flatten(l), LayerCache::Flatten { input_shape }) => {
                Some(l.backward(&input_shape, d)?)
            }
            (Self::Linear(l), LayerCache::Linear { x }) => {
                let d = self.expect_dim::<Ix2>(d)?;
                l.backward(params, grad, x.view(), d.view(), need_dx)?
                    .map(|dx| dx.into_dyn())
            }
            _ => return Err(MlErr::MissingCache { layer: self.name() }),
        };

        Ok(dx)
    }

    fn expect_dim<D: ndarray::Dimension>(
        &self,
        x: ArrayD<f32>,
    ) -> Result<ndarray::Array<f32, D>> {
        let got = x.shape().to_vec();
        x.into_dimensionality::<D>().map_err(|_| MlErr::InvalidShape {
            layer: self.name(),
            got,
        })
    }
}
