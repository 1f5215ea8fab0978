use std::ops::Range;

use ndarray::ArrayD;
use rand::rngs::StdRng;

use super::layers::{Layer, LayerCache};
use crate::{MlErr, Result};

/// The per call state a `Sequential` needs to go backward through a forward pass.
#[derive(Debug)]
pub struct ForwardCache {
    caches: Vec<LayerCache>,
}

/// A sequential model: information flows forward when computing an output and backward when
/// computing the *deltas* of its layers.
///
/// The parameters of every layer live in a single flat vector, layer after layer.
pub struct Sequential {
    name: String,
    layers: Vec<Layer>,
    input_shape: Vec<usize>,
    offsets: Vec<usize>,
    params: Vec<f32>,
    training: bool,
    rng: StdRng,
}

impl Sequential {
    /// Creates a new `Sequential`.
    ///
    /// # Arguments
    /// * `name` - A name for logs.
    /// * `layers` - The layers the sequential is composed of.
    /// * `input_shape` - The per sample input shape.
    /// * `params` - The flat parameters of every layer.
    /// * `rng` - The random number generator used by dropout.
    ///
    /// # Returns
    /// A new `Sequential` instance or an error if the parameters don't fit the layers.
    pub fn new(
        name: String,
        layers: Vec<Layer>,
        input_shape: Vec<usize>,
        params: Vec<f32>,
        rng: StdRng,
    ) -> Result<Self> {
        let mut offsets = Vec::with_capacity(layers.len() + 1);
        let mut acc = 0;
        offsets.push(acc);
        for layer in &layers {
            acc += layer.size();
            offsets.push(acc);
        }

        if params.len() != acc {
            return Err(MlErr::SizeMismatch {
                what: "sequential parameters",
                got: params.len(),
                expected: acc,
            });
        }

        Ok(Self {
            name,
            layers,
            input_shape,
            offsets,
            params,
            training: true,
            rng,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the amount of parameters of the module.
    pub fn size(&self) -> usize {
        self.params.len()
    }

    pub fn params(&self) -> &[f32] {
        &self.params
    }

    pub fn params_mut(&mut self) -> &mut [f32] {
        &mut self.params
    }

    /// Dropout is the identity outside of training.
    pub fn set_training(&mut self, training: bool) {
        self.training = training;
    }

    /// The per sample input shape.
    pub fn input_shape(&self) -> &[usize] {
        &self.input_shape
    }

    /// Infers the per sample output shape.
    pub fn output_shape(&self) -> Result<Vec<usize>> {
        self.layers
            .iter()
            .try_fold(self.input_shape.clone(), |shape, layer| {
                layer.output_shape(&shape)
            })
    }

    /// The range of every parameter tensor within the flat parameter vector.
    pub fn param_ranges(&self) -> Vec<Range<usize>> {
        let mut ranges = Vec::new();

        for (layer, &offset) in self.layers.iter().zip(&self.offsets) {
            let mut start = offset;
            for size in layer.param_sizes() {
                ranges.push(start..start + size);
                start += size;
            }
        }

        ranges
    }

    fn layer_range(&self, i: usize) -> Range<usize> {
        self.offsets[i]..self.offsets[i + 1]
    }

    /// Makes a forward pass through the network.
    ///
    /// # Arguments
    /// * `x` - The input batch, its first axis is the batch one.
    ///
    /// # Returns
    /// The output batch and the cache needed to go backward, or an error if the input
    /// doesn't have the expected shape.
    pub fn forward(&mut self, x: ArrayD<f32>) -> Result<(ArrayD<f32>, ForwardCache)> {
        if x.ndim() == 0 || x.shape()[1..] != self.input_shape[..] {
            return Err(MlErr::InvalidShape {
                layer: "sequential",
                got: x.shape().to_vec(),
            });
        }

        let mut x = standard(x);
        let mut caches = Vec::with_capacity(self.layers.len());

        for (i, layer) in self.layers.iter().enumerate() {
            let params = &self.params[self.offsets[i]..self.offsets[i + 1]];
            let (y, cache) = layer.forward(params, x, self.training, &mut self.rng)?;
            caches.push(cache);
            x = y;
        }

        Ok((x, ForwardCache { caches }))
    }

    /// Makes a backward pass through the network.
    ///
    /// # Arguments
    /// * `cache` - The cache of the forward pass being differentiated.
    /// * `d` - The gradient of the loss with respect to the output of that pass.
    /// * `grad` - The gradient with respect to the parameters, overwritten.
    /// * `need_input_grad` - Whether the gradient with respect to the input is needed.
    ///
    /// # Returns
    /// The gradient with respect to the input when asked for.
    pub fn backward(
        &self,
        cache: ForwardCache,
        d: ArrayD<f32>,
        grad: &mut [f32],
        need_input_grad: bool,
    ) -> Result<Option<ArrayD<f32>>> {
        if grad.len() != self.size() {
            return Err(MlErr::SizeMismatch {
                what: "sequential gradient",
                got: grad.len(),
                expected: self.size(),
            });
        }

        let nlayers = self.layers.len();
        if cache.caches.len() != nlayers {
            return Err(MlErr::SizeMismatch {
                what: "forward caches",
                got: cache.caches.len(),
                expected: nlayers,
            });
        }

        let mut d = Some(standard(d));

        for (i, (layer, cache)) in self.layers.iter().zip(cache.caches).enumerate().rev() {
            let Some(delta) = d.take() else {
                break;
            };

            let range = self.layer_range(i);
            let params = &self.params[range.clone()];
            let need_dx = i > 0 || need_input_grad;
            d = layer.backward(params, &mut grad[range], cache, delta, need_dx)?;
        }

        Ok(d.filter(|_| need_input_grad))
    }
}

fn standard(x: ArrayD<f32>) -> ArrayD<f32> {
    if x.is_standard_layout() {
        x
    } else {
        x.as_standard_layout().into_owned()
    }
}
