use comms::specs::machine_learning::{LayerSpec, ModuleSpec};
use rand::{SeedableRng, rngs::StdRng};

use super::{
    Sequential,
    layers::{Conv2d, Dropout, Flatten, Layer, Linear, MaxPool2d, Relu},
};
use crate::{Result, initialization};

/// Builds stage modules given a specification.
#[derive(Default)]
pub struct ModuleBuilder;

impl ModuleBuilder {
    /// Creates a new `ModuleBuilder`.
    pub fn new() -> Self {
        Self
    }

    /// Builds a new `Sequential` following a spec, with freshly initialized parameters.
    ///
    /// # Arguments
    /// * `spec` - The specification for the module.
    ///
    /// # Returns
    /// The module or an error if its layers don't chain for the declared input shape.
    pub fn build(&self, spec: &ModuleSpec) -> Result<Sequential> {
        match spec {
            ModuleSpec::Sequential {
                name,
                layers,
                input_shape,
                init,
                seed,
            } => {
                let layers = self.resolve_layers(layers)?;
                infer_shape(&layers, input_shape)?;

                let mut rng = match seed {
                    Some(seed) => StdRng::seed_from_u64(*seed),
                    None => StdRng::from_os_rng(),
                };

                let size = layers.iter().map(Layer::size).sum();
                let mut params = vec![0.0; size];
                initialization::init_params(&layers, *init, &mut params, &mut rng)?;

                let dropout_rng = StdRng::from_rng(&mut rng);
                Sequential::new(
                    name.clone(),
                    layers,
                    input_shape.clone(),
                    params,
                    dropout_rng,
                )
            }
        }
    }

    /// Infers the per sample output shape of a module without allocating its parameters.
    pub fn output_shape(&self, spec: &ModuleSpec) -> Result<Vec<usize>> {
        match spec {
            ModuleSpec::Sequential {
                layers,
                input_shape,
                ..
            } => infer_shape(&self.resolve_layers(layers)?, input_shape),
        }
    }

    fn resolve_layers(&self, specs: &[LayerSpec]) -> Result<Vec<Layer>> {
        specs.iter().map(|spec| self.resolve_layer(*spec)).collect()
    }

    fn resolve_layer(&self, spec: LayerSpec) -> Result<Layer> {
        let layer = match spec {
            LayerSpec::Conv2d {
                in_channels,
                out_channels,
                kernel,
                stride,
                padding,
            } => Layer::Conv2d(Conv2d::new(
                in_channels,
                out_channels,
                kernel,
                stride,
                padding,
            )),
            LayerSpec::Relu => Layer::Relu(Relu),
            LayerSpec::MaxPool2d { kernel, stride } => {
                Layer::MaxPool2d(MaxPool2d::new(kernel, stride))
            }
            LayerSpec::Dropout { p } => Layer::Dropout(Dropout::new(p)?),
            LayerSpec::Flatten => Layer::Flatten(Flatten),
            LayerSpec::Linear {
                in_features,
                out_features,
            } => Layer::Linear(Linear::new((in_features, out_features))),
        };

        Ok(layer)
    }
}

fn infer_shape(layers: &[Layer], input_shape: &[usize]) -> Result<Vec<usize>> {
    layers
        .iter()
        .try_fold(input_shape.to_vec(), |shape, layer| layer.output_shape(&shape))
}
