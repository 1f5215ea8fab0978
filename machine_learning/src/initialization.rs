use comms::specs::machine_learning::InitSpec;
use rand::Rng;
use rand_distr::{Distribution, Normal, Uniform};

use crate::{MlErr, Result, arch::layers::Layer};

/// A generator of initial parameter values.
#[derive(Debug, Clone, Copy)]
pub enum ParamGen {
    Const(f32),
    Uniform(Uniform<f32>),
    Normal(Normal<f32>),
}

impl ParamGen {
    /// Creates a new uniform generator over `[low, high)`.
    ///
    /// # Returns
    /// An error if the range is invalid (low >= high).
    pub fn uniform(low: f32, high: f32) -> Result<Self> {
        let distribution =
            Uniform::new(low, high).map_err(|e| MlErr::InvalidInit(e.to_string()))?;
        Ok(Self::Uniform(distribution))
    }

    /// Creates a new normal generator.
    ///
    /// # Returns
    /// An error if `std_dev` is not finite (Nan or infinite).
    pub fn normal(mean: f32, std_dev: f32) -> Result<Self> {
        let distribution =
            Normal::new(mean, std_dev).map_err(|e| MlErr::InvalidInit(e.to_string()))?;
        Ok(Self::Normal(distribution))
    }

    /// The `±1/sqrt(fan_in)` uniform generator.
    pub fn fan_in_uniform(fan_in: usize) -> Result<Self> {
        let bound = 1. / (fan_in.max(1) as f32).sqrt();
        Self::uniform(-bound, bound)
    }

    /// Kaiming normal in fan out mode, as used for layers followed by a ReLU.
    pub fn kaiming_fan_out(fan_out: usize) -> Result<Self> {
        let std_dev = (2. / fan_out.max(1) as f32).sqrt();
        Self::normal(0., std_dev)
    }

    /// Fills `out` with samples of this generator.
    pub fn fill<R: Rng>(&self, rng: &mut R, out: &mut [f32]) {
        match self {
            ParamGen::Const(value) => out.fill(*value),
            ParamGen::Uniform(d) => out.iter_mut().for_each(|p| *p = d.sample(rng)),
            ParamGen::Normal(d) => out.iter_mut().for_each(|p| *p = d.sample(rng)),
        }
    }
}

/// Returns one generator per parameter tensor of `layer`, in storage order.
fn layer_gens(layer: &Layer, init: InitSpec) -> Result<Vec<ParamGen>> {
    let gens = match (layer, init) {
        (Layer::Conv2d(l), InitSpec::Default) => {
            let fan_in = l.fans().0;
            vec![ParamGen::fan_in_uniform(fan_in)?; 2]
        }
        (Layer::Linear(l), InitSpec::Default) => {
            let fan_in = l.fans().0;
            vec![ParamGen::fan_in_uniform(fan_in)?; 2]
        }
        (Layer::Conv2d(l), InitSpec::KaimingFanOut) => {
            vec![ParamGen::kaiming_fan_out(l.fans().1)?, ParamGen::Const(0.)]
        }
        (Layer::Linear(_), InitSpec::KaimingFanOut) => {
            vec![ParamGen::normal(0., 0.01)?, ParamGen::Const(0.)]
        }
        _ => Vec::new(),
    };

    Ok(gens)
}

/// Initializes the flat parameter vector of a stack of layers.
///
/// # Arguments
/// * `layers` - The layers that own the parameters, in order.
/// * `init` - The initialization scheme.
/// * `params` - The flat parameters, as long as the sum of the layers' sizes.
/// * `rng` - A random number generator.
///
/// # Returns
/// An error if `params` has the wrong length or a distribution is invalid.
pub fn init_params<R: Rng>(
    layers: &[Layer],
    init: InitSpec,
    params: &mut [f32],
    rng: &mut R,
) -> Result<()> {
    let expected: usize = layers.iter().map(Layer::size).sum();
    if params.len() != expected {
        return Err(MlErr::SizeMismatch {
            what: "initialized parameters",
            got: params.len(),
            expected,
        });
    }

    let mut rest = params;
    for layer in layers {
        for (gen_, size) in layer_gens(layer, init)?.iter().zip(layer.param_sizes()) {
            let (chunk, tail) = rest.split_at_mut(size);
            gen_.fill(rng, chunk);
            rest = tail;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use rand::{SeedableRng, rngs::StdRng};

    use super::*;
    use crate::arch::layers::{Conv2d, Linear, Relu};

    #[test]
    fn default_init_is_bounded_by_fan_in() {
        let layers = [
            Layer::Conv2d(Conv2d::new(2, 3, (3, 3), (1, 1), (0, 0))),
            Layer::Relu(Relu),
            Layer::Linear(Linear::new((8, 4))),
        ];
        let size: usize = layers.iter().map(Layer::size).sum();
        let mut params = vec![f32::NAN; size];

        let mut rng = StdRng::seed_from_u64(1);
        init_params(&layers, InitSpec::Default, &mut params, &mut rng).unwrap();

        let (conv, linear) = params.split_at(layers[0].size());
        let conv_bound = 1. / 18f32.sqrt();
        let linear_bound = 1. / 8f32.sqrt();
        assert!(conv.iter().all(|p| p.abs() <= conv_bound));
        assert!(linear.iter().all(|p| p.abs() <= linear_bound));
    }

    #[test]
    fn kaiming_fan_out_zeroes_biases() {
        let layers = [
            Layer::Conv2d(Conv2d::new(2, 3, (3, 3), (1, 1), (1, 1))),
            Layer::Linear(Linear::new((5, 2))),
        ];
        let size: usize = layers.iter().map(Layer::size).sum();
        let mut params = vec![f32::NAN; size];

        init_params(
            &layers,
            InitSpec::KaimingFanOut,
            &mut params,
            &mut StdRng::seed_from_u64(7),
        )
        .unwrap();

        let conv_bias = &params[54..57];
        let linear_bias = &params[size - 2..];
        assert!(conv_bias.iter().chain(linear_bias).all(|&b| b == 0.));
        assert!(params.iter().all(|p| p.is_finite()));
        assert!(params[..54].iter().any(|&p| p != 0.));
    }

    #[test]
    fn wrong_length_is_rejected() {
        let layers = [Layer::Linear(Linear::new((2, 2)))];
        let mut params = vec![0.; 5];
        let mut rng = StdRng::seed_from_u64(0);
        let err = init_params(&layers, InitSpec::Default, &mut params, &mut rng);
        assert!(matches!(err, Err(MlErr::SizeMismatch { .. })));
    }
}
