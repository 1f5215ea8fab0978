use serde::{Deserialize, Serialize};

/// The specification for the `Layer` enum.
///
/// Convolution and pooling tuples are `(height, width)`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LayerSpec {
    Conv2d {
        in_channels: usize,
        out_channels: usize,
        kernel: (usize, usize),
        stride: (usize, usize),
        padding: (usize, usize),
    },
    Relu,
    MaxPool2d {
        kernel: (usize, usize),
        stride: (usize, usize),
    },
    Dropout {
        p: f32,
    },
    Flatten,
    Linear {
        in_features: usize,
        out_features: usize,
    },
}

impl LayerSpec {
    /// A square convolution.
    pub fn conv(
        in_channels: usize,
        out_channels: usize,
        kernel: usize,
        stride: usize,
        padding: usize,
    ) -> Self {
        Self::Conv2d {
            in_channels,
            out_channels,
            kernel: (kernel, kernel),
            stride: (stride, stride),
            padding: (padding, padding),
        }
    }

    /// A square max pooling window.
    pub fn max_pool(kernel: usize, stride: usize) -> Self {
        Self::MaxPool2d {
            kernel: (kernel, kernel),
            stride: (stride, stride),
        }
    }

    pub fn linear(in_features: usize, out_features: usize) -> Self {
        Self::Linear {
            in_features,
            out_features,
        }
    }
}

/// How the parameters of a freshly built module are initialized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InitSpec {
    /// Weights and biases uniform in `±1/sqrt(fan_in)`.
    Default,
    /// Convolution weights normal with std `sqrt(2/fan_out)`, linear weights normal with
    /// std `0.01`, zero biases.
    KaimingFanOut,
}

/// The specification for a module hosted by a stage process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModuleSpec {
    Sequential {
        name: String,
        layers: Vec<LayerSpec>,
        /// The shape of a single sample entering the module, without the batch axis.
        input_shape: Vec<usize>,
        init: InitSpec,
        seed: Option<u64>,
    },
}

impl ModuleSpec {
    /// Returns the module's name.
    pub fn name(&self) -> &str {
        match self {
            ModuleSpec::Sequential { name, .. } => name,
        }
    }
}

/// The specification for the `Optimizer` trait.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OptimizerSpec {
    GradientDescent { learning_rate: f32 },
    GradientDescentWithMomentum { learning_rate: f32, momentum: f32 },
}
