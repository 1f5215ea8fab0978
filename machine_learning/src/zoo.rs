//! The four stage partitions of the AlexNet and VGG networks.

use std::{fmt, str::FromStr};

use comms::specs::machine_learning::{InitSpec, LayerSpec, ModuleSpec};
use serde::{Deserialize, Serialize};

use crate::{Result, arch::ModuleBuilder};

/// The amount of stages every network is split into.
pub const NUM_STAGES: usize = 4;

/// The networks that can be trained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Arch {
    #[serde(rename = "alexnet")]
    AlexNet,
    Vgg,
}

impl fmt::Display for Arch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Arch::AlexNet => write!(f, "alexnet"),
            Arch::Vgg => write!(f, "vgg"),
        }
    }
}

impl FromStr for Arch {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "alexnet" | "alex_net" => Ok(Arch::AlexNet),
            "vgg" => Ok(Arch::Vgg),
            other => Err(format!("unknown network architecture {other:?}")),
        }
    }
}

/// The knobs of a network that aren't fixed by its partition.
#[derive(Debug, Clone, PartialEq)]
pub struct NetConfig {
    /// `(height, width)` of the input images.
    pub image_size: (usize, usize),
    pub num_classes: usize,
    /// Width of the two hidden classifier layers.
    pub hidden_features: usize,
    pub dropout: f32,
    /// Stage `i` is seeded with `seed + i`.
    pub seed: Option<u64>,
}

impl Default for NetConfig {
    fn default() -> Self {
        Self {
            image_size: (128, 128),
            num_classes: 1000,
            hidden_features: 4096,
            dropout: 0.5,
            seed: None,
        }
    }
}

/// Returns the four stage specs of `arch`.
pub fn stages(arch: Arch, cfg: &NetConfig) -> Result<Vec<ModuleSpec>> {
    match arch {
        Arch::AlexNet => alexnet_stages(cfg),
        Arch::Vgg => vgg_stages(cfg),
    }
}

/// The AlexNet partition.
///
/// The convolutional features are split over the first three stages, the last one holds
/// the classifier.
pub fn alexnet_stages(cfg: &NetConfig) -> Result<Vec<ModuleSpec>> {
    let features = [
        vec![
            LayerSpec::conv(3, 64, 11, 4, 2),
            LayerSpec::Relu,
            LayerSpec::max_pool(3, 2),
        ],
        vec![
            LayerSpec::conv(64, 192, 5, 1, 2),
            LayerSpec::Relu,
            LayerSpec::max_pool(3, 2),
        ],
        vec![
            LayerSpec::conv(192, 384, 3, 1, 1),
            LayerSpec::Relu,
            LayerSpec::conv(384, 256, 3, 1, 1),
            LayerSpec::Relu,
            LayerSpec::conv(256, 256, 3, 1, 1),
        ],
        vec![LayerSpec::Relu, LayerSpec::max_pool(3, 2), LayerSpec::Flatten],
    ];

    let classifier = |in_features: usize| {
        vec![
            LayerSpec::Dropout { p: cfg.dropout },
            LayerSpec::linear(in_features, cfg.hidden_features),
            LayerSpec::Relu,
            LayerSpec::Dropout { p: cfg.dropout },
            LayerSpec::linear(cfg.hidden_features, cfg.hidden_features),
            LayerSpec::Relu,
            LayerSpec::linear(cfg.hidden_features, cfg.num_classes),
        ]
    };

    partition(Arch::AlexNet, InitSpec::Default, cfg, features, classifier)
}

/// The VGG partition, every convolution is 3x3 with stride and padding 1.
pub fn vgg_stages(cfg: &NetConfig) -> Result<Vec<ModuleSpec>> {
    let conv = |i, o| LayerSpec::conv(i, o, 3, 1, 1);
    let pool = || LayerSpec::max_pool(2, 2);

    let features = [
        vec![conv(3, 64), LayerSpec::Relu, conv(64, 64), LayerSpec::Relu],
        vec![
            pool(),
            conv(64, 128),
            LayerSpec::Relu,
            conv(128, 128),
            LayerSpec::Relu,
            pool(),
            conv(128, 256),
            LayerSpec::Relu,
            conv(256, 256),
            LayerSpec::Relu,
        ],
        vec![
            conv(256, 256),
            LayerSpec::Relu,
            pool(),
            conv(256, 512),
            LayerSpec::Relu,
            conv(512, 512),
            LayerSpec::Relu,
            conv(512, 512),
        ],
        vec![
            LayerSpec::Relu,
            pool(),
            conv(512, 512),
            LayerSpec::Relu,
            conv(512, 512),
            LayerSpec::Relu,
            conv(512, 512),
            LayerSpec::Relu,
            pool(),
            LayerSpec::Flatten,
        ],
    ];

    let classifier = |in_features: usize| {
        vec![
            LayerSpec::linear(in_features, cfg.hidden_features),
            LayerSpec::Relu,
            LayerSpec::Dropout { p: cfg.dropout },
            LayerSpec::linear(cfg.hidden_features, cfg.hidden_features),
            LayerSpec::Relu,
            LayerSpec::Dropout { p: cfg.dropout },
            LayerSpec::linear(cfg.hidden_features, cfg.num_classes),
        ]
    };

    partition(Arch::Vgg, InitSpec::KaimingFanOut, cfg, features, classifier)
}

/// Chains the stage inputs through shape inference and appends the classifier, sized after
/// the flattened features, to the last stage.
fn partition<F>(
    arch: Arch,
    init: InitSpec,
    cfg: &NetConfig,
    features: [Vec<LayerSpec>; NUM_STAGES],
    classifier: F,
) -> Result<Vec<ModuleSpec>>
where
    F: FnOnce(usize) -> Vec<LayerSpec>,
{
    let builder = ModuleBuilder::new();
    let (h, w) = cfg.image_size;
    let mut input_shape = vec![3, h, w];
    let mut specs = Vec::with_capacity(NUM_STAGES);

    for (i, layers) in features.into_iter().enumerate() {
        let spec = ModuleSpec::Sequential {
            name: format!("{arch}/stage{i}"),
            layers,
            input_shape: input_shape.clone(),
            init,
            seed: cfg.seed.map(|seed| seed.wrapping_add(i as u64)),
        };

        input_shape = builder.output_shape(&spec)?;
        specs.push(spec);
    }

    let in_features: usize = input_shape.iter().product();
    if let Some(ModuleSpec::Sequential { layers, .. }) = specs.last_mut() {
        layers.extend(classifier(in_features));
    }

    if let Some(last) = specs.last() {
        builder.output_shape(last)?;
    }

    Ok(specs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MlErr;

    fn input_of(spec: &ModuleSpec) -> &[usize] {
        match spec {
            ModuleSpec::Sequential { input_shape, .. } => input_shape,
        }
    }

    fn linear_inputs(spec: &ModuleSpec) -> Vec<usize> {
        match spec {
            ModuleSpec::Sequential { layers, .. } => layers
                .iter()
                .filter_map(|layer| match layer {
                    LayerSpec::Linear { in_features, .. } => Some(*in_features),
                    _ => None,
                })
                .collect(),
        }
    }

    #[test]
    fn alexnet_partition_at_128() {
        let cfg = NetConfig::default();
        let specs = alexnet_stages(&cfg).unwrap();
        let builder = ModuleBuilder::new();

        assert_eq!(specs.len(), NUM_STAGES);
        assert_eq!(input_of(&specs[0]), &[3, 128, 128]);
        assert_eq!(input_of(&specs[1]), &[64, 15, 15]);
        assert_eq!(input_of(&specs[2]), &[192, 7, 7]);
        assert_eq!(input_of(&specs[3]), &[256, 7, 7]);
        assert_eq!(linear_inputs(&specs[3]), [2304, 4096, 4096]);
        assert_eq!(builder.output_shape(&specs[3]).unwrap(), [1000]);
        assert_eq!(specs[2].name(), "alexnet/stage2");
    }

    #[test]
    fn vgg_partition_at_128() {
        let cfg = NetConfig {
            seed: Some(10),
            ..Default::default()
        };
        let specs = vgg_stages(&cfg).unwrap();

        assert_eq!(input_of(&specs[1]), &[64, 128, 128]);
        assert_eq!(input_of(&specs[2]), &[256, 32, 32]);
        assert_eq!(input_of(&specs[3]), &[512, 16, 16]);
        assert_eq!(linear_inputs(&specs[3]), [8192, 4096, 4096]);

        let ModuleSpec::Sequential { seed, init, .. } = &specs[3];
        assert_eq!(*seed, Some(13));
        assert_eq!(*init, InitSpec::KaimingFanOut);
    }

    #[test]
    fn too_small_images_are_rejected() {
        let cfg = NetConfig {
            image_size: (16, 16),
            ..Default::default()
        };
        assert!(matches!(
            alexnet_stages(&cfg),
            Err(MlErr::InvalidShape { .. })
        ));
    }

    #[test]
    fn arch_from_str() {
        assert_eq!("AlexNet".parse::<Arch>().unwrap(), Arch::AlexNet);
        assert_eq!("vgg".parse::<Arch>().unwrap(), Arch::Vgg);
        assert!("resnet".parse::<Arch>().is_err());
    }
}
