use std::{fs, path::Path, str::FromStr};

use comms::{MAX_FRAME_LEN, specs::machine_learning::ModuleSpec};
use machine_learning::zoo::{self, Arch, NUM_STAGES};
use serde::{Deserialize, Serialize};

use super::Adapter;
use crate::error::{OrchestratorError, Result};

/// Room left in a frame for everything but the tensor.
const FRAME_HEADROOM: usize = 1 << 16;

/// The environment variable pointing at a JSON run config.
pub const CONFIG_ENV: &str = "PIPELINE_CONFIG";

/// Everything a training run is parameterized by.
///
/// Every field has a default, so a config file only needs the ones it changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    pub arch: Arch,
    pub num_batches: usize,
    pub batch_size: usize,
    /// `(height, width)` of the random input images.
    pub image_size: (usize, usize),
    pub num_classes: usize,
    pub hidden_features: usize,
    pub dropout: f32,
    pub learning_rate: f32,
    /// Zero for plain gradient descent.
    pub momentum: f32,
    /// The launcher runs the whole world once per split size.
    pub split_sizes: Vec<usize>,
    pub world_size: usize,
    pub master_addr: String,
    pub master_port: u16,
    pub num_worker_threads: usize,
    /// Zero disables the call deadline.
    pub rpc_timeout_secs: u64,
    pub init_timeout_secs: u64,
    pub seed: Option<u64>,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            arch: Arch::AlexNet,
            num_batches: 1,
            batch_size: 128,
            image_size: (128, 128),
            num_classes: 1000,
            hidden_features: 4096,
            dropout: 0.5,
            learning_rate: 0.05,
            momentum: 0.0,
            split_sizes: vec![16],
            world_size: 5,
            master_addr: "localhost".into(),
            master_port: 29500,
            num_worker_threads: 256,
            rpc_timeout_secs: 600,
            init_timeout_secs: 60,
            seed: None,
        }
    }
}

impl RunConfig {
    /// Loads the run config of this process.
    ///
    /// Starts from the file `PIPELINE_CONFIG` points at, if any, and applies the
    /// environment overrides on top.
    pub fn load() -> Result<Self> {
        Self::load_with(|key| std::env::var(key).ok())
    }

    /// Same as `load`, reading variables through `var`.
    pub fn load_with<F>(var: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = match var(CONFIG_ENV) {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };

        config.apply_env(var)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads a JSON config file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let raw = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    /// Overrides fields with `ARCH`, `MASTER_ADDR`, `MASTER_PORT` and `WORLD_SIZE`.
    pub fn apply_env<F>(&mut self, var: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(arch) = var("ARCH") {
            self.arch = arch.parse().map_err(OrchestratorError::InvalidConfig)?;
        }
        if let Some(addr) = var("MASTER_ADDR") {
            self.master_addr = addr;
        }
        if let Some(port) = var("MASTER_PORT") {
            self.master_port = parse_var("MASTER_PORT", &port)?;
        }
        if let Some(world_size) = var("WORLD_SIZE") {
            self.world_size = parse_var("WORLD_SIZE", &world_size)?;
        }

        Ok(())
    }

    /// Checks the config can drive a run.
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| Err(OrchestratorError::InvalidConfig(msg));

        if self.world_size <= NUM_STAGES {
            return invalid(format!(
                "world size must be at least {}, one master and {NUM_STAGES} stages, got {}",
                NUM_STAGES + 1,
                self.world_size
            ));
        }
        if self.batch_size == 0 {
            return invalid("batch size must be positive".into());
        }
        if self.split_sizes.is_empty() {
            return invalid("at least one split size is needed".into());
        }
        if let Some(split_size) = self.split_sizes.iter().find(|&&s| s == 0 || s > self.batch_size) {
            return invalid(format!(
                "split size {split_size} must be within 1 and the batch size {}",
                self.batch_size
            ));
        }
        if self.num_classes == 0 || self.hidden_features == 0 {
            return invalid("the classifier needs positive widths".into());
        }
        if !(0.0..1.0).contains(&self.dropout) {
            return invalid(format!("dropout must be within [0, 1), got {}", self.dropout));
        }
        if !self.learning_rate.is_finite() || self.learning_rate <= 0.0 {
            return invalid(format!(
                "learning rate must be positive, got {}",
                self.learning_rate
            ));
        }
        if !(0.0..1.0).contains(&self.momentum) {
            return invalid(format!("momentum must be within [0, 1), got {}", self.momentum));
        }

        self.validate_micro_batches()
    }

    /// Every micro-batch crossing a stage boundary must fit in a single frame.
    fn validate_micro_batches(&self) -> Result<()> {
        let stages = zoo::stages(self.arch, &Adapter::new().net_config(self))
            .map_err(|e| OrchestratorError::InvalidConfig(e.to_string()))?;

        let widest = stages
            .iter()
            .map(|spec| match spec {
                ModuleSpec::Sequential { input_shape, .. } => input_shape.iter().product::<usize>(),
            })
            .max()
            .unwrap_or_default();
        let split_size = self.split_sizes.iter().copied().max().unwrap_or_default();

        let bytes = widest
            .saturating_mul(split_size)
            .saturating_mul(size_of::<f32>());
        if bytes > MAX_FRAME_LEN - FRAME_HEADROOM {
            return Err(OrchestratorError::InvalidConfig(format!(
                "micro-batches of {split_size} need {bytes} bytes frames, the limit is {MAX_FRAME_LEN}"
            )));
        }

        Ok(())
    }
}

/// Parses an environment variable, naming it in the error.
pub fn parse_var<T: FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| OrchestratorError::InvalidConfig(format!("{key}={value:?} is not valid")))
}
