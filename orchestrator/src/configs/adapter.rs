use std::time::Duration;

use comms::specs::machine_learning::OptimizerSpec;
use machine_learning::zoo::NetConfig;
use rpc::RpcBackendOptions;

use super::RunConfig;

/// Turns a run config into the specs the other crates take.
pub struct Adapter;

impl Adapter {
    pub fn new() -> Self {
        Self
    }

    pub fn net_config(&self, config: &RunConfig) -> NetConfig {
        NetConfig {
            image_size: config.image_size,
            num_classes: config.num_classes,
            hidden_features: config.hidden_features,
            dropout: config.dropout,
            seed: config.seed,
        }
    }

    /// Plain gradient descent unless a momentum is configured.
    pub fn optimizer_spec(&self, config: &RunConfig) -> OptimizerSpec {
        let learning_rate = config.learning_rate;

        if config.momentum > 0.0 {
            OptimizerSpec::GradientDescentWithMomentum {
                learning_rate,
                momentum: config.momentum,
            }
        } else {
            OptimizerSpec::GradientDescent { learning_rate }
        }
    }

    pub fn rpc_options(&self, config: &RunConfig) -> RpcBackendOptions {
        RpcBackendOptions {
            num_worker_threads: config.num_worker_threads,
            rpc_timeout: Duration::from_secs(config.rpc_timeout_secs),
            init_timeout: Duration::from_secs(config.init_timeout_secs),
            ..RpcBackendOptions::new(format!("{}:{}", config.master_addr, config.master_port))
        }
    }
}

impl Default for Adapter {
    fn default() -> Self {
        Self::new()
    }
}
