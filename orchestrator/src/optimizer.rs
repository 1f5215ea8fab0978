use std::collections::BTreeMap;

use comms::specs::{
    machine_learning::OptimizerSpec,
    rpc::{Call, GlobalId, ParamRef},
};
use futures::future::try_join_all;
use log::debug;
use rpc::RpcAgent;

use crate::error::Result;

/// An optimizer over parameters living in several processes.
///
/// Each owner holds an optimizer over its own parameters, a step updates all of them
/// with the gradients accumulated within an autograd context.
pub struct DistributedOptimizer {
    agent: RpcAgent,
    /// The remote optimizer id of every owner.
    remotes: BTreeMap<usize, GlobalId>,
}

impl DistributedOptimizer {
    /// Creates the remote optimizers.
    ///
    /// # Arguments
    /// * `agent` - The agent of the master.
    /// * `spec` - The optimizer every owner runs.
    /// * `params` - The parameters to optimize, grouped by owner.
    pub async fn new(agent: RpcAgent, spec: OptimizerSpec, params: Vec<ParamRef>) -> Result<Self> {
        let mut by_owner: BTreeMap<usize, Vec<ParamRef>> = BTreeMap::new();
        for param in params {
            by_owner.entry(param.owner).or_default().push(param);
        }

        let remotes: BTreeMap<_, _> = by_owner
            .keys()
            .map(|&owner| (owner, agent.next_id()))
            .collect();

        let calls = by_owner.into_iter().map(|(owner, params)| {
            debug!(owner = owner, params = params.len(); "creating remote optimizer");
            let call = Call::CreateOptimizer {
                optimizer: remotes[&owner],
                spec,
                params,
            };
            agent.rpc_async(owner, call, None)
        });

        for output in try_join_all(calls).await? {
            output.into_ack()?;
        }

        Ok(Self { agent, remotes })
    }

    /// Updates every parameter with its gradient within `ctx`.
    pub async fn step(&self, ctx: GlobalId) -> Result<()> {
        let calls = self.remotes.iter().map(|(&owner, &optimizer)| {
            self.agent
                .rpc_async(owner, Call::OptimizerStep { optimizer, ctx }, None)
        });

        for output in try_join_all(calls).await? {
            output.into_ack()?;
        }

        Ok(())
    }
}
