use std::{net::TcpListener, sync::Arc, time::Duration};

use async_trait::async_trait;
use comms::specs::rpc::{Call, GlobalId, ParamRef, RRef};
use ndarray::{ArrayD, IxDyn};
use rpc::{
    NoopHandler, Result, RpcAgent, RpcBackendOptions, RpcErr, RpcHandler, RpcOutput, init_rpc,
    store::StoredValue,
};

/// Doubles the tensor behind the input of a `Forward`, keeping the output when asked to.
struct Doubler;

#[async_trait]
impl RpcHandler for Doubler {
    async fn handle(
        &self,
        agent: &RpcAgent,
        _from: usize,
        call: Call,
        _tensor: Option<ArrayD<f32>>,
    ) -> Result<RpcOutput> {
        match call {
            Call::Forward {
                input, output, ctx, ..
            } => {
                let (x, _) = agent.to_here(&input, ctx).await?;
                let y = x * 2.0;

                match output {
                    Some(id) => {
                        let value = StoredValue {
                            tensor: Arc::new(y),
                            grad_fn: None,
                        };
                        agent.store().fulfill(id, ctx, value);
                        Ok(RpcOutput::ack())
                    }
                    None => Ok(RpcOutput::value(y, None)),
                }
            }
            Call::ParameterRefs { module } => Ok(RpcOutput::params(vec![ParamRef {
                owner: agent.rank(),
                module,
                index: 0,
                len: 3,
            }])),
            Call::ReleaseContext { .. } => Ok(RpcOutput::ack()),
            call => Err(RpcErr::Unsupported(call.kind())),
        }
    }
}

fn free_addr() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().to_string()
}

fn options(master_addr: &str) -> RpcBackendOptions {
    RpcBackendOptions {
        rpc_timeout: Duration::from_secs(10),
        init_timeout: Duration::from_secs(10),
        ..RpcBackendOptions::new(master_addr)
    }
}

async fn world(size: usize) -> Vec<RpcAgent> {
    world_with_threads(size, RpcBackendOptions::DEFAULT_NUM_WORKER_THREADS).await
}

async fn world_with_threads(size: usize, num_worker_threads: usize) -> Vec<RpcAgent> {
    let addr = free_addr();
    let mut joins = Vec::new();

    for rank in 0..size {
        let options = RpcBackendOptions {
            num_worker_threads,
            ..options(&addr)
        };
        joins.push(tokio::spawn(async move {
            let name = if rank == 0 {
                "master".to_string()
            } else {
                format!("worker{rank}")
            };
            let handler: Arc<dyn RpcHandler> = if rank == 0 {
                Arc::new(NoopHandler)
            } else {
                Arc::new(Doubler)
            };
            init_rpc(name, rank, size, options, handler).await
        }));
    }

    let mut agents = Vec::new();
    for join in joins {
        agents.push(join.await.unwrap().unwrap());
    }
    agents
}

async fn shutdown_all(agents: Vec<RpcAgent>) {
    let handles: Vec<_> = agents
        .into_iter()
        .map(|agent| tokio::spawn(async move { agent.shutdown().await }))
        .collect();

    for handle in handles {
        handle.await.unwrap().unwrap();
    }
}

fn forward(input: RRef, output: Option<GlobalId>, ctx: Option<GlobalId>, call: GlobalId) -> Call {
    Call::Forward {
        module: GlobalId(0),
        ctx,
        input,
        output,
        call,
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn rendezvous_assigns_every_rank() {
    let agents = world(3).await;

    for (rank, agent) in agents.iter().enumerate() {
        assert_eq!(agent.rank(), rank);
        assert_eq!(agent.world_size(), 3);
    }

    let master = &agents[0];
    assert_eq!(master.worker_info("worker2").unwrap().rank, 2);
    assert!(matches!(
        master.worker_info("worker9"),
        Err(RpcErr::UnknownWorker(_))
    ));
    assert_ne!(agents[1].next_id(), agents[2].next_id());

    shutdown_all(agents).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn outputs_chain_through_remote_references() {
    let agents = world(3).await;
    let master = agents[0].clone();
    let ctx = master.next_id();

    let x = ArrayD::from_shape_vec(IxDyn(&[2, 2]), vec![1., 2., 3., 4.]).unwrap();
    let input = master.local_rref(x, Some(ctx));

    let (hidden, first) = master.remote(1, None, |id| {
        forward(input, Some(id), Some(ctx), master.next_id())
    });
    assert_eq!(hidden.owner, 1);

    // The second stage may ask for `hidden` before the first one produced it.
    let second = master.rpc_async(2, forward(hidden, None, Some(ctx), master.next_id()), None);

    let (y, _) = second.await.unwrap().into_value().unwrap();
    first.await.unwrap().into_ack().unwrap();
    assert_eq!(y.as_slice().unwrap(), &[4., 8., 12., 16.]);

    shutdown_all(agents).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn early_fetches_do_not_hold_back_their_producer() {
    let agents = world_with_threads(2, 1).await;
    let master = agents[0].clone();

    // Waits on worker1 for a value no call has produced yet.
    let hidden = master.next_id();
    let fetch = master.rpc_async(1, Call::FetchRef { rref: hidden, ctx: None }, None);
    tokio::time::sleep(Duration::from_millis(50)).await;

    let input = master.local_rref(ArrayD::from_elem(IxDyn(&[2]), 1.0), None);
    master
        .rpc_sync(1, forward(input, Some(hidden), None, master.next_id()), None)
        .await
        .unwrap()
        .into_ack()
        .unwrap();

    let (y, _) = fetch.await.unwrap().into_value().unwrap();
    assert_eq!(y.as_slice().unwrap(), &[2., 2.]);
    assert!(agents[1].store().is_empty());

    shutdown_all(agents).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn fetches_of_released_contexts_fail() {
    let agents = world(2).await;
    let master = agents[0].clone();
    let ctx = master.next_id();

    master
        .rpc_sync(1, Call::ReleaseContext { ctx }, None)
        .await
        .unwrap();

    let err = master
        .rpc_sync(1, Call::FetchRef { rref: master.next_id(), ctx: Some(ctx) }, None)
        .await
        .err()
        .unwrap();
    assert!(matches!(err, RpcErr::Remote { from: 1, .. }));
    assert!(agents[1].store().is_empty());

    shutdown_all(agents).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn context_less_tensors_travel_with_the_call() {
    let agents = world(2).await;
    let master = &agents[0];

    let x = ArrayD::from_elem(IxDyn(&[3]), 1.5);
    let input = master.local_rref(x, None);
    let output = master
        .rpc_sync(1, forward(input, None, None, master.next_id()), None)
        .await
        .unwrap();

    let (y, grad_fn) = output.into_value().unwrap();
    assert_eq!(y.as_slice().unwrap(), &[3., 3., 3.]);
    assert!(grad_fn.is_none());
    assert!(master.store().is_empty());

    let params = master
        .rpc_sync(1, Call::ParameterRefs { module: GlobalId(7) }, None)
        .await
        .unwrap()
        .into_params()
        .unwrap();
    assert_eq!(params[0].owner, 1);
    assert_eq!(params[0].module, GlobalId(7));

    shutdown_all(agents).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn handler_errors_reach_the_caller() {
    let agents = world(2).await;
    let master = &agents[0];

    let err = master
        .rpc_sync(
            1,
            Call::OptimizerStep {
                optimizer: GlobalId(1),
                ctx: GlobalId(2),
            },
            None,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, RpcErr::Remote { from: 1, .. }));

    let err = master
        .rpc_sync(0, Call::ParameterRefs { module: GlobalId(1) }, None)
        .await
        .unwrap_err();
    assert!(matches!(err, RpcErr::Unsupported("parameter_refs")));

    shutdown_all(agents).await;
}

#[tokio::test]
async fn rank_outside_the_world_is_rejected() {
    let err = init_rpc("x", 3, 3, options("127.0.0.1:1"), Arc::new(NoopHandler))
        .await
        .err()
        .unwrap();
    assert!(matches!(
        err,
        RpcErr::InvalidRank {
            rank: 3,
            world_size: 3
        }
    ));
}
