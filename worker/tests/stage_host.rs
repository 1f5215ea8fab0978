use std::{net::TcpListener, sync::Arc, time::Duration};

use comms::specs::{
    machine_learning::{InitSpec, LayerSpec, ModuleSpec, OptimizerSpec},
    rpc::{Call, GlobalId, GradFn, RRef},
};
use machine_learning::{
    arch::{ModuleBuilder, Sequential},
    optimization::{GradientDescent, Optimizer},
};
use ndarray::{ArrayD, IxDyn};
use rpc::{NoopHandler, RpcAgent, RpcBackendOptions, RpcErr, RpcHandler, init_rpc};
use worker::{StageHost, worker_name};

const LEARNING_RATE: f32 = 0.1;

fn free_addr() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().to_string()
}

/// A master and `workers` stage hosts, all in this process.
async fn world(workers: usize) -> Vec<RpcAgent> {
    let addr = free_addr();
    let size = workers + 1;

    let joins: Vec<_> = (0..size)
        .map(|rank| {
            let options = RpcBackendOptions {
                rpc_timeout: Duration::from_secs(30),
                init_timeout: Duration::from_secs(10),
                ..RpcBackendOptions::new(addr.clone())
            };
            let name = if rank == 0 {
                "master".to_string()
            } else {
                worker_name(rank)
            };
            let handler: Arc<dyn RpcHandler> = if rank == 0 {
                Arc::new(NoopHandler)
            } else {
                Arc::new(StageHost::new())
            };
            tokio::spawn(init_rpc(name, rank, size, options, handler))
        })
        .collect();

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

fn stage(name: &str, layers: Vec<LayerSpec>, input: usize, seed: u64) -> ModuleSpec {
    ModuleSpec::Sequential {
        name: name.into(),
        layers,
        input_shape: vec![input],
        init: InitSpec::Default,
        seed: Some(seed),
    }
}

fn specs() -> [ModuleSpec; 2] {
    [
        stage("first", vec![LayerSpec::linear(3, 4), LayerSpec::Relu], 3, 1),
        stage("second", vec![LayerSpec::linear(4, 2)], 4, 2),
    ]
}

fn batch() -> ArrayD<f32> {
    ArrayD::from_shape_vec(IxDyn(&[2, 3]), vec![0.5, -1.0, 2.0, 1.5, 0.25, -0.75]).unwrap()
}

fn assert_all_close(a: &ArrayD<f32>, b: &ArrayD<f32>) {
    assert_eq!(a.shape(), b.shape());
    for (x, y) in a.iter().zip(b) {
        assert!((x - y).abs() <= 1e-5, "{a} vs {b}");
    }
}

async fn construct(master: &RpcAgent, owner: usize, spec: ModuleSpec) -> GlobalId {
    let module = master.next_id();
    master
        .rpc_sync(owner, Call::Construct { module, spec }, None)
        .await
        .unwrap()
        .into_ack()
        .unwrap();
    module
}

/// Runs `x` through the two stages, the first output staying on rank 1.
async fn pipeline(
    master: &RpcAgent,
    modules: [GlobalId; 2],
    ctx: Option<GlobalId>,
    x: ArrayD<f32>,
) -> (ArrayD<f32>, Option<GradFn>) {
    let input = master.local_rref(x, ctx);
    let first_call = master.next_id();
    let (hidden, first) = master.remote(1, None, |output| Call::Forward {
        module: modules[0],
        ctx,
        input,
        output: Some(output),
        call: first_call,
    });

    let second = master.rpc_async(
        2,
        Call::Forward {
            module: modules[1],
            ctx,
            input: hidden,
            output: None,
            call: master.next_id(),
        },
        None,
    );

    let out = second.await.unwrap().into_value().unwrap();
    first.await.unwrap().into_ack().unwrap();
    out
}

fn local_step(net: &mut Sequential, grad: &[f32]) {
    let mut opt = GradientDescent::new(LEARNING_RATE);
    for range in net.param_ranges() {
        opt.update_params(&mut net.params_mut()[range.clone()], &grad[range]);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn two_stages_train_like_a_local_module() {
    let agents = world(2).await;
    let master = agents[0].clone();

    let [spec0, spec1] = specs();
    let mut local0 = ModuleBuilder::new().build(&spec0).unwrap();
    let mut local1 = ModuleBuilder::new().build(&spec1).unwrap();
    let modules = [
        construct(&master, 1, spec0).await,
        construct(&master, 2, spec1).await,
    ];

    let ctx = master.next_id();
    let (y, grad_fn) = pipeline(&master, modules, Some(ctx), batch()).await;

    let (h, cache0) = local0.forward(batch()).unwrap();
    let (expected, cache1) = local1.forward(h).unwrap();
    assert_all_close(&y, &expected);
    assert_eq!(grad_fn.map(|f| f.owner), Some(2));

    let d = y.mapv(|v| v - 1.0);
    master
        .rpc_sync(2, Call::Backward { ctx, call: grad_fn.unwrap().call }, Some(d.clone()))
        .await
        .unwrap()
        .into_ack()
        .unwrap();

    for (rank, module) in [(1, modules[0]), (2, modules[1])] {
        let params = master
            .rpc_sync(rank, Call::ParameterRefs { module }, None)
            .await
            .unwrap()
            .into_params()
            .unwrap();
        assert_eq!(params.len(), 2);
        assert!(params.iter().all(|p| p.owner == rank && p.module == module));

        let optimizer = master.next_id();
        let spec = OptimizerSpec::GradientDescent {
            learning_rate: LEARNING_RATE,
        };
        master
            .rpc_sync(rank, Call::CreateOptimizer { optimizer, spec, params }, None)
            .await
            .unwrap()
            .into_ack()
            .unwrap();
        master
            .rpc_sync(rank, Call::OptimizerStep { optimizer, ctx }, None)
            .await
            .unwrap()
            .into_ack()
            .unwrap();
    }

    let mut grad1 = vec![0.0; local1.size()];
    let dh = local1.backward(cache1, d, &mut grad1, true).unwrap().unwrap();
    let mut grad0 = vec![0.0; local0.size()];
    local0.backward(cache0, dh, &mut grad0, false).unwrap();
    local_step(&mut local0, &grad0);
    local_step(&mut local1, &grad1);

    for rank in 0..3 {
        master
            .rpc_sync(rank, Call::ReleaseContext { ctx }, None)
            .await
            .unwrap()
            .into_ack()
            .unwrap();
    }
    assert!(master.store().is_empty());

    let (y, grad_fn) = pipeline(&master, modules, None, batch()).await;
    let (h, _) = local0.forward(batch()).unwrap();
    let (expected, _) = local1.forward(h).unwrap();
    assert_all_close(&y, &expected);
    assert!(grad_fn.is_none());

    shutdown_all(agents).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn stage_failures_reach_the_master() {
    let agents = world(2).await;
    let master = agents[0].clone();
    let [spec0, spec1] = specs();
    let module = construct(&master, 1, spec0.clone()).await;
    let consumer = construct(&master, 2, spec1).await;

    let err = master
        .rpc_sync(1, Call::Construct { module, spec: spec0 }, None)
        .await
        .unwrap_err();
    assert!(matches!(err, RpcErr::Remote { from: 1, .. }));

    let ctx = master.next_id();
    let err = master
        .rpc_sync(1, Call::Backward { ctx, call: GlobalId(3) }, Some(batch()))
        .await
        .unwrap_err();
    assert!(matches!(err, RpcErr::Remote { detail, .. } if detail.contains("never recorded")));

    // A failed producer poisons its output, so the consumer fails too.
    let input = master.local_rref(batch(), Some(ctx));
    let (hidden, first) = master.remote(1, None, |output| Call::Forward {
        module: GlobalId(12345),
        ctx: Some(ctx),
        input,
        output: Some(output),
        call: GlobalId(1),
    });
    let second = master.rpc_async(
        2,
        Call::Forward {
            module: consumer,
            ctx: Some(ctx),
            input: hidden,
            output: None,
            call: GlobalId(2),
        },
        None,
    );

    assert!(first.await.is_err());
    assert!(second.await.is_err());

    let wrong_shape = ArrayD::zeros(IxDyn(&[2, 5]));
    let input = master.local_rref(wrong_shape, None);
    let err = master
        .rpc_sync(
            1,
            Call::Forward {
                module,
                ctx: None,
                input,
                output: None,
                call: GlobalId(4),
            },
            None,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, RpcErr::Remote { detail, .. } if detail.contains("shape")));

    shutdown_all(agents).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn rrefs_can_be_fetched_from_any_rank() {
    let agents = world(2).await;
    let master = agents[0].clone();
    let worker = agents[2].clone();

    let rref: RRef = master.local_rref(batch(), None);
    let (x, grad_fn) = worker.to_here(&rref, None).await.unwrap();
    assert_eq!(x, batch());
    assert!(grad_fn.is_none());

    shutdown_all(agents).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn dropout_only_applies_within_a_context() {
    let agents = world(1).await;
    let master = agents[0].clone();
    let spec = stage("dropout", vec![LayerSpec::Dropout { p: 0.5 }], 64, 3);
    let module = construct(&master, 1, spec).await;
    let x = ArrayD::from_elem(IxDyn(&[2, 64]), 1.0);

    let forward = |ctx: Option<GlobalId>| {
        let input = master.local_rref(x.clone(), ctx);
        Call::Forward {
            module,
            ctx,
            input,
            output: None,
            call: master.next_id(),
        }
    };

    let (y, _) = master
        .rpc_sync(1, forward(None), None)
        .await
        .unwrap()
        .into_value()
        .unwrap();
    assert_eq!(y, x);

    let ctx = master.next_id();
    let (y, _) = master
        .rpc_sync(1, forward(Some(ctx)), None)
        .await
        .unwrap()
        .into_value()
        .unwrap();
    assert!(y.iter().any(|&v| v == 0.0));

    master
        .rpc_sync(1, Call::ReleaseContext { ctx }, None)
        .await
        .unwrap();
    master.store().release_context(ctx);

    shutdown_all(agents).await;
}
