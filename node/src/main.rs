use std::{
    env,
    num::NonZeroUsize,
    process::{Child, Command},
    sync::Arc,
    time::Instant,
};

use anyhow::{Context, bail};
use log::{info, warn};
use orchestrator::{
    configs::{Adapter, RunConfig, parse_var},
    run_master,
};
use rpc::{NoopHandler, init_rpc};
use tokio::{runtime, signal};

fn main() -> anyhow::Result<()> {
    env_logger::init();

    let config = RunConfig::load()?;
    match env::var("RANK") {
        Ok(rank) => run_rank(parse_var("RANK", &rank)?, config),
        Err(_) => launch(&config),
    }
}

/// Runs the whole world once per split size, every rank in a process of its own.
fn launch(config: &RunConfig) -> anyhow::Result<()> {
    let exe = env::current_exe().context("failed to locate the node binary")?;

    for &split_size in &config.split_sizes {
        info!(
            world_size = config.world_size, split_size = split_size;
            "launching {}", config.arch
        );
        let started = Instant::now();

        let children = (0..config.world_size)
            .map(|rank| {
                Command::new(&exe)
                    .env("RANK", rank.to_string())
                    .env("WORLD_SIZE", config.world_size.to_string())
                    .env("SPLIT_SIZE", split_size.to_string())
                    .env("ARCH", config.arch.to_string())
                    .env("MASTER_ADDR", &config.master_addr)
                    .env("MASTER_PORT", config.master_port.to_string())
                    .spawn()
                    .with_context(|| format!("failed to spawn rank {rank}"))
            })
            .collect::<anyhow::Result<Vec<Child>>>()?;

        let mut failed = Vec::new();
        for (rank, mut child) in children.into_iter().enumerate() {
            let status = child.wait()?;
            if !status.success() {
                warn!(rank = rank; "rank exited with {status}");
                failed.push(rank);
            }
        }

        let elapsed = started.elapsed();
        info!(
            split_size = split_size, elapsed_ms = elapsed.as_millis() as u64;
            "execution time = {:.3}s", elapsed.as_secs_f64()
        );

        if !failed.is_empty() {
            bail!("ranks {failed:?} failed with split size {split_size}");
        }
    }

    Ok(())
}

/// Rank 0 goes to core 0, every other rank to core `rank - 1`.
///
/// Runs before the runtime exists, so its threads inherit the affinity.
fn pin_to_core(rank: usize) {
    let core = rank.saturating_sub(1);
    let available = core_affinity::get_core_ids().unwrap_or_default();
    let Some(id) = available.into_iter().find(|id| id.id == core) else {
        warn!(rank = rank, core = core; "core not available, running unpinned");
        return;
    };

    if core_affinity::set_for_current(id) {
        info!(rank = rank, core = core; "set my affinity to core {core}");
    } else {
        warn!(rank = rank, core = core; "failed to set the affinity");
    }
}

/// Joins the world as `rank`: the master trains, the workers host stages.
fn run_rank(rank: usize, config: RunConfig) -> anyhow::Result<()> {
    let split_size = match env::var("SPLIT_SIZE") {
        Ok(split_size) => parse_var("SPLIT_SIZE", &split_size)?,
        Err(_) => config
            .split_sizes
            .first()
            .copied()
            .and_then(NonZeroUsize::new)
            .context("no split size configured")?,
    };

    pin_to_core(rank);

    let runtime = runtime::Builder::new_multi_thread().enable_all().build()?;
    runtime.block_on(async move {
        tokio::select! {
            result = serve(rank, &config, split_size) => result,
            _ = signal::ctrl_c() => {
                warn!(rank = rank; "interrupted");
                Ok(())
            }
        }
    })
}

async fn serve(rank: usize, config: &RunConfig, split_size: NonZeroUsize) -> anyhow::Result<()> {
    let options = Adapter::new().rpc_options(config);

    if rank != 0 {
        worker::run_worker(rank, config.world_size, options).await?;
        return Ok(());
    }

    let agent = init_rpc("master", 0, config.world_size, options, Arc::new(NoopHandler)).await?;
    let result = run_master(agent.clone(), config, split_size).await;
    agent.shutdown().await?;

    let losses = result?;
    info!(batches = losses.len(); "training finished, losses {losses:?}");
    Ok(())
}
