// Entry point: wires every collaborator named in spec §1/§4 into a running
// daemon — one `Dispatcher` per queue-backed stage (prepare, post, seed),
// one interval ticker each for the two periodic scans (plan, verify, spec
// §4.5/§4.9), and the status RPC server (spec §7) — then waits for a
// shutdown signal and drains cooperatively (spec §5).

use std::sync::Arc;

use log::{error, info, warn};

use bundler_daemon::config::Config;
use bundler_daemon::core::gateway::HttpGatewayClient;
use bundler_daemon::core::objectstore::{FsObjectStore, ObjectStoreAdapter, S3ObjectStore};
use bundler_daemon::core::queue::{Dispatcher, Queue, QueueTuning, SqsQueue};
use bundler_daemon::core::signer::signer_from_hex;
use bundler_daemon::core::storage::postgres::PgStateStore;
use bundler_daemon::core::storage::StateStore;
use bundler_daemon::core::workers::{self, PostJob, PrepareJob, SeedJob, WorkerContext};
use bundler_daemon::rpc::StatusServer;
use bundler_common::tokio::spawn_task;
use tokio::sync::watch;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::from_env()?;
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&config.log_level)).init();
    info!("bundler daemon starting up");

    let store = Arc::new(PgStateStore::connect(&config.database_url).await?);
    store.migrate().await?;
    let store: Arc<dyn StateStore> = store;

    let object_store: Arc<dyn ObjectStoreAdapter> = match config.object_store_backend.as_str() {
        "s3" => {
            let aws_config = aws_config::load_defaults(aws_config::BehaviorVersion::latest()).await;
            let client = aws_sdk_s3::Client::new(&aws_config);
            Arc::new(S3ObjectStore::new(client, config.data_item_bucket.clone()))
        }
        other => {
            if other != "fs" {
                warn!("unrecognized OBJECT_STORE_BACKEND {other:?}, defaulting to local filesystem");
            }
            Arc::new(FsObjectStore::new(std::path::PathBuf::from(&config.object_store_root)))
        }
    };

    let gateway = Arc::new(HttpGatewayClient::new(
        config.arweave_gateway_url.clone(),
        config.network_request_timeout,
        config.block_height_cache_ttl,
    ));

    let signer = Arc::new(signer_from_hex(&config.wallet_secret_key_hex)?);

    let sqs_config = aws_config::load_defaults(aws_config::BehaviorVersion::latest()).await;
    let sqs_client = aws_sdk_sqs::Client::new(&sqs_config);

    let prepare_queue: Arc<dyn Queue<PrepareJob>> = Arc::new(SqsQueue::new(
        sqs_client.clone(),
        config.prepare_queue_url.clone(),
        PREPARE_TUNING.visibility_timeout,
        |body: &str| {
            serde_json::from_str(body)
                .map_err(|e| bundler_daemon::core::error::BundlerError::Irrecoverable(format!("bad prepare job: {e}")))
        },
        |job: &PrepareJob| {
            serde_json::to_string(job)
                .map_err(|e| bundler_daemon::core::error::BundlerError::Irrecoverable(format!("bad prepare job: {e}")))
        },
    ));
    let post_queue: Arc<dyn Queue<PostJob>> = Arc::new(SqsQueue::new(
        sqs_client.clone(),
        config.post_queue_url.clone(),
        POST_TUNING.visibility_timeout,
        |body: &str| {
            serde_json::from_str(body)
                .map_err(|e| bundler_daemon::core::error::BundlerError::Irrecoverable(format!("bad post job: {e}")))
        },
        |job: &PostJob| {
            serde_json::to_string(job)
                .map_err(|e| bundler_daemon::core::error::BundlerError::Irrecoverable(format!("bad post job: {e}")))
        },
    ));
    let seed_queue: Arc<dyn Queue<SeedJob>> = Arc::new(SqsQueue::new(
        sqs_client.clone(),
        config.seed_queue_url.clone(),
        SEED_TUNING.visibility_timeout,
        |body: &str| {
            serde_json::from_str(body)
                .map_err(|e| bundler_daemon::core::error::BundlerError::Irrecoverable(format!("bad seed job: {e}")))
        },
        |job: &SeedJob| {
            serde_json::to_string(job)
                .map_err(|e| bundler_daemon::core::error::BundlerError::Irrecoverable(format!("bad seed job: {e}")))
        },
    ));

    let config = Arc::new(config);
    let ctx = Arc::new(WorkerContext {
        store: store.clone(),
        object_store,
        gateway,
        signer,
        config: config.clone(),
        prepare_queue: prepare_queue.clone(),
        post_queue: post_queue.clone(),
        seed_queue: seed_queue.clone(),
    });

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let prepare_dispatcher = Arc::new(Dispatcher::new(
        "prepare",
        prepare_queue,
        PREPARE_TUNING,
        PREPARE_CONCURRENCY,
    ));
    let post_dispatcher = Arc::new(Dispatcher::new("post", post_queue, POST_TUNING, POST_CONCURRENCY));
    let seed_dispatcher = Arc::new(Dispatcher::new("seed", seed_queue, SEED_TUNING, SEED_CONCURRENCY));

    let mut tasks = Vec::new();

    {
        let ctx = ctx.clone();
        let dispatcher = prepare_dispatcher.clone();
        let shutdown_rx = shutdown_rx.clone();
        tasks.push(spawn_task("prepare-dispatcher", async move {
            dispatcher.run_forever(workers::prepare::handler(ctx), shutdown_rx).await;
        }));
    }
    {
        let ctx = ctx.clone();
        let dispatcher = post_dispatcher.clone();
        let shutdown_rx = shutdown_rx.clone();
        tasks.push(spawn_task("post-dispatcher", async move {
            dispatcher.run_forever(workers::post::handler(ctx), shutdown_rx).await;
        }));
    }
    {
        let ctx = ctx.clone();
        let dispatcher = seed_dispatcher.clone();
        let shutdown_rx = shutdown_rx.clone();
        tasks.push(spawn_task("seed-dispatcher", async move {
            dispatcher.run_forever(workers::seed::handler(ctx), shutdown_rx).await;
        }));
    }

    // Plan and verify are periodic scans, not queue consumers (spec §4.5,
    // §4.9's "essentially empty message" ticks) — run them on plain
    // intervals instead of through a `Dispatcher`.
    {
        let ctx = ctx.clone();
        let mut shutdown_rx = shutdown_rx.clone();
        let interval = config.plan_tick_interval;
        tasks.push(spawn_task("plan-ticker", async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = workers::plan::run(&ctx, workers::PlanTick).await {
                            error!("plan worker: tick failed: {e}");
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            return;
                        }
                    }
                }
            }
        }));
    }
    {
        let ctx = ctx.clone();
        let mut shutdown_rx = shutdown_rx.clone();
        let interval = config.verify_tick_interval;
        tasks.push(spawn_task("verify-ticker", async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = workers::verify::run(&ctx, workers::VerifyTick).await {
                            error!("verify worker: tick failed: {e}");
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            return;
                        }
                    }
                }
            }
        }));
    }

    let status_server = StatusServer::start(&config.rpc_bind_address, store).await?;

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received, draining in-flight work");
    let _ = shutdown_tx.send(true);

    for task in tasks {
        let _ = task.await;
    }
    status_server.shutdown().await;

    info!("bundler daemon stopped");
    Ok(())
}

const PREPARE_TUNING: QueueTuning = QueueTuning {
    batch_size: 1,
    visibility_timeout: std::time::Duration::from_secs(315),
    max_retries: 4,
};
const POST_TUNING: QueueTuning = QueueTuning {
    batch_size: 1,
    visibility_timeout: std::time::Duration::from_secs(315),
    max_retries: 4,
};
const SEED_TUNING: QueueTuning = QueueTuning {
    batch_size: 1,
    visibility_timeout: std::time::Duration::from_secs(315),
    max_retries: 4,
};

const PREPARE_CONCURRENCY: usize = 4;
const POST_CONCURRENCY: usize = 4;
const SEED_CONCURRENCY: usize = 4;
