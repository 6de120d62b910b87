// Seed Worker (C8): streams a posted bundle's payload to the gateway's
// chunk-upload endpoint until the whole transaction is seeded (spec §4.8).

use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt};

use super::{SeedJob, WorkerContext};
use crate::core::chunker::CHUNK_SIZE;
use crate::core::error::{BundlerError, BundlerResult};

/// Idempotent on replay: a plan no longer in `posted_bundle` was already
/// seeded (or further along); nothing left to do.
pub async fn run(ctx: &WorkerContext, message: SeedJob) -> BundlerResult<()> {
    let plan_id = message.plan_id;

    let bundle = match ctx.store.get_posted_bundle(&plan_id).await {
        Ok(bundle) => bundle,
        Err(BundlerError::PlanNotFound(_)) => return Ok(()),
        Err(e) => return Err(e),
    };

    let payload_key = format!("bundle-payload/{plan_id}");

    // Pass 1: stream once just to size pass 2 (spec §4.8 step 2 — "two
    // sequential streams ... chunk preparation and upload are two distinct
    // passes to bound memory"). The prepare worker already hashed this
    // payload into `data_root`; this pass never re-derives it.
    let (count_stream, _) = ctx.object_store.get(&payload_key, None).await?;
    let chunk_count = count_chunks(count_stream).await?;

    // Pass 2: stream again, uploading one chunk at a time so the whole
    // payload is never held in memory at once.
    let (mut upload_stream, _) = ctx.object_store.get(&payload_key, None).await?;
    let mut buf = vec![0u8; CHUNK_SIZE];
    let mut uploaded = 0usize;
    loop {
        let filled = read_filled(&mut upload_stream, &mut buf).await?;
        if filled == 0 {
            break;
        }
        ctx.gateway.upload_chunks(&bundle.bundle_id, &buf[..filled]).await?;
        uploaded += 1;
        if filled < buf.len() {
            break;
        }
    }

    // On unrecoverable upload failure the `?` above already returned,
    // leaving the bundle untouched in `posted_bundle` for retry (spec §4.8
    // step 3).
    ctx.store.insert_seeded_bundle(&bundle.bundle_id).await?;
    info!(
        "seed worker: uploaded {uploaded}/{chunk_count} chunk(s) for bundle {} (plan {plan_id})",
        bundle.bundle_id
    );
    Ok(())
}

async fn count_chunks<R: AsyncRead + Unpin>(mut reader: R) -> BundlerResult<usize> {
    let mut buf = vec![0u8; CHUNK_SIZE];
    let mut count = 0usize;
    loop {
        let filled = read_filled(&mut reader, &mut buf).await?;
        if filled == 0 {
            break;
        }
        count += 1;
        if filled < buf.len() {
            break;
        }
    }
    Ok(count.max(1))
}

async fn read_filled<R: AsyncRead + Unpin>(reader: &mut R, buf: &mut [u8]) -> BundlerResult<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader
            .read(&mut buf[filled..])
            .await
            .map_err(|e| BundlerError::ObjectStore(format!("chunk read failed: {e}")))?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

/// Convenience wiring for the dispatcher: binds `ctx` into a closure of the
/// shape `Dispatcher::run_forever` expects.
pub fn handler(
    ctx: Arc<WorkerContext>,
) -> impl Fn(SeedJob) -> futures::future::BoxFuture<'static, BundlerResult<()>> {
    move |message| {
        let ctx = ctx.clone();
        Box::pin(async move { run(&ctx, message).await })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::gateway::GatewayAdapter;
    use crate::core::objectstore::ObjectStoreAdapter;
    use crate::core::queue::InMemoryQueue;
    use crate::core::signer::Ed25519TxSigner;
    use crate::core::storage::providers::{BundleProvider, DataItemProvider};
    use crate::core::storage::StateStore;
    use crate::core::workers::{post, prepare, PostJob, PrepareJob};
    use crate::test_support::fakes::{FakeGateway, FakeObjectStore, InMemoryStateStore};
    use bundler_common::data_item::DataItem;
    use bundler_common::ids::encode_id;
    use primitive_types::U256;
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    fn test_id(seed: u8) -> String {
        encode_id(&[seed; 32])
    }

    fn sample_item(id: &str, byte_count: u64) -> DataItem {
        DataItem::new_for_ingest(
            id.to_string(),
            vec![1, 2, 3],
            format!("owner-{id}"),
            2,
            byte_count,
            0,
            None,
            U256::from(100u64),
            1_000_000,
        )
    }

    fn test_config() -> crate::config::Config {
        crate::config::Config {
            database_url: String::new(),
            data_item_bucket: "bucket".to_string(),
            arweave_gateway_url: "http://gateway.invalid".to_string(),
            rpc_bind_address: "127.0.0.1:0".to_string(),
            log_level: "info".to_string(),
            network_request_timeout: Duration::from_secs(1),
            tx_permanent_threshold: 50,
            tx_re_post_threshold_blocks: 50,
            retry_limit_for_failed_data_items: 5,
            max_bundle_byte_count: 1_000,
            max_data_item_byte_count: 1_000,
            max_data_items_per_bundle: 10,
            overdue_threshold_ms: 1000 * 60 * 60 * 4,
            block_height_cache_ttl: Duration::from_secs(60),
            add_community_tip: false,
            plan_batch_accumulation_delay: Duration::from_millis(0),
            plan_selection_batch_size: 100,
            community_tip_target: None,
            community_tip_quantity: 0,
            plan_queue_url: String::new(),
            prepare_queue_url: String::new(),
            post_queue_url: String::new(),
            seed_queue_url: String::new(),
            wallet_secret_key_hex: hex::encode([1u8; 32]),
            object_store_root: String::new(),
                object_store_backend: "fs".to_string(),
                plan_tick_interval: Duration::from_millis(0),
                verify_tick_interval: Duration::from_millis(0),
        }
    }

    fn test_context(
        store: Arc<dyn StateStore>,
        object_store: Arc<FakeObjectStore>,
        gateway: Arc<FakeGateway>,
    ) -> WorkerContext {
        WorkerContext {
            store,
            object_store: object_store as Arc<dyn ObjectStoreAdapter>,
            gateway: gateway as Arc<dyn GatewayAdapter>,
            signer: Arc::new(Ed25519TxSigner::from_bytes(&[1u8; 32]).unwrap()),
            config: Arc::new(test_config()),
            prepare_queue: Arc::new(InMemoryQueue::new()),
            post_queue: Arc::new(InMemoryQueue::new()),
            seed_queue: Arc::new(InMemoryQueue::new()),
        }
    }

    /// Drive a plan all the way through prepare and post so seed worker
    /// tests start from a realistic `posted_bundle` row.
    async fn posted_plan(ctx: &WorkerContext, store: &Arc<dyn StateStore>) -> String {
        let (a, b) = (test_id(1), test_id(2));
        for (id, bytes) in [(&a, b"hello".as_slice()), (&b, b"world".as_slice())] {
            let item = sample_item(id, bytes.len() as u64);
            store.insert_new_data_item(&item).await.unwrap();
            ctx.object_store
                .put(
                    &format!("raw-data-item/{id}"),
                    Box::pin(std::io::Cursor::new(bytes.to_vec())),
                )
                .await
                .unwrap();
        }
        let plan_id = "seed-test-plan".to_string();
        store
            .insert_bundle_plan(&plan_id, &[a.clone(), b.clone()])
            .await
            .unwrap();
        prepare::run(ctx, PrepareJob { plan_id: plan_id.clone() }).await.unwrap();
        post::run(ctx, PostJob { plan_id: plan_id.clone() }).await.unwrap();
        plan_id
    }

    #[tokio::test]
    async fn seeds_a_posted_bundle_and_moves_it_to_seeded_bundle() {
        let store: Arc<dyn StateStore> = Arc::new(InMemoryStateStore::new());
        let object_store = Arc::new(FakeObjectStore::new());
        let gateway = Arc::new(FakeGateway::new());
        let ctx = test_context(store.clone(), object_store.clone(), gateway.clone());

        let plan_id = posted_plan(&ctx, &store).await;

        run(&ctx, SeedJob { plan_id: plan_id.clone() }).await.unwrap();

        assert!(matches!(
            store.get_posted_bundle(&plan_id).await,
            Err(BundlerError::PlanNotFound(_))
        ));
    }

    #[tokio::test]
    async fn unrecoverable_upload_failure_leaves_bundle_in_posted_bundle() {
        let store: Arc<dyn StateStore> = Arc::new(InMemoryStateStore::new());
        let object_store = Arc::new(FakeObjectStore::new());
        let gateway = Arc::new(FakeGateway::new());
        let ctx = test_context(store.clone(), object_store.clone(), gateway.clone());

        let plan_id = posted_plan(&ctx, &store).await;
        gateway.fail_upload.store(true, Ordering::SeqCst);

        let result = run(&ctx, SeedJob { plan_id: plan_id.clone() }).await;
        assert!(result.is_err());
        // Still there, waiting for a retry once the gateway recovers.
        assert!(store.get_posted_bundle(&plan_id).await.is_ok());
    }

    #[tokio::test]
    async fn replaying_an_already_seeded_plan_is_a_no_op() {
        let store: Arc<dyn StateStore> = Arc::new(InMemoryStateStore::new());
        let object_store = Arc::new(FakeObjectStore::new());
        let gateway = Arc::new(FakeGateway::new());
        let ctx = test_context(store.clone(), object_store.clone(), gateway.clone());

        let plan_id = posted_plan(&ctx, &store).await;
        run(&ctx, SeedJob { plan_id: plan_id.clone() }).await.unwrap();
        run(&ctx, SeedJob { plan_id: plan_id.clone() }).await.unwrap();
    }
}
