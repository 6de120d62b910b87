// Verify Worker (C9): periodically polls the gateway for each seeded
// bundle and decides finality (spec §4.9). Unlike plan/prepare/post/seed
// this stage is not message-driven — there is no `verify` queue in the
// external interface list (spec §6) — it is a periodic scan invoked on a
// timer (see `bin/main.rs`) against a bounded-concurrency pool, per spec
// §4.9's "in a bounded-concurrency pool".

use std::sync::Arc;

use bundler_common::bundle::Bundle;
use futures::stream::{self, StreamExt};
use metrics::counter;
use tokio::io::AsyncReadExt;

use super::{VerifyTick, WorkerContext};
use crate::core::error::{BundlerError, BundlerResult};
use crate::core::gateway::{GqlItemRecord, TxHeader, TxStatus};

/// How many bundles this stage verifies concurrently per tick. Not a spec
/// §6 configuration key (the spec names only the thresholds each poll
/// decision is judged against), so this is a module constant rather than a
/// `Config` field, same as `gateway::PAGE_SIZE`-style internal tuning.
const VERIFY_CONCURRENCY: usize = 16;

/// Scans every `seeded_bundle` row and drives each through the state
/// machine in spec §4.9. A single bundle's failure (a transient gateway
/// error, say) is logged and does not abort the rest of the scan — the
/// next tick picks it back up.
pub async fn run(ctx: &WorkerContext, _message: VerifyTick) -> BundlerResult<()> {
    let bundles = ctx.store.get_seeded_bundles(chrono::Utc::now()).await?;
    if bundles.is_empty() {
        return Ok(());
    }

    stream::iter(bundles)
        .for_each_concurrent(VERIFY_CONCURRENCY, |bundle| async move {
            let bundle_id = bundle.bundle_id.clone();
            if let Err(e) = verify_one(ctx, &bundle).await {
                warn!("verify worker: failed to verify bundle {bundle_id}: {e}");
            }
        })
        .await;

    Ok(())
}

/// Drives one seeded bundle through spec §4.9 steps 1-4.
async fn verify_one(ctx: &WorkerContext, bundle: &Bundle) -> BundlerResult<()> {
    match ctx.gateway.tx_status(&bundle.bundle_id).await? {
        TxStatus::NotFound => check_dropped(ctx, bundle).await,
        TxStatus::Pending => Ok(()),
        TxStatus::Found {
            confirmations,
            block_height,
        } => {
            if confirmations < ctx.config.tx_permanent_threshold as u64 {
                return Ok(());
            }
            finalize(ctx, bundle, block_height).await
        }
    }
}

/// Step 2: a tx the gateway has never seen might simply not have propagated
/// yet, or it might have been dropped entirely. The age of its anchor
/// relative to the current chain tip is the only signal available to tell
/// the two apart without waiting forever.
async fn check_dropped(ctx: &WorkerContext, bundle: &Bundle) -> BundlerResult<()> {
    let header = load_header(ctx, &bundle.bundle_id).await?;
    let current_height = ctx.gateway.current_block_height().await?;
    let anchor_height = ctx.gateway.block_height_for_tx_anchor(&header.last_tx).await?;

    if current_height.saturating_sub(anchor_height) > ctx.config.tx_re_post_threshold_blocks as u64 {
        warn!(
            "verify worker: bundle {} not found {} blocks past its anchor, dropping",
            bundle.bundle_id,
            current_height.saturating_sub(anchor_height)
        );
        ctx.store
            .update_seeded_bundle_to_dropped(
                &bundle.plan_id,
                &bundle.bundle_id,
                ctx.config.retry_limit_for_failed_data_items,
            )
            .await?;
        counter!("bundler_bundles_dropped_total").increment(1);
    }
    Ok(())
}

/// Step 4: confirmations have cleared the permanence threshold. Per-item
/// GQL presence, not raw tx confirmation, decides which items actually made
/// it into the index; a confirmed tx whose items the index hasn't caught up
/// with yet sends those items back through the pipeline rather than
/// stalling the whole bundle.
async fn finalize(ctx: &WorkerContext, bundle: &Bundle, block_height: u64) -> BundlerResult<()> {
    // `items` is empty either because nothing was ever planned under this
    // plan_id, or because a crashed prior tick already committed the
    // per-item reconciliation (update_data_items_as_permanent /
    // update_data_items_to_be_repacked below) but not the bundle's own
    // move to `permanent_bundle`. Either way the bundle move below must
    // still happen unconditionally — skipping it here would leave the
    // bundle stuck in `seeded_bundle` forever, since a `Found` bundle never
    // reaches `check_dropped`'s `NotFound` branch.
    let items = ctx.store.get_planned_data_items(&bundle.plan_id).await?;
    let ids: Vec<String> = items.iter().map(|i| i.data_item_id.clone()).collect();

    let mut permanent_ids = Vec::with_capacity(ids.len());
    let mut reroute_ids = Vec::new();
    if !ids.is_empty() {
        let records = ctx.gateway.data_items_on_gql(&ids).await?;
        let by_id: std::collections::HashMap<&str, &GqlItemRecord> =
            records.iter().map(|r| (r.id.as_str(), r)).collect();

        for id in &ids {
            match by_id.get(id.as_str()) {
                Some(record) if record.block_height.is_some() => permanent_ids.push(id.clone()),
                _ => reroute_ids.push(id.clone()),
            }
        }
    }

    // The bundle tx's own GQL presence is a separate question from its
    // items' (the index can lag the chain tip independently per entity).
    let indexed_on_gql = ctx
        .gateway
        .data_items_on_gql(std::slice::from_ref(&bundle.bundle_id))
        .await
        .map(|records| {
            records
                .iter()
                .any(|r| r.id == bundle.bundle_id && r.block_height.is_some())
        })
        .unwrap_or(false);

    if !permanent_ids.is_empty() {
        ctx.store
            .update_data_items_as_permanent(&bundle.bundle_id, &permanent_ids)
            .await?;
    }
    if !reroute_ids.is_empty() {
        ctx.store
            .update_data_items_to_be_repacked(
                &reroute_ids,
                &bundle.bundle_id,
                ctx.config.retry_limit_for_failed_data_items,
            )
            .await?;
    }

    ctx.store
        .update_bundle_as_permanent(&bundle.plan_id, block_height, indexed_on_gql)
        .await?;

    counter!("bundler_data_items_permanent_total").increment(permanent_ids.len() as u64);
    counter!("bundler_data_items_rerouted_total").increment(reroute_ids.len() as u64);

    info!(
        "verify worker: bundle {} permanent at height {block_height} ({} item(s) permanent, {} rerouted)",
        bundle.bundle_id,
        permanent_ids.len(),
        reroute_ids.len()
    );
    Ok(())
}

/// The prepare worker persisted the signed header at `bundle/{bundle_id}`
/// as JSON (spec §4.6 step 6); reload it to recover the tx anchor, since
/// `Bundle` itself does not carry one (see `bundler_common::bundle::Bundle`).
async fn load_header(ctx: &WorkerContext, bundle_id: &str) -> BundlerResult<TxHeader> {
    let key = format!("bundle/{bundle_id}");
    let (mut stream, _etag) = ctx.object_store.get(&key, None).await?;
    let mut bytes = Vec::new();
    stream
        .read_to_end(&mut bytes)
        .await
        .map_err(|e| BundlerError::ObjectStore(format!("failed to read {key}: {e}")))?;
    serde_json::from_slice(&bytes)
        .map_err(|e| BundlerError::Irrecoverable(format!("corrupt tx header at {key}: {e}")))
}

/// Convenience wiring for a timer-driven caller (see `bin/main.rs`): binds
/// `ctx` into a closure of the same shape the queue-backed stages use, even
/// though verify has no queue of its own to dispatch from.
pub fn handler(ctx: Arc<WorkerContext>) -> impl Fn() -> futures::future::BoxFuture<'static, BundlerResult<()>> {
    move || {
        let ctx = ctx.clone();
        Box::pin(async move { run(&ctx, VerifyTick).await })
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
    use crate::core::workers::{post, prepare, seed, PostJob, PrepareJob, SeedJob};
    use crate::test_support::fakes::InMemoryStateStore;
    use bundler_common::data_item::{DataItem, DataItemInfo, DataItemState};
    use bundler_common::ids::encode_id;
    use primitive_types::U256;
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
        object_store: Arc<crate::test_support::fakes::FakeObjectStore>,
        gateway: Arc<crate::test_support::fakes::FakeGateway>,
    ) -> WorkerContext {
        WorkerContext {
            store,
            object_store: object_store as Arc<dyn ObjectStoreAdapter>,
            gateway: gateway as Arc<dyn GatewayAdapter>,
            signer: Arc::new(Ed25519TxSigner::from_bytes(&[1u8; 32]).unwrap()),
            config: Arc::new(test_config()),
            prepare_queue: Arc::new(InMemoryQueue::new()),
            post_queue: Arc::new(InMemoryQueue::<PostJob>::new()),
            seed_queue: Arc::new(InMemoryQueue::<SeedJob>::new()),
        }
    }

    /// Drive a plan all the way to `seeded_bundle` so verify worker tests
    /// start from a realistic row, and return `(plan_id, bundle_id, item_ids)`.
    async fn seeded_plan(
        ctx: &WorkerContext,
        store: &Arc<dyn StateStore>,
    ) -> (String, String, Vec<String>) {
        let (a, b, c) = (test_id(1), test_id(2), test_id(3));
        for (id, bytes) in [
            (&a, b"hello".as_slice()),
            (&b, b"world".as_slice()),
            (&c, b"abcde".as_slice()),
        ] {
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
        let plan_id = "verify-test-plan".to_string();
        store
            .insert_bundle_plan(&plan_id, &[a.clone(), b.clone(), c.clone()])
            .await
            .unwrap();
        prepare::run(ctx, PrepareJob { plan_id: plan_id.clone() }).await.unwrap();
        post::run(ctx, PostJob { plan_id: plan_id.clone() }).await.unwrap();
        seed::run(ctx, SeedJob { plan_id: plan_id.clone() }).await.unwrap();
        let bundle = store.get_seeded_bundles(chrono::Utc::now()).await.unwrap();
        let bundle_id = bundle
            .iter()
            .find(|b| b.plan_id == plan_id)
            .unwrap()
            .bundle_id
            .clone();
        (plan_id, bundle_id, vec![a, b, c])
    }

    #[tokio::test]
    async fn not_yet_confirmed_leaves_bundle_in_seeded_bundle() {
        let store: Arc<dyn StateStore> = Arc::new(InMemoryStateStore::new());
        let object_store = Arc::new(crate::test_support::fakes::FakeObjectStore::new());
        let gateway = Arc::new(crate::test_support::fakes::FakeGateway::new());
        let ctx = test_context(store.clone(), object_store.clone(), gateway.clone());

        let (_plan_id, bundle_id, _) = seeded_plan(&ctx, &store).await;
        gateway.set_tx_status(
            &bundle_id,
            TxStatus::Found {
                confirmations: 3,
                block_height: 900,
            },
        );

        run(&ctx, VerifyTick).await.unwrap();

        assert!(!store
            .get_seeded_bundles(chrono::Utc::now())
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn confirmed_and_fully_indexed_finalizes_bundle_and_items() {
        let store: Arc<dyn StateStore> = Arc::new(InMemoryStateStore::new());
        let object_store = Arc::new(crate::test_support::fakes::FakeObjectStore::new());
        let gateway = Arc::new(crate::test_support::fakes::FakeGateway::new());
        let ctx = test_context(store.clone(), object_store.clone(), gateway.clone());

        let (_plan_id, bundle_id, ids) = seeded_plan(&ctx, &store).await;
        gateway.set_tx_status(
            &bundle_id,
            TxStatus::Found {
                confirmations: 60,
                block_height: 1_000,
            },
        );
        for id in &ids {
            gateway.set_gql_record(
                id,
                GqlItemRecord {
                    id: id.clone(),
                    block_height: Some(1_000),
                    bundled_in: Some(bundle_id.clone()),
                },
            );
        }
        gateway.set_gql_record(
            &bundle_id,
            GqlItemRecord {
                id: bundle_id.clone(),
                block_height: Some(1_000),
                bundled_in: None,
            },
        );

        run(&ctx, VerifyTick).await.unwrap();

        assert!(store
            .get_seeded_bundles(chrono::Utc::now())
            .await
            .unwrap()
            .is_empty());
        for id in &ids {
            let info = store.get_data_item_info(id).await.unwrap();
            assert!(matches!(
                info,
                DataItemInfo::Found {
                    status: DataItemState::Permanent,
                    ..
                }
            ));
        }
    }

    #[tokio::test]
    async fn replay_after_items_already_reconciled_still_finalizes_bundle() {
        let store_impl = Arc::new(InMemoryStateStore::new());
        let store: Arc<dyn StateStore> = store_impl.clone();
        let object_store = Arc::new(crate::test_support::fakes::FakeObjectStore::new());
        let gateway = Arc::new(crate::test_support::fakes::FakeGateway::new());
        let ctx = test_context(store.clone(), object_store.clone(), gateway.clone());

        let (_plan_id, bundle_id, ids) = seeded_plan(&ctx, &store).await;
        gateway.set_tx_status(
            &bundle_id,
            TxStatus::Found {
                confirmations: 60,
                block_height: 1_000,
            },
        );

        // Simulate a crash between the two halves of a prior finalize: the
        // per-item move to `permanent_data_item` already committed, but the
        // bundle's own move to `permanent_bundle` did not, so the bundle is
        // still sitting in `seeded_bundle` with nothing left in
        // `planned_data_item` for it.
        store
            .update_data_items_as_permanent(&bundle_id, &ids)
            .await
            .unwrap();

        run(&ctx, VerifyTick).await.unwrap();

        assert!(store
            .get_seeded_bundles(chrono::Utc::now())
            .await
            .unwrap()
            .is_empty());
        assert!(store_impl.permanent_bundle_ids().contains(&bundle_id));
    }

    #[tokio::test]
    async fn confirmed_but_missing_from_gql_reroutes_that_item_only() {
        let store: Arc<dyn StateStore> = Arc::new(InMemoryStateStore::new());
        let object_store = Arc::new(crate::test_support::fakes::FakeObjectStore::new());
        let gateway = Arc::new(crate::test_support::fakes::FakeGateway::new());
        let ctx = test_context(store.clone(), object_store.clone(), gateway.clone());

        let (_plan_id, bundle_id, ids) = seeded_plan(&ctx, &store).await;
        gateway.set_tx_status(
            &bundle_id,
            TxStatus::Found {
                confirmations: 60,
                block_height: 1_000,
            },
        );
        // Only the first two items show up on GQL; the third is missing
        // entirely and must be rerouted rather than finalized.
        for id in &ids[..2] {
            gateway.set_gql_record(
                id,
                GqlItemRecord {
                    id: id.clone(),
                    block_height: Some(1_000),
                    bundled_in: Some(bundle_id.clone()),
                },
            );
        }

        run(&ctx, VerifyTick).await.unwrap();

        for id in &ids[..2] {
            let info = store.get_data_item_info(id).await.unwrap();
            assert!(matches!(
                info,
                DataItemInfo::Found {
                    status: DataItemState::Permanent,
                    ..
                }
            ));
        }
        let missing_info = store.get_data_item_info(&ids[2]).await.unwrap();
        assert!(matches!(
            missing_info,
            DataItemInfo::Found {
                status: DataItemState::New,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn not_found_within_repost_threshold_is_left_alone() {
        let store: Arc<dyn StateStore> = Arc::new(InMemoryStateStore::new());
        let object_store = Arc::new(crate::test_support::fakes::FakeObjectStore::new());
        let gateway = Arc::new(crate::test_support::fakes::FakeGateway::new());
        let ctx = test_context(store.clone(), object_store.clone(), gateway.clone());

        let (_plan_id, _bundle_id, _ids) = seeded_plan(&ctx, &store).await;
        gateway.block_height.store(120, std::sync::atomic::Ordering::SeqCst);
        gateway.anchor_height.store(100, std::sync::atomic::Ordering::SeqCst);

        run(&ctx, VerifyTick).await.unwrap();

        assert!(!store
            .get_seeded_bundles(chrono::Utc::now())
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn not_found_past_repost_threshold_drops_bundle_and_reroutes_items() {
        let store: Arc<dyn StateStore> = Arc::new(InMemoryStateStore::new());
        let object_store = Arc::new(crate::test_support::fakes::FakeObjectStore::new());
        let gateway = Arc::new(crate::test_support::fakes::FakeGateway::new());
        let ctx = test_context(store.clone(), object_store.clone(), gateway.clone());

        let (_plan_id, _bundle_id, ids) = seeded_plan(&ctx, &store).await;
        gateway.block_height.store(500, std::sync::atomic::Ordering::SeqCst);
        gateway.anchor_height.store(100, std::sync::atomic::Ordering::SeqCst);

        run(&ctx, VerifyTick).await.unwrap();

        assert!(store
            .get_seeded_bundles(chrono::Utc::now())
            .await
            .unwrap()
            .is_empty());
        for id in &ids {
            let info = store.get_data_item_info(id).await.unwrap();
            assert!(matches!(
                info,
                DataItemInfo::Found {
                    status: DataItemState::New,
                    ..
                }
            ));
        }
    }
}
