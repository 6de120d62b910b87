// Plan Worker (C5): selects eligible `new_data_item` rows, invokes the
// packer, and atomically promotes each resulting plan to `planned_data_item`
// under a fresh `plan_id` (spec §4.5).

use std::sync::Arc;

use chrono::Utc;
use metrics::counter;
use uuid::Uuid;

use super::{PlanTick, PrepareJob, WorkerContext};
use crate::core::error::BundlerResult;
use crate::core::packer::{self, PackerConfig, PackerItem};
use crate::core::queue::Queue;

/// Idempotence rests entirely on `insert_bundle_plan`: two concurrent plan
/// ticks racing over the same `new_data_item` rows each only move the ids
/// they actually claim, so no item is ever double-planned (spec §4.5).
pub async fn run(ctx: &WorkerContext, _message: PlanTick) -> BundlerResult<()> {
    let older_than = Utc::now()
        - chrono::Duration::from_std(ctx.config.plan_batch_accumulation_delay)
            .unwrap_or_else(|_| chrono::Duration::zero());

    let items = ctx
        .store
        .get_new_data_items(ctx.config.plan_selection_batch_size, older_than)
        .await?;

    if items.is_empty() {
        return Ok(());
    }

    let packer_items: Vec<PackerItem> = items
        .iter()
        .map(|item| PackerItem {
            id: item.data_item_id.clone(),
            byte_count: item.byte_count,
            uploaded_date: item.uploaded_date,
        })
        .collect();

    let config = PackerConfig {
        max_total_bytes: ctx.config.max_bundle_byte_count,
        max_single_item_bytes: ctx.config.max_data_item_byte_count,
        max_items_per_bundle: ctx.config.max_data_items_per_bundle,
        overdue_threshold: Utc::now()
            - chrono::Duration::milliseconds(ctx.config.overdue_threshold_ms),
    };

    let plans = packer::pack(packer_items, &config);

    for plan in plans {
        if plan.item_ids.is_empty() {
            continue;
        }
        let plan_id = Uuid::new_v4().to_string();
        let moved = ctx.store.insert_bundle_plan(&plan_id, &plan.item_ids).await?;
        if moved.is_empty() {
            // Every id in this draft was already claimed by a concurrent
            // plan tick; nothing to enqueue.
            continue;
        }
        ctx.prepare_queue
            .send(&PrepareJob {
                plan_id: plan_id.clone(),
            })
            .await?;
        counter!("bundler_plan_items_planned_total").increment(moved.len() as u64);
        info!(
            "plan worker: created plan {plan_id} with {} items ({} bytes)",
            moved.len(),
            plan.total_bytes
        );
    }

    Ok(())
}

/// Convenience wiring for the dispatcher: binds `ctx` into a closure of the
/// shape `Dispatcher::run_forever` expects.
pub fn handler(ctx: Arc<WorkerContext>) -> impl Fn(PlanTick) -> futures::future::BoxFuture<'static, BundlerResult<()>> {
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
    use crate::core::workers::{PostJob, SeedJob};
    use crate::test_support::fakes::{FakeGateway, FakeObjectStore, InMemoryStateStore};
    use bundler_common::data_item::DataItem;
    use primitive_types::U256;
    use std::time::Duration;

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

    fn test_context(store: Arc<dyn StateStore>) -> WorkerContext {
        WorkerContext {
            store,
            object_store: Arc::new(FakeObjectStore::new()) as Arc<dyn ObjectStoreAdapter>,
            gateway: Arc::new(FakeGateway::new()) as Arc<dyn GatewayAdapter>,
            signer: Arc::new(Ed25519TxSigner::from_bytes(&[1u8; 32]).unwrap()),
            config: Arc::new(crate::config::Config {
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
            }),
            prepare_queue: Arc::new(InMemoryQueue::new()),
            post_queue: Arc::new(InMemoryQueue::<PostJob>::new()),
            seed_queue: Arc::new(InMemoryQueue::<SeedJob>::new()),
        }
    }

    #[tokio::test]
    async fn packs_eligible_items_into_one_plan_and_enqueues_prepare() {
        let store: Arc<dyn StateStore> = Arc::new(InMemoryStateStore::new());
        for id in ["a", "b", "c"] {
            store.insert_new_data_item(&sample_item(id, 10)).await.unwrap();
        }
        let ctx = test_context(store.clone());

        run(&ctx, PlanTick).await.unwrap();

        assert_eq!(ctx.prepare_queue.len().await, 1);
    }

    #[tokio::test]
    async fn empty_new_data_items_enqueues_nothing() {
        let store: Arc<dyn StateStore> = Arc::new(InMemoryStateStore::new());
        let ctx = test_context(store);
        run(&ctx, PlanTick).await.unwrap();
        assert_eq!(ctx.prepare_queue.len().await, 0);
    }
}
