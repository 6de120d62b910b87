// Prepare Worker (C6): reads a plan's items, assembles the ANS-104 bundle
// payload, signs the transaction header, and persists both before handing
// off to post (spec §4.6).

use std::io::Cursor;
use std::sync::Arc;

use chrono::Utc;
use primitive_types::U256;
use tokio::io::AsyncReadExt;

use super::{PostJob, PrepareJob, WorkerContext};
use crate::core::error::{BundlerError, BundlerResult};
use crate::core::gateway::TxHeader;
use crate::core::queue::Queue;
use crate::core::{encode_bundle_header, BundleItemEntry};
use bundler_common::bundle::Bundle;
use bundler_common::data_item::FailureReason;
use bundler_common::ids;

/// Idempotent on replay: if `new_bundle` already holds a row for this plan,
/// the bundle was already built and signed, and there is nothing left to do
/// (spec §4.6: replaying an already-prepared plan must not re-sign it).
pub async fn run(ctx: &WorkerContext, message: PrepareJob) -> BundlerResult<()> {
    let plan_id = message.plan_id;

    match ctx.store.get_new_bundle(&plan_id).await {
        Ok(_) => return Ok(()),
        Err(BundlerError::PlanNotFound(_)) => {}
        Err(e) => return Err(e),
    }

    let items = ctx.store.get_planned_data_items(&plan_id).await?;
    if items.is_empty() {
        // Already reconciled by a concurrent run, or the plan never held
        // any items.
        return Ok(());
    }

    let mut entries = Vec::with_capacity(items.len());
    let mut chunks = Vec::with_capacity(items.len());
    let mut surviving_ids = Vec::with_capacity(items.len());

    for item in &items {
        let key = format!("raw-data-item/{}", item.data_item_id);
        match ctx.object_store.get(&key, None).await {
            Ok((mut stream, _etag)) => {
                let mut bytes = Vec::with_capacity(item.byte_count as usize);
                stream
                    .read_to_end(&mut bytes)
                    .await
                    .map_err(|e| BundlerError::ObjectStore(format!("failed to read {key}: {e}")))?;
                let id_bytes = ids::decode_id(&item.data_item_id).map_err(|e| {
                    BundlerError::Irrecoverable(format!("bad data item id {}: {e}", item.data_item_id))
                })?;
                entries.push(BundleItemEntry {
                    byte_count: bytes.len() as u64,
                    id: id_bytes,
                });
                chunks.push(bytes);
                surviving_ids.push(item.data_item_id.clone());
            }
            Err(BundlerError::MissingFromObjectStore(_)) => {
                ctx.store
                    .update_planned_data_item_as_failed(
                        &item.data_item_id,
                        FailureReason::MissingFromObjectStore,
                    )
                    .await?;
            }
            Err(e) => return Err(e),
        }
    }

    if surviving_ids.len() < 2 {
        // Too few items survived to justify a bundle. No bundle was ever
        // built, so this is not a loss: revert the survivors straight back
        // to `new_data_item` rather than spending one of their retry
        // attempts (spec §4.6 step 2: "abort the plan and revert items").
        if !surviving_ids.is_empty() {
            ctx.store.revert_planned_data_items_to_new(&surviving_ids).await?;
        }
        info!(
            "prepare worker: aborted plan {plan_id}, reverted {} surviving item(s)",
            surviving_ids.len()
        );
        return Ok(());
    }

    let header_bytes = encode_bundle_header(&entries);
    let header_byte_count = header_bytes.len() as u64;
    let payload_byte_count: u64 = chunks.iter().map(|c| c.len() as u64).sum();

    let mut full_payload = Vec::with_capacity((header_byte_count + payload_byte_count) as usize);
    full_payload.extend_from_slice(&header_bytes);
    for chunk in &chunks {
        full_payload.extend_from_slice(chunk);
    }

    let chunked = crate::core::chunker::compute_data_root(Cursor::new(full_payload.clone())).await?;

    let reward = ctx.gateway.price_for_bytes(full_payload.len() as u64).await?;
    let anchor = ctx.gateway.current_anchor().await?;

    let mut header = TxHeader {
        id: String::new(),
        owner: Vec::new(),
        target: None,
        quantity: U256::zero(),
        reward,
        last_tx: anchor,
        data_size: full_payload.len() as u64,
        data_root: chunked.data_root,
        tags: vec![
            ("Bundle-Format".to_string(), "binary".to_string()),
            ("Bundle-Version".to_string(), "2.0.0".to_string()),
        ],
        signature: Vec::new(),
    };

    if ctx.config.add_community_tip {
        if let Some(target) = &ctx.config.community_tip_target {
            header.target = Some(target.clone());
            header.quantity = U256::from(ctx.config.community_tip_quantity);
        }
    }

    ctx.signer.sign(&mut header)?;
    let bundle_id = header.id.clone();

    let header_json = serde_json::to_vec(&header)
        .map_err(|e| BundlerError::Irrecoverable(format!("failed to serialize tx header: {e}")))?;
    ctx.object_store
        .put(&format!("bundle/{bundle_id}"), Box::pin(Cursor::new(header_json)))
        .await?;
    ctx.object_store
        .put(
            &format!("bundle-payload/{plan_id}"),
            Box::pin(Cursor::new(full_payload)),
        )
        .await?;

    let mut bundle = Bundle::new_for_plan(plan_id.clone(), header.reward);
    bundle.bundle_id = bundle_id;
    bundle.header_byte_count = header_byte_count;
    bundle.payload_byte_count = payload_byte_count;
    bundle.transaction_byte_count = header_byte_count + payload_byte_count;
    bundle.signed_date = Some(Utc::now());

    ctx.store.insert_new_bundle(&bundle).await?;

    ctx.post_queue
        .send(&PostJob {
            plan_id: plan_id.clone(),
        })
        .await?;

    info!(
        "prepare worker: signed bundle {} for plan {plan_id} ({} items, {} bytes)",
        bundle.bundle_id,
        surviving_ids.len(),
        bundle.transaction_byte_count
    );

    Ok(())
}

/// Convenience wiring for the dispatcher: binds `ctx` into a closure of the
/// shape `Dispatcher::run_forever` expects.
pub fn handler(
    ctx: Arc<WorkerContext>,
) -> impl Fn(PrepareJob) -> futures::future::BoxFuture<'static, BundlerResult<()>> {
    move |message| {
        let ctx = ctx.clone();
        Box::pin(async move { run(&ctx, message).await })
    }
}
