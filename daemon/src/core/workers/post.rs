// Post Worker (C7): submits a prepared bundle's transaction to the gateway
// once the wallet can afford it (spec §4.7).

use std::sync::Arc;

use super::{PostJob, SeedJob, WorkerContext};
use crate::core::error::{BundlerError, BundlerResult};
use crate::core::gateway::TxHeader;
use crate::core::queue::Queue;

/// Idempotent on replay: a plan that is no longer in `new_bundle` was
/// either already posted (moved to `posted_bundle`) or already failed to
/// post (moved to `failed_bundle`); either way there is nothing left for
/// this stage to do.
pub async fn run(ctx: &WorkerContext, message: PostJob) -> BundlerResult<()> {
    let plan_id = message.plan_id;

    let bundle = match ctx.store.get_new_bundle(&plan_id).await {
        Ok(bundle) => bundle,
        Err(BundlerError::PlanNotFound(_)) => return Ok(()),
        Err(e) => return Err(e),
    };

    let header = load_header(ctx, &bundle.bundle_id).await?;

    let wallet = ctx.signer.wallet_address();
    let balance = ctx.gateway.balance(&wallet).await?;
    if balance < header.reward {
        return Err(BundlerError::InsufficientFunds {
            need: header.reward.to_string(),
            have: balance.to_string(),
        });
    }

    match ctx.gateway.post_tx(&header).await {
        Ok(()) => {
            let usd_to_ar_rate = ctx.gateway.usd_to_ar_rate().await.ok();
            ctx.store
                .insert_posted_bundle(&bundle.bundle_id, usd_to_ar_rate)
                .await?;
            ctx.seed_queue
                .send(&SeedJob {
                    plan_id: plan_id.clone(),
                })
                .await?;
            info!("post worker: posted bundle {} for plan {plan_id}", bundle.bundle_id);
            Ok(())
        }
        Err(e) if !e.is_retryable() => {
            // The gateway permanently rejected this tx (bad input):
            // rerouting the items gives them a chance in a fresh bundle.
            warn!(
                "post worker: gateway rejected bundle {} permanently, rerouting items: {e}",
                bundle.bundle_id
            );
            ctx.store
                .update_new_bundle_to_failed_to_post(
                    &plan_id,
                    &bundle.bundle_id,
                    ctx.config.retry_limit_for_failed_data_items,
                )
                .await?;
            Ok(())
        }
        Err(e) => Err(e),
    }
}

/// The prepare worker persisted the signed header at `bundle/{bundle_id}`
/// as JSON (spec §4.6 step 6); reload it rather than re-deriving anything,
/// since the signature only covers exactly those bytes.
async fn load_header(ctx: &WorkerContext, bundle_id: &str) -> BundlerResult<TxHeader> {
    let key = format!("bundle/{bundle_id}");
    let (mut stream, _etag) = ctx.object_store.get(&key, None).await?;
    let mut bytes = Vec::new();
    tokio::io::AsyncReadExt::read_to_end(&mut stream, &mut bytes)
        .await
        .map_err(|e| BundlerError::ObjectStore(format!("failed to read {key}: {e}")))?;
    serde_json::from_slice(&bytes)
        .map_err(|e| BundlerError::Irrecoverable(format!("corrupt tx header at {key}: {e}")))
}

/// Convenience wiring for the dispatcher: binds `ctx` into a closure of the
/// shape `Dispatcher::run_forever` expects.
pub fn handler(
    ctx: Arc<WorkerContext>,
) -> impl Fn(PostJob) -> futures::future::BoxFuture<'static, BundlerResult<()>> {
    move |message| {
        let ctx = ctx.clone();
        Box::pin(async move { run(&ctx, message).await })
    }
}
