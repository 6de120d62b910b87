use async_trait::async_trait;
use bundler_common::bundle::Bundle;
use chrono::{DateTime, Utc};

use crate::core::error::BundlerResult;

/// Operations on the `bundle_plan` / `new_bundle` / `posted_bundle` /
/// `seeded_bundle` / `permanent_bundle` / `failed_bundle` tables (spec
/// §4.1).
#[async_trait]
pub trait BundleProvider: Send + Sync {
    /// Move each id in `item_ids` from `new_data_item` to
    /// `planned_data_item` under `plan_id`, and insert a `bundle_plan` row.
    /// All-or-nothing for the ids actually found; ids that cannot be
    /// located (already claimed by a concurrent plan worker) are silently
    /// skipped rather than failing the whole call. Returns the ids that
    /// were actually moved.
    async fn insert_bundle_plan(
        &self,
        plan_id: &str,
        item_ids: &[String],
    ) -> BundlerResult<Vec<String>>;

    /// Delete the `bundle_plan` row and insert `new_bundle`. Fails if the
    /// plan is missing (e.g. it was empty and never inserted).
    async fn insert_new_bundle(&self, bundle: &Bundle) -> BundlerResult<()>;

    async fn insert_posted_bundle(
        &self,
        bundle_id: &str,
        usd_to_ar_rate: Option<f64>,
    ) -> BundlerResult<()>;

    async fn insert_seeded_bundle(&self, bundle_id: &str) -> BundlerResult<()>;

    /// Move `seeded_bundle` -> `permanent_bundle`, recording `block_height`
    /// and `indexed_on_gql`. Does not touch data items; pair with
    /// `DataItemProvider::update_data_items_as_permanent`.
    async fn update_bundle_as_permanent(
        &self,
        plan_id: &str,
        block_height: u64,
        indexed_on_gql: bool,
    ) -> BundlerResult<()>;

    /// Move `seeded_bundle` -> `failed_bundle` and reroute its items via
    /// `DataItemProvider::update_data_items_to_be_repacked`.
    async fn update_seeded_bundle_to_dropped(
        &self,
        plan_id: &str,
        bundle_id: &str,
        retry_limit: u32,
    ) -> BundlerResult<()>;

    /// Move `new_bundle` -> `failed_bundle` and reroute its items.
    async fn update_new_bundle_to_failed_to_post(
        &self,
        plan_id: &str,
        bundle_id: &str,
        retry_limit: u32,
    ) -> BundlerResult<()>;

    async fn get_seeded_bundles(&self, older_than: DateTime<Utc>) -> BundlerResult<Vec<Bundle>>;

    async fn get_new_bundle(&self, plan_id: &str) -> BundlerResult<Bundle>;

    async fn get_posted_bundle(&self, plan_id: &str) -> BundlerResult<Bundle>;
}
