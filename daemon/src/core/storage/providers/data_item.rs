use async_trait::async_trait;
use bundler_common::data_item::{DataItem, DataItemInfo, FailureReason};
use chrono::{DateTime, Utc};

use crate::core::error::BundlerResult;

/// Operations on the `new_data_item` / `planned_data_item` /
/// `permanent_data_item` / `failed_data_item` tables (spec §4.1). Each
/// method is one serializable transaction; replaying a promotion that has
/// already happened must be a no-op, not an error (see
/// [`crate::core::error::BundlerError::AlreadyAdvanced`]).
#[async_trait]
pub trait DataItemProvider: Send + Sync {
    /// Insert into `new_data_item`. If a row with the same id exists in
    /// `failed_data_item`, that row is deleted first so a re-upload after
    /// terminal failure is observable. Fails with a bad-input-classified
    /// error if the id already lives in `new`/`planned`/`permanent`.
    async fn insert_new_data_item(&self, item: &DataItem) -> BundlerResult<()>;

    /// As above, deduplicated within the batch; rows that conflict with an
    /// existing `new`/`planned`/`permanent` row are silently skipped.
    /// Returns the number of rows actually inserted.
    async fn insert_new_data_item_batch(&self, items: &[DataItem]) -> BundlerResult<usize>;

    /// Lazily-bounded sequence of up to `max` `new_data_item` rows uploaded
    /// at or before `older_than`, ordered by `uploaded_date` ascending.
    async fn get_new_data_items(
        &self,
        max: i64,
        older_than: DateTime<Utc>,
    ) -> BundlerResult<Vec<DataItem>>;

    async fn get_data_item_info(&self, id: &str) -> BundlerResult<DataItemInfo>;

    /// **(ambient, added)** List every `planned_data_item` row for a given
    /// `plan_id`. Spec §4.6 step 1 ("read the plan's items") requires this
    /// accessor even though §4.1 does not name it as a standalone operation;
    /// split out here for the same testability reasons as
    /// `update_data_items_as_permanent`.
    async fn get_planned_data_items(&self, plan_id: &str) -> BundlerResult<Vec<DataItem>>;

    /// **(ambient, added)** Move every id in `ids` from `planned_data_item`
    /// back to `new_data_item` unchanged — no `failed_bundles` entry is
    /// appended. Used only by the prepare worker's plan-abort path (spec
    /// §4.6 step 2: "abort the plan and revert items"), which is distinct
    /// from `update_data_items_to_be_repacked`: no bundle was ever built for
    /// these items, so the retry budget must not be spent.
    async fn revert_planned_data_items_to_new(&self, ids: &[String]) -> BundlerResult<()>;

    /// Single-item move to `failed_data_item` (e.g. `missing_from_object_store`).
    async fn update_planned_data_item_as_failed(
        &self,
        id: &str,
        reason: FailureReason,
    ) -> BundlerResult<()>;

    /// For each id currently in `planned_data_item`, append
    /// `losing_bundle_id` to its `failed_bundles`. If the new length is
    /// still below `retry_limit`, move the row back to `new_data_item`;
    /// otherwise move it to `failed_data_item` with reason
    /// `too_many_failures`. Ids not found in `planned_data_item` are
    /// skipped (already reconciled by a concurrent run).
    async fn update_data_items_to_be_repacked(
        &self,
        ids: &[String],
        losing_bundle_id: &str,
        retry_limit: u32,
    ) -> BundlerResult<()>;

    /// Move every id in `ids` from `planned_data_item` to
    /// `permanent_data_item`, recording `bundle_id`. Partitioned by
    /// `uploaded_date` per [`crate::core::storage::postgres::partitions`].
    async fn update_data_items_as_permanent(
        &self,
        bundle_id: &str,
        ids: &[String],
    ) -> BundlerResult<()>;
}
