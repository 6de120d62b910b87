// Postgres implementation of [`DataItemProvider`] (spec §4.1).
//
// Every method here is one `SERIALIZABLE` transaction wrapped in
// `with_serializable_retry`. Table membership alone decides a data item's
// state (spec invariant 1), so every promotion is "insert into destination,
// delete from source" inside the same transaction.

use async_trait::async_trait;
use bundler_common::data_item::{DataItem, DataItemInfo, DataItemState, FailureReason};
use chrono::{DateTime, Utc};
use sqlx::Row;
use std::collections::HashSet;

use super::partitions::ensure_partition_for;
use super::rows::DataItemRow;
use super::{with_serializable_retry, PgStateStore};
use crate::core::error::{BundlerError, BundlerResult};
use crate::core::storage::providers::DataItemProvider;

#[async_trait]
impl DataItemProvider for PgStateStore {
    async fn insert_new_data_item(&self, item: &DataItem) -> BundlerResult<()> {
        let row = DataItemRow::from_domain(item);
        with_serializable_retry(|| async {
            let mut tx = self.begin_serializable().await?;

            let already_active: Option<(String,)> = sqlx::query_as(
                "SELECT data_item_id FROM new_data_item WHERE data_item_id = $1
                 UNION ALL
                 SELECT data_item_id FROM planned_data_item WHERE data_item_id = $1
                 UNION ALL
                 SELECT data_item_id FROM permanent_data_item WHERE data_item_id = $1",
            )
            .bind(&row.data_item_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(BundlerError::Database)?;

            if already_active.is_some() {
                return Err(BundlerError::BadInput(format!(
                    "data item {} already exists",
                    row.data_item_id
                )));
            }

            sqlx::query("DELETE FROM failed_data_item WHERE data_item_id = $1")
                .bind(&row.data_item_id)
                .execute(&mut *tx)
                .await
                .map_err(BundlerError::Database)?;

            insert_new_row(&mut tx, &row).await?;

            tx.commit().await.map_err(BundlerError::Database)?;
            Ok(())
        })
        .await
    }

    async fn insert_new_data_item_batch(&self, items: &[DataItem]) -> BundlerResult<usize> {
        let mut seen = HashSet::new();
        let deduped: Vec<&DataItem> = items
            .iter()
            .filter(|item| seen.insert(item.data_item_id.clone()))
            .collect();

        with_serializable_retry(|| async {
            let mut tx = self.begin_serializable().await?;
            let mut inserted = 0usize;

            for item in &deduped {
                let row = DataItemRow::from_domain(item);

                let conflict: Option<(String,)> = sqlx::query_as(
                    "SELECT data_item_id FROM new_data_item WHERE data_item_id = $1
                     UNION ALL
                     SELECT data_item_id FROM planned_data_item WHERE data_item_id = $1
                     UNION ALL
                     SELECT data_item_id FROM permanent_data_item WHERE data_item_id = $1",
                )
                .bind(&row.data_item_id)
                .fetch_optional(&mut *tx)
                .await
                .map_err(BundlerError::Database)?;

                if conflict.is_some() {
                    continue;
                }

                sqlx::query("DELETE FROM failed_data_item WHERE data_item_id = $1")
                    .bind(&row.data_item_id)
                    .execute(&mut *tx)
                    .await
                    .map_err(BundlerError::Database)?;

                insert_new_row(&mut tx, &row).await?;
                inserted += 1;
            }

            tx.commit().await.map_err(BundlerError::Database)?;
            Ok(inserted)
        })
        .await
    }

    async fn get_new_data_items(
        &self,
        max: i64,
        older_than: DateTime<Utc>,
    ) -> BundlerResult<Vec<DataItem>> {
        let rows: Vec<DataItemRow> = sqlx::query_as(
            "SELECT data_item_id, owner_public_key, owner_address, signature_type, byte_count,
                    payload_data_start, payload_content_type, assessed_winston_price,
                    uploaded_date, deadline_height, failed_bundles, premium_feature_type
             FROM new_data_item
             WHERE uploaded_date <= $1
             ORDER BY uploaded_date ASC
             LIMIT $2",
        )
        .bind(older_than)
        .bind(max)
        .fetch_all(self.pool())
        .await
        .map_err(BundlerError::Database)?;

        rows.into_iter().map(DataItemRow::into_domain).collect()
    }

    async fn get_data_item_info(&self, id: &str) -> BundlerResult<DataItemInfo> {
        if let Some(row) = sqlx::query("SELECT assessed_winston_price FROM new_data_item WHERE data_item_id = $1")
            .bind(id)
            .fetch_optional(self.pool())
            .await
            .map_err(BundlerError::Database)?
        {
            return price_info(row, DataItemState::New, None);
        }

        if let Some(row) = sqlx::query(
            "SELECT assessed_winston_price, plan_id FROM planned_data_item WHERE data_item_id = $1",
        )
        .bind(id)
        .fetch_optional(self.pool())
        .await
        .map_err(BundlerError::Database)?
        {
            let plan_id: String = row.try_get("plan_id").map_err(BundlerError::Database)?;
            return price_info(row, DataItemState::Planned, Some(plan_id));
        }

        if let Some(row) = sqlx::query(
            "SELECT assessed_winston_price, bundle_id FROM permanent_data_item WHERE data_item_id = $1",
        )
        .bind(id)
        .fetch_optional(self.pool())
        .await
        .map_err(BundlerError::Database)?
        {
            let bundle_id: String = row.try_get("bundle_id").map_err(BundlerError::Database)?;
            return price_info(row, DataItemState::Permanent, Some(bundle_id));
        }

        if let Some(row) = sqlx::query(
            "SELECT assessed_winston_price FROM failed_data_item WHERE data_item_id = $1",
        )
        .bind(id)
        .fetch_optional(self.pool())
        .await
        .map_err(BundlerError::Database)?
        {
            return price_info(row, DataItemState::Failed, None);
        }

        Ok(DataItemInfo::NotFound)
    }

    async fn get_planned_data_items(&self, plan_id: &str) -> BundlerResult<Vec<DataItem>> {
        let rows: Vec<DataItemRow> = sqlx::query_as(
            "SELECT data_item_id, owner_public_key, owner_address, signature_type, byte_count,
                    payload_data_start, payload_content_type, assessed_winston_price,
                    uploaded_date, deadline_height, failed_bundles, premium_feature_type
             FROM planned_data_item
             WHERE plan_id = $1
             ORDER BY uploaded_date ASC",
        )
        .bind(plan_id)
        .fetch_all(self.pool())
        .await
        .map_err(BundlerError::Database)?;

        rows.into_iter().map(DataItemRow::into_domain).collect()
    }

    async fn revert_planned_data_items_to_new(&self, ids: &[String]) -> BundlerResult<()> {
        with_serializable_retry(|| async {
            let mut tx = self.begin_serializable().await?;

            for id in ids {
                let row: Option<DataItemRow> = sqlx::query_as(
                    "SELECT data_item_id, owner_public_key, owner_address, signature_type,
                            byte_count, payload_data_start, payload_content_type,
                            assessed_winston_price, uploaded_date, deadline_height,
                            failed_bundles, premium_feature_type
                     FROM planned_data_item WHERE data_item_id = $1",
                )
                .bind(id)
                .fetch_optional(&mut *tx)
                .await
                .map_err(BundlerError::Database)?;

                let Some(row) = row else {
                    // Already reconciled by a concurrent run; no-op (spec §4.1).
                    continue;
                };

                sqlx::query("DELETE FROM planned_data_item WHERE data_item_id = $1")
                    .bind(id)
                    .execute(&mut *tx)
                    .await
                    .map_err(BundlerError::Database)?;

                insert_new_row(&mut tx, &row).await?;
            }

            tx.commit().await.map_err(BundlerError::Database)?;
            Ok(())
        })
        .await
    }

    async fn update_planned_data_item_as_failed(
        &self,
        id: &str,
        reason: FailureReason,
    ) -> BundlerResult<()> {
        let reason_text = failure_reason_text(&reason);
        with_serializable_retry(|| async {
            let mut tx = self.begin_serializable().await?;

            let moved = sqlx::query(
                "INSERT INTO failed_data_item
                     (data_item_id, owner_public_key, owner_address, signature_type, byte_count,
                      payload_data_start, payload_content_type, assessed_winston_price,
                      uploaded_date, deadline_height, failed_bundles, premium_feature_type,
                      failed_reason)
                 SELECT data_item_id, owner_public_key, owner_address, signature_type, byte_count,
                        payload_data_start, payload_content_type, assessed_winston_price,
                        uploaded_date, deadline_height, failed_bundles, premium_feature_type, $2
                 FROM planned_data_item WHERE data_item_id = $1
                 ON CONFLICT (data_item_id) DO NOTHING",
            )
            .bind(id)
            .bind(&reason_text)
            .execute(&mut *tx)
            .await
            .map_err(BundlerError::Database)?;

            if moved.rows_affected() > 0 {
                sqlx::query("DELETE FROM planned_data_item WHERE data_item_id = $1")
                    .bind(id)
                    .execute(&mut *tx)
                    .await
                    .map_err(BundlerError::Database)?;
            }

            tx.commit().await.map_err(BundlerError::Database)?;
            Ok(())
        })
        .await
    }

    async fn update_data_items_to_be_repacked(
        &self,
        ids: &[String],
        losing_bundle_id: &str,
        retry_limit: u32,
    ) -> BundlerResult<()> {
        with_serializable_retry(|| async {
            let mut tx = self.begin_serializable().await?;

            for id in ids {
                let row: Option<DataItemRow> = sqlx::query_as(
                    "SELECT data_item_id, owner_public_key, owner_address, signature_type,
                            byte_count, payload_data_start, payload_content_type,
                            assessed_winston_price, uploaded_date, deadline_height,
                            failed_bundles, premium_feature_type
                     FROM planned_data_item WHERE data_item_id = $1",
                )
                .bind(id)
                .fetch_optional(&mut *tx)
                .await
                .map_err(BundlerError::Database)?;

                let Some(mut row) = row else {
                    // Already reconciled by a concurrent run; no-op (spec §4.1).
                    continue;
                };

                row.failed_bundles.push(losing_bundle_id.to_string());

                sqlx::query("DELETE FROM planned_data_item WHERE data_item_id = $1")
                    .bind(id)
                    .execute(&mut *tx)
                    .await
                    .map_err(BundlerError::Database)?;

                if (row.failed_bundles.len() as u32) < retry_limit {
                    sqlx::query(
                        "INSERT INTO new_data_item
                             (data_item_id, owner_public_key, owner_address, signature_type,
                              byte_count, payload_data_start, payload_content_type,
                              assessed_winston_price, uploaded_date, deadline_height,
                              failed_bundles, premium_feature_type)
                         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)",
                    )
                    .bind(&row.data_item_id)
                    .bind(&row.owner_public_key)
                    .bind(&row.owner_address)
                    .bind(row.signature_type)
                    .bind(row.byte_count)
                    .bind(row.payload_data_start)
                    .bind(&row.payload_content_type)
                    .bind(&row.assessed_winston_price)
                    .bind(row.uploaded_date)
                    .bind(row.deadline_height)
                    .bind(&row.failed_bundles)
                    .bind(&row.premium_feature_type)
                    .execute(&mut *tx)
                    .await
                    .map_err(BundlerError::Database)?;
                } else {
                    sqlx::query(
                        "INSERT INTO failed_data_item
                             (data_item_id, owner_public_key, owner_address, signature_type,
                              byte_count, payload_data_start, payload_content_type,
                              assessed_winston_price, uploaded_date, deadline_height,
                              failed_bundles, premium_feature_type, failed_reason)
                         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, 'too_many_failures')",
                    )
                    .bind(&row.data_item_id)
                    .bind(&row.owner_public_key)
                    .bind(&row.owner_address)
                    .bind(row.signature_type)
                    .bind(row.byte_count)
                    .bind(row.payload_data_start)
                    .bind(&row.payload_content_type)
                    .bind(&row.assessed_winston_price)
                    .bind(row.uploaded_date)
                    .bind(row.deadline_height)
                    .bind(&row.failed_bundles)
                    .bind(&row.premium_feature_type)
                    .execute(&mut *tx)
                    .await
                    .map_err(BundlerError::Database)?;
                }
            }

            tx.commit().await.map_err(BundlerError::Database)?;
            Ok(())
        })
        .await
    }

    async fn update_data_items_as_permanent(
        &self,
        bundle_id: &str,
        ids: &[String],
    ) -> BundlerResult<()> {
        with_serializable_retry(|| async {
            let mut tx = self.begin_serializable().await?;

            for id in ids {
                let row: Option<DataItemRow> = sqlx::query_as(
                    "SELECT data_item_id, owner_public_key, owner_address, signature_type,
                            byte_count, payload_data_start, payload_content_type,
                            assessed_winston_price, uploaded_date, deadline_height,
                            failed_bundles, premium_feature_type
                     FROM planned_data_item WHERE data_item_id = $1",
                )
                .bind(id)
                .fetch_optional(&mut *tx)
                .await
                .map_err(BundlerError::Database)?;

                let Some(row) = row else {
                    continue;
                };

                ensure_partition_for(&mut *tx, row.uploaded_date).await?;

                sqlx::query(
                    "INSERT INTO permanent_data_item
                         (data_item_id, owner_public_key, owner_address, signature_type,
                          byte_count, payload_data_start, payload_content_type,
                          assessed_winston_price, uploaded_date, deadline_height,
                          failed_bundles, premium_feature_type, bundle_id)
                     VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
                     ON CONFLICT (data_item_id, uploaded_date) DO NOTHING",
                )
                .bind(&row.data_item_id)
                .bind(&row.owner_public_key)
                .bind(&row.owner_address)
                .bind(row.signature_type)
                .bind(row.byte_count)
                .bind(row.payload_data_start)
                .bind(&row.payload_content_type)
                .bind(&row.assessed_winston_price)
                .bind(row.uploaded_date)
                .bind(row.deadline_height)
                .bind(&row.failed_bundles)
                .bind(&row.premium_feature_type)
                .bind(bundle_id)
                .execute(&mut *tx)
                .await
                .map_err(BundlerError::Database)?;

                sqlx::query("DELETE FROM planned_data_item WHERE data_item_id = $1")
                    .bind(id)
                    .execute(&mut *tx)
                    .await
                    .map_err(BundlerError::Database)?;
            }

            tx.commit().await.map_err(BundlerError::Database)?;
            Ok(())
        })
        .await
    }
}

async fn insert_new_row(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    row: &DataItemRow,
) -> BundlerResult<()> {
    sqlx::query(
        "INSERT INTO new_data_item
             (data_item_id, owner_public_key, owner_address, signature_type, byte_count,
              payload_data_start, payload_content_type, assessed_winston_price,
              uploaded_date, deadline_height, failed_bundles, premium_feature_type)
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)",
    )
    .bind(&row.data_item_id)
    .bind(&row.owner_public_key)
    .bind(&row.owner_address)
    .bind(row.signature_type)
    .bind(row.byte_count)
    .bind(row.payload_data_start)
    .bind(&row.payload_content_type)
    .bind(&row.assessed_winston_price)
    .bind(row.uploaded_date)
    .bind(row.deadline_height)
    .bind(&row.failed_bundles)
    .bind(&row.premium_feature_type)
    .execute(&mut **tx)
    .await
    .map_err(BundlerError::Database)?;
    Ok(())
}

fn failure_reason_text(reason: &FailureReason) -> String {
    match reason {
        FailureReason::TooManyFailures => "too_many_failures".to_string(),
        FailureReason::MissingFromObjectStore => "missing_from_object_store".to_string(),
        FailureReason::Other(msg) => msg.clone(),
    }
}

fn price_info(
    row: sqlx::postgres::PgRow,
    status: DataItemState,
    bundle_id: Option<String>,
) -> BundlerResult<DataItemInfo> {
    let price_text: String = row
        .try_get("assessed_winston_price")
        .map_err(BundlerError::Database)?;
    let assessed_winston_price = primitive_types::U256::from_dec_str(&price_text)
        .map_err(|e| BundlerError::Irrecoverable(format!("bad winston price in row: {e}")))?;
    Ok(DataItemInfo::Found {
        status,
        assessed_winston_price,
        bundle_id,
    })
}
