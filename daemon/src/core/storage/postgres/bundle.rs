// Postgres implementation of [`BundleProvider`] (spec §4.1).
//
// Bundle-table promotions follow the same "insert destination, delete
// source, one transaction" discipline as the data-item tables. Rerouting a
// dropped bundle's items is delegated to [`DataItemProvider`] as its own
// transaction rather than folded into the bundle-table move, matching how
// spec §4.1 describes `update_seeded_bundle_to_dropped` as two composed
// operations rather than one.

use async_trait::async_trait;
use bundler_common::bundle::Bundle;
use chrono::{DateTime, Utc};
use sqlx::Row;

use super::rows::BundleRow;
use super::{with_serializable_retry, PgStateStore};
use crate::core::error::{BundlerError, BundlerResult};
use crate::core::storage::providers::{BundleProvider, DataItemProvider};

#[async_trait]
impl BundleProvider for PgStateStore {
    async fn insert_bundle_plan(
        &self,
        plan_id: &str,
        item_ids: &[String],
    ) -> BundlerResult<Vec<String>> {
        with_serializable_retry(|| async {
            let mut tx = self.begin_serializable().await?;
            let mut moved = Vec::with_capacity(item_ids.len());

            for id in item_ids {
                let result = sqlx::query(
                    "INSERT INTO planned_data_item
                         (data_item_id, plan_id, owner_public_key, owner_address,
                          signature_type, byte_count, payload_data_start,
                          payload_content_type, assessed_winston_price, uploaded_date,
                          deadline_height, failed_bundles, premium_feature_type)
                     SELECT data_item_id, $2, owner_public_key, owner_address,
                            signature_type, byte_count, payload_data_start,
                            payload_content_type, assessed_winston_price, uploaded_date,
                            deadline_height, failed_bundles, premium_feature_type
                     FROM new_data_item WHERE data_item_id = $1
                     ON CONFLICT (data_item_id) DO NOTHING",
                )
                .bind(id)
                .bind(plan_id)
                .execute(&mut *tx)
                .await
                .map_err(BundlerError::Database)?;

                if result.rows_affected() > 0 {
                    sqlx::query("DELETE FROM new_data_item WHERE data_item_id = $1")
                        .bind(id)
                        .execute(&mut *tx)
                        .await
                        .map_err(BundlerError::Database)?;
                    moved.push(id.clone());
                }
            }

            if !moved.is_empty() {
                sqlx::query(
                    "INSERT INTO bundle_plan (plan_id) VALUES ($1) ON CONFLICT (plan_id) DO NOTHING",
                )
                .bind(plan_id)
                .execute(&mut *tx)
                .await
                .map_err(BundlerError::Database)?;
            }

            tx.commit().await.map_err(BundlerError::Database)?;
            Ok(moved)
        })
        .await
    }

    async fn insert_new_bundle(&self, bundle: &Bundle) -> BundlerResult<()> {
        with_serializable_retry(|| async {
            let mut tx = self.begin_serializable().await?;

            let deleted = sqlx::query("DELETE FROM bundle_plan WHERE plan_id = $1")
                .bind(&bundle.plan_id)
                .execute(&mut *tx)
                .await
                .map_err(BundlerError::Database)?;

            if deleted.rows_affected() == 0 {
                return Err(BundlerError::PlanNotFound(bundle.plan_id.clone()));
            }

            sqlx::query(
                "INSERT INTO new_bundle
                     (bundle_id, plan_id, reward, header_byte_count, payload_byte_count,
                      transaction_byte_count, planned_date, signed_date)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
            )
            .bind(&bundle.bundle_id)
            .bind(&bundle.plan_id)
            .bind(bundle.reward.to_string())
            .bind(bundle.header_byte_count as i64)
            .bind(bundle.payload_byte_count as i64)
            .bind(bundle.transaction_byte_count as i64)
            .bind(bundle.planned_date)
            .bind(bundle.signed_date)
            .execute(&mut *tx)
            .await
            .map_err(BundlerError::Database)?;

            tx.commit().await.map_err(BundlerError::Database)?;
            Ok(())
        })
        .await
    }

    async fn insert_posted_bundle(
        &self,
        bundle_id: &str,
        usd_to_ar_rate: Option<f64>,
    ) -> BundlerResult<()> {
        with_serializable_retry(|| async {
            let mut tx = self.begin_serializable().await?;

            let moved = sqlx::query(
                "INSERT INTO posted_bundle
                     (bundle_id, plan_id, reward, header_byte_count, payload_byte_count,
                      transaction_byte_count, usd_to_ar_rate, planned_date, signed_date)
                 SELECT bundle_id, plan_id, reward, header_byte_count, payload_byte_count,
                        transaction_byte_count, $2, planned_date, signed_date
                 FROM new_bundle WHERE bundle_id = $1
                 ON CONFLICT (bundle_id) DO NOTHING",
            )
            .bind(bundle_id)
            .bind(usd_to_ar_rate)
            .execute(&mut *tx)
            .await
            .map_err(BundlerError::Database)?;

            if moved.rows_affected() > 0 {
                sqlx::query("DELETE FROM new_bundle WHERE bundle_id = $1")
                    .bind(bundle_id)
                    .execute(&mut *tx)
                    .await
                    .map_err(BundlerError::Database)?;
            }
            // rows_affected == 0 means the bundle already advanced past
            // new_bundle (replay of an at-least-once delivery); no-op.

            tx.commit().await.map_err(BundlerError::Database)?;
            Ok(())
        })
        .await
    }

    async fn insert_seeded_bundle(&self, bundle_id: &str) -> BundlerResult<()> {
        with_serializable_retry(|| async {
            let mut tx = self.begin_serializable().await?;

            let moved = sqlx::query(
                "INSERT INTO seeded_bundle
                     (bundle_id, plan_id, reward, header_byte_count, payload_byte_count,
                      transaction_byte_count, usd_to_ar_rate, planned_date, signed_date,
                      posted_date)
                 SELECT bundle_id, plan_id, reward, header_byte_count, payload_byte_count,
                        transaction_byte_count, usd_to_ar_rate, planned_date, signed_date,
                        posted_date
                 FROM posted_bundle WHERE bundle_id = $1
                 ON CONFLICT (bundle_id) DO NOTHING",
            )
            .bind(bundle_id)
            .execute(&mut *tx)
            .await
            .map_err(BundlerError::Database)?;

            if moved.rows_affected() > 0 {
                sqlx::query("DELETE FROM posted_bundle WHERE bundle_id = $1")
                    .bind(bundle_id)
                    .execute(&mut *tx)
                    .await
                    .map_err(BundlerError::Database)?;
            }

            tx.commit().await.map_err(BundlerError::Database)?;
            Ok(())
        })
        .await
    }

    async fn update_bundle_as_permanent(
        &self,
        plan_id: &str,
        block_height: u64,
        indexed_on_gql: bool,
    ) -> BundlerResult<()> {
        with_serializable_retry(|| async {
            let mut tx = self.begin_serializable().await?;

            let moved = sqlx::query(
                "INSERT INTO permanent_bundle
                     (bundle_id, plan_id, reward, header_byte_count, payload_byte_count,
                      transaction_byte_count, usd_to_ar_rate, planned_date, signed_date,
                      posted_date, seeded_date, block_height, indexed_on_gql)
                 SELECT bundle_id, plan_id, reward, header_byte_count, payload_byte_count,
                        transaction_byte_count, usd_to_ar_rate, planned_date, signed_date,
                        posted_date, seeded_date, $2, $3
                 FROM seeded_bundle WHERE plan_id = $1
                 ON CONFLICT (bundle_id) DO NOTHING",
            )
            .bind(plan_id)
            .bind(block_height as i64)
            .bind(indexed_on_gql)
            .execute(&mut *tx)
            .await
            .map_err(BundlerError::Database)?;

            if moved.rows_affected() > 0 {
                sqlx::query("DELETE FROM seeded_bundle WHERE plan_id = $1")
                    .bind(plan_id)
                    .execute(&mut *tx)
                    .await
                    .map_err(BundlerError::Database)?;
            }

            tx.commit().await.map_err(BundlerError::Database)?;
            Ok(())
        })
        .await
    }

    async fn update_seeded_bundle_to_dropped(
        &self,
        plan_id: &str,
        bundle_id: &str,
        retry_limit: u32,
    ) -> BundlerResult<()> {
        let item_ids = move_bundle_to_failed(
            self,
            plan_id,
            bundle_id,
            "seeded_bundle",
            "tx lost beyond re-post threshold",
        )
        .await?;
        if !item_ids.is_empty() {
            self.update_data_items_to_be_repacked(&item_ids, bundle_id, retry_limit)
                .await?;
        }
        Ok(())
    }

    async fn update_new_bundle_to_failed_to_post(
        &self,
        plan_id: &str,
        bundle_id: &str,
        retry_limit: u32,
    ) -> BundlerResult<()> {
        let item_ids = move_bundle_to_failed(
            self,
            plan_id,
            bundle_id,
            "new_bundle",
            "gateway rejected post_tx",
        )
        .await?;
        if !item_ids.is_empty() {
            self.update_data_items_to_be_repacked(&item_ids, bundle_id, retry_limit)
                .await?;
        }
        Ok(())
    }

    async fn get_seeded_bundles(&self, older_than: DateTime<Utc>) -> BundlerResult<Vec<Bundle>> {
        let rows: Vec<BundleRow> = sqlx::query_as(
            "SELECT bundle_id, plan_id, reward, header_byte_count, payload_byte_count,
                    transaction_byte_count, usd_to_ar_rate, planned_date, signed_date,
                    posted_date, seeded_date, NULL::TIMESTAMPTZ AS permanent_date,
                    NULL::TIMESTAMPTZ AS failed_date, NULL::BIGINT AS block_height,
                    NULL::BOOLEAN AS indexed_on_gql, NULL::TEXT AS failed_reason
             FROM seeded_bundle
             WHERE seeded_date <= $1
             ORDER BY seeded_date ASC",
        )
        .bind(older_than)
        .fetch_all(self.pool())
        .await
        .map_err(BundlerError::Database)?;

        rows.into_iter().map(BundleRow::into_domain).collect()
    }

    async fn get_new_bundle(&self, plan_id: &str) -> BundlerResult<Bundle> {
        let row: BundleRow = sqlx::query_as(
            "SELECT bundle_id, plan_id, reward, header_byte_count, payload_byte_count,
                    transaction_byte_count, NULL::DOUBLE PRECISION AS usd_to_ar_rate,
                    planned_date, signed_date, NULL::TIMESTAMPTZ AS posted_date,
                    NULL::TIMESTAMPTZ AS seeded_date, NULL::TIMESTAMPTZ AS permanent_date,
                    NULL::TIMESTAMPTZ AS failed_date, NULL::BIGINT AS block_height,
                    NULL::BOOLEAN AS indexed_on_gql, NULL::TEXT AS failed_reason
             FROM new_bundle WHERE plan_id = $1",
        )
        .bind(plan_id)
        .fetch_optional(self.pool())
        .await
        .map_err(BundlerError::Database)?
        .ok_or_else(|| BundlerError::PlanNotFound(plan_id.to_string()))?;

        row.into_domain()
    }

    async fn get_posted_bundle(&self, plan_id: &str) -> BundlerResult<Bundle> {
        let row: BundleRow = sqlx::query_as(
            "SELECT bundle_id, plan_id, reward, header_byte_count, payload_byte_count,
                    transaction_byte_count, usd_to_ar_rate, planned_date, signed_date,
                    posted_date, NULL::TIMESTAMPTZ AS seeded_date,
                    NULL::TIMESTAMPTZ AS permanent_date, NULL::TIMESTAMPTZ AS failed_date,
                    NULL::BIGINT AS block_height, NULL::BOOLEAN AS indexed_on_gql,
                    NULL::TEXT AS failed_reason
             FROM posted_bundle WHERE plan_id = $1",
        )
        .bind(plan_id)
        .fetch_optional(self.pool())
        .await
        .map_err(BundlerError::Database)?
        .ok_or_else(|| BundlerError::PlanNotFound(plan_id.to_string()))?;

        row.into_domain()
    }
}

/// Move a row from `source_table` into `failed_bundle`, keyed by `plan_id`,
/// and return the ids of the plan's items still in `planned_data_item` so
/// the caller can reroute them. `source_table` is one of the small fixed
/// set of table names this module controls, never user input.
async fn move_bundle_to_failed(
    store: &PgStateStore,
    plan_id: &str,
    bundle_id: &str,
    source_table: &'static str,
    failed_reason: &str,
) -> BundlerResult<Vec<String>> {
    with_serializable_retry(|| async {
        let mut tx = store.begin_serializable().await?;

        let insert_sql = format!(
            "INSERT INTO failed_bundle
                 (bundle_id, plan_id, reward, header_byte_count, payload_byte_count,
                  transaction_byte_count, usd_to_ar_rate, planned_date, signed_date,
                  posted_date, seeded_date, failed_reason)
             SELECT bundle_id, plan_id, reward, header_byte_count, payload_byte_count,
                    transaction_byte_count, usd_to_ar_rate, planned_date, signed_date,
                    posted_date, seeded_date, $3
             FROM {source_table} WHERE plan_id = $1 AND bundle_id = $2
             ON CONFLICT (bundle_id) DO NOTHING",
        );
        let moved = sqlx::query(&insert_sql)
            .bind(plan_id)
            .bind(bundle_id)
            .bind(failed_reason)
            .execute(&mut *tx)
            .await
            .map_err(BundlerError::Database)?;

        if moved.rows_affected() > 0 {
            let delete_sql = format!("DELETE FROM {source_table} WHERE plan_id = $1");
            sqlx::query(&delete_sql)
                .bind(plan_id)
                .execute(&mut *tx)
                .await
                .map_err(BundlerError::Database)?;
        }

        let item_rows = sqlx::query("SELECT data_item_id FROM planned_data_item WHERE plan_id = $1")
            .bind(plan_id)
            .fetch_all(&mut *tx)
            .await
            .map_err(BundlerError::Database)?;
        let item_ids = item_rows
            .into_iter()
            .map(|r| r.try_get::<String, _>("data_item_id"))
            .collect::<Result<Vec<_>, _>>()
            .map_err(BundlerError::Database)?;

        tx.commit().await.map_err(BundlerError::Database)?;
        Ok(item_ids)
    })
    .await
}
