// `FromRow` row types and their conversions to/from the shared domain
// types. Kept separate from the query logic so the SQL-facing shape of a
// table and the service-facing shape of `DataItem`/`Bundle` can drift
// independently (e.g. `failed_bundles` is a `TEXT[]` column but a `Vec<String>`
// field either way, no drift there today, but `assessed_winston_price` is a
// `TEXT` column and a `U256` field).

use bundler_common::bundle::Bundle;
use bundler_common::data_item::DataItem;
use chrono::{DateTime, Utc};
use primitive_types::U256;
use sqlx::FromRow;

use crate::core::error::{BundlerError, BundlerResult};

#[derive(Debug, FromRow)]
pub struct DataItemRow {
    pub data_item_id: String,
    pub owner_public_key: Vec<u8>,
    pub owner_address: String,
    pub signature_type: i16,
    pub byte_count: i64,
    pub payload_data_start: i64,
    pub payload_content_type: Option<String>,
    pub assessed_winston_price: String,
    pub uploaded_date: DateTime<Utc>,
    pub deadline_height: i64,
    pub failed_bundles: Vec<String>,
    pub premium_feature_type: Option<String>,
}

impl DataItemRow {
    pub fn from_domain(item: &DataItem) -> Self {
        Self {
            data_item_id: item.data_item_id.clone(),
            owner_public_key: item.owner_public_key.clone(),
            owner_address: item.owner_address.clone(),
            signature_type: item.signature_type as i16,
            byte_count: item.byte_count as i64,
            payload_data_start: item.payload_data_start as i64,
            payload_content_type: item.payload_content_type.clone(),
            assessed_winston_price: item.assessed_winston_price.to_string(),
            uploaded_date: item.uploaded_date,
            deadline_height: item.deadline_height as i64,
            failed_bundles: item.failed_bundles.clone(),
            premium_feature_type: item.premium_feature_type.clone(),
        }
    }

    pub fn into_domain(self) -> BundlerResult<DataItem> {
        let assessed_winston_price = U256::from_dec_str(&self.assessed_winston_price)
            .map_err(|e| BundlerError::Irrecoverable(format!("bad winston price in row: {e}")))?;
        Ok(DataItem {
            data_item_id: self.data_item_id,
            owner_public_key: self.owner_public_key,
            owner_address: self.owner_address,
            signature_type: self.signature_type as u16,
            byte_count: self.byte_count as u64,
            payload_data_start: self.payload_data_start as u64,
            payload_content_type: self.payload_content_type,
            assessed_winston_price,
            uploaded_date: self.uploaded_date,
            deadline_height: self.deadline_height as u64,
            failed_bundles: self.failed_bundles,
            premium_feature_type: self.premium_feature_type,
        })
    }
}

#[derive(Debug, FromRow)]
pub struct BundleRow {
    pub bundle_id: String,
    pub plan_id: String,
    pub reward: String,
    pub header_byte_count: i64,
    pub payload_byte_count: i64,
    pub transaction_byte_count: i64,
    pub usd_to_ar_rate: Option<f64>,
    pub planned_date: DateTime<Utc>,
    pub signed_date: Option<DateTime<Utc>>,
    #[sqlx(default)]
    pub posted_date: Option<DateTime<Utc>>,
    #[sqlx(default)]
    pub seeded_date: Option<DateTime<Utc>>,
    #[sqlx(default)]
    pub permanent_date: Option<DateTime<Utc>>,
    #[sqlx(default)]
    pub failed_date: Option<DateTime<Utc>>,
    #[sqlx(default)]
    pub block_height: Option<i64>,
    #[sqlx(default)]
    pub indexed_on_gql: Option<bool>,
    #[sqlx(default)]
    pub failed_reason: Option<String>,
}

impl BundleRow {
    pub fn into_domain(self) -> BundlerResult<Bundle> {
        let reward = U256::from_dec_str(&self.reward)
            .map_err(|e| BundlerError::Irrecoverable(format!("bad reward in row: {e}")))?;
        Ok(Bundle {
            bundle_id: self.bundle_id,
            plan_id: self.plan_id,
            reward,
            header_byte_count: self.header_byte_count as u64,
            payload_byte_count: self.payload_byte_count as u64,
            transaction_byte_count: self.transaction_byte_count as u64,
            usd_to_ar_rate: self.usd_to_ar_rate,
            planned_date: self.planned_date,
            signed_date: self.signed_date,
            posted_date: self.posted_date,
            seeded_date: self.seeded_date,
            permanent_date: self.permanent_date,
            failed_date: self.failed_date,
            block_height: self.block_height.map(|h| h as u64),
            indexed_on_gql: self.indexed_on_gql.unwrap_or(false),
            failed_reason: self.failed_reason,
        })
    }
}
