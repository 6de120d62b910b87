// A single on-chain transaction carrying many data items. See spec §3.

use chrono::{DateTime, Utc};
use primitive_types::U256;
use serde::{Deserialize, Serialize};

/// Which table currently owns a `bundle_id` / `plan_id`. See spec §3
/// invariants 2 and 3.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BundleState {
    Planned,
    New,
    Posted,
    Seeded,
    Permanent,
    Failed,
}

/// A set of data item ids earmarked to ride together in one future bundle.
/// Lives briefly between the plan worker and the prepare worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BundlePlan {
    pub plan_id: String,
    pub planned_date: DateTime<Utc>,
    pub item_ids: Vec<String>,
}

/// A bundle: one on-chain transaction whose payload is the ANS-104
/// container of its items (see spec §6).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bundle {
    /// 43-char transaction id. Empty until the prepare worker signs the tx.
    pub bundle_id: String,
    pub plan_id: String,
    pub reward: U256,
    pub header_byte_count: u64,
    pub payload_byte_count: u64,
    pub transaction_byte_count: u64,
    pub usd_to_ar_rate: Option<f64>,

    pub planned_date: DateTime<Utc>,
    pub signed_date: Option<DateTime<Utc>>,
    pub posted_date: Option<DateTime<Utc>>,
    pub seeded_date: Option<DateTime<Utc>>,
    pub permanent_date: Option<DateTime<Utc>>,
    pub failed_date: Option<DateTime<Utc>>,

    /// Set only at permanence.
    pub block_height: Option<u64>,
    /// Set at permanence: whether the bundle's own tx is indexed on GQL.
    pub indexed_on_gql: bool,
    pub failed_reason: Option<String>,
}

impl Bundle {
    pub fn new_for_plan(plan_id: String, reward: U256) -> Self {
        Self {
            bundle_id: String::new(),
            plan_id,
            reward,
            header_byte_count: 0,
            payload_byte_count: 0,
            transaction_byte_count: 0,
            usd_to_ar_rate: None,
            planned_date: Utc::now(),
            signed_date: None,
            posted_date: None,
            seeded_date: None,
            permanent_date: None,
            failed_date: None,
            block_height: None,
            indexed_on_gql: false,
            failed_reason: None,
        }
    }
}
