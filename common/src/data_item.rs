// The atomic unit bundled by the pipeline. See spec §3.

use chrono::{DateTime, Utc};
use primitive_types::U256;
use serde::{Deserialize, Serialize};

/// Which table currently owns a `data_item_id`. A given id appears in
/// exactly one of these tables at any instant (spec §3 invariant 1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataItemState {
    New,
    Planned,
    Permanent,
    Failed,
}

/// Reason a data item landed in `failed_data_item`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    /// `failed_bundles` reached `retry_limit_for_failed_data_items`.
    TooManyFailures,
    /// The object store reported the raw item missing during prepare.
    MissingFromObjectStore,
    /// A terminal store-level failure not covered by the above.
    Other(String),
}

/// A signed, self-describing binary data item staged for bundling.
///
/// Field names follow spec §3 directly; `signature` and the raw bytes
/// backing the item live in the object store (`raw-data-item/{id}`), not in
/// this struct, to keep rows small.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataItem {
    /// 43-char URL-safe base64 content-hash of `signature`.
    pub data_item_id: String,
    pub owner_public_key: Vec<u8>,
    /// 43-char hash of `owner_public_key`.
    pub owner_address: String,
    pub signature_type: u16,
    pub byte_count: u64,
    /// Offset within the raw blob where the payload begins.
    pub payload_data_start: u64,
    pub payload_content_type: Option<String>,
    pub assessed_winston_price: U256,
    pub uploaded_date: DateTime<Utc>,
    /// Block height this item must be permanent by.
    pub deadline_height: u64,
    /// Ordered list of bundle ids this item has ridden in and lost.
    pub failed_bundles: Vec<String>,
    pub premium_feature_type: Option<String>,
}

impl DataItem {
    pub fn new_for_ingest(
        data_item_id: String,
        owner_public_key: Vec<u8>,
        owner_address: String,
        signature_type: u16,
        byte_count: u64,
        payload_data_start: u64,
        payload_content_type: Option<String>,
        assessed_winston_price: U256,
        deadline_height: u64,
    ) -> Self {
        Self {
            data_item_id,
            owner_public_key,
            owner_address,
            signature_type,
            byte_count,
            payload_data_start,
            payload_content_type,
            assessed_winston_price,
            uploaded_date: Utc::now(),
            deadline_height,
            failed_bundles: Vec::new(),
            premium_feature_type: None,
        }
    }
}

/// Result of `get_data_item_info`: either the item's current status, or
/// `NotFound` if the id is not known to the store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum DataItemInfo {
    Found {
        status: DataItemState,
        assessed_winston_price: U256,
        bundle_id: Option<String>,
    },
    NotFound,
}
