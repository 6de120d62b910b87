// In-memory stand-ins for the state store, object store, and gateway, used
// by worker and dispatcher unit tests (spec §8's end-to-end scenarios) so
// they run without a database, filesystem, or network connection.

use std::collections::HashMap;
use std::ops::Range;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use bundler_common::bundle::Bundle;
use bundler_common::data_item::{DataItem, DataItemInfo, DataItemState, FailureReason};
use chrono::{DateTime, Utc};
use primitive_types::U256;
use tokio::io::AsyncReadExt;

use crate::core::error::{BundlerError, BundlerResult};
use crate::core::gateway::{GatewayAdapter, GqlItemRecord, TxHeader, TxStatus};
use crate::core::objectstore::{ByteStream, ObjectMeta, ObjectStoreAdapter};
use crate::core::storage::providers::{BundleProvider, DataItemProvider};

#[derive(Default)]
struct StateStoreState {
    new_data_item: HashMap<String, DataItem>,
    planned_data_item: HashMap<String, (DataItem, String)>,
    permanent_data_item: HashMap<String, (DataItem, String)>,
    failed_data_item: HashMap<String, (DataItem, FailureReason)>,

    bundle_plan: HashMap<String, Vec<String>>,
    new_bundle: HashMap<String, Bundle>,
    posted_bundle: HashMap<String, Bundle>,
    seeded_bundle: HashMap<String, Bundle>,
    permanent_bundle: Vec<Bundle>,
    failed_bundle: Vec<Bundle>,
}

/// Single-process substitute for `PgStateStore`. Not transactional in any
/// real sense — each call takes the whole-store lock for its duration — but
/// preserves the same table-membership invariants the Postgres
/// implementation enforces, which is what the workers under test rely on.
pub struct InMemoryStateStore {
    state: Mutex<StateStoreState>,
}

impl InMemoryStateStore {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(StateStoreState::default()),
        }
    }

    /// Test-only peek at `permanent_bundle` membership, for asserting a
    /// bundle actually reached its terminal state rather than just leaving
    /// `seeded_bundle`.
    pub fn permanent_bundle_ids(&self) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .permanent_bundle
            .iter()
            .map(|b| b.bundle_id.clone())
            .collect()
    }
}

impl Default for InMemoryStateStore {
    fn default() -> Self {
        Self::new()
    }
}

// `StateStore` is blanket-implemented for any `DataItemProvider + BundleProvider`
// (see `core::storage::StateStore`), so no explicit impl is needed here.

#[async_trait]
impl DataItemProvider for InMemoryStateStore {
    async fn insert_new_data_item(&self, item: &DataItem) -> BundlerResult<()> {
        let mut state = self.state.lock().unwrap();
        if state.planned_data_item.contains_key(&item.data_item_id)
            || state.permanent_data_item.contains_key(&item.data_item_id)
            || state.new_data_item.contains_key(&item.data_item_id)
        {
            return Err(BundlerError::BadInput(format!(
                "data item {} already exists",
                item.data_item_id
            )));
        }
        state.failed_data_item.remove(&item.data_item_id);
        state.new_data_item.insert(item.data_item_id.clone(), item.clone());
        Ok(())
    }

    async fn insert_new_data_item_batch(&self, items: &[DataItem]) -> BundlerResult<usize> {
        let mut state = self.state.lock().unwrap();
        let mut inserted = 0usize;
        let mut seen = std::collections::HashSet::new();
        for item in items {
            if !seen.insert(item.data_item_id.clone()) {
                continue;
            }
            if state.planned_data_item.contains_key(&item.data_item_id)
                || state.permanent_data_item.contains_key(&item.data_item_id)
                || state.new_data_item.contains_key(&item.data_item_id)
            {
                continue;
            }
            state.failed_data_item.remove(&item.data_item_id);
            state.new_data_item.insert(item.data_item_id.clone(), item.clone());
            inserted += 1;
        }
        Ok(inserted)
    }

    async fn get_new_data_items(
        &self,
        max: i64,
        older_than: DateTime<Utc>,
    ) -> BundlerResult<Vec<DataItem>> {
        let state = self.state.lock().unwrap();
        let mut items: Vec<DataItem> = state
            .new_data_item
            .values()
            .filter(|item| item.uploaded_date <= older_than)
            .cloned()
            .collect();
        items.sort_by_key(|item| item.uploaded_date);
        items.truncate(max.max(0) as usize);
        Ok(items)
    }

    async fn get_data_item_info(&self, id: &str) -> BundlerResult<DataItemInfo> {
        let state = self.state.lock().unwrap();
        if let Some(item) = state.new_data_item.get(id) {
            return Ok(DataItemInfo::Found {
                status: DataItemState::New,
                assessed_winston_price: item.assessed_winston_price,
                bundle_id: None,
            });
        }
        if let Some((item, plan_id)) = state.planned_data_item.get(id) {
            return Ok(DataItemInfo::Found {
                status: DataItemState::Planned,
                assessed_winston_price: item.assessed_winston_price,
                bundle_id: Some(plan_id.clone()),
            });
        }
        if let Some((item, bundle_id)) = state.permanent_data_item.get(id) {
            return Ok(DataItemInfo::Found {
                status: DataItemState::Permanent,
                assessed_winston_price: item.assessed_winston_price,
                bundle_id: Some(bundle_id.clone()),
            });
        }
        if let Some((item, _reason)) = state.failed_data_item.get(id) {
            return Ok(DataItemInfo::Found {
                status: DataItemState::Failed,
                assessed_winston_price: item.assessed_winston_price,
                bundle_id: None,
            });
        }
        Ok(DataItemInfo::NotFound)
    }

    async fn get_planned_data_items(&self, plan_id: &str) -> BundlerResult<Vec<DataItem>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .planned_data_item
            .values()
            .filter(|(_, p)| p == plan_id)
            .map(|(item, _)| item.clone())
            .collect())
    }

    async fn revert_planned_data_items_to_new(&self, ids: &[String]) -> BundlerResult<()> {
        let mut state = self.state.lock().unwrap();
        for id in ids {
            if let Some((item, _plan_id)) = state.planned_data_item.remove(id) {
                state.new_data_item.insert(id.clone(), item);
            }
        }
        Ok(())
    }

    async fn update_planned_data_item_as_failed(
        &self,
        id: &str,
        reason: FailureReason,
    ) -> BundlerResult<()> {
        let mut state = self.state.lock().unwrap();
        if let Some((item, _)) = state.planned_data_item.remove(id) {
            state.failed_data_item.insert(id.to_string(), (item, reason));
        }
        Ok(())
    }

    async fn update_data_items_to_be_repacked(
        &self,
        ids: &[String],
        losing_bundle_id: &str,
        retry_limit: u32,
    ) -> BundlerResult<()> {
        let mut state = self.state.lock().unwrap();
        for id in ids {
            let Some((mut item, _plan_id)) = state.planned_data_item.remove(id) else {
                continue;
            };
            item.failed_bundles.push(losing_bundle_id.to_string());
            if (item.failed_bundles.len() as u32) < retry_limit {
                state.new_data_item.insert(id.clone(), item);
            } else {
                state
                    .failed_data_item
                    .insert(id.clone(), (item, FailureReason::TooManyFailures));
            }
        }
        Ok(())
    }

    async fn update_data_items_as_permanent(
        &self,
        bundle_id: &str,
        ids: &[String],
    ) -> BundlerResult<()> {
        let mut state = self.state.lock().unwrap();
        for id in ids {
            if let Some((item, _plan_id)) = state.planned_data_item.remove(id) {
                state
                    .permanent_data_item
                    .insert(id.clone(), (item, bundle_id.to_string()));
            }
        }
        Ok(())
    }
}

#[async_trait]
impl BundleProvider for InMemoryStateStore {
    async fn insert_bundle_plan(
        &self,
        plan_id: &str,
        item_ids: &[String],
    ) -> BundlerResult<Vec<String>> {
        let mut state = self.state.lock().unwrap();
        let mut moved = Vec::with_capacity(item_ids.len());
        for id in item_ids {
            if let Some(item) = state.new_data_item.remove(id) {
                state
                    .planned_data_item
                    .insert(id.clone(), (item, plan_id.to_string()));
                moved.push(id.clone());
            }
        }
        if !moved.is_empty() {
            state.bundle_plan.insert(plan_id.to_string(), moved.clone());
        }
        Ok(moved)
    }

    async fn insert_new_bundle(&self, bundle: &Bundle) -> BundlerResult<()> {
        let mut state = self.state.lock().unwrap();
        if state.bundle_plan.remove(&bundle.plan_id).is_none() {
            return Err(BundlerError::PlanNotFound(bundle.plan_id.clone()));
        }
        state.new_bundle.insert(bundle.plan_id.clone(), bundle.clone());
        Ok(())
    }

    async fn insert_posted_bundle(
        &self,
        bundle_id: &str,
        usd_to_ar_rate: Option<f64>,
    ) -> BundlerResult<()> {
        let mut state = self.state.lock().unwrap();
        let plan_id = state
            .new_bundle
            .iter()
            .find(|(_, b)| b.bundle_id == bundle_id)
            .map(|(plan_id, _)| plan_id.clone());
        let Some(plan_id) = plan_id else {
            return Ok(());
        };
        if let Some(mut bundle) = state.new_bundle.remove(&plan_id) {
            bundle.usd_to_ar_rate = usd_to_ar_rate;
            bundle.posted_date = Some(Utc::now());
            state.posted_bundle.insert(plan_id, bundle);
        }
        Ok(())
    }

    async fn insert_seeded_bundle(&self, bundle_id: &str) -> BundlerResult<()> {
        let mut state = self.state.lock().unwrap();
        let plan_id = state
            .posted_bundle
            .iter()
            .find(|(_, b)| b.bundle_id == bundle_id)
            .map(|(plan_id, _)| plan_id.clone());
        let Some(plan_id) = plan_id else {
            return Ok(());
        };
        if let Some(mut bundle) = state.posted_bundle.remove(&plan_id) {
            bundle.seeded_date = Some(Utc::now());
            state.seeded_bundle.insert(plan_id, bundle);
        }
        Ok(())
    }

    async fn update_bundle_as_permanent(
        &self,
        plan_id: &str,
        block_height: u64,
        indexed_on_gql: bool,
    ) -> BundlerResult<()> {
        let mut state = self.state.lock().unwrap();
        if let Some(mut bundle) = state.seeded_bundle.remove(plan_id) {
            bundle.block_height = Some(block_height);
            bundle.indexed_on_gql = indexed_on_gql;
            bundle.permanent_date = Some(Utc::now());
            state.permanent_bundle.push(bundle);
        }
        Ok(())
    }

    async fn update_seeded_bundle_to_dropped(
        &self,
        plan_id: &str,
        bundle_id: &str,
        retry_limit: u32,
    ) -> BundlerResult<()> {
        let item_ids = {
            let mut state = self.state.lock().unwrap();
            let Some(mut bundle) = state.seeded_bundle.remove(plan_id) else {
                return Ok(());
            };
            bundle.failed_reason = Some("tx lost beyond re-post threshold".to_string());
            bundle.failed_date = Some(Utc::now());
            state.failed_bundle.push(bundle);
            state
                .planned_data_item
                .iter()
                .filter(|(_, (_, p))| p == plan_id)
                .map(|(id, _)| id.clone())
                .collect::<Vec<_>>()
        };
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
        let item_ids = {
            let mut state = self.state.lock().unwrap();
            let Some(mut bundle) = state.new_bundle.remove(plan_id) else {
                return Ok(());
            };
            bundle.failed_reason = Some("gateway rejected post_tx".to_string());
            bundle.failed_date = Some(Utc::now());
            state.failed_bundle.push(bundle);
            state
                .planned_data_item
                .iter()
                .filter(|(_, (_, p))| p == plan_id)
                .map(|(id, _)| id.clone())
                .collect::<Vec<_>>()
        };
        if !item_ids.is_empty() {
            self.update_data_items_to_be_repacked(&item_ids, bundle_id, retry_limit)
                .await?;
        }
        Ok(())
    }

    async fn get_seeded_bundles(&self, older_than: DateTime<Utc>) -> BundlerResult<Vec<Bundle>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .seeded_bundle
            .values()
            .filter(|b| b.seeded_date.map(|d| d <= older_than).unwrap_or(false))
            .cloned()
            .collect())
    }

    async fn get_new_bundle(&self, plan_id: &str) -> BundlerResult<Bundle> {
        let state = self.state.lock().unwrap();
        state
            .new_bundle
            .get(plan_id)
            .cloned()
            .ok_or_else(|| BundlerError::PlanNotFound(plan_id.to_string()))
    }

    async fn get_posted_bundle(&self, plan_id: &str) -> BundlerResult<Bundle> {
        let state = self.state.lock().unwrap();
        state
            .posted_bundle
            .get(plan_id)
            .cloned()
            .ok_or_else(|| BundlerError::PlanNotFound(plan_id.to_string()))
    }
}

/// In-memory object store backed by a `HashMap`, standing in for
/// `FsObjectStore`/`S3ObjectStore` in worker tests.
pub struct FakeObjectStore {
    objects: Mutex<HashMap<String, Vec<u8>>>,
}

impl FakeObjectStore {
    pub fn new() -> Self {
        Self {
            objects: Mutex::new(HashMap::new()),
        }
    }

    pub fn insert(&self, key: &str, bytes: Vec<u8>) {
        self.objects.lock().unwrap().insert(key.to_string(), bytes);
    }
}

impl Default for FakeObjectStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ObjectStoreAdapter for FakeObjectStore {
    async fn put(&self, key: &str, mut body: ByteStream) -> BundlerResult<()> {
        let mut buf = Vec::new();
        body.read_to_end(&mut buf)
            .await
            .map_err(|e| BundlerError::ObjectStore(e.to_string()))?;
        self.objects.lock().unwrap().insert(key.to_string(), buf);
        Ok(())
    }

    async fn get(&self, key: &str, range: Option<Range<u64>>) -> BundlerResult<(ByteStream, String)> {
        let objects = self.objects.lock().unwrap();
        let bytes = objects
            .get(key)
            .ok_or_else(|| BundlerError::MissingFromObjectStore(key.to_string()))?;
        let slice = match range {
            Some(r) => bytes[r.start as usize..(r.end as usize).min(bytes.len())].to_vec(),
            None => bytes.clone(),
        };
        let etag = format!("{:x}", slice.len());
        Ok((Box::pin(std::io::Cursor::new(slice)), etag))
    }

    async fn head(&self, key: &str) -> BundlerResult<ObjectMeta> {
        let objects = self.objects.lock().unwrap();
        let bytes = objects
            .get(key)
            .ok_or_else(|| BundlerError::MissingFromObjectStore(key.to_string()))?;
        Ok(ObjectMeta {
            etag: format!("{:x}", bytes.len()),
            content_length: bytes.len() as u64,
            content_type: None,
        })
    }

    async fn remove(&self, key: &str) -> BundlerResult<()> {
        self.objects.lock().unwrap().remove(key);
        Ok(())
    }
}

/// Configurable fake gateway, standing in for `HttpGatewayClient`.
pub struct FakeGateway {
    pub price: Mutex<U256>,
    pub balance: Mutex<U256>,
    pub block_height: AtomicU64,
    pub anchor_height: AtomicU64,
    pub tx_statuses: Mutex<HashMap<String, TxStatus>>,
    pub gql_records: Mutex<HashMap<String, GqlItemRecord>>,
    pub reject_post: AtomicBool,
    pub fail_upload: AtomicBool,
    pub posted: Mutex<Vec<TxHeader>>,
}

impl FakeGateway {
    pub fn new() -> Self {
        Self {
            price: Mutex::new(U256::from(1000u64)),
            balance: Mutex::new(U256::from(u64::MAX)),
            block_height: AtomicU64::new(100),
            anchor_height: AtomicU64::new(0),
            tx_statuses: Mutex::new(HashMap::new()),
            gql_records: Mutex::new(HashMap::new()),
            reject_post: AtomicBool::new(false),
            fail_upload: AtomicBool::new(false),
            posted: Mutex::new(Vec::new()),
        }
    }

    pub fn set_tx_status(&self, id: &str, status: TxStatus) {
        self.tx_statuses.lock().unwrap().insert(id.to_string(), status);
    }

    pub fn set_gql_record(&self, id: &str, record: GqlItemRecord) {
        self.gql_records.lock().unwrap().insert(id.to_string(), record);
    }
}

impl Default for FakeGateway {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl GatewayAdapter for FakeGateway {
    async fn price_for_bytes(&self, _n: u64) -> BundlerResult<U256> {
        Ok(*self.price.lock().unwrap())
    }

    async fn post_tx(&self, header: &TxHeader) -> BundlerResult<()> {
        if self.reject_post.load(Ordering::SeqCst) {
            return Err(BundlerError::BadInput("gateway rejected post_tx".to_string()));
        }
        self.posted.lock().unwrap().push(header.clone());
        Ok(())
    }

    async fn upload_chunks(&self, _tx_id: &str, _payload: &[u8]) -> BundlerResult<()> {
        if self.fail_upload.load(Ordering::SeqCst) {
            return Err(BundlerError::Gateway("simulated chunk upload failure".to_string()));
        }
        Ok(())
    }

    async fn tx_status(&self, id: &str) -> BundlerResult<TxStatus> {
        Ok(self
            .tx_statuses
            .lock()
            .unwrap()
            .get(id)
            .copied()
            .unwrap_or(TxStatus::NotFound))
    }

    async fn current_block_height(&self) -> BundlerResult<u64> {
        Ok(self.block_height.load(Ordering::SeqCst))
    }

    async fn current_anchor(&self) -> BundlerResult<String> {
        Ok("fake-anchor".to_string())
    }

    async fn block_height_for_tx_anchor(&self, _anchor: &str) -> BundlerResult<u64> {
        Ok(self.anchor_height.load(Ordering::SeqCst))
    }

    async fn data_items_on_gql(&self, ids: &[String]) -> BundlerResult<Vec<GqlItemRecord>> {
        let records = self.gql_records.lock().unwrap();
        Ok(ids.iter().filter_map(|id| records.get(id).cloned()).collect())
    }

    async fn balance(&self, _wallet: &str) -> BundlerResult<U256> {
        Ok(*self.balance.lock().unwrap())
    }

    async fn usd_to_ar_rate(&self) -> BundlerResult<f64> {
        Ok(5.0)
    }
}
