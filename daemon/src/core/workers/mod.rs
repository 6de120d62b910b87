// Workers C5–C9: one free function per stage, each taking a shared
// [`WorkerContext`] and one message, returning a [`BundlerResult<()>`] the
// queue dispatcher (C10, `core::queue`) uses to decide ack/nack. This
// mirrors spec §4.5's explicit idempotence note: replaying a worker on an
// already-advanced plan/bundle must be a no-op, never an error.

pub mod plan;
pub mod post;
pub mod prepare;
pub mod seed;
pub mod verify;

use std::sync::Arc;

use crate::config::Config;
use crate::core::gateway::GatewayAdapter;
use crate::core::objectstore::ObjectStoreAdapter;
use crate::core::queue::Queue;
use crate::core::signer::Ed25519TxSigner;
use crate::core::storage::StateStore;

/// Message bodies carried on each stage's queue (spec §6). Plan and verify
/// are periodic scans triggered by an essentially empty message; prepare,
/// post, and seed each carry the `plan_id` they operate on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanTick;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifyTick;

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct PrepareJob {
    pub plan_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct PostJob {
    pub plan_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct SeedJob {
    pub plan_id: String,
}

/// Shared handles every worker needs. Cloneable and cheap (everything
/// inside is already an `Arc`), so each stage's dispatcher closure can hold
/// its own copy.
#[derive(Clone)]
pub struct WorkerContext {
    pub store: Arc<dyn StateStore>,
    pub object_store: Arc<dyn ObjectStoreAdapter>,
    pub gateway: Arc<dyn GatewayAdapter>,
    pub signer: Arc<Ed25519TxSigner>,
    pub config: Arc<Config>,
    pub prepare_queue: Arc<dyn Queue<PrepareJob>>,
    pub post_queue: Arc<dyn Queue<PostJob>>,
    pub seed_queue: Arc<dyn Queue<SeedJob>>,
}
