// Daemon configuration: one field per spec §6 key, loaded from environment
// variables with typed defaults. Follows the teacher's `DEFAULT_*` const +
// env-override idiom (see tos_daemon::config) rather than a config-file
// format, since every key here is small and operationally set per-process.

use std::env;
use std::time::Duration;

use thiserror::Error;

pub const DEFAULT_RPC_BIND_ADDRESS: &str = "127.0.0.1:8080";
pub const DEFAULT_NETWORK_REQUEST_TIMEOUT_MS: u64 = 40_000;
pub const DEFAULT_TX_PERMANENT_THRESHOLD: u32 = 50;
pub const DEFAULT_TX_RE_POST_THRESHOLD_BLOCKS: u32 = 50;
pub const DEFAULT_RETRY_LIMIT_FOR_FAILED_DATA_ITEMS: u32 = 5;
pub const DEFAULT_MAX_BUNDLE_BYTE_COUNT: u64 = 500 * 1024 * 1024; // 500 MiB
pub const DEFAULT_MAX_DATA_ITEM_BYTE_COUNT: u64 = 512 * 1024 * 1024; // 512 MiB
pub const DEFAULT_MAX_DATA_ITEMS_PER_BUNDLE: usize = 2_500;
pub const DEFAULT_OVERDUE_THRESHOLD_MS: i64 = 1000 * 60 * 60 * 4; // 4 hours
pub const DEFAULT_BLOCK_HEIGHT_CACHE_TTL_SECS: u64 = 60;
/// How long a `new_data_item` row must sit before the plan worker considers
/// it eligible, so a burst of near-simultaneous uploads has a chance to
/// accumulate into one bundle instead of each triggering its own plan tick
/// (spec §4.5 step 1: "uploaded long enough ago to allow batch accumulation").
pub const DEFAULT_PLAN_BATCH_ACCUMULATION_DELAY_MS: i64 = 5_000;
/// Max items considered per plan-worker invocation (spec §4.5 step 1: "up
/// to N eligible items").
pub const DEFAULT_PLAN_SELECTION_BATCH_SIZE: i64 = 5_000;
pub const DEFAULT_PLAN_TICK_INTERVAL_MS: u64 = 10_000;
pub const DEFAULT_VERIFY_TICK_INTERVAL_MS: u64 = 30_000;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable: {0}")]
    Missing(&'static str),
    #[error("invalid value for {key}: {value}")]
    Invalid { key: &'static str, value: String },
}

/// Runtime configuration for the daemon. Constructed once at startup and
/// shared (behind an `Arc`) across every worker and the status RPC server.
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub data_item_bucket: String,
    pub arweave_gateway_url: String,
    pub rpc_bind_address: String,
    pub log_level: String,

    pub network_request_timeout: Duration,
    pub tx_permanent_threshold: u32,
    pub tx_re_post_threshold_blocks: u32,
    pub retry_limit_for_failed_data_items: u32,
    pub max_bundle_byte_count: u64,
    pub max_data_item_byte_count: u64,
    pub max_data_items_per_bundle: usize,
    pub overdue_threshold_ms: i64,
    pub block_height_cache_ttl: Duration,
    pub add_community_tip: bool,
    pub plan_batch_accumulation_delay: Duration,
    pub plan_selection_batch_size: i64,
    pub community_tip_target: Option<String>,
    pub community_tip_quantity: u64,

    pub plan_queue_url: String,
    pub prepare_queue_url: String,
    pub post_queue_url: String,
    pub seed_queue_url: String,
    pub wallet_secret_key_hex: String,
    pub object_store_root: String,
    /// Which `ObjectStoreAdapter` to construct (spec §4.2: "either local FS
    /// or remote S3-like store"): `"fs"` (default, development) or `"s3"`.
    pub object_store_backend: String,
    /// How often the plan worker scans `new_data_item` (spec §4.5 is a
    /// periodic scan, not a queue consumer — see `bin/main.rs`).
    pub plan_tick_interval: Duration,
    /// How often the verify worker scans `seeded_bundle` (spec §4.9).
    pub verify_tick_interval: Duration,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            database_url: require_env("DATABASE_URL")?,
            data_item_bucket: require_env("DATA_ITEM_BUCKET")?,
            arweave_gateway_url: require_env("ARWEAVE_GATEWAY_URL")?,
            rpc_bind_address: env_or("RPC_BIND_ADDRESS", DEFAULT_RPC_BIND_ADDRESS),
            log_level: env_or("LOG_LEVEL", "info"),

            network_request_timeout: Duration::from_millis(env_parse_or(
                "NETWORK_REQUEST_TIMEOUT_MS",
                DEFAULT_NETWORK_REQUEST_TIMEOUT_MS,
            )?),
            tx_permanent_threshold: env_parse_or(
                "TX_PERMANENT_THRESHOLD",
                DEFAULT_TX_PERMANENT_THRESHOLD,
            )?,
            tx_re_post_threshold_blocks: env_parse_or(
                "TX_RE_POST_THRESHOLD_BLOCKS",
                DEFAULT_TX_RE_POST_THRESHOLD_BLOCKS,
            )?,
            retry_limit_for_failed_data_items: env_parse_or(
                "RETRY_LIMIT_FOR_FAILED_DATA_ITEMS",
                DEFAULT_RETRY_LIMIT_FOR_FAILED_DATA_ITEMS,
            )?,
            max_bundle_byte_count: env_parse_or(
                "MAX_BUNDLE_BYTE_COUNT",
                DEFAULT_MAX_BUNDLE_BYTE_COUNT,
            )?,
            max_data_item_byte_count: env_parse_or(
                "MAX_DATA_ITEM_BYTE_COUNT",
                DEFAULT_MAX_DATA_ITEM_BYTE_COUNT,
            )?,
            max_data_items_per_bundle: env_parse_or(
                "MAX_DATA_ITEMS_PER_BUNDLE",
                DEFAULT_MAX_DATA_ITEMS_PER_BUNDLE,
            )?,
            overdue_threshold_ms: env_parse_or(
                "OVERDUE_THRESHOLD_MS",
                DEFAULT_OVERDUE_THRESHOLD_MS,
            )?,
            block_height_cache_ttl: Duration::from_secs(env_parse_or(
                "BLOCK_HEIGHT_CACHE_TTL_SECS",
                DEFAULT_BLOCK_HEIGHT_CACHE_TTL_SECS,
            )?),
            add_community_tip: env_parse_or("ADD_COMMUNITY_TIP", false)?,
            plan_batch_accumulation_delay: Duration::from_millis(env_parse_or(
                "PLAN_BATCH_ACCUMULATION_DELAY_MS",
                DEFAULT_PLAN_BATCH_ACCUMULATION_DELAY_MS as u64,
            )?),
            plan_selection_batch_size: env_parse_or(
                "PLAN_SELECTION_BATCH_SIZE",
                DEFAULT_PLAN_SELECTION_BATCH_SIZE,
            )?,
            community_tip_target: env::var("COMMUNITY_TIP_TARGET").ok(),
            community_tip_quantity: env_parse_or("COMMUNITY_TIP_QUANTITY", 0u64)?,

            plan_queue_url: require_env("PLAN_QUEUE_URL")?,
            prepare_queue_url: require_env("PREPARE_QUEUE_URL")?,
            post_queue_url: require_env("POST_QUEUE_URL")?,
            seed_queue_url: require_env("SEED_QUEUE_URL")?,
            wallet_secret_key_hex: require_env("WALLET_SECRET_KEY_HEX")?,
            object_store_root: env_or("OBJECT_STORE_ROOT", "./data"),
            object_store_backend: env_or("OBJECT_STORE_BACKEND", "fs"),
            plan_tick_interval: Duration::from_millis(env_parse_or(
                "PLAN_TICK_INTERVAL_MS",
                DEFAULT_PLAN_TICK_INTERVAL_MS,
            )?),
            verify_tick_interval: Duration::from_millis(env_parse_or(
                "VERIFY_TICK_INTERVAL_MS",
                DEFAULT_VERIFY_TICK_INTERVAL_MS,
            )?),
        })
    }
}

fn require_env(key: &'static str) -> Result<String, ConfigError> {
    env::var(key).map_err(|_| ConfigError::Missing(key))
}

fn env_or(key: &'static str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse_or<T>(key: &'static str, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
{
    match env::var(key) {
        Ok(value) => value.parse().map_err(|_| ConfigError::Invalid { key, value }),
        Err(_) => Ok(default),
    }
}
