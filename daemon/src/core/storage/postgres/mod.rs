mod bundle;
mod data_item;
pub mod partitions;
mod rows;
mod transient;

pub use transient::with_serializable_retry;

use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres, Transaction};
use std::time::Duration;

use crate::core::error::{BundlerError, BundlerResult};

/// Postgres-backed implementation of [`crate::core::storage::StateStore`].
/// Every multi-row promotion runs as one `SERIALIZABLE` transaction
/// (spec §4.1's concurrency discipline); transient serialization/deadlock
/// errors are retried with backoff by [`with_serializable_retry`].
#[derive(Clone)]
pub struct PgStateStore {
    pool: PgPool,
}

impl PgStateStore {
    pub async fn connect(database_url: &str) -> BundlerResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .acquire_timeout(Duration::from_secs(10))
            .connect(database_url)
            .await
            .map_err(BundlerError::Database)?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn migrate(&self) -> BundlerResult<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| BundlerError::Irrecoverable(format!("migration failed: {e}")))?;
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Begin a transaction at `SERIALIZABLE` isolation. Postgres defaults a
    /// bare `BEGIN` to `READ COMMITTED`, under which `40001` is never
    /// raised, so every multi-row promotion in this module starts here
    /// instead of calling `pool().begin()` directly — that is what makes
    /// the `40001`/`40P01` retry in [`with_serializable_retry`] meaningful
    /// rather than dead code.
    pub(crate) async fn begin_serializable(&self) -> BundlerResult<Transaction<'_, Postgres>> {
        let mut tx = self.pool.begin().await.map_err(BundlerError::Database)?;
        sqlx::query("SET TRANSACTION ISOLATION LEVEL SERIALIZABLE")
            .execute(&mut *tx)
            .await
            .map_err(BundlerError::Database)?;
        Ok(tx)
    }
}
