// Half-month partition provisioning for `permanent_data_item`.
//
// Design note (resolved Open Question, see DESIGN.md): the partitioned
// layout is authoritative. Partitions are created lazily, from within the
// same transaction that first needs one, rather than by a separate
// provisioning job — this keeps the store self-sufficient and avoids a
// class of "partition doesn't exist yet" failures on a slow day.

use chrono::{DateTime, Datelike, TimeZone, Utc};
use sqlx::{Executor, Postgres};

use crate::core::error::{BundlerError, BundlerResult};

/// Start (inclusive) and end (exclusive) of the half-month range containing
/// `date`, plus the partition's table name.
pub fn half_month_bounds(date: DateTime<Utc>) -> (DateTime<Utc>, DateTime<Utc>, String) {
    let year = date.year();
    let month = date.month();
    let first_half = date.day() <= 15;

    let start_day = if first_half { 1 } else { 16 };
    let start = Utc
        .with_ymd_and_hms(year, month, start_day, 0, 0, 0)
        .single()
        .expect("valid half-month start");

    let end = if first_half {
        Utc.with_ymd_and_hms(year, month, 16, 0, 0, 0)
            .single()
            .expect("valid mid-month boundary")
    } else {
        let (next_year, next_month) = if month == 12 {
            (year + 1, 1)
        } else {
            (year, month + 1)
        };
        Utc.with_ymd_and_hms(next_year, next_month, 1, 0, 0, 0)
            .single()
            .expect("valid next-month boundary")
    };

    let name = format!(
        "permanent_data_item_y{year}m{month:02}{}",
        if first_half { "a" } else { "b" }
    );

    (start, end, name)
}

/// Create the half-month partition covering `date` if it doesn't already
/// exist. Idempotent: safe to call on every insert.
pub async fn ensure_partition_for<'e, E>(executor: E, date: DateTime<Utc>) -> BundlerResult<()>
where
    E: Executor<'e, Database = Postgres>,
{
    let (start, end, name) = half_month_bounds(date);
    let sql = format!(
        "CREATE TABLE IF NOT EXISTS {name} PARTITION OF permanent_data_item \
         FOR VALUES FROM ('{start}') TO ('{end}')",
        start = start.to_rfc3339(),
        end = end.to_rfc3339(),
    );
    sqlx::query(&sql)
        .execute(executor)
        .await
        .map_err(BundlerError::Database)?;
    Ok(())
}
