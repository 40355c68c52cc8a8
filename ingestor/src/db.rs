use crate::config::DatabaseConfig;
use crate::errors::{Error, Result};
use crate::metrics::DB_RETRIES_TOTAL;
use crate::model::{DeviceRow, TelemetryRecord, TelemetryRow};
use sqlx::postgres::{PgConnection, PgPool, PgPoolOptions};
use std::time::Duration;
use tracing::{error, info, warn};

const MAX_STORE_ATTEMPTS: u32 = 5;

const TELEMETRY_COLUMNS: &str = "id, device_id, timestamp, fw_version, wifi_ssid, wifi_rssi, \
     uptime_ms, free_heap, battery_voltage, status_power, status_water, status_pads, created_at";

pub async fn make_pool(config: &DatabaseConfig) -> Result<PgPool> {
    info!("Connecting to database at {}...", config.redacted_url());
    let pool = PgPoolOptions::new()
        .min_connections(config.pool_min)
        .max_connections(config.pool_max)
        .acquire_timeout(config.acquire_timeout())
        .connect(&config.url)
        .await?;

    info!(
        "Database connection established (pool {}..{})",
        config.pool_min, config.pool_max
    );
    Ok(pool)
}

/// Inserts the device or refreshes `last_seen`, `fw_version` and `updated_at`.
pub async fn upsert_device(
    conn: &mut PgConnection,
    device_id: &str,
    last_seen: i64,
    fw_version: Option<&str>,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO devices (device_id, last_seen, fw_version)
        VALUES ($1, $2, $3)
        ON CONFLICT (device_id) DO UPDATE SET
            last_seen = EXCLUDED.last_seen,
            fw_version = EXCLUDED.fw_version,
            updated_at = NOW()
        "#,
    )
    .bind(device_id)
    .bind(last_seen)
    .bind(fw_version)
    .execute(&mut *conn)
    .await?;

    Ok(())
}

/// Appends one telemetry row. The device row must already exist.
pub async fn insert_telemetry(conn: &mut PgConnection, record: &TelemetryRecord) -> Result<i64> {
    if record.device_id.is_empty() {
        return Err(Error::Validation("Device ID cannot be empty".to_string()));
    }

    let id = sqlx::query_scalar::<_, i64>(
        r#"
        INSERT INTO telemetry_records (
            device_id, timestamp, fw_version, wifi_ssid, wifi_rssi,
            uptime_ms, free_heap, battery_voltage,
            status_power, status_water, status_pads
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
        RETURNING id
        "#,
    )
    .bind(&record.device_id)
    .bind(record.timestamp)
    .bind(&record.fw_version)
    .bind(&record.wifi_ssid)
    .bind(record.wifi_rssi)
    .bind(record.uptime_ms)
    .bind(record.free_heap)
    .bind(record.battery_voltage)
    .bind(record.status.power)
    .bind(record.status.water)
    .bind(record.status.pads)
    .fetch_one(&mut *conn)
    .await?;

    Ok(id)
}

/// Stores one message as a single transaction: device upsert plus telemetry
/// insert. Transient failures are retried with a fresh transaction.
pub async fn store_telemetry(pool: &PgPool, record: &TelemetryRecord) -> Result<i64> {
    let mut attempts = 0;

    loop {
        attempts += 1;
        match store_telemetry_inner(pool, record).await {
            Ok(id) => return Ok(id),
            Err(e) if e.is_retryable() && attempts < MAX_STORE_ATTEMPTS => {
                let wait_ms = 100 * 2_u64.pow(attempts - 1).min(32);
                warn!(
                    "Storing telemetry for {} failed (attempt {}/{}), retrying in {}ms: {}",
                    record.device_id, attempts, MAX_STORE_ATTEMPTS, wait_ms, e
                );
                DB_RETRIES_TOTAL.inc();
                tokio::time::sleep(Duration::from_millis(wait_ms)).await;
            }
            Err(e) => {
                error!(
                    "Storing telemetry for {} failed permanently after {} attempts: {}",
                    record.device_id, attempts, e
                );
                return Err(e);
            }
        }
    }
}

async fn store_telemetry_inner(pool: &PgPool, record: &TelemetryRecord) -> Result<i64> {
    let mut tx = pool.begin().await?;

    upsert_device(
        &mut tx,
        &record.device_id,
        record.timestamp,
        record.fw_version.as_deref(),
    )
    .await?;
    let id = insert_telemetry(&mut tx, record).await?;

    tx.commit().await?;
    Ok(id)
}

/// Most recent record by timestamp, optionally for one device.
pub async fn latest(pool: &PgPool, device_id: Option<&str>) -> Result<TelemetryRow> {
    let query = format!(
        "SELECT {} FROM telemetry_records \
         WHERE ($1::text IS NULL OR device_id = $1) \
         ORDER BY timestamp DESC, id DESC \
         LIMIT 1",
        TELEMETRY_COLUMNS
    );

    sqlx::query_as::<_, TelemetryRow>(&query)
        .bind(device_id)
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| Error::NotFound("No telemetry data found".to_string()))
}

/// Up to `limit` most recent records plus the total number of matching rows.
pub async fn history(
    pool: &PgPool,
    device_id: Option<&str>,
    limit: i64,
) -> Result<(Vec<TelemetryRow>, i64)> {
    let mut tx = pool.begin().await?;

    // Count and page must describe the same snapshot
    sqlx::query("SET TRANSACTION ISOLATION LEVEL REPEATABLE READ READ ONLY")
        .execute(&mut *tx)
        .await?;

    let total = sqlx::query_scalar::<_, i64>(
        "SELECT COUNT(*) FROM telemetry_records WHERE ($1::text IS NULL OR device_id = $1)",
    )
    .bind(device_id)
    .fetch_one(&mut *tx)
    .await?;

    let query = format!(
        "SELECT {} FROM telemetry_records \
         WHERE ($1::text IS NULL OR device_id = $1) \
         ORDER BY timestamp DESC, id DESC \
         LIMIT $2",
        TELEMETRY_COLUMNS
    );
    let rows = sqlx::query_as::<_, TelemetryRow>(&query)
        .bind(device_id)
        .bind(limit)
        .fetch_all(&mut *tx)
        .await?;

    tx.commit().await?;
    Ok((rows, total))
}

/// All devices, most recently seen first; never-seen devices last.
pub async fn list_devices(pool: &PgPool) -> Result<Vec<DeviceRow>> {
    let devices = sqlx::query_as::<_, DeviceRow>(
        r#"
        SELECT device_id, last_seen, fw_version, created_at, updated_at
        FROM devices
        ORDER BY last_seen DESC NULLS LAST, device_id
        "#,
    )
    .fetch_all(pool)
    .await?;

    Ok(devices)
}
