//! Idempotent schema setup for the `devices` and `telemetry_records` tables.
//!
//! Every statement uses `IF NOT EXISTS`, so this runs on each startup without
//! touching existing rows.

use crate::errors::{Error, Result};
use sqlx::PgPool;
use tracing::info;

pub async fn ensure_schema(pool: &PgPool) -> Result<()> {
    info!("Ensuring database schema...");

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS devices (
            device_id VARCHAR(255) PRIMARY KEY,
            last_seen BIGINT,
            fw_version VARCHAR(50),
            created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
        )
        "#,
    )
    .execute(pool)
    .await
    .map_err(|e| Error::schema("failed to create devices table", e))?;

    // Stores created before devices tracked firmware lack the column
    sqlx::query("ALTER TABLE devices ADD COLUMN IF NOT EXISTS fw_version VARCHAR(50)")
        .execute(pool)
        .await
        .map_err(|e| Error::schema("failed to add devices.fw_version", e))?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS telemetry_records (
            id BIGSERIAL PRIMARY KEY,
            device_id VARCHAR(255) NOT NULL
                REFERENCES devices (device_id) ON DELETE CASCADE,
            timestamp BIGINT NOT NULL,
            fw_version VARCHAR(50),
            wifi_ssid VARCHAR(255),
            wifi_rssi INTEGER,
            uptime_ms BIGINT,
            free_heap BIGINT,
            battery_voltage DOUBLE PRECISION,
            status_power BOOLEAN NOT NULL DEFAULT FALSE,
            status_water BOOLEAN NOT NULL DEFAULT FALSE,
            status_pads BOOLEAN NOT NULL DEFAULT FALSE,
            created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
        )
        "#,
    )
    .execute(pool)
    .await
    .map_err(|e| Error::schema("failed to create telemetry_records table", e))?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_telemetry_timestamp ON telemetry_records (timestamp DESC)",
    )
    .execute(pool)
    .await
    .map_err(|e| Error::schema("failed to create timestamp index", e))?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_telemetry_device_id ON telemetry_records (device_id)",
    )
    .execute(pool)
    .await
    .map_err(|e| Error::schema("failed to create device index", e))?;

    sqlx::query(
        r#"
        CREATE INDEX IF NOT EXISTS idx_telemetry_device_timestamp
        ON telemetry_records (device_id, timestamp DESC)
        "#,
    )
    .execute(pool)
    .await
    .map_err(|e| Error::schema("failed to create device/timestamp index", e))?;

    info!("Database schema ready");
    Ok(())
}
