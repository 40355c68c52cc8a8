use crate::errors::{Error, Result};
use crate::model::{InboundTelemetry, StatusFlags, TelemetryRecord};

const DEVICE_ID_MAX_LEN: usize = 255;
const FW_VERSION_MAX_LEN: usize = 50;
const WIFI_SSID_MAX_LEN: usize = 255;

pub const HISTORY_LIMIT_MIN: i64 = 1;
pub const HISTORY_LIMIT_MAX: i64 = 1000;
pub const HISTORY_LIMIT_DEFAULT: i64 = 100;

/// Decodes a raw bus payload and validates it into a [`TelemetryRecord`].
pub fn decode(payload: &[u8]) -> Result<TelemetryRecord> {
    let inbound = serde_json::from_slice::<InboundTelemetry>(payload)
        .map_err(|e| Error::Validation(format!("JSON parse error: {}", e)))?;

    validate(inbound)
}

/// Validates telemetry data and normalizes it into the canonical shape
pub fn validate(inbound: InboundTelemetry) -> Result<TelemetryRecord> {
    let device_id = match inbound.device_id {
        Some(id) if !id.is_empty() => id,
        Some(_) => return Err(Error::Validation("Device ID cannot be empty".to_string())),
        None => return Err(Error::Validation("Missing required field device_id".to_string())),
    };
    let timestamp = inbound
        .timestamp
        .ok_or_else(|| Error::Validation("Missing required field timestamp".to_string()))?;

    check_len("device_id", Some(&device_id), DEVICE_ID_MAX_LEN)?;
    check_len("fw_version", inbound.fw_version.as_deref(), FW_VERSION_MAX_LEN)?;
    check_len("wifi_ssid", inbound.wifi_ssid.as_deref(), WIFI_SSID_MAX_LEN)?;

    let status = match &inbound.status {
        Some(serde_json::Value::Object(fields)) => {
            let flag = |name: &str| fields.get(name).and_then(|v| v.as_bool()).unwrap_or(false);
            StatusFlags {
                power: flag("power"),
                water: flag("water"),
                pads: flag("pads"),
            }
        }
        // Older firmware reports flat led_* booleans instead of a status object
        _ => StatusFlags {
            power: inbound.led_power.unwrap_or(false),
            water: inbound.led_water.unwrap_or(false),
            pads: inbound.led_pads.unwrap_or(false),
        },
    };

    Ok(TelemetryRecord {
        device_id,
        timestamp,
        fw_version: inbound.fw_version,
        wifi_ssid: inbound.wifi_ssid,
        wifi_rssi: inbound.wifi_rssi,
        uptime_ms: inbound.uptime_ms,
        free_heap: inbound.free_heap,
        battery_voltage: inbound.battery_voltage,
        status,
    })
}

/// Resolves the `limit` query parameter of a history request.
pub fn history_limit(limit: Option<i64>) -> Result<i64> {
    let limit = limit.unwrap_or(HISTORY_LIMIT_DEFAULT);
    if !(HISTORY_LIMIT_MIN..=HISTORY_LIMIT_MAX).contains(&limit) {
        return Err(Error::Validation(format!(
            "limit {} out of range [{}, {}]",
            limit, HISTORY_LIMIT_MIN, HISTORY_LIMIT_MAX
        )));
    }
    Ok(limit)
}

/// VARCHAR(n) limits count characters; PostgreSQL text cannot hold NUL.
fn check_len(field: &str, value: Option<&str>, max: usize) -> Result<()> {
    match value {
        Some(v) if v.contains('\0') => Err(Error::Validation(format!(
            "{} contains a NUL character",
            field
        ))),
        Some(v) if v.chars().count() > max => Err(Error::Validation(format!(
            "{} longer than {} characters",
            field, max
        ))),
        _ => Ok(()),
    }
}
