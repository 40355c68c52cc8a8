use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// LED status flags reported by a device. Absent flags are `false`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusFlags {
    pub power: bool,
    pub water: bool,
    pub pads: bool,
}

/// Telemetry payload as it arrives on the bus, before validation.
///
/// Every field is optional here so that a partial payload decodes and can be
/// rejected with a precise reason instead of a generic parse error.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct InboundTelemetry {
    pub device_id: Option<String>,
    pub timestamp: Option<i64>,
    pub fw_version: Option<String>,
    pub wifi_ssid: Option<String>,
    pub wifi_rssi: Option<i32>,
    pub uptime_ms: Option<i64>,
    pub free_heap: Option<i64>,
    pub battery_voltage: Option<f64>,
    /// Nested status object. Kept untyped: anything other than an object
    /// falls back to the legacy flat flags.
    pub status: Option<serde_json::Value>,
    pub led_power: Option<bool>,
    pub led_water: Option<bool>,
    pub led_pads: Option<bool>,
}

/// Validated telemetry in its canonical shape, ready to be stored.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TelemetryRecord {
    pub device_id: String,
    pub timestamp: i64,
    pub fw_version: Option<String>,
    pub wifi_ssid: Option<String>,
    pub wifi_rssi: Option<i32>,
    pub uptime_ms: Option<i64>,
    pub free_heap: Option<i64>,
    pub battery_voltage: Option<f64>,
    pub status: StatusFlags,
}

/// A stored telemetry row.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct TelemetryRow {
    pub id: i64,
    pub device_id: String,
    pub timestamp: i64,
    pub fw_version: Option<String>,
    pub wifi_ssid: Option<String>,
    pub wifi_rssi: Option<i32>,
    pub uptime_ms: Option<i64>,
    pub free_heap: Option<i64>,
    pub battery_voltage: Option<f64>,
    pub status_power: bool,
    pub status_water: bool,
    pub status_pads: bool,
    pub created_at: DateTime<Utc>,
}

/// A stored device row.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct DeviceRow {
    pub device_id: String,
    pub last_seen: Option<i64>,
    pub fw_version: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// REST API telemetry record with nulls coerced to zero values
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryResponse {
    pub device_id: String,
    pub timestamp: i64,
    pub fw_version: String,
    pub wifi_ssid: String,
    pub wifi_rssi: i32,
    pub uptime_ms: i64,
    pub free_heap: i64,
    pub battery_voltage: f64,
    pub status: StatusFlags,
}

impl From<TelemetryRow> for TelemetryResponse {
    fn from(row: TelemetryRow) -> Self {
        Self {
            device_id: row.device_id,
            timestamp: row.timestamp,
            fw_version: row.fw_version.unwrap_or_default(),
            wifi_ssid: row.wifi_ssid.unwrap_or_default(),
            wifi_rssi: row.wifi_rssi.unwrap_or_default(),
            uptime_ms: row.uptime_ms.unwrap_or_default(),
            free_heap: row.free_heap.unwrap_or_default(),
            battery_voltage: row.battery_voltage.unwrap_or_default(),
            status: StatusFlags {
                power: row.status_power,
                water: row.status_water,
                pads: row.status_pads,
            },
        }
    }
}

/// REST API history response wrapper
#[derive(Debug, Serialize, Deserialize)]
pub struct HistoryResponse {
    pub records: Vec<TelemetryResponse>,
    pub total_records: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub device_id: String,
    pub last_seen: Option<i64>,
    pub fw_version: String,
}

impl From<DeviceRow> for DeviceInfo {
    fn from(row: DeviceRow) -> Self {
        Self {
            device_id: row.device_id,
            last_seen: row.last_seen,
            fw_version: row.fw_version.unwrap_or_default(),
        }
    }
}
