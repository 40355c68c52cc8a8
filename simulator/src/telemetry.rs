use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
pub struct Status {
    pub power: bool,
    pub water: bool,
    pub pads: bool,
}

/// Current firmware payload with a nested status object.
#[derive(Debug, Clone, Serialize)]
pub struct Telemetry {
    pub device_id: String,
    pub timestamp: i64,
    pub fw_version: String,
    pub wifi_ssid: String,
    pub wifi_rssi: i32,
    pub uptime_ms: i64,
    pub free_heap: i64,
    pub battery_voltage: f64,
    pub status: Status,
}

/// Payload shape of older firmware: flat LED flags, no Wi-Fi details.
#[derive(Debug, Clone, Serialize)]
pub struct LegacyTelemetry {
    pub device_id: String,
    pub timestamp: i64,
    pub fw_version: String,
    pub battery_voltage: f64,
    pub led_power: bool,
    pub led_water: bool,
    pub led_pads: bool,
}
