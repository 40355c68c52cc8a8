mod telemetry;

use chrono::Utc;
use clap::Parser;
use rand::Rng;
use rumqttc::{AsyncClient, MqttOptions, QoS, TlsConfiguration, Transport};
use std::path::PathBuf;
use std::time::Duration;
use telemetry::{LegacyTelemetry, Status, Telemetry};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Publishes synthetic device telemetry to an MQTT broker.
#[derive(Debug, Parser)]
#[command(name = "simulator")]
struct Args {
    #[arg(long, env = "MQTT_BROKER", default_value = "localhost")]
    broker: String,

    #[arg(long, env = "MQTT_PORT", default_value_t = 1883)]
    port: u16,

    #[arg(long, env = "MQTT_TOPIC_NAMESPACE", default_value = "devices")]
    namespace: String,

    #[arg(long, env = "MQTT_USERNAME")]
    username: Option<String>,

    #[arg(long, env = "MQTT_PASSWORD", hide_env_values = true)]
    password: Option<String>,

    /// Enables TLS using this CA certificate
    #[arg(long, env = "MQTT_CA_CERT")]
    ca_cert: Option<PathBuf>,

    /// Messages per second
    #[arg(long, env = "RATE", default_value_t = 1000)]
    rate: u64,

    #[arg(long, env = "DEVICES", default_value_t = 100)]
    devices: usize,

    /// Share of devices still on legacy firmware
    #[arg(long, env = "LEGACY_RATIO", default_value_t = 0.1)]
    legacy_ratio: f64,

    /// Share of messages sent without a timestamp
    #[arg(long, env = "MALFORMED_RATIO", default_value_t = 0.01)]
    malformed_ratio: f64,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("Starting IoT Simulator");
    info!(
        "Broker: {}:{}, Rate: {} msg/s, Devices: {}",
        args.broker, args.port, args.rate, args.devices
    );

    let client_id = format!("sim-{}", uuid::Uuid::new_v4());

    let mut mqtt_options = MqttOptions::new(&client_id, &args.broker, args.port);
    mqtt_options.set_keep_alive(Duration::from_secs(30));
    mqtt_options.set_clean_session(true);
    if let Some(username) = &args.username {
        mqtt_options.set_credentials(username, args.password.as_deref().unwrap_or_default());
    }
    if let Some(ca_path) = &args.ca_cert {
        let ca = match tokio::fs::read(ca_path).await {
            Ok(ca) => ca,
            Err(e) => {
                error!("Failed to read CA certificate {}: {}", ca_path.display(), e);
                std::process::exit(1);
            }
        };
        mqtt_options.set_transport(Transport::tls_with_config(TlsConfiguration::Simple {
            ca,
            alpn: None,
            client_auth: None,
        }));
    }

    let (client, mut eventloop) = AsyncClient::new(mqtt_options, 20000);

    // Spawn eventloop handler
    tokio::spawn(async move {
        loop {
            match eventloop.poll().await {
                Ok(_) => {}
                Err(e) => {
                    error!("MQTT eventloop error: {}", e);
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
    });

    tokio::time::sleep(Duration::from_secs(2)).await;

    info!("Connected to MQTT broker, starting to publish telemetry");

    let mut rng = rand::thread_rng();
    let mut counter = 0u64;

    const BURST_SIZE: usize = 200;
    let burst_interval = Duration::from_millis((BURST_SIZE as u64 * 1000) / args.rate.max(1));

    info!("Publishing in bursts of {} messages every {:?}", BURST_SIZE, burst_interval);

    let legacy_devices = (args.devices as f64 * args.legacy_ratio).round() as u64;
    let uptime_start = std::time::Instant::now();

    loop {
        let burst_start = std::time::Instant::now();

        for _ in 0..BURST_SIZE {
            let index = counter % args.devices.max(1) as u64;
            let device_id = format!("dev-{}", index);
            let topic = format!("{}/{}/telemetry", args.namespace, device_id);
            let uptime_ms = uptime_start.elapsed().as_millis() as i64;

            let payload = if index < legacy_devices {
                serde_json::to_value(generate_legacy(&mut rng, device_id))
            } else {
                serde_json::to_value(generate_telemetry(&mut rng, device_id, uptime_ms))
            };
            let mut payload = match payload {
                Ok(p) => p,
                Err(e) => {
                    error!("Failed to serialize telemetry: {}", e);
                    continue;
                }
            };
            if rng.gen_bool(args.malformed_ratio.clamp(0.0, 1.0)) {
                if let Some(fields) = payload.as_object_mut() {
                    fields.remove("timestamp");
                }
            }

            match client
                .publish(&topic, QoS::AtLeastOnce, false, payload.to_string())
                .await
            {
                Ok(_) => {
                    counter += 1;
                }
                Err(e) => {
                    warn!("Failed to publish: {}", e);
                }
            }
        }

        // Log progress periodically
        if counter % 10000 == 0 {
            info!("Published {} messages", counter);
        }

        let elapsed = burst_start.elapsed();
        if elapsed < burst_interval {
            tokio::time::sleep(burst_interval - elapsed).await;
        } else if elapsed > burst_interval * 2 {
            warn!("Burst took {:?}, target was {:?} - system may be overloaded", elapsed, burst_interval);
        }
    }
}

fn generate_telemetry(rng: &mut impl Rng, device_id: String, uptime_ms: i64) -> Telemetry {
    let battery_voltage = if rng.gen_bool(0.02) {
        rng.gen_range(3.0..3.3) // 2% low battery
    } else {
        rng.gen_range(3.6..4.2) // Normal range
    };

    Telemetry {
        device_id,
        timestamp: Utc::now().timestamp(),
        fw_version: "2.1.0".to_string(),
        wifi_ssid: "greenhouse".to_string(),
        wifi_rssi: rng.gen_range(-85..-40),
        uptime_ms,
        free_heap: rng.gen_range(40_000..180_000),
        battery_voltage,
        status: Status {
            power: rng.gen_bool(0.95),
            water: rng.gen_bool(0.3),
            pads: rng.gen_bool(0.6),
        },
    }
}

fn generate_legacy(rng: &mut impl Rng, device_id: String) -> LegacyTelemetry {
    LegacyTelemetry {
        device_id,
        timestamp: Utc::now().timestamp(),
        fw_version: "1.0.3".to_string(),
        battery_voltage: rng.gen_range(3.4..4.1),
        led_power: rng.gen_bool(0.95),
        led_water: rng.gen_bool(0.3),
        led_pads: rng.gen_bool(0.6),
    }
}
