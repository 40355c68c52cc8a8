use rumqttc::{AsyncClient, MqttOptions, QoS};
use serde::Serialize;
use std::time::{Duration, Instant};
use tokio::time::sleep;

#[derive(Debug, Clone, Serialize)]
struct Status {
    power: bool,
    water: bool,
    pads: bool,
}

#[derive(Debug, Clone, Serialize)]
struct Telemetry {
    device_id: String,
    timestamp: i64,
    fw_version: String,
    wifi_rssi: i32,
    uptime_ms: i64,
    free_heap: i64,
    battery_voltage: f64,
    status: Status,
}

impl Telemetry {
    fn random(device_id: String) -> Self {
        use rand::Rng;
        let mut rng = rand::thread_rng();
        Self {
            device_id,
            timestamp: chrono::Utc::now().timestamp(),
            fw_version: "1.4.2".to_string(),
            wifi_rssi: rng.gen_range(-90..-30),
            uptime_ms: rng.gen_range(0..86_400_000),
            free_heap: rng.gen_range(20_000..200_000),
            battery_voltage: rng.gen_range(3.3..4.2),
            status: Status {
                power: rng.gen_bool(0.9),
                water: rng.gen_bool(0.5),
                pads: rng.gen_bool(0.5),
            },
        }
    }
}

async fn publish_for(
    client_id: &str,
    duration_secs: u64,
    target_rate: u64,
    devices: u64,
) -> (u64, u64, Duration) {
    let total_messages = duration_secs * target_rate;

    let mut mqtt_options = MqttOptions::new(client_id, "localhost", 1883);
    mqtt_options.set_keep_alive(Duration::from_secs(30));

    let (client, mut eventloop) = AsyncClient::new(mqtt_options, 20000);

    tokio::spawn(async move {
        loop {
            if let Err(e) = eventloop.poll().await {
                eprintln!("MQTT error: {}", e);
                break;
            }
        }
    });

    sleep(Duration::from_millis(500)).await;

    let start = Instant::now();
    let mut sent_count = 0;
    let mut error_count = 0;

    let burst_size = 100;
    let delay_per_burst = Duration::from_micros((burst_size * 1_000_000) / target_rate);

    for batch_start in (0..total_messages).step_by(burst_size as usize) {
        for i in batch_start..std::cmp::min(batch_start + burst_size, total_messages) {
            let device_id = format!("load-test-dev-{}", i % devices);
            let payload = serde_json::to_string(&Telemetry::random(device_id.clone())).unwrap();

            match client
                .publish(
                    format!("devices/{}/telemetry", device_id),
                    QoS::AtLeastOnce,
                    false,
                    payload,
                )
                .await
            {
                Ok(_) => sent_count += 1,
                Err(e) => {
                    error_count += 1;
                    if error_count < 10 {
                        eprintln!("Send error: {}", e);
                    }
                }
            }
        }

        sleep(delay_per_burst).await;
    }

    (sent_count, error_count, start.elapsed())
}

#[tokio::test]
#[ignore]
async fn test_1000_messages_per_second() {
    let (sent, errors, duration) = publish_for("load-test", 10, 1000, 10).await;

    let actual_rate = sent as f64 / duration.as_secs_f64();
    println!(
        "Sent {} messages in {:.2}s ({:.2} msg/s), {} errors",
        sent,
        duration.as_secs_f64(),
        actual_rate,
        errors
    );

    assert!(
        actual_rate >= 900.0,
        "Throughput too low: {:.2} msg/s (expected >= 900)",
        actual_rate
    );
    assert_eq!(errors, 0, "Too many errors: {} (expected 0)", errors);
}

#[tokio::test]
#[ignore]
async fn test_sustained_load_60_seconds() {
    let (sent, errors, duration) = publish_for("load-test-sustained", 60, 1000, 50).await;

    println!(
        "Sustained: {} messages in {:.2}s, {} errors",
        sent,
        duration.as_secs_f64(),
        errors
    );
    assert!(sent as f64 / duration.as_secs_f64() >= 900.0);
}
