//! MQTT side of the ingestor.
//!
//! The rumqttc connection is driven from a dedicated `mqtt-bridge` OS thread.
//! Each publish is decoded, validated and handed to the [`Dispatcher`] without
//! waiting for storage, so the network loop keeps servicing keep-alives while
//! the database catches up. Messages are acknowledged on receipt.

use crate::config::MqttConfig;
use crate::dispatch::Dispatcher;
use crate::errors::{Error, Result};
use crate::metrics::{BRIDGE_RECONNECTS_TOTAL, INVALID_MESSAGES_TOTAL, MESSAGES_TOTAL, REFUSED_TOTAL};
use crate::validate::decode;
use rumqttc::{
    Client, Connection, Event, MqttOptions, Packet, QoS, SubscribeReasonCode, TlsConfiguration,
    Transport,
};
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, watch};
use tracing::{debug, error, info, warn};

const REQUEST_CHANNEL_CAPACITY: usize = 100;
const STOP_POLL_INTERVAL: Duration = Duration::from_millis(100);
const JOIN_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BridgeState {
    Disconnected,
    Connecting,
    Subscribed,
    Receiving,
    Stopped,
}

impl fmt::Display for BridgeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BridgeState::Disconnected => "disconnected",
            BridgeState::Connecting => "connecting",
            BridgeState::Subscribed => "subscribed",
            BridgeState::Receiving => "receiving",
            BridgeState::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// Connection parameters, fixed for the life of the process.
#[derive(Clone)]
pub struct BridgeSettings {
    pub options: MqttOptions,
    pub topic_filter: String,
    pub reconnect_delay: Duration,
}

impl BridgeSettings {
    pub async fn from_config(config: &MqttConfig) -> Result<Self> {
        let client_id = config.client_id();
        let mut options = MqttOptions::new(&client_id, &config.broker, config.port);
        options.set_keep_alive(Duration::from_secs(config.keep_alive_secs));
        // A configured client id gets a persistent session so the broker keeps
        // QoS 1 messages across reconnects; generated ids would leave orphans.
        options.set_clean_session(config.client_id.is_none());

        if let Some(username) = &config.username {
            options.set_credentials(username, config.password.as_deref().unwrap_or_default());
        }

        if config.tls {
            let ca_path = config
                .ca_cert
                .as_ref()
                .ok_or_else(|| Error::Config("MQTT_TLS requires MQTT_CA_CERT".to_string()))?;
            let ca = tokio::fs::read(ca_path).await?;
            options.set_transport(Transport::tls_with_config(TlsConfiguration::Simple {
                ca,
                alpn: None,
                client_auth: None,
            }));
            info!("MQTT TLS enabled with CA cert {}", ca_path.display());
        }

        info!(
            "MQTT broker {}:{} as {} (auth: {}, tls: {})",
            config.broker,
            config.port,
            client_id,
            config.username.is_some(),
            config.tls
        );

        Ok(Self {
            options,
            topic_filter: config.topic_filter(),
            reconnect_delay: Duration::from_millis(config.reconnect_delay_ms),
        })
    }
}

/// Handle to the running bridge thread.
pub struct BusBridge {
    client: Client,
    stop: Arc<AtomicBool>,
    state: watch::Receiver<BridgeState>,
    thread: std::thread::JoinHandle<()>,
}

impl BusBridge {
    pub async fn start(settings: BridgeSettings, dispatcher: Dispatcher) -> Result<Self> {
        let (state_tx, state_rx) = watch::channel(BridgeState::Disconnected);
        let stop = Arc::new(AtomicBool::new(false));
        let (client_tx, client_rx) = oneshot::channel();

        let thread_stop = stop.clone();
        let thread = std::thread::Builder::new()
            .name("mqtt-bridge".to_string())
            .spawn(move || {
                // The sync client owns its own runtime, so it is built here,
                // off the main runtime's threads.
                let (client, connection) =
                    Client::new(settings.options, REQUEST_CHANNEL_CAPACITY);
                if client_tx.send(client.clone()).is_err() {
                    return;
                }
                run_event_loop(
                    connection,
                    client,
                    EventLoop {
                        topic_filter: settings.topic_filter,
                        reconnect_delay: settings.reconnect_delay,
                        dispatcher,
                        stop: thread_stop,
                        state: state_tx,
                    },
                );
            })?;

        let client = client_rx.await.map_err(|_| {
            Error::Io(std::io::Error::other("MQTT bridge thread exited during startup"))
        })?;

        Ok(Self {
            client,
            stop,
            state: state_rx,
            thread,
        })
    }

    pub fn state(&self) -> watch::Receiver<BridgeState> {
        self.state.clone()
    }

    /// Makes the event loop exit at its next event.
    pub fn stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    /// Stops the loop, disconnects from the broker and joins the thread.
    pub async fn disconnect(self) {
        self.stop();
        if let Err(e) = self.client.try_disconnect() {
            debug!("MQTT disconnect request not queued: {}", e);
        }

        let thread = self.thread;
        let join = tokio::task::spawn_blocking(move || thread.join());
        match tokio::time::timeout(JOIN_TIMEOUT, join).await {
            Ok(Ok(Ok(()))) => info!("MQTT bridge stopped"),
            Ok(Ok(Err(_))) => error!("MQTT bridge thread panicked"),
            Ok(Err(e)) => error!("Failed to join MQTT bridge thread: {}", e),
            Err(_) => warn!("MQTT bridge did not stop within {:?}", JOIN_TIMEOUT),
        }
    }
}

struct EventLoop {
    topic_filter: String,
    reconnect_delay: Duration,
    dispatcher: Dispatcher,
    stop: Arc<AtomicBool>,
    state: watch::Sender<BridgeState>,
}

impl EventLoop {
    fn stopped(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    fn set_state(&self, next: BridgeState) {
        self.state.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            debug!("MQTT bridge {} -> {}", current, next);
            *current = next;
            true
        });
    }

    /// Sleeps for the reconnect delay, waking early on shutdown.
    fn backoff(&self) {
        let mut remaining = self.reconnect_delay;
        while !remaining.is_zero() && !self.stopped() {
            let step = remaining.min(STOP_POLL_INTERVAL);
            std::thread::sleep(step);
            remaining -= step;
        }
    }
}

fn run_event_loop(mut connection: Connection, client: Client, ctx: EventLoop) {
    info!("Connecting to MQTT broker...");
    ctx.set_state(BridgeState::Connecting);

    for notification in connection.iter() {
        if ctx.stopped() {
            break;
        }

        match notification {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                info!("Connected to MQTT broker (session present: {})", ack.session_present);
                // Subscriptions are re-issued on every connect; the broker
                // treats a repeated subscribe as a no-op.
                match client.try_subscribe(ctx.topic_filter.as_str(), QoS::AtLeastOnce) {
                    Ok(()) => debug!("Subscribe to {} queued", ctx.topic_filter),
                    Err(e) => error!("Failed to subscribe to {}: {}", ctx.topic_filter, Error::from(e)),
                }
            }
            Ok(Event::Incoming(Packet::SubAck(ack))) => {
                if ack
                    .return_codes
                    .iter()
                    .any(|code| matches!(code, SubscribeReasonCode::Failure))
                {
                    error!("Broker rejected subscription to {}", ctx.topic_filter);
                } else {
                    info!("Subscribed to {} with QoS 1", ctx.topic_filter);
                    ctx.set_state(BridgeState::Subscribed);
                }
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                ctx.set_state(BridgeState::Receiving);
                handle_publish(&publish.topic, &publish.payload, &ctx.dispatcher);
            }
            Ok(_) => {}
            Err(e) => {
                let fault = Error::from(e);
                ctx.set_state(BridgeState::Disconnected);
                BRIDGE_RECONNECTS_TOTAL.inc();
                warn!("{}; reconnecting in {:?}", fault, ctx.reconnect_delay);
                ctx.backoff();
                if ctx.stopped() {
                    break;
                }
                ctx.set_state(BridgeState::Connecting);
            }
        }
    }

    ctx.set_state(BridgeState::Stopped);
    info!("MQTT event loop exited");
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Dispatched,
    Discarded,
    Refused,
}

/// Processes one publish. Never fails: bad payloads are logged and dropped so
/// that a single message cannot affect the subscription.
pub fn handle_publish(topic: &str, payload: &[u8], dispatcher: &Dispatcher) -> Disposition {
    MESSAGES_TOTAL.inc();
    debug!(
        "Received message on topic {}, size: {} bytes",
        topic,
        payload.len()
    );

    let record = match decode(payload) {
        Ok(record) => record,
        Err(e) => {
            INVALID_MESSAGES_TOTAL.inc();
            warn!("Discarding message on {}: {}", topic, e);
            return Disposition::Discarded;
        }
    };

    if let Some(topic_device) = device_from_topic(topic) {
        if topic_device != record.device_id {
            warn!(
                "Topic {} does not match payload device_id {}; using payload",
                topic, record.device_id
            );
        }
    }

    match dispatcher.submit(record) {
        Ok(()) => Disposition::Dispatched,
        Err(e) => {
            REFUSED_TOTAL.inc();
            debug!("Refusing message on {}: {}", topic, e);
            Disposition::Refused
        }
    }
}

/// Device segment of a `<namespace>/<device>/telemetry` topic.
pub fn device_from_topic(topic: &str) -> Option<&str> {
    let mut parts = topic.split('/');
    let (_namespace, device, leaf) = (parts.next()?, parts.next()?, parts.next()?);
    (leaf == "telemetry" && parts.next().is_none() && !device.is_empty()).then_some(device)
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[test]
    fn test_valid_message_is_dispatched() {
        let (dispatcher, mut receivers) = Dispatcher::new(1, 100);
        let payload = br#"{"device_id":"dev-1","timestamp":1000,"status":{"power":true}}"#;

        let disposition = handle_publish("devices/dev-1/telemetry", payload, &dispatcher);

        assert_eq!(disposition, Disposition::Dispatched);
        let record = receivers[0].try_recv().unwrap();
        assert_eq!(record.device_id, "dev-1");
        assert!(record.status.power);
    }

    #[test]
    fn test_invalid_json_is_discarded() {
        let (dispatcher, mut receivers) = Dispatcher::new(1, 100);

        let disposition = handle_publish("devices/dev-1/telemetry", b"invalid json", &dispatcher);

        assert_eq!(disposition, Disposition::Discarded);
        assert!(receivers[0].try_recv().is_err());
        assert!(!dispatcher.is_closed());
    }

    #[test]
    fn test_missing_required_fields_are_discarded() {
        let (dispatcher, mut receivers) = Dispatcher::new(1, 100);

        for payload in [
            &br#"{"timestamp":1000}"#[..],
            &br#"{"device_id":"dev-1"}"#[..],
            &br#"{}"#[..],
        ] {
            assert_eq!(
                handle_publish("devices/dev-1/telemetry", payload, &dispatcher),
                Disposition::Discarded
            );
        }
        assert!(receivers[0].try_recv().is_err());
        assert_eq!(dispatcher.pending(), 0);
    }

    #[test]
    fn test_bad_message_does_not_block_following_ones() {
        let (dispatcher, mut receivers) = Dispatcher::new(1, 100);

        handle_publish("devices/dev-1/telemetry", b"{", &dispatcher);
        let disposition = handle_publish(
            "devices/dev-1/telemetry",
            br#"{"device_id":"dev-1","timestamp":2}"#,
            &dispatcher,
        );

        assert_eq!(disposition, Disposition::Dispatched);
        assert_eq!(receivers[0].try_recv().unwrap().timestamp, 2);
    }

    #[test]
    fn test_message_refused_after_close() {
        let (dispatcher, _receivers) = Dispatcher::new(1, 100);
        dispatcher.close();

        let disposition = handle_publish(
            "devices/dev-1/telemetry",
            br#"{"device_id":"dev-1","timestamp":2}"#,
            &dispatcher,
        );
        assert_eq!(disposition, Disposition::Refused);
    }

    #[test]
    fn test_device_from_topic() {
        assert_eq!(device_from_topic("devices/dev-1/telemetry"), Some("dev-1"));
        assert_eq!(device_from_topic("devices/dev-1/status"), None);
        assert_eq!(device_from_topic("devices/dev-1/telemetry/extra"), None);
        assert_eq!(device_from_topic("devices//telemetry"), None);
        assert_eq!(device_from_topic("telemetry"), None);
    }

    #[test]
    fn test_settings_without_tls() {
        tokio_test::block_on(async {
            let config = crate::config::Config::try_parse_from([
                "ingestor",
                "--mqtt-broker",
                "broker.local",
                "--mqtt-port",
                "1884",
                "--mqtt-client-id",
                "bridge-test",
                "--mqtt-keep-alive-secs",
                "15",
            ])
            .unwrap();

            let settings = BridgeSettings::from_config(&config.mqtt).await.unwrap();

            assert_eq!(
                settings.options.broker_address(),
                ("broker.local".to_string(), 1884)
            );
            assert_eq!(settings.options.client_id(), "bridge-test");
            assert_eq!(settings.options.keep_alive(), Duration::from_secs(15));
            assert!(!settings.options.clean_session());
            assert_eq!(settings.topic_filter, "devices/+/telemetry");
        });
    }

    #[test]
    fn test_settings_tls_with_missing_ca_file() {
        tokio_test::block_on(async {
            let mut config = crate::config::Config::try_parse_from(["ingestor"]).unwrap();
            config.mqtt.tls = true;
            config.mqtt.ca_cert = Some("/nonexistent/ca.crt".into());

            assert!(matches!(
                BridgeSettings::from_config(&config.mqtt).await,
                Err(Error::Io(_))
            ));
        });
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_unreachable_broker_cycles_then_stops() {
        let settings = BridgeSettings {
            options: MqttOptions::new("state-test", "127.0.0.1", 1),
            topic_filter: "devices/+/telemetry".to_string(),
            reconnect_delay: Duration::from_millis(100),
        };
        let (dispatcher, _receivers) = Dispatcher::new(1, 100);
        let bridge = BusBridge::start(settings, dispatcher).await.unwrap();
        let mut state = bridge.state();

        // Only real transitions notify, so two Disconnected observations
        // imply a Connecting attempt between them.
        let mut observed = Vec::new();
        let cycled = tokio::time::timeout(Duration::from_secs(10), async {
            while observed
                .iter()
                .filter(|s| **s == BridgeState::Disconnected)
                .count()
                < 2
            {
                state.changed().await.unwrap();
                observed.push(*state.borrow_and_update());
            }
        })
        .await;

        assert!(cycled.is_ok(), "bridge did not cycle: {:?}", observed);
        assert!(
            observed
                .iter()
                .all(|s| matches!(s, BridgeState::Disconnected | BridgeState::Connecting)),
            "unexpected states: {:?}",
            observed
        );

        let state = bridge.state();
        bridge.disconnect().await;
        assert_eq!(*state.borrow(), BridgeState::Stopped);
    }

    #[test]
    fn test_state_display() {
        assert_eq!(BridgeState::Receiving.to_string(), "receiving");
        assert_eq!(
            serde_json::to_value(BridgeState::Disconnected).unwrap(),
            "disconnected"
        );
    }
}
