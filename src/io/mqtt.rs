//! MQTT client for receiving device location pings
//!
//! Devices publish either a single ping object or an array of them:
//! `{"subject_id": "S-1", "latitude": 5.73, "longitude": -72.89}`.
//! Parsed pings are handed to the ping worker over a bounded channel.

use crate::domain::types::LocationPing;
use crate::infra::config::Config;
use crate::infra::metrics::Metrics;
use crate::services::ping_worker::QueuedPing;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use serde::Deserialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

#[derive(Deserialize)]
#[serde(untagged)]
enum PingPayload {
    Batch(Vec<LocationPing>),
    Single(LocationPing),
}

/// Parse a ping payload (single object or array)
pub fn parse_ping_message(payload: &[u8]) -> Result<Vec<LocationPing>, serde_json::Error> {
    let pings = match serde_json::from_slice::<PingPayload>(payload)? {
        PingPayload::Batch(pings) => pings,
        PingPayload::Single(ping) => vec![ping],
    };
    Ok(pings.into_iter().filter(|p| !p.subject_id.as_str().is_empty()).collect())
}

/// Outcome of handing one ping to the worker channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Enqueue {
    Queued,
    Dropped,
    Closed,
}

fn enqueue(ping_tx: &mpsc::Sender<QueuedPing>, ping: LocationPing, metrics: &Metrics) -> Enqueue {
    match ping_tx.try_send(QueuedPing::new(ping)) {
        Ok(()) => Enqueue::Queued,
        Err(TrySendError::Full(_)) => {
            metrics.record_ping_dropped();
            Enqueue::Dropped
        }
        Err(TrySendError::Closed(_)) => Enqueue::Closed,
    }
}

/// Start the MQTT client and forward parsed pings to the worker channel
///
/// Pings are sent via try_send so the eventloop never blocks on the engine.
/// Dropped pings are counted in metrics and logged (rate-limited).
pub async fn start_mqtt_client(
    config: &Config,
    ping_tx: mpsc::Sender<QueuedPing>,
    metrics: Arc<Metrics>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let client_id = format!("access-gateway-{}", config.site_id());
    let mut mqttoptions = MqttOptions::new(client_id, config.mqtt_host(), config.mqtt_port());
    mqttoptions.set_keep_alive(Duration::from_secs(30));

    if let (Some(username), Some(password)) = (config.mqtt_username(), config.mqtt_password()) {
        mqttoptions.set_credentials(username, password);
    }

    let (client, mut eventloop) = AsyncClient::new(mqttoptions, 100);
    client.subscribe(config.mqtt_ping_topic(), QoS::AtMostOnce).await?;

    info!(
        topic = %config.mqtt_ping_topic(),
        host = %config.mqtt_host(),
        port = %config.mqtt_port(),
        "mqtt_client_subscribed"
    );

    // Rate-limit drop warnings to 1 per second
    let mut last_drop_warn = Instant::now() - Duration::from_secs(2);

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("mqtt_shutdown");
                    return Ok(());
                }
            }
            result = eventloop.poll() => {
                match result {
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        let pings = match parse_ping_message(&publish.payload) {
                            Ok(pings) => pings,
                            Err(e) => {
                                warn!(topic = %publish.topic, error = %e, "ping_payload_invalid");
                                continue;
                            }
                        };
                        debug!(topic = %publish.topic, count = %pings.len(), "ping_message_received");

                        for ping in pings {
                            match enqueue(&ping_tx, ping, &metrics) {
                                Enqueue::Queued => {}
                                Enqueue::Dropped => {
                                    if last_drop_warn.elapsed() > Duration::from_secs(1) {
                                        warn!(dropped_total = %metrics.pings_dropped(), "ping_dropped");
                                        last_drop_warn = Instant::now();
                                    }
                                }
                                Enqueue::Closed => {
                                    warn!("ping_channel_closed");
                                    return Ok(());
                                }
                            }
                        }
                    }
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        info!("mqtt_connected");
                    }
                    Ok(_) => {}
                    Err(e) => {
                        error!(error = %e, "mqtt_error");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::types::SubjectId;

    #[test]
    fn test_parse_single_ping() {
        let json = br#"{"subject_id": "S-1", "latitude": 5.7303596, "longitude": -72.8943613}"#;
        let pings = parse_ping_message(json).unwrap();
        assert_eq!(pings.len(), 1);
        assert_eq!(pings[0].subject_id, SubjectId::new("S-1"));
        assert_eq!(pings[0].latitude, 5.7303596);
        assert_eq!(pings[0].ts, None);
    }

    #[test]
    fn test_parse_ping_batch() {
        let json = br#"[
            {"subject_id": "S-1", "latitude": 10.0, "longitude": -70.0, "ts": 1767225600000},
            {"subject_id": "S-2", "latitude": 10.1, "longitude": -70.1}
        ]"#;
        let pings = parse_ping_message(json).unwrap();
        assert_eq!(pings.len(), 2);
        assert_eq!(pings[0].ts, Some(1767225600000));
        assert_eq!(pings[1].subject_id, SubjectId::new("S-2"));
    }

    #[test]
    fn test_parse_skips_blank_subject() {
        let json = br#"[{"subject_id": "", "latitude": 1.0, "longitude": 1.0}]"#;
        assert!(parse_ping_message(json).unwrap().is_empty());
    }

    #[test]
    fn test_parse_invalid_json() {
        assert!(parse_ping_message(b"not json").is_err());
        assert!(parse_ping_message(br#"{"subject_id": "S-1"}"#).is_err());
    }

    #[test]
    fn test_full_channel_drops_and_counts() {
        let metrics = Metrics::new();
        let (tx, _rx) = mpsc::channel(1);
        let ping = |id: &str| LocationPing {
            subject_id: SubjectId::new(id),
            latitude: 1.0,
            longitude: 1.0,
            ts: None,
        };

        assert_eq!(enqueue(&tx, ping("a"), &metrics), Enqueue::Queued);
        assert_eq!(enqueue(&tx, ping("b"), &metrics), Enqueue::Dropped);
        assert_eq!(metrics.pings_dropped(), 1);
    }

    #[test]
    fn test_closed_channel() {
        let metrics = Metrics::new();
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let ping = LocationPing {
            subject_id: SubjectId::new("a"),
            latitude: 1.0,
            longitude: 1.0,
            ts: None,
        };
        assert_eq!(enqueue(&tx, ping, &metrics), Enqueue::Closed);
        assert_eq!(metrics.pings_dropped(), 0);
    }
}
