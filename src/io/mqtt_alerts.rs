//! MQTT publisher for alerts and metrics
//!
//! Drains the alert channel and publishes to:
//! - `alerts.topic` - occupancy / capacity / overstay alerts (QoS 1)
//! - `alerts.metrics_topic` - periodic metrics snapshots (QoS 0)

use crate::infra::config::Config;
use crate::io::alert_channel::AlertMessage;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

pub struct MqttAlertPublisher {
    client: AsyncClient,
    rx: mpsc::Receiver<AlertMessage>,
    alerts_topic: String,
    metrics_topic: String,
}

impl MqttAlertPublisher {
    /// Create a publisher connected to the configured MQTT host/port
    pub fn new(config: &Config, rx: mpsc::Receiver<AlertMessage>) -> Self {
        let client_id = format!("access-alerts-{}", std::process::id());
        let mut mqttoptions = MqttOptions::new(client_id, config.mqtt_host(), config.mqtt_port());
        mqttoptions.set_keep_alive(Duration::from_secs(30));
        mqttoptions.set_clean_session(true);

        if let (Some(username), Some(password)) = (config.mqtt_username(), config.mqtt_password()) {
            mqttoptions.set_credentials(username, password);
        }

        let (client, mut eventloop) = AsyncClient::new(mqttoptions, 100);

        tokio::spawn(async move {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => info!("mqtt_alerts_connected"),
                    Ok(Event::Incoming(Packet::PubAck(_))) => debug!("mqtt_alerts_puback"),
                    Ok(_) => {}
                    Err(e) => {
                        warn!(error = %e, "mqtt_alerts_error");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        });

        Self {
            client,
            rx,
            alerts_topic: config.alerts_topic().to_string(),
            metrics_topic: config.alerts_metrics_topic().to_string(),
        }
    }

    /// Publish messages until shutdown, then drain what is queued
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(alerts = %self.alerts_topic, metrics = %self.metrics_topic, "mqtt_alerts_started");

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("mqtt_alerts_shutdown");
                        while let Ok(msg) = self.rx.try_recv() {
                            self.publish_message(msg).await;
                        }
                        return;
                    }
                }
                Some(msg) = self.rx.recv() => {
                    self.publish_message(msg).await;
                }
            }
        }
    }

    async fn publish_message(&self, msg: AlertMessage) {
        match msg {
            AlertMessage::Alert(payload) => {
                let json = match serde_json::to_vec(&payload) {
                    Ok(json) => json,
                    Err(e) => {
                        error!(error = %e, "alert_serialize_failed");
                        return;
                    }
                };
                // At-least-once for alerts
                if let Err(e) =
                    self.client.publish(&self.alerts_topic, QoS::AtLeastOnce, false, json).await
                {
                    error!(kind = %payload.alert.kind.as_str(), error = %e, "mqtt_alert_publish_failed");
                }
            }
            AlertMessage::Metrics(payload) => {
                if let Ok(json) = serde_json::to_vec(&payload) {
                    if let Err(e) =
                        self.client.publish(&self.metrics_topic, QoS::AtMostOnce, false, json).await
                    {
                        debug!(error = %e, "mqtt_metrics_publish_failed");
                    }
                }
            }
        }
    }
}
