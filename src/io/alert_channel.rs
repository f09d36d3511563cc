//! Typed channel for outbound alert and metrics messages
//!
//! The engine dispatches alerts synchronously from inside request handling,
//! so the sink only does a `try_send` onto a bounded channel. The MQTT
//! publisher drains it.

use crate::domain::events::{AlertEvent, AlertSink};
use crate::infra::metrics::{Metrics, MetricsSummary};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::warn;

/// Messages handed to the alert publisher
#[derive(Debug)]
pub enum AlertMessage {
    /// Occupancy, capacity or overstay alert (QoS 1)
    Alert(AlertPayload),
    /// Periodic metrics snapshot (QoS 0)
    Metrics(MetricsPayload),
}

#[derive(Debug, Clone, Serialize)]
pub struct AlertPayload {
    pub site: String,
    /// Publish time (epoch ms)
    pub ts: i64,
    #[serde(flatten)]
    pub alert: AlertEvent,
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricsPayload {
    pub site: String,
    /// Snapshot time (epoch ms)
    pub ts: i64,
    #[serde(flatten)]
    pub summary: MetricsSummary,
}

fn epoch_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Sender half, cloned into the engine as its [`AlertSink`]
#[derive(Clone)]
pub struct AlertSender {
    tx: mpsc::Sender<AlertMessage>,
    site_id: String,
    metrics: Arc<Metrics>,
}

impl AlertSender {
    pub fn new(tx: mpsc::Sender<AlertMessage>, site_id: String, metrics: Arc<Metrics>) -> Self {
        Self { tx, site_id, metrics }
    }

    /// Send a metrics snapshot; dropped silently if the channel is full
    pub fn send_metrics(&self, summary: MetricsSummary) {
        let payload = MetricsPayload { site: self.site_id.clone(), ts: epoch_ms(), summary };
        let _ = self.tx.try_send(AlertMessage::Metrics(payload));
    }
}

impl AlertSink for AlertSender {
    fn dispatch(&self, alert: AlertEvent) {
        let kind = alert.kind;
        let payload = AlertPayload { site: self.site_id.clone(), ts: epoch_ms(), alert };
        match self.tx.try_send(AlertMessage::Alert(payload)) {
            Ok(()) => self.metrics.record_alert_sent(),
            Err(e) => {
                self.metrics.record_alert_dropped();
                warn!(kind = %kind.as_str(), error = %e, "alert_dropped");
            }
        }
    }
}

/// Create the alert channel
///
/// Returns the sender (for the engine and metrics loop) and the receiver
/// (for the MQTT publisher).
pub fn create_alert_channel(
    buffer_size: usize,
    site_id: String,
    metrics: Arc<Metrics>,
) -> (AlertSender, mpsc::Receiver<AlertMessage>) {
    let (tx, rx) = mpsc::channel(buffer_size);
    (AlertSender::new(tx, site_id, metrics), rx)
}
