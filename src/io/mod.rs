//! IO modules - external system interfaces
//!
//! This module contains all external IO operations:
//! - `mqtt` - MQTT client for receiving device location pings
//! - `alert_channel` - Typed channel feeding the alert publisher
//! - `mqtt_alerts` - MQTT publisher for alerts and metrics snapshots
//! - `audit` - Entry/exit audit trail to file (JSONL format)
//! - `http_api` - HTTP JSON transport for engine operations
//! - `prometheus` - Prometheus text formatting for `/metrics`

pub mod alert_channel;
pub mod audit;
pub mod http_api;
pub mod mqtt;
pub mod mqtt_alerts;
pub mod prometheus;

// Re-export commonly used types
pub use alert_channel::{create_alert_channel, AlertMessage, AlertSender};
pub use audit::AuditLog;
pub use http_api::{start_http_server, ApiState};
pub use mqtt::start_mqtt_client;
pub use mqtt_alerts::MqttAlertPublisher;
