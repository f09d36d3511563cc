//! Embedded MQTT broker using rumqttd
//!
//! Lets a single-site deployment run without an external broker: devices
//! publish pings straight to the gateway, and alert subscribers connect to it.

use crate::infra::config::Config as AppConfig;
use anyhow::Context;
use rumqttd::{Broker, Config, ConnectionSettings, RouterConfig, ServerSettings};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::thread;
use tracing::{info, warn};

/// Connections kept free for the gateway, alert subscribers and tooling
const SERVICE_CONNECTIONS: usize = 64;

/// Largest accepted publish; a ping batch of a few hundred subjects fits
const MAX_PAYLOAD_BYTES: usize = 65536;

/// Broker settings for the site: one v4 listener, one connection per subject
/// the facility can hold plus service headroom
pub fn broker_settings(app_config: &AppConfig) -> anyhow::Result<Config> {
    let addr_str = format!("{}:{}", app_config.broker_bind_address(), app_config.broker_port());
    let listen: SocketAddr = addr_str
        .parse()
        .with_context(|| format!("invalid broker bind address {addr_str}"))?;

    let max_connections =
        app_config.capacity_policy().max_occupancy as usize + SERVICE_CONNECTIONS;

    let router = RouterConfig {
        max_segment_size: 16 * 1024 * 1024,
        max_segment_count: 10,
        max_connections,
        max_outgoing_packet_count: 200,
        initialized_filters: None,
        ..Default::default()
    };

    let mut servers = HashMap::new();
    servers.insert(
        "v4".to_string(),
        ServerSettings {
            name: "v4".to_string(),
            listen,
            tls: None,
            next_connection_delay_ms: 1,
            connections: ConnectionSettings {
                connection_timeout_ms: 5000,
                max_payload_size: MAX_PAYLOAD_BYTES,
                max_inflight_count: 200,
                auth: None,
                dynamic_filters: false,
                external_auth: None,
            },
        },
    );

    Ok(Config {
        id: 0,
        router,
        v4: Some(servers),
        v5: None,
        ws: None,
        prometheus: None,
        metrics: None,
        bridge: None,
        console: None,
        cluster: None,
    })
}

/// Start the embedded MQTT broker if enabled. Returns whether it was started.
pub fn start_embedded_broker(app_config: &AppConfig) -> bool {
    if !app_config.broker_enabled() {
        info!("broker_disabled");
        return false;
    }

    let config = match broker_settings(app_config) {
        Ok(config) => config,
        Err(e) => {
            warn!(error = %format!("{e:#}"), "broker_config_invalid");
            return false;
        }
    };
    let max_connections = config.router.max_connections;

    thread::spawn(move || {
        let mut broker = Broker::new(config);
        if let Err(e) = broker.start() {
            warn!(error = %e, "broker_start_failed");
        }
    });

    // Listener binds asynchronously; let it settle before the MQTT client dials in
    thread::sleep(std::time::Duration::from_millis(100));
    info!(
        bind_address = %app_config.broker_bind_address(),
        port = %app_config.broker_port(),
        max_connections = %max_connections,
        "broker_started"
    );
    true
}
