//! Access Gateway - geofence-based automatic access and occupancy engine
//!
//! Registers entries and exits for a single facility from device location
//! pings (MQTT) and manual operations (HTTP), keeps live occupancy against the
//! capacity policy, and raises alerts when thresholds are crossed.
//!
//! Module structure:
//! - `domain/` - Core types (AccessRecord, Geofence, CapacityPolicy, errors, events)
//! - `io/` - External interfaces (MQTT ingestion, alert publisher, audit, HTTP)
//! - `services/` - Business logic (geofence tests, tracker, occupancy, engine)
//! - `infra/` - Infrastructure (Config, Clock, Store, Metrics, Broker)

use access_gateway::domain::AuditSink;
use access_gateway::infra::{Config, MemoryAccessStore, Metrics, SystemClock};
use access_gateway::io::{
    create_alert_channel, start_http_server, start_mqtt_client, ApiState, AuditLog,
    MqttAlertPublisher,
};
use access_gateway::services::{create_ping_worker, AccessEngine};
use anyhow::Context;
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::EnvFilter;

/// Access Gateway - automatic entry/exit registration and occupancy control
#[derive(Parser, Debug)]
#[command(name = "access-gateway", version, about)]
struct Args {
    /// Path to TOML configuration file (falls back to CONFIG_FILE, then config/dev.toml)
    #[arg(short, long)]
    config: Option<String>,
}

const PING_QUEUE_SIZE: usize = 1000;
const ALERT_QUEUE_SIZE: usize = 256;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // RUST_LOG controls the level, default INFO
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(UtcTime::rfc_3339())
        .with_target(false)
        .init();

    info!(git_hash = %env!("GIT_HASH"), "access-gateway starting");

    let args = Args::parse();
    let config_path = Config::resolve_config_path(args.config.as_deref());
    let config = Config::load_from_path(&config_path);

    access_gateway::infra::broker::start_embedded_broker(&config);

    info!(
        config_file = %config.config_file(),
        site = %config.site_id(),
        mqtt_host = %config.mqtt_host(),
        mqtt_port = %config.mqtt_port(),
        ping_topic = %config.mqtt_ping_topic(),
        geofences = %config.geofences().len(),
        max_occupancy = %config.capacity_policy().max_occupancy,
        warn_threshold = %config.capacity_policy().warn_threshold,
        occupancy_scope = ?config.occupancy_scope(),
        roster_size = %config.roster().len(),
        http_port = %config.http_port(),
        "config_loaded"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let metrics = Arc::new(Metrics::new());

    let mut engine = AccessEngine::from_config(
        &config,
        Arc::new(MemoryAccessStore::new()),
        Arc::new(SystemClock),
        metrics.clone(),
    )
    .context("invalid site configuration")?;

    if !config.audit_file().is_empty() {
        let audit: Arc<dyn AuditSink> = Arc::new(AuditLog::new(config.audit_file()));
        engine = engine.with_audit_sink(audit);
    }

    // Alert channel and MQTT publisher (if enabled)
    if config.alerts_enabled() {
        let (alert_sender, alert_rx) =
            create_alert_channel(ALERT_QUEUE_SIZE, config.site_id().to_string(), metrics.clone());

        let publisher = MqttAlertPublisher::new(&config, alert_rx);
        let publisher_shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            publisher.run(publisher_shutdown).await;
        });

        // Periodic metrics snapshot to MQTT
        let metrics_sender = alert_sender.clone();
        let metrics_for_publish = metrics.clone();
        let publish_interval = config.alerts_metrics_interval_secs();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(publish_interval));
            loop {
                interval.tick().await;
                metrics_sender.send_metrics(metrics_for_publish.snapshot());
            }
        });

        engine = engine.with_alert_sink(Arc::new(alert_sender));
    }

    let engine = Arc::new(engine);

    // Seed the occupancy gauge
    if let Err(e) = engine.current_occupancy() {
        warn!(error = %e, "initial_occupancy_failed");
    }

    // Ping worker fed by the MQTT client
    let (ping_tx, ping_worker) = create_ping_worker(engine.clone(), metrics.clone(), PING_QUEUE_SIZE);
    let worker_handle = tokio::spawn(ping_worker.run());

    let mqtt_config = config.clone();
    let mqtt_metrics = metrics.clone();
    let mqtt_shutdown = shutdown_rx.clone();
    tokio::spawn(async move {
        if let Err(e) = start_mqtt_client(&mqtt_config, ping_tx, mqtt_metrics, mqtt_shutdown).await {
            error!(error = %e, "mqtt_client_error");
        }
    });

    // HTTP API (if port > 0)
    let http_port = config.http_port();
    if http_port > 0 {
        let state = Arc::new(ApiState {
            engine: engine.clone(),
            site_id: config.site_id().to_string(),
            overstay_limit: chrono::Duration::minutes(config.overstay_limit_minutes() as i64),
        });
        let http_shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            if let Err(e) = start_http_server(http_port, state, http_shutdown).await {
                error!(error = %e, "http_server_error");
            }
        });
    }

    // Overstay checker (limit 0 disables it)
    if config.overstay_limit_minutes() > 0 {
        let overstay_engine = engine.clone();
        let overstay_limit = chrono::Duration::minutes(config.overstay_limit_minutes() as i64);
        let overstay_interval = config.overstay_check_interval_secs();
        let mut overstay_shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(overstay_interval));
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        match overstay_engine.check_overstays(overstay_limit) {
                            Ok(0) => {}
                            Ok(raised) => info!(raised = %raised, "overstay_check"),
                            Err(e) => warn!(error = %e, "overstay_check_failed"),
                        }
                    }
                    _ = overstay_shutdown.changed() => {
                        if *overstay_shutdown.borrow() {
                            return;
                        }
                    }
                }
            }
        });
    }

    // Metrics reporter
    let metrics_for_log = metrics.clone();
    let metrics_interval = config.metrics_interval_secs();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(metrics_interval));
        loop {
            interval.tick().await;
            metrics_for_log.report().log();
        }
    });

    tokio::signal::ctrl_c().await.context("failed to listen for shutdown signal")?;
    info!("shutdown_signal_received");
    let _ = shutdown_tx.send(true);

    // The MQTT client drops its sender on shutdown, letting the worker drain
    if let Err(e) = worker_handle.await {
        error!(error = %e, "ping_worker_join_failed");
    }

    info!("access-gateway shutdown complete");
    Ok(())
}
