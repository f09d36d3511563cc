//! Ping simulator - publishes synthetic device location pings
//!
//! Each simulated subject orbits the geofence center at a radius that swings
//! between half and one and a half geofence radii, so subjects cross the
//! perimeter in both directions at staggered times. Alerts published by the
//! gateway are logged when `--watch-alerts` is set.
//!
//! Usage:
//!   cargo run --bin ping-sim -- --subjects 20 --interval-ms 500

use clap::Parser;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use serde_json::json;
use std::f64::consts::TAU;
use std::time::Duration;
use tracing::{debug, info, warn};
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::EnvFilter;

/// Metres per degree of latitude on the haversine sphere
const METRES_PER_DEGREE: f64 = 111_194.93;

#[derive(Parser, Debug)]
#[command(name = "ping-sim")]
#[command(about = "Publish synthetic location pings to the access gateway")]
struct Args {
    /// MQTT broker host
    #[arg(long, default_value = "localhost")]
    mqtt_host: String,

    /// MQTT broker port
    #[arg(long, default_value = "1883")]
    mqtt_port: u16,

    /// Ping topic
    #[arg(long, default_value = "access/pings")]
    topic: String,

    /// Geofence center latitude
    #[arg(long, default_value = "5.7303596")]
    latitude: f64,

    /// Geofence center longitude
    #[arg(long, default_value = "-72.8943613")]
    longitude: f64,

    /// Geofence radius in metres
    #[arg(long, default_value = "200")]
    radius_m: f64,

    /// Number of simulated subjects (ids SIM-0001..)
    #[arg(short, long, default_value = "10")]
    subjects: usize,

    /// Delay between ping rounds
    #[arg(long, default_value = "1000")]
    interval_ms: u64,

    /// Rounds for one full in/out cycle of a subject
    #[arg(long, default_value = "20")]
    period: u32,

    /// Stop after this many rounds (0 = run forever)
    #[arg(long, default_value = "0")]
    rounds: u64,

    /// Publish each round as one JSON array instead of one message per ping
    #[arg(long)]
    batch: bool,

    /// Subscribe to this alerts topic and log what arrives
    #[arg(long)]
    watch_alerts: Option<String>,
}

struct SimSubject {
    id: String,
    /// Phase offset in [0, 1)
    phase: f64,
    /// Bearing from the center, radians
    bearing: f64,
}

impl SimSubject {
    fn new(index: usize, total: usize) -> Self {
        let share = index as f64 / total.max(1) as f64;
        Self { id: format!("SIM-{:04}", index + 1), phase: share, bearing: share * TAU }
    }

    /// Position at `round` as (latitude, longitude)
    fn position(&self, round: u64, args: &Args) -> (f64, f64) {
        let t = round as f64 / args.period.max(1) as f64 + self.phase;
        let distance = args.radius_m * (1.0 + 0.5 * (t * TAU).sin());
        let north = distance * self.bearing.cos();
        let east = distance * self.bearing.sin();
        let latitude = args.latitude + north / METRES_PER_DEGREE;
        let longitude =
            args.longitude + east / (METRES_PER_DEGREE * args.latitude.to_radians().cos());
        (latitude, longitude)
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_timer(UtcTime::rfc_3339()).init();

    let args = Args::parse();

    let client_id = format!("ping-sim-{}", std::process::id());
    let mut mqtt_options = MqttOptions::new(client_id, &args.mqtt_host, args.mqtt_port);
    mqtt_options.set_keep_alive(Duration::from_secs(30));

    let (client, mut eventloop) = AsyncClient::new(mqtt_options, 100);

    if let Some(ref alerts_topic) = args.watch_alerts {
        client.subscribe(alerts_topic, QoS::AtLeastOnce).await?;
    }

    tokio::spawn(async move {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(_))) => info!("sim_connected"),
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    let payload = String::from_utf8_lossy(&publish.payload);
                    info!(topic = %publish.topic, payload = %payload, "alert_received");
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(error = %e, "sim_mqtt_error");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
    });

    let subjects: Vec<SimSubject> =
        (0..args.subjects).map(|i| SimSubject::new(i, args.subjects)).collect();

    info!(
        subjects = %subjects.len(),
        topic = %args.topic,
        radius_m = %args.radius_m,
        interval_ms = %args.interval_ms,
        "sim_started"
    );

    let mut interval = tokio::time::interval(Duration::from_millis(args.interval_ms.max(1)));
    let mut round: u64 = 0;

    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = tokio::signal::ctrl_c() => break,
        }

        let ts = chrono::Utc::now().timestamp_millis();
        let pings: Vec<serde_json::Value> = subjects
            .iter()
            .map(|s| {
                let (latitude, longitude) = s.position(round, &args);
                json!({ "subject_id": s.id, "latitude": latitude, "longitude": longitude, "ts": ts })
            })
            .collect();

        if args.batch {
            client.publish(&args.topic, QoS::AtMostOnce, false, serde_json::to_vec(&pings)?).await?;
        } else {
            for ping in &pings {
                client.publish(&args.topic, QoS::AtMostOnce, false, serde_json::to_vec(ping)?).await?;
            }
        }
        debug!(round = %round, pings = %pings.len(), "sim_round_published");

        round += 1;
        if args.rounds > 0 && round >= args.rounds {
            break;
        }
    }

    info!(rounds = %round, "sim_finished");
    // Give the eventloop a moment to flush
    tokio::time::sleep(Duration::from_millis(200)).await;
    Ok(())
}
