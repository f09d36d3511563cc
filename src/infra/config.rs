//! Configuration loading from TOML files
//!
//! Config file is selected via:
//! 1. --config <path> command line argument
//! 2. CONFIG_FILE environment variable
//! 3. Default: config/dev.toml

use crate::domain::types::{CapacityPolicy, Coordinate, Geofence, GeofenceId};
use crate::infra::clock::offset_from_minutes;
use anyhow::Context;
use chrono::FixedOffset;
use serde::Deserialize;
use std::env;
use std::fs;
use std::path::Path;

pub const DEFAULT_CONFIG_PATH: &str = "config/dev.toml";

/// Which open records count towards occupancy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OccupancyScope {
    /// Open records entered on the reference calendar day
    #[default]
    Today,
    /// Every open record regardless of entry day
    AllTime,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SiteConfig {
    /// Unique site identifier, used in published payloads
    #[serde(default = "default_site_id")]
    pub id: String,
    /// Fixed offset of the site's local time from UTC, defines "today"
    #[serde(default)]
    pub utc_offset_minutes: i32,
}

impl Default for SiteConfig {
    fn default() -> Self {
        Self { id: default_site_id(), utc_offset_minutes: 0 }
    }
}

fn default_site_id() -> String {
    "access-gateway".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct MqttConfig {
    #[serde(default = "default_mqtt_host")]
    pub host: String,
    #[serde(default = "default_mqtt_port")]
    pub port: u16,
    /// Topic filter devices publish location pings on
    #[serde(default = "default_ping_topic")]
    pub ping_topic: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            host: default_mqtt_host(),
            port: default_mqtt_port(),
            ping_topic: default_ping_topic(),
            username: None,
            password: None,
        }
    }
}

fn default_mqtt_host() -> String {
    "localhost".to_string()
}

fn default_mqtt_port() -> u16 {
    1883
}

fn default_ping_topic() -> String {
    "access/pings".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct BrokerConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_broker_bind_address")]
    pub bind_address: String,
    #[serde(default = "default_mqtt_port")]
    pub port: u16,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self { enabled: true, bind_address: default_broker_bind_address(), port: default_mqtt_port() }
    }
}

fn default_broker_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
pub struct HttpConfig {
    /// API + metrics port (0 to disable)
    #[serde(default = "default_http_port")]
    pub port: u16,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self { port: default_http_port() }
    }
}

fn default_http_port() -> u16 {
    8080
}

#[derive(Debug, Clone, Deserialize)]
pub struct CapacityConfig {
    #[serde(default = "default_max_occupancy")]
    pub max_occupancy: u32,
    #[serde(default = "default_warn_threshold")]
    pub warn_threshold: u32,
    #[serde(default = "default_alert_message")]
    pub alert_message: String,
    #[serde(default = "default_true")]
    pub active: bool,
}

impl Default for CapacityConfig {
    fn default() -> Self {
        Self {
            max_occupancy: default_max_occupancy(),
            warn_threshold: default_warn_threshold(),
            alert_message: default_alert_message(),
            active: true,
        }
    }
}

fn default_max_occupancy() -> u32 {
    CapacityPolicy::DEFAULT_MAX
}

fn default_warn_threshold() -> u32 {
    CapacityPolicy::DEFAULT_WARN
}

fn default_alert_message() -> String {
    CapacityPolicy::DEFAULT_MESSAGE.to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct GeofenceConfig {
    pub id: i32,
    #[serde(default)]
    pub name: String,
    pub center_latitude: f64,
    pub center_longitude: f64,
    pub radius_m: f64,
    #[serde(default = "default_true")]
    pub active: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TrackingConfig {
    #[serde(default)]
    pub occupancy_scope: OccupancyScope,
    /// Open records older than this raise an overstay alert (0 to disable)
    #[serde(default = "default_overstay_limit_minutes")]
    pub overstay_limit_minutes: u64,
    #[serde(default = "default_overstay_check_interval")]
    pub overstay_check_interval_secs: u64,
}

impl Default for TrackingConfig {
    fn default() -> Self {
        Self {
            occupancy_scope: OccupancyScope::Today,
            overstay_limit_minutes: default_overstay_limit_minutes(),
            overstay_check_interval_secs: default_overstay_check_interval(),
        }
    }
}

fn default_overstay_limit_minutes() -> u64 {
    12 * 60
}

fn default_overstay_check_interval() -> u64 {
    60
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct SubjectsConfig {
    /// Known subject ids; empty accepts any id
    #[serde(default)]
    pub roster: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AuditConfig {
    /// File path for the audit trail (JSONL format)
    #[serde(default = "default_audit_file")]
    pub file: String,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self { file: default_audit_file() }
    }
}

fn default_audit_file() -> String {
    "access_audit.jsonl".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct AlertsConfig {
    /// Enable MQTT alert publishing
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Topic for alert events (QoS 1)
    #[serde(default = "default_alerts_topic")]
    pub topic: String,
    /// Topic for periodic metrics snapshots (QoS 0)
    #[serde(default = "default_metrics_topic")]
    pub metrics_topic: String,
    #[serde(default = "default_metrics_publish_interval")]
    pub metrics_publish_interval_secs: u64,
}

impl Default for AlertsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            topic: default_alerts_topic(),
            metrics_topic: default_metrics_topic(),
            metrics_publish_interval_secs: default_metrics_publish_interval(),
        }
    }
}

fn default_alerts_topic() -> String {
    "access/alerts".to_string()
}

fn default_metrics_topic() -> String {
    "access/metrics".to_string()
}

fn default_metrics_publish_interval() -> u64 {
    5
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_interval")]
    pub interval_secs: u64,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self { interval_secs: default_metrics_interval() }
    }
}

fn default_metrics_interval() -> u64 {
    10
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub site: SiteConfig,
    #[serde(default)]
    pub mqtt: MqttConfig,
    #[serde(default)]
    pub broker: BrokerConfig,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub capacity: CapacityConfig,
    #[serde(default)]
    pub geofences: Vec<GeofenceConfig>,
    #[serde(default)]
    pub tracking: TrackingConfig,
    #[serde(default)]
    pub subjects: SubjectsConfig,
    #[serde(default)]
    pub audit: AuditConfig,
    #[serde(default)]
    pub alerts: AlertsConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Main configuration struct used throughout the application
#[derive(Debug, Clone)]
pub struct Config {
    site_id: String,
    site_offset: FixedOffset,
    mqtt_host: String,
    mqtt_port: u16,
    mqtt_ping_topic: String,
    mqtt_username: Option<String>,
    mqtt_password: Option<String>,
    broker_enabled: bool,
    broker_bind_address: String,
    broker_port: u16,
    http_port: u16,
    capacity_policy: CapacityPolicy,
    geofences: Vec<Geofence>,
    occupancy_scope: OccupancyScope,
    overstay_limit_minutes: u64,
    overstay_check_interval_secs: u64,
    roster: Vec<String>,
    audit_file: String,
    alerts_enabled: bool,
    alerts_topic: String,
    alerts_metrics_topic: String,
    alerts_metrics_interval_secs: u64,
    metrics_interval_secs: u64,
    config_file: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            site_id: default_site_id(),
            site_offset: offset_from_minutes(0),
            mqtt_host: default_mqtt_host(),
            mqtt_port: default_mqtt_port(),
            mqtt_ping_topic: default_ping_topic(),
            mqtt_username: None,
            mqtt_password: None,
            broker_enabled: true,
            broker_bind_address: default_broker_bind_address(),
            broker_port: default_mqtt_port(),
            http_port: default_http_port(),
            capacity_policy: CapacityPolicy::default(),
            geofences: vec![Self::default_geofence()],
            occupancy_scope: OccupancyScope::Today,
            overstay_limit_minutes: default_overstay_limit_minutes(),
            overstay_check_interval_secs: default_overstay_check_interval(),
            roster: Vec::new(),
            audit_file: default_audit_file(),
            alerts_enabled: true,
            alerts_topic: default_alerts_topic(),
            alerts_metrics_topic: default_metrics_topic(),
            alerts_metrics_interval_secs: default_metrics_publish_interval(),
            metrics_interval_secs: default_metrics_interval(),
            config_file: "default".to_string(),
        }
    }
}

impl Config {
    /// Campus perimeter used when no geofence is configured
    fn default_geofence() -> Geofence {
        Geofence {
            id: GeofenceId(1),
            name: "Perímetro principal".to_string(),
            center: Coordinate { latitude: 5.7303596, longitude: -72.8943613 },
            radius_m: 200.0,
            active: true,
        }
    }

    /// Determine config file path: explicit argument, then `CONFIG_FILE`, then the dev default
    pub fn resolve_config_path(cli_path: Option<&str>) -> String {
        Self::resolve_config_path_with(cli_path, env::var("CONFIG_FILE").ok())
    }

    fn resolve_config_path_with(cli_path: Option<&str>, env_path: Option<String>) -> String {
        if let Some(path) = cli_path.filter(|p| !p.is_empty()) {
            return path.to_string();
        }
        match env_path {
            Some(path) if !path.is_empty() => path,
            _ => DEFAULT_CONFIG_PATH.to_string(),
        }
    }

    /// Load configuration from a TOML file
    ///
    /// Geofences and the capacity policy are validated here; an invalid one
    /// fails the whole file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;

        let toml_config: TomlConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;

        let mut config = Self::from_toml(toml_config)
            .with_context(|| format!("Invalid config file {}", path.display()))?;
        config.config_file = path.display().to_string();
        Ok(config)
    }

    /// Build a validated config from already-parsed TOML sections
    pub fn from_toml(toml_config: TomlConfig) -> anyhow::Result<Self> {
        let capacity = toml_config.capacity;
        let capacity_policy = CapacityPolicy {
            max_occupancy: capacity.max_occupancy,
            warn_threshold: capacity.warn_threshold,
            alert_message: capacity.alert_message,
            active: capacity.active,
        };
        capacity_policy.validate().context("capacity section")?;

        let geofences = if toml_config.geofences.is_empty() {
            vec![Self::default_geofence()]
        } else {
            toml_config
                .geofences
                .into_iter()
                .map(|g| {
                    let geofence = Geofence {
                        id: GeofenceId(g.id),
                        name: if g.name.is_empty() { format!("GEOFENCE_{}", g.id) } else { g.name },
                        center: Coordinate { latitude: g.center_latitude, longitude: g.center_longitude },
                        radius_m: g.radius_m,
                        active: g.active,
                    };
                    geofence.validate().map(|_| geofence)
                })
                .collect::<Result<Vec<_>, _>>()
                .context("geofences section")?
        };

        Ok(Self {
            site_id: toml_config.site.id,
            site_offset: offset_from_minutes(toml_config.site.utc_offset_minutes),
            mqtt_host: toml_config.mqtt.host,
            mqtt_port: toml_config.mqtt.port,
            mqtt_ping_topic: toml_config.mqtt.ping_topic,
            mqtt_username: toml_config.mqtt.username,
            mqtt_password: toml_config.mqtt.password,
            broker_enabled: toml_config.broker.enabled,
            broker_bind_address: toml_config.broker.bind_address,
            broker_port: toml_config.broker.port,
            http_port: toml_config.http.port,
            capacity_policy,
            geofences,
            occupancy_scope: toml_config.tracking.occupancy_scope,
            overstay_limit_minutes: toml_config.tracking.overstay_limit_minutes,
            overstay_check_interval_secs: toml_config.tracking.overstay_check_interval_secs.max(1),
            roster: toml_config.subjects.roster,
            audit_file: toml_config.audit.file,
            alerts_enabled: toml_config.alerts.enabled,
            alerts_topic: toml_config.alerts.topic,
            alerts_metrics_topic: toml_config.alerts.metrics_topic,
            alerts_metrics_interval_secs: toml_config.alerts.metrics_publish_interval_secs.max(1),
            metrics_interval_secs: toml_config.metrics.interval_secs.max(1),
            config_file: "inline".to_string(),
        })
    }

    /// Load from an explicit path, falling back to defaults on any error
    pub fn load_from_path(path: &str) -> Self {
        match Self::from_file(path) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!(error = %format!("{e:#}"), path = %path, "config_fallback_to_defaults");
                Self::default()
            }
        }
    }

    pub fn site_id(&self) -> &str {
        &self.site_id
    }

    pub fn site_offset(&self) -> FixedOffset {
        self.site_offset
    }

    pub fn mqtt_host(&self) -> &str {
        &self.mqtt_host
    }

    pub fn mqtt_port(&self) -> u16 {
        self.mqtt_port
    }

    pub fn mqtt_ping_topic(&self) -> &str {
        &self.mqtt_ping_topic
    }

    pub fn mqtt_username(&self) -> Option<&str> {
        self.mqtt_username.as_deref()
    }

    pub fn mqtt_password(&self) -> Option<&str> {
        self.mqtt_password.as_deref()
    }

    pub fn broker_enabled(&self) -> bool {
        self.broker_enabled
    }

    pub fn broker_bind_address(&self) -> &str {
        &self.broker_bind_address
    }

    pub fn broker_port(&self) -> u16 {
        self.broker_port
    }

    pub fn http_port(&self) -> u16 {
        self.http_port
    }

    pub fn capacity_policy(&self) -> &CapacityPolicy {
        &self.capacity_policy
    }

    pub fn geofences(&self) -> &[Geofence] {
        &self.geofences
    }

    pub fn occupancy_scope(&self) -> OccupancyScope {
        self.occupancy_scope
    }

    pub fn overstay_limit_minutes(&self) -> u64 {
        self.overstay_limit_minutes
    }

    pub fn overstay_check_interval_secs(&self) -> u64 {
        self.overstay_check_interval_secs
    }

    pub fn roster(&self) -> &[String] {
        &self.roster
    }

    pub fn audit_file(&self) -> &str {
        &self.audit_file
    }

    pub fn alerts_enabled(&self) -> bool {
        self.alerts_enabled
    }

    pub fn alerts_topic(&self) -> &str {
        &self.alerts_topic
    }

    pub fn alerts_metrics_topic(&self) -> &str {
        &self.alerts_metrics_topic
    }

    pub fn alerts_metrics_interval_secs(&self) -> u64 {
        self.alerts_metrics_interval_secs
    }

    pub fn metrics_interval_secs(&self) -> u64 {
        self.metrics_interval_secs
    }

    pub fn config_file(&self) -> &str {
        &self.config_file
    }

    /// Builder method for tests to set the capacity policy
    pub fn with_capacity_policy(mut self, policy: CapacityPolicy) -> Self {
        self.capacity_policy = policy;
        self
    }

    /// Builder method for tests to set the geofences
    pub fn with_geofences(mut self, geofences: Vec<Geofence>) -> Self {
        self.geofences = geofences;
        self
    }

    pub fn with_occupancy_scope(mut self, scope: OccupancyScope) -> Self {
        self.occupancy_scope = scope;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.mqtt_host(), "localhost");
        assert_eq!(config.mqtt_port(), 1883);
        assert_eq!(config.mqtt_ping_topic(), "access/pings");
        assert_eq!(config.capacity_policy().max_occupancy, 2000);
        assert_eq!(config.capacity_policy().warn_threshold, 1800);
        assert_eq!(config.occupancy_scope(), OccupancyScope::Today);
        assert_eq!(config.geofences().len(), 1);
        assert_eq!(config.geofences()[0].radius_m, 200.0);
        assert!(config.roster().is_empty());
    }

    #[test]
    fn test_resolve_config_path_default() {
        assert_eq!(Config::resolve_config_path_with(None, None), "config/dev.toml");
        assert_eq!(Config::resolve_config_path_with(None, Some(String::new())), "config/dev.toml");
    }

    #[test]
    fn test_resolve_config_path_from_env() {
        let path = Config::resolve_config_path_with(None, Some("/etc/site.toml".to_string()));
        assert_eq!(path, "/etc/site.toml");
    }

    #[test]
    fn test_resolve_config_path_arg_wins_over_env() {
        let path = Config::resolve_config_path_with(
            Some("config/campus.toml"),
            Some("/etc/site.toml".to_string()),
        );
        assert_eq!(path, "config/campus.toml");
    }

    #[test]
    fn test_empty_toml_uses_section_defaults() {
        let toml_config: TomlConfig = toml::from_str("").unwrap();
        let config = Config::from_toml(toml_config).unwrap();
        assert_eq!(config.audit_file(), "access_audit.jsonl");
        assert_eq!(config.http_port(), 8080);
        assert!(config.broker_enabled());
        assert_eq!(config.geofences()[0].id, GeofenceId(1));
    }

    #[test]
    fn test_occupancy_scope_parses() {
        let toml_config: TomlConfig =
            toml::from_str("[tracking]\noccupancy_scope = \"all_time\"\n").unwrap();
        assert_eq!(toml_config.tracking.occupancy_scope, OccupancyScope::AllTime);
    }

    #[test]
    fn test_invalid_policy_rejected() {
        let toml_config: TomlConfig =
            toml::from_str("[capacity]\nmax_occupancy = 10\nwarn_threshold = 12\n").unwrap();
        assert!(Config::from_toml(toml_config).is_err());
    }

    #[test]
    fn test_invalid_geofence_rejected() {
        let toml_config: TomlConfig = toml::from_str(
            "[[geofences]]\nid = 3\ncenter_latitude = 10.0\ncenter_longitude = -70.0\nradius_m = 0.0\n",
        )
        .unwrap();
        let err = Config::from_toml(toml_config).unwrap_err();
        assert!(format!("{err:#}").contains("geofence 3"));
    }
}
