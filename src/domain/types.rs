//! Shared types for the access gateway

use crate::domain::error::AccessError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Newtype wrapper for subject IDs (identity lives in an external system)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubjectId(pub String);

impl SubjectId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SubjectId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Newtype wrapper for access record IDs (UUIDv7, time-ordered)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordId(pub Uuid);

impl RecordId {
    pub fn generate() -> Self {
        Self(Uuid::now_v7())
    }
}

impl std::fmt::Display for RecordId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Newtype wrapper for geofence IDs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(transparent)]
#[serde(transparent)]
pub struct GeofenceId(pub i32);

impl std::fmt::Display for GeofenceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// WGS84 coordinate in decimal degrees
///
/// Construct through [`Coordinate::new`] to get range validation. Fields are
/// public so deserialized values can be re-validated with [`Coordinate::validate`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinate {
    pub latitude: f64,
    pub longitude: f64,
}

impl Coordinate {
    pub fn new(latitude: f64, longitude: f64) -> Result<Self, AccessError> {
        let coordinate = Self { latitude, longitude };
        coordinate.validate()?;
        Ok(coordinate)
    }

    /// Latitude in [-90, 90], longitude in [-180, 180], both finite
    pub fn validate(&self) -> Result<(), AccessError> {
        let lat_ok = self.latitude.is_finite() && (-90.0..=90.0).contains(&self.latitude);
        let lon_ok = self.longitude.is_finite() && (-180.0..=180.0).contains(&self.longitude);
        if lat_ok && lon_ok {
            Ok(())
        } else {
            Err(AccessError::InvalidCoordinates {
                latitude: self.latitude,
                longitude: self.longitude,
            })
        }
    }

    /// Build from an optional latitude/longitude pair
    ///
    /// Both absent is `None`; exactly one present is invalid.
    pub fn from_parts(
        latitude: Option<f64>,
        longitude: Option<f64>,
    ) -> Result<Option<Self>, AccessError> {
        match (latitude, longitude) {
            (None, None) => Ok(None),
            (Some(lat), Some(lon)) => Self::new(lat, lon).map(Some),
            (lat, lon) => Err(AccessError::InvalidCoordinates {
                latitude: lat.unwrap_or(f64::NAN),
                longitude: lon.unwrap_or(f64::NAN),
            }),
        }
    }
}

/// Circular perimeter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Geofence {
    pub id: GeofenceId,
    pub name: String,
    pub center: Coordinate,
    /// Radius in meters, must be > 0
    pub radius_m: f64,
    pub active: bool,
}

impl Geofence {
    pub fn new(
        id: GeofenceId,
        name: impl Into<String>,
        center: Coordinate,
        radius_m: f64,
    ) -> Result<Self, AccessError> {
        let geofence = Self { id, name: name.into(), center, radius_m, active: true };
        geofence.validate()?;
        Ok(geofence)
    }

    pub fn validate(&self) -> Result<(), AccessError> {
        if !self.radius_m.is_finite() || self.radius_m <= 0.0 {
            return Err(AccessError::InvalidGeofence(format!(
                "geofence {} radius must be > 0 m, got {}",
                self.id, self.radius_m
            )));
        }
        if self.center.validate().is_err() {
            return Err(AccessError::InvalidGeofence(format!(
                "geofence {} center ({}, {}) out of range",
                self.id, self.center.latitude, self.center.longitude
            )));
        }
        Ok(())
    }
}

/// How an entry or exit was detected
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessMethod {
    Automatic,
    Manual,
    DeviceScan,
}

impl AccessMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccessMethod::Automatic => "automatic",
            AccessMethod::Manual => "manual",
            AccessMethod::DeviceScan => "device_scan",
        }
    }
}

impl std::str::FromStr for AccessMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "automatic" | "auto" => Ok(AccessMethod::Automatic),
            "manual" => Ok(AccessMethod::Manual),
            "device_scan" | "qr" | "scan" => Ok(AccessMethod::DeviceScan),
            other => Err(format!("unknown access method: {other}")),
        }
    }
}

/// Exit half of an access record, set exactly once
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExitStamp {
    pub time: DateTime<Utc>,
    pub coordinate: Option<Coordinate>,
    pub method: AccessMethod,
}

/// One entry/exit cycle for a subject. `exit == None` means open.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccessRecord {
    pub id: RecordId,
    pub subject: SubjectId,
    pub entry_time: DateTime<Utc>,
    pub entry_coordinate: Option<Coordinate>,
    pub entry_method: AccessMethod,
    pub exit: Option<ExitStamp>,
}

impl AccessRecord {
    pub fn open(
        subject: SubjectId,
        entry_time: DateTime<Utc>,
        coordinate: Option<Coordinate>,
        method: AccessMethod,
    ) -> Self {
        Self {
            id: RecordId::generate(),
            subject,
            entry_time,
            entry_coordinate: coordinate,
            entry_method: method,
            exit: None,
        }
    }

    #[inline]
    pub fn is_open(&self) -> bool {
        self.exit.is_none()
    }

    pub fn exit_time(&self) -> Option<DateTime<Utc>> {
        self.exit.as_ref().map(|e| e.time)
    }

    /// Time spent inside; `None` while open
    pub fn duration(&self) -> Option<chrono::Duration> {
        self.exit_time().map(|t| t - self.entry_time)
    }
}

/// Facility capacity limit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapacityPolicy {
    pub max_occupancy: u32,
    pub warn_threshold: u32,
    pub alert_message: String,
    pub active: bool,
}

impl CapacityPolicy {
    pub const DEFAULT_MAX: u32 = 2000;
    pub const DEFAULT_WARN: u32 = 1800;
    pub const DEFAULT_MESSAGE: &'static str = "Se está alcanzando el aforo máximo del centro";

    pub fn new(
        max_occupancy: u32,
        warn_threshold: u32,
        alert_message: impl Into<String>,
    ) -> Result<Self, AccessError> {
        let policy = Self {
            max_occupancy,
            warn_threshold,
            alert_message: alert_message.into(),
            active: true,
        };
        policy.validate()?;
        Ok(policy)
    }

    /// 0 < warn <= max
    pub fn validate(&self) -> Result<(), AccessError> {
        if self.warn_threshold == 0 || self.warn_threshold > self.max_occupancy {
            return Err(AccessError::InvalidPolicy {
                max: self.max_occupancy,
                warn: self.warn_threshold,
            });
        }
        Ok(())
    }
}

impl Default for CapacityPolicy {
    fn default() -> Self {
        Self {
            max_occupancy: Self::DEFAULT_MAX,
            warn_threshold: Self::DEFAULT_WARN,
            alert_message: Self::DEFAULT_MESSAGE.to_string(),
            active: true,
        }
    }
}

/// Occupancy classification band. Ordered so that `Normal < Warning < Critical`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OccupancyLevel {
    Normal,
    Warning,
    Critical,
}

impl OccupancyLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            OccupancyLevel::Normal => "normal",
            OccupancyLevel::Warning => "warning",
            OccupancyLevel::Critical => "critical",
        }
    }
}

/// Point-in-time occupancy with its classification against the capacity policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OccupancySnapshot {
    pub count: usize,
    pub max_occupancy: u32,
    pub warn_threshold: u32,
    pub level: OccupancyLevel,
    /// Share of max occupancy, rounded to 2 decimals
    pub percent: f64,
    /// Places left before max
    pub available: usize,
    /// Policy alert message, only set when level is not NORMAL
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Whether a ping placed the subject inside any active geofence
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PresenceState {
    Inside,
    Outside,
}

/// Transition applied by a ping
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PingAction {
    Entry,
    Exit,
    None,
}

impl PingAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            PingAction::Entry => "entry",
            PingAction::Exit => "exit",
            PingAction::None => "none",
        }
    }
}

/// Location report as published by a device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocationPing {
    pub subject_id: SubjectId,
    pub latitude: f64,
    pub longitude: f64,
    /// Optional device timestamp (epoch ms), informational only
    #[serde(default)]
    pub ts: Option<u64>,
}
