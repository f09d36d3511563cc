//! Events handed to external collaborators
//!
//! The engine does not deliver notifications or own an audit database. It
//! produces `AlertEvent`s for an [`AlertSink`] (the alert dispatcher) and an
//! `AuditEvent` for every successful mutation for an [`AuditSink`].

use crate::domain::types::{
    AccessMethod, AccessRecord, Coordinate, OccupancyLevel, OccupancySnapshot, RecordId, SubjectId,
};
use chrono::{DateTime, Utc};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    /// Occupancy crossed upward into WARNING or CRITICAL
    LevelRaised,
    /// An entry was refused because the facility is full
    EntryRejected,
    /// A subject has been inside longer than the configured limit
    Overstay,
}

impl AlertKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertKind::LevelRaised => "level_raised",
            AlertKind::EntryRejected => "entry_rejected",
            AlertKind::Overstay => "overstay",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AlertPriority {
    Medium,
    High,
}

/// Threshold event for the alert dispatcher
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AlertEvent {
    pub kind: AlertKind,
    pub priority: AlertPriority,
    pub at: DateTime<Utc>,
    pub title: String,
    pub message: String,
    pub occupancy: OccupancySnapshot,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subject: Option<SubjectId>,
}

impl AlertEvent {
    /// Alert for an upward crossing between two snapshots, if any
    ///
    /// Only rising into WARNING or CRITICAL produces an event; staying in the
    /// same band or falling never does.
    pub fn crossing(
        before: &OccupancySnapshot,
        after: &OccupancySnapshot,
        at: DateTime<Utc>,
    ) -> Option<Self> {
        if after.level <= before.level || after.level == OccupancyLevel::Normal {
            return None;
        }
        let title = match after.level {
            OccupancyLevel::Critical => "Aforo máximo alcanzado".to_string(),
            _ => format!("Alerta de aforo ({}%)", after.percent as u32),
        };
        Some(Self {
            kind: AlertKind::LevelRaised,
            priority: priority_for(after),
            at,
            title,
            message: describe(after),
            occupancy: after.clone(),
            subject: None,
        })
    }

    pub fn entry_rejected(
        subject: &SubjectId,
        occupancy: &OccupancySnapshot,
        at: DateTime<Utc>,
    ) -> Self {
        Self {
            kind: AlertKind::EntryRejected,
            priority: AlertPriority::High,
            at,
            title: "Ingreso rechazado por aforo".to_string(),
            message: describe(occupancy),
            occupancy: occupancy.clone(),
            subject: Some(subject.clone()),
        }
    }

    pub fn overstay(
        record: &AccessRecord,
        occupancy: &OccupancySnapshot,
        at: DateTime<Utc>,
    ) -> Self {
        let minutes = (at - record.entry_time).num_minutes();
        Self {
            kind: AlertKind::Overstay,
            priority: AlertPriority::Medium,
            at,
            title: "Permanencia excedida".to_string(),
            message: format!(
                "{} lleva {} minutos dentro (ingreso {})",
                record.subject,
                minutes,
                record.entry_time.to_rfc3339()
            ),
            occupancy: occupancy.clone(),
            subject: Some(record.subject.clone()),
        }
    }
}

fn priority_for(snapshot: &OccupancySnapshot) -> AlertPriority {
    if snapshot.level == OccupancyLevel::Critical || snapshot.percent >= 95.0 {
        AlertPriority::High
    } else {
        AlertPriority::Medium
    }
}

fn describe(snapshot: &OccupancySnapshot) -> String {
    let mut text = format!(
        "Ocupación {:.1}%: {} dentro, capacidad {}, disponibles {}",
        snapshot.percent, snapshot.count, snapshot.max_occupancy, snapshot.available
    );
    if let Some(ref message) = snapshot.message {
        text.push_str(". ");
        text.push_str(message);
    }
    text
}

/// Receives alert events. Delivery (push, email, MQTT) is the sink's concern.
pub trait AlertSink: Send + Sync {
    fn dispatch(&self, alert: AlertEvent);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    Entry,
    Exit,
}

/// One successful mutation of the access record table
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AuditEvent {
    pub at: DateTime<Utc>,
    pub action: AuditAction,
    pub record_id: RecordId,
    pub subject: SubjectId,
    pub method: AccessMethod,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub coordinate: Option<Coordinate>,
    /// Occupancy count after the mutation
    pub occupancy: usize,
}

impl AuditEvent {
    pub fn entry(record: &AccessRecord, occupancy: usize) -> Self {
        Self {
            at: record.entry_time,
            action: AuditAction::Entry,
            record_id: record.id,
            subject: record.subject.clone(),
            method: record.entry_method,
            coordinate: record.entry_coordinate,
            occupancy,
        }
    }

    /// Returns `None` for a record that is still open
    pub fn exit(record: &AccessRecord, occupancy: usize) -> Option<Self> {
        let exit = record.exit.as_ref()?;
        Some(Self {
            at: exit.time,
            action: AuditAction::Exit,
            record_id: record.id,
            subject: record.subject.clone(),
            method: exit.method,
            coordinate: exit.coordinate,
            occupancy,
        })
    }
}

/// Receives one call per successful mutation
pub trait AuditSink: Send + Sync {
    fn record(&self, event: &AuditEvent);
}
