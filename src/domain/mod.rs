//! Domain models - core access-control types
//!
//! This module contains the canonical data types used throughout the system:
//! - `AccessRecord` - one entry/exit cycle for a subject (the audit trail)
//! - `Geofence` - circular perimeter used for containment tests
//! - `CapacityPolicy` / `OccupancySnapshot` - capacity limit and classification
//! - `AccessError` - error taxonomy shared by every operation
//! - `AlertEvent` / `AuditEvent` - data handed to external collaborators

pub mod error;
pub mod events;
pub mod types;

// Re-export commonly used types at module level
pub use error::{AccessError, StoreError};
pub use events::{AlertEvent, AlertKind, AlertSink, AuditEvent, AuditSink};
pub use types::{
    AccessMethod, AccessRecord, CapacityPolicy, Coordinate, Geofence, GeofenceId, OccupancyLevel,
    OccupancySnapshot, PingAction, PresenceState, RecordId, SubjectId,
};
