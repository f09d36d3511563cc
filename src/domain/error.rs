//! Error taxonomy for access tracking
//!
//! Validation errors are caller mistakes and never mutate state. Rejections
//! (`AlreadyOpen`, `NoOpenRecord`, `CapacityExceeded`) are expected business
//! outcomes that callers react to; see [`AccessError::is_rejection`].

use crate::domain::types::SubjectId;

/// Backing store failure
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum StoreError {
    #[error("record {0} not found")]
    RecordNotFound(String),
    #[error("record {0} is already closed")]
    AlreadyClosed(String),
    #[error("open record already exists for subject {0}")]
    OpenConflict(SubjectId),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum AccessError {
    #[error("invalid coordinates ({latitude}, {longitude})")]
    InvalidCoordinates { latitude: f64, longitude: f64 },

    #[error("invalid geofence: {0}")]
    InvalidGeofence(String),

    #[error("invalid capacity policy: warn threshold {warn} must be in 1..={max}")]
    InvalidPolicy { max: u32, warn: u32 },

    #[error("subject {0} already has an open access record")]
    AlreadyOpen(SubjectId),

    #[error("subject {0} has no open access record")]
    NoOpenRecord(SubjectId),

    #[error("capacity exceeded: {count} inside, max {max}")]
    CapacityExceeded { count: usize, max: u32 },

    #[error("subject {0} not found")]
    SubjectNotFound(SubjectId),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl AccessError {
    /// Stable snake_case identifier for logs and API bodies
    pub fn code(&self) -> &'static str {
        match self {
            AccessError::InvalidCoordinates { .. } => "invalid_coordinates",
            AccessError::InvalidGeofence(_) => "invalid_geofence",
            AccessError::InvalidPolicy { .. } => "invalid_policy",
            AccessError::AlreadyOpen(_) => "already_open",
            AccessError::NoOpenRecord(_) => "no_open_record",
            AccessError::CapacityExceeded { .. } => "capacity_exceeded",
            AccessError::SubjectNotFound(_) => "subject_not_found",
            AccessError::Store(_) => "store_error",
        }
    }

    /// Business-rule rejection rather than a caller mistake or system failure
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            AccessError::AlreadyOpen(_)
                | AccessError::NoOpenRecord(_)
                | AccessError::CapacityExceeded { .. }
        )
    }

    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            AccessError::InvalidCoordinates { .. }
                | AccessError::InvalidGeofence(_)
                | AccessError::InvalidPolicy { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = AccessError::CapacityExceeded { count: 10, max: 10 };
        assert_eq!(err.to_string(), "capacity exceeded: 10 inside, max 10");

        let err = AccessError::AlreadyOpen(SubjectId::new("S-7"));
        assert_eq!(err.to_string(), "subject S-7 already has an open access record");
    }

    #[test]
    fn test_classification() {
        assert!(AccessError::NoOpenRecord(SubjectId::new("a")).is_rejection());
        assert!(!AccessError::SubjectNotFound(SubjectId::new("a")).is_rejection());
        assert!(AccessError::InvalidGeofence("r".into()).is_validation());
        assert!(!AccessError::Store(StoreError::Unavailable("down".into())).is_rejection());
    }

    #[test]
    fn test_store_error_converts() {
        let err: AccessError = StoreError::Unavailable("down".into()).into();
        assert_eq!(err.code(), "store_error");
        assert_eq!(err.to_string(), "store unavailable: down");
    }
}
