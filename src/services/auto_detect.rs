//! Automatic entry/exit detection from location pings
//!
//! A ping is classified inside/outside against the active geofences, then the
//! subject's live open/closed state decides the transition. Because the
//! decision reads live state under the subject lock (never a cached "last
//! seen" flag), repeating a ping is a no-op.

use crate::domain::error::AccessError;
use crate::domain::types::{
    AccessMethod, AccessRecord, CapacityPolicy, Coordinate, Geofence, GeofenceId,
    OccupancySnapshot, PingAction, PresenceState, SubjectId,
};
use crate::services::access_tracker::AccessStateTracker;
use crate::services::geofence::find_containing_geofence;
use crate::services::occupancy::OccupancyCounter;
use serde::Serialize;
use std::sync::Arc;

/// Transition implied by geometry and current state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Inside with no open record
    Enter,
    /// Outside with an open record
    Exit,
    /// Inside and already open
    StayInside,
    /// Outside and already closed
    StayOutside,
}

/// The four-case decision table
pub fn decide(inside: bool, open: bool) -> Decision {
    match (inside, open) {
        (true, false) => Decision::Enter,
        (false, true) => Decision::Exit,
        (true, true) => Decision::StayInside,
        (false, false) => Decision::StayOutside,
    }
}

/// Why an automatic entry was refused
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Rejection {
    pub code: &'static str,
    pub message: String,
}

impl From<&AccessError> for Rejection {
    fn from(error: &AccessError) -> Self {
        Self { code: error.code(), message: error.to_string() }
    }
}

/// Result of one ping
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PingOutcome {
    pub subject: SubjectId,
    pub state: PresenceState,
    pub action: PingAction,
    /// Geofence that contained the ping
    #[serde(skip_serializing_if = "Option::is_none")]
    pub geofence: Option<GeofenceId>,
    /// Record opened, closed, or confirmed open by this ping
    #[serde(skip_serializing_if = "Option::is_none")]
    pub record: Option<AccessRecord>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_secs: Option<i64>,
    /// Occupancy after the decision, recomputed for every ping
    pub occupancy: OccupancySnapshot,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rejection: Option<Rejection>,
}

/// Outcome plus the data the engine needs for alerts
#[derive(Debug, Clone)]
pub struct Detection {
    pub outcome: PingOutcome,
    /// Pre-entry snapshot from the capacity gate, set on ENTRY
    pub admitted_from: Option<OccupancySnapshot>,
    /// Business rejection that turned an entry into NONE
    pub rejected: Option<AccessError>,
}

type Applied = (
    PingAction,
    Option<AccessRecord>,
    Option<i64>,
    Option<OccupancySnapshot>,
    Option<AccessError>,
);

pub struct AutoDetector {
    tracker: Arc<AccessStateTracker>,
    occupancy: Arc<OccupancyCounter>,
}

impl AutoDetector {
    pub fn new(tracker: Arc<AccessStateTracker>, occupancy: Arc<OccupancyCounter>) -> Self {
        Self { tracker, occupancy }
    }

    /// Apply one ping for `subject` at `coordinate`
    ///
    /// Validation and store failures are returned as errors. Capacity and
    /// state rejections on the entry path become `action = NONE` with the
    /// reason in `rejection`.
    pub fn process_ping(
        &self,
        subject: &SubjectId,
        coordinate: Coordinate,
        geofences: &[Geofence],
        policy: &CapacityPolicy,
    ) -> Result<Detection, AccessError> {
        let containing = find_containing_geofence(coordinate, geofences)?.map(|g| g.id);
        let inside = containing.is_some();

        let (action, record, duration, admitted_from, rejected) =
            self.tracker.with_subject(subject, |txn| -> Result<Applied, AccessError> {
                let open = txn.open_record()?;
                match decide(inside, open.is_some()) {
                    Decision::Enter => {
                        let now = self.tracker.clock().now();
                        let enter = || txn.open_entry(Some(coordinate), AccessMethod::Automatic);
                        match self.occupancy.admit(now, policy, enter) {
                            Ok((before, record)) => {
                                Ok((PingAction::Entry, Some(record), None, Some(before), None))
                            }
                            Err(e) if e.is_rejection() => Ok((PingAction::None, None, None, None, Some(e))),
                            Err(e) => Err(e),
                        }
                    }
                    Decision::Exit => {
                        let closed = txn.close_exit(Some(coordinate), AccessMethod::Automatic)?;
                        Ok((
                            PingAction::Exit,
                            Some(closed.record),
                            Some(closed.duration.num_seconds()),
                            None,
                            None,
                        ))
                    }
                    Decision::StayInside => Ok((PingAction::None, open, None, None, None)),
                    Decision::StayOutside => Ok((PingAction::None, None, None, None, None)),
                }
            })?;

        let occupancy = self.occupancy.snapshot(self.tracker.clock().now(), policy)?;
        let state = if inside { PresenceState::Inside } else { PresenceState::Outside };

        Ok(Detection {
            outcome: PingOutcome {
                subject: subject.clone(),
                state,
                action,
                geofence: containing,
                record,
                duration_secs: duration,
                occupancy,
                rejection: rejected.as_ref().map(Rejection::from),
            },
            admitted_from,
            rejected,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infra::clock::{offset_from_minutes, ManualClock};
    use crate::infra::config::OccupancyScope;
    use crate::infra::store::MemoryAccessStore;
    use chrono::{Duration, TimeZone, Utc};

    struct Fixture {
        detector: AutoDetector,
        store: Arc<MemoryAccessStore>,
        clock: Arc<ManualClock>,
        geofences: Vec<Geofence>,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(MemoryAccessStore::new());
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2026, 3, 2, 13, 0, 0).unwrap()));
        let tracker = Arc::new(AccessStateTracker::new(store.clone(), clock.clone()));
        let occupancy = Arc::new(OccupancyCounter::new(
            store.clone(),
            OccupancyScope::Today,
            offset_from_minutes(0),
        ));
        let center = Coordinate::new(10.0, -70.0).unwrap();
        let geofences = vec![Geofence::new(GeofenceId(1), "main", center, 100.0).unwrap()];
        Fixture { detector: AutoDetector::new(tracker, occupancy), store, clock, geofences }
    }

    fn inside() -> Coordinate {
        Coordinate::new(10.0005, -70.0).unwrap()
    }

    fn outside() -> Coordinate {
        Coordinate::new(10.01, -70.0).unwrap()
    }

    #[test]
    fn test_decision_table() {
        assert_eq!(decide(true, false), Decision::Enter);
        assert_eq!(decide(false, true), Decision::Exit);
        assert_eq!(decide(true, true), Decision::StayInside);
        assert_eq!(decide(false, false), Decision::StayOutside);
    }

    #[test]
    fn test_repeated_inside_pings_enter_once() {
        let f = fixture();
        let s = SubjectId::new("S-1");
        let policy = CapacityPolicy::default();

        let first = f.detector.process_ping(&s, inside(), &f.geofences, &policy).unwrap();
        assert_eq!(first.outcome.action, PingAction::Entry);
        assert_eq!(first.outcome.state, PresenceState::Inside);
        assert_eq!(first.outcome.geofence, Some(GeofenceId(1)));
        assert_eq!(first.outcome.occupancy.count, 1);
        assert_eq!(first.admitted_from.map(|snap| snap.count), Some(0));

        for _ in 0..5 {
            let again = f.detector.process_ping(&s, inside(), &f.geofences, &policy).unwrap();
            assert_eq!(again.outcome.action, PingAction::None);
            assert_eq!(again.outcome.state, PresenceState::Inside);
            assert_eq!(again.outcome.occupancy.count, 1);
        }
        assert_eq!(f.store.history(&s).len(), 1);
    }

    #[test]
    fn test_leaving_closes_once() {
        let f = fixture();
        let s = SubjectId::new("S-1");
        let policy = CapacityPolicy::default();

        f.detector.process_ping(&s, inside(), &f.geofences, &policy).unwrap();
        f.clock.advance(Duration::minutes(20));

        let exit = f.detector.process_ping(&s, outside(), &f.geofences, &policy).unwrap();
        assert_eq!(exit.outcome.action, PingAction::Exit);
        assert_eq!(exit.outcome.state, PresenceState::Outside);
        assert_eq!(exit.outcome.duration_secs, Some(20 * 60));
        assert_eq!(exit.outcome.occupancy.count, 0);

        let again = f.detector.process_ping(&s, outside(), &f.geofences, &policy).unwrap();
        assert_eq!(again.outcome.action, PingAction::None);
        assert!(again.outcome.record.is_none());
    }

    #[test]
    fn test_entry_rejected_when_full() {
        let f = fixture();
        let policy = CapacityPolicy::new(1, 1, "lleno").unwrap();

        f.detector.process_ping(&SubjectId::new("first"), inside(), &f.geofences, &policy).unwrap();
        let second = f
            .detector
            .process_ping(&SubjectId::new("second"), inside(), &f.geofences, &policy)
            .unwrap();

        assert_eq!(second.outcome.action, PingAction::None);
        assert_eq!(second.outcome.state, PresenceState::Inside);
        assert_eq!(second.outcome.rejection.as_ref().map(|r| r.code), Some("capacity_exceeded"));
        assert!(matches!(second.rejected, Some(AccessError::CapacityExceeded { count: 1, max: 1 })));
        assert_eq!(second.outcome.occupancy.count, 1);
        assert!(f.store.history(&SubjectId::new("second")).is_empty());
    }

    #[test]
    fn test_invalid_ping_is_an_error() {
        let f = fixture();
        let bad = Coordinate { latitude: 10.0, longitude: 190.0 };
        let err = f
            .detector
            .process_ping(&SubjectId::new("S-1"), bad, &f.geofences, &CapacityPolicy::default())
            .unwrap_err();
        assert!(matches!(err, AccessError::InvalidCoordinates { .. }));
    }

    #[test]
    fn test_inactive_geofence_means_outside() {
        let mut f = fixture();
        f.geofences[0].active = false;
        let outcome = f
            .detector
            .process_ping(&SubjectId::new("S-1"), inside(), &f.geofences, &CapacityPolicy::default())
            .unwrap();
        assert_eq!(outcome.outcome.state, PresenceState::Outside);
        assert_eq!(outcome.outcome.action, PingAction::None);
    }
}
