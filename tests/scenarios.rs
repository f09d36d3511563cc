//! End-to-end access scenarios through the public engine API

use access_gateway::domain::types::{
    AccessMethod, CapacityPolicy, Coordinate, Geofence, GeofenceId, OccupancyLevel, PingAction,
    PresenceState, SubjectId,
};
use access_gateway::domain::AccessError;
use access_gateway::infra::clock::offset_from_minutes;
use access_gateway::infra::{ManualClock, MemoryAccessStore, Metrics, OccupancyScope, Roster, StaticSite};
use access_gateway::services::geofence::{haversine_distance, is_inside};
use access_gateway::services::AccessEngine;
use chrono::{Duration, TimeZone, Utc};
use std::sync::Arc;

fn center() -> Coordinate {
    Coordinate::new(10.0, -70.0).unwrap()
}

fn campus() -> Geofence {
    Geofence::new(GeofenceId(1), "campus", center(), 100.0).unwrap()
}

struct Harness {
    engine: AccessEngine,
    clock: Arc<ManualClock>,
    metrics: Arc<Metrics>,
}

fn harness(policy: CapacityPolicy) -> Harness {
    let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2026, 3, 2, 13, 0, 0).unwrap()));
    let metrics = Arc::new(Metrics::new());
    let site = StaticSite::new(vec![campus()], policy).unwrap();
    let engine = AccessEngine::new(
        Arc::new(MemoryAccessStore::new()),
        clock.clone(),
        Arc::new(site),
        Arc::new(Roster::open()),
        OccupancyScope::Today,
        offset_from_minutes(-300),
        metrics.clone(),
    );
    Harness { engine, clock, metrics }
}

fn subject(n: usize) -> SubjectId {
    SubjectId::new(format!("S-{n}"))
}

#[test]
fn geofence_boundary_at_one_hundred_metres() {
    let fence = campus();

    let near = Coordinate::new(10.00089, -70.0).unwrap();
    assert!(haversine_distance(center(), near) <= 100.0);
    assert!(is_inside(near, &fence).unwrap());

    // ~101 m north
    let beyond = Coordinate::new(10.000909, -70.0).unwrap();
    assert!(haversine_distance(center(), beyond) > 100.0);
    assert!(!is_inside(beyond, &fence).unwrap());
}

#[test]
fn warning_at_threshold_and_rejection_at_capacity() {
    let h = harness(CapacityPolicy::new(10, 8, "Casi lleno").unwrap());

    for n in 0..8 {
        h.engine.register_entry(&subject(n), None, AccessMethod::Manual).unwrap();
    }
    let occupancy = h.engine.current_occupancy().unwrap();
    assert_eq!(occupancy.count, 8);
    assert_eq!(occupancy.level, OccupancyLevel::Warning);
    assert_eq!(occupancy.message.as_deref(), Some("Casi lleno"));

    for n in 8..10 {
        h.engine.register_entry(&subject(n), None, AccessMethod::Manual).unwrap();
    }
    assert_eq!(h.engine.current_occupancy().unwrap().level, OccupancyLevel::Critical);

    let err = h.engine.register_entry(&subject(10), None, AccessMethod::Manual).unwrap_err();
    assert_eq!(err, AccessError::CapacityExceeded { count: 10, max: 10 });
    assert_eq!(h.engine.current_occupancy().unwrap().count, 10);
    assert_eq!(h.metrics.capacity_rejections(), 1);
}

#[test]
fn exit_without_entry_fails() {
    let h = harness(CapacityPolicy::default());
    let err = h.engine.register_exit(&subject(1), None, AccessMethod::Manual).unwrap_err();
    assert!(matches!(err, AccessError::NoOpenRecord(_)));
}

#[test]
fn entry_exit_reentry_cycle() {
    let h = harness(CapacityPolicy::default());
    let s = subject(1);

    let first = h.engine.register_entry(&s, None, AccessMethod::Manual).unwrap();
    let err = h.engine.register_entry(&s, None, AccessMethod::Manual).unwrap_err();
    assert!(matches!(err, AccessError::AlreadyOpen(_)));

    h.clock.advance(Duration::minutes(45));
    let exit = h.engine.register_exit(&s, None, AccessMethod::Manual).unwrap();
    assert_eq!(exit.record_id, first.record_id);
    assert_eq!(exit.duration_secs, 45 * 60);
    assert!(exit.exit_time >= exit.entry_time);

    let again = h.engine.register_entry(&s, None, AccessMethod::Manual).unwrap();
    assert_ne!(again.record_id, first.record_id);
    assert_eq!(h.engine.subjects_inside().unwrap().len(), 1);
}

#[test]
fn repeated_inside_pings_enter_once() {
    let h = harness(CapacityPolicy::default());
    let s = subject(1);
    let inside = Coordinate::new(10.0003, -70.0002).unwrap();

    let first = h.engine.auto_ping(&s, inside).unwrap();
    assert_eq!(first.action, PingAction::Entry);
    assert_eq!(first.state, PresenceState::Inside);

    for _ in 0..4 {
        let again = h.engine.auto_ping(&s, inside).unwrap();
        assert_eq!(again.action, PingAction::None);
        assert_eq!(again.state, PresenceState::Inside);
    }

    assert_eq!(h.engine.current_occupancy().unwrap().count, 1);
    assert_eq!(h.metrics.pings_total(), 5);
    assert_eq!(h.metrics.entries(AccessMethod::Automatic), 1);
}

#[test]
fn mixed_bulk_batch_keeps_successes() {
    let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2026, 3, 2, 13, 0, 0).unwrap()));
    let engine = AccessEngine::new(
        Arc::new(MemoryAccessStore::new()),
        clock,
        Arc::new(StaticSite::new(vec![campus()], CapacityPolicy::default()).unwrap()),
        Arc::new(Roster::new(["S-1", "S-2", "S-3"])),
        OccupancyScope::Today,
        offset_from_minutes(0),
        Arc::new(Metrics::new()),
    );
    engine.register_entry(&subject(1), None, AccessMethod::Manual).unwrap();

    let batch = [subject(1), subject(2), SubjectId::new("unknown"), subject(3)];
    let report = engine.bulk_register_entry(&batch, AccessMethod::DeviceScan);

    assert_eq!(report.registered_count, 2);
    assert_eq!(report.registered, vec![subject(2), subject(3)]);
    let codes: Vec<&str> = report.errors.iter().map(|e| e.code).collect();
    assert_eq!(codes, vec!["already_open", "subject_not_found"]);
    assert_eq!(engine.current_occupancy().unwrap().count, 3);
}

#[test]
fn new_site_day_resets_today_occupancy() {
    let h = harness(CapacityPolicy::default());
    // 13:00 UTC is 08:00 at UTC-5
    h.engine.register_entry(&subject(1), None, AccessMethod::Manual).unwrap();
    assert_eq!(h.engine.daily_stats().unwrap().entries_today, 1);

    // 06:00 UTC next day is 01:00 local, a new site day
    h.clock.set(Utc.with_ymd_and_hms(2026, 3, 3, 6, 0, 0).unwrap());
    let stats = h.engine.daily_stats().unwrap();
    assert_eq!(stats.entries_today, 0);
    assert_eq!(stats.inside_now, 0);
    assert_eq!(stats.date.to_string(), "2026-03-03");

    // The stale record still blocks a new entry
    let err = h.engine.register_entry(&subject(1), None, AccessMethod::Manual).unwrap_err();
    assert!(matches!(err, AccessError::AlreadyOpen(_)));
}
