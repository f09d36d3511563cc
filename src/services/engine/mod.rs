//! Access engine - the operation contract exposed to callers
//!
//! The engine coordinates:
//! - Subject existence checks (external identity directory)
//! - Entry/exit transitions under per-subject locks (`AccessStateTracker`)
//! - Capacity gating and occupancy snapshots (`OccupancyCounter`)
//! - Automatic detection from location pings (`AutoDetector`)
//! - Alert and audit hand-off to external collaborators
//!
//! Geofences and the capacity policy are read from the site source once per
//! operation and never cached beyond it.


use crate::domain::error::AccessError;
use crate::domain::events::{AlertEvent, AlertSink, AuditEvent, AuditSink};
use crate::domain::types::{
    AccessMethod, AccessRecord, CapacityPolicy, Coordinate, OccupancySnapshot, PingAction,
    RecordId, SubjectId,
};
use crate::infra::clock::{local_date, Clock};
use crate::infra::config::{Config, OccupancyScope};
use crate::infra::directory::{Roster, SiteSource, StaticSite, SubjectDirectory};
use crate::infra::metrics::Metrics;
use crate::infra::store::AccessStore;
use crate::services::access_tracker::AccessStateTracker;
use crate::services::auto_detect::{AutoDetector, PingOutcome};
use crate::services::occupancy::{self, OccupancyCounter};
use chrono::{DateTime, Duration, FixedOffset, NaiveDate, Utc};
use parking_lot::Mutex;
use rustc_hash::FxHashSet;
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Result of a successful entry registration
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EntryReceipt {
    pub record_id: RecordId,
    pub subject: SubjectId,
    pub entry_time: DateTime<Utc>,
    pub method: AccessMethod,
    pub occupancy: OccupancySnapshot,
}

/// Result of a successful exit registration
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExitReceipt {
    pub record_id: RecordId,
    pub subject: SubjectId,
    pub entry_time: DateTime<Utc>,
    pub exit_time: DateTime<Utc>,
    pub duration_secs: i64,
    pub occupancy: OccupancySnapshot,
}

/// One refused item of a bulk registration
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BulkEntryError {
    pub subject: SubjectId,
    pub code: &'static str,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BulkEntryReport {
    pub registered_count: usize,
    pub registered: Vec<SubjectId>,
    pub errors: Vec<BulkEntryError>,
}

/// A subject currently inside
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InsideEntry {
    pub subject: SubjectId,
    pub record_id: RecordId,
    pub entry_time: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub coordinate: Option<Coordinate>,
    pub method: AccessMethod,
    pub minutes_inside: i64,
}

impl InsideEntry {
    fn from_record(record: &AccessRecord, now: DateTime<Utc>) -> Self {
        Self {
            subject: record.subject.clone(),
            record_id: record.id,
            entry_time: record.entry_time,
            coordinate: record.entry_coordinate,
            method: record.entry_method,
            minutes_inside: (now - record.entry_time).num_minutes().max(0),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DailyStats {
    pub date: NaiveDate,
    pub entries_today: usize,
    pub inside_now: usize,
    pub occupancy: OccupancySnapshot,
}

pub struct AccessEngine {
    tracker: Arc<AccessStateTracker>,
    occupancy: Arc<OccupancyCounter>,
    detector: AutoDetector,
    site: Arc<dyn SiteSource>,
    subjects: Arc<dyn SubjectDirectory>,
    offset: FixedOffset,
    metrics: Arc<Metrics>,
    alerts: Option<Arc<dyn AlertSink>>,
    audit: Option<Arc<dyn AuditSink>>,
    /// Open records that already produced an overstay alert
    overstay_alerted: Mutex<FxHashSet<RecordId>>,
}

impl AccessEngine {
    pub fn new(
        store: Arc<dyn AccessStore>,
        clock: Arc<dyn Clock>,
        site: Arc<dyn SiteSource>,
        subjects: Arc<dyn SubjectDirectory>,
        scope: OccupancyScope,
        offset: FixedOffset,
        metrics: Arc<Metrics>,
    ) -> Self {
        let tracker = Arc::new(AccessStateTracker::new(store.clone(), clock));
        let occupancy = Arc::new(OccupancyCounter::new(store, scope, offset));
        let detector = AutoDetector::new(tracker.clone(), occupancy.clone());
        Self {
            tracker,
            occupancy,
            detector,
            site,
            subjects,
            offset,
            metrics,
            alerts: None,
            audit: None,
            overstay_alerted: Mutex::new(FxHashSet::default()),
        }
    }

    /// Build an engine whose site and roster come from the loaded config
    pub fn from_config(
        config: &Config,
        store: Arc<dyn AccessStore>,
        clock: Arc<dyn Clock>,
        metrics: Arc<Metrics>,
    ) -> Result<Self, AccessError> {
        let site = StaticSite::new(config.geofences().to_vec(), config.capacity_policy().clone())?;
        let roster = Roster::new(config.roster().iter().cloned());
        Ok(Self::new(
            store,
            clock,
            Arc::new(site),
            Arc::new(roster),
            config.occupancy_scope(),
            config.site_offset(),
            metrics,
        ))
    }

    pub fn with_alert_sink(mut self, sink: Arc<dyn AlertSink>) -> Self {
        self.alerts = Some(sink);
        self
    }

    pub fn with_audit_sink(mut self, sink: Arc<dyn AuditSink>) -> Self {
        self.audit = Some(sink);
        self
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    fn now(&self) -> DateTime<Utc> {
        self.tracker.clock().now()
    }

    fn ensure_known(&self, subject: &SubjectId) -> Result<(), AccessError> {
        if self.subjects.exists(subject) {
            Ok(())
        } else {
            Err(AccessError::SubjectNotFound(subject.clone()))
        }
    }

    /// Count and log a failed operation, then hand the error back
    fn reject(&self, operation: &'static str, subject: &SubjectId, error: AccessError) -> AccessError {
        self.metrics.record_rejection(&error);
        match error {
            AccessError::Store(ref e) => {
                warn!(operation, subject = %subject, error = %e, "store_failure");
            }
            _ => {
                info!(operation, subject = %subject, code = %error.code(), "operation_rejected");
            }
        }
        error
    }

    fn dispatch_alert(&self, alert: AlertEvent) {
        info!(
            kind = %alert.kind.as_str(),
            level = %alert.occupancy.level.as_str(),
            count = %alert.occupancy.count,
            "occupancy_alert"
        );
        if let Some(ref sink) = self.alerts {
            sink.dispatch(alert);
        }
    }

    fn audit(&self, event: Option<AuditEvent>) {
        if let (Some(sink), Some(event)) = (self.audit.as_ref(), event) {
            sink.record(&event);
        }
    }

    fn capacity_rejected(&self, subject: &SubjectId, count: usize, policy: &CapacityPolicy) {
        let snapshot = occupancy::snapshot(count, policy);
        self.dispatch_alert(AlertEvent::entry_rejected(subject, &snapshot, self.now()));
    }

    /// Manually register an entry
    ///
    /// Fails with `AlreadyOpen` if the subject is inside, `CapacityExceeded`
    /// if the facility is full.
    pub fn register_entry(
        &self,
        subject: &SubjectId,
        coordinate: Option<Coordinate>,
        method: AccessMethod,
    ) -> Result<EntryReceipt, AccessError> {
        self.try_register_entry(subject, coordinate, method)
            .map_err(|e| self.reject("register_entry", subject, e))
    }

    fn try_register_entry(
        &self,
        subject: &SubjectId,
        coordinate: Option<Coordinate>,
        method: AccessMethod,
    ) -> Result<EntryReceipt, AccessError> {
        if let Some(c) = coordinate {
            c.validate()?;
        }
        self.ensure_known(subject)?;
        let policy = self.site.capacity_policy();

        let (record, before) = self.tracker.with_subject(subject, |txn| -> Result<_, AccessError> {
            if txn.has_open_record()? {
                return Err(AccessError::AlreadyOpen(subject.clone()));
            }
            match self.occupancy.admit(self.now(), &policy, || txn.open_entry(coordinate, method)) {
                Ok((before, record)) => Ok((record, before)),
                Err(AccessError::CapacityExceeded { count, max }) => {
                    self.capacity_rejected(subject, count, &policy);
                    Err(AccessError::CapacityExceeded { count, max })
                }
                Err(e) => Err(e),
            }
        })?;

        let after = self.occupancy.snapshot(self.now(), &policy)?;
        self.entry_applied(&record, &before, &after);

        info!(
            subject = %subject,
            record_id = %record.id,
            method = %method.as_str(),
            count = %after.count,
            level = %after.level.as_str(),
            "entry_registered"
        );

        Ok(EntryReceipt {
            record_id: record.id,
            subject: subject.clone(),
            entry_time: record.entry_time,
            method,
            occupancy: after,
        })
    }

    /// Bookkeeping shared by manual and automatic entries
    fn entry_applied(&self, record: &AccessRecord, before: &OccupancySnapshot, after: &OccupancySnapshot) {
        self.metrics.record_entry(record.entry_method);
        self.metrics.set_occupancy(after.count, after.level);
        self.audit(Some(AuditEvent::entry(record, after.count)));
        if let Some(alert) = AlertEvent::crossing(before, after, record.entry_time) {
            self.dispatch_alert(alert);
        }
    }

    fn exit_applied(&self, record: &AccessRecord, after: &OccupancySnapshot) {
        self.metrics.record_exit();
        self.metrics.set_occupancy(after.count, after.level);
        self.audit(AuditEvent::exit(record, after.count));
    }

    /// Manually register an exit; fails with `NoOpenRecord` if not inside
    pub fn register_exit(
        &self,
        subject: &SubjectId,
        coordinate: Option<Coordinate>,
        method: AccessMethod,
    ) -> Result<ExitReceipt, AccessError> {
        self.try_register_exit(subject, coordinate, method)
            .map_err(|e| self.reject("register_exit", subject, e))
    }

    fn try_register_exit(
        &self,
        subject: &SubjectId,
        coordinate: Option<Coordinate>,
        method: AccessMethod,
    ) -> Result<ExitReceipt, AccessError> {
        self.ensure_known(subject)?;
        let closed = self.tracker.close_exit(subject, coordinate, method)?;
        let policy = self.site.capacity_policy();
        let after = self.occupancy.snapshot(self.now(), &policy)?;
        self.exit_applied(&closed.record, &after);
        self.overstay_alerted.lock().remove(&closed.record.id);

        let exit_time = closed.record.exit_time().unwrap_or(closed.record.entry_time);
        info!(
            subject = %subject,
            record_id = %closed.record.id,
            duration_secs = %closed.duration.num_seconds(),
            count = %after.count,
            "exit_registered"
        );

        Ok(ExitReceipt {
            record_id: closed.record.id,
            subject: subject.clone(),
            entry_time: closed.record.entry_time,
            exit_time,
            duration_secs: closed.duration.num_seconds(),
            occupancy: after,
        })
    }

    /// Apply a location ping through automatic detection
    pub fn auto_ping(
        &self,
        subject: &SubjectId,
        coordinate: Coordinate,
    ) -> Result<PingOutcome, AccessError> {
        let started = Instant::now();
        let result = self.try_auto_ping(subject, coordinate);
        self.metrics.record_ping_processed(started.elapsed().as_micros() as u64);
        result.map_err(|e| self.reject("auto_ping", subject, e))
    }

    fn try_auto_ping(
        &self,
        subject: &SubjectId,
        coordinate: Coordinate,
    ) -> Result<PingOutcome, AccessError> {
        self.ensure_known(subject)?;
        let geofences = self.site.geofences();
        let policy = self.site.capacity_policy();

        let detection = self.detector.process_ping(subject, coordinate, &geofences, &policy)?;
        let outcome = detection.outcome;

        match (outcome.action, outcome.record.as_ref()) {
            (PingAction::Entry, Some(record)) => {
                let before = detection.admitted_from.unwrap_or_else(|| outcome.occupancy.clone());
                self.entry_applied(record, &before, &outcome.occupancy);
            }
            (PingAction::Exit, Some(record)) => {
                self.exit_applied(record, &outcome.occupancy);
                self.overstay_alerted.lock().remove(&record.id);
            }
            _ => self.metrics.set_occupancy(outcome.occupancy.count, outcome.occupancy.level),
        }

        if let Some(ref error) = detection.rejected {
            self.metrics.record_rejection(error);
            if let AccessError::CapacityExceeded { count, .. } = *error {
                self.capacity_rejected(subject, count, &policy);
            }
        }

        debug!(
            subject = %subject,
            state = ?outcome.state,
            action = %outcome.action.as_str(),
            count = %outcome.occupancy.count,
            "ping_processed"
        );
        if outcome.action != PingAction::None {
            info!(
                subject = %subject,
                action = %outcome.action.as_str(),
                count = %outcome.occupancy.count,
                "auto_transition"
            );
        }
        Ok(outcome)
    }

    /// Register entries for a batch; each subject succeeds or fails alone
    pub fn bulk_register_entry(&self, subjects: &[SubjectId], method: AccessMethod) -> BulkEntryReport {
        let mut report = BulkEntryReport::default();
        for subject in subjects {
            match self.register_entry(subject, None, method) {
                Ok(_) => {
                    report.registered_count += 1;
                    report.registered.push(subject.clone());
                }
                Err(e) => report.errors.push(BulkEntryError {
                    subject: subject.clone(),
                    code: e.code(),
                    message: e.to_string(),
                }),
            }
        }
        info!(
            requested = %subjects.len(),
            registered = %report.registered_count,
            errors = %report.errors.len(),
            "bulk_entry_processed"
        );
        report
    }

    pub fn current_occupancy(&self) -> Result<OccupancySnapshot, AccessError> {
        let policy = self.site.capacity_policy();
        let snapshot = self.occupancy.snapshot(self.now(), &policy)?;
        self.metrics.set_occupancy(snapshot.count, snapshot.level);
        Ok(snapshot)
    }

    /// Subjects with an open record in scope, earliest entry first
    pub fn subjects_inside(&self) -> Result<Vec<InsideEntry>, AccessError> {
        let now = self.now();
        let records = self.occupancy.open_records(now)?;
        Ok(records.iter().map(|r| InsideEntry::from_record(r, now)).collect())
    }

    pub fn daily_stats(&self) -> Result<DailyStats, AccessError> {
        let now = self.now();
        let occupancy = self.current_occupancy()?;
        Ok(DailyStats {
            date: local_date(now, self.offset),
            entries_today: self.occupancy.entries_today(now)?,
            inside_now: occupancy.count,
            occupancy,
        })
    }

    /// Open records older than `limit`, regardless of entry day
    pub fn overstays(&self, limit: Duration) -> Result<Vec<InsideEntry>, AccessError> {
        let now = self.now();
        let records = self.tracker.store().open_records(None)?;
        Ok(records
            .iter()
            .filter(|r| now - r.entry_time > limit)
            .map(|r| InsideEntry::from_record(r, now))
            .collect())
    }

    /// Dispatch one overstay alert per record that crossed `limit`
    ///
    /// Returns the number of alerts raised by this pass.
    pub fn check_overstays(&self, limit: Duration) -> Result<usize, AccessError> {
        let now = self.now();
        let open = self.tracker.store().open_records(None)?;
        let policy = self.site.capacity_policy();
        let occupancy = self.occupancy.snapshot(now, &policy)?;

        let mut alerted = self.overstay_alerted.lock();
        alerted.retain(|id| open.iter().any(|r| r.id == *id));

        let mut raised = Vec::new();
        for record in open.iter().filter(|r| now - r.entry_time > limit) {
            if alerted.insert(record.id) {
                raised.push(AlertEvent::overstay(record, &occupancy, now));
            }
        }
        drop(alerted);

        let count = raised.len();
        for alert in raised {
            self.dispatch_alert(alert);
        }
        Ok(count)
    }
}
