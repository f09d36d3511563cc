//! Per-subject entry/exit state machine
//!
//! Each subject is either CLOSED (no open record) or OPEN (exactly one open
//! record). Every check-then-write runs inside [`AccessStateTracker::with_subject`],
//! which holds a mutex keyed by subject id, so two operations on the same
//! subject never interleave. Operations on different subjects take different
//! locks and run in parallel. The store's one-open-record constraint backs this
//! up: a conflicting insert surfaces as `AlreadyOpen`, never a second record.

use crate::domain::error::{AccessError, StoreError};
use crate::domain::types::{AccessMethod, AccessRecord, Coordinate, ExitStamp, SubjectId};
use crate::infra::clock::Clock;
use crate::infra::store::AccessStore;
use chrono::Duration;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// Registry of per-subject mutexes
///
/// Entries are created on demand and removed once no operation holds or
/// waits on them, so the map only grows with concurrently active subjects.
#[derive(Default)]
struct SubjectLocks {
    map: Mutex<FxHashMap<SubjectId, Arc<Mutex<()>>>>,
}

impl SubjectLocks {
    fn acquire(&self, subject: &SubjectId) -> Arc<Mutex<()>> {
        self.map.lock().entry(subject.clone()).or_default().clone()
    }

    fn release(&self, subject: &SubjectId, lock: Arc<Mutex<()>>) {
        let mut map = self.map.lock();
        drop(lock);
        // Clones only happen under the map lock, so a count of 1 means idle
        if map.get(subject).is_some_and(|l| Arc::strong_count(l) == 1) {
            map.remove(subject);
        }
    }

    fn len(&self) -> usize {
        self.map.lock().len()
    }
}

/// A record that was just closed
#[derive(Debug, Clone, PartialEq)]
pub struct ClosedRecord {
    pub record: AccessRecord,
    /// exit - entry, never negative
    pub duration: Duration,
}

pub struct AccessStateTracker {
    store: Arc<dyn AccessStore>,
    clock: Arc<dyn Clock>,
    locks: SubjectLocks,
}

impl AccessStateTracker {
    pub fn new(store: Arc<dyn AccessStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock, locks: SubjectLocks::default() }
    }

    pub fn store(&self) -> &Arc<dyn AccessStore> {
        &self.store
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Run `f` with exclusive access to `subject`'s open/closed state
    pub fn with_subject<R>(&self, subject: &SubjectId, f: impl FnOnce(&SubjectTxn<'_>) -> R) -> R {
        let lock = self.locks.acquire(subject);
        let result = {
            let _held = lock.lock();
            f(&SubjectTxn { tracker: self, subject })
        };
        self.locks.release(subject, lock);
        result
    }

    /// Open a new record; fails with `AlreadyOpen` if one exists
    pub fn open_entry(
        &self,
        subject: &SubjectId,
        coordinate: Option<Coordinate>,
        method: AccessMethod,
    ) -> Result<AccessRecord, AccessError> {
        self.with_subject(subject, |txn| txn.open_entry(coordinate, method))
    }

    /// Close the open record; fails with `NoOpenRecord` if there is none
    pub fn close_exit(
        &self,
        subject: &SubjectId,
        coordinate: Option<Coordinate>,
        method: AccessMethod,
    ) -> Result<ClosedRecord, AccessError> {
        self.with_subject(subject, |txn| txn.close_exit(coordinate, method))
    }

    /// Read-only lookup, takes no subject lock
    pub fn has_open_record(&self, subject: &SubjectId) -> Result<bool, AccessError> {
        Ok(self.get_open_record(subject)?.is_some())
    }

    /// Read-only lookup, takes no subject lock
    pub fn get_open_record(&self, subject: &SubjectId) -> Result<Option<AccessRecord>, AccessError> {
        Ok(self.store.open_record(subject)?)
    }

    /// Number of subjects with an operation in flight
    pub fn locked_subjects(&self) -> usize {
        self.locks.len()
    }
}

/// Exclusive view of one subject's state, valid inside `with_subject`
pub struct SubjectTxn<'a> {
    tracker: &'a AccessStateTracker,
    subject: &'a SubjectId,
}

impl SubjectTxn<'_> {
    pub fn subject(&self) -> &SubjectId {
        self.subject
    }

    pub fn open_record(&self) -> Result<Option<AccessRecord>, AccessError> {
        Ok(self.tracker.store.open_record(self.subject)?)
    }

    pub fn has_open_record(&self) -> Result<bool, AccessError> {
        Ok(self.open_record()?.is_some())
    }

    pub fn open_entry(
        &self,
        coordinate: Option<Coordinate>,
        method: AccessMethod,
    ) -> Result<AccessRecord, AccessError> {
        if let Some(c) = coordinate {
            c.validate()?;
        }
        if self.has_open_record()? {
            return Err(AccessError::AlreadyOpen(self.subject.clone()));
        }

        let record =
            AccessRecord::open(self.subject.clone(), self.tracker.clock.now(), coordinate, method);
        match self.tracker.store.insert(record.clone()) {
            Ok(()) => {}
            Err(StoreError::OpenConflict(subject)) => {
                // Another writer bypassed the subject lock
                warn!(subject = %subject, "open_conflict_from_store");
                return Err(AccessError::AlreadyOpen(subject));
            }
            Err(e) => return Err(e.into()),
        }

        debug!(
            subject = %self.subject,
            record_id = %record.id,
            method = %method.as_str(),
            "record_opened"
        );
        Ok(record)
    }

    pub fn close_exit(
        &self,
        coordinate: Option<Coordinate>,
        method: AccessMethod,
    ) -> Result<ClosedRecord, AccessError> {
        if let Some(c) = coordinate {
            c.validate()?;
        }
        let open =
            self.open_record()?.ok_or_else(|| AccessError::NoOpenRecord(self.subject.clone()))?;

        let now = self.tracker.clock.now();
        let time = if now < open.entry_time {
            warn!(
                subject = %self.subject,
                entry_time = %open.entry_time,
                now = %now,
                "exit_before_entry_clamped"
            );
            open.entry_time
        } else {
            now
        };

        let record = self.tracker.store.close(open.id, ExitStamp { time, coordinate, method })?;
        let duration = time - record.entry_time;

        debug!(
            subject = %self.subject,
            record_id = %record.id,
            duration_secs = %duration.num_seconds(),
            "record_closed"
        );
        Ok(ClosedRecord { record, duration })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infra::clock::ManualClock;
    use crate::infra::store::MemoryAccessStore;
    use chrono::{TimeZone, Utc};
    use std::thread;

    struct Fixture {
        tracker: Arc<AccessStateTracker>,
        store: Arc<MemoryAccessStore>,
        clock: Arc<ManualClock>,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(MemoryAccessStore::new());
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2026, 3, 2, 8, 0, 0).unwrap()));
        let tracker = Arc::new(AccessStateTracker::new(store.clone(), clock.clone()));
        Fixture { tracker, store, clock }
    }

    fn subject(id: &str) -> SubjectId {
        SubjectId::new(id)
    }

    #[test]
    fn test_open_then_duplicate_fails() {
        let f = fixture();
        let s = subject("S-1");
        let record = f.tracker.open_entry(&s, None, AccessMethod::Manual).unwrap();
        assert!(record.is_open());
        assert_eq!(record.entry_time, f.clock.now());

        let err = f.tracker.open_entry(&s, None, AccessMethod::Automatic).unwrap_err();
        assert_eq!(err, AccessError::AlreadyOpen(s.clone()));
        assert_eq!(f.store.history(&s).len(), 1);
    }

    #[test]
    fn test_close_without_open_fails() {
        let f = fixture();
        let err = f.tracker.close_exit(&subject("S-1"), None, AccessMethod::Manual).unwrap_err();
        assert!(matches!(err, AccessError::NoOpenRecord(_)));
        assert!(f.store.is_empty());
    }

    #[test]
    fn test_close_reports_duration() {
        let f = fixture();
        let s = subject("S-1");
        let exit_at = Coordinate::new(5.73, -72.89).unwrap();
        f.tracker.open_entry(&s, None, AccessMethod::Automatic).unwrap();
        f.clock.advance(Duration::minutes(45));

        let closed = f.tracker.close_exit(&s, Some(exit_at), AccessMethod::Automatic).unwrap();
        assert_eq!(closed.duration, Duration::minutes(45));
        let exit = closed.record.exit.as_ref().unwrap();
        assert_eq!(exit.coordinate, Some(exit_at));
        assert_eq!(exit.method, AccessMethod::Automatic);
        assert!(!f.tracker.has_open_record(&s).unwrap());
    }

    #[test]
    fn test_exit_before_entry_is_clamped() {
        let f = fixture();
        let s = subject("S-1");
        let entry = f.tracker.open_entry(&s, None, AccessMethod::Manual).unwrap();
        f.clock.advance(Duration::seconds(-30));

        let closed = f.tracker.close_exit(&s, None, AccessMethod::Manual).unwrap();
        assert_eq!(closed.record.exit_time(), Some(entry.entry_time));
        assert_eq!(closed.duration, Duration::zero());
    }

    #[test]
    fn test_invalid_coordinate_does_not_mutate() {
        let f = fixture();
        let bad = Coordinate { latitude: 120.0, longitude: 0.0 };
        let err = f.tracker.open_entry(&subject("S-1"), Some(bad), AccessMethod::Manual).unwrap_err();
        assert!(matches!(err, AccessError::InvalidCoordinates { .. }));
        assert!(f.store.is_empty());
    }

    #[test]
    fn test_reopen_after_close_creates_new_record() {
        let f = fixture();
        let s = subject("S-1");
        let first = f.tracker.open_entry(&s, None, AccessMethod::Manual).unwrap();
        f.tracker.close_exit(&s, None, AccessMethod::Manual).unwrap();
        let second = f.tracker.open_entry(&s, None, AccessMethod::Manual).unwrap();
        assert_ne!(first.id, second.id);
        assert_eq!(f.store.history(&s).len(), 2);
    }

    #[test]
    fn test_concurrent_entries_open_exactly_one() {
        let f = fixture();
        let s = subject("racer");

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let tracker = f.tracker.clone();
                let s = s.clone();
                thread::spawn(move || tracker.open_entry(&s, None, AccessMethod::Automatic))
            })
            .collect();

        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        let opened = results.iter().filter(|r| r.is_ok()).count();
        assert_eq!(opened, 1);
        assert!(results
            .iter()
            .filter_map(|r| r.as_ref().err())
            .all(|e| matches!(e, AccessError::AlreadyOpen(_))));
        assert_eq!(f.store.history(&s).len(), 1);
        assert_eq!(f.tracker.locked_subjects(), 0);
    }

    #[test]
    fn test_concurrent_toggles_keep_single_open_record() {
        let f = fixture();
        let s = subject("toggler");

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let tracker = f.tracker.clone();
                let s = s.clone();
                thread::spawn(move || {
                    for _ in 0..200 {
                        let _ = if i % 2 == 0 {
                            tracker.open_entry(&s, None, AccessMethod::Automatic).map(|_| ())
                        } else {
                            tracker.close_exit(&s, None, AccessMethod::Automatic).map(|_| ())
                        };
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let open = f.store.history(&s).iter().filter(|r| r.is_open()).count();
        assert!(open <= 1, "{open} open records");
        assert_eq!(f.tracker.locked_subjects(), 0);
    }

    #[test]
    fn test_with_subject_sees_consistent_state() {
        let f = fixture();
        let s = subject("S-1");
        let outcome = f.tracker.with_subject(&s, |txn| {
            assert!(!txn.has_open_record()?);
            txn.open_entry(None, AccessMethod::DeviceScan)?;
            txn.has_open_record()
        });
        assert!(outcome.unwrap());
    }
}
