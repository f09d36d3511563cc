//! Access record repository
//!
//! The engine depends on storage only through [`AccessStore`] capabilities
//! ("the open record for subject X", "count open records since T"). Any
//! transactional store can implement it; [`MemoryAccessStore`] is the
//! in-process implementation used by the daemon and the tests.
//!
//! Implementations must reject a second open record for a subject
//! (`StoreError::OpenConflict`), the equivalent of a unique index on
//! `(subject) WHERE exit IS NULL`. The tracker's per-subject lock is the
//! primary guard; the constraint is the backstop.

use crate::domain::error::StoreError;
use crate::domain::types::{AccessRecord, ExitStamp, RecordId, SubjectId};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use rustc_hash::FxHashMap;

pub trait AccessStore: Send + Sync {
    /// Insert a new open record
    fn insert(&self, record: AccessRecord) -> Result<(), StoreError>;

    /// The open record for `subject`, if any
    fn open_record(&self, subject: &SubjectId) -> Result<Option<AccessRecord>, StoreError>;

    /// Set the exit half of an open record and return the closed record
    fn close(&self, id: RecordId, exit: ExitStamp) -> Result<AccessRecord, StoreError>;

    fn get(&self, id: RecordId) -> Result<Option<AccessRecord>, StoreError>;

    /// Open records, optionally only those entered at or after `since`,
    /// ordered by entry time
    fn open_records(&self, since: Option<DateTime<Utc>>) -> Result<Vec<AccessRecord>, StoreError>;

    fn count_open(&self, since: Option<DateTime<Utc>>) -> Result<usize, StoreError>;

    /// Records (open or closed) entered at or after `since`
    fn count_entries(&self, since: DateTime<Utc>) -> Result<usize, StoreError>;
}

#[derive(Default)]
struct Inner {
    /// Append-only; records are never removed
    records: Vec<AccessRecord>,
    by_id: FxHashMap<RecordId, usize>,
    open_by_subject: FxHashMap<SubjectId, usize>,
}

/// In-memory access record table
#[derive(Default)]
pub struct MemoryAccessStore {
    inner: RwLock<Inner>,
}

impl MemoryAccessStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total records ever written (the audit trail length)
    pub fn len(&self) -> usize {
        self.inner.read().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All records for a subject in insertion order
    pub fn history(&self, subject: &SubjectId) -> Vec<AccessRecord> {
        self.inner.read().records.iter().filter(|r| &r.subject == subject).cloned().collect()
    }
}

#[inline]
fn entered_since(record: &AccessRecord, since: Option<DateTime<Utc>>) -> bool {
    since.map_or(true, |t| record.entry_time >= t)
}

impl AccessStore for MemoryAccessStore {
    fn insert(&self, record: AccessRecord) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        if record.is_open() && inner.open_by_subject.contains_key(&record.subject) {
            return Err(StoreError::OpenConflict(record.subject));
        }
        let idx = inner.records.len();
        inner.by_id.insert(record.id, idx);
        if record.is_open() {
            inner.open_by_subject.insert(record.subject.clone(), idx);
        }
        inner.records.push(record);
        Ok(())
    }

    fn open_record(&self, subject: &SubjectId) -> Result<Option<AccessRecord>, StoreError> {
        let inner = self.inner.read();
        Ok(inner.open_by_subject.get(subject).map(|&idx| inner.records[idx].clone()))
    }

    fn close(&self, id: RecordId, exit: ExitStamp) -> Result<AccessRecord, StoreError> {
        let mut inner = self.inner.write();
        let idx = *inner.by_id.get(&id).ok_or_else(|| StoreError::RecordNotFound(id.to_string()))?;
        let record = &mut inner.records[idx];
        if !record.is_open() {
            return Err(StoreError::AlreadyClosed(id.to_string()));
        }
        record.exit = Some(exit);
        let closed = record.clone();
        inner.open_by_subject.remove(&closed.subject);
        Ok(closed)
    }

    fn get(&self, id: RecordId) -> Result<Option<AccessRecord>, StoreError> {
        let inner = self.inner.read();
        Ok(inner.by_id.get(&id).map(|&idx| inner.records[idx].clone()))
    }

    fn open_records(&self, since: Option<DateTime<Utc>>) -> Result<Vec<AccessRecord>, StoreError> {
        let inner = self.inner.read();
        let mut open: Vec<AccessRecord> = inner
            .open_by_subject
            .values()
            .map(|&idx| &inner.records[idx])
            .filter(|r| entered_since(r, since))
            .cloned()
            .collect();
        open.sort_by_key(|r| r.entry_time);
        Ok(open)
    }

    fn count_open(&self, since: Option<DateTime<Utc>>) -> Result<usize, StoreError> {
        let inner = self.inner.read();
        Ok(inner
            .open_by_subject
            .values()
            .filter(|&&idx| entered_since(&inner.records[idx], since))
            .count())
    }

    fn count_entries(&self, since: DateTime<Utc>) -> Result<usize, StoreError> {
        let inner = self.inner.read();
        Ok(inner.records.iter().filter(|r| r.entry_time >= since).count())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::types::AccessMethod;
    use chrono::{Duration, TimeZone};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, 8, 0, 0).unwrap()
    }

    fn open_record(subject: &str, at: DateTime<Utc>) -> AccessRecord {
        AccessRecord::open(SubjectId::new(subject), at, None, AccessMethod::Manual)
    }

    fn exit_at(at: DateTime<Utc>) -> ExitStamp {
        ExitStamp { time: at, coordinate: None, method: AccessMethod::Manual }
    }

    #[test]
    fn test_insert_and_lookup_open() {
        let store = MemoryAccessStore::new();
        let record = open_record("S-1", t0());
        let id = record.id;
        store.insert(record).unwrap();

        let open = store.open_record(&SubjectId::new("S-1")).unwrap().unwrap();
        assert_eq!(open.id, id);
        assert!(store.open_record(&SubjectId::new("S-2")).unwrap().is_none());
    }

    #[test]
    fn test_second_open_record_conflicts() {
        let store = MemoryAccessStore::new();
        store.insert(open_record("S-1", t0())).unwrap();
        let err = store.insert(open_record("S-1", t0())).unwrap_err();
        assert_eq!(err, StoreError::OpenConflict(SubjectId::new("S-1")));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_close_once() {
        let store = MemoryAccessStore::new();
        let record = open_record("S-1", t0());
        let id = record.id;
        store.insert(record).unwrap();

        let closed = store.close(id, exit_at(t0() + Duration::minutes(5))).unwrap();
        assert!(!closed.is_open());
        assert!(store.open_record(&SubjectId::new("S-1")).unwrap().is_none());
        assert!(matches!(
            store.close(id, exit_at(t0() + Duration::minutes(6))),
            Err(StoreError::AlreadyClosed(_))
        ));
        // Closing frees the subject for a new open record
        store.insert(open_record("S-1", t0() + Duration::minutes(10))).unwrap();
        assert_eq!(store.history(&SubjectId::new("S-1")).len(), 2);
    }

    #[test]
    fn test_close_unknown_record() {
        let store = MemoryAccessStore::new();
        assert!(matches!(
            store.close(RecordId::generate(), exit_at(t0())),
            Err(StoreError::RecordNotFound(_))
        ));
    }

    #[test]
    fn test_counts_respect_since() {
        let store = MemoryAccessStore::new();
        let yesterday = t0() - Duration::days(1);
        store.insert(open_record("old", yesterday)).unwrap();
        store.insert(open_record("a", t0())).unwrap();
        let b = open_record("b", t0() + Duration::hours(1));
        let b_id = b.id;
        store.insert(b).unwrap();
        store.close(b_id, exit_at(t0() + Duration::hours(2))).unwrap();

        assert_eq!(store.count_open(None).unwrap(), 2);
        assert_eq!(store.count_open(Some(t0())).unwrap(), 1);
        assert_eq!(store.count_entries(t0()).unwrap(), 2);

        let open = store.open_records(None).unwrap();
        assert_eq!(open[0].subject, SubjectId::new("old"));
        assert_eq!(open[1].subject, SubjectId::new("a"));
    }
}
