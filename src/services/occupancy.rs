//! Occupancy counting and capacity classification
//!
//! Counts are advisory: they read the store without any lock, so a count may
//! be stale by the duration of an in-flight operation. Only the entry gate
//! ([`OccupancyCounter::admit`]) is serialized.

use crate::domain::error::AccessError;
use crate::domain::types::{AccessRecord, CapacityPolicy, OccupancyLevel, OccupancySnapshot};
use crate::infra::clock::start_of_day;
use crate::infra::config::OccupancyScope;
use crate::infra::store::AccessStore;
use chrono::{DateTime, FixedOffset, Utc};
use parking_lot::Mutex;
use std::sync::Arc;

/// Classify a count against the policy thresholds
///
/// `count >= max` is CRITICAL, `warn <= count < max` is WARNING, anything
/// lower is NORMAL. The active flag is not consulted here.
pub fn classify(count: usize, policy: &CapacityPolicy) -> OccupancyLevel {
    let count = count as u64;
    if count >= u64::from(policy.max_occupancy) {
        OccupancyLevel::Critical
    } else if count >= u64::from(policy.warn_threshold) {
        OccupancyLevel::Warning
    } else {
        OccupancyLevel::Normal
    }
}

/// Build a snapshot for `count` under `policy`
///
/// An inactive policy always reports NORMAL.
pub fn snapshot(count: usize, policy: &CapacityPolicy) -> OccupancySnapshot {
    let level = if policy.active { classify(count, policy) } else { OccupancyLevel::Normal };
    let max = policy.max_occupancy as usize;
    let percent = if max == 0 { 0.0 } else { round2(count as f64 / max as f64 * 100.0) };
    OccupancySnapshot {
        count,
        max_occupancy: policy.max_occupancy,
        warn_threshold: policy.warn_threshold,
        level,
        percent,
        available: max.saturating_sub(count),
        message: (level != OccupancyLevel::Normal).then(|| policy.alert_message.clone()),
    }
}

#[inline]
fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

pub struct OccupancyCounter {
    store: Arc<dyn AccessStore>,
    scope: OccupancyScope,
    offset: FixedOffset,
    /// Held from the capacity check until the new record is stored
    admission: Mutex<()>,
}

impl OccupancyCounter {
    pub fn new(store: Arc<dyn AccessStore>, scope: OccupancyScope, offset: FixedOffset) -> Self {
        Self { store, scope, offset, admission: Mutex::new(()) }
    }

    pub fn scope(&self) -> OccupancyScope {
        self.scope
    }

    /// Earliest entry time that counts for `reference`, `None` for all time
    fn since(&self, reference: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self.scope {
            OccupancyScope::Today => Some(start_of_day(reference, self.offset)),
            OccupancyScope::AllTime => None,
        }
    }

    /// Open records in scope for `reference`
    pub fn current_count(&self, reference: DateTime<Utc>) -> Result<usize, AccessError> {
        Ok(self.store.count_open(self.since(reference))?)
    }

    /// Open records in scope, ordered by entry time
    pub fn open_records(&self, reference: DateTime<Utc>) -> Result<Vec<AccessRecord>, AccessError> {
        Ok(self.store.open_records(self.since(reference))?)
    }

    /// Records entered on the calendar day of `reference`, open or closed
    pub fn entries_today(&self, reference: DateTime<Utc>) -> Result<usize, AccessError> {
        Ok(self.store.count_entries(start_of_day(reference, self.offset))?)
    }

    pub fn snapshot(
        &self,
        reference: DateTime<Utc>,
        policy: &CapacityPolicy,
    ) -> Result<OccupancySnapshot, AccessError> {
        Ok(snapshot(self.current_count(reference)?, policy))
    }

    /// Capacity gate for one more entry
    ///
    /// Rejects when the policy is active and the facility is already at or
    /// above max. Otherwise runs `enter` and returns the pre-entry snapshot
    /// with its result. Admissions are serialized site-wide, so concurrent
    /// entries of different subjects cannot push the count past max.
    /// Readers of the count do not take this lock.
    pub fn admit<T>(
        &self,
        reference: DateTime<Utc>,
        policy: &CapacityPolicy,
        enter: impl FnOnce() -> Result<T, AccessError>,
    ) -> Result<(OccupancySnapshot, T), AccessError> {
        let _admission = self.admission.lock();
        let before = self.snapshot(reference, policy)?;
        if policy.active && before.count >= policy.max_occupancy as usize {
            return Err(AccessError::CapacityExceeded {
                count: before.count,
                max: policy.max_occupancy,
            });
        }
        let entered = enter()?;
        Ok((before, entered))
    }
}
