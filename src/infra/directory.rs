//! External configuration and identity sources
//!
//! The engine reads geofences and the capacity policy as immutable snapshots
//! per operation through [`SiteSource`], and checks subject existence through
//! [`SubjectDirectory`]. Both are owned by systems outside the core.

use crate::domain::error::AccessError;
use crate::domain::types::{CapacityPolicy, Geofence, SubjectId};
use parking_lot::RwLock;
use rustc_hash::FxHashSet;
use std::sync::Arc;
use tracing::info;

pub trait SubjectDirectory: Send + Sync {
    fn exists(&self, subject: &SubjectId) -> bool;
}

/// Fixed list of known subjects. An empty roster accepts every subject.
#[derive(Debug, Default)]
pub struct Roster {
    known: RwLock<FxHashSet<SubjectId>>,
}

impl Roster {
    pub fn new<I, S>(subjects: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let known = subjects.into_iter().map(|s| SubjectId(s.into())).collect();
        Self { known: RwLock::new(known) }
    }

    /// Accepts any subject id
    pub fn open() -> Self {
        Self::default()
    }

    pub fn add(&self, subject: SubjectId) {
        self.known.write().insert(subject);
    }

    pub fn len(&self) -> usize {
        self.known.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl SubjectDirectory for Roster {
    fn exists(&self, subject: &SubjectId) -> bool {
        let known = self.known.read();
        known.is_empty() || known.contains(subject)
    }
}

/// Snapshot source for site configuration
pub trait SiteSource: Send + Sync {
    /// Geofences in definition order (active and inactive)
    fn geofences(&self) -> Arc<[Geofence]>;

    fn capacity_policy(&self) -> CapacityPolicy;
}

/// Site configuration held in memory, replaceable by a configuration action
///
/// Readers get a cheap `Arc` snapshot; an update swaps the whole set and
/// never affects an operation already holding the previous snapshot.
pub struct StaticSite {
    geofences: RwLock<Arc<[Geofence]>>,
    policy: RwLock<CapacityPolicy>,
}

impl StaticSite {
    pub fn new(geofences: Vec<Geofence>, policy: CapacityPolicy) -> Result<Self, AccessError> {
        validate_geofences(&geofences)?;
        policy.validate()?;
        Ok(Self { geofences: RwLock::new(geofences.into()), policy: RwLock::new(policy) })
    }

    pub fn replace_geofences(&self, geofences: Vec<Geofence>) -> Result<(), AccessError> {
        validate_geofences(&geofences)?;
        info!(count = %geofences.len(), "geofences_replaced");
        *self.geofences.write() = geofences.into();
        Ok(())
    }

    pub fn replace_policy(&self, policy: CapacityPolicy) -> Result<(), AccessError> {
        policy.validate()?;
        info!(
            max = %policy.max_occupancy,
            warn = %policy.warn_threshold,
            active = %policy.active,
            "capacity_policy_replaced"
        );
        *self.policy.write() = policy;
        Ok(())
    }
}

fn validate_geofences(geofences: &[Geofence]) -> Result<(), AccessError> {
    geofences.iter().try_for_each(Geofence::validate)
}

impl SiteSource for StaticSite {
    fn geofences(&self) -> Arc<[Geofence]> {
        self.geofences.read().clone()
    }

    fn capacity_policy(&self) -> CapacityPolicy {
        self.policy.read().clone()
    }
}
