//! Infrastructure - configuration, time, storage, metrics, and broker
//!
//! This module contains infrastructure concerns:
//! - `config` - Application configuration (TOML loading, defaults)
//! - `clock` - Injected time source and site-local day boundaries
//! - `store` - Access record repository (trait + in-memory store)
//! - `directory` - Subject identity and site configuration sources
//! - `metrics` - Lock-free metrics collection
//! - `broker` - Embedded MQTT broker (rumqttd)

pub mod broker;
pub mod clock;
pub mod config;
pub mod directory;
pub mod metrics;
pub mod store;

// Re-export commonly used types
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{Config, OccupancyScope};
pub use directory::{Roster, SiteSource, StaticSite, SubjectDirectory};
pub use metrics::Metrics;
pub use store::{AccessStore, MemoryAccessStore};
