//! Services - business logic and state management
//!
//! This module contains the core business logic services:
//! - `geofence` - Haversine containment tests
//! - `access_tracker` - Per-subject entry/exit state machine and locks
//! - `occupancy` - Occupancy counting and capacity classification
//! - `auto_detect` - Ping-driven entry/exit decision table
//! - `engine` - Operation contract tying the above together
//! - `ping_worker` - Async worker applying queued pings

pub mod access_tracker;
pub mod auto_detect;
pub mod engine;
pub mod geofence;
pub mod occupancy;
pub mod ping_worker;

// Re-export commonly used types
pub use access_tracker::{AccessStateTracker, ClosedRecord};
pub use auto_detect::{AutoDetector, PingOutcome};
pub use engine::{AccessEngine, BulkEntryReport, DailyStats, EntryReceipt, ExitReceipt, InsideEntry};
pub use occupancy::OccupancyCounter;
pub use ping_worker::{create_ping_worker, PingWorker, QueuedPing};
