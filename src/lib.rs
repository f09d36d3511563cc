//! Access gateway library
//!
//! Geofence-based automatic access registration and occupancy control.
//! Exposes modules for integration testing and binary reuse.

pub mod domain;
pub mod infra;
pub mod io;
pub mod services;
