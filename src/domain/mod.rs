//! Domain models - core queue and location types
//!
//! This module contains the canonical data types used throughout the client:
//! - `PositionSample` - one reading from the device sensor
//! - `QueueSession` - client mirror of the server-owned session
//! - `SpatialMarker` - landmark along a queue
//! - `ClubStatus` - venue phase and event schedule
//! - `geo` - haversine distance and the venue geofence

pub mod geo;
pub mod types;

// Re-export commonly used types at module level
pub use geo::{haversine_distance, Geofence};
pub use types::{
    AccuracyTier, ClubStatus, Coordinate, PermissionStatus, PositionSample, QueueOutcome,
    QueueResult, QueueSession, QueueType, SpatialMarker,
};
