//! Services - business logic and state management
//!
//! This module contains the core client services:
//! - `location_acquirer` - Bounded-time GPS acquisition and geofence validation
//! - `session_manager` - Owner of the local queue session mirror
//! - `position_reporter` - Periodic background position reports
//! - `join_flow` - Locate-then-join state transition
//! - `markers` - Landmark catalog and per-queue display sets

pub mod join_flow;
pub mod location_acquirer;
pub mod markers;
pub mod position_reporter;
pub mod session_manager;

// Re-export commonly used types
pub use join_flow::{JoinFlow, JoinStep};
pub use location_acquirer::{AcquisitionState, AcquisitionStatus, Fix, LocationAcquirer};
pub use markers::MarkerCatalog;
pub use position_reporter::PositionReporter;
pub use session_manager::SessionManager;
