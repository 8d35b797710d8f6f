//! IO modules - external system interfaces
//!
//! This module contains the seams to the outside world:
//! - `location_provider` - Device sensor interface and the cancelable position watch
//! - `scripted_provider` - Provider replaying timed samples (simulation, tests)
//! - `estimation_client` - Remote queue service interface and its REST binding
//! - `memory` - In-process backend with the service's session rules

pub mod estimation_client;
pub mod location_provider;
pub mod memory;
pub mod scripted_provider;

// Re-export commonly used types
pub use estimation_client::{
    CheckpointAck, EstimationClient, HttpEstimationClient, Operation, PositionReport,
};
pub use location_provider::{sample_once, DeviceLocationProvider, PositionWatch, WatchConfig};
pub use memory::InMemoryEstimationClient;
pub use scripted_provider::{ScriptedLocationProvider, ScriptedSample};
