//! Great-circle math and venue geofence

use crate::domain::types::Coordinate;
use serde::{Deserialize, Serialize};

/// Mean Earth radius used for haversine distances (meters)
pub const EARTH_RADIUS_METERS: f64 = 6_371_000.0;

/// Great-circle distance between two coordinates using the haversine formula
pub fn haversine_distance(a: Coordinate, b: Coordinate) -> f64 {
    let lat1 = a.latitude.to_radians();
    let lat2 = b.latitude.to_radians();
    let d_lat = (b.latitude - a.latitude).to_radians();
    let d_lon = (b.longitude - a.longitude).to_radians();

    let h = (d_lat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (d_lon / 2.0).sin().powi(2);
    // Clamp guards against h drifting past 1.0 for antipodal points
    let c = 2.0 * h.sqrt().min(1.0).asin();
    EARTH_RADIUS_METERS * c
}

/// Circular inclusion region around the venue entrance
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Geofence {
    pub anchor: Coordinate,
    pub max_distance_meters: f64,
    /// When false the distance is still measured and reported but never rejects a fix
    pub enforce: bool,
}

impl Geofence {
    pub fn new(anchor: Coordinate, max_distance_meters: f64) -> Self {
        Self { anchor, max_distance_meters, enforce: true }
    }

    pub fn advisory(anchor: Coordinate, max_distance_meters: f64) -> Self {
        Self { anchor, max_distance_meters, enforce: false }
    }

    pub fn distance_to(&self, point: Coordinate) -> f64 {
        haversine_distance(self.anchor, point)
    }

    /// Ok(distance) when the point is acceptable, Err(distance) when it lies outside an enforced fence
    pub fn check(&self, point: Coordinate) -> Result<f64, f64> {
        let distance = self.distance_to(point);
        if self.enforce && distance > self.max_distance_meters {
            Err(distance)
        } else {
            Ok(distance)
        }
    }
}

/// Move `meters` due north of `from` (test and simulation helper)
pub fn offset_north(from: Coordinate, meters: f64) -> Coordinate {
    let d_lat = (meters / EARTH_RADIUS_METERS).to_degrees();
    Coordinate::new(from.latitude + d_lat, from.longitude)
}
