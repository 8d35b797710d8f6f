//! Landmark catalog and per-queue display sets
//!
//! Each visible marker belongs to at most one queue type, decided by its name.
//! Markers that match no rule exist only so scraped queue reports can be
//! parsed, and are never offered for check-in.

use crate::domain::types::{QueueType, SpatialMarker};
use crate::error::ApiError;
use crate::io::estimation_client::EstimationClient;
use std::sync::Arc;
use tracing::debug;

const MAIN_QUEUE_LANDMARKS: [&str; 11] = [
    "metro sign",
    "wriezener karree",
    "wriezener straße",
    "around the block",
    "bridge",
    "späti",
    "past kiosk",
    "kiosk",
    "magic cube",
    "concrete blocks",
    "snake",
];

const REENTRY_LANDMARKS: [&str; 2] = ["door", "entrance"];

const GUEST_LIST_SUFFIX: &str = "(gl)";

/// Queue whose display set contains `marker`, if any
pub fn queue_type_for(marker: &SpatialMarker) -> Option<QueueType> {
    if !marker.visible {
        return None;
    }
    let name = marker.name.trim().to_lowercase();
    if MAIN_QUEUE_LANDMARKS.contains(&name.as_str()) {
        Some(QueueType::Main)
    } else if name.ends_with(GUEST_LIST_SUFFIX) {
        Some(QueueType::GuestList)
    } else if REENTRY_LANDMARKS.contains(&name.as_str()) {
        Some(QueueType::Reentry)
    } else {
        None
    }
}

/// Markers shown for `queue_type`, ordered by `display_order`
pub fn display_set(markers: &[SpatialMarker], queue_type: QueueType) -> Vec<SpatialMarker> {
    let mut set: Vec<SpatialMarker> =
        markers.iter().filter(|m| queue_type_for(m) == Some(queue_type)).cloned().collect();
    set.sort_by(|a, b| a.display_order.cmp(&b.display_order).then_with(|| a.name.cmp(&b.name)));
    set
}

/// Fetches a venue's markers from the estimation service
pub struct MarkerCatalog {
    client: Arc<dyn EstimationClient>,
    club: String,
}

impl MarkerCatalog {
    pub fn new(client: Arc<dyn EstimationClient>, club: &str) -> Self {
        Self { client, club: club.to_string() }
    }

    /// Every marker of the venue, parse-only ones included
    pub async fn all(&self) -> Result<Vec<SpatialMarker>, ApiError> {
        self.client.markers(&self.club).await
    }

    pub async fn for_queue(&self, queue_type: QueueType) -> Result<Vec<SpatialMarker>, ApiError> {
        let markers = self.all().await?;
        let set = display_set(&markers, queue_type);
        debug!(
            club = %self.club,
            queue_type = %queue_type,
            total = %markers.len(),
            shown = %set.len(),
            "markers_filtered"
        );
        Ok(set)
    }

    /// Resolve a marker by case-insensitive name within a queue's display set
    pub async fn find(&self, queue_type: QueueType, name: &str) -> Result<Option<SpatialMarker>, ApiError> {
        let wanted = name.trim().to_lowercase();
        Ok(self.for_queue(queue_type).await?.into_iter().find(|m| m.name.to_lowercase() == wanted))
    }
}
