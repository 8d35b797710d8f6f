//! In-process estimation backend
//!
//! Mirrors the server's session rules for a single user: one active session,
//! checkpoints answer with the marker's typical wait, result and leave end the
//! session. Every call is counted per operation, and individual operations can
//! be made to fail or to stall so tests can drive error and race paths.

use crate::domain::geo::offset_north;
use crate::domain::types::{
    ClubEvent, ClubPhase, ClubStatus, Coordinate, QueueOutcome, QueueResult, QueueSession,
    QueueType, SpatialMarker,
};
use crate::error::ApiError;
use crate::io::estimation_client::{CheckpointAck, EstimationClient, Operation, PositionReport};
use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

/// Door position of the seeded venue
pub const VENUE_DOOR: Coordinate = Coordinate::new(52.5108, 13.4434);

/// (name, metres from the door, typical wait)
const MAIN_LINE: &[(&str, f64, i32)] = &[
    ("Metro sign", 420.0, 240),
    ("Wriezener Karree", 380.0, 210),
    ("Wriezener Straße", 340.0, 180),
    ("Around the block", 300.0, 150),
    ("Bridge", 260.0, 120),
    ("Späti", 220.0, 100),
    ("Past Kiosk", 180.0, 80),
    ("Kiosk", 150.0, 60),
    ("Magic Cube", 110.0, 45),
    ("Concrete blocks", 80.0, 30),
    ("Snake", 40.0, 15),
];

const GUEST_LINE: &[(&str, f64, i32)] = &[
    ("Park (GL)", 200.0, 60),
    ("ATM (GL)", 150.0, 45),
    ("Garten door (GL)", 100.0, 30),
    ("Love sculpture (GL)", 60.0, 20),
    ("Barriers (GL)", 20.0, 10),
];

#[derive(Debug, Clone)]
struct Club {
    markers: Vec<SpatialMarker>,
    status: Option<ClubStatus>,
}

#[derive(Debug, Default)]
struct Backend {
    clubs: HashMap<String, Club>,
    active: Option<QueueSession>,
    finished: Vec<QueueSession>,
    positions: Vec<PositionReport>,
}

pub struct InMemoryEstimationClient {
    backend: Mutex<Backend>,
    calls: Mutex<HashMap<Operation, usize>>,
    failures: Mutex<HashMap<Operation, ApiError>>,
    response_delays: Mutex<HashMap<Operation, Duration>>,
    latency: Duration,
}

impl Default for InMemoryEstimationClient {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryEstimationClient {
    /// Backend with no clubs
    pub fn new() -> Self {
        Self {
            backend: Mutex::new(Backend::default()),
            calls: Mutex::new(HashMap::new()),
            failures: Mutex::new(HashMap::new()),
            response_delays: Mutex::new(HashMap::new()),
            latency: Duration::ZERO,
        }
    }

    /// Backend seeded with one venue, its queue landmarks and an open queue
    pub fn seeded(slug: &str) -> Self {
        let client = Self::new();
        client.add_club(slug, seed_markers(), Some(open_status()));
        client
    }

    /// Delay every call, so concurrent callers overlap
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn add_club(&self, slug: &str, markers: Vec<SpatialMarker>, status: Option<ClubStatus>) {
        self.backend.lock().clubs.insert(slug.to_string(), Club { markers, status });
    }

    /// Make every call of `op` fail with `error` until cleared
    pub fn fail(&self, op: Operation, error: ApiError) {
        self.failures.lock().insert(op, error);
    }

    pub fn clear_failure(&self, op: Operation) {
        self.failures.lock().remove(&op);
    }

    /// Hold the answer to `op` for `delay` after the backend has applied it.
    /// Applies to the session operations (join, fetch, result, leave).
    pub fn delay_response(&self, op: Operation, delay: Duration) {
        self.response_delays.lock().insert(op, delay);
    }

    /// Number of calls received for `op`, failed ones included
    pub fn calls(&self, op: Operation) -> usize {
        self.calls.lock().get(&op).copied().unwrap_or(0)
    }

    pub fn total_calls(&self) -> usize {
        self.calls.lock().values().sum()
    }

    pub fn active_session(&self) -> Option<QueueSession> {
        self.backend.lock().active.clone()
    }

    pub fn finished_sessions(&self) -> Vec<QueueSession> {
        self.backend.lock().finished.clone()
    }

    pub fn positions(&self) -> Vec<PositionReport> {
        self.backend.lock().positions.clone()
    }

    /// Id of the first marker named `name` in any club
    pub fn marker_id(&self, name: &str) -> Option<Uuid> {
        self.backend
            .lock()
            .clubs
            .values()
            .flat_map(|club| club.markers.iter())
            .find(|m| m.name.eq_ignore_ascii_case(name))
            .map(|m| m.id)
    }

    /// Drop the active session behind the client's back (e.g. expired server-side)
    pub fn expire_session(&self) {
        self.backend.lock().active = None;
    }

    async fn enter(&self, op: Operation) -> Result<(), ApiError> {
        *self.calls.lock().entry(op).or_insert(0) += 1;
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        match self.failures.lock().get(&op) {
            Some(error) => {
                debug!(op = %op.as_str(), error = %error, "memory_backend_injected_failure");
                Err(error.clone())
            }
            None => Ok(()),
        }
    }

    async fn respond<T>(&self, op: Operation, result: Result<T, ApiError>) -> Result<T, ApiError> {
        let delay = self.response_delays.lock().get(&op).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        result
    }

    fn open_session(
        &self,
        club: &str,
        queue_type: QueueType,
        coordinate: Option<Coordinate>,
    ) -> Result<QueueSession, ApiError> {
        let mut backend = self.backend.lock();
        if backend.active.is_some() {
            return Err(ApiError::AlreadyInQueue);
        }
        if !backend.clubs.contains_key(club) {
            return Err(ApiError::InvalidClub(club.to_string()));
        }

        let mut session = QueueSession::new(queue_type);
        if let Some(coordinate) = coordinate {
            backend.positions.push(PositionReport::at(coordinate));
            session.position_count = 1;
        }
        backend.active = Some(session.clone());
        Ok(session)
    }

    fn finish(backend: &mut Backend, result: QueueResult) -> Result<QueueSession, ApiError> {
        let mut session = backend.active.take().ok_or(ApiError::SessionNotFound)?;
        let now = Utc::now();
        session.result = Some(result);
        session.result_at = Some(now);
        session.wait_duration_minutes = Some((now - session.joined_at).num_minutes());
        backend.finished.push(session.clone());
        Ok(session)
    }
}

#[async_trait]
impl EstimationClient for InMemoryEstimationClient {
    async fn join(
        &self,
        club: &str,
        queue_type: QueueType,
        coordinate: Option<Coordinate>,
    ) -> Result<QueueSession, ApiError> {
        self.enter(Operation::Join).await?;
        let result = self.open_session(club, queue_type, coordinate);
        self.respond(Operation::Join, result).await
    }

    async fn fetch_session(&self) -> Result<Option<QueueSession>, ApiError> {
        self.enter(Operation::FetchSession).await?;
        let snapshot = self.backend.lock().active.clone();
        self.respond(Operation::FetchSession, Ok(snapshot)).await
    }

    async fn report_position(&self, report: PositionReport) -> Result<(), ApiError> {
        self.enter(Operation::ReportPosition).await?;
        let mut backend = self.backend.lock();
        let session = backend.active.as_mut().ok_or(ApiError::SessionNotFound)?;
        session.position_count += 1;
        backend.positions.push(report);
        Ok(())
    }

    async fn submit_checkpoint(&self, marker_id: Uuid) -> Result<CheckpointAck, ApiError> {
        self.enter(Operation::Checkpoint).await?;
        let mut backend = self.backend.lock();
        if backend.active.is_none() {
            return Err(ApiError::SessionNotFound);
        }
        let marker = backend
            .clubs
            .values()
            .flat_map(|club| club.markers.iter())
            .find(|m| m.id == marker_id)
            .cloned()
            .ok_or(ApiError::MarkerNotFound)?;

        backend.positions.push(PositionReport::at(marker.coordinate()));
        if let Some(session) = backend.active.as_mut() {
            session.last_marker_id = Some(marker.id);
            session.position_count += 1;
        }

        Ok(CheckpointAck {
            success: true,
            message: format!("Checkpoint recorded: {}", marker.name),
            estimated_wait_minutes: marker.typical_wait_minutes,
        })
    }

    async fn submit_result(&self, outcome: QueueOutcome) -> Result<QueueSession, ApiError> {
        self.enter(Operation::Result).await?;
        let result = Self::finish(&mut self.backend.lock(), QueueResult::from(outcome));
        self.respond(Operation::Result, result).await
    }

    async fn leave_queue(&self) -> Result<(), ApiError> {
        self.enter(Operation::Leave).await?;
        let result = Self::finish(&mut self.backend.lock(), QueueResult::Left).map(|_| ());
        self.respond(Operation::Leave, result).await
    }

    async fn club_status(&self, club: &str) -> Result<Option<ClubStatus>, ApiError> {
        self.enter(Operation::ClubStatus).await?;
        self.backend
            .lock()
            .clubs
            .get(club)
            .map(|c| c.status.clone())
            .ok_or_else(|| ApiError::InvalidClub(club.to_string()))
    }

    async fn markers(&self, club: &str) -> Result<Vec<SpatialMarker>, ApiError> {
        self.enter(Operation::Markers).await?;
        self.backend
            .lock()
            .clubs
            .get(club)
            .map(|c| c.markers.clone())
            .ok_or_else(|| ApiError::InvalidClub(club.to_string()))
    }
}

fn marker(name: &str, meters_out: f64, typical_wait: Option<i32>, order: i32) -> SpatialMarker {
    let at = offset_north(VENUE_DOOR, meters_out);
    SpatialMarker {
        id: Uuid::new_v4(),
        name: name.to_string(),
        aliases: None,
        latitude: at.latitude,
        longitude: at.longitude,
        distance_from_door_meters: Some(meters_out.round() as i32),
        typical_wait_minutes: typical_wait,
        display_order: order,
        visible: true,
    }
}

/// Landmarks of the seeded venue, including parse-only ones
pub fn seed_markers() -> Vec<SpatialMarker> {
    let mut markers = Vec::new();
    let mut order = 0;
    for (name, meters, wait) in MAIN_LINE.iter().chain(GUEST_LINE.iter()) {
        order += 1;
        markers.push(marker(name, *meters, Some(*wait), order));
    }

    markers.push(marker("Door", 0.0, Some(5), order + 1));

    let mut entrance = marker("entrance", 0.0, Some(5), order + 2);
    entrance.aliases = Some(vec!["door".into(), "bouncer".into(), "eingang".into()]);
    markers.push(entrance);

    // Referenced by scraped queue reports only
    let mut halle = marker("Halle am Berghain", 90.0, None, order + 3);
    halle.visible = false;
    markers.push(halle);
    markers.push(marker("Panorama Bar line", 30.0, None, order + 4));

    markers
}

fn open_status() -> ClubStatus {
    let now = Utc::now();
    ClubStatus {
        is_open: true,
        event_name: Some("Klubnacht".to_string()),
        phase: ClubPhase::QueueOpen,
        queue_opens_at: Some(now - ChronoDuration::hours(1)),
        starts_at: Some(now + ChronoDuration::hours(2)),
        ends_at: Some(now + ChronoDuration::hours(35)),
        next_event: Some(ClubEvent {
            name: "Klubnacht".to_string(),
            queue_opens_at: Some(now + ChronoDuration::days(7)),
            starts_at: Some(now + ChronoDuration::days(7) + ChronoDuration::hours(3)),
            ends_at: None,
        }),
    }
}
