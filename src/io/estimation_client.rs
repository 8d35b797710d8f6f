//! Estimation service client
//!
//! `EstimationClient` is the seam to the remote authority for queue sessions.
//! `HttpEstimationClient` binds it to the REST API:
//! - POST /api/queue/join, /position, /checkpoint, /result, /leave
//! - GET  /api/queue/session
//! - GET  /api/clubs/{slug}/status, /api/clubs/{slug}/markers

use crate::domain::types::{
    ClubStatus, Coordinate, PositionSample, QueueOutcome, QueueSession, QueueType, SpatialMarker,
};
use crate::error::ApiError;
use crate::infra::config::Config;
use crate::infra::metrics::Metrics;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};
use uuid::Uuid;

/// Position telemetry payload
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PositionReport {
    pub latitude: f64,
    pub longitude: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub accuracy_meters: Option<f64>,
    pub recorded_at: DateTime<Utc>,
}

impl PositionReport {
    pub fn at(coordinate: Coordinate) -> Self {
        Self {
            latitude: coordinate.latitude,
            longitude: coordinate.longitude,
            accuracy_meters: None,
            recorded_at: Utc::now(),
        }
    }
}

impl From<Coordinate> for PositionReport {
    fn from(coordinate: Coordinate) -> Self {
        Self::at(coordinate)
    }
}

impl From<&PositionSample> for PositionReport {
    fn from(sample: &PositionSample) -> Self {
        Self {
            latitude: sample.coordinate.latitude,
            longitude: sample.coordinate.longitude,
            accuracy_meters: Some(sample.accuracy_meters),
            recorded_at: sample.captured_at,
        }
    }
}

/// Server acknowledgment of a checkpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointAck {
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub estimated_wait_minutes: Option<i32>,
}

/// Remote authority for sessions and venue reference data
#[async_trait]
pub trait EstimationClient: Send + Sync {
    async fn join(
        &self,
        club: &str,
        queue_type: QueueType,
        coordinate: Option<Coordinate>,
    ) -> Result<QueueSession, ApiError>;

    /// `Ok(None)` when the user has no active session
    async fn fetch_session(&self) -> Result<Option<QueueSession>, ApiError>;

    async fn report_position(&self, report: PositionReport) -> Result<(), ApiError>;

    async fn submit_checkpoint(&self, marker_id: Uuid) -> Result<CheckpointAck, ApiError>;

    async fn submit_result(&self, outcome: QueueOutcome) -> Result<QueueSession, ApiError>;

    async fn leave_queue(&self) -> Result<(), ApiError>;

    /// `Ok(None)` when the club exists but has no status schedule
    async fn club_status(&self, club: &str) -> Result<Option<ClubStatus>, ApiError>;

    async fn markers(&self, club: &str) -> Result<Vec<SpatialMarker>, ApiError>;
}

/// Which call a failed response belongs to (drives status mapping)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Join,
    FetchSession,
    ReportPosition,
    Checkpoint,
    Result,
    Leave,
    ClubStatus,
    Markers,
}

impl Operation {
    pub const ALL: [Operation; 8] = [
        Operation::Join,
        Operation::FetchSession,
        Operation::ReportPosition,
        Operation::Checkpoint,
        Operation::Result,
        Operation::Leave,
        Operation::ClubStatus,
        Operation::Markers,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Join => "join",
            Operation::FetchSession => "fetch_session",
            Operation::ReportPosition => "report_position",
            Operation::Checkpoint => "checkpoint",
            Operation::Result => "result",
            Operation::Leave => "leave",
            Operation::ClubStatus => "club_status",
            Operation::Markers => "markers",
        }
    }
}

#[derive(Debug, Serialize)]
struct JoinRequest<'a> {
    club_slug: &'a str,
    queue_type: QueueType,
    #[serde(skip_serializing_if = "Option::is_none")]
    latitude: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    longitude: Option<f64>,
}

#[derive(Debug, Serialize)]
struct CheckpointRequest {
    marker_id: Uuid,
}

#[derive(Debug, Serialize)]
struct ResultRequest {
    result: QueueOutcome,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    detail: Option<serde_json::Value>,
}

/// Extract a FastAPI-style `{"detail": ...}` message, falling back to the raw body
fn error_detail(body: &str) -> String {
    match serde_json::from_str::<ErrorBody>(body) {
        Ok(ErrorBody { detail: Some(serde_json::Value::String(s)) }) => s,
        Ok(ErrorBody { detail: Some(other) }) => other.to_string(),
        _ => body.trim().to_string(),
    }
}

/// Map a non-success response to the client error taxonomy
pub fn classify_error(op: Operation, club: &str, status: u16, detail: &str) -> ApiError {
    let lower = detail.to_ascii_lowercase();
    match (op, status) {
        (_, 401) | (_, 403) => ApiError::Unauthorized,
        (Operation::Join, 400) if lower.contains("already") => ApiError::AlreadyInQueue,
        (Operation::Join, 404) | (Operation::ClubStatus, 404) | (Operation::Markers, 404) => {
            ApiError::InvalidClub(club.to_string())
        }
        (Operation::Checkpoint, 404) => ApiError::MarkerNotFound,
        (_, 400) if lower.contains("no active queue session") => ApiError::SessionNotFound,
        (Operation::FetchSession, 404) => ApiError::SessionNotFound,
        _ => ApiError::Server { status, detail: detail.to_string() },
    }
}

/// REST binding of `EstimationClient` with a fixed per-request timeout
pub struct HttpEstimationClient {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
    metrics: Arc<Metrics>,
}

impl HttpEstimationClient {
    pub fn new(config: &Config, metrics: Arc<Metrics>) -> Result<Self, ApiError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.api_timeout_ms()))
            .user_agent(concat!("queue-client/", env!("CARGO_PKG_VERSION"), " (", env!("GIT_HASH"), ")"))
            .build()
            .map_err(|e| ApiError::Network(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url: config.api_base_url().to_string(),
            token: config.api_token().map(str::to_string),
            metrics,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Send a request, record latency, and return the body of a 2xx response.
    ///
    /// Non-success statuses come back as `Err((status, detail))` so callers can
    /// special-case them before classification.
    async fn execute(
        &self,
        op: Operation,
        request: RequestBuilder,
    ) -> Result<Result<String, (u16, String)>, ApiError> {
        let request = match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        };

        let start = Instant::now();
        let result = request.send().await;
        let latency_ms = start.elapsed().as_millis() as u64;

        let response = match result {
            Ok(response) => response,
            Err(e) => {
                self.metrics.record_api_request(latency_ms, false);
                warn!(op = %op.as_str(), latency_ms = %latency_ms, error = %e, "api_request_failed");
                return Err(ApiError::Network(e.to_string()));
            }
        };

        let status = response.status();
        let body = response.text().await.map_err(|e| {
            self.metrics.record_api_request(latency_ms, false);
            ApiError::Network(format!("failed to read response: {e}"))
        })?;

        self.metrics.record_api_request(latency_ms, status.is_success());
        debug!(op = %op.as_str(), status = %status.as_u16(), latency_ms = %latency_ms, "api_response");

        if status.is_success() {
            Ok(Ok(body))
        } else {
            Ok(Err((status.as_u16(), error_detail(&body))))
        }
    }

    async fn call<T: DeserializeOwned>(
        &self,
        op: Operation,
        club: &str,
        request: RequestBuilder,
    ) -> Result<T, ApiError> {
        match self.execute(op, request).await? {
            Ok(body) => decode(op, &body),
            Err((status, detail)) => Err(classify_error(op, club, status, &detail)),
        }
    }
}

fn decode<T: DeserializeOwned>(op: Operation, body: &str) -> Result<T, ApiError> {
    serde_json::from_str(body)
        .map_err(|e| ApiError::Network(format!("invalid {} response: {e}", op.as_str())))
}

#[async_trait]
impl EstimationClient for HttpEstimationClient {
    async fn join(
        &self,
        club: &str,
        queue_type: QueueType,
        coordinate: Option<Coordinate>,
    ) -> Result<QueueSession, ApiError> {
        let body = JoinRequest {
            club_slug: club,
            queue_type,
            latitude: coordinate.map(|c| c.latitude),
            longitude: coordinate.map(|c| c.longitude),
        };
        let request = self.client.post(self.url("/api/queue/join")).json(&body);
        self.call(Operation::Join, club, request).await
    }

    async fn fetch_session(&self) -> Result<Option<QueueSession>, ApiError> {
        let request = self.client.get(self.url("/api/queue/session"));
        match self.execute(Operation::FetchSession, request).await? {
            Ok(body) => decode(Operation::FetchSession, &body),
            Err((status, _)) if status == StatusCode::NOT_FOUND.as_u16() => Ok(None),
            Err((status, detail)) => {
                Err(classify_error(Operation::FetchSession, "", status, &detail))
            }
        }
    }

    async fn report_position(&self, report: PositionReport) -> Result<(), ApiError> {
        let request = self.client.post(self.url("/api/queue/position")).json(&report);
        let _: serde_json::Value = self.call(Operation::ReportPosition, "", request).await?;
        Ok(())
    }

    async fn submit_checkpoint(&self, marker_id: Uuid) -> Result<CheckpointAck, ApiError> {
        let request = self
            .client
            .post(self.url("/api/queue/checkpoint"))
            .json(&CheckpointRequest { marker_id });
        self.call(Operation::Checkpoint, "", request).await
    }

    async fn submit_result(&self, outcome: QueueOutcome) -> Result<QueueSession, ApiError> {
        let request = self
            .client
            .post(self.url("/api/queue/result"))
            .json(&ResultRequest { result: outcome });
        self.call(Operation::Result, "", request).await
    }

    async fn leave_queue(&self) -> Result<(), ApiError> {
        let request = self.client.post(self.url("/api/queue/leave"));
        let _: serde_json::Value = self.call(Operation::Leave, "", request).await?;
        Ok(())
    }

    async fn club_status(&self, club: &str) -> Result<Option<ClubStatus>, ApiError> {
        let request = self.client.get(self.url(&format!("/api/clubs/{club}/status")));
        let value: serde_json::Value = self.call(Operation::ClubStatus, club, request).await?;
        // Clubs without schedule logic answer {"message": "..."}
        if value.get("is_open").is_none() {
            return Ok(None);
        }
        serde_json::from_value(value)
            .map(Some)
            .map_err(|e| ApiError::Network(format!("invalid club_status response: {e}")))
    }

    async fn markers(&self, club: &str) -> Result<Vec<SpatialMarker>, ApiError> {
        let request = self.client.get(self.url(&format!("/api/clubs/{club}/markers")));
        self.call(Operation::Markers, club, request).await
    }
}
