//! Shared types for the queue client

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use uuid::Uuid;

/// A WGS84 coordinate in decimal degrees
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinate {
    pub latitude: f64,
    pub longitude: f64,
}

impl Coordinate {
    pub const fn new(latitude: f64, longitude: f64) -> Self {
        Self { latitude, longitude }
    }
}

impl std::fmt::Display for Coordinate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:.6},{:.6}", self.latitude, self.longitude)
    }
}

/// One reading from the device position stream
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PositionSample {
    pub coordinate: Coordinate,
    /// Horizontal accuracy radius reported by the sensor
    pub accuracy_meters: f64,
    /// Device wall-clock time of the reading
    pub captured_at: DateTime<Utc>,
}

impl PositionSample {
    pub fn new(latitude: f64, longitude: f64, accuracy_meters: f64) -> Self {
        Self {
            coordinate: Coordinate::new(latitude, longitude),
            accuracy_meters,
            captured_at: Utc::now(),
        }
    }

    /// Strictly more accurate than `other`; ties keep the earlier sample
    #[inline]
    pub fn is_more_accurate_than(&self, other: &PositionSample) -> bool {
        self.accuracy_meters < other.accuracy_meters
    }
}

/// Physical queue the user stands in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueType {
    Main,
    #[serde(alias = "guestlist")]
    GuestList,
    Reentry,
}

impl QueueType {
    pub const ALL: [QueueType; 3] = [QueueType::Main, QueueType::GuestList, QueueType::Reentry];

    #[inline]
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueType::Main => "main",
            QueueType::GuestList => "guest_list",
            QueueType::Reentry => "reentry",
        }
    }
}

impl std::fmt::Display for QueueType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for QueueType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "main" => Ok(QueueType::Main),
            "guest_list" | "guestlist" | "gl" => Ok(QueueType::GuestList),
            "reentry" | "re-entry" => Ok(QueueType::Reentry),
            other => Err(format!("unknown queue type '{other}'")),
        }
    }
}

/// Outcome a user can report at the door
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueOutcome {
    Admitted,
    Rejected,
}

impl QueueOutcome {
    #[inline]
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueOutcome::Admitted => "admitted",
            QueueOutcome::Rejected => "rejected",
        }
    }
}

impl std::str::FromStr for QueueOutcome {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "admitted" | "in" => Ok(QueueOutcome::Admitted),
            "rejected" | "out" => Ok(QueueOutcome::Rejected),
            other => Err(format!("unknown outcome '{other}'")),
        }
    }
}

/// Terminal result recorded on a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueResult {
    Admitted,
    Rejected,
    /// Recorded by the server when the user leaves voluntarily
    Left,
}

impl QueueResult {
    #[inline]
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueResult::Admitted => "admitted",
            QueueResult::Rejected => "rejected",
            QueueResult::Left => "left",
        }
    }
}

impl From<QueueOutcome> for QueueResult {
    fn from(outcome: QueueOutcome) -> Self {
        match outcome {
            QueueOutcome::Admitted => QueueResult::Admitted,
            QueueOutcome::Rejected => QueueResult::Rejected,
        }
    }
}

/// Client mirror of one queueing attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueSession {
    pub id: Uuid,
    pub queue_type: QueueType,
    #[serde(deserialize_with = "deserialize_timestamp")]
    pub joined_at: DateTime<Utc>,
    /// Last checkpoint the server acknowledged
    #[serde(default)]
    pub last_marker_id: Option<Uuid>,
    #[serde(default)]
    pub result: Option<QueueResult>,
    #[serde(default, deserialize_with = "deserialize_opt_timestamp")]
    pub result_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub wait_duration_minutes: Option<i64>,
    #[serde(default)]
    pub position_count: u32,
}

impl QueueSession {
    pub fn new(queue_type: QueueType) -> Self {
        Self {
            id: Uuid::now_v7(),
            queue_type,
            joined_at: Utc::now(),
            last_marker_id: None,
            result: None,
            result_at: None,
            wait_duration_minutes: None,
            position_count: 0,
        }
    }

    /// A session with a result is immutable
    #[inline]
    pub fn is_terminal(&self) -> bool {
        self.result.is_some()
    }
}

/// Landmark along a queue
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpatialMarker {
    pub id: Uuid,
    pub name: String,
    #[serde(default)]
    pub aliases: Option<Vec<String>>,
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default)]
    pub distance_from_door_meters: Option<i32>,
    #[serde(default)]
    pub typical_wait_minutes: Option<i32>,
    #[serde(default)]
    pub display_order: i32,
    /// Parse-only markers are hidden from every display set
    #[serde(default = "default_visible")]
    pub visible: bool,
}

fn default_visible() -> bool {
    true
}

impl SpatialMarker {
    pub fn coordinate(&self) -> Coordinate {
        Coordinate::new(self.latitude, self.longitude)
    }
}

/// Phase of the venue's current or next event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClubPhase {
    QueueOpen,
    PartyRunning,
    Closed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClubEvent {
    pub name: String,
    #[serde(default, deserialize_with = "deserialize_opt_timestamp")]
    pub queue_opens_at: Option<DateTime<Utc>>,
    #[serde(default, deserialize_with = "deserialize_opt_timestamp")]
    pub starts_at: Option<DateTime<Utc>>,
    #[serde(default, deserialize_with = "deserialize_opt_timestamp")]
    pub ends_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClubStatus {
    pub is_open: bool,
    #[serde(default)]
    pub event_name: Option<String>,
    pub phase: ClubPhase,
    #[serde(default, deserialize_with = "deserialize_opt_timestamp")]
    pub queue_opens_at: Option<DateTime<Utc>>,
    #[serde(default, deserialize_with = "deserialize_opt_timestamp")]
    pub starts_at: Option<DateTime<Utc>>,
    #[serde(default, deserialize_with = "deserialize_opt_timestamp")]
    pub ends_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub next_event: Option<ClubEvent>,
}

/// Platform location permission state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionStatus {
    Granted,
    /// Refused and the platform will not prompt again
    Denied,
    /// Never asked
    Undetermined,
}

/// Requested sensor accuracy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccuracyTier {
    Balanced,
    #[default]
    High,
    Highest,
}

/// Parse an ISO 8601 timestamp with or without offset (naive = UTC)
pub fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(value) {
        return Some(ts.with_timezone(&Utc));
    }
    // Offset followed by a stray 'Z' ("...+00:00Z")
    let trimmed = value.strip_suffix('Z').unwrap_or(value);
    if let Ok(ts) = DateTime::parse_from_rfc3339(trimmed) {
        return Some(ts.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(trimmed, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}

fn deserialize_timestamp<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    parse_timestamp(&raw)
        .ok_or_else(|| serde::de::Error::custom(format!("invalid timestamp '{raw}'")))
}

fn deserialize_opt_timestamp<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<String>::deserialize(deserializer)? {
        None => Ok(None),
        Some(raw) => parse_timestamp(&raw)
            .map(Some)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid timestamp '{raw}'"))),
    }
}
