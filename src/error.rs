//! Error types for location acquisition and the queue API.

use thiserror::Error;

/// Why an acquisition attempt did not produce a usable fix.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum LocationError {
    /// Location permission refused. `permanent` means only the device settings can fix it.
    #[error("location permission denied{}", permission_hint(.permanent))]
    PermissionDenied {
        /// The platform will not prompt again.
        permanent: bool,
    },

    /// No sample arrived before the acquisition deadline.
    #[error("no GPS fix within the time limit")]
    NoFix,

    /// Samples arrived but none was accurate enough.
    #[error("GPS accuracy insufficient: best {best_accuracy_meters:.0} m")]
    AccuracyInsufficient {
        /// Accuracy of the best sample seen.
        best_accuracy_meters: f64,
    },

    /// The fix lies outside the venue geofence.
    #[error("{distance_meters:.0} m from the venue (limit {max_distance_meters:.0} m)")]
    OutOfGeofence {
        /// Measured distance to the geofence anchor.
        distance_meters: f64,
        /// Configured radius.
        max_distance_meters: f64,
    },

    /// The position stream could not be opened.
    #[error("location sensor unavailable: {reason}")]
    SensorUnavailable {
        /// Provider-supplied description.
        reason: String,
    },

    /// Another acquisition is already running on this acquirer.
    #[error("location acquisition already in progress")]
    AlreadyAcquiring,

    /// The attempt was cancelled by the caller.
    #[error("location acquisition cancelled")]
    Cancelled,
}

fn permission_hint(permanent: &bool) -> &'static str {
    if *permanent {
        " (enable it in device settings)"
    } else {
        ""
    }
}

impl LocationError {
    /// Whether an in-app retry can succeed without external action.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, LocationError::PermissionDenied { permanent: true })
    }

    /// Short stable name for logs and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            LocationError::PermissionDenied { .. } => "permission_denied",
            LocationError::NoFix => "no_fix",
            LocationError::AccuracyInsufficient { .. } => "accuracy_insufficient",
            LocationError::OutOfGeofence { .. } => "out_of_geofence",
            LocationError::SensorUnavailable { .. } => "sensor_unavailable",
            LocationError::AlreadyAcquiring => "already_acquiring",
            LocationError::Cancelled => "cancelled",
        }
    }
}

/// Failures talking to the estimation service or guarding session operations.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ApiError {
    /// Transport failure, timeout, or unreadable response.
    #[error("network error: {0}")]
    Network(String),

    /// The server already holds an active session for this user.
    #[error("already in a queue; leave or report a result first")]
    AlreadyInQueue,

    /// The club slug is unknown to the server.
    #[error("unknown club '{0}'")]
    InvalidClub(String),

    /// There is no active session (locally or on the server).
    #[error("no active queue session")]
    SessionNotFound,

    /// The referenced marker does not exist.
    #[error("marker not found")]
    MarkerNotFound,

    /// Missing or rejected credentials.
    #[error("not authorized")]
    Unauthorized,

    /// Any other non-success response.
    #[error("server error {status}: {detail}")]
    Server {
        /// HTTP status code.
        status: u16,
        /// Server-supplied detail.
        detail: String,
    },

    /// The same kind of operation is already in flight.
    #[error("{0} already in progress")]
    InProgress(&'static str),
}

impl ApiError {
    /// Short stable name for logs and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            ApiError::Network(_) => "network",
            ApiError::AlreadyInQueue => "already_in_queue",
            ApiError::InvalidClub(_) => "invalid_club",
            ApiError::SessionNotFound => "session_not_found",
            ApiError::MarkerNotFound => "marker_not_found",
            ApiError::Unauthorized => "unauthorized",
            ApiError::Server { .. } => "server",
            ApiError::InProgress(_) => "in_progress",
        }
    }
}

/// Failure of a combined locate-then-join attempt.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum JoinError {
    #[error(transparent)]
    Location(#[from] LocationError),

    #[error(transparent)]
    Api(#[from] ApiError),

    /// Joining without a fix is not allowed by the configured policy.
    #[error("a validated location is required to join")]
    LocationRequired,
}
