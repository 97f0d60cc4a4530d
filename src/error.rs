use thiserror::Error;

/// Failures reported by the platform position sensor.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SensorError {
    /// Fatal to the session. Tracking stops until the user re-grants access.
    #[error("location permission denied")]
    PermissionDenied,
    #[error("position unavailable: {0}")]
    PositionUnavailable(String),
    #[error("position request timed out")]
    Timeout,
}

impl SensorError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, SensorError::PermissionDenied)
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("realtime channel is not connected")]
    NotConnected,
    #[error("delivery rejected: {0}")]
    Rejected(String),
    #[error("network failure: {0}")]
    Network(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RoutingError {
    #[error("no route between origin and destination")]
    NoRoute,
    #[error("routing service unavailable: {0}")]
    Unavailable(String),
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum WireError {
    #[error("malformed payload: {0}")]
    Malformed(String),
    #[error("latitude {0} out of range")]
    LatitudeOutOfRange(f64),
    #[error("longitude {0} out of range")]
    LongitudeOutOfRange(f64),
    #[error("missing job id")]
    MissingJobId,
}

/// Errors surfaced to the caller of `Tracker::start` and friends.
#[derive(Error, Debug)]
pub enum TrackingError {
    #[error(transparent)]
    Sensor(#[from] SensorError),
    #[error("job {0} is not owned by this technician")]
    NotOwner(String),
    #[error("job {job_id} is {status} and cannot be tracked")]
    NotTrackable { job_id: String, status: String },
    #[error("no active tracking session")]
    NoActiveSession,
    /// `stop` was called while the session was still being set up.
    #[error("session start was cancelled")]
    Cancelled,
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
