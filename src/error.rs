//! Error types.
//!
//! Input validation and state misuse surface as [`EngineError`]; failures of
//! the device location service surface as [`LocationError`] and are wrapped
//! when they cross into the engine.

use thiserror::Error;

/// Acquisition failures reported by the device location service.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LocationError {
    #[error("location permission denied, allow location access in settings")]
    PermissionDenied,

    #[error("location unavailable: {0}")]
    Unavailable(String),

    #[error("location request timed out")]
    Timeout,

    #[error("location subscription closed")]
    SubscriptionClosed,
}

/// Errors returned by engine operations.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid coordinate ({latitude}, {longitude})")]
    InvalidCoordinate { latitude: f64, longitude: f64 },

    #[error("invalid location sample: {0}")]
    InvalidSample(String),

    #[error("malformed route: {0}")]
    MalformedRoute(String),

    #[error("invalid peak window '{0}', expected HH:MM-HH:MM")]
    InvalidPeakWindow(String),

    #[error("a navigation session is already active")]
    AlreadyNavigating,

    #[error("route unavailable: {0}")]
    RouteUnavailable(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error(transparent)]
    Location(#[from] LocationError),
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        EngineError::InvalidConfig(err.to_string())
    }
}
