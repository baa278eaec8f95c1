//! Unified error handling for the network-matcher library.
//!
//! Only batch-fatal conditions and corrupt track geometry surface as errors.
//! Unusable tracks and tracks without matches are ordinary outcomes and are
//! reported through [`crate::batch::TrackOutcome`] instead.

use std::fmt;

/// Unified error type for network-matcher operations.
#[derive(Debug, Clone, PartialEq)]
pub enum NetMatchError {
    /// Track contains a point outside the valid lon/lat range
    InvalidCoordinates { track: String, message: String },
    /// Track encoding could not be decoded at all
    MalformedTrack { track: String, message: String },
    /// Network has no edges to match against
    EmptyNetwork,
    /// Network contains unusable geometry
    InvalidNetwork { message: String },
    /// Batch contains no tracks
    EmptyBatch,
    /// Network CRS differs from the projection used for tracks
    ProjectionMismatch { expected: u32, found: u32 },
    /// Projection could not be built or could not transform a coordinate
    Projection { epsg: u32, message: String },
    /// Configuration error
    ConfigError { message: String },
    /// Worker pool could not be started
    WorkerPool { message: String },
}

impl fmt::Display for NetMatchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NetMatchError::InvalidCoordinates { track, message } => {
                write!(f, "Track '{}' has invalid coordinates: {}", track, message)
            }
            NetMatchError::MalformedTrack { track, message } => {
                write!(f, "Track '{}' could not be decoded: {}", track, message)
            }
            NetMatchError::EmptyNetwork => write!(f, "Route network has no edges"),
            NetMatchError::InvalidNetwork { message } => {
                write!(f, "Invalid route network: {}", message)
            }
            NetMatchError::EmptyBatch => write!(f, "Batch contains no tracks"),
            NetMatchError::ProjectionMismatch { expected, found } => {
                write!(
                    f,
                    "Network is in EPSG:{}, but tracks are projected to EPSG:{}",
                    found, expected
                )
            }
            NetMatchError::Projection { epsg, message } => {
                write!(f, "Projection error (EPSG:{}): {}", epsg, message)
            }
            NetMatchError::ConfigError { message } => {
                write!(f, "Configuration error: {}", message)
            }
            NetMatchError::WorkerPool { message } => {
                write!(f, "Worker pool error: {}", message)
            }
        }
    }
}

impl std::error::Error for NetMatchError {}

/// Result type alias for network-matcher operations.
pub type Result<T> = std::result::Result<T, NetMatchError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = NetMatchError::InvalidCoordinates {
            track: "ride.gpx".to_string(),
            message: "latitude 91 out of range".to_string(),
        };
        assert!(err.to_string().contains("ride.gpx"));
        assert!(err.to_string().contains("latitude 91"));
    }

    #[test]
    fn test_projection_mismatch_names_both_crs() {
        let err = NetMatchError::ProjectionMismatch {
            expected: 3812,
            found: 31370,
        };
        let text = err.to_string();
        assert!(text.contains("EPSG:3812"));
        assert!(text.contains("EPSG:31370"));
    }
}
