//! # Network Matcher
//!
//! Matches GPS tracks against a reference route network (for example a
//! cycling node network) and aggregates which edges and nodes were ridden.
//!
//! This library provides:
//! - Track normalization from raw point segments to a dated line geometry
//! - Buffer-overlap scoring of every network edge against a track
//! - Node resolution with spatial confirmation
//! - Sequential or worker-pool batch execution with polled progress
//! - Date-filtered aggregation into per-edge/per-node statistics
//!
//! ## Features
//!
//! - **`parallel`** (default) - Run large batches on a rayon worker pool
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use network_matcher::{
//!     aggregate, belgian_lambert_2008, match_batch, BatchOptions, DateRange, ProgressState,
//!     RawTrack, RouteNetwork,
//! };
//!
//! # fn load() -> (Vec<RawTrack>, RouteNetwork) { unimplemented!() }
//! # fn main() -> network_matcher::Result<()> {
//! let (tracks, network) = load();
//! let progress = ProgressState::new();
//!
//! let result = match_batch(
//!     &tracks,
//!     &network,
//!     belgian_lambert_2008()?,
//!     &BatchOptions::default(),
//!     &progress,
//! )?;
//!
//! let summary = aggregate(&result.matched_edges, &result.matched_nodes, &DateRange::all());
//! println!(
//!     "{} edges, {} nodes, {:.1} km",
//!     summary.totals.edge_count,
//!     summary.totals.node_count,
//!     summary.totals.total_length / 1000.0
//! );
//! # Ok(())
//! # }
//! ```

use chrono::NaiveDate;
use geo::{Buffer, Euclidean, Length, LineString, MultiLineString, MultiPolygon, Point};
use serde::{Deserialize, Serialize};

// Unified error handling
pub mod error;
pub use error::{NetMatchError, Result};

// R-tree envelope helpers
pub mod geo_utils;

// Geographic to metric projection
pub mod projection;
pub use projection::{belgian_lambert_2008, ProjCrs, Projection};

// Reference network store with spatial index
pub mod network;
pub use network::{NetworkEdge, NetworkNode, RouteNetwork};

// Raw track -> Track
pub mod normalize;
pub use normalize::{normalize_track, Normalized};

// Buffer-overlap edge matching
pub mod matching;
pub use matching::{match_edges, ProjectedTrack};

// Node resolution for matched edges
pub mod nodes;
pub use nodes::resolve_nodes;

// Polled batch progress
pub mod progress;
pub use progress::{ProgressSnapshot, ProgressState};

// Batch orchestration (sequential / worker pool)
pub mod batch;
pub use batch::{
    match_batch, select_execution_mode, BatchMatcher, BatchOptions, BatchResult, ExecutionMode,
    SkipReason, TrackOutcome, TrackReport,
};

// Aggregation of matches across a batch
pub mod aggregate;
pub use aggregate::{
    aggregate, AggregatedEdge, AggregatedNode, Aggregation, AggregationTotals, DateRange,
};

// ============================================================================
// Raw Track Types
// ============================================================================

/// One recorded position as delivered by a track decoder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawPoint {
    pub lon: f64,
    pub lat: f64,
    /// RFC 3339 timestamp; a missing offset is read as UTC
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time: Option<String>,
}

impl RawPoint {
    /// Create an untimed point.
    pub fn new(lon: f64, lat: f64) -> Self {
        Self {
            lon,
            lat,
            time: None,
        }
    }

    /// Create a timed point.
    pub fn timed(lon: f64, lat: f64, time: impl Into<String>) -> Self {
        Self {
            lon,
            lat,
            time: Some(time.into()),
        }
    }

    /// Check if the point has valid WGS84 coordinates.
    pub fn is_valid(&self) -> bool {
        self.lat.is_finite()
            && self.lon.is_finite()
            && self.lat >= -90.0
            && self.lat <= 90.0
            && self.lon >= -180.0
            && self.lon <= 180.0
    }
}

/// A raw track: one uploaded recording, split into segments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawTrack {
    /// Source name (file name), unique within a batch
    pub name: String,
    /// Activity type as recorded by the device (e.g. "cycling")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub activity_type: Option<String>,
    pub segments: Vec<Vec<RawPoint>>,
}

impl RawTrack {
    pub fn new(name: impl Into<String>, segments: Vec<Vec<RawPoint>>) -> Self {
        Self {
            name: name.into(),
            activity_type: None,
            segments,
        }
    }

    /// Decode a JSON track encoding.
    ///
    /// `name` is used for error reporting only; the decoded name wins.
    pub fn from_json(name: &str, json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| NetMatchError::MalformedTrack {
            track: name.to_string(),
            message: e.to_string(),
        })
    }

    /// Total number of points across all segments.
    pub fn point_count(&self) -> usize {
        self.segments.iter().map(Vec::len).sum()
    }
}

// ============================================================================
// Normalized Track
// ============================================================================

/// Line geometry of a track: one line, or several disjoint ones.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum TrackGeometry {
    Single(LineString<f64>),
    Multi(Vec<LineString<f64>>),
}

impl TrackGeometry {
    /// Build from usable lines. `None` if there are none.
    pub fn from_lines(mut lines: Vec<LineString<f64>>) -> Option<Self> {
        match lines.len() {
            0 => None,
            1 => lines.pop().map(TrackGeometry::Single),
            _ => Some(TrackGeometry::Multi(lines)),
        }
    }

    /// All member lines.
    pub fn lines(&self) -> &[LineString<f64>] {
        match self {
            TrackGeometry::Single(line) => std::slice::from_ref(line),
            TrackGeometry::Multi(lines) => lines,
        }
    }

    pub fn line_count(&self) -> usize {
        self.lines().len()
    }

    pub fn to_multi_line_string(&self) -> MultiLineString<f64> {
        MultiLineString::new(self.lines().to_vec())
    }

    /// Total length in CRS units.
    pub fn length(&self) -> f64 {
        Euclidean.length(&self.to_multi_line_string())
    }

    /// Dilate the geometry by `distance` (round caps and joins).
    pub fn buffer(&self, distance: f64) -> MultiPolygon<f64> {
        match self {
            TrackGeometry::Single(line) => line.buffer(distance),
            TrackGeometry::Multi(_) => self.to_multi_line_string().buffer(distance),
        }
    }
}

/// A normalized track, in WGS84 coordinates.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Track {
    pub name: String,
    /// UTC calendar date of the first timestamped point
    pub date: NaiveDate,
    pub activity_type: Option<String>,
    pub geometry: TrackGeometry,
}

// ============================================================================
// Match Types
// ============================================================================

/// A network edge traversed by one track.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MatchedEdge {
    pub edge_id: String,
    pub reference: Option<String>,
    pub node_from: String,
    pub node_to: String,
    /// Edge length in metres
    pub length: f64,
    pub geometry: LineString<f64>,
    /// Fraction of the edge inside the track buffer (0-1)
    pub overlap: f64,
    pub track: String,
    pub date: NaiveDate,
}

/// A network node passed by one track.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MatchedNode {
    pub node_id: String,
    pub reference: String,
    pub geometry: Point<f64>,
    pub track: String,
    pub date: NaiveDate,
}

/// Configuration for edge matching.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchConfig {
    /// Track buffer in metres, absorbing GPS and digitization error.
    /// Default: 20.0
    pub buffer_distance: f64,

    /// Minimum fraction of an edge's length that must lie inside the buffer.
    /// Default: 0.75
    pub overlap_threshold: f64,
}

impl Default for MatchConfig {
    fn default() -> Self {
        Self {
            buffer_distance: 20.0,
            overlap_threshold: 0.75,
        }
    }
}

impl MatchConfig {
    pub fn validate(&self) -> Result<()> {
        if !self.buffer_distance.is_finite() || self.buffer_distance <= 0.0 {
            return Err(NetMatchError::ConfigError {
                message: format!(
                    "buffer_distance must be a positive number of metres, got {}",
                    self.buffer_distance
                ),
            });
        }
        if !(self.overlap_threshold > 0.0 && self.overlap_threshold <= 1.0) {
            return Err(NetMatchError::ConfigError {
                message: format!(
                    "overlap_threshold must be in (0, 1], got {}",
                    self.overlap_threshold
                ),
            });
        }
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use geo::line_string;

    #[test]
    fn test_raw_point_validation() {
        assert!(RawPoint::new(4.35, 50.85).is_valid());
        assert!(!RawPoint::new(0.0, 91.0).is_valid());
        assert!(!RawPoint::new(181.0, 0.0).is_valid());
        assert!(!RawPoint::new(f64::NAN, 0.0).is_valid());
    }

    #[test]
    fn test_raw_track_from_json() {
        let json = r#"{
            "name": "ride.gpx",
            "activity_type": "cycling",
            "segments": [[
                {"lon": 4.35, "lat": 50.85, "time": "2024-05-01T08:00:00Z"},
                {"lon": 4.36, "lat": 50.86}
            ]]
        }"#;
        let track = RawTrack::from_json("ride.gpx", json).unwrap();
        assert_eq!(track.name, "ride.gpx");
        assert_eq!(track.activity_type.as_deref(), Some("cycling"));
        assert_eq!(track.point_count(), 2);
        assert!(track.segments[0][1].time.is_none());
    }

    #[test]
    fn test_raw_track_from_bad_json() {
        let err = RawTrack::from_json("broken.gpx", "{ not json").unwrap_err();
        assert!(matches!(err, NetMatchError::MalformedTrack { .. }));
    }

    #[test]
    fn test_geometry_variants() {
        assert!(TrackGeometry::from_lines(vec![]).is_none());

        let a = line_string![(x: 0.0, y: 0.0), (x: 10.0, y: 0.0)];
        let b = line_string![(x: 0.0, y: 5.0), (x: 10.0, y: 5.0)];

        let single = TrackGeometry::from_lines(vec![a.clone()]).unwrap();
        assert!(matches!(single, TrackGeometry::Single(_)));
        assert_eq!(single.line_count(), 1);

        let multi = TrackGeometry::from_lines(vec![a, b]).unwrap();
        assert!(matches!(multi, TrackGeometry::Multi(_)));
        assert!((multi.length() - 20.0).abs() < 1e-12);
        assert_eq!(multi.to_multi_line_string().0.len(), 2);
    }

    #[test]
    fn test_buffer_defined_for_both_variants() {
        use geo::{Area, Contains};

        let a = line_string![(x: 0.0, y: 0.0), (x: 100.0, y: 0.0)];
        let b = line_string![(x: 0.0, y: 500.0), (x: 100.0, y: 500.0)];

        let single = TrackGeometry::Single(a.clone()).buffer(20.0);
        assert!(single.contains(&Point::new(50.0, 15.0)));
        assert!(!single.contains(&Point::new(50.0, 25.0)));

        let multi = TrackGeometry::Multi(vec![a, b]).buffer(20.0);
        assert!(multi.contains(&Point::new(50.0, 510.0)));
        assert!(multi.unsigned_area() > single.unsigned_area() * 1.9);
    }

    #[test]
    fn test_match_config_validation() {
        assert!(MatchConfig::default().validate().is_ok());

        let bad_buffer = MatchConfig {
            buffer_distance: 0.0,
            ..MatchConfig::default()
        };
        assert!(bad_buffer.validate().is_err());

        let bad_threshold = MatchConfig {
            overlap_threshold: 1.5,
            ..MatchConfig::default()
        };
        assert!(bad_threshold.validate().is_err());
    }
}
