//! Buffer-overlap matching of one track against the network.
//!
//! This module provides the core matching decision:
//! - Track projection into the network CRS
//! - Buffering by a fixed distance to absorb positional error
//! - Overlap scoring: the share of an edge's length inside the buffer
//!
//! An edge counts as traversed when at least `overlap_threshold` of its
//! length lies within `buffer_distance` of the track. Widening the buffer
//! or lowering the threshold can only add edges, never remove them.

use chrono::NaiveDate;
use geo::{
    BooleanOps, BoundingRect, Coord, Euclidean, Intersects, Length, LineString, MultiLineString,
    MultiPolygon, RemoveRepeatedPoints,
};
use log::debug;

use crate::error::{NetMatchError, Result};
use crate::geo_utils::envelope_of;
use crate::network::{NetworkEdge, RouteNetwork};
use crate::projection::Projection;
use crate::{MatchConfig, MatchedEdge, Track, TrackGeometry};

/// A track in the network's metric CRS, with its buffer polygon.
#[derive(Debug, Clone)]
pub struct ProjectedTrack {
    pub name: String,
    pub date: NaiveDate,
    pub geometry: TrackGeometry,
    pub buffer_distance: f64,
    pub buffer: MultiPolygon<f64>,
}

impl ProjectedTrack {
    /// Project `track` and buffer it.
    ///
    /// Consecutive repeated points are removed after projection. Returns
    /// `Ok(None)` when no line with two distinct points remains (e.g. a
    /// recording that never moved).
    pub fn new(
        track: &Track,
        projection: &dyn Projection,
        buffer_distance: f64,
    ) -> Result<Option<Self>> {
        let mut lines = Vec::with_capacity(track.geometry.line_count());
        for line in track.geometry.lines() {
            let projected = project_line(&track.name, line, projection)?.remove_repeated_points();
            if projected.0.len() >= 2 {
                lines.push(projected);
            }
        }

        Ok(TrackGeometry::from_lines(lines).map(|geometry| {
            Self::from_metric(&track.name, track.date, geometry, buffer_distance)
        }))
    }

    /// Wrap geometry that is already in the network CRS.
    pub fn from_metric(
        name: &str,
        date: NaiveDate,
        geometry: TrackGeometry,
        buffer_distance: f64,
    ) -> Self {
        let buffer = geometry.buffer(buffer_distance);
        Self {
            name: name.to_string(),
            date,
            geometry,
            buffer_distance,
            buffer,
        }
    }
}

fn project_line(
    track: &str,
    line: &LineString<f64>,
    projection: &dyn Projection,
) -> Result<LineString<f64>> {
    line.coords()
        .map(|c| {
            projection
                .forward(c.x, c.y)
                .ok_or_else(|| NetMatchError::InvalidCoordinates {
                    track: track.to_string(),
                    message: format!(
                        "({}, {}) cannot be projected to EPSG:{}",
                        c.x,
                        c.y,
                        projection.epsg()
                    ),
                })
        })
        .collect::<Result<Vec<Coord<f64>>>>()
        .map(LineString::new)
}

/// Match one projected track against every candidate edge.
///
/// Candidates come from the network's R-tree (buffer bounding box) and
/// are confirmed by exact intersection. Each edge appears at most once.
/// An empty result is a normal outcome.
pub fn match_edges(
    track: &ProjectedTrack,
    network: &RouteNetwork,
    config: &MatchConfig,
) -> Vec<MatchedEdge> {
    let Some(rect) = track.buffer.bounding_rect() else {
        return Vec::new();
    };

    let mut candidates = 0usize;
    let mut matched = Vec::new();
    for edge in network.edges_in_envelope(&envelope_of(rect)) {
        candidates += 1;
        let Some(overlap) = edge_overlap(&track.buffer, edge) else {
            continue;
        };
        if is_traversed(overlap, config.overlap_threshold) {
            matched.push(MatchedEdge {
                edge_id: edge.id.clone(),
                reference: edge.reference.clone(),
                node_from: edge.node_from.clone(),
                node_to: edge.node_to.clone(),
                length: edge.length,
                geometry: edge.geometry.clone(),
                overlap,
                track: track.name.clone(),
                date: track.date,
            });
        }
    }

    debug!(
        "[Matching] {}: {} candidate edges, {} above {:.0}% overlap",
        track.name,
        candidates,
        matched.len(),
        config.overlap_threshold * 100.0
    );

    matched
}

/// Fraction of `edge` inside `buffer`, or `None` when the edge does not
/// touch the buffer or has no length.
pub fn edge_overlap(buffer: &MultiPolygon<f64>, edge: &NetworkEdge) -> Option<f64> {
    if !edge.is_matchable() || !buffer.intersects(&edge.geometry) {
        return None;
    }
    let inside = buffer.clip(&MultiLineString::new(vec![edge.geometry.clone()]), false);
    overlap_score(Euclidean.length(&inside), edge.length)
}

/// Overlap score clamped to [0, 1]. Undefined for non-positive edge length.
pub fn overlap_score(inside_length: f64, edge_length: f64) -> Option<f64> {
    if edge_length.is_nan() || edge_length <= 0.0 || !inside_length.is_finite() {
        return None;
    }
    Some((inside_length / edge_length).clamp(0.0, 1.0))
}

/// The matching decision. A score equal to the threshold is a match.
#[inline]
pub fn is_traversed(overlap: f64, threshold: f64) -> bool {
    overlap >= threshold
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::NetworkNode;
    use crate::projection::belgian_lambert_2008;
    use geo::{line_string, Point};
    use std::collections::BTreeSet;

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 1, 1).unwrap()
    }

    fn single_edge_network() -> RouteNetwork {
        RouteNetwork::new(
            3812,
            vec![NetworkEdge::new(
                "E1",
                "A",
                "B",
                line_string![(x: 0.0, y: 0.0), (x: 100.0, y: 0.0)],
            )],
            vec![
                NetworkNode::new("nA", "A", Point::new(0.0, 0.0)),
                NetworkNode::new("nB", "B", Point::new(100.0, 0.0)),
            ],
        )
        .unwrap()
    }

    /// Parallel to E1 two metres off, ending at x = 60: the round cap
    /// reaches x ~ 80, so about 80 m of E1 is inside a 20 m buffer.
    fn eighty_percent_track(buffer: f64) -> ProjectedTrack {
        ProjectedTrack::from_metric(
            "t.gpx",
            date(),
            TrackGeometry::Single(line_string![(x: -100.0, y: 2.0), (x: 60.0, y: 2.0)]),
            buffer,
        )
    }

    #[test]
    fn test_partial_overlap_score() {
        let network = single_edge_network();
        let track = eighty_percent_track(20.0);
        let overlap = edge_overlap(&track.buffer, &network.edges()[0]).unwrap();
        assert!((overlap - 0.80).abs() < 0.01, "overlap {}", overlap);
    }

    #[test]
    fn test_threshold_decides_match() {
        let network = single_edge_network();
        let track = eighty_percent_track(20.0);

        let loose = MatchConfig {
            overlap_threshold: 0.75,
            ..MatchConfig::default()
        };
        let matched = match_edges(&track, &network, &loose);
        assert_eq!(matched.len(), 1);
        assert_eq!(matched[0].edge_id, "E1");
        assert_eq!(matched[0].track, "t.gpx");
        assert!((matched[0].length - 100.0).abs() < 1e-9);

        let strict = MatchConfig {
            overlap_threshold: 0.85,
            ..MatchConfig::default()
        };
        assert!(match_edges(&track, &network, &strict).is_empty());
    }

    #[test]
    fn test_threshold_boundary() {
        let score = overlap_score(75.0, 100.0).unwrap();
        assert!(is_traversed(score, 0.75));
        let below = overlap_score(74.999, 100.0).unwrap();
        assert!(!is_traversed(below, 0.75));
    }

    #[test]
    fn test_overlap_score_edge_cases() {
        assert_eq!(overlap_score(10.0, 0.0), None);
        assert_eq!(overlap_score(10.0, -1.0), None);
        assert_eq!(overlap_score(120.0, 100.0), Some(1.0));
        assert_eq!(overlap_score(f64::NAN, 100.0), None);
    }

    #[test]
    fn test_distant_track_no_match() {
        let network = single_edge_network();
        let track = ProjectedTrack::from_metric(
            "far.gpx",
            date(),
            TrackGeometry::Single(line_string![(x: 0.0, y: 500.0), (x: 100.0, y: 500.0)]),
            20.0,
        );
        assert!(match_edges(&track, &network, &MatchConfig::default()).is_empty());
    }

    #[test]
    fn test_multi_line_track_matches_both_parts() {
        let network = RouteNetwork::new(
            3812,
            vec![
                NetworkEdge::new("E1", "A", "B", line_string![(x: 0.0, y: 0.0), (x: 100.0, y: 0.0)]),
                NetworkEdge::new(
                    "E2",
                    "C",
                    "D",
                    line_string![(x: 0.0, y: 1000.0), (x: 100.0, y: 1000.0)],
                ),
            ],
            vec![],
        )
        .unwrap();
        let track = ProjectedTrack::from_metric(
            "multi.gpx",
            date(),
            TrackGeometry::Multi(vec![
                line_string![(x: -10.0, y: 1.0), (x: 110.0, y: 1.0)],
                line_string![(x: -10.0, y: 999.0), (x: 110.0, y: 999.0)],
            ]),
            20.0,
        );
        let ids: BTreeSet<String> = match_edges(&track, &network, &MatchConfig::default())
            .into_iter()
            .map(|m| m.edge_id)
            .collect();
        assert_eq!(ids, BTreeSet::from(["E1".to_string(), "E2".to_string()]));
    }

    fn matched_ids(track: &ProjectedTrack, network: &RouteNetwork, threshold: f64) -> BTreeSet<String> {
        let config = MatchConfig {
            buffer_distance: track.buffer_distance,
            overlap_threshold: threshold,
        };
        match_edges(track, network, &config)
            .into_iter()
            .map(|m| m.edge_id)
            .collect()
    }

    #[test]
    fn test_monotonic_in_buffer_and_threshold() {
        // Edges at increasing offsets from a straight track, plus one crossing it
        let mut edges: Vec<NetworkEdge> = (0..8)
            .map(|i| {
                let y = i as f64 * 7.0;
                NetworkEdge::new(
                    format!("P{}", i),
                    format!("{}a", i),
                    format!("{}b", i),
                    line_string![(x: 0.0, y: y), (x: 80.0 + i as f64 * 10.0, y: y)],
                )
            })
            .collect();
        edges.push(NetworkEdge::new(
            "X",
            "xa",
            "xb",
            line_string![(x: 50.0, y: -60.0), (x: 50.0, y: 60.0)],
        ));
        let network = RouteNetwork::new(3812, edges, vec![]).unwrap();
        let line = line_string![(x: -20.0, y: 0.0), (x: 100.0, y: 3.0)];

        let mut previous: Option<BTreeSet<String>> = None;
        for buffer in [5.0, 10.0, 20.0, 40.0] {
            let track = ProjectedTrack::from_metric(
                "m.gpx",
                date(),
                TrackGeometry::Single(line.clone()),
                buffer,
            );
            let ids = matched_ids(&track, &network, 0.75);
            if let Some(prev) = &previous {
                assert!(ids.is_superset(prev), "buffer {} lost edges", buffer);
            }
            previous = Some(ids);
        }

        let track = ProjectedTrack::from_metric("m.gpx", date(), TrackGeometry::Single(line), 20.0);
        let mut previous: Option<BTreeSet<String>> = None;
        for threshold in [0.95, 0.85, 0.75, 0.5, 0.2] {
            let ids = matched_ids(&track, &network, threshold);
            if let Some(prev) = &previous {
                assert!(ids.is_superset(prev), "threshold {} lost edges", threshold);
            }
            previous = Some(ids);
        }
        assert!(previous.map_or(false, |ids| ids.contains("X")));
    }

    #[test]
    fn test_projected_track_drops_stationary_lines() {
        let track = Track {
            name: "still.gpx".to_string(),
            date: date(),
            activity_type: None,
            geometry: TrackGeometry::Single(line_string![(x: 4.35, y: 50.85), (x: 4.35, y: 50.85)]),
        };
        let projected = ProjectedTrack::new(&track, belgian_lambert_2008().unwrap(), 20.0).unwrap();
        assert!(projected.is_none());
    }

    #[test]
    fn test_projected_track_in_metres() {
        let track = Track {
            name: "p.gpx".to_string(),
            date: date(),
            activity_type: None,
            geometry: TrackGeometry::Single(line_string![(x: 4.36, y: 50.80), (x: 4.36, y: 50.801)]),
        };
        let projected = ProjectedTrack::new(&track, belgian_lambert_2008().unwrap(), 20.0)
            .unwrap()
            .unwrap();
        assert!((projected.geometry.length() - 111.2).abs() < 1.0);
    }
}
