//! Aggregation of per-track matches into per-edge and per-node statistics.
//!
//! Matches are grouped by id in ordered maps, so the result only depends on
//! the set of matches and the date range, never on input order.

use std::collections::{BTreeMap, BTreeSet};

use chrono::NaiveDate;
use geo::{Coord, LineString, Point};
use serde::{Deserialize, Serialize};

use crate::error::{NetMatchError, Result};
use crate::projection::Projection;
use crate::{MatchedEdge, MatchedNode};

/// Inclusive date range. A `None` bound is unbounded on that side.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateRange {
    pub start: Option<NaiveDate>,
    pub end: Option<NaiveDate>,
}

impl DateRange {
    pub fn new(start: Option<NaiveDate>, end: Option<NaiveDate>) -> Self {
        Self { start, end }
    }

    /// Every date.
    pub fn all() -> Self {
        Self::default()
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        self.start.map_or(true, |s| date >= s) && self.end.map_or(true, |e| date <= e)
    }

    /// True when no date can satisfy the range (`start > end`).
    pub fn is_empty(&self) -> bool {
        matches!((self.start, self.end), (Some(s), Some(e)) if s > e)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AggregatedEdge {
    pub edge_id: String,
    pub reference: Option<String>,
    pub node_from: String,
    pub node_to: String,
    /// Number of distinct tracks that traversed this edge
    pub visit_count: u32,
    pub first_date: NaiveDate,
    pub last_date: NaiveDate,
    pub max_overlap: f64,
    /// Edge length in metres
    pub length: f64,
    pub geometry: LineString<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AggregatedNode {
    pub node_id: String,
    pub reference: String,
    /// Number of distinct tracks that passed this node
    pub visit_count: u32,
    pub first_date: NaiveDate,
    pub last_date: NaiveDate,
    pub geometry: Point<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AggregationTotals {
    pub edge_count: usize,
    pub node_count: usize,
    /// Sum of distinct edge lengths in metres
    pub total_length: f64,
}

/// Summary of a set of matches, most visited first.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Aggregation {
    pub edges: Vec<AggregatedEdge>,
    pub nodes: Vec<AggregatedNode>,
    pub totals: AggregationTotals,
}

impl Aggregation {
    pub fn is_empty(&self) -> bool {
        self.edges.is_empty() && self.nodes.is_empty()
    }

    /// Copy with geometries converted to WGS84 (x = longitude, y = latitude).
    pub fn to_wgs84(&self, projection: &dyn Projection) -> Result<Aggregation> {
        let to_lon_lat = |c: Coord<f64>| {
            projection
                .inverse(c)
                .map(|(x, y)| Coord { x, y })
                .ok_or_else(|| NetMatchError::Projection {
                    epsg: projection.epsg(),
                    message: format!("({}, {}) has no geographic position", c.x, c.y),
                })
        };

        let edges = self
            .edges
            .iter()
            .map(|e| {
                let coords = e
                    .geometry
                    .coords()
                    .map(|&c| to_lon_lat(c))
                    .collect::<Result<Vec<_>>>()?;
                Ok(AggregatedEdge {
                    geometry: LineString::new(coords),
                    ..e.clone()
                })
            })
            .collect::<Result<Vec<_>>>()?;
        let nodes = self
            .nodes
            .iter()
            .map(|n| {
                Ok(AggregatedNode {
                    geometry: Point(to_lon_lat(n.geometry.0)?),
                    ..n.clone()
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Aggregation {
            edges,
            nodes,
            totals: self.totals.clone(),
        })
    }
}

struct EdgeGroup<'a> {
    first: &'a MatchedEdge,
    tracks: BTreeSet<&'a str>,
    reference: Option<&'a str>,
    first_date: NaiveDate,
    last_date: NaiveDate,
    max_overlap: f64,
}

struct NodeGroup<'a> {
    first: &'a MatchedNode,
    tracks: BTreeSet<&'a str>,
    first_date: NaiveDate,
    last_date: NaiveDate,
}

/// Aggregate matches whose date falls within `range`.
pub fn aggregate(edges: &[MatchedEdge], nodes: &[MatchedNode], range: &DateRange) -> Aggregation {
    if range.is_empty() {
        return Aggregation::default();
    }

    let mut edge_groups: BTreeMap<&str, EdgeGroup> = BTreeMap::new();
    for edge in edges.iter().filter(|e| range.contains(e.date)) {
        let group = edge_groups
            .entry(edge.edge_id.as_str())
            .or_insert_with(|| EdgeGroup {
                first: edge,
                tracks: BTreeSet::new(),
                reference: None,
                first_date: edge.date,
                last_date: edge.date,
                max_overlap: edge.overlap,
            });
        group.tracks.insert(edge.track.as_str());
        group.first_date = group.first_date.min(edge.date);
        group.last_date = group.last_date.max(edge.date);
        group.max_overlap = group.max_overlap.max(edge.overlap);
        if group.reference.is_none() {
            group.reference = edge.reference.as_deref();
        }
    }

    let mut node_groups: BTreeMap<&str, NodeGroup> = BTreeMap::new();
    for node in nodes.iter().filter(|n| range.contains(n.date)) {
        let group = node_groups
            .entry(node.node_id.as_str())
            .or_insert_with(|| NodeGroup {
                first: node,
                tracks: BTreeSet::new(),
                first_date: node.date,
                last_date: node.date,
            });
        group.tracks.insert(node.track.as_str());
        group.first_date = group.first_date.min(node.date);
        group.last_date = group.last_date.max(node.date);
    }

    let mut edges: Vec<AggregatedEdge> = edge_groups
        .into_iter()
        .map(|(id, g)| AggregatedEdge {
            edge_id: id.to_string(),
            reference: g.reference.map(str::to_string),
            node_from: g.first.node_from.clone(),
            node_to: g.first.node_to.clone(),
            visit_count: visit_count(&g.tracks),
            first_date: g.first_date,
            last_date: g.last_date,
            max_overlap: g.max_overlap,
            length: g.first.length,
            geometry: g.first.geometry.clone(),
        })
        .collect();

    let mut nodes: Vec<AggregatedNode> = node_groups
        .into_iter()
        .map(|(id, g)| AggregatedNode {
            node_id: id.to_string(),
            reference: g.first.reference.clone(),
            visit_count: visit_count(&g.tracks),
            first_date: g.first_date,
            last_date: g.last_date,
            geometry: g.first.geometry,
        })
        .collect();

    // Stable sort over id-ordered groups: ties stay in id order
    edges.sort_by(|a, b| b.visit_count.cmp(&a.visit_count));
    nodes.sort_by(|a, b| b.visit_count.cmp(&a.visit_count));

    let totals = AggregationTotals {
        edge_count: edges.len(),
        node_count: nodes.len(),
        total_length: edges.iter().map(|e| e.length).sum(),
    };

    Aggregation {
        edges,
        nodes,
        totals,
    }
}

fn visit_count(tracks: &BTreeSet<&str>) -> u32 {
    u32::try_from(tracks.len()).unwrap_or(u32::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use geo::line_string;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn edge(id: &str, track: &str, date: NaiveDate, overlap: f64, length: f64) -> MatchedEdge {
        MatchedEdge {
            edge_id: id.to_string(),
            reference: Some(format!("ref-{}", id)),
            node_from: "A".to_string(),
            node_to: "B".to_string(),
            length,
            geometry: line_string![(x: 0.0, y: 0.0), (x: length, y: 0.0)],
            overlap,
            track: track.to_string(),
            date,
        }
    }

    fn node(id: &str, track: &str, date: NaiveDate) -> MatchedNode {
        MatchedNode {
            node_id: id.to_string(),
            reference: "A".to_string(),
            geometry: Point::new(0.0, 0.0),
            track: track.to_string(),
            date,
        }
    }

    /// Two tracks sharing E1: one in January, one in June.
    fn scenario() -> (Vec<MatchedEdge>, Vec<MatchedNode>) {
        let edges = vec![
            edge("E1", "a.gpx", date(2024, 1, 1), 0.8, 100.0),
            edge("E2", "a.gpx", date(2024, 1, 1), 0.9, 250.0),
            edge("E1", "b.gpx", date(2024, 6, 1), 0.95, 100.0),
        ];
        let nodes = vec![
            node("nA", "a.gpx", date(2024, 1, 1)),
            node("nA", "b.gpx", date(2024, 6, 1)),
            node("nB", "a.gpx", date(2024, 1, 1)),
        ];
        (edges, nodes)
    }

    #[test]
    fn test_grouping_and_totals() {
        let (edges, nodes) = scenario();
        let agg = aggregate(&edges, &nodes, &DateRange::all());

        assert_eq!(agg.totals.edge_count, 2);
        assert_eq!(agg.totals.node_count, 2);
        assert!((agg.totals.total_length - 350.0).abs() < 1e-9);

        let e1 = &agg.edges[0];
        assert_eq!(e1.edge_id, "E1");
        assert_eq!(e1.visit_count, 2);
        assert_eq!(e1.first_date, date(2024, 1, 1));
        assert_eq!(e1.last_date, date(2024, 6, 1));
        assert!((e1.max_overlap - 0.95).abs() < 1e-12);
        assert_eq!(e1.reference.as_deref(), Some("ref-E1"));

        assert_eq!(agg.nodes[0].node_id, "nA");
        assert_eq!(agg.nodes[0].visit_count, 2);
    }

    #[test]
    fn test_date_range_filters_before_grouping() {
        let (edges, nodes) = scenario();
        let range = DateRange::new(Some(date(2024, 3, 1)), None);
        let agg = aggregate(&edges, &nodes, &range);

        assert_eq!(agg.edges.len(), 1);
        assert_eq!(agg.edges[0].edge_id, "E1");
        assert_eq!(agg.edges[0].visit_count, 1);
        assert_eq!(agg.edges[0].first_date, date(2024, 6, 1));
        assert!((agg.totals.total_length - 100.0).abs() < 1e-9);
        assert_eq!(agg.nodes.len(), 1);
    }

    #[test]
    fn test_range_bounds_are_inclusive() {
        let range = DateRange::new(Some(date(2024, 1, 1)), Some(date(2024, 6, 1)));
        assert!(range.contains(date(2024, 1, 1)));
        assert!(range.contains(date(2024, 6, 1)));
        assert!(!range.contains(date(2024, 6, 2)));
    }

    #[test]
    fn test_inverted_range_is_empty() {
        let (edges, nodes) = scenario();
        let range = DateRange::new(Some(date(2024, 6, 1)), Some(date(2024, 1, 1)));
        assert!(range.is_empty());
        let agg = aggregate(&edges, &nodes, &range);
        assert!(agg.is_empty());
        assert_eq!(agg.totals, AggregationTotals::default());
    }

    #[test]
    fn test_same_track_counted_once() {
        let edges = vec![
            edge("E1", "a.gpx", date(2024, 1, 1), 0.8, 100.0),
            edge("E1", "a.gpx", date(2024, 1, 1), 0.8, 100.0),
        ];
        let agg = aggregate(&edges, &[], &DateRange::all());
        assert_eq!(agg.edges[0].visit_count, 1);
    }

    #[test]
    fn test_order_independent_and_idempotent() {
        let (edges, nodes) = scenario();
        let forward = aggregate(&edges, &nodes, &DateRange::all());

        let mut rev_edges = edges.clone();
        rev_edges.reverse();
        let mut rev_nodes = nodes.clone();
        rev_nodes.reverse();
        let reversed = aggregate(&rev_edges, &rev_nodes, &DateRange::all());

        assert_eq!(forward, reversed);
        assert_eq!(forward, aggregate(&edges, &nodes, &DateRange::all()));
    }

    #[test]
    fn test_ties_sorted_by_id() {
        let edges = vec![
            edge("E9", "a.gpx", date(2024, 1, 1), 0.8, 10.0),
            edge("E3", "a.gpx", date(2024, 1, 1), 0.8, 10.0),
            edge("E5", "a.gpx", date(2024, 1, 1), 0.8, 10.0),
        ];
        let agg = aggregate(&edges, &[], &DateRange::all());
        let ids: Vec<&str> = agg.edges.iter().map(|e| e.edge_id.as_str()).collect();
        assert_eq!(ids, vec!["E3", "E5", "E9"]);
    }

    #[test]
    fn test_to_wgs84() {
        use crate::projection::belgian_lambert_2008;

        let origin = Point::new(649328.0, 665262.0);
        let agg = Aggregation {
            edges: vec![],
            nodes: vec![AggregatedNode {
                node_id: "n".to_string(),
                reference: "1".to_string(),
                visit_count: 1,
                first_date: date(2024, 1, 1),
                last_date: date(2024, 1, 1),
                geometry: origin,
            }],
            totals: AggregationTotals::default(),
        };

        let wgs = agg.to_wgs84(belgian_lambert_2008().unwrap()).unwrap();
        let p = wgs.nodes[0].geometry;
        assert!((p.x() - 4.3592158333).abs() < 1e-6);
        assert!((p.y() - 50.797815).abs() < 1e-6);

        let bad = Aggregation {
            nodes: vec![AggregatedNode {
                geometry: Point::new(f64::NAN, 0.0),
                ..agg.nodes[0].clone()
            }],
            ..agg
        };
        assert!(bad.to_wgs84(belgian_lambert_2008().unwrap()).is_err());
    }
}
