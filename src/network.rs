//! Reference route network.
//!
//! The network is built elsewhere (tag parsing, node enrichment,
//! simplification) and handed over ready-made, already in a metric CRS.
//! This module only stores it immutably with the indexes matching needs:
//! an R-tree over edge envelopes and a reference-code lookup over nodes.

use std::collections::HashMap;

use geo::{BoundingRect, Euclidean, Length, LineString, Point};
use log::{info, warn};
use rstar::{RTree, RTreeObject, AABB};
use serde::{Deserialize, Serialize};

use crate::error::{NetMatchError, Result};

/// A named segment of the reference network between two nodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkEdge {
    /// Stable edge identifier (encodes direction when the network does)
    pub id: String,
    /// Human-readable label, e.g. "12-34"
    #[serde(default)]
    pub reference: Option<String>,
    /// Reference code of the start node
    pub node_from: String,
    /// Reference code of the end node
    pub node_to: String,
    pub geometry: LineString<f64>,
    /// Length in metres
    pub length: f64,
}

impl NetworkEdge {
    /// Create an edge, deriving its length from the geometry.
    pub fn new(
        id: impl Into<String>,
        node_from: impl Into<String>,
        node_to: impl Into<String>,
        geometry: LineString<f64>,
    ) -> Self {
        let length = Euclidean.length(&geometry);
        Self {
            id: id.into(),
            reference: None,
            node_from: node_from.into(),
            node_to: node_to.into(),
            geometry,
            length,
        }
    }

    pub fn with_reference(mut self, reference: impl Into<String>) -> Self {
        self.reference = Some(reference.into());
        self
    }

    /// Whether the edge can receive an overlap score.
    pub fn is_matchable(&self) -> bool {
        self.length > 0.0 && self.geometry.0.len() >= 2
    }
}

/// An endpoint of the reference network.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkNode {
    pub id: String,
    /// Reference code; may repeat across the network
    pub reference: String,
    pub geometry: Point<f64>,
}

impl NetworkNode {
    pub fn new(id: impl Into<String>, reference: impl Into<String>, geometry: Point<f64>) -> Self {
        Self {
            id: id.into(),
            reference: reference.into(),
            geometry,
        }
    }
}

/// Edge envelope for R-tree indexing.
#[derive(Debug, Clone)]
pub struct EdgeEnvelope {
    pub index: usize,
    pub min: [f64; 2],
    pub max: [f64; 2],
}

impl RTreeObject for EdgeEnvelope {
    type Envelope = AABB<[f64; 2]>;

    fn envelope(&self) -> Self::Envelope {
        AABB::from_corners(self.min, self.max)
    }
}

/// Immutable network graph in a single metric CRS.
#[derive(Debug)]
pub struct RouteNetwork {
    epsg: u32,
    edges: Vec<NetworkEdge>,
    nodes: Vec<NetworkNode>,
    edge_index: RTree<EdgeEnvelope>,
    nodes_by_reference: HashMap<String, Vec<usize>>,
}

impl RouteNetwork {
    /// Build a network from edges and nodes in the CRS `epsg`.
    ///
    /// Fails for an empty edge set or non-finite coordinates. Edges with
    /// zero length are kept but will never match.
    pub fn new(epsg: u32, edges: Vec<NetworkEdge>, nodes: Vec<NetworkNode>) -> Result<Self> {
        if edges.is_empty() {
            return Err(NetMatchError::EmptyNetwork);
        }

        let mut envelopes = Vec::with_capacity(edges.len());
        let mut unmatchable = 0usize;
        for (index, edge) in edges.iter().enumerate() {
            if edge.geometry.coords().any(|c| !c.x.is_finite() || !c.y.is_finite()) {
                return Err(NetMatchError::InvalidNetwork {
                    message: format!("edge '{}' has non-finite coordinates", edge.id),
                });
            }
            if !edge.is_matchable() {
                unmatchable += 1;
            }
            if let Some(rect) = edge.geometry.bounding_rect() {
                envelopes.push(EdgeEnvelope {
                    index,
                    min: [rect.min().x, rect.min().y],
                    max: [rect.max().x, rect.max().y],
                });
            }
        }

        let mut nodes_by_reference: HashMap<String, Vec<usize>> = HashMap::new();
        for (index, node) in nodes.iter().enumerate() {
            if !node.geometry.x().is_finite() || !node.geometry.y().is_finite() {
                return Err(NetMatchError::InvalidNetwork {
                    message: format!("node '{}' has non-finite coordinates", node.id),
                });
            }
            nodes_by_reference
                .entry(node.reference.clone())
                .or_default()
                .push(index);
        }

        if unmatchable > 0 {
            warn!(
                "[RouteNetwork] {} of {} edges have zero length and will never match",
                unmatchable,
                edges.len()
            );
        }
        info!(
            "[RouteNetwork] Loaded {} edges and {} nodes (EPSG:{})",
            edges.len(),
            nodes.len(),
            epsg
        );

        Ok(Self {
            epsg,
            edge_index: RTree::bulk_load(envelopes),
            edges,
            nodes,
            nodes_by_reference,
        })
    }

    /// EPSG code of the network CRS.
    pub fn epsg(&self) -> u32 {
        self.epsg
    }

    pub fn edges(&self) -> &[NetworkEdge] {
        &self.edges
    }

    pub fn nodes(&self) -> &[NetworkNode] {
        &self.nodes
    }

    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Edges whose envelope intersects `envelope`.
    pub fn edges_in_envelope(
        &self,
        envelope: &AABB<[f64; 2]>,
    ) -> impl Iterator<Item = &NetworkEdge> + '_ {
        self.edge_index
            .locate_in_envelope_intersecting(envelope)
            .map(move |e| &self.edges[e.index])
    }

    /// All nodes carrying `reference`.
    pub fn nodes_with_reference<'a>(
        &'a self,
        reference: &str,
    ) -> impl Iterator<Item = &'a NetworkNode> + 'a {
        self.nodes_by_reference
            .get(reference)
            .into_iter()
            .flatten()
            .map(move |&i| &self.nodes[i])
    }
}
