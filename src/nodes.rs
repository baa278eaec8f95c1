//! Node resolution for a track's matched edges.
//!
//! Candidate nodes are the endpoint codes of the matched edges. Because a
//! reference code can repeat across the network, a candidate is kept only
//! when the node, buffered by the matching distance, touches the union of
//! the matched edge geometries.

use std::collections::{BTreeSet, HashSet};

use geo::{Distance, Euclidean, MultiLineString};
use log::debug;

use crate::matching::ProjectedTrack;
use crate::network::RouteNetwork;
use crate::{MatchedEdge, MatchedNode};

/// Resolve the nodes used by one track.
///
/// `edges` must all belong to `track`. Each node id appears at most once.
pub fn resolve_nodes(
    track: &ProjectedTrack,
    edges: &[MatchedEdge],
    network: &RouteNetwork,
) -> Vec<MatchedNode> {
    if edges.is_empty() {
        return Vec::new();
    }

    let candidate_codes: BTreeSet<&str> = edges
        .iter()
        .flat_map(|e| [e.node_from.as_str(), e.node_to.as_str()])
        .collect();

    let matched_lines = MultiLineString::new(edges.iter().map(|e| e.geometry.clone()).collect());

    let mut seen: HashSet<&str> = HashSet::new();
    let mut resolved = Vec::new();
    let mut rejected = 0usize;

    for code in &candidate_codes {
        for node in network.nodes_with_reference(code) {
            if !seen.insert(node.id.as_str()) {
                continue;
            }
            let distance = Euclidean.distance(&node.geometry, &matched_lines);
            if distance <= track.buffer_distance {
                resolved.push(MatchedNode {
                    node_id: node.id.clone(),
                    reference: node.reference.clone(),
                    geometry: node.geometry,
                    track: track.name.clone(),
                    date: track.date,
                });
            } else {
                rejected += 1;
            }
        }
    }

    if rejected > 0 {
        debug!(
            "[Nodes] {}: {} nodes share a reference code but lie off the matched edges",
            track.name, rejected
        );
    }

    resolved
}
